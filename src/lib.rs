//! SPI flash dumper for serial debug consoles.
//!
//! Drives the `spi rd` command of the MT7628 based repeater firmware console,
//! frames the echoed text responses and decodes the hex dumps back into a
//! byte exact flash image.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod protocol;
use protocol::{
    ChunkSize, ProtocolError, ReadCommand, DRAIN_CAPACITY, MENU_NAVIGATION, MX25L1606E_SIZE,
    RESPONSE_TERMINATOR, STATEMENT_SEPARATOR,
};

/// Upper bound on the inter-cycle delay
pub const MAX_CYCLE_DELAY_MS: u32 = 100;

/// Byte-wise serial link to the console
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Ready,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial transport error: {0:?}")]
    Serial(SerialError),

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error("invalid configuration: {0}")]
    Config(ConfigError),

    #[error("output write failed: {0:?}")]
    Io(std::io::ErrorKind),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be one of [64, 128, 256, 512, 1024], got `{0}`")]
    ChunkSize(String),

    #[error("cycle delay of {0}ms exceeds the {max}ms maximum", max = MAX_CYCLE_DELAY_MS)]
    CycleDelay(u32),

    #[error("memory size {size} is not a non-zero multiple of the {chunk} byte chunk size")]
    MemorySize { size: u32, chunk: ChunkSize },

    #[error("invalid memory size `{0}`")]
    MemorySizeFormat(String),

    #[error("a serial port name is required")]
    MissingPort,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Bytes requested per console read [64, 128, 256, 512, 1024]
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "512"))]
    pub chunk_size: ChunkSize,

    /// Delay between chunk reads, at most 100ms
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub cycle_delay_ms: u32,

    /// Total flash size in bytes, decimal or 0x prefixed hex
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "2097152", parse(try_from_str = parse_size))
    )]
    pub memory_size: u32,

    /// Period to let the console settle after menu navigation before discarding its output
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub settle_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSize::B512,
            cycle_delay_ms: 0,
            memory_size: MX25L1606E_SIZE,
            settle_delay_ms: 100,
        }
    }
}

impl Options {
    /// Check options before anything touches the link
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_delay_ms > MAX_CYCLE_DELAY_MS {
            return Err(ConfigError::CycleDelay(self.cycle_delay_ms));
        }

        let chunk = self.chunk_size.bytes() as u32;
        if self.memory_size == 0 || self.memory_size % chunk != 0 {
            return Err(ConfigError::MemorySize {
                size: self.memory_size,
                chunk: self.chunk_size,
            });
        }

        Ok(())
    }

    /// Number of `spi rd` commands needed to cover the whole flash
    pub fn cycles(&self) -> u32 {
        self.memory_size / self.chunk_size.bytes() as u32
    }
}

/// Parse a size given in decimal or `0x` prefixed hex
pub fn parse_size(s: &str) -> Result<u32, ConfigError> {
    let s = s.trim();
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse::<u32>(),
    };
    r.map_err(|_| ConfigError::MemorySizeFormat(s.to_string()))
}

pub struct Dumper<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Dumper<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new dumper instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Init,
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Move the console into the `os` menu and discard anything it has buffered
    pub fn init(&mut self) -> Result<(), Error<E>> {
        debug!("Navigating to console os menu");

        self.write_all(MENU_NAVIGATION)?;

        self.delay.delay_ms(self.options.settle_delay_ms);

        let stale = self.drain()?;
        debug!("Discarded {} bytes of console output", stale);

        self.state = State::Ready;

        Ok(())
    }

    /// Issue a read command and collect the console output up to the response terminator
    pub fn read_frame(&mut self, offset: u32, length: ChunkSize) -> Result<Vec<u8>, Error<E>> {
        self.exchange(&ReadCommand::new(offset, length))
    }

    /// Read and decode `length` bytes of flash starting at `offset`
    pub fn read_chunk(&mut self, offset: u32, length: ChunkSize) -> Result<Vec<u8>, Error<E>> {
        let command = ReadCommand::new(offset, length);

        let raw = self.exchange(&command)?;

        protocol::decode(&raw, &command).map_err(|e| {
            if let ProtocolError::EchoNotFound { .. } = e {
                error!("Console output: {:?}", String::from_utf8_lossy(&raw));
            }
            Error::Protocol(e)
        })
    }

    /// Dump the whole flash to `out`, reporting the running byte count to `progress`.
    ///
    /// Any failure aborts the dump, the output is not resumable.
    pub fn dump<W, F>(&mut self, mut out: W, mut progress: F) -> Result<u64, Error<E>>
    where
        W: std::io::Write,
        F: FnMut(u64),
    {
        self.options.validate().map_err(Error::Config)?;

        if self.state == State::Init {
            self.init()?;
        }

        let chunk = self.options.chunk_size;
        let cycles = self.options.cycles();
        let mut written = 0u64;

        debug!("Dumping {} chunks of {} bytes", cycles, chunk);

        for index in 0..cycles {
            let offset = index * chunk.bytes() as u32;

            let data = self.read_chunk(offset, chunk)?;
            out.write_all(&data).map_err(|e| Error::Io(e.kind()))?;

            written += data.len() as u64;
            progress(written);

            if self.options.cycle_delay_ms != 0 {
                self.delay.delay_ms(self.options.cycle_delay_ms);
            }
        }

        out.flush().map_err(|e| Error::Io(e.kind()))?;

        Ok(written)
    }

    fn exchange(&mut self, command: &ReadCommand) -> Result<Vec<u8>, Error<E>> {
        trace!("Sending `{}`", command);

        self.write_all(command.to_string().as_bytes())?;
        self.write_all(&[STATEMENT_SEPARATOR])?;

        // Fresh buffers per frame, nothing carries over between commands
        let mut buff = vec![0u8; command.length.read_capacity()];
        let mut raw = Vec::with_capacity(command.length.payload_chars() * 2);
        let mut reads = 0;

        loop {
            let n = self.read_burst(&mut buff)?;
            reads += 1;

            // Terminator may straddle the previous read
            let from = raw.len().saturating_sub(RESPONSE_TERMINATOR.len() - 1);
            raw.extend_from_slice(&buff[..n]);

            if protocol::find(&raw[from..], RESPONSE_TERMINATOR).is_some() {
                break;
            }
        }

        trace!("Received {} bytes in {} reads", raw.len(), reads);

        Ok(raw)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Block for the first byte, then take whatever is immediately available
    fn read_burst(&mut self, buff: &mut [u8]) -> Result<usize, Error<E>> {
        buff[0] = block!(self.port.read())?;
        let n = self.read_available(&mut buff[1..])?;

        Ok(n + 1)
    }

    /// Read until the port would block or `buff` is full
    fn read_available(&mut self, buff: &mut [u8]) -> Result<usize, Error<E>> {
        let mut n = 0;

        while n < buff.len() {
            match self.port.read() {
                Ok(v) => {
                    buff[n] = v;
                    n += 1;
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }

        Ok(n)
    }

    fn drain(&mut self) -> Result<usize, Error<E>> {
        let mut buff = [0u8; DRAIN_CAPACITY];
        let mut total = 0;

        loop {
            let n = self.read_available(&mut buff)?;
            total += n;

            if n < buff.len() {
                return Ok(total);
            }
        }
    }
}
