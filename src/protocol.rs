//! Router debug console wire format.
//!
//! The console has no binary transfer mode, the only way to get at the SPI
//! flash is `spi rd <addr> <len>`, which prints memory as rows of 32-bit words
//! in hex. Each word is printed as a number, so the four bytes of a group come
//! out reversed relative to their order in flash.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;

use crate::ConfigError;

/// Console UART baud rate
pub const CONSOLE_BAUD: usize = 115200;

/// Walks back up to the top level menu, then into the `os` context where `spi` is available
pub const MENU_NAVIGATION: &[u8] = b";up;up;os;";

/// Ends a console statement
pub const STATEMENT_SEPARATOR: u8 = b';';

/// Console output ends with a double blank line
pub const RESPONSE_TERMINATOR: &[u8] = b"\r\n\r\n\r\n";

/// Characters between the end of the echoed command and the first hex group
pub const ECHO_SKIP: usize = 2;

/// Hex characters per printed word
pub const GROUP_CHARS: usize = 8;

/// Bytes per printed word
pub const GROUP_BYTES: usize = 4;

/// Scratch space used to discard stale console output
pub const DRAIN_CAPACITY: usize = 2048;

/// Size of the Macronix MX25L1606E fitted to the MT7628KN repeater
pub const MX25L1606E_SIZE: u32 = 2 * 1024 * 1024;

/// Bytes requested per `spi rd` command
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChunkSize {
    B64 = 64,
    B128 = 128,
    B256 = 256,
    B512 = 512,
    B1024 = 1024,
}

impl ChunkSize {
    pub const ALL: [ChunkSize; 5] = [
        ChunkSize::B64,
        ChunkSize::B128,
        ChunkSize::B256,
        ChunkSize::B512,
        ChunkSize::B1024,
    ];

    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Length of the hex dump printed for this many bytes, line breaks included.
    ///
    /// Every group is followed by a space and every 16 byte row ends with a
    /// CRLF, giving `2n + n/4 + n/8` characters.
    pub fn payload_chars(self) -> usize {
        let n = self.bytes();
        n * 2 + n / 4 + n / 8
    }

    /// Capacity of the buffer used for each read attempt
    pub fn read_capacity(self) -> usize {
        self.bytes() * 2 + 63
    }
}

impl TryFrom<usize> for ChunkSize {
    type Error = ConfigError;

    fn try_from(v: usize) -> Result<Self, Self::Error> {
        ChunkSize::ALL
            .iter()
            .copied()
            .find(|c| c.bytes() == v)
            .ok_or_else(|| ConfigError::ChunkSize(v.to_string()))
    }
}

impl FromStr for ChunkSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigError::ChunkSize(s.to_string()))?;
        ChunkSize::try_from(v)
    }
}

impl fmt::Display for ChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// A single `spi rd` request.
///
/// The rendered text is both what gets typed and what the console echoes back,
/// so it doubles as the framing marker for the response.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ReadCommand {
    pub offset: u32,
    pub length: ChunkSize,
}

impl ReadCommand {
    pub fn new(offset: u32, length: ChunkSize) -> Self {
        Self { offset, length }
    }
}

impl fmt::Display for ReadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spi rd 0x{:08X} {}", self.offset, self.length.bytes())
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("command echo `{command}` not found in console output, the serial buffer is out of sync. Power cycle the device, wait for it to finish booting and try again")]
    EchoNotFound { command: String },

    #[error("payload window ends at {needed} but only {available} bytes were received")]
    Truncated { needed: usize, available: usize },

    #[error("payload is not valid text")]
    NotText,

    #[error("malformed hex group `{0}`")]
    MalformedGroup(String),

    #[error("invalid hex in payload: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("decoded {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },
}

/// Position of the first occurrence of `needle` in `haystack`
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Index at which the hex payload for `command` starts within `raw`
pub fn payload_start(raw: &[u8], command: &ReadCommand) -> Result<usize, ProtocolError> {
    let text = command.to_string();

    match find(raw, text.as_bytes()) {
        Some(i) => Ok(i + text.len() + ECHO_SKIP),
        None => Err(ProtocolError::EchoNotFound { command: text }),
    }
}

/// Decode a single console word into flash order
pub fn decode_group(group: &str) -> Result<[u8; GROUP_BYTES], ProtocolError> {
    if group.len() != GROUP_CHARS {
        return Err(ProtocolError::MalformedGroup(group.to_string()));
    }

    let mut word = [0u8; GROUP_BYTES];
    hex::decode_to_slice(group, &mut word)?;
    word.reverse();

    Ok(word)
}

/// Extract the bytes requested by `command` from a complete console response
pub fn decode(raw: &[u8], command: &ReadCommand) -> Result<Vec<u8>, ProtocolError> {
    let expected = command.length.bytes();

    let start = payload_start(raw, command)?;
    let end = start + command.length.payload_chars();

    let window = raw.get(start..end).ok_or(ProtocolError::Truncated {
        needed: end,
        available: raw.len(),
    })?;
    let window = core::str::from_utf8(window).map_err(|_| ProtocolError::NotText)?;

    let text: String = window.chars().filter(|c| *c != '\r' && *c != '\n').collect();

    let mut data = Vec::with_capacity(expected);
    for group in text.split_whitespace() {
        data.extend_from_slice(&decode_group(group)?);
    }

    if data.len() != expected {
        return Err(ProtocolError::Length {
            expected,
            actual: data.len(),
        });
    }

    Ok(data)
}

/// Render `data` the way the console prints it
#[cfg(test)]
pub(crate) fn render_dump(data: &[u8]) -> String {
    let mut s = String::new();

    for row in data.chunks(16) {
        for word in row.chunks(GROUP_BYTES) {
            let mut w = [0u8; GROUP_BYTES];
            w.copy_from_slice(word);
            s.push_str(&format!("{:08x} ", u32::from_le_bytes(w)));
        }
        s.push_str("\r\n");
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(prefix: &str, command: &ReadCommand, data: &[u8]) -> Vec<u8> {
        format!("{}{}\r\n{}\r\n\r\nos> ", prefix, command, render_dump(data)).into_bytes()
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_command_format() {
        let c = ReadCommand::new(0x1f00, ChunkSize::B512);
        assert_eq!(c.to_string(), "spi rd 0x00001F00 512");

        let c = ReadCommand::new(0, ChunkSize::B64);
        assert_eq!(c.to_string(), "spi rd 0x00000000 64");
    }

    #[test]
    fn test_chunk_size_parse() {
        assert_eq!("256".parse::<ChunkSize>(), Ok(ChunkSize::B256));
        assert_eq!(ChunkSize::try_from(1024), Ok(ChunkSize::B1024));
        assert!("100".parse::<ChunkSize>().is_err());
        assert!("big".parse::<ChunkSize>().is_err());
        assert!(ChunkSize::try_from(2048).is_err());
    }

    #[test]
    fn test_payload_chars_matches_rendering() {
        for c in ChunkSize::ALL.iter() {
            let rendered = render_dump(&pattern(c.bytes()));
            assert_eq!(rendered.len(), c.payload_chars(), "chunk {}", c);
        }
    }

    #[test]
    fn test_group_reversal() {
        assert_eq!(decode_group("04030201"), Ok([0x01, 0x02, 0x03, 0x04]));
        assert_eq!(decode_group("DEADBEEF"), Ok([0xef, 0xbe, 0xad, 0xde]));
    }

    #[test]
    fn test_malformed_group() {
        assert_eq!(
            decode_group("0403020"),
            Err(ProtocolError::MalformedGroup("0403020".to_string()))
        );
        assert!(matches!(decode_group("0403020g"), Err(ProtocolError::Hex(_))));
    }

    #[test]
    fn test_decode_every_chunk_size() {
        for c in ChunkSize::ALL.iter() {
            let command = ReadCommand::new(0x10000, *c);
            let data = pattern(c.bytes());
            let raw = response("", &command, &data);

            assert_eq!(decode(&raw, &command), Ok(data), "chunk {}", c);
        }
    }

    #[test]
    fn test_echo_offset_ignores_prefix() {
        let command = ReadCommand::new(0x400, ChunkSize::B64);
        let data = pattern(64);

        for prefix in &["", "os> ", "garbage\r\n\r\nspi rd 0x00000000 64 partial\r\nos> "] {
            let raw = response(prefix, &command, &data);
            let expected = prefix.len() + command.to_string().len() + ECHO_SKIP;

            assert_eq!(payload_start(&raw, &command), Ok(expected));
            assert_eq!(decode(&raw, &command), Ok(data.clone()));
        }
    }

    #[test]
    fn test_missing_echo() {
        let command = ReadCommand::new(0x400, ChunkSize::B64);
        let other = ReadCommand::new(0x440, ChunkSize::B64);
        let raw = response("", &other, &pattern(64));

        assert_eq!(
            decode(&raw, &command),
            Err(ProtocolError::EchoNotFound {
                command: "spi rd 0x00000400 64".to_string()
            })
        );
    }

    #[test]
    fn test_truncated_payload() {
        let command = ReadCommand::new(0, ChunkSize::B128);
        let raw = response("", &command, &pattern(64));
        let raw = &raw[..command.to_string().len() + 40];

        assert!(matches!(
            decode(raw, &command),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_short_payload() {
        let command = ReadCommand::new(0, ChunkSize::B64);
        let mut raw = format!("{}\r\n{}", command, render_dump(&pattern(60))).into_bytes();
        raw.extend_from_slice(&[b' '; 16]);
        raw.extend_from_slice(RESPONSE_TERMINATOR);

        assert_eq!(
            decode(&raw, &command),
            Err(ProtocolError::Length {
                expected: 64,
                actual: 60
            })
        );
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abc\r\n\r\n\r\n", RESPONSE_TERMINATOR), Some(3));
        assert_eq!(find(b"abc\r\n\r\n", RESPONSE_TERMINATOR), None);
        assert_eq!(find(b"", b"a"), None);
    }
}
