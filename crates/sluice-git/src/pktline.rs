//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length that counts the
//! prefix itself, or one of the reserved special packets ("0000" for flush).

use crate::{GitError, Result};
use std::io::{ErrorKind, Read, Write};

/// Largest total packet length, prefix included.
pub const MAX_PKT_LEN: usize = 65520;
/// Largest payload a single data packet can carry.
pub const MAX_DATA_LEN: usize = MAX_PKT_LEN - 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let len = data.len() + 4;
                let mut result = format!("{:04x}", len).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delimiter => b"0001".to_vec(),
            Self::ResponseEnd => b"0002".to_vec(),
        }
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet.
    ///
    /// Returns `Ok(None)` on a clean end of input between packets. A length
    /// prefix cut short, a non-hex prefix, the reserved length 3, an
    /// oversized length or a truncated payload are all framing errors.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(GitError::InvalidPktLine(
                        "truncated length prefix".to_string(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if !len_buf.iter().all(u8::is_ascii_hexdigit) {
            return Err(GitError::InvalidPktLine(format!(
                "invalid length prefix {:?}",
                String::from_utf8_lossy(&len_buf)
            )));
        }

        match &len_buf {
            b"0000" => Ok(Some(PktLine::Flush)),
            b"0001" => Ok(Some(PktLine::Delimiter)),
            b"0002" => Ok(Some(PktLine::ResponseEnd)),
            _ => {
                let len_str = std::str::from_utf8(&len_buf)
                    .map_err(|_| GitError::InvalidPktLine("invalid length prefix".to_string()))?;
                let len = usize::from_str_radix(len_str, 16)
                    .map_err(|_| GitError::InvalidPktLine("invalid length".to_string()))?;

                if len < 4 {
                    return Err(GitError::InvalidPktLine("length too small".to_string()));
                }
                if len > MAX_PKT_LEN {
                    return Err(GitError::InvalidPktLine(format!(
                        "length {} exceeds maximum {}",
                        len, MAX_PKT_LEN
                    )));
                }

                let mut data = vec![0u8; len - 4];
                self.reader.read_exact(&mut data).map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        GitError::InvalidPktLine("truncated packet".to_string())
                    } else {
                        GitError::Io(e)
                    }
                })?;

                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads all packets until a flush packet or end of input.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if let PktLine::Data(data) = pkt {
            if data.len() > MAX_DATA_LEN {
                return Err(GitError::InvalidPktLine(format!(
                    "payload of {} bytes exceeds maximum {}",
                    data.len(),
                    MAX_DATA_LEN
                )));
            }
        }
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Writes bytes without pkt-line framing (pack data after negotiation).
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
