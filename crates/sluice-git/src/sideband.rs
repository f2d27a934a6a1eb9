//! Side-band multiplexing of pack data, progress and errors over pkt-lines.

use crate::capabilities::{Capabilities, SIDE_BAND, SIDE_BAND_64K};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::{GitError, Result};
use std::io::{Read, Write};

/// Side-band channel numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Pack data or report-status payload.
    Data = 1,
    /// Human readable progress messages.
    Progress = 2,
    /// Fatal error message; the exchange ends after it.
    Error = 3,
}

/// Side-band mode negotiated through capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideBand {
    /// No multiplexing; payload is sent as-is.
    #[default]
    None,
    /// `side-band`: packets of at most 1000 bytes.
    SideBand,
    /// `side-band-64k`: packets of at most 65520 bytes.
    SideBand64k,
}

impl SideBand {
    /// Picks the widest mode the client asked for.
    pub fn from_capabilities(capabilities: &Capabilities) -> Self {
        if capabilities.contains(SIDE_BAND_64K) {
            Self::SideBand64k
        } else if capabilities.contains(SIDE_BAND) {
            Self::SideBand
        } else {
            Self::None
        }
    }

    /// Returns true when output must be multiplexed.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Largest payload per packet, excluding the channel byte.
    pub fn max_payload(&self) -> usize {
        match self {
            Self::None => usize::MAX,
            Self::SideBand => 1000 - 4 - 1,
            Self::SideBand64k => 65520 - 4 - 1,
        }
    }

    /// Writes `data` on `channel`, split into as many packets as needed.
    pub fn write<W: Write>(
        &self,
        writer: &mut PktLineWriter<W>,
        channel: Channel,
        data: &[u8],
    ) -> Result<()> {
        if !self.is_enabled() {
            return Err(GitError::Protocol(
                "side-band output requested without side-band".to_string(),
            ));
        }
        for chunk in data.chunks(self.max_payload()) {
            let mut packet = Vec::with_capacity(chunk.len() + 1);
            packet.push(channel as u8);
            packet.extend_from_slice(chunk);
            writer.write(&PktLine::Data(packet))?;
        }
        Ok(())
    }
}

/// Output of a demultiplexed side-band stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demuxed {
    /// Concatenated channel 1 payload.
    pub data: Vec<u8>,
    /// Concatenated channel 2 payload.
    pub progress: Vec<u8>,
}

/// Reads side-band packets until a flush packet or end of input.
///
/// A channel 3 packet is turned into an error carrying its message.
pub fn demux<R: Read>(reader: &mut PktLineReader<R>) -> Result<Demuxed> {
    let mut out = Demuxed::default();
    loop {
        match reader.read()? {
            None | Some(PktLine::Flush) => return Ok(out),
            Some(PktLine::Data(packet)) => {
                let (channel, payload) = packet
                    .split_first()
                    .ok_or_else(|| GitError::Protocol("empty side-band packet".to_string()))?;
                match *channel {
                    1 => out.data.extend_from_slice(payload),
                    2 => out.progress.extend_from_slice(payload),
                    3 => {
                        return Err(GitError::Protocol(format!(
                            "remote error: {}",
                            String::from_utf8_lossy(payload).trim_end()
                        )))
                    }
                    other => {
                        return Err(GitError::Protocol(format!(
                            "unknown side-band channel {}",
                            other
                        )))
                    }
                }
            }
            Some(other) => {
                return Err(GitError::Protocol(format!(
                    "unexpected packet in side-band stream: {:?}",
                    other
                )))
            }
        }
    }
}
