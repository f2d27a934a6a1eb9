//! Upload-pack messages: the client's want/have request and the server's
//! acknowledgements plus pack.

use crate::capabilities::Capabilities;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{demux, Channel, SideBand};
use crate::{parse_oid, GitError, ObjectId, Result};
use bytes::Bytes;
use std::io::{Read, Write};

/// A decoded upload-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPackRequest {
    /// Objects the client wants.
    pub wants: Vec<ObjectId>,
    /// Capabilities sent with the first want.
    pub capabilities: Capabilities,
    /// Commits the client already has as shallow boundaries.
    pub shallows: Vec<ObjectId>,
    /// Requested history depth.
    pub depth: Option<u32>,
    /// Objects the client has.
    pub haves: Vec<ObjectId>,
    /// True once the client sent `done`.
    pub done: bool,
}

impl UploadPackRequest {
    /// Decodes a request body.
    ///
    /// The want section must be terminated by a flush. The have section that
    /// follows may be empty; when it is not, it must end with a flush or
    /// `done`, and nothing may follow `done`.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut request = Self::default();

        loop {
            let pkt = match pkt_reader.read()? {
                Some(PktLine::Flush) => break,
                Some(pkt @ PktLine::Data(_)) => pkt,
                Some(other) => {
                    return Err(GitError::Protocol(format!(
                        "unexpected packet in want section: {:?}",
                        other
                    )))
                }
                None => {
                    return Err(GitError::Protocol(
                        "want section not terminated by flush".to_string(),
                    ))
                }
            };
            let line = request_line(&pkt)?;

            if let Some(rest) = line.strip_prefix("want ") {
                let (hex, caps) = rest.split_once(' ').unwrap_or((rest, ""));
                if request.wants.is_empty() {
                    request.capabilities = Capabilities::parse(caps);
                } else if !caps.trim().is_empty() {
                    return Err(GitError::Protocol(
                        "capabilities after the first want".to_string(),
                    ));
                }
                request.wants.push(parse_oid(hex)?);
            } else if let Some(hex) = line.strip_prefix("shallow ") {
                request.shallows.push(parse_oid(hex)?);
            } else if let Some(depth) = line.strip_prefix("deepen ") {
                let depth = depth
                    .parse()
                    .map_err(|_| GitError::Protocol(format!("malformed depth {:?}", depth)))?;
                request.depth = Some(depth);
            } else {
                return Err(GitError::Protocol(format!(
                    "unexpected line in want section: {:?}",
                    line
                )));
            }
        }

        if request.wants.is_empty() {
            return Err(GitError::Protocol("request carries no wants".to_string()));
        }

        let mut terminated = true;
        loop {
            match pkt_reader.read()? {
                None if terminated => break,
                None => {
                    return Err(GitError::Protocol(
                        "have section not terminated by flush or done".to_string(),
                    ))
                }
                Some(PktLine::Flush) => terminated = true,
                Some(pkt @ PktLine::Data(_)) => {
                    let line = request_line(&pkt)?;
                    if line == "done" {
                        request.done = true;
                        break;
                    }
                    let hex = line.strip_prefix("have ").ok_or_else(|| {
                        GitError::Protocol(format!("unexpected line in have section: {:?}", line))
                    })?;
                    request.haves.push(parse_oid(hex)?);
                    terminated = false;
                }
                Some(other) => {
                    return Err(GitError::Protocol(format!(
                        "unexpected packet in have section: {:?}",
                        other
                    )))
                }
            }
        }

        if request.done && pkt_reader.read()?.is_some() {
            return Err(GitError::Protocol("data after done".to_string()));
        }

        Ok(request)
    }

    /// Encodes the request the way a fetching client sends it.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);

        for (i, want) in self.wants.iter().enumerate() {
            if i == 0 && !self.capabilities.is_empty() {
                pkt_writer.write_line(&format!("want {} {}", want, self.capabilities))?;
            } else {
                pkt_writer.write_line(&format!("want {}", want))?;
            }
        }
        for shallow in &self.shallows {
            pkt_writer.write_line(&format!("shallow {}", shallow))?;
        }
        if let Some(depth) = self.depth {
            pkt_writer.write_line(&format!("deepen {}", depth))?;
        }
        pkt_writer.flush_pkt()?;

        for have in &self.haves {
            pkt_writer.write_line(&format!("have {}", have))?;
        }
        if self.done {
            pkt_writer.write_line("done")?;
        } else if !self.haves.is_empty() {
            pkt_writer.flush_pkt()?;
        }

        pkt_writer.flush()?;
        Ok(())
    }
}

fn request_line(pkt: &PktLine) -> Result<&str> {
    pkt.as_str()
        .ok_or_else(|| GitError::Protocol("request line is not utf-8".to_string()))
}

/// Qualifier of a multi-ack acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// `multi_ack`: keep sending haves.
    Continue,
    /// `multi_ack_detailed`: the object is common.
    Common,
    /// `multi_ack_detailed`: the server is ready to send a pack.
    Ready,
}

impl AckStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Common => "common",
            Self::Ready => "ready",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(Self::Continue),
            "common" => Some(Self::Common),
            "ready" => Some(Self::Ready),
            _ => None,
        }
    }
}

/// An `ACK` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Acknowledged object.
    pub id: ObjectId,
    /// Qualifier; a bare `ACK` ends negotiation.
    pub status: Option<AckStatus>,
}

impl Ack {
    /// A final acknowledgement.
    pub fn last(id: ObjectId) -> Self {
        Self { id, status: None }
    }

    /// An intermediate acknowledgement.
    pub fn with_status(id: ObjectId, status: AckStatus) -> Self {
        Self {
            id,
            status: Some(status),
        }
    }
}

/// The server's answer to an upload-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPackResult {
    /// Acknowledgements, in order.
    pub acks: Vec<Ack>,
    /// True when a `NAK` follows the acknowledgements.
    pub nak: bool,
    /// Pack stream, present once negotiation is complete.
    pub pack: Option<Bytes>,
    /// Progress messages sent on the progress channel ahead of the pack.
    pub progress: Vec<String>,
    /// Multiplexing used for the pack.
    pub side_band: SideBand,
}

impl UploadPackResult {
    /// Encodes acknowledgements followed by the pack.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);

        for ack in &self.acks {
            match ack.status {
                Some(status) => {
                    pkt_writer.write_line(&format!("ACK {} {}", ack.id, status.as_str()))?
                }
                None => pkt_writer.write_line(&format!("ACK {}", ack.id))?,
            }
        }
        if self.nak {
            pkt_writer.write_line("NAK")?;
        }

        if let Some(pack) = &self.pack {
            if self.side_band.is_enabled() {
                for message in &self.progress {
                    let mut line = message.clone();
                    if !line.ends_with('\n') {
                        line.push('\n');
                    }
                    self.side_band
                        .write(&mut pkt_writer, Channel::Progress, line.as_bytes())?;
                }
                self.side_band.write(&mut pkt_writer, Channel::Data, pack)?;
                pkt_writer.flush_pkt()?;
            } else {
                pkt_writer.write_raw(pack)?;
            }
        }

        pkt_writer.flush()?;
        Ok(())
    }

    /// Decodes a result as a fetching client would, given the side-band mode
    /// it asked for.
    pub fn decode<R: Read>(reader: R, side_band: SideBand) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut result = Self {
            side_band,
            ..Self::default()
        };

        loop {
            let pkt = match pkt_reader.read()? {
                None => return Ok(result),
                Some(pkt @ PktLine::Data(_)) => pkt,
                Some(other) => {
                    return Err(GitError::Protocol(format!(
                        "unexpected packet in acknowledgements: {:?}",
                        other
                    )))
                }
            };
            let line = pkt
                .as_str()
                .ok_or_else(|| GitError::Protocol("acknowledgement is not utf-8".to_string()))?;

            if line == "NAK" {
                result.nak = true;
                break;
            }
            let rest = line
                .strip_prefix("ACK ")
                .ok_or_else(|| GitError::Protocol(format!("unexpected line {:?}", line)))?;
            match rest.split_once(' ') {
                Some((hex, status)) => {
                    let status = AckStatus::parse(status).ok_or_else(|| {
                        GitError::Protocol(format!("unknown ack status {:?}", status))
                    })?;
                    result.acks.push(Ack::with_status(parse_oid(hex)?, status));
                }
                None => {
                    result.acks.push(Ack::last(parse_oid(rest)?));
                    break;
                }
            }
        }

        let pack = if side_band.is_enabled() {
            let demuxed = demux(&mut pkt_reader)?;
            result.progress = String::from_utf8_lossy(&demuxed.progress)
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            demuxed.data
        } else {
            let mut raw = Vec::new();
            pkt_reader.inner_mut().read_to_end(&mut raw)?;
            raw
        };
        if !pack.is_empty() {
            result.pack = Some(Bytes::from(pack));
        }

        Ok(result)
    }
}
