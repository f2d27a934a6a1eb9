//! Receive-pack messages: reference update commands with their pack, and the
//! status report that answers them.

use crate::capabilities::Capabilities;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{demux, Channel, SideBand};
use crate::{parse_oid, GitError, ObjectId, Result};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};

/// A reference update command from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Old object ID (zeros for create).
    pub old_id: ObjectId,
    /// New object ID (zeros for delete).
    pub new_id: ObjectId,
    /// Reference name.
    pub ref_name: String,
}

impl Command {
    /// Creates a command.
    pub fn new(old_id: ObjectId, new_id: ObjectId, ref_name: impl Into<String>) -> Self {
        Self {
            old_id,
            new_id,
            ref_name: ref_name.into(),
        }
    }

    /// Checks if this is a create command.
    pub fn is_create(&self) -> bool {
        self.old_id.is_zero()
    }

    /// Checks if this is a delete command.
    pub fn is_delete(&self) -> bool {
        self.new_id.is_zero()
    }

    fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(' ').collect();
        match fields.as_slice() {
            [old, new, name] if !name.is_empty() => {
                Ok(Self::new(parse_oid(old)?, parse_oid(new)?, *name))
            }
            _ => Err(GitError::Protocol(format!("malformed command {:?}", line))),
        }
    }
}

/// A decoded receive-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceUpdateRequest {
    /// Update commands, in the order sent.
    pub commands: Vec<Command>,
    /// Capabilities sent with the first command.
    pub capabilities: Capabilities,
    /// Shallow boundaries of the client.
    pub shallows: Vec<ObjectId>,
    /// Pack stream following the commands; empty when every command deletes.
    pub pack: Bytes,
}

impl ReferenceUpdateRequest {
    /// Decodes a request body: commands up to a flush, then the raw pack.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut request = Self::default();

        loop {
            let pkt = match pkt_reader.read()? {
                Some(PktLine::Flush) => break,
                Some(pkt @ PktLine::Data(_)) => pkt,
                Some(other) => {
                    return Err(GitError::Protocol(format!(
                        "unexpected packet in command list: {:?}",
                        other
                    )))
                }
                None => {
                    return Err(GitError::Protocol(
                        "command list not terminated by flush".to_string(),
                    ))
                }
            };
            let line = pkt
                .as_str()
                .ok_or_else(|| GitError::Protocol("command line is not utf-8".to_string()))?;

            if let Some(hex) = line.strip_prefix("shallow ") {
                if !request.commands.is_empty() {
                    return Err(GitError::Protocol(
                        "shallow line after commands".to_string(),
                    ));
                }
                request.shallows.push(parse_oid(hex)?);
                continue;
            }

            let command = match line.split_once('\0') {
                Some((command, caps)) if request.commands.is_empty() => {
                    request.capabilities = Capabilities::parse(caps);
                    command
                }
                Some(_) => {
                    return Err(GitError::Protocol(
                        "capabilities after the first command".to_string(),
                    ))
                }
                None => line,
            };
            request.commands.push(Command::parse(command)?);
        }

        if request.commands.is_empty() {
            return Err(GitError::Protocol(
                "request carries no commands".to_string(),
            ));
        }

        let mut pack = Vec::new();
        pkt_reader.inner_mut().read_to_end(&mut pack)?;
        request.pack = Bytes::from(pack);

        Ok(request)
    }

    /// Encodes the request the way a pushing client sends it.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);

        for shallow in &self.shallows {
            pkt_writer.write_line(&format!("shallow {}", shallow))?;
        }
        for (i, command) in self.commands.iter().enumerate() {
            let mut line = format!("{} {} {}", command.old_id, command.new_id, command.ref_name);
            if i == 0 {
                line.push('\0');
                line.push_str(&self.capabilities.to_string());
            }
            pkt_writer.write_line(&line)?;
        }
        pkt_writer.flush_pkt()?;
        pkt_writer.write_raw(&self.pack)?;

        pkt_writer.flush()?;
        Ok(())
    }
}

/// Outcome of one command in a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Reference the command targeted.
    pub ref_name: String,
    /// Rejection reason; `None` when the update was applied.
    pub error: Option<String>,
}

impl CommandStatus {
    /// An accepted command.
    pub fn ok(ref_name: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            error: None,
        }
    }

    /// A rejected command.
    pub fn rejected(ref_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            error: Some(reason.into()),
        }
    }
}

/// The `report-status` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportStatus {
    /// Unpack failure message; `None` means `unpack ok`.
    pub unpack_error: Option<String>,
    /// Per-command outcomes, in command order.
    pub commands: Vec<CommandStatus>,
}

impl ReportStatus {
    /// Returns true when the pack unpacked and every command was applied.
    pub fn is_ok(&self) -> bool {
        self.unpack_error.is_none() && self.commands.iter().all(|c| c.error.is_none())
    }

    /// Encodes the report as pkt-lines ending in a flush.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);
        match &self.unpack_error {
            None => pkt_writer.write_line("unpack ok")?,
            Some(error) => pkt_writer.write_line(&format!("unpack {}", error))?,
        }
        for status in &self.commands {
            match &status.error {
                None => pkt_writer.write_line(&format!("ok {}", status.ref_name))?,
                Some(reason) => {
                    pkt_writer.write_line(&format!("ng {} {}", status.ref_name, reason))?
                }
            }
        }
        pkt_writer.flush_pkt()?;
        pkt_writer.flush()?;
        Ok(())
    }

    /// Decodes a report.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut report = Self::default();

        let unpack = pkt_reader
            .read()?
            .and_then(|pkt| pkt.as_str().map(str::to_string))
            .ok_or_else(|| GitError::Protocol("report without unpack status".to_string()))?;
        let unpack = unpack
            .strip_prefix("unpack ")
            .ok_or_else(|| GitError::Protocol(format!("unexpected report line {:?}", unpack)))?;
        if unpack != "ok" {
            report.unpack_error = Some(unpack.to_string());
        }

        loop {
            let pkt = match pkt_reader.read()? {
                Some(PktLine::Flush) => return Ok(report),
                Some(pkt @ PktLine::Data(_)) => pkt,
                _ => {
                    return Err(GitError::Protocol(
                        "report not terminated by flush".to_string(),
                    ))
                }
            };
            let line = pkt
                .as_str()
                .ok_or_else(|| GitError::Protocol("report line is not utf-8".to_string()))?;
            if let Some(name) = line.strip_prefix("ok ") {
                report.commands.push(CommandStatus::ok(name));
            } else if let Some(rest) = line.strip_prefix("ng ") {
                let (name, reason) = rest.split_once(' ').unwrap_or((rest, ""));
                report.commands.push(CommandStatus::rejected(name, reason));
            } else {
                return Err(GitError::Protocol(format!(
                    "unexpected report line {:?}",
                    line
                )));
            }
        }
    }
}

/// The server's answer to a receive-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivePackResult {
    /// Status report; only sent when the client asked for `report-status`.
    pub report: Option<ReportStatus>,
    /// Multiplexing used for the report.
    pub side_band: SideBand,
}

impl ReceivePackResult {
    /// Encodes the report, wrapped on the data channel when side-band is on.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let Some(report) = &self.report else {
            return Ok(());
        };

        if !self.side_band.is_enabled() {
            return report.encode(writer);
        }

        let mut inner = Vec::new();
        report.encode(&mut inner)?;
        let mut pkt_writer = PktLineWriter::new(writer);
        self.side_band
            .write(&mut pkt_writer, Channel::Data, &inner)?;
        pkt_writer.flush_pkt()?;
        pkt_writer.flush()?;
        Ok(())
    }

    /// Decodes a result as a pushing client would.
    pub fn decode<R: Read>(mut reader: R, side_band: SideBand) -> Result<Self> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;

        let payload = if side_band.is_enabled() {
            demux(&mut PktLineReader::new(Cursor::new(body)))?.data
        } else {
            body
        };

        let report = if payload.is_empty() {
            None
        } else {
            Some(ReportStatus::decode(Cursor::new(payload))?)
        };
        Ok(Self { report, side_band })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ATOMIC, REPORT_STATUS};

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[test]
    fn test_command_kinds() {
        let create = Command::new(ObjectId::ZERO, oid(1), "refs/heads/main");
        assert!(create.is_create());
        assert!(!create.is_delete());

        let delete = Command::new(oid(1), ObjectId::ZERO, "refs/heads/main");
        assert!(delete.is_delete());
        assert!(!delete.is_create());
    }

    #[test]
    fn test_decode_push_request() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer
            .write_line(&format!(
                "{} {} refs/heads/main\0report-status side-band-64k agent=git/2.43",
                ObjectId::ZERO,
                oid(1)
            ))
            .unwrap();
        writer
            .write_line(&format!("{} {} refs/heads/old", oid(2), ObjectId::ZERO))
            .unwrap();
        writer.flush_pkt().unwrap();
        writer.write_raw(b"PACKDATA").unwrap();

        let request = ReferenceUpdateRequest::decode(Cursor::new(writer.into_inner())).unwrap();
        assert_eq!(request.commands.len(), 2);
        assert_eq!(request.commands[0].ref_name, "refs/heads/main");
        assert!(request.commands[0].is_create());
        assert!(request.commands[1].is_delete());
        assert!(request.capabilities.contains(REPORT_STATUS));
        assert_eq!(request.pack.as_ref(), b"PACKDATA");
    }

    #[test]
    fn test_request_roundtrip() {
        let request = ReferenceUpdateRequest {
            commands: vec![
                Command::new(ObjectId::ZERO, oid(1), "refs/heads/main"),
                Command::new(oid(3), oid(4), "refs/heads/dev"),
            ],
            capabilities: Capabilities::new().with(REPORT_STATUS).with(ATOMIC),
            shallows: vec![oid(9)],
            pack: Bytes::from_static(b"PACK"),
        };

        let mut buf = Vec::new();
        request.encode(&mut buf).unwrap();
        assert_eq!(
            ReferenceUpdateRequest::decode(Cursor::new(buf)).unwrap(),
            request
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_line("not a command").unwrap();
        writer.flush_pkt().unwrap();
        assert!(ReferenceUpdateRequest::decode(Cursor::new(writer.into_inner())).is_err());

        let mut writer = PktLineWriter::new(Vec::new());
        writer
            .write_line(&format!("{} {}", ObjectId::ZERO, oid(1)))
            .unwrap();
        writer.flush_pkt().unwrap();
        assert!(ReferenceUpdateRequest::decode(Cursor::new(writer.into_inner())).is_err());

        let mut writer = PktLineWriter::new(Vec::new());
        writer
            .write_line(&format!("{} {} refs/heads/main", ObjectId::ZERO, oid(1)))
            .unwrap();
        assert!(ReferenceUpdateRequest::decode(Cursor::new(writer.into_inner())).is_err());

        assert!(ReferenceUpdateRequest::decode(Cursor::new(b"0000".to_vec())).is_err());
        assert!(ReferenceUpdateRequest::decode(Cursor::new(b"00zz".to_vec())).is_err());
    }

    #[test]
    fn test_report_encoding() {
        let report = ReportStatus {
            unpack_error: None,
            commands: vec![
                CommandStatus::ok("refs/heads/main"),
                CommandStatus::rejected("refs/heads/dev", "non-fast-forward"),
            ],
        };
        let mut buf = Vec::new();
        report.encode(&mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "000eunpack ok\n0017ok refs/heads/main\n0027ng refs/heads/dev non-fast-forward\n0000"
        );
        assert!(!report.is_ok());
    }

    #[test]
    fn test_result_roundtrip_side_band() {
        let result = ReceivePackResult {
            report: Some(ReportStatus {
                unpack_error: Some("index-pack failed".to_string()),
                commands: vec![CommandStatus::rejected("refs/heads/main", "unpacker error")],
            }),
            side_band: SideBand::SideBand64k,
        };

        let mut buf = Vec::new();
        result.encode(&mut buf).unwrap();
        assert_eq!(buf[4], 1);
        let decoded = ReceivePackResult::decode(Cursor::new(buf), SideBand::SideBand64k).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_result_roundtrip_plain() {
        let result = ReceivePackResult {
            report: Some(ReportStatus {
                unpack_error: None,
                commands: vec![CommandStatus::ok("refs/heads/main")],
            }),
            side_band: SideBand::None,
        };

        let mut buf = Vec::new();
        result.encode(&mut buf).unwrap();
        assert!(buf.starts_with(b"000eunpack ok\n"));
        let decoded = ReceivePackResult::decode(Cursor::new(buf), SideBand::None).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_result_without_report_is_empty() {
        let result = ReceivePackResult::default();
        let mut buf = Vec::new();
        result.encode(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(
            ReceivePackResult::decode(Cursor::new(buf), SideBand::None).unwrap(),
            result
        );
    }
}
