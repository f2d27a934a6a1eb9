//! Reference advertisement, the first message of every exchange.

use crate::capabilities::Capabilities;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::{parse_oid, GitError, ObjectId, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Pseudo-ref advertised in place of a real ref when there are none.
const NO_REFS: &str = "capabilities^{}";
/// Suffix of a peeled tag line.
const PEELED_SUFFIX: &str = "^{}";

/// References and capabilities a service offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisedReferences {
    /// Packets written before the advertisement proper.
    pub prefix: Vec<PktLine>,
    /// Object HEAD resolves to, if any.
    pub head: Option<ObjectId>,
    /// Capabilities carried on the first line.
    pub capabilities: Capabilities,
    /// Reference name to object id, excluding HEAD.
    pub references: BTreeMap<String, ObjectId>,
    /// Peeled targets of annotated tags, keyed by tag ref name.
    pub peeled: BTreeMap<String, ObjectId>,
    /// Shallow boundary commits.
    pub shallows: Vec<ObjectId>,
}

impl AdvertisedReferences {
    /// Creates an empty advertisement.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the smart HTTP prefix: a `# service=<name>` comment and a flush.
    pub fn with_service_prefix(mut self, service_name: &str) -> Self {
        self.prefix = vec![
            PktLine::from_string(&format!("# service={}\n", service_name)),
            PktLine::Flush,
        ];
        self
    }

    /// Returns the service named in the prefix comment, if present.
    pub fn prefix_service(&self) -> Option<&str> {
        self.prefix
            .first()
            .and_then(PktLine::as_str)
            .and_then(|line| line.strip_prefix("# service="))
    }

    /// Encodes the advertisement as pkt-lines.
    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        let mut pkt_writer = PktLineWriter::new(writer);

        for pkt in &self.prefix {
            pkt_writer.write(pkt)?;
        }

        let mut refs = self.references.iter().peekable();
        let first_line = if let Some(head) = self.head {
            format!("{} HEAD\0{}\n", head, self.capabilities)
        } else if let Some((name, id)) = refs.peek() {
            format!("{} {}\0{}\n", id, name, self.capabilities)
        } else {
            format!("{} {}\0{}\n", ObjectId::ZERO, NO_REFS, self.capabilities)
        };
        pkt_writer.write(&PktLine::from_string(&first_line))?;

        if self.head.is_none() {
            // The first ref already went out with the capabilities.
            if let Some((name, _)) = refs.next() {
                self.write_peeled(&mut pkt_writer, name)?;
            }
        }

        for (name, id) in refs {
            pkt_writer.write_line(&format!("{} {}", id, name))?;
            self.write_peeled(&mut pkt_writer, name)?;
        }

        for shallow in &self.shallows {
            pkt_writer.write_line(&format!("shallow {}", shallow))?;
        }

        pkt_writer.flush_pkt()?;
        pkt_writer.flush()?;
        Ok(())
    }

    fn write_peeled<W: Write>(&self, writer: &mut PktLineWriter<W>, name: &str) -> Result<()> {
        if let Some(peeled) = self.peeled.get(name) {
            writer.write_line(&format!("{} {}{}", peeled, name, PEELED_SUFFIX))?;
        }
        Ok(())
    }

    /// Decodes an advertisement, including an optional smart HTTP prefix.
    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut adv = Self::new();

        let mut next = pkt_reader.read()?;
        if let Some(pkt) = next.as_ref().filter(|p| {
            p.as_str()
                .map(|line| line.starts_with("# service="))
                .unwrap_or(false)
        }) {
            adv.prefix.push(pkt.clone());
            match pkt_reader.read()? {
                Some(PktLine::Flush) => adv.prefix.push(PktLine::Flush),
                _ => {
                    return Err(GitError::Protocol(
                        "service comment not followed by flush".to_string(),
                    ))
                }
            }
            next = pkt_reader.read()?;
        }

        let first = match next {
            Some(PktLine::Flush) => return Ok(adv),
            Some(pkt @ PktLine::Data(_)) => pkt,
            Some(other) => {
                return Err(GitError::Protocol(format!(
                    "unexpected packet in advertisement: {:?}",
                    other
                )))
            }
            None => {
                return Err(GitError::Protocol(
                    "advertisement ended before any reference".to_string(),
                ))
            }
        };

        let first_line = line_of(&first)?;
        let (ref_part, caps) = first_line.split_once('\0').ok_or_else(|| {
            GitError::Protocol("first advertised line carries no capabilities".to_string())
        })?;
        adv.capabilities = Capabilities::parse(caps);

        let (id, name) = split_ref_line(ref_part)?;
        match name {
            NO_REFS => {
                if !id.is_zero() {
                    return Err(GitError::Protocol(format!(
                        "{} advertised with non-zero id",
                        NO_REFS
                    )));
                }
            }
            "HEAD" => adv.head = Some(id),
            _ => adv.add_ref_line(id, name),
        }

        loop {
            match pkt_reader.read()? {
                Some(PktLine::Flush) => return Ok(adv),
                Some(pkt @ PktLine::Data(_)) => {
                    let line = line_of(&pkt)?;
                    if let Some(hex) = line.strip_prefix("shallow ") {
                        adv.shallows.push(parse_oid(hex)?);
                    } else {
                        let (id, name) = split_ref_line(line)?;
                        adv.add_ref_line(id, name);
                    }
                }
                Some(other) => {
                    return Err(GitError::Protocol(format!(
                        "unexpected packet in advertisement: {:?}",
                        other
                    )))
                }
                None => {
                    return Err(GitError::Protocol(
                        "advertisement not terminated by flush".to_string(),
                    ))
                }
            }
        }
    }

    fn add_ref_line(&mut self, id: ObjectId, name: &str) {
        match name.strip_suffix(PEELED_SUFFIX) {
            Some(tag) => {
                self.peeled.insert(tag.to_string(), id);
            }
            None => {
                self.references.insert(name.to_string(), id);
            }
        }
    }
}

fn line_of(pkt: &PktLine) -> Result<&str> {
    pkt.as_str()
        .ok_or_else(|| GitError::Protocol("advertised line is not utf-8".to_string()))
}

fn split_ref_line(line: &str) -> Result<(ObjectId, &str)> {
    let (hex, name) = line
        .split_once(' ')
        .ok_or_else(|| GitError::Protocol(format!("malformed ref line {:?}", line)))?;
    if name.is_empty() {
        return Err(GitError::Protocol(format!("empty ref name in {:?}", line)));
    }
    Ok((parse_oid(hex)?, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AGENT, SYMREF};
    use std::io::Cursor;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    fn sample() -> AdvertisedReferences {
        let mut adv = AdvertisedReferences::new().with_service_prefix("git-upload-pack");
        adv.head = Some(oid(1));
        adv.capabilities = Capabilities::new()
            .with_value(SYMREF, "HEAD:refs/heads/main")
            .with_value(AGENT, "sluice/test");
        adv.references.insert("refs/heads/main".into(), oid(1));
        adv.references.insert("refs/tags/v1".into(), oid(2));
        adv.peeled.insert("refs/tags/v1".into(), oid(1));
        adv
    }

    #[test]
    fn test_encode_starts_with_service_prefix() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();
        assert!(buf.starts_with(b"001e# service=git-upload-pack\n0000"));
    }

    #[test]
    fn test_encode_exact_bytes() {
        let mut adv = AdvertisedReferences::new().with_service_prefix("git-upload-pack");
        adv.head = Some(oid(0xaa));
        adv.capabilities = Capabilities::new().with("side-band-64k");
        adv.references.insert("refs/heads/main".into(), oid(0xaa));

        let mut buf = Vec::new();
        adv.encode(&mut buf).unwrap();

        let hex = oid(0xaa).to_hex();
        let mut expected = b"001e# service=git-upload-pack\n0000".to_vec();
        let first = format!("{} HEAD\0side-band-64k\n", hex);
        expected.extend_from_slice(format!("{:04x}{}", first.len() + 4, first).as_bytes());
        let second = format!("{} refs/heads/main\n", hex);
        expected.extend_from_slice(format!("{:04x}{}", second.len() + 4, second).as_bytes());
        expected.extend_from_slice(b"0000");
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_roundtrip_with_head_and_peeled() {
        let adv = sample();
        let mut buf = Vec::new();
        adv.encode(&mut buf).unwrap();

        let decoded = AdvertisedReferences::decode(Cursor::new(buf)).unwrap();
        assert_eq!(decoded, adv);
        assert_eq!(decoded.prefix_service(), Some("git-upload-pack"));
    }

    #[test]
    fn test_roundtrip_without_head() {
        let mut adv = AdvertisedReferences::new();
        adv.capabilities = Capabilities::new().with("report-status");
        adv.references.insert("refs/heads/a".into(), oid(3));
        adv.references.insert("refs/heads/b".into(), oid(4));
        adv.shallows.push(oid(5));

        let mut buf = Vec::new();
        adv.encode(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf).into_owned();
        assert!(text.contains(&format!("{} refs/heads/a\0report-status", oid(3))));

        let decoded = AdvertisedReferences::decode(Cursor::new(buf)).unwrap();
        assert_eq!(decoded, adv);
    }

    #[test]
    fn test_empty_repository_uses_capabilities_pseudo_ref() {
        let mut adv = AdvertisedReferences::new().with_service_prefix("git-receive-pack");
        adv.capabilities = Capabilities::new().with("report-status").with("delete-refs");

        let mut buf = Vec::new();
        adv.encode(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf).into_owned();
        assert!(text.contains(&format!(
            "{} capabilities^{{}}\0report-status delete-refs\n",
            "0".repeat(40)
        )));

        let decoded = AdvertisedReferences::decode(Cursor::new(buf)).unwrap();
        assert!(decoded.references.is_empty());
        assert!(decoded.head.is_none());
        assert!(decoded.capabilities.contains("delete-refs"));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut first = Vec::new();
        let mut second = Vec::new();
        sample().encode(&mut first).unwrap();
        sample().encode(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_decode_rejects_missing_flush() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 4);
        assert!(AdvertisedReferences::decode(Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_decode_rejects_prefix_without_flush() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_line("# service=git-upload-pack").unwrap();
        writer
            .write_line(&format!("{} HEAD\0agent=x", oid(1)))
            .unwrap();
        assert!(AdvertisedReferences::decode(Cursor::new(writer.into_inner())).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_object_id() {
        let mut writer = PktLineWriter::new(Vec::new());
        writer.write_line("nothex HEAD\0agent=x").unwrap();
        writer.flush_pkt().unwrap();
        assert!(AdvertisedReferences::decode(Cursor::new(writer.into_inner())).is_err());
    }
}
