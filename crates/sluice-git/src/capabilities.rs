//! Protocol capability lists.
//!
//! Capabilities travel after the NUL byte of the first advertised ref or
//! ref-update command, and after the object id of the first `want` line.

use std::fmt;

pub const MULTI_ACK_DETAILED: &str = "multi_ack_detailed";
pub const SIDE_BAND: &str = "side-band";
pub const SIDE_BAND_64K: &str = "side-band-64k";
pub const NO_PROGRESS: &str = "no-progress";
pub const SYMREF: &str = "symref";
pub const AGENT: &str = "agent";
pub const OFS_DELTA: &str = "ofs-delta";
pub const REPORT_STATUS: &str = "report-status";
pub const DELETE_REFS: &str = "delete-refs";
pub const QUIET: &str = "quiet";
pub const ATOMIC: &str = "atomic";

/// Agent string this server announces.
pub fn agent() -> String {
    format!("sluice/{}", env!("CARGO_PKG_VERSION"))
}

/// An ordered list of `name[=value]` capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    entries: Vec<(String, Option<String>)>,
}

impl Capabilities {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a space separated capability list.
    pub fn parse(s: &str) -> Self {
        let entries = s
            .split_whitespace()
            .map(|item| match item.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (item.to_string(), None),
            })
            .collect();
        Self { entries }
    }

    /// Appends a capability without a value.
    pub fn with(mut self, name: &str) -> Self {
        self.entries.push((name.to_string(), None));
        self
    }

    /// Appends a capability with a value.
    pub fn with_value(mut self, name: &str, value: impl Into<String>) -> Self {
        self.entries.push((name.to_string(), Some(value.into())));
        self
    }

    /// Returns true if the named capability is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Returns the value of the first capability with this name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Iterates over capability names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Returns true if there are no capabilities.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the names in `self` that `offered` does not contain.
    pub fn unsupported_by<'a>(&'a self, offered: &Capabilities) -> Vec<&'a str> {
        self.names().filter(|name| !offered.contains(name)).collect()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
            if let Some(value) = value {
                write!(f, "={}", value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let caps = Capabilities::parse("multi_ack_detailed side-band-64k agent=git/2.43.0");
        assert!(caps.contains(MULTI_ACK_DETAILED));
        assert!(caps.contains(SIDE_BAND_64K));
        assert!(!caps.contains(SIDE_BAND));
        assert_eq!(caps.get(AGENT), Some("git/2.43.0"));
        assert_eq!(
            caps.to_string(),
            "multi_ack_detailed side-band-64k agent=git/2.43.0"
        );
    }

    #[test]
    fn test_symref_value_keeps_colon() {
        let caps = Capabilities::new().with_value(SYMREF, "HEAD:refs/heads/main");
        assert_eq!(caps.to_string(), "symref=HEAD:refs/heads/main");
        assert_eq!(
            Capabilities::parse(&caps.to_string()).get(SYMREF),
            Some("HEAD:refs/heads/main")
        );
    }

    #[test]
    fn test_unsupported_by() {
        let offered = Capabilities::new().with(SIDE_BAND_64K).with(OFS_DELTA);
        let requested = Capabilities::parse("side-band-64k thin-pack");
        assert_eq!(requested.unsupported_by(&offered), vec!["thin-pack"]);
    }

    #[test]
    fn test_empty() {
        let caps = Capabilities::parse("   ");
        assert!(caps.is_empty());
        assert_eq!(caps.to_string(), "");
    }
}
