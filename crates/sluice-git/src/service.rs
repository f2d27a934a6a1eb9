//! Services, session roles and repository endpoints.

use crate::{GitError, Result};
use std::fmt;

/// The two git services reachable over smart HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Fetch and clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl Service {
    /// Parses a service name as sent in `?service=`.
    ///
    /// Accepts the canonical `git-` prefixed spelling as well as the bare one.
    pub fn parse(name: &str) -> Option<Self> {
        match name.strip_prefix("git-").unwrap_or(name) {
            "upload-pack" => Some(Self::UploadPack),
            "receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// Canonical service name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Content type of the advertisement for a service name as the client spelled it.
    pub fn advertisement_content_type(requested_name: &str) -> String {
        format!("application/x-{}-advertisement", requested_name)
    }

    /// Content type of the POST endpoint's response body.
    pub fn result_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a session is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produces the reference advertisement.
    Advertiser,
    /// Consumes a request and produces a pack or a ref-update outcome.
    Transactor,
}

/// An opaque identifier resolving to exactly one repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    /// Builds an endpoint from a path or URL.
    ///
    /// Surrounding whitespace and trailing slashes are dropped so equivalent
    /// spellings resolve to the same endpoint.
    pub fn new(location: &str) -> Result<Self> {
        let trimmed = location.trim();
        if trimmed.is_empty() {
            return Err(GitError::InvalidEndpoint(
                "empty repository location".to_string(),
            ));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(GitError::InvalidEndpoint(format!(
                "control character in repository location {:?}",
                trimmed
            )));
        }

        let normalized = match trimmed.trim_end_matches('/') {
            "" => "/",
            rest => rest,
        };
        Ok(Self(normalized.to_string()))
    }

    /// Returns the normalized location.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
