//! Git smart HTTP protocol implementation for Sluice.
//!
//! This crate holds everything between the HTTP layer and the repository:
//! pkt-line framing, the four protocol messages exchanged by `upload-pack`
//! and `receive-pack`, the session capability the HTTP bridge drives, the
//! pack file format, and a memory-backed session provider.
//! See: https://git-scm.com/docs/http-protocol

mod advertisement;
pub mod capabilities;
mod error;
mod pack;
mod pktline;
mod receive;
pub mod server;
mod service;
mod session;
mod sideband;
mod upload;

pub use advertisement::AdvertisedReferences;
pub use capabilities::Capabilities;
pub use error::GitError;
pub use pack::{apply_delta, PackBuilder, PackParser};
pub use pktline::{PktLine, PktLineReader, PktLineWriter, MAX_DATA_LEN, MAX_PKT_LEN};
pub use receive::{
    Command, CommandStatus, ReceivePackResult, ReferenceUpdateRequest, ReportStatus,
};
pub use server::MemoryProvider;
pub use service::{Endpoint, Role, Service};
pub use session::{
    AdvertiserSession, ReceivePackSession, Session, SessionProvider, UploadPackSession,
};
pub use sideband::{demux, Channel, Demuxed, SideBand};
pub use sluice_storage::ObjectId;
pub use upload::{Ack, AckStatus, UploadPackRequest, UploadPackResult};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;

/// Parses a 40 character hex object id found in a protocol line.
fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex)
        .map_err(|_| GitError::Protocol(format!("malformed object id {:?}", hex)))
}
