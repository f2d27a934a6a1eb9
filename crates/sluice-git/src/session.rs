//! The session capability the HTTP bridge drives.
//!
//! A [`SessionProvider`] opens one session per request, bound to an
//! endpoint, a service and a role. Sessions are consumed by their single
//! operation, so a session can never be reused for a second exchange.

use crate::advertisement::AdvertisedReferences;
use crate::receive::{ReceivePackResult, ReferenceUpdateRequest};
use crate::service::{Endpoint, Role, Service};
use crate::upload::{UploadPackRequest, UploadPackResult};
use crate::{GitError, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Produces reference advertisements.
#[async_trait]
pub trait AdvertiserSession: Send {
    /// Returns the references and capabilities offered for this service.
    async fn advertised_references(
        self: Box<Self>,
        cancel: &CancellationToken,
    ) -> Result<AdvertisedReferences>;
}

/// Negotiates and produces packs for fetches.
#[async_trait]
pub trait UploadPackSession: Send {
    /// Answers a want/have request, building a pack once negotiation ends.
    ///
    /// Implementations must observe `cancel` and give up promptly with
    /// [`GitError::Canceled`] instead of finishing the pack.
    async fn produce_pack(
        self: Box<Self>,
        request: UploadPackRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadPackResult>;
}

/// Applies pushed packs and reference updates.
#[async_trait]
pub trait ReceivePackSession: Send {
    /// Stores the pushed objects and applies the commands.
    ///
    /// A canceled operation must leave the repository untouched.
    async fn apply_pack(
        self: Box<Self>,
        request: ReferenceUpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceivePackResult>;
}

/// A session opened for one request.
pub enum Session {
    /// Opened with [`Role::Advertiser`].
    Advertiser(Box<dyn AdvertiserSession>),
    /// Opened with [`Role::Transactor`] for upload-pack.
    UploadPack(Box<dyn UploadPackSession>),
    /// Opened with [`Role::Transactor`] for receive-pack.
    ReceivePack(Box<dyn ReceivePackSession>),
}

impl Session {
    /// Unwraps an advertiser session.
    pub fn into_advertiser(self) -> Result<Box<dyn AdvertiserSession>> {
        match self {
            Self::Advertiser(session) => Ok(session),
            other => Err(other.mismatch("advertiser")),
        }
    }

    /// Unwraps an upload-pack transactor.
    pub fn into_upload_pack(self) -> Result<Box<dyn UploadPackSession>> {
        match self {
            Self::UploadPack(session) => Ok(session),
            other => Err(other.mismatch("upload-pack transactor")),
        }
    }

    /// Unwraps a receive-pack transactor.
    pub fn into_receive_pack(self) -> Result<Box<dyn ReceivePackSession>> {
        match self {
            Self::ReceivePack(session) => Ok(session),
            other => Err(other.mismatch("receive-pack transactor")),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Advertiser(_) => "advertiser",
            Self::UploadPack(_) => "upload-pack transactor",
            Self::ReceivePack(_) => "receive-pack transactor",
        }
    }

    fn mismatch(&self, expected: &str) -> GitError {
        GitError::Protocol(format!(
            "provider returned {} session, expected {}",
            self.kind(),
            expected
        ))
    }
}

/// Opens sessions against repositories.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Opens a fresh session for `service` in `role` on `endpoint`.
    async fn open(&self, endpoint: &Endpoint, service: Service, role: Role) -> Result<Session>;
}
