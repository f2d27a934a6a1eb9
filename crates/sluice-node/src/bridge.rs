//! Drives provider sessions on behalf of the HTTP handlers.
//!
//! Every exchange follows the same shape: decode the body, open a fresh
//! session, run its single operation under the request's cancellation token,
//! and encode the outcome. [`Transaction`] captures the per-service parts so
//! both POST endpoints share one [`transact`] path.

use async_trait::async_trait;
use sluice_git::{
    Endpoint, GitError, ReceivePackResult, ReferenceUpdateRequest, Role, Service, Session,
    SessionProvider, UploadPackRequest, UploadPackResult,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Produces the advertisement for `service`, prefixed with the
/// `# service=` line naming the service as the client spelled it.
pub async fn advertise(
    provider: &dyn SessionProvider,
    endpoint: &Endpoint,
    service: Service,
    requested_name: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, GitError> {
    let session = provider
        .open(endpoint, service, Role::Advertiser)
        .await?
        .into_advertiser()?;

    let references = tokio::select! {
        result = session.advertised_references(cancel) => result?,
        _ = cancel.cancelled() => return Err(GitError::Canceled),
    };

    let mut body = Vec::new();
    references
        .with_service_prefix(requested_name)
        .encode(&mut body)?;

    tracing::debug!(
        endpoint = %endpoint,
        service = %service,
        bytes = body.len(),
        "Advertisement produced"
    );
    Ok(body)
}

/// One POST exchange: request and response codecs plus the session call.
#[async_trait]
pub trait Transaction: Send + Sync + 'static {
    /// Service the exchange belongs to.
    const SERVICE: Service;

    /// Decoded request body.
    type Request: Send + 'static;
    /// Session outcome.
    type Response: Send + 'static;

    /// Decodes the request body.
    fn decode(body: &[u8]) -> Result<Self::Request, GitError>;

    /// Runs the session's operation.
    async fn operate(
        session: Session,
        request: Self::Request,
        cancel: &CancellationToken,
    ) -> Result<Self::Response, GitError>;

    /// Encodes the response body.
    fn encode(response: &Self::Response) -> Result<Vec<u8>, GitError>;
}

/// Fetch negotiation and pack transfer.
pub struct UploadPackTransaction;

#[async_trait]
impl Transaction for UploadPackTransaction {
    const SERVICE: Service = Service::UploadPack;

    type Request = UploadPackRequest;
    type Response = UploadPackResult;

    fn decode(body: &[u8]) -> Result<Self::Request, GitError> {
        UploadPackRequest::decode(body)
    }

    async fn operate(
        session: Session,
        request: Self::Request,
        cancel: &CancellationToken,
    ) -> Result<Self::Response, GitError> {
        session
            .into_upload_pack()?
            .produce_pack(request, cancel)
            .await
    }

    fn encode(response: &Self::Response) -> Result<Vec<u8>, GitError> {
        let mut body = Vec::new();
        response.encode(&mut body)?;
        Ok(body)
    }
}

/// Push: pack upload and reference updates.
pub struct ReceivePackTransaction;

#[async_trait]
impl Transaction for ReceivePackTransaction {
    const SERVICE: Service = Service::ReceivePack;

    type Request = ReferenceUpdateRequest;
    type Response = ReceivePackResult;

    fn decode(body: &[u8]) -> Result<Self::Request, GitError> {
        ReferenceUpdateRequest::decode(body)
    }

    async fn operate(
        session: Session,
        request: Self::Request,
        cancel: &CancellationToken,
    ) -> Result<Self::Response, GitError> {
        session
            .into_receive_pack()?
            .apply_pack(request, cancel)
            .await
    }

    fn encode(response: &Self::Response) -> Result<Vec<u8>, GitError> {
        let mut body = Vec::new();
        response.encode(&mut body)?;
        Ok(body)
    }
}

/// Decodes `body`, runs the exchange on a fresh session and encodes the
/// result.
///
/// Nothing is opened when the body does not decode. The operation stops as
/// soon as `cancel` fires; when `deadline` elapses first the token is
/// canceled so the session abandons its work.
pub async fn transact<T: Transaction>(
    provider: &dyn SessionProvider,
    endpoint: &Endpoint,
    body: &[u8],
    cancel: &CancellationToken,
    deadline: Option<Duration>,
) -> Result<Vec<u8>, GitError> {
    let request = T::decode(body)?;
    let session = provider.open(endpoint, T::SERVICE, Role::Transactor).await?;

    let expired = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let response = tokio::select! {
        result = T::operate(session, request, cancel) => result?,
        _ = cancel.cancelled() => return Err(GitError::Canceled),
        _ = expired => {
            tracing::warn!(
                service = %T::SERVICE,
                timeout_secs = deadline.map(|d| d.as_secs()).unwrap_or_default(),
                "Operation deadline exceeded"
            );
            cancel.cancel();
            return Err(GitError::Canceled);
        }
    };

    T::encode(&response)
}
