//! Smart HTTP routes.
//!
//! ## Endpoints
//!
//! - `GET /info/refs?service=<name>` - reference advertisement
//! - `POST /git-upload-pack` - fetch negotiation and pack
//! - `POST /git-receive-pack` - push
//!
//! Every request is served from the single repository named in the
//! configuration.

use crate::bridge::{self, ReceivePackTransaction, Transaction, UploadPackTransaction};
use crate::config::Config;
use crate::observability::request_id_middleware;
use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::Deserialize;
use sluice_git::{Endpoint, GitError, MemoryProvider, Service, SessionProvider};
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const NO_CACHE_EXPIRES: &str = "Fri, 01 Jan 1980 00:00:00 GMT";
const NO_CACHE_CONTROL: &str = "no-cache, max-age=0, must-revalidate";

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Opens sessions against the served repository.
    pub provider: Arc<dyn SessionProvider>,
    /// Node configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Creates state around an existing provider.
    pub fn new(provider: Arc<dyn SessionProvider>, config: Config) -> Self {
        Self {
            provider,
            config: Arc::new(config),
        }
    }

    /// Creates state backed by an in-memory provider holding the configured
    /// repository, empty and with HEAD on the default branch.
    pub fn in_memory(config: Config) -> Result<Self, GitError> {
        let provider = MemoryProvider::default();
        let endpoint = Endpoint::new(&config.repository)?;
        provider.create(&endpoint, &config.default_branch)?;
        tracing::info!(
            repository = %endpoint,
            branch = %config.default_branch,
            "Repository created"
        );
        Ok(Self::new(Arc::new(provider), config))
    }

    fn endpoint(&self) -> Result<Endpoint, ApiError> {
        Ok(Endpoint::new(&self.config.repository)?)
    }
}

/// Errors surfaced to HTTP clients as plain text.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The `service` query parameter is missing or names no known service.
    #[error("service type not recognized")]
    UnknownService(String),

    /// The body declared an encoding that failed to inflate.
    #[error("invalid request body: {0}")]
    Body(String),

    /// Decoding, session or protocol failure.
    #[error("{0}")]
    Git(#[from] GitError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownService(requested) => {
                tracing::warn!(service = %requested, "Unknown service requested");
                StatusCode::BAD_REQUEST
            }
            ApiError::Body(_) | ApiError::Git(_) => {
                tracing::error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

/// Creates the smart HTTP router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_size;

    Router::new()
        .route("/info/refs", get(info_refs))
        .route(
            "/git-upload-pack",
            post(run_transaction::<UploadPackTransaction>),
        )
        .route(
            "/git-receive-pack",
            post(run_transaction::<ReceivePackTransaction>),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn info_refs(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> Result<Response, ApiError> {
    let requested = query.service.unwrap_or_default();
    let service =
        Service::parse(&requested).ok_or_else(|| ApiError::UnknownService(requested.clone()))?;
    let endpoint = state.endpoint()?;

    // Dropping the handler (client gone) cancels the session's work.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let body = bridge::advertise(
        state.provider.as_ref(),
        &endpoint,
        service,
        &requested,
        &cancel,
    )
    .await?;

    Ok(git_response(
        Service::advertisement_content_type(&requested),
        body,
    ))
}

async fn run_transaction<T: Transaction>(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = inflate(&headers, body, state.config.max_body_size).await?;
    let endpoint = state.endpoint()?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let response = bridge::transact::<T>(
        state.provider.as_ref(),
        &endpoint,
        &body,
        &cancel,
        state.config.request_timeout(),
    )
    .await?;

    Ok(git_response(
        T::SERVICE.result_content_type().to_string(),
        response,
    ))
}

/// Undoes `Content-Encoding: gzip`, refusing bodies that inflate past `limit`.
async fn inflate(headers: &HeaderMap, body: Bytes, limit: usize) -> Result<Bytes, ApiError> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let value = value.trim();
            value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip")
        })
        .unwrap_or(false);
    if !gzipped {
        return Ok(body);
    }

    let inflated = tokio::task::spawn_blocking(move || {
        let mut inflated = Vec::new();
        GzDecoder::new(body.as_ref())
            .take(limit as u64 + 1)
            .read_to_end(&mut inflated)
            .map(|_| inflated)
    })
    .await
    .map_err(|e| ApiError::Body(e.to_string()))?
    .map_err(|e| ApiError::Body(e.to_string()))?;
    if inflated.len() > limit {
        return Err(ApiError::Body(format!(
            "inflated body exceeds {} bytes",
            limit
        )));
    }
    Ok(Bytes::from(inflated))
}

fn git_response(content_type: String, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::EXPIRES, NO_CACHE_EXPIRES.to_string()),
            (header::PRAGMA, "no-cache".to_string()),
            (header::CACHE_CONTROL, NO_CACHE_CONTROL.to_string()),
        ],
        body,
    )
        .into_response()
}
