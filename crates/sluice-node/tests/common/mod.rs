//! Shared helpers for the smart HTTP integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use sluice_git::{
    AdvertisedReferences, AdvertiserSession, Capabilities, CommandStatus, Endpoint, GitError,
    ObjectId, ReceivePackResult, ReceivePackSession, ReferenceUpdateRequest, ReportStatus, Role,
    Service, Session, SessionProvider, SideBand, UploadPackRequest, UploadPackResult,
    UploadPackSession,
};
use sluice_node::{create_router, AppState, Config};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const LOCATION: &str = "/tmp/usertest/test.git";

/// Pack bytes the fake upload-pack session answers with.
pub const FAKE_PACK: &[u8] = b"PACK-not-really";

/// How the fake upload-pack session behaves.
#[derive(Debug, Clone, Copy)]
pub enum PackBehavior {
    /// Answers at once.
    Immediate,
    /// Works for the given time unless canceled first.
    Slow(Duration),
    /// Fails with a protocol error.
    Fail,
}

/// Observable effects of the fake sessions.
#[derive(Debug, Default)]
pub struct Effects {
    /// Sessions opened, in any role.
    pub opens: AtomicUsize,
    /// Set when a slow operation ran to completion.
    pub completed: AtomicBool,
    /// Set when a slow operation saw its cancellation token fire.
    pub canceled: AtomicBool,
}

/// A provider whose sessions answer from fixed data.
pub struct FakeProvider {
    pub references: BTreeMap<String, ObjectId>,
    pub head: Option<ObjectId>,
    pub behavior: PackBehavior,
    pub effects: Arc<Effects>,
}

impl FakeProvider {
    /// A provider advertising `refs/heads/main` at [`oid1`].
    pub fn new(behavior: PackBehavior) -> Self {
        let mut references = BTreeMap::new();
        references.insert("refs/heads/main".to_string(), oid1());
        Self {
            references,
            head: Some(oid1()),
            behavior,
            effects: Arc::new(Effects::default()),
        }
    }

    pub fn opens(&self) -> usize {
        self.effects.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn open(
        &self,
        endpoint: &Endpoint,
        service: Service,
        role: Role,
    ) -> Result<Session, GitError> {
        self.effects.opens.fetch_add(1, Ordering::SeqCst);
        assert_eq!(endpoint.as_str(), LOCATION);

        Ok(match (role, service) {
            (Role::Advertiser, _) => Session::Advertiser(Box::new(FakeAdvertiser {
                references: self.references.clone(),
                head: self.head,
            })),
            (Role::Transactor, Service::UploadPack) => Session::UploadPack(Box::new(FakeUploadPack {
                behavior: self.behavior,
                effects: self.effects.clone(),
            })),
            (Role::Transactor, Service::ReceivePack) => {
                Session::ReceivePack(Box::new(FakeReceivePack))
            }
        })
    }
}

struct FakeAdvertiser {
    references: BTreeMap<String, ObjectId>,
    head: Option<ObjectId>,
}

#[async_trait]
impl AdvertiserSession for FakeAdvertiser {
    async fn advertised_references(
        self: Box<Self>,
        _cancel: &CancellationToken,
    ) -> Result<AdvertisedReferences, GitError> {
        Ok(AdvertisedReferences {
            head: self.head,
            capabilities: Capabilities::new().with("side-band-64k").with("ofs-delta"),
            references: self.references,
            ..Default::default()
        })
    }
}

struct FakeUploadPack {
    behavior: PackBehavior,
    effects: Arc<Effects>,
}

#[async_trait]
impl UploadPackSession for FakeUploadPack {
    async fn produce_pack(
        self: Box<Self>,
        request: UploadPackRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadPackResult, GitError> {
        match self.behavior {
            PackBehavior::Immediate => {}
            PackBehavior::Slow(duration) => {
                // The work outlives this future, like a blocking pack build.
                let effects = self.effects.clone();
                let token = cancel.clone();
                let work = tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            effects.completed.store(true, Ordering::SeqCst);
                            true
                        }
                        _ = token.cancelled() => {
                            effects.canceled.store(true, Ordering::SeqCst);
                            false
                        }
                    }
                });
                let finished = work
                    .await
                    .map_err(|e| GitError::Io(std::io::Error::other(e)))?;
                if !finished {
                    return Err(GitError::Canceled);
                }
            }
            PackBehavior::Fail => {
                return Err(GitError::Protocol("negotiation exploded".to_string()))
            }
        }

        Ok(UploadPackResult {
            nak: true,
            pack: Some(bytes::Bytes::from_static(FAKE_PACK)),
            side_band: SideBand::from_capabilities(&request.capabilities),
            ..Default::default()
        })
    }
}

struct FakeReceivePack;

#[async_trait]
impl ReceivePackSession for FakeReceivePack {
    async fn apply_pack(
        self: Box<Self>,
        request: ReferenceUpdateRequest,
        _cancel: &CancellationToken,
    ) -> Result<ReceivePackResult, GitError> {
        Ok(ReceivePackResult {
            report: Some(ReportStatus {
                unpack_error: None,
                commands: request
                    .commands
                    .iter()
                    .map(|c| CommandStatus::ok(c.ref_name.clone()))
                    .collect(),
            }),
            side_band: SideBand::from_capabilities(&request.capabilities),
        })
    }
}

/// Waits up to a second for `flag` to be set.
pub async fn eventually(flag: &AtomicBool) -> bool {
    for _ in 0..100 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn oid1() -> ObjectId {
    ObjectId::from_bytes([0x11; 20])
}

pub fn test_config() -> Config {
    Config {
        repository: LOCATION.to_string(),
        ..Config::default()
    }
}

/// Router over a fake provider; the provider is returned for inspection.
pub fn fake_app(behavior: PackBehavior, config: Config) -> (axum::Router, Arc<FakeProvider>) {
    let provider = Arc::new(FakeProvider::new(behavior));
    let state = AppState::new(provider.clone(), config);
    (create_router(state), provider)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn post(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body))
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub fn header<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

pub fn assert_status(response: &Response, status: StatusCode) {
    assert_eq!(response.status(), status, "unexpected status");
}

/// An upload-pack request wanting [`oid1`].
pub fn want_request(capabilities: &str) -> Vec<u8> {
    let request = UploadPackRequest {
        wants: vec![oid1()],
        capabilities: Capabilities::parse(capabilities),
        done: true,
        ..Default::default()
    };
    let mut body = Vec::new();
    request.encode(&mut body).unwrap();
    body
}
