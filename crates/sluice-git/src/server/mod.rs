//! Memory-backed session provider.
//!
//! Serves the repositories of a [`RepoStore`]: advertises their references,
//! negotiates and builds packs for fetches, and unpacks pushes into a
//! staging store before touching the repository.

mod receive;
mod upload;

use crate::advertisement::AdvertisedReferences;
use crate::capabilities::{
    self, Capabilities, AGENT, ATOMIC, DELETE_REFS, MULTI_ACK_DETAILED, NO_PROGRESS, OFS_DELTA,
    QUIET, REPORT_STATUS, SIDE_BAND, SIDE_BAND_64K, SYMREF,
};
use crate::service::{Endpoint, Role, Service};
use crate::session::{AdvertiserSession, Session, SessionProvider};
use crate::{GitError, Result};
use async_trait::async_trait;
use sluice_storage::{ObjectId, ObjectStore, ObjectType, RepoStore, Repository};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use receive::MemoryReceivePack;
use upload::MemoryUploadPack;

/// Longest chain of tags followed when peeling.
const MAX_PEEL_DEPTH: usize = 16;

/// Session provider over in-memory repositories.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    repos: Arc<RepoStore>,
}

impl MemoryProvider {
    /// Creates a provider serving the repositories in `repos`.
    pub fn new(repos: Arc<RepoStore>) -> Self {
        Self { repos }
    }

    /// Returns the repository registry.
    pub fn repos(&self) -> &Arc<RepoStore> {
        &self.repos
    }

    /// Registers an empty repository for `endpoint`.
    pub fn create(&self, endpoint: &Endpoint, default_branch: &str) -> Result<Arc<Repository>> {
        Ok(self.repos.create(endpoint.as_str(), default_branch)?)
    }
}

#[async_trait]
impl SessionProvider for MemoryProvider {
    async fn open(&self, endpoint: &Endpoint, service: Service, role: Role) -> Result<Session> {
        let repo = self.repos.get(endpoint.as_str())?;
        tracing::debug!(endpoint = %endpoint, service = %service, role = ?role, "Opening session");

        Ok(match (role, service) {
            (Role::Advertiser, _) => Session::Advertiser(Box::new(MemoryAdvertiser { repo, service })),
            (Role::Transactor, Service::UploadPack) => {
                Session::UploadPack(Box::new(MemoryUploadPack::new(repo)))
            }
            (Role::Transactor, Service::ReceivePack) => {
                Session::ReceivePack(Box::new(MemoryReceivePack::new(repo)))
            }
        })
    }
}

/// Capabilities offered for `service`, without the HEAD symref.
pub(crate) fn offered_capabilities(service: Service) -> Capabilities {
    match service {
        Service::UploadPack => Capabilities::new()
            .with(MULTI_ACK_DETAILED)
            .with(SIDE_BAND)
            .with(SIDE_BAND_64K)
            .with(NO_PROGRESS),
        Service::ReceivePack => Capabilities::new()
            .with(REPORT_STATUS)
            .with(DELETE_REFS)
            .with(SIDE_BAND_64K)
            .with(QUIET)
            .with(ATOMIC)
            .with(OFS_DELTA),
    }
}

/// Rejects requested capabilities that were never offered. `agent` is
/// always accepted.
pub(crate) fn check_capabilities(service: Service, requested: &Capabilities) -> Result<()> {
    let offered = offered_capabilities(service).with(AGENT);
    let unsupported = requested.unsupported_by(&offered);
    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(GitError::Unsupported(format!(
            "capabilities not offered by {}: {}",
            service,
            unsupported.join(" ")
        )))
    }
}

/// Follows annotated tags from `id` to the first non-tag object.
///
/// Returns `None` when `id` is not a tag or the chain cannot be followed.
fn peel(store: &ObjectStore, id: &ObjectId) -> Option<ObjectId> {
    let mut current = store.get(id).ok()?;
    if current.object_type != ObjectType::Tag {
        return None;
    }
    for _ in 0..MAX_PEEL_DEPTH {
        let target = current.tag_target().ok()?;
        match store.get(&target) {
            Ok(object) if object.object_type == ObjectType::Tag => current = object,
            _ => return Some(target),
        }
    }
    None
}

struct MemoryAdvertiser {
    repo: Arc<Repository>,
    service: Service,
}

#[async_trait]
impl AdvertiserSession for MemoryAdvertiser {
    async fn advertised_references(
        self: Box<Self>,
        cancel: &CancellationToken,
    ) -> Result<AdvertisedReferences> {
        if cancel.is_cancelled() {
            return Err(GitError::Canceled);
        }

        let mut adv = AdvertisedReferences::new();
        adv.references = self.repo.direct_refs();
        adv.peeled = adv
            .references
            .iter()
            .filter_map(|(name, id)| peel(&self.repo.objects, id).map(|p| (name.clone(), p)))
            .collect();

        let mut caps = offered_capabilities(self.service);
        if self.service == Service::UploadPack {
            adv.head = self.repo.head().ok();
            if adv.head.is_some() {
                if let Some(target) = self.repo.refs.symbolic_target("HEAD") {
                    caps = caps.with_value(SYMREF, format!("HEAD:{}", target));
                }
            }
        }
        adv.capabilities = caps.with_value(AGENT, capabilities::agent());

        tracing::debug!(
            repository = %self.repo.location,
            service = %self.service,
            refs = adv.references.len(),
            "Advertising references"
        );
        Ok(adv)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{provider, LOCATION};
    use super::*;

    async fn advertise(provider: &MemoryProvider, service: Service) -> AdvertisedReferences {
        let endpoint = Endpoint::new(LOCATION).unwrap();
        provider
            .open(&endpoint, service, Role::Advertiser)
            .await
            .unwrap()
            .into_advertiser()
            .unwrap()
            .advertised_references(&CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_pack_advertisement() {
        let (provider, _, history) = provider();
        let adv = advertise(&provider, Service::UploadPack).await;

        assert_eq!(adv.head, Some(history.second));
        assert_eq!(adv.references.len(), 2);
        assert_eq!(adv.references["refs/heads/main"], history.second);
        assert_eq!(adv.references["refs/tags/v1"], history.tag);
        assert_eq!(adv.peeled["refs/tags/v1"], history.first);
        assert_eq!(adv.capabilities.get(SYMREF), Some("HEAD:refs/heads/main"));
        assert!(adv.capabilities.contains(MULTI_ACK_DETAILED));
        assert!(adv.capabilities.get(AGENT).unwrap().starts_with("sluice/"));
        assert!(!adv.capabilities.contains(REPORT_STATUS));
    }

    #[tokio::test]
    async fn test_receive_pack_advertisement() {
        let (provider, _, _) = provider();
        let adv = advertise(&provider, Service::ReceivePack).await;

        assert!(adv.head.is_none());
        assert!(adv.capabilities.contains(REPORT_STATUS));
        assert!(adv.capabilities.contains(DELETE_REFS));
        assert!(adv.capabilities.contains(ATOMIC));
        assert!(!adv.capabilities.contains(SYMREF));
    }

    #[tokio::test]
    async fn test_empty_repository_advertisement() {
        let provider = MemoryProvider::default();
        let endpoint = Endpoint::new("/srv/empty.git").unwrap();
        provider.create(&endpoint, "main").unwrap();

        let adv = provider
            .open(&endpoint, Service::UploadPack, Role::Advertiser)
            .await
            .unwrap()
            .into_advertiser()
            .unwrap()
            .advertised_references(&CancellationToken::new())
            .await
            .unwrap();
        assert!(adv.head.is_none());
        assert!(adv.references.is_empty());
        assert!(!adv.capabilities.contains(SYMREF));
    }

    #[tokio::test]
    async fn test_open_unknown_repository() {
        let provider = MemoryProvider::default();
        let endpoint = Endpoint::new("/nowhere.git").unwrap();
        let result = provider
            .open(&endpoint, Service::UploadPack, Role::Advertiser)
            .await;
        assert!(matches!(result, Err(GitError::Storage(_))));
    }

    #[tokio::test]
    async fn test_open_matches_role_and_service() {
        let (provider, endpoint, _) = provider();
        assert!(provider
            .open(&endpoint, Service::UploadPack, Role::Transactor)
            .await
            .unwrap()
            .into_upload_pack()
            .is_ok());
        assert!(provider
            .open(&endpoint, Service::ReceivePack, Role::Transactor)
            .await
            .unwrap()
            .into_receive_pack()
            .is_ok());
    }

    #[tokio::test]
    async fn test_advertiser_observes_cancellation() {
        let (provider, endpoint, _) = provider();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = provider
            .open(&endpoint, Service::UploadPack, Role::Advertiser)
            .await
            .unwrap()
            .into_advertiser()
            .unwrap()
            .advertised_references(&cancel)
            .await;
        assert!(matches!(result, Err(GitError::Canceled)));
    }

    #[test]
    fn test_check_capabilities() {
        let requested = Capabilities::parse("multi_ack_detailed side-band-64k agent=git/2.43");
        assert!(check_capabilities(Service::UploadPack, &requested).is_ok());

        let requested = Capabilities::parse("report-status thin-pack");
        let err = check_capabilities(Service::ReceivePack, &requested).unwrap_err();
        assert!(err.to_string().contains("thin-pack"));
    }
}
