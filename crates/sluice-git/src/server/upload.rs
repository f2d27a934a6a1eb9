//! Upload-pack negotiation and pack building over a memory repository.

use super::check_capabilities;
use crate::capabilities::{MULTI_ACK_DETAILED, NO_PROGRESS};
use crate::pack::PackBuilder;
use crate::service::Service;
use crate::session::UploadPackSession;
use crate::sideband::SideBand;
use crate::upload::{Ack, AckStatus, UploadPackRequest, UploadPackResult};
use crate::{GitError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sluice_storage::{GitObject, ObjectId, ObjectStore, ObjectType, Repository};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) struct MemoryUploadPack {
    repo: Arc<Repository>,
}

impl MemoryUploadPack {
    pub(crate) fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl UploadPackSession for MemoryUploadPack {
    async fn produce_pack(
        self: Box<Self>,
        request: UploadPackRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadPackResult> {
        check_capabilities(Service::UploadPack, &request.capabilities)?;
        if !request.shallows.is_empty() || request.depth.is_some() {
            return Err(GitError::Unsupported("shallow not supported".to_string()));
        }
        if let Some(missing) = request
            .wants
            .iter()
            .find(|want| !self.repo.objects.contains(want))
        {
            return Err(GitError::ObjectNotFound(format!("want {}", missing)));
        }

        let multi_ack = request.capabilities.contains(MULTI_ACK_DETAILED);
        let common: Vec<ObjectId> = request
            .haves
            .iter()
            .copied()
            .filter(|have| self.repo.objects.contains(have))
            .collect();

        let mut result = UploadPackResult {
            side_band: SideBand::from_capabilities(&request.capabilities),
            ..UploadPackResult::default()
        };
        if multi_ack {
            result.acks = common
                .iter()
                .map(|id| Ack::with_status(*id, AckStatus::Common))
                .collect();
        } else if let Some(first) = common.first() {
            result.acks.push(Ack::last(*first));
        }

        if !request.done {
            result.nak = common.is_empty() || multi_ack;
            return Ok(result);
        }
        match common.last() {
            Some(last) if multi_ack => result.acks.push(Ack::last(*last)),
            Some(_) => {}
            None => result.nak = true,
        }

        let repo = self.repo.clone();
        let wants = request.wants.clone();
        let token = cancel.clone();
        let worker = tokio::task::spawn_blocking(move || {
            build_pack(&repo.objects, &wants, &common, || token.is_cancelled())
        });
        let (pack, count) = tokio::select! {
            _ = cancel.cancelled() => return Err(GitError::Canceled),
            joined = worker => joined.map_err(|e| GitError::Io(std::io::Error::other(e)))??,
        };

        if !request.capabilities.contains(NO_PROGRESS) {
            result
                .progress
                .push(format!("Total {} (delta 0), reused 0 (delta 0)", count));
        }
        tracing::info!(
            repository = %self.repo.location,
            objects = count,
            bytes = pack.len(),
            "Built pack"
        );
        result.pack = Some(Bytes::from(pack));
        Ok(result)
    }
}

/// Builds a pack of everything reachable from `wants` that is not reachable
/// from `common`. Returns the pack and its object count.
fn build_pack(
    store: &ObjectStore,
    wants: &[ObjectId],
    common: &[ObjectId],
    interrupted: impl Fn() -> bool,
) -> Result<(Vec<u8>, usize)> {
    let mut seen = HashSet::new();
    walk(store, common, &mut seen, false, &interrupted, |_| {})?;

    let mut builder = PackBuilder::new();
    walk(store, wants, &mut seen, true, &interrupted, |object| {
        builder.add(object)
    })?;

    let count = builder.len();
    Ok((builder.build()?, count))
}

/// Depth-first walk over commits, trees and tags, calling `visit` for each
/// object not yet in `seen`. Gitlinks are not followed. Missing objects are
/// an error only when `required` is set.
fn walk(
    store: &ObjectStore,
    roots: &[ObjectId],
    seen: &mut HashSet<ObjectId>,
    required: bool,
    interrupted: &impl Fn() -> bool,
    mut visit: impl FnMut(GitObject),
) -> Result<()> {
    let mut stack: Vec<ObjectId> = roots.iter().rev().copied().collect();

    while let Some(id) = stack.pop() {
        if interrupted() {
            return Err(GitError::Canceled);
        }
        if !seen.insert(id) {
            continue;
        }

        let object = match store.get(&id) {
            Ok(object) => object,
            Err(_) if !required => continue,
            Err(_) => return Err(GitError::ObjectNotFound(id.to_hex())),
        };

        match object.object_type {
            ObjectType::Commit => {
                let (tree, parents) = object.commit_links()?;
                stack.extend(parents.into_iter().rev());
                stack.push(tree);
            }
            ObjectType::Tree => {
                let entries = object.tree_entries()?;
                stack.extend(
                    entries
                        .iter()
                        .rev()
                        .filter(|entry| !entry.is_gitlink())
                        .map(|entry| entry.id),
                );
            }
            ObjectType::Tag => stack.push(object.tag_target()?),
            ObjectType::Blob => {}
        }

        visit(object);
    }
    Ok(())
}
