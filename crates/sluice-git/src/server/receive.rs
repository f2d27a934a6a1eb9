//! Receive-pack: quarantined unpacking and reference updates.

use super::check_capabilities;
use crate::capabilities::{ATOMIC, REPORT_STATUS};
use crate::pack::PackParser;
use crate::receive::{
    Command, CommandStatus, ReceivePackResult, ReferenceUpdateRequest, ReportStatus,
};
use crate::service::Service;
use crate::session::ReceivePackSession;
use crate::sideband::SideBand;
use crate::{GitError, Result};
use async_trait::async_trait;
use sluice_storage::{GitObject, ObjectId, RefEdit, Repository};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Reason given for commands skipped because the pack failed to unpack.
const UNPACKER_ERROR: &str = "unpacker error";
/// Reason given for valid commands in a failed atomic push.
const ATOMIC_FAILED: &str = "atomic push failed";

pub(crate) struct MemoryReceivePack {
    repo: Arc<Repository>,
}

impl MemoryReceivePack {
    pub(crate) fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Parses the pack on a blocking worker, resolving thin deltas against
    /// the repository. Nothing is stored.
    async fn unpack(
        &self,
        pack: bytes::Bytes,
        cancel: &CancellationToken,
    ) -> Result<Vec<GitObject>> {
        if pack.is_empty() {
            return Ok(Vec::new());
        }

        let repo = self.repo.clone();
        let token = cancel.clone();
        let worker = tokio::task::spawn_blocking(move || {
            PackParser::new(&pack).parse_objects(&repo.objects, || token.is_cancelled())
        });
        tokio::select! {
            _ = cancel.cancelled() => Err(GitError::Canceled),
            joined = worker => joined.map_err(|e| GitError::Io(std::io::Error::other(e)))?,
        }
    }

    /// Checks a command against the unpacked objects; returns the rejection
    /// reason, if any. Old values are checked when the edit is applied.
    fn validate(&self, command: &Command, unpacked: &HashSet<ObjectId>) -> Option<String> {
        if !command.ref_name.starts_with("refs/") {
            return Some("funny refname".to_string());
        }
        if command.is_create() && command.is_delete() {
            return Some("nothing to do".to_string());
        }
        if !command.is_delete()
            && !unpacked.contains(&command.new_id)
            && !self.repo.objects.contains(&command.new_id)
        {
            return Some("missing necessary objects".to_string());
        }
        None
    }
}

fn edit_for(command: &Command) -> RefEdit {
    RefEdit {
        name: command.ref_name.clone(),
        old: (!command.old_id.is_zero()).then_some(command.old_id),
        new: (!command.new_id.is_zero()).then_some(command.new_id),
    }
}

#[async_trait]
impl ReceivePackSession for MemoryReceivePack {
    async fn apply_pack(
        self: Box<Self>,
        request: ReferenceUpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceivePackResult> {
        check_capabilities(Service::ReceivePack, &request.capabilities)?;
        if !request.shallows.is_empty() {
            return Err(GitError::Unsupported("shallow not supported".to_string()));
        }

        let atomic = request.capabilities.contains(ATOMIC);
        let mut result = ReceivePackResult {
            report: None,
            side_band: SideBand::from_capabilities(&request.capabilities),
        };

        let objects = match self.unpack(request.pack.clone(), cancel).await {
            Ok(objects) => objects,
            Err(GitError::Canceled) => return Err(GitError::Canceled),
            Err(e) => {
                tracing::warn!(
                    repository = %self.repo.location,
                    error = %e,
                    "Rejected pushed pack"
                );
                let report = ReportStatus {
                    unpack_error: Some(e.to_string()),
                    commands: request
                        .commands
                        .iter()
                        .map(|c| CommandStatus::rejected(&c.ref_name, UNPACKER_ERROR))
                        .collect(),
                };
                if request.capabilities.contains(REPORT_STATUS) {
                    result.report = Some(report);
                }
                return Ok(result);
            }
        };

        if cancel.is_cancelled() {
            return Err(GitError::Canceled);
        }

        let unpacked: HashSet<ObjectId> = objects.iter().map(|o| o.id).collect();
        let mut reasons: Vec<Option<String>> = request
            .commands
            .iter()
            .map(|command| self.validate(command, &unpacked))
            .collect();

        let object_count = objects.len();
        self.repo.objects.extend(objects);

        if atomic && reasons.iter().any(Option::is_some) {
            for reason in reasons.iter_mut().filter(|r| r.is_none()) {
                *reason = Some(ATOMIC_FAILED.to_string());
            }
        } else {
            let accepted: Vec<usize> = (0..request.commands.len())
                .filter(|&i| reasons[i].is_none())
                .collect();
            let edits: Vec<RefEdit> = accepted
                .iter()
                .map(|&i| edit_for(&request.commands[i]))
                .collect();
            for (index, outcome) in accepted.into_iter().zip(self.repo.refs.apply(&edits, atomic)) {
                if let Err(e) = outcome {
                    reasons[index] = Some(e.to_string());
                }
            }
        }

        let report = ReportStatus {
            unpack_error: None,
            commands: request
                .commands
                .iter()
                .zip(reasons)
                .map(|(command, reason)| CommandStatus {
                    ref_name: command.ref_name.clone(),
                    error: reason,
                })
                .collect(),
        };

        tracing::info!(
            repository = %self.repo.location,
            objects = object_count,
            commands = report.commands.len(),
            rejected = report.commands.iter().filter(|c| c.error.is_some()).count(),
            "Applied push"
        );

        if request.capabilities.contains(REPORT_STATUS) {
            result.report = Some(report);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::pack::PackBuilder;
    use crate::server::fixtures::{commit, provider, History, LOCATION};
    use crate::server::MemoryProvider;
    use crate::service::{Endpoint, Role};
    use crate::session::SessionProvider;
    use sluice_storage::ObjectStore;

    async fn push(
        provider: &MemoryProvider,
        endpoint: &Endpoint,
        request: ReferenceUpdateRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceivePackResult> {
        provider
            .open(endpoint, Service::ReceivePack, Role::Transactor)
            .await
            .unwrap()
            .into_receive_pack()
            .unwrap()
            .apply_pack(request, cancel)
            .await
    }

    /// Builds a third commit on top of `history.second` and a pack holding
    /// only the new objects.
    fn new_commit(history: &History) -> (ObjectId, bytes::Bytes) {
        let scratch = ObjectStore::new();
        let (c3, t3, b3) = commit(&scratch, "third\n", &[history.second]);
        let mut builder = PackBuilder::new();
        builder.add(c3.clone());
        builder.add(t3);
        builder.add(b3);
        (c3.id, bytes::Bytes::from(builder.build().unwrap()))
    }

    fn request(commands: Vec<Command>, caps: &str, pack: bytes::Bytes) -> ReferenceUpdateRequest {
        ReferenceUpdateRequest {
            commands,
            capabilities: Capabilities::parse(caps),
            shallows: vec![],
            pack,
        }
    }

    #[tokio::test]
    async fn test_fast_forward_push() {
        let (provider, endpoint, history) = provider();
        let (c3, pack) = new_commit(&history);

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![Command::new(history.second, c3, "refs/heads/main")],
                "report-status side-band-64k",
                pack,
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let report = result.report.unwrap();
        assert!(report.is_ok());
        assert_eq!(result.side_band, SideBand::SideBand64k);

        let repo = provider.repos().get(LOCATION).unwrap();
        assert_eq!(repo.refs.resolve("refs/heads/main").unwrap(), c3);
        assert!(repo.objects.contains(&c3));
    }

    #[tokio::test]
    async fn test_stale_old_value_is_rejected() {
        let (provider, endpoint, history) = provider();
        let (c3, pack) = new_commit(&history);

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![
                    Command::new(history.first, c3, "refs/heads/main"),
                    Command::new(ObjectId::ZERO, c3, "refs/heads/topic"),
                ],
                "report-status",
                pack,
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let report = result.report.unwrap();
        assert!(report.unpack_error.is_none());
        assert!(report.commands[0].error.is_some());
        assert!(report.commands[1].error.is_none());

        let repo = provider.repos().get(LOCATION).unwrap();
        assert_eq!(repo.refs.resolve("refs/heads/main").unwrap(), history.second);
        assert_eq!(repo.refs.resolve("refs/heads/topic").unwrap(), c3);
    }

    #[tokio::test]
    async fn test_atomic_push_rejects_everything() {
        let (provider, endpoint, history) = provider();
        let (c3, pack) = new_commit(&history);

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![
                    Command::new(history.second, c3, "refs/heads/main"),
                    Command::new(ObjectId::ZERO, c3, "HEAD"),
                ],
                "report-status atomic",
                pack,
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let report = result.report.unwrap();
        assert_eq!(report.commands[0].error.as_deref(), Some(ATOMIC_FAILED));
        assert_eq!(report.commands[1].error.as_deref(), Some("funny refname"));

        let repo = provider.repos().get(LOCATION).unwrap();
        assert_eq!(repo.refs.resolve("refs/heads/main").unwrap(), history.second);
    }

    #[tokio::test]
    async fn test_delete_without_pack() {
        let (provider, endpoint, history) = provider();

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![Command::new(history.tag, ObjectId::ZERO, "refs/tags/v1")],
                "report-status delete-refs",
                bytes::Bytes::new(),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.report.unwrap().is_ok());
        let repo = provider.repos().get(LOCATION).unwrap();
        assert!(repo.refs.get("refs/tags/v1").is_err());
    }

    #[tokio::test]
    async fn test_missing_objects_rejected() {
        let (provider, endpoint, _) = provider();
        let unknown = ObjectId::from_bytes([0x42; 20]);

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![Command::new(ObjectId::ZERO, unknown, "refs/heads/ghost")],
                "report-status",
                bytes::Bytes::new(),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let report = result.report.unwrap();
        assert_eq!(
            report.commands[0].error.as_deref(),
            Some("missing necessary objects")
        );
    }

    #[tokio::test]
    async fn test_corrupt_pack_reports_unpack_error() {
        let (provider, endpoint, history) = provider();
        let (c3, pack) = new_commit(&history);
        let mut corrupt = pack.to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![Command::new(history.second, c3, "refs/heads/main")],
                "report-status",
                bytes::Bytes::from(corrupt),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let report = result.report.unwrap();
        assert!(report.unpack_error.is_some());
        assert_eq!(report.commands[0].error.as_deref(), Some(UNPACKER_ERROR));

        let repo = provider.repos().get(LOCATION).unwrap();
        assert!(!repo.objects.contains(&c3));
        assert_eq!(repo.refs.resolve("refs/heads/main").unwrap(), history.second);
    }

    #[tokio::test]
    async fn test_no_report_without_report_status() {
        let (provider, endpoint, history) = provider();
        let (c3, pack) = new_commit(&history);

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![Command::new(history.second, c3, "refs/heads/main")],
                "",
                pack,
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(result.report.is_none());
    }

    #[tokio::test]
    async fn test_canceled_push_leaves_repository_untouched() {
        let (provider, endpoint, history) = provider();
        let (c3, pack) = new_commit(&history);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = push(
            &provider,
            &endpoint,
            request(
                vec![Command::new(history.second, c3, "refs/heads/main")],
                "report-status",
                pack,
            ),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(GitError::Canceled)));

        let repo = provider.repos().get(LOCATION).unwrap();
        assert!(!repo.objects.contains(&c3));
        assert_eq!(repo.refs.resolve("refs/heads/main").unwrap(), history.second);
    }

    #[tokio::test]
    async fn test_rejects_unoffered_capability() {
        let (provider, endpoint, _) = provider();
        let result = push(
            &provider,
            &endpoint,
            request(
                vec![Command::new(
                    ObjectId::ZERO,
                    ObjectId::from_bytes([1; 20]),
                    "refs/heads/x",
                )],
                "report-status push-options",
                bytes::Bytes::new(),
            ),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(GitError::Unsupported(_))));
    }
}
