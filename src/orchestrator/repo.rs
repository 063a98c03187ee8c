//! Per-repository access to the backup tool.
//!
//! Every call that starts a restic process goes through a [`RepoSession`],
//! which can only be obtained by passing the repository's [`RepoGate`].
//! Calls that never touch the tool are made on [`RepoOrchestrator`]
//! directly and never wait on the gate.

use super::gate::{GateGuard, RepoGate, Ticket};
use crate::config::{PlanConfig, RepoConfig, RetentionPolicy};
use crate::restic::{
    plan_tag, BackupOutcome, BackupStatus, LsEntry, RepoStats, Restic, ResticError,
    RestoreProgress, Snapshot,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on suggestions returned by [`RepoOrchestrator::path_autocomplete`].
const MAX_AUTOCOMPLETE_ENTRIES: usize = 1000;

#[derive(Debug)]
pub struct RepoOrchestrator {
    config: RepoConfig,
    restic: Restic,
    gate: Arc<RepoGate>,
}

impl RepoOrchestrator {
    /// `gate` is shared with any previous orchestrator for the same repo so
    /// that a config reload never lets two processes run at once.
    pub fn new(restic_binary: &Path, config: RepoConfig, gate: Arc<RepoGate>) -> Self {
        let restic = Restic::new(restic_binary, &config);
        Self {
            config,
            restic,
            gate,
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<RepoGate> {
        &self.gate
    }

    /// Takes a place in the gate's line without waiting.
    pub fn ticket(&self) -> Ticket {
        self.gate.ticket()
    }

    /// Waits for the gate and returns exclusive access.
    pub async fn lock(self: &Arc<Self>) -> RepoSession {
        let guard = self.ticket().acquire().await;
        RepoSession::new(self.clone(), guard)
    }

    /// Lists directory entries on the local host whose path starts with
    /// `prefix`. Directories get a trailing `/`.
    pub async fn path_autocomplete(&self, prefix: &str) -> std::io::Result<Vec<String>> {
        let (dir, partial) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..=idx], &prefix[idx + 1..]),
            None => ("./", prefix),
        };

        let mut matches = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(partial) {
                continue;
            }
            let mut path = PathBuf::from(dir).join(&name).to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                path.push('/');
            }
            matches.push(path);
            if matches.len() >= MAX_AUTOCOMPLETE_ENTRIES {
                break;
            }
        }
        matches.sort();
        Ok(matches)
    }
}

/// Exclusive access to one repository's backup tool. The gate is released
/// when the session is dropped.
#[derive(Debug)]
pub struct RepoSession {
    repo: Arc<RepoOrchestrator>,
    _guard: GateGuard,
}

impl RepoSession {
    pub fn new(repo: Arc<RepoOrchestrator>, guard: GateGuard) -> Self {
        debug!("Acquired repo {}", repo.config.id);
        Self {
            repo,
            _guard: guard,
        }
    }

    pub fn repo_id(&self) -> &str {
        &self.repo.config.id
    }

    pub fn config(&self) -> &RepoConfig {
        &self.repo.config
    }

    pub async fn backup<F>(
        &self,
        plan: &PlanConfig,
        cancel: &CancellationToken,
        on_status: F,
    ) -> Result<BackupOutcome, ResticError>
    where
        F: FnMut(&BackupStatus),
    {
        self.repo.restic.backup(plan, cancel, on_status).await
    }

    pub async fn restore<F>(
        &self,
        snapshot_id: &str,
        path: &str,
        target: &str,
        cancel: &CancellationToken,
        on_status: F,
    ) -> Result<RestoreProgress, ResticError>
    where
        F: FnMut(&RestoreProgress),
    {
        self.repo
            .restic
            .restore(snapshot_id, path, target, cancel, on_status)
            .await
    }

    pub async fn forget_by_policy(
        &self,
        plan_id: &str,
        policy: &RetentionPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snapshot>, ResticError> {
        self.repo.restic.forget_by_policy(plan_id, policy, cancel).await
    }

    pub async fn forget_snapshot(
        &self,
        snapshot_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ResticError> {
        self.repo.restic.forget_snapshot(snapshot_id, cancel).await
    }

    pub async fn prune(&self, cancel: &CancellationToken) -> Result<String, ResticError> {
        let max_unused = self
            .repo
            .config
            .prune_policy
            .as_ref()
            .and_then(|p| p.max_unused_percent);
        self.repo.restic.prune(max_unused, cancel).await
    }

    pub async fn unlock(&self, cancel: &CancellationToken) -> Result<String, ResticError> {
        self.repo.restic.unlock(cancel).await
    }

    pub async fn stats(&self, cancel: &CancellationToken) -> Result<RepoStats, ResticError> {
        self.repo.restic.stats(cancel).await
    }

    /// All snapshots in the repository, or only those of `plan_id`.
    pub async fn snapshots(
        &self,
        plan_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snapshot>, ResticError> {
        let tag = plan_id.map(plan_tag);
        self.repo.restic.snapshots(tag.as_deref(), cancel).await
    }

    pub async fn ls(
        &self,
        snapshot_id: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(Snapshot, Vec<LsEntry>), ResticError> {
        self.repo.restic.ls(snapshot_id, path, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support;
    use tempfile::TempDir;

    fn orchestrator() -> Arc<RepoOrchestrator> {
        Arc::new(RepoOrchestrator::new(
            Path::new("/bin/false"),
            test_support::repo("r1"),
            RepoGate::new(),
        ))
    }

    #[tokio::test]
    async fn test_session_holds_the_gate() {
        let repo = orchestrator();
        assert!(repo.gate().is_idle());

        let session = repo.lock().await;
        assert_eq!(session.repo_id(), "r1");
        assert!(!repo.gate().is_idle());

        drop(session);
        assert!(repo.gate().is_idle());
    }

    #[tokio::test]
    async fn test_path_autocomplete_bypasses_the_gate() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("photos")).unwrap();
        std::fs::write(dir.path().join("photo.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let repo = orchestrator();
        let _session = repo.lock().await;

        let prefix = format!("{}/pho", dir.path().display());
        let matches = repo.path_autocomplete(&prefix).await.unwrap();
        assert_eq!(
            matches,
            vec![
                format!("{}/photo.txt", dir.path().display()),
                format!("{}/photos/", dir.path().display()),
            ]
        );
    }
}
