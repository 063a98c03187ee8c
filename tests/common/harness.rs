//! Test orchestrator lifecycle management
//!
//! Each test gets its own temp directory holding the operation log, the
//! fake restic script and its state.

use super::constants::*;
use super::fake_restic::write_fake_restic;
use backup_orchestrator::config::{Config, PlanConfig, RepoConfig};
use backup_orchestrator::hook::CommandHookExecutor;
use backup_orchestrator::oplog::{OpLog, OpSelector, Operation};
use backup_orchestrator::orchestrator::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn repo(id: &str) -> RepoConfig {
    RepoConfig {
        id: id.to_string(),
        uri: format!("/srv/restic/{}", id),
        password: Some("secret".to_string()),
        env: vec![],
        flags: vec![],
        prune_policy: None,
        auto_unlock: false,
        hooks: vec![],
    }
}

pub fn plan(id: &str, repo: &str) -> PlanConfig {
    PlanConfig {
        id: id.to_string(),
        repo: repo.to_string(),
        paths: vec!["/data".to_string()],
        excludes: vec![],
        schedule: None,
        retention: None,
        backup_flags: vec![],
        hooks: vec![],
    }
}

/// One repo with two plans, plus an unrelated second repo.
pub fn default_config() -> Config {
    Config {
        repos: vec![repo(REPO_ID), repo(OTHER_REPO_ID)],
        plans: vec![plan(PLAN_A, REPO_ID), plan(PLAN_B, REPO_ID)],
    }
}

/// A running orchestrator. Dropping it stops the run loop.
pub struct TestOrchestrator {
    pub orchestrator: Arc<Orchestrator>,
    /// Directory the fake restic script writes its state to.
    pub state_dir: PathBuf,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
    _temp_dir: TempDir,
}

impl TestOrchestrator {
    pub async fn spawn(verbs: &[(&'static str, String)]) -> Self {
        Self::spawn_with(verbs, |_| {}).await
    }

    /// Like [`Self::spawn`], letting the test adjust the default config.
    pub async fn spawn_with<F>(verbs: &[(&'static str, String)], customize: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let restic = write_fake_restic(temp_dir.path(), &state_dir, verbs);

        let mut config = default_config();
        customize(&mut config);

        let oplog = Arc::new(OpLog::open(temp_dir.path().join("oplog.db")).unwrap());
        let orchestrator = Arc::new(
            Orchestrator::new(config, oplog, Arc::new(CommandHookExecutor), restic).unwrap(),
        );

        let shutdown = CancellationToken::new();
        let handle = {
            let orchestrator = orchestrator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { orchestrator.run(shutdown).await })
        };

        Self {
            orchestrator,
            state_dir,
            shutdown,
            handle: Some(handle),
            _temp_dir: temp_dir,
        }
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.orchestrator
            .get_operations(&OpSelector::default())
            .unwrap()
    }

    pub fn operation(&self, op_id: i64) -> Operation {
        self.orchestrator.oplog().get(op_id).unwrap().unwrap()
    }

    /// Polls until operation `op_id` is terminal.
    pub async fn wait_for_terminal(&self, op_id: i64) -> Operation {
        self.wait_until(&format!("operation {} to finish", op_id), |_| {
            let op = self.operation(op_id);
            op.is_terminal().then_some(op)
        })
        .await
    }

    /// Polls until the operation log satisfies `check`.
    pub async fn wait_for_ops<F>(&self, what: &str, check: F) -> Vec<Operation>
    where
        F: Fn(&[Operation]) -> bool,
    {
        self.wait_until(what, |ops| check(ops).then(|| ops.to_vec()))
            .await
    }

    async fn wait_until<T, F>(&self, what: &str, check: F) -> T
    where
        F: Fn(&[Operation]) -> Option<T>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(WAIT_TIMEOUT_SECS);
        loop {
            if let Some(found) = check(&self.operations()) {
                return found;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for {}: {:#?}", what, self.operations());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Lines the fake restic appended to its invocation log.
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.state_dir.join("invocations.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Stops the run loop and waits for running tasks to finish.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap();
        }
    }
}

impl Drop for TestOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
