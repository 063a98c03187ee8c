//! The scheduler.
//!
//! [`Orchestrator`] owns the task queue, one [`RepoOrchestrator`] per
//! configured repository and the configuration generation counter. Its run
//! loop pops due entries in queue order, takes a place in the target
//! repository's gate for each, and runs task bodies concurrently on a task
//! tracker. Entries for the same repository therefore execute one at a time
//! and in the order they were dequeued; entries for different repositories
//! run in parallel.

pub mod gate;
mod queue;
pub mod repo;
pub mod runner;
pub mod tasks;

pub use queue::{ScheduledTask, TaskCallback};
pub use repo::{RepoOrchestrator, RepoSession};
pub use runner::TaskRunner;
pub use tasks::{
    priority, GenericOneoffTask, GenericWork, OneoffState, OneoffTask, RecurringKind,
    RecurringTask, Task, TaskError, TaskExecution, TaskWork,
};

use crate::config::{Config, ConfigSnapshot, ConfigStore, PlanConfig, RepoConfig};
use crate::hook::{HookCondition, HookExecutor, HookVars};
use crate::metrics;
use crate::oplog::{
    now_ms, ClearHistoryFilter, OpLog, OpLogError, OpSelector, Operation, OperationEvent,
    OperationKind, OperationStatus,
};
use crate::restic::{LsEntry, ResticError, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use gate::{RepoGate, Ticket};
use queue::TaskQueue;
use runner::oplog_error;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Longest the run loop sleeps with an empty queue.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

pub(crate) struct OrchestratorInner {
    config: ConfigStore,
    oplog: Arc<OpLog>,
    hooks: Arc<dyn HookExecutor>,
    restic_binary: PathBuf,
    queue: Mutex<TaskQueue>,
    queue_changed: Notify,
    repos: RwLock<HashMap<String, Arc<RepoOrchestrator>>>,
    /// Outlive config reloads so old and new orchestrators share a gate.
    gates: Mutex<HashMap<String, Arc<RepoGate>>>,
    /// Cancellation tokens of dispatched tasks by operation id.
    running: Mutex<HashMap<i64, CancellationToken>>,
    reload_lock: Mutex<()>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Closes out operations left over from a previous process and queues
    /// every recurring task in `config`.
    pub fn new(
        config: Config,
        oplog: Arc<OpLog>,
        hooks: Arc<dyn HookExecutor>,
        restic_binary: PathBuf,
    ) -> anyhow::Result<Self> {
        let config = ConfigStore::new(config)?;
        oplog.mark_interrupted()?;

        let inner = Arc::new(OrchestratorInner {
            config,
            oplog,
            hooks,
            restic_binary,
            queue: Mutex::new(TaskQueue::new()),
            queue_changed: Notify::new(),
            repos: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            reload_lock: Mutex::new(()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        let snapshot = inner.config.snapshot();
        inner.rebuild_repos(&snapshot.config);
        inner.schedule_recurring(&snapshot);
        Ok(Self { inner })
    }

    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.inner.config.snapshot()
    }

    pub fn oplog(&self) -> Arc<OpLog> {
        self.inner.oplog.clone()
    }

    /// Queues `task` at its next occurrence. Returns the id of the operation
    /// materialized for it, if any.
    pub fn schedule_task(&self, task: Task) -> Result<Option<i64>, TaskError> {
        self.inner.schedule_at(task, Utc::now(), Vec::new())
    }

    /// Like [`Self::schedule_task`], calling `callback` once the run (or its
    /// cancellation) completes.
    pub fn schedule_task_with_callback(
        &self,
        task: Task,
        callback: TaskCallback,
    ) -> Result<Option<i64>, TaskError> {
        self.inner.schedule_at(task, Utc::now(), vec![callback])
    }

    /// Indexes every repository once, so snapshots taken while the
    /// process was down show up in the log.
    pub fn schedule_startup_index(&self) {
        let repo_ids: Vec<String> = self
            .inner
            .config
            .snapshot()
            .config
            .repos
            .iter()
            .map(|r| r.id.clone())
            .collect();
        for repo_id in repo_ids {
            if let Err(e) = self.index_snapshots_now(&repo_id) {
                warn!("Failed to schedule startup index of repo {}: {}", repo_id, e);
            }
        }
    }

    /// Drives the queue until `shutdown` fires, then cancels running tasks
    /// and waits for them to record their final status.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting orchestrator with {} queued task(s)",
            self.inner.queue.lock().unwrap().len()
        );

        loop {
            self.inner.dispatch_due();

            let sleep_for = self.inner.time_until_next();
            debug!("Scheduler sleeping for {:?}", sleep_for);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.inner.queue_changed.notified() => {}
                _ = shutdown.cancelled() => {
                    info!("Orchestrator received shutdown signal");
                    break;
                }
                _ = self.inner.shutdown.cancelled() => break,
            }
        }

        self.inner.shutdown().await;
    }

    /// Stops a running [`Self::run`] loop.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Validates and publishes `config`, rebuilds repository access and
    /// replaces every queued recurring task with one for the new config.
    pub fn apply_config(&self, config: Config) -> anyhow::Result<()> {
        let _guard = self.inner.reload_lock.lock().unwrap();
        let snapshot = self.inner.config.apply(config)?;
        info!("Applied configuration generation {}", snapshot.modno);

        self.inner.rebuild_repos(&snapshot.config);

        let stale = self
            .inner
            .queue
            .lock()
            .unwrap()
            .remove_where(|entry| matches!(entry.task, Task::Recurring(_)));
        for mut entry in stale {
            self.inner
                .force_cancel(&mut entry, "configuration changed before the task ran");
        }

        self.inner.schedule_recurring(&snapshot);
        Ok(())
    }

    /// Cancels operation `op_id`. A queued operation is removed and closed
    /// out as SYSTEM_CANCELLED without running; a running one has its
    /// cancellation token fired.
    pub fn cancel_operation(&self, op_id: i64) -> Result<(), TaskError> {
        let removed = {
            // Same lock order as dequeue, so the entry is either still
            // queued or already tracked as running
            let mut queue = self.inner.queue.lock().unwrap();
            match queue.remove_by_op_id(op_id) {
                Some(entry) => Some((entry, queue.len())),
                None => {
                    if let Some(token) = self.inner.running.lock().unwrap().get(&op_id) {
                        info!("Cancelling running operation {}", op_id);
                        token.cancel();
                        return Ok(());
                    }
                    None
                }
            }
        };

        let Some((mut entry, depth)) = removed else {
            return Err(TaskError::Scheduling(format!(
                "operation {} is not queued or running",
                op_id
            )));
        };
        info!("Cancelling queued operation {} ({})", op_id, entry.task.name());
        self.inner.force_cancel(&mut entry, "cancelled before it started");
        metrics::set_queue_depth(depth);
        // Recurring tasks skip the cancelled occurrence
        let after = entry.run_at.max(Utc::now());
        self.inner.requeue(entry.task, after);
        Ok(())
    }

    pub fn backup_now(&self, plan_id: &str) -> Result<Option<i64>, TaskError> {
        let plan = self.inner.get_plan(plan_id)?;
        let task = OneoffTask::new(TaskWork::Backup, &plan.repo, Some(&plan.id), Utc::now())
            .with_priority(priority::INTERACTIVE | priority::BACKUP);
        self.schedule_task(Task::Oneoff(task))
    }

    /// Applies the plan's retention policy, or removes `snapshot_id` only.
    pub fn forget_now(
        &self,
        repo_id: &str,
        plan_id: &str,
        snapshot_id: Option<String>,
    ) -> Result<Option<i64>, TaskError> {
        self.inner.get_repo(repo_id)?;
        self.inner.get_plan(plan_id)?;
        let task = OneoffTask::new(
            TaskWork::Forget { snapshot_id },
            repo_id,
            Some(plan_id),
            Utc::now(),
        )
        .with_priority(priority::INTERACTIVE | priority::FORGET);
        self.schedule_task(Task::Oneoff(task))
    }

    pub fn prune_now(&self, repo_id: &str) -> Result<Option<i64>, TaskError> {
        self.repo_task_now(repo_id, TaskWork::Prune, priority::PRUNE)
    }

    pub fn unlock_now(&self, repo_id: &str) -> Result<Option<i64>, TaskError> {
        self.repo_task_now(repo_id, TaskWork::Unlock, priority::DEFAULT)
    }

    pub fn stats_now(&self, repo_id: &str) -> Result<Option<i64>, TaskError> {
        self.repo_task_now(repo_id, TaskWork::Stats, priority::STATS)
    }

    /// Indexing has no operation of its own, so this always returns `None`
    /// on success.
    pub fn index_snapshots_now(&self, repo_id: &str) -> Result<Option<i64>, TaskError> {
        self.repo_task_now(repo_id, TaskWork::IndexSnapshots, priority::INDEX_SNAPSHOTS)
    }

    fn repo_task_now(
        &self,
        repo_id: &str,
        work: TaskWork,
        class: i32,
    ) -> Result<Option<i64>, TaskError> {
        self.inner.get_repo(repo_id)?;
        let task = OneoffTask::new(work, repo_id, None, Utc::now())
            .with_priority(priority::INTERACTIVE | class);
        self.schedule_task(Task::Oneoff(task))
    }

    /// Restores `path` from `snapshot_id` into `target` on the local host.
    pub fn restore(
        &self,
        repo_id: &str,
        plan_id: &str,
        snapshot_id: &str,
        path: &str,
        target: &str,
    ) -> Result<Option<i64>, TaskError> {
        self.inner.get_repo(repo_id)?;
        if snapshot_id.is_empty() || target.is_empty() {
            return Err(TaskError::Config(
                "restore needs a snapshot id and a target".to_string(),
            ));
        }
        let work = TaskWork::Restore {
            snapshot_id: snapshot_id.to_string(),
            path: path.to_string(),
            target: target.to_string(),
        };
        let task = OneoffTask::new(work, repo_id, Some(plan_id), Utc::now())
            .with_priority(priority::INTERACTIVE);
        self.schedule_task(Task::Oneoff(task))
    }

    /// Lists the repository's snapshots, or only those of `plan_id`. Waits
    /// for the repository like any other task.
    pub async fn list_snapshots(
        &self,
        repo_id: &str,
        plan_id: Option<&str>,
    ) -> Result<Vec<Snapshot>, TaskError> {
        let plan_id = plan_id.map(str::to_string);
        let name = format!("list snapshots for repo \"{}\"", repo_id);
        self.run_gated(repo_id, name, move |session, cancel| {
            let plan_id = plan_id.clone();
            async move { session.snapshots(plan_id.as_deref(), &cancel).await }.boxed()
        })
        .await
    }

    /// Lists the entries under `path` in `snapshot_id`.
    pub async fn list_snapshot_files(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        path: &str,
    ) -> Result<(Snapshot, Vec<LsEntry>), TaskError> {
        let snapshot_id = snapshot_id.to_string();
        let path = path.to_string();
        let name = format!("list files of snapshot \"{}\"", snapshot_id);
        self.run_gated(repo_id, name, move |session, cancel| {
            let snapshot_id = snapshot_id.clone();
            let path = path.clone();
            async move { session.ls(&snapshot_id, &path, &cancel).await }.boxed()
        })
        .await
    }

    /// Runs `call` as an interactive one-off task on `repo_id` and hands
    /// its result back to the caller.
    async fn run_gated<T, F>(&self, repo_id: &str, name: String, call: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: Fn(Arc<RepoSession>, CancellationToken) -> BoxFuture<'static, Result<T, ResticError>>
            + Send
            + Sync
            + 'static,
    {
        self.inner.get_repo(repo_id)?;
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let call = Arc::new(call);

        let work: GenericWork = Arc::new(move |exec: TaskExecution, _: Arc<dyn TaskRunner>| {
            let tx = tx.clone();
            let call = call.clone();
            async move {
                let session = exec.require_session()?;
                let result = call(session, exec.cancel.clone())
                    .await
                    .map_err(TaskError::from);
                let cancelled = matches!(&result, Err(e) if e.is_cancelled());
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
                if cancelled {
                    return Err(TaskError::Cancelled);
                }
                Ok::<(), TaskError>(())
            }
            .boxed()
        });

        let state = OneoffState::new(name, repo_id, None, Utc::now(), priority::INTERACTIVE);
        self.schedule_task(Task::GenericOneoff(GenericOneoffTask::new(state, work)))?;

        // A dropped sender means the task was cancelled before it ran
        rx.await.unwrap_or(Err(TaskError::Cancelled))
    }

    /// Local paths starting with `prefix`, for choosing backup sources.
    /// Never waits on the repository.
    pub async fn path_autocomplete(
        &self,
        repo_id: &str,
        prefix: &str,
    ) -> Result<Vec<String>, TaskError> {
        let repo = self.inner.get_repo_orchestrator(repo_id)?;
        repo.path_autocomplete(prefix)
            .await
            .map_err(|e| TaskError::Restic(ResticError::Io(e)))
    }

    pub fn get_operations(&self, selector: &OpSelector) -> Result<Vec<Operation>, TaskError> {
        Ok(self.inner.oplog.query(selector)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.inner.oplog.subscribe()
    }

    pub fn get_logs(&self, logref: &str) -> Result<Option<Vec<u8>>, TaskError> {
        Ok(self.inner.oplog.get_log(logref)?)
    }

    /// Where the files of a successful restore were written.
    pub fn download_handle(&self, op_id: i64) -> Result<PathBuf, TaskError> {
        let op = self
            .inner
            .oplog
            .get(op_id)?
            .ok_or(OpLogError::NotFound(op_id))?;
        match (&op.op, op.status) {
            (OperationKind::Restore { target, .. }, OperationStatus::Success) => {
                Ok(PathBuf::from(target))
            }
            (OperationKind::Restore { .. }, status) => Err(TaskError::Scheduling(format!(
                "restore {} has status {}, nothing to download",
                op_id,
                status.as_str()
            ))),
            (kind, _) => Err(TaskError::Scheduling(format!(
                "operation {} is a {}, not a restore",
                op_id,
                kind.name()
            ))),
        }
    }

    pub fn clear_history(&self, filter: &ClearHistoryFilter) -> Result<Vec<i64>, TaskError> {
        Ok(self.inner.oplog.clear_history(filter)?)
    }
}

impl OrchestratorInner {
    fn rebuild_repos(&self, config: &Config) {
        let mut gates = self.gates.lock().unwrap();
        let repos: HashMap<String, Arc<RepoOrchestrator>> = config
            .repos
            .iter()
            .map(|repo| {
                let gate = gates.entry(repo.id.clone()).or_insert_with(RepoGate::new);
                let orchestrator =
                    RepoOrchestrator::new(&self.restic_binary, repo.clone(), gate.clone());
                (repo.id.clone(), Arc::new(orchestrator))
            })
            .collect();
        debug!("Built access for {} repo(s)", repos.len());
        *self.repos.write().unwrap() = repos;
    }

    fn schedule_recurring(&self, snapshot: &ConfigSnapshot) {
        for task in RecurringTask::all_for(&snapshot.config, snapshot.modno) {
            if let Err(e) = self.schedule_at(Task::Recurring(task), Utc::now(), Vec::new()) {
                error!("Failed to schedule recurring task: {}", e);
            }
        }
    }

    fn schedule_at(
        &self,
        mut task: Task,
        after: DateTime<Utc>,
        callbacks: Vec<TaskCallback>,
    ) -> Result<Option<i64>, TaskError> {
        let snapshot = self.config.snapshot();
        let Some(occurrence) = task.next(after, &snapshot.config) else {
            debug!("{} has no further occurrences", task.name());
            return Ok(None);
        };

        let mut op = occurrence.op;
        if let Some(op) = op.as_mut() {
            self.oplog.add(op).map_err(oplog_error)?;
        }
        let op_id = op.as_ref().map(|op| op.id);

        info!(
            "Scheduled {} at {} (operation {:?})",
            task.name(),
            occurrence.run_at,
            op_id
        );
        let depth = {
            let mut queue = self.queue.lock().unwrap();
            queue.push(ScheduledTask {
                task,
                run_at: occurrence.run_at,
                op,
                modno: snapshot.modno,
                callbacks,
            });
            queue.len()
        };
        metrics::set_queue_depth(depth);
        self.queue_changed.notify_one();
        Ok(op_id)
    }

    /// Asks `task` for its next occurrence after a run or cancellation.
    fn requeue(&self, task: Task, after: DateTime<Utc>) {
        if let Task::Recurring(recurring) = &task {
            // Replaced by a task from a newer configuration
            if recurring.generation != self.config.modno() {
                debug!("Dropping {} from a superseded configuration", task.name());
                return;
            }
        }
        let name = task.name();
        if let Err(e) = self.schedule_at(task, after, Vec::new()) {
            error!("Failed to reschedule {}: {}", name, e);
        }
    }

    fn time_until_next(&self) -> Duration {
        match self.queue.lock().unwrap().peek_run_at() {
            Some(run_at) => (run_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(IDLE_POLL_INTERVAL),
            None => IDLE_POLL_INTERVAL,
        }
    }

    fn dispatch_due(self: &Arc<Self>) {
        while let Some((entry, cancel)) = self.take_due() {
            self.dispatch(entry, cancel);
        }
    }

    /// Pops the next due entry and tracks its cancellation token before the
    /// queue lock is released.
    fn take_due(&self) -> Option<(ScheduledTask, CancellationToken)> {
        let mut queue = self.queue.lock().unwrap();
        let entry = queue.pop_due(Utc::now())?;
        let cancel = self.shutdown.child_token();
        if let Some(op_id) = entry.op_id() {
            self.running.lock().unwrap().insert(op_id, cancel.clone());
        }
        metrics::set_queue_depth(queue.len());
        Some((entry, cancel))
    }

    fn dispatch(self: &Arc<Self>, mut entry: ScheduledTask, cancel: CancellationToken) {
        let name = entry.task.name();
        let snapshot = self.config.snapshot();

        if entry.modno != snapshot.modno {
            if let Task::Recurring(_) = entry.task {
                info!("Configuration changed since {} was queued, rescheduling", name);
                self.untrack(entry.op_id());
                self.force_cancel(&mut entry, "configuration changed before the task ran");
                self.requeue(entry.task, Utc::now());
                return;
            }
        }

        let Some(repo) = self.repos.read().unwrap().get(entry.task.repo_id()).cloned() else {
            warn!(
                "Repo {} of {} is no longer configured, cancelling",
                entry.task.repo_id(),
                name
            );
            self.untrack(entry.op_id());
            self.force_cancel(&mut entry, "repository is no longer configured");
            return;
        };

        // Taken before spawning so the gate admits tasks in dequeue order
        let ticket = repo.ticket();

        debug!("Dispatching {}", name);
        let inner = self.clone();
        self.tracker.spawn(async move {
            inner.execute(entry, repo, ticket, cancel).await;
        });
    }

    async fn execute(
        self: Arc<Self>,
        mut entry: ScheduledTask,
        repo: Arc<RepoOrchestrator>,
        ticket: Ticket,
        cancel: CancellationToken,
    ) {
        let name = entry.task.name();
        let op_id = entry.op_id();

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = ticket.acquire() => Some(guard),
        };
        let Some(guard) = guard else {
            info!("{} was cancelled while waiting for repo {}", name, repo.config().id);
            self.untrack(op_id);
            self.force_cancel(&mut entry, "cancelled before it started");
            if !self.shutdown.is_cancelled() {
                self.requeue(entry.task, Utc::now());
            }
            return;
        };
        let session = Arc::new(RepoSession::new(repo, guard));

        info!("Running {}", name);
        metrics::task_started();
        let started = Instant::now();

        let exec = TaskExecution {
            run_at: entry.run_at,
            op: entry.op.clone(),
            cancel: cancel.clone(),
            session: Some(session.clone()),
        };
        let runner: Arc<dyn TaskRunner> = self.clone();
        let result = match tokio::spawn(entry.task.run(exec, runner)).await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Scheduling(format!("task panicked: {}", e))),
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(()) => info!("{} completed in {:?}", name, elapsed),
            Err(e) if e.is_cancelled() => info!("{} was cancelled after {:?}", name, elapsed),
            Err(e) => error!("{} failed after {:?}: {}", name, elapsed, e),
        }

        if let Some(op) = &entry.op {
            let status = self.close_out(op.id, &result);
            metrics::record_operation_finished(op.op.name(), status.as_str(), elapsed);
        }
        metrics::task_finished();
        self.untrack(op_id);
        entry.run_callbacks(&result);

        // Releases the repository only once the operation is terminal
        drop(session);

        if !self.shutdown.is_cancelled() {
            self.requeue(entry.task, Utc::now());
        }
    }

    /// Makes sure operation `op_id` ended in a terminal status, recording
    /// one from `result` if the task body did not. Returns the final status.
    fn close_out(&self, op_id: i64, result: &Result<(), TaskError>) -> OperationStatus {
        let stored = match self.oplog.get(op_id) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!("Operation {} disappeared while running", op_id);
                return OperationStatus::Error;
            }
            Err(e) => {
                error!("Failed to read back operation {}: {}", op_id, e);
                return OperationStatus::Error;
            }
        };
        if stored.is_terminal() {
            return stored.status;
        }

        let mut op = stored;
        if op.status == OperationStatus::Pending {
            op.unix_time_start_ms = now_ms();
        }
        if let Err(e) = tasks::finish_operation(self, &mut op, result) {
            error!("Failed to record final status of operation {}: {}", op_id, e);
        }
        op.status
    }

    /// Closes out an entry that will never run.
    fn force_cancel(&self, entry: &mut ScheduledTask, reason: &str) {
        if let Some(op) = entry.op.as_mut() {
            op.status = OperationStatus::SystemCancelled;
            op.unix_time_end_ms = now_ms();
            op.display_message = reason.to_string();
            match self.oplog.update(op) {
                Ok(()) => {
                    metrics::record_operation_finished(
                        op.op.name(),
                        op.status.as_str(),
                        Duration::ZERO,
                    );
                }
                Err(e) => error!("Failed to cancel operation {}: {}", op.id, e),
            }
        }
        entry.run_callbacks(&Err(TaskError::Cancelled));
    }

    fn untrack(&self, op_id: Option<i64>) {
        if let Some(op_id) = op_id {
            self.running.lock().unwrap().remove(&op_id);
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down orchestrator...");
        self.shutdown.cancel();

        let queued = self.queue.lock().unwrap().remove_where(|_| true);
        for mut entry in queued {
            self.force_cancel(&mut entry, "orchestrator shut down before the task ran");
        }
        metrics::set_queue_depth(0);

        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} running task(s) to finish...", self.tracker.len());
        }
        self.tracker.wait().await;
        info!("Orchestrator shutdown complete");
    }
}

#[async_trait]
impl TaskRunner for OrchestratorInner {
    fn create_operation(&self, op: &mut Operation) -> Result<(), TaskError> {
        self.oplog.add(op).map_err(oplog_error)
    }

    fn update_operation(&self, op: &Operation) -> Result<(), TaskError> {
        self.oplog.update(op).map_err(oplog_error)
    }

    async fn execute_hooks(
        &self,
        repo_id: &str,
        plan_id: Option<&str>,
        condition: HookCondition,
        vars: &HookVars,
    ) -> Result<(), TaskError> {
        let snapshot = self.config.snapshot();
        let mut hooks = snapshot
            .config
            .get_repo(repo_id)
            .map(|r| r.hooks.clone())
            .unwrap_or_default();
        if let Some(plan) = plan_id.and_then(|id| snapshot.config.get_plan(id)) {
            hooks.extend(plan.hooks.iter().cloned());
        }
        if hooks.is_empty() {
            return Ok(());
        }
        self.hooks.execute(&hooks, condition, vars).await?;
        Ok(())
    }

    fn oplog(&self) -> Arc<OpLog> {
        self.oplog.clone()
    }

    fn get_repo(&self, repo_id: &str) -> Result<RepoConfig, TaskError> {
        self.config
            .snapshot()
            .config
            .get_repo(repo_id)
            .cloned()
            .ok_or_else(|| TaskError::Config(format!("repo {} not found", repo_id)))
    }

    fn get_plan(&self, plan_id: &str) -> Result<PlanConfig, TaskError> {
        self.config
            .snapshot()
            .config
            .get_plan(plan_id)
            .cloned()
            .ok_or_else(|| TaskError::Config(format!("plan {} not found", plan_id)))
    }

    fn get_repo_orchestrator(&self, repo_id: &str) -> Result<Arc<RepoOrchestrator>, TaskError> {
        self.repos
            .read()
            .unwrap()
            .get(repo_id)
            .cloned()
            .ok_or_else(|| TaskError::Config(format!("repo {} not found", repo_id)))
    }

    fn schedule_task(&self, task: Task) -> Result<(), TaskError> {
        self.schedule_at(task, Utc::now(), Vec::new()).map(|_| ())
    }
}
