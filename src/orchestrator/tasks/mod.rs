//! Schedulable units of work.
//!
//! A [`Task`] knows when it should next run ([`Task::next`]) and how to run
//! ([`Task::run`]). The scheduler owns tasks between runs and hands them a
//! [`TaskRunner`] for everything they need from the outside.

mod backup;
mod forget;
mod index_snapshots;
mod prune;
mod restore;
mod stats;
mod unlock;

use super::repo::RepoSession;
use super::runner::TaskRunner;
use crate::config::{schedule, Config};
use crate::hook::HookError;
use crate::oplog::{now_ms, OpLogError, Operation, OperationKind, OperationStatus};
use crate::restic::ResticError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tie-break weights for tasks due at the same time. Higher runs first.
pub mod priority {
    pub const STATS: i32 = -1;
    pub const DEFAULT: i32 = 0;
    pub const INDEX_SNAPSHOTS: i32 = 1 << 0;
    pub const FORGET: i32 = 1 << 1;
    pub const PRUNE: i32 = 1 << 2;
    pub const BACKUP: i32 = 1 << 3;
    pub const INTERACTIVE: i32 = 1 << 4;
}

/// Minimum spacing between progress writes for one operation.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("scheduling error: {0}")]
    Scheduling(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Restic(#[from] ResticError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    OpLog(#[from] OpLogError),
    #[error("operation cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled | TaskError::Restic(ResticError::Cancelled)
        )
    }
}

/// What the scheduler passes to a task for one run.
#[derive(Clone)]
pub struct TaskExecution {
    pub run_at: DateTime<Utc>,
    /// The operation materialized for this run, if the task has one.
    pub op: Option<Operation>,
    pub cancel: CancellationToken,
    /// Exclusive access to the task's repository, held for the whole run.
    pub session: Option<Arc<RepoSession>>,
}

impl TaskExecution {
    fn require_op(&self) -> Result<Operation, TaskError> {
        self.op
            .clone()
            .ok_or_else(|| TaskError::Scheduling("task has no operation".to_string()))
    }

    pub fn require_session(&self) -> Result<Arc<RepoSession>, TaskError> {
        self.session
            .clone()
            .ok_or_else(|| TaskError::Scheduling("task runs without repository access".to_string()))
    }
}

/// A task's next occurrence: when it runs and the operation it will record.
#[derive(Debug, Clone)]
pub struct Occurrence {
    pub run_at: DateTime<Utc>,
    pub op: Option<Operation>,
}

/// Built-in work a one-off task can perform.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskWork {
    Backup,
    /// Applies the plan's retention policy, or removes one snapshot.
    Forget { snapshot_id: Option<String> },
    Prune,
    Unlock,
    Stats,
    IndexSnapshots,
    Restore {
        snapshot_id: String,
        path: String,
        target: String,
    },
}

impl TaskWork {
    fn default_priority(&self) -> i32 {
        match self {
            TaskWork::Backup => priority::BACKUP,
            TaskWork::Forget { .. } => priority::FORGET,
            TaskWork::Prune => priority::PRUNE,
            TaskWork::Unlock => priority::DEFAULT,
            TaskWork::Stats => priority::STATS,
            TaskWork::IndexSnapshots => priority::INDEX_SNAPSHOTS,
            TaskWork::Restore { .. } => priority::DEFAULT,
        }
    }

    fn default_name(&self, repo_id: &str, plan_id: Option<&str>) -> String {
        let plan = plan_id.unwrap_or("");
        match self {
            TaskWork::Backup => format!("backup for plan \"{}\"", plan),
            TaskWork::Forget { snapshot_id: None } => format!("forget for plan \"{}\"", plan),
            TaskWork::Forget {
                snapshot_id: Some(id),
            } => format!("forget snapshot \"{}\" for plan \"{}\"", id, plan),
            TaskWork::Prune => format!("prune for repo \"{}\"", repo_id),
            TaskWork::Unlock => format!("unlock repo \"{}\"", repo_id),
            TaskWork::Stats => format!("stats for repo \"{}\"", repo_id),
            TaskWork::IndexSnapshots => format!("index snapshots for repo \"{}\"", repo_id),
            TaskWork::Restore { snapshot_id, .. } => {
                format!("restore snapshot \"{}\" in repo \"{}\"", snapshot_id, repo_id)
            }
        }
    }

    /// Operation recorded for this work, if any. Indexing records one
    /// operation per discovered snapshot instead.
    fn prototype(&self, repo_id: &str, plan_id: Option<&str>) -> Option<Operation> {
        let kind = match self {
            TaskWork::Backup => OperationKind::backup(),
            TaskWork::Forget { .. } => OperationKind::Forget {
                policy: None,
                removed: Vec::new(),
            },
            TaskWork::Prune => OperationKind::Prune,
            TaskWork::Unlock => OperationKind::Unlock,
            TaskWork::Stats => OperationKind::Stats { stats: None },
            TaskWork::IndexSnapshots => return None,
            TaskWork::Restore { path, target, .. } => OperationKind::Restore {
                path: path.clone(),
                target: target.clone(),
                last_status: None,
                summary: None,
            },
        };
        let mut op = Operation::new(repo_id, plan_id, kind);
        if let TaskWork::Restore { snapshot_id, .. } | TaskWork::Forget {
            snapshot_id: Some(snapshot_id),
        } = self
        {
            op.snapshot_id = Some(snapshot_id.clone());
        }
        Some(op)
    }

    fn run(
        &self,
        target: TaskTarget,
        exec: TaskExecution,
        runner: Arc<dyn TaskRunner>,
    ) -> BoxFuture<'static, Result<(), TaskError>> {
        match self.clone() {
            TaskWork::Backup => backup::run(target, exec, runner).boxed(),
            TaskWork::Forget { snapshot_id } => {
                forget::run(target, snapshot_id, exec, runner).boxed()
            }
            TaskWork::Prune => prune::run(target, exec, runner).boxed(),
            TaskWork::Unlock => unlock::run(target, exec, runner).boxed(),
            TaskWork::Stats => stats::run(target, exec, runner).boxed(),
            TaskWork::IndexSnapshots => index_snapshots::run(target, exec, runner).boxed(),
            TaskWork::Restore {
                snapshot_id,
                path,
                target: restore_target,
            } => restore::run(target, snapshot_id, path, restore_target, exec, runner).boxed(),
        }
    }
}

/// Identity of a task as seen by its body.
#[derive(Debug, Clone)]
pub(crate) struct TaskTarget {
    pub name: String,
    pub repo_id: String,
    pub plan_id: Option<String>,
}

impl TaskTarget {
    fn require_plan_id(&self) -> Result<&str, TaskError> {
        self.plan_id
            .as_deref()
            .ok_or_else(|| TaskError::Scheduling(format!("{} is not bound to a plan", self.name)))
    }
}

/// Scheduling state shared by the one-off variants.
#[derive(Debug, Clone)]
pub struct OneoffState {
    pub name: String,
    pub repo_id: String,
    pub plan_id: Option<String>,
    pub run_at: DateTime<Utc>,
    pub priority: i32,
    /// Flow to attach the materialized operation to; 0 starts a new flow.
    pub flow_id: i64,
    pub proto_op: Option<Operation>,
    did_schedule: bool,
}

impl OneoffState {
    pub fn new(
        name: impl Into<String>,
        repo_id: impl Into<String>,
        plan_id: Option<String>,
        run_at: DateTime<Utc>,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            repo_id: repo_id.into(),
            plan_id,
            run_at,
            priority,
            flow_id: 0,
            proto_op: None,
            did_schedule: false,
        }
    }

    /// Fires once; every later call returns `None`.
    fn next(&mut self) -> Option<Occurrence> {
        if self.did_schedule {
            return None;
        }
        self.did_schedule = true;

        let op = self.proto_op.as_ref().map(|proto| {
            let mut op = proto.clone();
            op.id = 0;
            op.repo_id = self.repo_id.clone();
            op.plan_id = self
                .plan_id
                .clone()
                .unwrap_or_else(|| crate::oplog::UNASSOCIATED_PLAN.to_string());
            op.flow_id = self.flow_id;
            op.unix_time_start_ms = self.run_at.timestamp_millis();
            op.unix_time_end_ms = 0;
            op.status = OperationStatus::Pending;
            op
        });
        Some(Occurrence {
            run_at: self.run_at,
            op,
        })
    }

    fn target(&self) -> TaskTarget {
        TaskTarget {
            name: self.name.clone(),
            repo_id: self.repo_id.clone(),
            plan_id: self.plan_id.clone(),
        }
    }
}

/// A task that runs built-in work exactly once.
#[derive(Debug, Clone)]
pub struct OneoffTask {
    pub state: OneoffState,
    pub work: TaskWork,
}

impl OneoffTask {
    pub fn new(
        work: TaskWork,
        repo_id: &str,
        plan_id: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Self {
        let mut state = OneoffState::new(
            work.default_name(repo_id, plan_id),
            repo_id,
            plan_id.map(str::to_string),
            run_at,
            work.default_priority(),
        );
        state.proto_op = work.prototype(repo_id, plan_id);
        Self { state, work }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.state.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.state.priority = priority;
        self
    }

    pub fn in_flow(mut self, flow_id: i64) -> Self {
        self.state.flow_id = flow_id;
        self
    }
}

pub type GenericWork = Arc<
    dyn Fn(TaskExecution, Arc<dyn TaskRunner>) -> BoxFuture<'static, Result<(), TaskError>>
        + Send
        + Sync,
>;

/// A one-off task running caller-supplied work.
#[derive(Clone)]
pub struct GenericOneoffTask {
    pub state: OneoffState,
    pub work: GenericWork,
}

impl GenericOneoffTask {
    pub fn new(state: OneoffState, work: GenericWork) -> Self {
        Self { state, work }
    }
}

impl std::fmt::Debug for GenericOneoffTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericOneoffTask")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecurringKind {
    PlanBackup { plan_id: String },
    RepoPrune { repo_id: String },
}

/// A task whose next run is recomputed from live configuration each time.
#[derive(Debug, Clone)]
pub struct RecurringTask {
    pub kind: RecurringKind,
    repo_id: String,
    /// Configuration generation this task was created under.
    pub generation: u64,
}

impl RecurringTask {
    pub fn plan_backup(plan_id: &str, repo_id: &str, generation: u64) -> Self {
        Self {
            kind: RecurringKind::PlanBackup {
                plan_id: plan_id.to_string(),
            },
            repo_id: repo_id.to_string(),
            generation,
        }
    }

    pub fn repo_prune(repo_id: &str, generation: u64) -> Self {
        Self {
            kind: RecurringKind::RepoPrune {
                repo_id: repo_id.to_string(),
            },
            repo_id: repo_id.to_string(),
            generation,
        }
    }

    /// Recurring tasks for everything in `config` that has a schedule.
    pub fn all_for(config: &Config, generation: u64) -> Vec<RecurringTask> {
        let backups = config
            .plans
            .iter()
            .filter(|p| p.schedule.is_some())
            .map(|p| RecurringTask::plan_backup(&p.id, &p.repo, generation));
        let prunes = config
            .repos
            .iter()
            .filter(|r| r.prune_policy.as_ref().is_some_and(|p| p.schedule.is_some()))
            .map(|r| RecurringTask::repo_prune(&r.id, generation));
        backups.chain(prunes).collect()
    }

    fn work(&self) -> TaskWork {
        match self.kind {
            RecurringKind::PlanBackup { .. } => TaskWork::Backup,
            RecurringKind::RepoPrune { .. } => TaskWork::Prune,
        }
    }

    fn plan_id(&self) -> Option<&str> {
        match &self.kind {
            RecurringKind::PlanBackup { plan_id } => Some(plan_id),
            RecurringKind::RepoPrune { .. } => None,
        }
    }

    fn next(&mut self, after: DateTime<Utc>, config: &Config) -> Option<Occurrence> {
        let expr = match &self.kind {
            RecurringKind::PlanBackup { plan_id } => {
                let plan = config.get_plan(plan_id)?;
                // Follow the plan if it moved to another repo
                self.repo_id = plan.repo.clone();
                plan.schedule.clone()?
            }
            RecurringKind::RepoPrune { repo_id } => config
                .get_repo(repo_id)?
                .prune_policy
                .as_ref()?
                .schedule
                .clone()?,
        };
        let run_at = match schedule::next_after(&expr, after) {
            Ok(run_at) => run_at?,
            Err(e) => {
                warn!("Not scheduling {}: {:#}", self.name(), e);
                return None;
            }
        };

        let mut op = self.work().prototype(&self.repo_id, self.plan_id())?;
        op.unix_time_start_ms = run_at.timestamp_millis();
        Some(Occurrence {
            run_at,
            op: Some(op),
        })
    }

    fn name(&self) -> String {
        self.work().default_name(&self.repo_id, self.plan_id())
    }
}

/// The closed set of task variants the scheduler understands.
#[derive(Debug, Clone)]
pub enum Task {
    Oneoff(OneoffTask),
    GenericOneoff(GenericOneoffTask),
    Recurring(RecurringTask),
}

impl Task {
    pub fn name(&self) -> String {
        match self {
            Task::Oneoff(t) => t.state.name.clone(),
            Task::GenericOneoff(t) => t.state.name.clone(),
            Task::Recurring(t) => t.name(),
        }
    }

    pub fn repo_id(&self) -> &str {
        match self {
            Task::Oneoff(t) => &t.state.repo_id,
            Task::GenericOneoff(t) => &t.state.repo_id,
            Task::Recurring(t) => &t.repo_id,
        }
    }

    pub fn plan_id(&self) -> Option<&str> {
        match self {
            Task::Oneoff(t) => t.state.plan_id.as_deref(),
            Task::GenericOneoff(t) => t.state.plan_id.as_deref(),
            Task::Recurring(t) => t.plan_id(),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Task::Oneoff(t) => t.state.priority,
            Task::GenericOneoff(t) => t.state.priority,
            Task::Recurring(t) => t.work().default_priority(),
        }
    }

    /// Computes the next occurrence at or after `after`. `None` means the
    /// task is never scheduled again.
    pub fn next(&mut self, after: DateTime<Utc>, config: &Config) -> Option<Occurrence> {
        match self {
            Task::Oneoff(t) => t.state.next(),
            Task::GenericOneoff(t) => t.state.next(),
            Task::Recurring(t) => t.next(after, config),
        }
    }

    pub fn run(
        &self,
        exec: TaskExecution,
        runner: Arc<dyn TaskRunner>,
    ) -> BoxFuture<'static, Result<(), TaskError>> {
        match self {
            Task::Oneoff(t) => t.work.run(t.state.target(), exec, runner),
            Task::GenericOneoff(t) => (t.work)(exec, runner),
            Task::Recurring(t) => {
                let target = TaskTarget {
                    name: t.name(),
                    repo_id: t.repo_id.clone(),
                    plan_id: t.plan_id().map(str::to_string),
                };
                t.work().run(target, exec, runner)
            }
        }
    }
}

/// Marks `op` RUNNING with a fresh start time.
fn start_operation(runner: &dyn TaskRunner, op: &mut Operation) -> Result<(), TaskError> {
    op.status = OperationStatus::Running;
    op.unix_time_start_ms = now_ms();
    runner.update_operation(op)
}

/// Records the terminal status matching `result`. A WARNING set by the body
/// survives a successful result.
pub(crate) fn finish_operation(
    runner: &dyn TaskRunner,
    op: &mut Operation,
    result: &Result<(), TaskError>,
) -> Result<(), TaskError> {
    op.unix_time_end_ms = now_ms();
    match result {
        Ok(()) => {
            if op.status != OperationStatus::Warning {
                op.status = OperationStatus::Success;
            }
        }
        Err(e) if e.is_cancelled() => {
            op.status = OperationStatus::UserCancelled;
            op.display_message = "operation cancelled".to_string();
        }
        Err(e) => {
            op.status = OperationStatus::Error;
            op.display_message = e.to_string();
        }
    }
    runner.update_operation(op)
}

/// Writes the latest progress record into `op` at most once per
/// [`PROGRESS_INTERVAL`], until the sending side is dropped. A record held
/// back by the interval is written on the way out. Returns the last record
/// seen so the body can carry it into the terminal write.
async fn write_progress<T, F>(
    runner: Arc<dyn TaskRunner>,
    mut op: Operation,
    mut updates: watch::Receiver<Option<T>>,
    apply: F,
) -> Option<T>
where
    T: Clone,
    F: Fn(&mut Operation, T),
{
    let mut last_write: Option<Instant> = None;
    let mut held_back = false;
    while updates.changed().await.is_ok() {
        if last_write.is_some_and(|t| t.elapsed() < PROGRESS_INTERVAL) {
            held_back = true;
            continue;
        }
        let latest = updates.borrow_and_update().clone();
        if let Some(latest) = latest {
            record_progress(runner.as_ref(), &mut op, latest, &apply);
            last_write = Some(Instant::now());
            held_back = false;
        }
    }

    let latest = updates.borrow().clone();
    if held_back {
        if let Some(latest) = latest.clone() {
            record_progress(runner.as_ref(), &mut op, latest, &apply);
        }
    }
    latest
}

fn record_progress<T, F>(runner: &dyn TaskRunner, op: &mut Operation, record: T, apply: &F)
where
    F: Fn(&mut Operation, T),
{
    apply(op, record);
    if let Err(e) = runner.update_operation(op) {
        warn!("Failed to record progress for operation {}: {}", op.id, e);
    }
    debug!("Recorded progress for operation {}", op.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::{plan, repo};
    use crate::config::PrunePolicy;
    use chrono::Duration as ChronoDuration;

    fn config() -> Config {
        let mut scheduled = plan("p1", "r1");
        scheduled.schedule = Some("0 * * * *".to_string());
        let mut r2 = repo("r2");
        r2.prune_policy = Some(PrunePolicy {
            schedule: Some("0 3 * * *".to_string()),
            max_unused_percent: None,
        });
        Config {
            repos: vec![repo("r1"), r2],
            plans: vec![scheduled, plan("p2", "r1")],
        }
    }

    #[test]
    fn test_oneoff_fires_once() {
        let run_at = Utc::now();
        let mut task = Task::Oneoff(OneoffTask::new(TaskWork::Backup, "r1", Some("p1"), run_at));

        let first = task.next(Utc::now(), &config()).unwrap();
        assert_eq!(first.run_at, run_at);
        let op = first.op.unwrap();
        assert_eq!(op.repo_id, "r1");
        assert_eq!(op.plan_id, "p1");
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.unix_time_start_ms, run_at.timestamp_millis());

        for _ in 0..3 {
            assert!(task.next(Utc::now(), &config()).is_none());
        }
    }

    #[test]
    fn test_oneoff_stamps_flow_and_resets_status() {
        let mut oneoff = OneoffTask::new(
            TaskWork::Forget { snapshot_id: None },
            "r1",
            Some("p1"),
            Utc::now(),
        )
        .in_flow(42);
        if let Some(proto) = oneoff.state.proto_op.as_mut() {
            proto.status = OperationStatus::Error;
            proto.id = 7;
        }

        let op = Task::Oneoff(oneoff).next(Utc::now(), &config()).unwrap().op.unwrap();
        assert_eq!(op.flow_id, 42);
        assert_eq!(op.id, 0);
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[test]
    fn test_index_snapshots_has_no_operation() {
        let mut task = Task::Oneoff(OneoffTask::new(
            TaskWork::IndexSnapshots,
            "r1",
            None,
            Utc::now(),
        ));
        let occurrence = task.next(Utc::now(), &config()).unwrap();
        assert!(occurrence.op.is_none());
        assert!(task.next(Utc::now(), &config()).is_none());
    }

    #[test]
    fn test_recurring_follows_live_config() {
        let now = Utc::now();
        let mut task = Task::Recurring(RecurringTask::plan_backup("p1", "r1", 1));
        let occurrence = task.next(now, &config()).unwrap();
        assert!(occurrence.run_at > now);
        assert!(occurrence.run_at <= now + ChronoDuration::hours(1));
        assert_eq!(occurrence.op.unwrap().plan_id, "p1");

        // Still schedulable after it ran
        assert!(task.next(occurrence.run_at, &config()).is_some());

        let mut without_schedule = config();
        without_schedule.plans[0].schedule = None;
        assert!(task.next(now, &without_schedule).is_none());

        let mut removed = config();
        removed.plans.remove(0);
        assert!(task.next(now, &removed).is_none());
    }

    #[test]
    fn test_recurring_tasks_from_config() {
        let tasks = RecurringTask::all_for(&config(), 3);
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[0].kind,
            RecurringKind::PlanBackup {
                plan_id: "p1".to_string()
            }
        );
        assert_eq!(
            tasks[1].kind,
            RecurringKind::RepoPrune {
                repo_id: "r2".to_string()
            }
        );
        assert!(tasks.iter().all(|t| t.generation == 3));
        assert_eq!(Task::Recurring(tasks[1].clone()).priority(), priority::PRUNE);
    }

    #[test]
    fn test_default_names_and_priorities() {
        let task = Task::Oneoff(OneoffTask::new(TaskWork::Backup, "r1", Some("p1"), Utc::now()));
        assert_eq!(task.name(), "backup for plan \"p1\"");
        assert_eq!(task.priority(), priority::BACKUP);

        let interactive = OneoffTask::new(TaskWork::Stats, "r1", None, Utc::now())
            .with_priority(priority::INTERACTIVE)
            .with_name("stats now");
        let task = Task::Oneoff(interactive);
        assert_eq!(task.name(), "stats now");
        assert_eq!(task.priority(), priority::INTERACTIVE);
        assert_eq!(task.plan_id(), None);
    }

    /// Keeps the display message of every update it is asked to write.
    #[derive(Default)]
    struct RecordingRunner {
        writes: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl TaskRunner for RecordingRunner {
        fn create_operation(&self, _op: &mut Operation) -> Result<(), TaskError> {
            unimplemented!()
        }

        fn update_operation(&self, op: &Operation) -> Result<(), TaskError> {
            self.writes.lock().unwrap().push(op.display_message.clone());
            Ok(())
        }

        async fn execute_hooks(
            &self,
            _repo_id: &str,
            _plan_id: Option<&str>,
            _condition: crate::hook::HookCondition,
            _vars: &crate::hook::HookVars,
        ) -> Result<(), TaskError> {
            Ok(())
        }

        fn oplog(&self) -> Arc<crate::oplog::OpLog> {
            unimplemented!()
        }

        fn get_repo(&self, _repo_id: &str) -> Result<crate::config::RepoConfig, TaskError> {
            unimplemented!()
        }

        fn get_plan(&self, _plan_id: &str) -> Result<crate::config::PlanConfig, TaskError> {
            unimplemented!()
        }

        fn get_repo_orchestrator(
            &self,
            _repo_id: &str,
        ) -> Result<Arc<super::super::repo::RepoOrchestrator>, TaskError> {
            unimplemented!()
        }

        fn schedule_task(&self, _task: Task) -> Result<(), TaskError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_progress_held_back_by_interval_is_written_on_exit() {
        let runner = Arc::new(RecordingRunner::default());
        let mut op = Operation::new("r1", None, OperationKind::Unlock);
        op.id = 1;

        let (tx, rx) = watch::channel::<Option<u32>>(None);
        let writer = tokio::spawn(write_progress(
            runner.clone(),
            op,
            rx,
            |op: &mut Operation, n: u32| op.display_message = format!("progress {}", n),
        ));

        tx.send_replace(Some(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(Some(99));
        drop(tx);

        assert_eq!(writer.await.unwrap(), Some(99));
        let writes = runner.writes.lock().unwrap().clone();
        assert!(writes.len() <= 2);
        assert_eq!(writes.last().map(String::as_str), Some("progress 99"));
    }

    #[tokio::test]
    async fn test_no_progress_means_no_writes() {
        let runner = Arc::new(RecordingRunner::default());
        let op = Operation::new("r1", None, OperationKind::Unlock);

        let (tx, rx) = watch::channel::<Option<u32>>(None);
        let writer = tokio::spawn(write_progress(
            runner.clone(),
            op,
            rx,
            |_: &mut Operation, _: u32| {},
        ));
        drop(tx);

        assert_eq!(writer.await.unwrap(), None);
        assert!(runner.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancellation_is_recognised_through_restic() {
        assert!(TaskError::Cancelled.is_cancelled());
        assert!(TaskError::Restic(ResticError::Cancelled).is_cancelled());
        assert!(!TaskError::Scheduling("x".to_string()).is_cancelled());
    }
}
