use super::repo::RepoOrchestrator;
use super::tasks::{Task, TaskError};
use crate::config::{PlanConfig, RepoConfig};
use crate::hook::{HookCondition, HookVars};
use crate::oplog::{OpLog, OpLogError, Operation};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a task body may do outside its own repository session.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Persists `op` and assigns its id. Must precede any update.
    fn create_operation(&self, op: &mut Operation) -> Result<(), TaskError>;

    fn update_operation(&self, op: &Operation) -> Result<(), TaskError>;

    /// Runs the repository's and, when given, the plan's hooks registered
    /// for `condition`.
    async fn execute_hooks(
        &self,
        repo_id: &str,
        plan_id: Option<&str>,
        condition: HookCondition,
        vars: &HookVars,
    ) -> Result<(), TaskError>;

    fn oplog(&self) -> Arc<OpLog>;

    fn get_repo(&self, repo_id: &str) -> Result<RepoConfig, TaskError>;

    fn get_plan(&self, plan_id: &str) -> Result<PlanConfig, TaskError>;

    fn get_repo_orchestrator(&self, repo_id: &str) -> Result<Arc<RepoOrchestrator>, TaskError>;

    /// Queues a follow-on task.
    fn schedule_task(&self, task: Task) -> Result<(), TaskError>;
}

/// Contract violations in the operation lifecycle are scheduling errors;
/// everything else stays an oplog error.
pub(crate) fn oplog_error(e: OpLogError) -> TaskError {
    match e {
        OpLogError::NotAssigned | OpLogError::AlreadyAssigned(_) => {
            TaskError::Scheduling(e.to_string())
        }
        other => TaskError::OpLog(other),
    }
}
