use super::{finish_operation, start_operation, TaskError, TaskExecution, TaskTarget};
use crate::oplog::OperationKind;
use crate::orchestrator::runner::TaskRunner;
use std::sync::Arc;
use tracing::debug;

pub(super) async fn run(
    target: TaskTarget,
    exec: TaskExecution,
    runner: Arc<dyn TaskRunner>,
) -> Result<(), TaskError> {
    let mut op = exec.require_op()?;
    start_operation(runner.as_ref(), &mut op)?;

    let result = async {
        let session = exec.require_session()?;
        let stats = session.stats(&exec.cancel).await?;
        debug!("Repo {} stats: {:?}", target.repo_id, stats);
        op.op = OperationKind::Stats { stats: Some(stats) };
        Ok::<(), TaskError>(())
    }
    .await;

    finish_operation(runner.as_ref(), &mut op, &result)?;
    result
}
