use super::{finish_operation, start_operation, TaskError, TaskExecution, TaskTarget};
use crate::orchestrator::runner::TaskRunner;
use std::sync::Arc;
use tracing::info;

pub(super) async fn run(
    target: TaskTarget,
    exec: TaskExecution,
    runner: Arc<dyn TaskRunner>,
) -> Result<(), TaskError> {
    let mut op = exec.require_op()?;
    start_operation(runner.as_ref(), &mut op)?;

    let result = async {
        let session = exec.require_session()?;
        let output = session.unlock(&exec.cancel).await?;
        info!("Unlocked repo {}", target.repo_id);
        op.display_message = output.trim().to_string();
        Ok::<(), TaskError>(())
    }
    .await;

    finish_operation(runner.as_ref(), &mut op, &result)?;
    result
}
