use super::{finish_operation, start_operation, TaskError, TaskExecution, TaskTarget};
use crate::hook::{HookCondition, HookVars};
use crate::orchestrator::runner::TaskRunner;
use std::sync::Arc;
use tracing::warn;

pub(super) async fn run(
    target: TaskTarget,
    exec: TaskExecution,
    runner: Arc<dyn TaskRunner>,
) -> Result<(), TaskError> {
    let mut op = exec.require_op()?;
    start_operation(runner.as_ref(), &mut op)?;

    let mut vars = HookVars {
        task: target.name.clone(),
        repo_id: target.repo_id.clone(),
        ..Default::default()
    };

    let mut result = runner
        .execute_hooks(&target.repo_id, None, HookCondition::PruneStart, &vars)
        .await;
    if result.is_ok() {
        result = async {
            let session = exec.require_session()?;
            let output = session.prune(&exec.cancel).await?;
            op.logref = Some(runner.oplog().write_log(output.as_bytes())?);
            Ok::<(), TaskError>(())
        }
        .await;
    }

    let conditions = match &result {
        Ok(()) => vec![HookCondition::PruneSuccess],
        Err(e) => {
            vars.error = Some(e.to_string());
            vec![HookCondition::PruneError, HookCondition::AnyError]
        }
    };
    for condition in conditions {
        if let Err(e) = runner
            .execute_hooks(&target.repo_id, None, condition, &vars)
            .await
        {
            warn!("{} hook for {} failed: {}", condition.as_str(), target.name, e);
        }
    }

    finish_operation(runner.as_ref(), &mut op, &result)?;
    result
}
