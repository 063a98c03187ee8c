use super::{finish_operation, start_operation, TaskError, TaskExecution, TaskTarget};
use crate::hook::{HookCondition, HookVars};
use crate::oplog::{OpSelector, Operation, OperationKind, SnapshotInfo};
use crate::orchestrator::runner::TaskRunner;
use std::sync::Arc;
use tracing::{info, warn};

/// Removes snapshots by the plan's retention policy, or the single
/// `snapshot_id` when one is given.
pub(super) async fn run(
    target: TaskTarget,
    snapshot_id: Option<String>,
    exec: TaskExecution,
    runner: Arc<dyn TaskRunner>,
) -> Result<(), TaskError> {
    let mut op = exec.require_op()?;
    start_operation(runner.as_ref(), &mut op)?;

    let mut vars = HookVars {
        task: target.name.clone(),
        repo_id: target.repo_id.clone(),
        plan_id: target.plan_id.clone(),
        snapshot_id: snapshot_id.clone(),
        ..Default::default()
    };

    let result = match runner
        .execute_hooks(
            &target.repo_id,
            target.plan_id.as_deref(),
            HookCondition::ForgetStart,
            &vars,
        )
        .await
    {
        Ok(()) => forget(&target, snapshot_id.as_deref(), &exec, runner.as_ref(), &mut op).await,
        Err(e) => Err(e),
    };

    let mut conditions = vec![HookCondition::ForgetSuccess];
    if let Err(e) = &result {
        vars.error = Some(e.to_string());
        conditions = vec![HookCondition::ForgetError, HookCondition::AnyError];
    }
    for condition in conditions {
        if let Err(e) = runner
            .execute_hooks(&target.repo_id, target.plan_id.as_deref(), condition, &vars)
            .await
        {
            warn!("{} hook for {} failed: {}", condition.as_str(), target.name, e);
        }
    }

    finish_operation(runner.as_ref(), &mut op, &result)?;
    result
}

async fn forget(
    target: &TaskTarget,
    snapshot_id: Option<&str>,
    exec: &TaskExecution,
    runner: &dyn TaskRunner,
    op: &mut Operation,
) -> Result<(), TaskError> {
    let session = exec.require_session()?;

    let (policy, removed) = match snapshot_id {
        Some(id) => {
            session.forget_snapshot(id, &exec.cancel).await?;
            (
                None,
                indexed_snapshot(runner, &target.repo_id, id)?
                    .into_iter()
                    .collect::<Vec<_>>(),
            )
        }
        None => {
            let plan = runner.get_plan(target.require_plan_id()?)?;
            let Some(policy) = plan.retention.filter(|p| !p.is_empty()) else {
                return Err(TaskError::Config(format!(
                    "plan {} has no retention policy",
                    plan.id
                )));
            };
            let removed = session
                .forget_by_policy(&plan.id, &policy, &exec.cancel)
                .await?
                .iter()
                .map(|s| s.to_snapshot_info())
                .collect::<Result<Vec<_>, _>>()?;
            (Some(policy), removed)
        }
    };

    info!(
        "Forgot {} snapshot(s) in repo {}",
        removed.len(),
        target.repo_id
    );
    op.display_message = format!("removed {} snapshot(s)", removed.len());
    op.op = OperationKind::Forget { policy, removed };
    Ok(())
}

/// The indexed record of `snapshot_id`, if the repo has been indexed since
/// it was taken.
fn indexed_snapshot(
    runner: &dyn TaskRunner,
    repo_id: &str,
    snapshot_id: &str,
) -> Result<Option<SnapshotInfo>, TaskError> {
    let selector = OpSelector {
        repo_id: Some(repo_id.to_string()),
        snapshot_id: Some(snapshot_id.to_string()),
        ..Default::default()
    };
    let ops = runner.oplog().query(&selector)?;
    Ok(ops.into_iter().find_map(|op| match op.op {
        OperationKind::IndexSnapshot { snapshot } => Some(snapshot),
        _ => None,
    }))
}
