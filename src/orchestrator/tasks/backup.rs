use super::{
    finish_operation, start_operation, write_progress, OneoffTask, Task, TaskError,
    TaskExecution, TaskTarget, TaskWork,
};
use crate::hook::{HookCondition, HookVars};
use crate::oplog::{Operation, OperationKind, OperationStatus};
use crate::orchestrator::runner::TaskRunner;
use crate::restic::BackupStatus;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

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
        plan_id: target.plan_id.clone(),
        ..Default::default()
    };

    let result = backup(&target, &exec, runner.clone(), &mut op, &mut vars).await;

    let condition = match &result {
        Ok(()) if op.status == OperationStatus::Warning => HookCondition::SnapshotWarning,
        Ok(()) => HookCondition::SnapshotSuccess,
        Err(e) => {
            vars.error = Some(e.to_string());
            HookCondition::SnapshotError
        }
    };
    let mut conditions = vec![condition, HookCondition::SnapshotEnd];
    if result.is_err() {
        conditions.push(HookCondition::AnyError);
    }
    for condition in conditions {
        // Best effort once the backup itself is over
        if let Err(e) = runner
            .execute_hooks(&target.repo_id, target.plan_id.as_deref(), condition, &vars)
            .await
        {
            warn!("{} hook for {} failed: {}", condition.as_str(), target.name, e);
        }
    }

    finish_operation(runner.as_ref(), &mut op, &result)?;

    if result.is_ok() {
        if let Err(e) = schedule_follow_ups(&target, runner.as_ref(), op.flow_id) {
            warn!("Failed to schedule follow-ups for {}: {}", target.name, e);
        }
    }
    result
}

async fn backup(
    target: &TaskTarget,
    exec: &TaskExecution,
    runner: Arc<dyn TaskRunner>,
    op: &mut Operation,
    vars: &mut HookVars,
) -> Result<(), TaskError> {
    let plan = runner.get_plan(target.require_plan_id()?)?;
    let session = exec.require_session()?;

    if session.config().auto_unlock {
        info!("Unlocking repo {} before backup", target.repo_id);
        session.unlock(&exec.cancel).await?;
    }

    runner
        .execute_hooks(
            &target.repo_id,
            Some(&plan.id),
            HookCondition::SnapshotStart,
            vars,
        )
        .await?;

    let (progress_tx, progress_rx) = watch::channel::<Option<BackupStatus>>(None);
    let progress = tokio::spawn(write_progress(
        runner.clone(),
        op.clone(),
        progress_rx,
        record_status,
    ));

    let outcome = session
        .backup(&plan, &exec.cancel, |status| {
            progress_tx.send_replace(Some(status.clone()));
        })
        .await;
    drop(progress_tx);
    // Progress writes must not land after the terminal write
    match progress.await {
        Ok(Some(status)) => record_status(op, status),
        Ok(None) => {}
        Err(e) => warn!("Progress writer for {} failed: {}", target.name, e),
    }
    let outcome = outcome?;

    op.snapshot_id = outcome.summary.snapshot_id.clone();
    vars.snapshot_id = op.snapshot_id.clone();
    vars.summary = serde_json::to_string(&outcome.summary).ok();
    if outcome.incomplete {
        op.status = OperationStatus::Warning;
        op.display_message = "snapshot is incomplete, some files could not be read".to_string();
    }
    if let OperationKind::Backup { summary, .. } = &mut op.op {
        *summary = Some(outcome.summary);
    }
    info!(
        "Backup of plan {} created snapshot {}",
        plan.id,
        op.snapshot_id.as_deref().unwrap_or("<none>")
    );
    Ok(())
}

fn record_status(op: &mut Operation, status: BackupStatus) {
    if let OperationKind::Backup { last_status, .. } = &mut op.op {
        *last_status = Some(status);
    }
}

/// Applies retention and indexes the new snapshot, both in the backup's flow.
fn schedule_follow_ups(
    target: &TaskTarget,
    runner: &dyn TaskRunner,
    flow_id: i64,
) -> Result<(), TaskError> {
    let plan_id = target.require_plan_id()?;
    let plan = runner.get_plan(plan_id)?;
    let now = Utc::now();

    if plan.retention.as_ref().is_some_and(|r| !r.is_empty()) {
        let forget = OneoffTask::new(
            TaskWork::Forget { snapshot_id: None },
            &target.repo_id,
            Some(plan_id),
            now,
        )
        .in_flow(flow_id);
        runner.schedule_task(Task::Oneoff(forget))?;
    }

    let index = OneoffTask::new(TaskWork::IndexSnapshots, &target.repo_id, None, now);
    runner.schedule_task(Task::Oneoff(index))?;
    Ok(())
}
