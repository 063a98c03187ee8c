use super::{
    finish_operation, start_operation, write_progress, TaskError, TaskExecution, TaskTarget,
};
use crate::oplog::{Operation, OperationKind};
use crate::orchestrator::runner::TaskRunner;
use crate::restic::RestoreProgress;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub(super) async fn run(
    target: TaskTarget,
    snapshot_id: String,
    path: String,
    restore_target: String,
    exec: TaskExecution,
    runner: Arc<dyn TaskRunner>,
) -> Result<(), TaskError> {
    let mut op = exec.require_op()?;
    start_operation(runner.as_ref(), &mut op)?;

    let result = async {
        let session = exec.require_session()?;

        let (progress_tx, progress_rx) = watch::channel::<Option<RestoreProgress>>(None);
        let progress = tokio::spawn(write_progress(
            runner.clone(),
            op.clone(),
            progress_rx,
            record_status,
        ));

        let restored = session
            .restore(&snapshot_id, &path, &restore_target, &exec.cancel, |status| {
                progress_tx.send_replace(Some(status.clone()));
            })
            .await;
        drop(progress_tx);
        match progress.await {
            Ok(Some(status)) => record_status(&mut op, status),
            Ok(None) => {}
            Err(e) => warn!("Progress writer for {} failed: {}", target.name, e),
        }
        let summary = restored?;

        info!(
            "Restored {} file(s) from snapshot {} to {}",
            summary.files_restored, snapshot_id, restore_target
        );
        if let OperationKind::Restore {
            summary: recorded, ..
        } = &mut op.op
        {
            *recorded = Some(summary);
        }
        Ok::<(), TaskError>(())
    }
    .await;

    finish_operation(runner.as_ref(), &mut op, &result)?;
    result
}

fn record_status(op: &mut Operation, status: RestoreProgress) {
    if let OperationKind::Restore { last_status, .. } = &mut op.op {
        *last_status = Some(status);
    }
}
