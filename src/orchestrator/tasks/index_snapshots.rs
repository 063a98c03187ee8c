use super::{TaskError, TaskExecution, TaskTarget};
use crate::oplog::{now_ms, OpSelector, Operation, OperationKind, OperationStatus};
use crate::orchestrator::runner::TaskRunner;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Records one IndexSnapshot operation for every snapshot in the repository
/// that the log has not seen yet.
pub(super) async fn run(
    target: TaskTarget,
    exec: TaskExecution,
    runner: Arc<dyn TaskRunner>,
) -> Result<(), TaskError> {
    let session = exec.require_session()?;
    let snapshots = session.snapshots(None, &exec.cancel).await?;

    let known = runner.oplog().query(&OpSelector {
        repo_id: Some(target.repo_id.clone()),
        ..Default::default()
    })?;
    let indexed: HashSet<&str> = known
        .iter()
        .filter(|op| matches!(op.op, OperationKind::IndexSnapshot { .. }))
        .filter_map(|op| op.snapshot_id.as_deref())
        .collect();
    // Flow of the backup that produced each snapshot
    let flows: HashMap<&str, i64> = known
        .iter()
        .filter(|op| matches!(op.op, OperationKind::Backup { .. }))
        .filter_map(|op| op.snapshot_id.as_deref().map(|id| (id, op.flow_id)))
        .collect();

    let mut added = 0;
    for snapshot in &snapshots {
        if indexed.contains(snapshot.id.as_str()) {
            continue;
        }
        let info = snapshot.to_snapshot_info()?;
        let mut op = Operation::new(
            &target.repo_id,
            snapshot.plan_id(),
            OperationKind::IndexSnapshot { snapshot: info },
        );
        op.snapshot_id = Some(snapshot.id.clone());
        op.flow_id = flows.get(snapshot.id.as_str()).copied().unwrap_or(0);
        op.status = OperationStatus::Success;
        op.unix_time_start_ms = snapshot.unix_time_ms()?;
        op.unix_time_end_ms = now_ms();
        runner.create_operation(&mut op)?;
        debug!("Indexed snapshot {} as operation {}", snapshot.id, op.id);
        added += 1;
    }

    info!(
        "Indexed {} new of {} snapshot(s) in repo {}",
        added,
        snapshots.len(),
        target.repo_id
    );
    Ok(())
}
