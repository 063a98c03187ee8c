//! End-to-end tests for backups and the work they trigger.
#![cfg(unix)]

mod common;

use backup_orchestrator::config::{HookConfig, HookErrorPolicy, RetentionPolicy};
use backup_orchestrator::hook::HookCondition;
use backup_orchestrator::oplog::{OperationKind, OperationStatus};
use common::{verbs, TestOrchestrator, OLD_SNAPSHOT_ID, PLAN_A, PLAN_B, REPO_ID, SNAPSHOT_ID};

fn index_ops(ops: &[backup_orchestrator::Operation]) -> usize {
    ops.iter()
        .filter(|op| matches!(op.op, OperationKind::IndexSnapshot { .. }))
        .count()
}

#[tokio::test]
async fn test_backup_records_snapshot_and_indexes_it_in_its_flow() {
    let harness = TestOrchestrator::spawn(&verbs::defaults()).await;

    let op_id = harness.orchestrator.backup_now(PLAN_A).unwrap().unwrap();
    let backup = harness.wait_for_terminal(op_id).await;

    assert_eq!(backup.status, OperationStatus::Success);
    assert_eq!(backup.snapshot_id.as_deref(), Some(SNAPSHOT_ID));
    assert!(backup.unix_time_end_ms >= backup.unix_time_start_ms);
    match &backup.op {
        OperationKind::Backup { summary, .. } => {
            assert_eq!(summary.as_ref().unwrap().total_files_processed, 2);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let ops = harness
        .wait_for_ops("both snapshots to be indexed", |ops| index_ops(ops) == 2)
        .await;
    let indexed_new = ops
        .iter()
        .find(|op| {
            matches!(op.op, OperationKind::IndexSnapshot { .. })
                && op.snapshot_id.as_deref() == Some(SNAPSHOT_ID)
        })
        .unwrap();
    assert_eq!(indexed_new.flow_id, backup.flow_id);
    assert_eq!(indexed_new.plan_id, PLAN_A);
    assert_eq!(indexed_new.status, OperationStatus::Success);
    assert_eq!(indexed_new.unix_time_start_ms, 1699672457053);

    let indexed_old = ops
        .iter()
        .find(|op| op.snapshot_id.as_deref() == Some(OLD_SNAPSHOT_ID))
        .unwrap();
    assert_eq!(indexed_old.plan_id, PLAN_B);
    assert_eq!(indexed_old.flow_id, indexed_old.id);

    let backup_call = harness
        .invocations()
        .into_iter()
        .find(|line| line.starts_with("backup"))
        .unwrap();
    assert!(backup_call.contains("--tag plan:plan-a"));
    assert!(backup_call.ends_with("/data"));
}

#[tokio::test]
async fn test_indexing_twice_adds_nothing_new() {
    let mut harness = TestOrchestrator::spawn(&verbs::defaults()).await;

    harness.orchestrator.index_snapshots_now(REPO_ID).unwrap();
    harness
        .wait_for_ops("first index", |ops| index_ops(ops) == 2)
        .await;

    harness.orchestrator.index_snapshots_now(REPO_ID).unwrap();
    harness
        .wait_for_ops("second index run", |_| {
            harness
                .invocations()
                .iter()
                .filter(|l| l.starts_with("snapshots"))
                .count()
                == 2
        })
        .await;
    // Waits for the second run to finish writing
    harness.stop().await;
    assert_eq!(index_ops(&harness.operations()), 2);
}

#[tokio::test]
async fn test_retention_forget_runs_in_the_backup_flow() {
    let harness = TestOrchestrator::spawn_with(&verbs::defaults(), |config| {
        config.plans[0].retention = Some(RetentionPolicy {
            keep_last: Some(1),
            ..Default::default()
        });
    })
    .await;

    let op_id = harness.orchestrator.backup_now(PLAN_A).unwrap().unwrap();
    let backup = harness.wait_for_terminal(op_id).await;
    assert_eq!(backup.status, OperationStatus::Success);

    let ops = harness
        .wait_for_ops("the forget to finish", |ops| {
            ops.iter().any(|op| {
                matches!(op.op, OperationKind::Forget { .. }) && op.is_terminal()
            })
        })
        .await;
    let forget = ops
        .iter()
        .find(|op| matches!(op.op, OperationKind::Forget { .. }))
        .unwrap();
    assert_eq!(forget.status, OperationStatus::Success);
    assert_eq!(forget.flow_id, backup.flow_id);
    match &forget.op {
        OperationKind::Forget { policy, removed } => {
            assert_eq!(policy.as_ref().unwrap().keep_last, Some(1));
            assert_eq!(removed.len(), 1);
            assert_eq!(removed[0].id, OLD_SNAPSHOT_ID);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let forget_call = harness
        .invocations()
        .into_iter()
        .find(|line| line.starts_with("forget"))
        .unwrap();
    assert!(forget_call.contains("--tag plan:plan-a"));
    assert!(forget_call.contains("--keep-last 1"));
}

#[tokio::test]
async fn test_failed_backup_is_recorded_and_later_tasks_still_run() {
    let verbs = verbs::with(
        "backup",
        "echo 'Fatal: unable to open config file' >&2\nexit 1",
    );
    let harness = TestOrchestrator::spawn(&verbs).await;

    let op_id = harness.orchestrator.backup_now(PLAN_A).unwrap().unwrap();
    let backup = harness.wait_for_terminal(op_id).await;
    assert_eq!(backup.status, OperationStatus::Error);
    assert!(backup.display_message.contains("status 1"));
    assert!(backup.display_message.contains("unable to open config file"));

    let stats_id = harness.orchestrator.stats_now(REPO_ID).unwrap().unwrap();
    let stats = harness.wait_for_terminal(stats_id).await;
    assert_eq!(stats.status, OperationStatus::Success);
    match &stats.op {
        OperationKind::Stats { stats } => {
            assert_eq!(stats.as_ref().unwrap().total_size, 1024);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // A failed backup triggers no follow-up work
    assert_eq!(index_ops(&harness.operations()), 0);
}

#[tokio::test]
async fn test_missing_summary_is_an_error() {
    let verbs = verbs::with(
        "backup",
        r#"echo '{"message_type":"status","percent_done":0.5}'"#,
    );
    let harness = TestOrchestrator::spawn(&verbs).await;

    let op_id = harness.orchestrator.backup_now(PLAN_A).unwrap().unwrap();
    let backup = harness.wait_for_terminal(op_id).await;
    assert_eq!(backup.status, OperationStatus::Error);
    assert!(backup.display_message.contains("summary"));
}

#[tokio::test]
async fn test_incomplete_backup_is_a_warning() {
    let verbs = verbs::with("backup", format!("{}\nexit 3", verbs::backup_ok()));
    let harness = TestOrchestrator::spawn(&verbs).await;

    let op_id = harness.orchestrator.backup_now(PLAN_A).unwrap().unwrap();
    let backup = harness.wait_for_terminal(op_id).await;
    assert_eq!(backup.status, OperationStatus::Warning);
    assert_eq!(backup.snapshot_id.as_deref(), Some(SNAPSHOT_ID));
}

#[tokio::test]
async fn test_fatal_start_hook_aborts_backup() {
    let temp_hooks = tempfile::TempDir::new().unwrap();
    let hook_log = temp_hooks.path().join("hooks.log");
    let record = format!("echo \"$BACKUP_EVENT $BACKUP_PLAN_ID\" >> {}", hook_log.display());

    let harness = TestOrchestrator::spawn_with(&verbs::defaults(), |config| {
        config.plans[0].hooks = vec![
            HookConfig {
                conditions: vec![HookCondition::SnapshotStart],
                command: "exit 7".to_string(),
                on_error: HookErrorPolicy::Fatal,
            },
            HookConfig {
                conditions: vec![HookCondition::SnapshotError, HookCondition::SnapshotEnd],
                command: record.clone(),
                on_error: HookErrorPolicy::Ignore,
            },
        ];
    })
    .await;

    let op_id = harness.orchestrator.backup_now(PLAN_A).unwrap().unwrap();
    let backup = harness.wait_for_terminal(op_id).await;
    assert_eq!(backup.status, OperationStatus::Error);
    assert!(backup.display_message.contains("exit 7"));

    assert!(!harness
        .invocations()
        .iter()
        .any(|line| line.starts_with("backup")));
    let events = std::fs::read_to_string(&hook_log).unwrap();
    assert_eq!(events, "SNAPSHOT_ERROR plan-a\nSNAPSHOT_END plan-a\n");
}
