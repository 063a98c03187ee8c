use crate::config::RetentionPolicy;
use crate::restic::{BackupStatus, BackupSummary, RepoStats, RestoreProgress};
use serde::{Deserialize, Serialize};

/// Plan id recorded on operations that are not tied to any plan.
pub const UNASSOCIATED_PLAN: &str = "_unassociated_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Warning,
    Error,
    UserCancelled,
    SystemCancelled,
}

impl OperationStatus {
    pub const TERMINAL: [OperationStatus; 5] = [
        OperationStatus::Success,
        OperationStatus::Warning,
        OperationStatus::Error,
        OperationStatus::UserCancelled,
        OperationStatus::SystemCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::Running => "RUNNING",
            OperationStatus::Success => "SUCCESS",
            OperationStatus::Warning => "WARNING",
            OperationStatus::Error => "ERROR",
            OperationStatus::UserCancelled => "USER_CANCELLED",
            OperationStatus::SystemCancelled => "SYSTEM_CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OperationStatus::Pending),
            "RUNNING" => Some(OperationStatus::Running),
            "SUCCESS" => Some(OperationStatus::Success),
            "WARNING" => Some(OperationStatus::Warning),
            "ERROR" => Some(OperationStatus::Error),
            "USER_CANCELLED" => Some(OperationStatus::UserCancelled),
            "SYSTEM_CANCELLED" => Some(OperationStatus::SystemCancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }
}

/// A snapshot as recorded in the operation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub unix_time_ms: i64,
    pub tree: String,
    pub paths: Vec<String>,
    pub hostname: String,
    pub username: String,
    pub tags: Vec<String>,
    pub parent: String,
}

/// Type-specific payload of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Backup {
        last_status: Option<BackupStatus>,
        summary: Option<BackupSummary>,
    },
    IndexSnapshot {
        snapshot: SnapshotInfo,
    },
    Forget {
        policy: Option<RetentionPolicy>,
        removed: Vec<SnapshotInfo>,
    },
    Prune,
    Restore {
        path: String,
        target: String,
        last_status: Option<RestoreProgress>,
        summary: Option<RestoreProgress>,
    },
    Stats {
        stats: Option<RepoStats>,
    },
    Unlock,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Backup { .. } => "backup",
            OperationKind::IndexSnapshot { .. } => "index_snapshot",
            OperationKind::Forget { .. } => "forget",
            OperationKind::Prune => "prune",
            OperationKind::Restore { .. } => "restore",
            OperationKind::Stats { .. } => "stats",
            OperationKind::Unlock => "unlock",
        }
    }

    pub fn backup() -> Self {
        OperationKind::Backup {
            last_status: None,
            summary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Assigned by the log on insert; 0 until then.
    pub id: i64,
    pub flow_id: i64,
    pub repo_id: String,
    pub plan_id: String,
    pub snapshot_id: Option<String>,
    pub status: OperationStatus,
    pub unix_time_start_ms: i64,
    /// 0 while the operation has not finished.
    pub unix_time_end_ms: i64,
    pub display_message: String,
    pub logref: Option<String>,
    pub op: OperationKind,
}

impl Operation {
    pub fn new(repo_id: &str, plan_id: Option<&str>, op: OperationKind) -> Self {
        Self {
            id: 0,
            flow_id: 0,
            repo_id: repo_id.to_string(),
            plan_id: plan_id.unwrap_or(UNASSOCIATED_PLAN).to_string(),
            snapshot_id: None,
            status: OperationStatus::Pending,
            unix_time_start_ms: 0,
            unix_time_end_ms: 0,
            display_message: String::new(),
            logref: None,
            op,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    Created(Operation),
    Updated(Operation),
    Deleted(Vec<i64>),
}

/// Filters for [`super::OpLog::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpSelector {
    pub ids: Vec<i64>,
    pub repo_id: Option<String>,
    pub plan_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub flow_id: Option<i64>,
    /// Only the `n` most recent matches, still returned oldest first.
    pub last_n: Option<usize>,
    pub only_failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClearHistoryFilter {
    pub repo_id: Option<String>,
    pub plan_id: Option<String>,
    pub ids: Vec<i64>,
    pub only_failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_db_text() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Running,
            OperationStatus::Success,
            OperationStatus::Warning,
            OperationStatus::Error,
            OperationStatus::UserCancelled,
            OperationStatus::SystemCancelled,
        ] {
            assert_eq!(OperationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OperationStatus::parse("DONE"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::TERMINAL.iter().all(|s| s.is_terminal()));
    }

    #[test]
    fn test_new_operation_defaults() {
        let op = Operation::new("r1", None, OperationKind::Unlock);
        assert_eq!(op.id, 0);
        assert_eq!(op.plan_id, UNASSOCIATED_PLAN);
        assert_eq!(op.status, OperationStatus::Pending);

        let json = serde_json::to_string(&op.op).unwrap();
        assert_eq!(json, r#"{"type":"unlock"}"#);
    }
}
