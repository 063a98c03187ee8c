//! SQLite schema for the operation log.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

// =============================================================================
// Version 1 - Operations
// =============================================================================

/// One row per operation. AUTOINCREMENT keeps ids from being reused after
/// the newest rows are cleared from history.
const OPERATIONS_TABLE_V1: Table = Table {
    name: "operations",
    columns: &[
        sqlite_column!(
            "id",
            &SqlType::Integer,
            is_primary_key = true,
            autoincrement = true
        ),
        sqlite_column!("flow_id", &SqlType::Integer, non_null = true),
        sqlite_column!("repo_id", &SqlType::Text, non_null = true),
        sqlite_column!("plan_id", &SqlType::Text, non_null = true),
        sqlite_column!("snapshot_id", &SqlType::Text),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("unix_time_start_ms", &SqlType::Integer, non_null = true),
        sqlite_column!("unix_time_end_ms", &SqlType::Integer, non_null = true),
        sqlite_column!("display_message", &SqlType::Text, non_null = true),
        sqlite_column!("logref", &SqlType::Text),
        // JSON-encoded OperationKind
        sqlite_column!("payload", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_operations_repo", "repo_id"),
        ("idx_operations_plan", "plan_id"),
        ("idx_operations_snapshot", "snapshot_id"),
        ("idx_operations_flow", "flow_id"),
        ("idx_operations_status", "status"),
    ],
};

// =============================================================================
// Version 2 - Captured tool output
// =============================================================================

const LOGS_TABLE_V2: Table = Table {
    name: "logs",
    columns: &[
        sqlite_column!("ref", &SqlType::Text, is_primary_key = true),
        sqlite_column!("data", &SqlType::Blob, non_null = true),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    LOGS_TABLE_V2.create(conn)
}

pub const OPLOG_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[OPERATIONS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[OPERATIONS_TABLE_V1, LOGS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];
