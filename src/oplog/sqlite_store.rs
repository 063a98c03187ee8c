use super::models::{ClearHistoryFilter, OpSelector, Operation, OperationKind, OperationStatus};
use super::schema::OPLOG_VERSIONED_SCHEMAS;
use super::{OperationStore, UpdateOutcome};
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

const OPERATION_COLUMNS: &str = "id, flow_id, repo_id, plan_id, snapshot_id, status, \
     unix_time_start_ms, unix_time_end_ms, display_message, logref, payload";

/// Operation store backed by a WAL-mode SQLite database.
///
/// Writes go through one connection and reads through another, so queries
/// are not held up by a long write transaction.
pub struct SqliteOperationStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl SqliteOperationStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let writer = open_versioned(path, OPLOG_VERSIONED_SCHEMAS)?;
        writer
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;
        writer.pragma_update(None, "synchronous", "FULL")?;

        let reader = Connection::open(path).context("Failed to open oplog reader connection")?;
        info!("Opened operation log at {:?}", path);

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<Operation> {
        let status_str: String = row.get("status")?;
        let status = OperationStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown operation status {}", status_str).into(),
            )
        })?;
        let payload: String = row.get("payload")?;
        let op: OperationKind = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Operation {
            id: row.get("id")?,
            flow_id: row.get("flow_id")?,
            repo_id: row.get("repo_id")?,
            plan_id: row.get("plan_id")?,
            snapshot_id: row.get("snapshot_id")?,
            status,
            unix_time_start_ms: row.get("unix_time_start_ms")?,
            unix_time_end_ms: row.get("unix_time_end_ms")?,
            display_message: row.get("display_message")?,
            logref: row.get("logref")?,
            op,
        })
    }

    fn terminal_list() -> String {
        OperationStatus::TERMINAL
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Appends `id IN (...)` to `clauses` when `ids` is non-empty.
    fn push_ids(clauses: &mut Vec<String>, values: &mut Vec<Value>, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        clauses.push(format!("id IN ({})", placeholders));
        values.extend(ids.iter().map(|id| Value::Integer(*id)));
    }

    fn where_clause(clauses: &[String]) -> String {
        if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        }
    }
}

impl OperationStore for SqliteOperationStore {
    fn insert(&self, op: &Operation) -> Result<(i64, i64)> {
        let payload = serde_json::to_string(&op.op)?;
        let mut conn = self.writer.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO operations (flow_id, repo_id, plan_id, snapshot_id, kind, status,
                unix_time_start_ms, unix_time_end_ms, display_message, logref, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                op.flow_id,
                op.repo_id,
                op.plan_id,
                op.snapshot_id,
                op.op.name(),
                op.status.as_str(),
                op.unix_time_start_ms,
                op.unix_time_end_ms,
                op.display_message,
                op.logref,
                payload,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let flow_id = if op.flow_id == 0 {
            tx.execute(
                "UPDATE operations SET flow_id = ?1 WHERE id = ?1",
                params![id],
            )?;
            id
        } else {
            op.flow_id
        };
        tx.commit()?;
        Ok((id, flow_id))
    }

    fn update(&self, op: &Operation) -> Result<UpdateOutcome> {
        let payload = serde_json::to_string(&op.op)?;
        let conn = self.writer.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE operations SET flow_id = ?2, repo_id = ?3, plan_id = ?4, snapshot_id = ?5,
                    kind = ?6, status = ?7, unix_time_start_ms = ?8, unix_time_end_ms = ?9,
                    display_message = ?10, logref = ?11, payload = ?12
                 WHERE id = ?1 AND status NOT IN ({})",
                Self::terminal_list()
            ),
            params![
                op.id,
                op.flow_id,
                op.repo_id,
                op.plan_id,
                op.snapshot_id,
                op.op.name(),
                op.status.as_str(),
                op.unix_time_start_ms,
                op.unix_time_end_ms,
                op.display_message,
                op.logref,
                payload,
            ],
        )?;
        if changed > 0 {
            return Ok(UpdateOutcome::Updated);
        }
        let exists = conn
            .query_row(
                "SELECT 1 FROM operations WHERE id = ?1",
                params![op.id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(if exists {
            UpdateOutcome::Terminal
        } else {
            UpdateOutcome::NotFound
        })
    }

    fn get(&self, id: i64) -> Result<Option<Operation>> {
        let conn = self.reader.lock().unwrap();
        let op = conn
            .query_row(
                &format!("SELECT {} FROM operations WHERE id = ?1", OPERATION_COLUMNS),
                params![id],
                Self::row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    fn query(&self, selector: &OpSelector) -> Result<Vec<Operation>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        Self::push_ids(&mut clauses, &mut values, &selector.ids);
        let text_filters = [
            ("repo_id", &selector.repo_id),
            ("plan_id", &selector.plan_id),
            ("snapshot_id", &selector.snapshot_id),
        ];
        for (column, value) in text_filters {
            if let Some(value) = value {
                clauses.push(format!("{} = ?", column));
                values.push(Value::Text(value.clone()));
            }
        }
        if let Some(flow_id) = selector.flow_id {
            clauses.push("flow_id = ?".to_string());
            values.push(Value::Integer(flow_id));
        }
        if selector.only_failed {
            clauses.push(format!("status = '{}'", OperationStatus::Error.as_str()));
        }

        let mut sql = format!(
            "SELECT {} FROM operations {}",
            OPERATION_COLUMNS,
            Self::where_clause(&clauses)
        );
        if let Some(n) = selector.last_n {
            sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", n));
        } else {
            sql.push_str(" ORDER BY id ASC");
        }

        let conn = self.reader.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut ops = stmt
            .query_map(params_from_iter(values), Self::row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if selector.last_n.is_some() {
            ops.reverse();
        }
        Ok(ops)
    }

    fn delete_terminal(&self, filter: &ClearHistoryFilter) -> Result<Vec<i64>> {
        let mut clauses = vec![format!("status IN ({})", Self::terminal_list())];
        let mut values = Vec::new();
        Self::push_ids(&mut clauses, &mut values, &filter.ids);
        if let Some(repo_id) = &filter.repo_id {
            clauses.push("repo_id = ?".to_string());
            values.push(Value::Text(repo_id.clone()));
        }
        if let Some(plan_id) = &filter.plan_id {
            clauses.push("plan_id = ?".to_string());
            values.push(Value::Text(plan_id.clone()));
        }
        if filter.only_failed {
            clauses.push(format!("status = '{}'", OperationStatus::Error.as_str()));
        }
        let where_clause = Self::where_clause(&clauses);

        let mut conn = self.writer.lock().unwrap();
        let tx = conn.transaction()?;
        let (ids, logrefs) = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, logref FROM operations {} ORDER BY id",
                where_clause
            ))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut ids = Vec::with_capacity(rows.len());
            let mut logrefs = Vec::new();
            for (id, logref) in rows {
                ids.push(id);
                logrefs.extend(logref);
            }
            (ids, logrefs)
        };
        tx.execute(
            &format!("DELETE FROM operations {}", where_clause),
            params_from_iter(values.iter()),
        )?;
        // Captured output goes with the operation that owns it
        {
            let mut stmt = tx.prepare("DELETE FROM logs WHERE ref = ?1")?;
            for logref in &logrefs {
                stmt.execute(params![logref])?;
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn mark_interrupted(&self, now_ms: i64) -> Result<Vec<Operation>> {
        let mut conn = self.writer.lock().unwrap();
        let tx = conn.transaction()?;
        let stale = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM operations WHERE status IN (?1, ?2) ORDER BY id",
                OPERATION_COLUMNS
            ))?;
            let ops = stmt
                .query_map(
                    params![
                        OperationStatus::Pending.as_str(),
                        OperationStatus::Running.as_str()
                    ],
                    Self::row_to_operation,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ops
        };

        let mut updated = Vec::with_capacity(stale.len());
        for mut op in stale {
            if op.status == OperationStatus::Running {
                op.status = OperationStatus::Error;
                op.display_message =
                    "interrupted: orchestrator stopped while operation was in progress"
                        .to_string();
            } else {
                op.status = OperationStatus::SystemCancelled;
                op.display_message = "cancelled: orchestrator stopped before it ran".to_string();
            }
            op.unix_time_end_ms = now_ms;
            tx.execute(
                "UPDATE operations SET status = ?2, display_message = ?3, unix_time_end_ms = ?4
                 WHERE id = ?1",
                params![op.id, op.status.as_str(), op.display_message, now_ms],
            )?;
            updated.push(op);
        }
        tx.commit()?;
        Ok(updated)
    }

    fn put_log(&self, logref: &str, data: &[u8]) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        conn.execute(
            "INSERT INTO logs (ref, data) VALUES (?1, ?2)",
            params![logref, data],
        )?;
        Ok(())
    }

    fn get_log(&self, logref: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.reader.lock().unwrap();
        let data = conn
            .query_row(
                "SELECT data FROM logs WHERE ref = ?1",
                params![logref],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }
}
