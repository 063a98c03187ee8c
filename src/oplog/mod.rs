//! The operation log: durable record of every job the orchestrator ran or
//! intends to run.
//!
//! [`OpLog`] wraps an [`OperationStore`] and enforces the record lifecycle:
//! ids are assigned on insert and never reused, updates require an assigned
//! id and are refused once a record is terminal, and only terminal records
//! can be cleared. Every accepted change is published to subscribers in
//! commit order.

mod models;
mod schema;
mod sqlite_store;

pub use models::{
    ClearHistoryFilter, OpSelector, Operation, OperationEvent, OperationKind, OperationStatus,
    SnapshotInfo, UNASSOCIATED_PLAN,
};
pub use sqlite_store::SqliteOperationStore;

use anyhow::Result;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
    Terminal,
}

/// Storage backend for operations.
pub trait OperationStore: Send + Sync {
    /// Inserts a new record, returning `(id, flow_id)`. A zero flow id is
    /// replaced by the new id.
    fn insert(&self, op: &Operation) -> Result<(i64, i64)>;

    /// Overwrites a non-terminal record.
    fn update(&self, op: &Operation) -> Result<UpdateOutcome>;

    fn get(&self, id: i64) -> Result<Option<Operation>>;

    /// Matching records ordered by id ascending.
    fn query(&self, selector: &OpSelector) -> Result<Vec<Operation>>;

    /// Deletes terminal records matching `filter`, returning their ids.
    fn delete_terminal(&self, filter: &ClearHistoryFilter) -> Result<Vec<i64>>;

    /// Moves every PENDING record to SYSTEM_CANCELLED and every RUNNING
    /// record to ERROR, returning the updated records.
    fn mark_interrupted(&self, now_ms: i64) -> Result<Vec<Operation>>;

    fn put_log(&self, logref: &str, data: &[u8]) -> Result<()>;

    fn get_log(&self, logref: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Error)]
pub enum OpLogError {
    #[error("operation has no id yet, it must be added before it is updated")]
    NotAssigned,
    #[error("operation already has id {0}")]
    AlreadyAssigned(i64),
    #[error("operation {0} not found")]
    NotFound(i64),
    #[error("operation {0} is already terminal")]
    Terminal(i64),
    #[error("operation log storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct OpLog {
    store: Arc<dyn OperationStore>,
    events: broadcast::Sender<OperationEvent>,
    /// Serializes every write, not only writes to one id. SQLite has a
    /// single writer regardless. Held across store write and publish so
    /// events follow commit order.
    write_lock: Mutex<()>,
}

impl OpLog {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            events,
            write_lock: Mutex::new(()),
        }
    }

    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let store = SqliteOperationStore::new(db_path)?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Receives every create, update and delete from now on. A receiver that
    /// falls behind gets `RecvError::Lagged` and should re-query.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: OperationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Persists a new operation and assigns its id (and flow id, if unset).
    pub fn add(&self, op: &mut Operation) -> Result<(), OpLogError> {
        if op.id != 0 {
            return Err(OpLogError::AlreadyAssigned(op.id));
        }
        let _guard = self.write_lock.lock().unwrap();
        let (id, flow_id) = self.store.insert(op)?;
        op.id = id;
        op.flow_id = flow_id;
        debug!(
            "Added operation {} ({}) for repo {} status {}",
            id,
            op.op.name(),
            op.repo_id,
            op.status.as_str()
        );
        self.publish(OperationEvent::Created(op.clone()));
        Ok(())
    }

    pub fn update(&self, op: &Operation) -> Result<(), OpLogError> {
        if op.id == 0 {
            return Err(OpLogError::NotAssigned);
        }
        let _guard = self.write_lock.lock().unwrap();
        match self.store.update(op)? {
            UpdateOutcome::Updated => {
                self.publish(OperationEvent::Updated(op.clone()));
                Ok(())
            }
            UpdateOutcome::NotFound => Err(OpLogError::NotFound(op.id)),
            UpdateOutcome::Terminal => Err(OpLogError::Terminal(op.id)),
        }
    }

    pub fn get(&self, id: i64) -> Result<Option<Operation>, OpLogError> {
        Ok(self.store.get(id)?)
    }

    pub fn query(&self, selector: &OpSelector) -> Result<Vec<Operation>, OpLogError> {
        Ok(self.store.query(selector)?)
    }

    /// Removes matching terminal operations. Pending and running operations
    /// are never removed.
    pub fn clear_history(&self, filter: &ClearHistoryFilter) -> Result<Vec<i64>, OpLogError> {
        let _guard = self.write_lock.lock().unwrap();
        let ids = self.store.delete_terminal(filter)?;
        if !ids.is_empty() {
            info!("Cleared {} operations from history", ids.len());
            self.publish(OperationEvent::Deleted(ids.clone()));
        }
        Ok(ids)
    }

    /// Closes out operations left non-terminal by a previous process.
    pub fn mark_interrupted(&self) -> Result<usize, OpLogError> {
        let _guard = self.write_lock.lock().unwrap();
        let updated = self.store.mark_interrupted(now_ms())?;
        if !updated.is_empty() {
            warn!(
                "Marked {} operations left over from a previous run as interrupted",
                updated.len()
            );
        }
        let count = updated.len();
        for op in updated {
            self.publish(OperationEvent::Updated(op));
        }
        Ok(count)
    }

    /// Stores captured tool output and returns the reference to fetch it by.
    pub fn write_log(&self, data: &[u8]) -> Result<String, OpLogError> {
        let logref = uuid::Uuid::new_v4().to_string();
        self.store.put_log(&logref, data)?;
        Ok(logref)
    }

    pub fn get_log(&self, logref: &str) -> Result<Option<Vec<u8>>, OpLogError> {
        Ok(self.store.get_log(logref)?)
    }
}
