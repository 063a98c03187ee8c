use super::tasks::{Task, TaskError};
use crate::oplog::Operation;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Invoked once with the outcome of a task run, or of its cancellation.
pub type TaskCallback = Box<dyn FnOnce(&Result<(), TaskError>) + Send>;

/// A queued occurrence of a task.
pub struct ScheduledTask {
    pub task: Task,
    pub run_at: DateTime<Utc>,
    /// Operation persisted when the entry was queued.
    pub op: Option<Operation>,
    /// Configuration generation at queue time.
    pub modno: u64,
    pub callbacks: Vec<TaskCallback>,
}

impl ScheduledTask {
    pub fn op_id(&self) -> Option<i64> {
        self.op.as_ref().map(|op| op.id)
    }

    pub fn run_callbacks(&mut self, result: &Result<(), TaskError>) {
        for callback in self.callbacks.drain(..) {
            callback(result);
        }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("task", &self.task.name())
            .field("run_at", &self.run_at)
            .field("op", &self.op_id())
            .field("modno", &self.modno)
            .finish()
    }
}

/// Earliest run time first; ties go to the higher priority, then the
/// lexically smaller name, then insertion order.
type QueueKey = (DateTime<Utc>, Reverse<i32>, String, u64);

#[derive(Default)]
pub struct TaskQueue {
    entries: BTreeMap<QueueKey, ScheduledTask>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ScheduledTask) {
        let key = (
            entry.run_at,
            Reverse(entry.task.priority()),
            entry.task.name(),
            self.next_seq,
        );
        self.next_seq += 1;
        self.entries.insert(key, entry);
    }

    pub fn peek_run_at(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(run_at, ..)| *run_at)
    }

    /// Removes and returns the first entry if it is due at `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<ScheduledTask> {
        let first = self.entries.first_entry()?;
        if first.key().0 > now {
            return None;
        }
        Some(first.remove())
    }

    pub fn remove_by_op_id(&mut self, op_id: i64) -> Option<ScheduledTask> {
        let key = self
            .entries
            .iter()
            .find(|(_, entry)| entry.op_id() == Some(op_id))
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&key)
    }

    /// Removes and returns every entry matching `pred`, in queue order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<ScheduledTask>
    where
        F: FnMut(&ScheduledTask) -> bool,
    {
        let keys: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
