//! Backup Orchestrator Library
//!
//! Schedules and runs restic backup, retention and maintenance jobs against
//! configured repositories, recording every job in a durable operation log.

pub mod config;
pub mod hook;
pub mod metrics;
pub mod oplog;
pub mod orchestrator;
pub mod restic;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use config::{AppConfig, CliConfig, Config, FileConfig};
pub use oplog::{OpLog, Operation, OperationStatus};
pub use orchestrator::{Orchestrator, Task, TaskError};
