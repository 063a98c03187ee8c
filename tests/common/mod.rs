//! Common test infrastructure
//!
//! End-to-end tests drive a real [`Orchestrator`] against a fake `restic`
//! shell script that answers each verb with canned JSON output.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{verbs, TestOrchestrator, PLAN_A};
//!
//! #[tokio::test]
//! async fn test_backup() {
//!     let harness = TestOrchestrator::spawn(&verbs::defaults()).await;
//!     let op_id = harness.orchestrator.backup_now(PLAN_A).unwrap().unwrap();
//!     harness.wait_for_terminal(op_id).await;
//! }
//! ```

mod constants;
mod fake_restic;
mod harness;

pub use constants::*;
#[allow(unused_imports)]
pub use fake_restic::verbs;
#[allow(unused_imports)]
pub use harness::{default_config, plan, repo, TestOrchestrator};
