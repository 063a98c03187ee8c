//! Shared constants for end-to-end tests

pub const REPO_ID: &str = "repo1";
pub const OTHER_REPO_ID: &str = "repo2";

pub const PLAN_A: &str = "plan-a";
pub const PLAN_B: &str = "plan-b";

/// Snapshot every fake backup claims to have created.
pub const SNAPSHOT_ID: &str = "db155169f3c1b4f2e1f1b8a0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9d0";

/// Snapshot that the fake repository already holds but no backup produced.
pub const OLD_SNAPSHOT_ID: &str = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2";

/// Upper bound for any single wait in a test.
pub const WAIT_TIMEOUT_SECS: u64 = 10;
