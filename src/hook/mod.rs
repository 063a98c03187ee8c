//! Lifecycle hooks.
//!
//! The scheduler never runs hooks itself. Task bodies call
//! [`HookExecutor::execute`] with a [`HookCondition`] and the variables
//! describing what triggered it, then decide how to treat failures.

use crate::config::{HookConfig, HookErrorPolicy};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookCondition {
    AnyError,
    SnapshotStart,
    SnapshotEnd,
    SnapshotSuccess,
    SnapshotWarning,
    SnapshotError,
    PruneStart,
    PruneSuccess,
    PruneError,
    ForgetStart,
    ForgetSuccess,
    ForgetError,
}

impl HookCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookCondition::AnyError => "ANY_ERROR",
            HookCondition::SnapshotStart => "SNAPSHOT_START",
            HookCondition::SnapshotEnd => "SNAPSHOT_END",
            HookCondition::SnapshotSuccess => "SNAPSHOT_SUCCESS",
            HookCondition::SnapshotWarning => "SNAPSHOT_WARNING",
            HookCondition::SnapshotError => "SNAPSHOT_ERROR",
            HookCondition::PruneStart => "PRUNE_START",
            HookCondition::PruneSuccess => "PRUNE_SUCCESS",
            HookCondition::PruneError => "PRUNE_ERROR",
            HookCondition::ForgetStart => "FORGET_START",
            HookCondition::ForgetSuccess => "FORGET_SUCCESS",
            HookCondition::ForgetError => "FORGET_ERROR",
        }
    }
}

/// Context handed to a hook, exported to the command as `BACKUP_*`
/// environment variables.
#[derive(Debug, Clone, Default)]
pub struct HookVars {
    pub task: String,
    pub repo_id: String,
    pub plan_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub error: Option<String>,
    pub summary: Option<String>,
}

impl HookVars {
    pub fn to_env(&self, condition: HookCondition) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("BACKUP_EVENT".to_string(), condition.as_str().to_string());
        env.insert("BACKUP_TASK".to_string(), self.task.clone());
        env.insert("BACKUP_REPO_ID".to_string(), self.repo_id.clone());
        let optional = [
            ("BACKUP_PLAN_ID", &self.plan_id),
            ("BACKUP_SNAPSHOT_ID", &self.snapshot_id),
            ("BACKUP_ERROR", &self.error),
            ("BACKUP_SUMMARY", &self.summary),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                env.insert(key.to_string(), value.clone());
            }
        }
        env
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook `{command}` exited with status {exit_code}: {output}")]
    Failed {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("failed to launch hook `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait HookExecutor: Send + Sync {
    /// Runs every hook in `hooks` registered for `condition`.
    ///
    /// Failures of hooks marked `on_error = "fatal"` are returned; other
    /// failures are logged and swallowed.
    async fn execute(
        &self,
        hooks: &[HookConfig],
        condition: HookCondition,
        vars: &HookVars,
    ) -> Result<(), HookError>;
}

/// Runs hook commands through `sh -c`.
#[derive(Debug, Default)]
pub struct CommandHookExecutor;

#[async_trait]
impl HookExecutor for CommandHookExecutor {
    async fn execute(
        &self,
        hooks: &[HookConfig],
        condition: HookCondition,
        vars: &HookVars,
    ) -> Result<(), HookError> {
        let env = vars.to_env(condition);
        for hook in hooks.iter().filter(|h| h.conditions.contains(&condition)) {
            debug!("Running {} hook: {}", condition.as_str(), hook.command);
            let result = run_command(&hook.command, &env).await;
            match (result, hook.on_error) {
                (Ok(()), _) => {}
                (Err(e), HookErrorPolicy::Fatal) => return Err(e),
                (Err(e), HookErrorPolicy::Ignore) => {
                    warn!("Ignoring failed {} hook: {}", condition.as_str(), e);
                }
            }
        }
        Ok(())
    }
}

async fn run_command(command: &str, env: &BTreeMap<String, String>) -> Result<(), HookError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| HookError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if output.status.success() {
        return Ok(());
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(HookError::Failed {
        command: command.to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        output: text.trim().to_string(),
    })
}
