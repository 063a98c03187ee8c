//! Invocation of the restic binary.
//!
//! [`Restic`] builds per-verb argument lists from repository and plan
//! configuration, runs the tool as a subprocess and feeds its stdout to the
//! readers in [`outputs`]. Exclusive access to a repository is not enforced
//! here; callers go through the repository gate first.

mod error;
pub mod outputs;

pub use error::ResticError;
pub use outputs::{
    BackupStatus, BackupSummary, ForgetGroup, LsEntry, RepoStats, RestoreProgress, Snapshot,
};

use crate::config::{PlanConfig, RepoConfig, RetentionPolicy};
use crate::metrics::record_tool_invocation;
use outputs::{read_backup_progress, read_json_document, read_ls, read_restore_progress, read_text};
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 64;

/// Exit code restic uses when a snapshot was written but some source files
/// could not be read.
const EXIT_INCOMPLETE_SNAPSHOT: i32 = 3;

pub fn plan_tag(plan_id: &str) -> String {
    format!("plan:{}", plan_id)
}

/// Splits each entry shell-style. Entries that fail to split are passed
/// through whole.
pub fn split_flags(flags: &[String]) -> Vec<String> {
    flags
        .iter()
        .flat_map(|f| shlex::split(f).unwrap_or_else(|| vec![f.clone()]))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupOutcome {
    pub summary: BackupSummary,
    /// The snapshot exists but some files were skipped.
    pub incomplete: bool,
}

struct Finished<T> {
    parsed: Result<T, ResticError>,
    exit_code: Option<i32>,
    stderr: String,
}

impl<T> Finished<T> {
    /// A non-zero exit wins over whatever the output parser reported.
    fn into_result(self) -> Result<T, ResticError> {
        match self.exit_code {
            Some(0) => self.parsed,
            code => Err(ResticError::Tool {
                exit_code: code.unwrap_or(-1),
                stderr: self.stderr,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Restic {
    binary: PathBuf,
    repo_id: String,
    repo_uri: String,
    password: Option<String>,
    env: Vec<(String, String)>,
    flags: Vec<String>,
}

impl Restic {
    pub fn new(binary: &Path, repo: &RepoConfig) -> Self {
        let env = repo
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            binary: binary.to_path_buf(),
            repo_id: repo.id.clone(),
            repo_uri: repo.uri.clone(),
            password: repo.password.clone(),
            env,
            flags: split_flags(&repo.flags),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.flags)
            .args(args)
            .env("RESTIC_REPOSITORY", &self.repo_uri)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.password {
            cmd.env("RESTIC_PASSWORD", password);
        }
        cmd
    }

    /// Runs one invocation to completion, parsing stdout with `parse` while
    /// stderr is collected concurrently. Cancellation kills the process.
    async fn run<T, P, Fut>(
        &self,
        verb: &'static str,
        args: Vec<String>,
        cancel: &CancellationToken,
        parse: P,
    ) -> Result<Finished<T>, ResticError>
    where
        P: FnOnce(BufReader<ChildStdout>) -> Fut,
        Fut: Future<Output = Result<T, ResticError>>,
    {
        debug!("Running restic {:?} on repo {}", args, self.repo_id);
        let mut child = self.command(&args).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("restic stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("restic stderr was not captured"))?;

        let completed = tokio::select! {
            result = async {
                let (parsed, stderr) =
                    tokio::join!(parse(BufReader::new(stdout)), read_stderr_tail(stderr));
                (parsed, stderr, child.wait().await)
            } => Some(result),
            _ = cancel.cancelled() => None,
        };

        let Some((parsed, stderr, status)) = completed else {
            warn!("Killing cancelled restic {} on repo {}", verb, self.repo_id);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill restic {}: {}", verb, e);
            }
            record_tool_invocation(verb, "cancelled");
            return Err(ResticError::Cancelled);
        };
        let status = status?;

        let outcome = match (status.code(), &parsed) {
            (Some(0), Ok(_)) => "ok",
            (Some(0), Err(_)) => "parse_error",
            _ => "tool_error",
        };
        record_tool_invocation(verb, outcome);
        info!(
            "restic {} on repo {} exited with {:?}",
            verb,
            self.repo_id,
            status.code()
        );

        Ok(Finished {
            parsed,
            exit_code: status.code(),
            stderr,
        })
    }

    pub async fn backup<F>(
        &self,
        plan: &PlanConfig,
        cancel: &CancellationToken,
        on_status: F,
    ) -> Result<BackupOutcome, ResticError>
    where
        F: FnMut(&BackupStatus),
    {
        let mut args = vec![
            "backup".to_string(),
            "--json".to_string(),
            "--tag".to_string(),
            plan_tag(&plan.id),
        ];
        for exclude in &plan.excludes {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }
        args.extend(split_flags(&plan.backup_flags));
        args.extend(plan.paths.iter().cloned());

        let finished = self
            .run("backup", args, cancel, |stdout| {
                read_backup_progress(stdout, on_status)
            })
            .await?;

        match (finished.exit_code, finished.parsed) {
            (Some(0), Ok(summary)) => Ok(BackupOutcome {
                summary,
                incomplete: false,
            }),
            (Some(EXIT_INCOMPLETE_SNAPSHOT), Ok(summary)) => {
                warn!(
                    "Backup of plan {} is incomplete: {}",
                    plan.id, finished.stderr
                );
                Ok(BackupOutcome {
                    summary,
                    incomplete: true,
                })
            }
            (Some(0), Err(e)) => Err(e),
            (code, _) => Err(ResticError::Tool {
                exit_code: code.unwrap_or(-1),
                stderr: finished.stderr,
            }),
        }
    }

    pub async fn restore<F>(
        &self,
        snapshot_id: &str,
        path: &str,
        target: &str,
        cancel: &CancellationToken,
        on_status: F,
    ) -> Result<RestoreProgress, ResticError>
    where
        F: FnMut(&RestoreProgress),
    {
        let source = if path.is_empty() {
            snapshot_id.to_string()
        } else {
            format!("{}:{}", snapshot_id, path)
        };
        let args = vec![
            "restore".to_string(),
            "--json".to_string(),
            source,
            "--target".to_string(),
            target.to_string(),
        ];
        self.run("restore", args, cancel, |stdout| {
            read_restore_progress(stdout, on_status)
        })
        .await?
        .into_result()
    }

    /// Applies `policy` to the snapshots of `plan_id` and returns the
    /// snapshots that were removed.
    pub async fn forget_by_policy(
        &self,
        plan_id: &str,
        policy: &RetentionPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snapshot>, ResticError> {
        let mut args = vec![
            "forget".to_string(),
            "--json".to_string(),
            "--tag".to_string(),
            plan_tag(plan_id),
            "--group-by".to_string(),
            String::new(),
        ];
        args.extend(policy.to_flags());

        let groups = self
            .run("forget", args, cancel, |stdout| async move {
                let text = read_text(stdout).await?;
                if text.trim().is_empty() {
                    return Ok(Vec::new());
                }
                serde_json::from_str::<Vec<ForgetGroup>>(text.trim())
                    .map_err(|e| ResticError::parse(text.trim(), e))
            })
            .await?
            .into_result()?;

        Ok(groups
            .into_iter()
            .flat_map(|g| g.remove.unwrap_or_default())
            .collect())
    }

    pub async fn forget_snapshot(
        &self,
        snapshot_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ResticError> {
        let args = vec!["forget".to_string(), snapshot_id.to_string()];
        self.run("forget", args, cancel, read_text)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Returns the tool's full text output.
    pub async fn prune(
        &self,
        max_unused_percent: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<String, ResticError> {
        let mut args = vec!["prune".to_string()];
        if let Some(percent) = max_unused_percent {
            args.push("--max-unused".to_string());
            args.push(format!("{}%", percent));
        }
        self.run("prune", args, cancel, read_text)
            .await?
            .into_result()
    }

    pub async fn unlock(&self, cancel: &CancellationToken) -> Result<String, ResticError> {
        self.run("unlock", vec!["unlock".to_string()], cancel, read_text)
            .await?
            .into_result()
    }

    pub async fn stats(&self, cancel: &CancellationToken) -> Result<RepoStats, ResticError> {
        let args = vec![
            "stats".to_string(),
            "--json".to_string(),
            "--mode".to_string(),
            "raw-data".to_string(),
        ];
        self.run("stats", args, cancel, read_json_document)
            .await?
            .into_result()
    }

    /// Lists snapshots, optionally only those carrying `tag`.
    pub async fn snapshots(
        &self,
        tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snapshot>, ResticError> {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        if let Some(tag) = tag {
            args.push("--tag".to_string());
            args.push(tag.to_string());
        }
        self.run("snapshots", args, cancel, read_json_document)
            .await?
            .into_result()
    }

    pub async fn ls(
        &self,
        snapshot_id: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(Snapshot, Vec<LsEntry>), ResticError> {
        let mut args = vec!["ls".to_string(), "--json".to_string(), snapshot_id.to_string()];
        if !path.is_empty() {
            args.push(path.to_string());
        }
        self.run("ls", args, cancel, read_ls).await?.into_result()
    }
}

async fn read_stderr_tail(stderr: ChildStderr) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("restic stderr: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read restic stderr: {}", e);
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}
