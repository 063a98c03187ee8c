use crate::hook::HookCondition;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Process settings (can override CLI)
    pub data_dir: Option<String>,
    pub restic_binary: Option<String>,
    pub metrics_port: Option<u16>,

    pub repos: Vec<RepoConfig>,
    pub plans: Vec<PlanConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

/// A backup repository and the credentials needed to reach it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RepoConfig {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Extra environment for every invocation, as `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Vec<String>,
    /// Extra tool flags, each entry split shell-style.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub prune_policy: Option<PrunePolicy>,
    /// Remove stale locks before each backup.
    #[serde(default)]
    pub auto_unlock: bool,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PrunePolicy {
    pub schedule: Option<String>,
    pub max_unused_percent: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PlanConfig {
    pub id: String,
    pub repo: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub backup_flags: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    /// Duration string understood by the tool, e.g. `30d` or `1y6m`.
    pub keep_within: Option<String>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.to_flags().is_empty()
    }

    pub fn to_flags(&self) -> Vec<String> {
        let counts = [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ];
        let mut flags = Vec::new();
        for (flag, value) in counts {
            if let Some(n) = value {
                flags.push(flag.to_string());
                flags.push(n.to_string());
            }
        }
        if let Some(within) = &self.keep_within {
            flags.push("--keep-within".to_string());
            flags.push(within.clone());
        }
        flags
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HookConfig {
    pub conditions: Vec<HookCondition>,
    pub command: String,
    #[serde(default)]
    pub on_error: HookErrorPolicy,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookErrorPolicy {
    #[default]
    Ignore,
    /// A failing hook fails the operation that triggered it.
    Fatal,
}
