mod file_config;
pub mod schedule;

pub use file_config::{
    FileConfig, HookConfig, HookErrorPolicy, PlanConfig, PrunePolicy, RepoConfig,
    RetentionPolicy,
};

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// CLI arguments that can be used for config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub restic_binary: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub restic_binary: PathBuf,
    pub metrics_port: Option<u16>,
    pub config: Config,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or_else(|| cli.data_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("data_dir must be specified via --data-dir or in config file")
            })?;
        if !data_dir.is_dir() {
            bail!("Data directory does not exist: {:?}", data_dir);
        }

        let restic_binary = match file
            .restic_binary
            .map(PathBuf::from)
            .or_else(|| cli.restic_binary.clone())
        {
            Some(path) => {
                if !path.is_file() {
                    bail!("restic binary not found at {:?}", path);
                }
                path
            }
            None => find_in_path("restic")
                .context("restic binary not found on PATH, set restic_binary")?,
        };

        let metrics_port = file.metrics_port.or(cli.metrics_port);

        let config = Config {
            repos: file.repos,
            plans: file.plans,
        };
        config.validate()?;

        Ok(Self {
            data_dir,
            restic_binary,
            metrics_port,
            config,
        })
    }

    pub fn oplog_db_path(&self) -> PathBuf {
        self.data_dir.join("oplog.db")
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Repository and plan definitions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub repos: Vec<RepoConfig>,
    pub plans: Vec<PlanConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = FileConfig::load(path)?;
        let config = Self {
            repos: file.repos,
            plans: file.plans,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn get_repo(&self, id: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.id == id)
    }

    pub fn get_plan(&self, id: &str) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut repo_ids = HashSet::new();
        for repo in &self.repos {
            if repo.id.is_empty() {
                bail!("Repo id must not be empty");
            }
            if !repo_ids.insert(repo.id.as_str()) {
                bail!("Duplicate repo id '{}'", repo.id);
            }
            if let Some(schedule) = repo.prune_policy.as_ref().and_then(|p| p.schedule.as_ref()) {
                schedule::parse_schedule(schedule)
                    .with_context(|| format!("Repo '{}' has an invalid prune schedule", repo.id))?;
            }
            for entry in &repo.env {
                if !entry.contains('=') {
                    bail!("Repo '{}' env entry '{}' is not KEY=VALUE", repo.id, entry);
                }
            }
        }

        let mut plan_ids = HashSet::new();
        for plan in &self.plans {
            if plan.id.is_empty() {
                bail!("Plan id must not be empty");
            }
            if !plan_ids.insert(plan.id.as_str()) {
                bail!("Duplicate plan id '{}'", plan.id);
            }
            if !repo_ids.contains(plan.repo.as_str()) {
                bail!("Plan '{}' references unknown repo '{}'", plan.id, plan.repo);
            }
            if plan.paths.is_empty() {
                bail!("Plan '{}' has no paths", plan.id);
            }
            if let Some(schedule) = &plan.schedule {
                schedule::parse_schedule(schedule)
                    .with_context(|| format!("Plan '{}' has an invalid schedule", plan.id))?;
            }
        }
        Ok(())
    }
}

/// An immutable view of the configuration tagged with its generation.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub modno: u64,
    pub config: Config,
}

/// Holds the current configuration snapshot. Every accepted change bumps
/// the generation counter, which the scheduler compares at dequeue time.
pub struct ConfigStore {
    current: watch::Sender<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let (current, _) = watch::channel(Arc::new(ConfigSnapshot { modno: 1, config }));
        Ok(Self { current })
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.borrow().clone()
    }

    pub fn modno(&self) -> u64 {
        self.current.borrow().modno
    }

    /// Validates and publishes `config` as the next generation.
    pub fn apply(&self, config: Config) -> Result<Arc<ConfigSnapshot>> {
        config.validate()?;
        let mut applied = None;
        self.current.send_modify(|current| {
            let next = Arc::new(ConfigSnapshot {
                modno: current.modno + 1,
                config,
            });
            applied = Some(next.clone());
            *current = next;
        });
        Ok(applied.unwrap_or_else(|| self.snapshot()))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{plan, repo};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let binary = temp_dir.path().join("restic");
        std::fs::write(&binary, "").unwrap();

        let cli = CliConfig {
            data_dir: Some(temp_dir.path().to_path_buf()),
            restic_binary: Some(binary.clone()),
            metrics_port: Some(9100),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.data_dir, temp_dir.path());
        assert_eq!(config.restic_binary, binary);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.oplog_db_path(), temp_dir.path().join("oplog.db"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let binary = temp_dir.path().join("restic");
        std::fs::write(&binary, "").unwrap();

        let cli = CliConfig {
            data_dir: Some(PathBuf::from("/nonexistent")),
            restic_binary: Some(binary),
            metrics_port: Some(9100),
            ..Default::default()
        };
        let file = FileConfig {
            data_dir: Some(temp_dir.path().to_string_lossy().into_owned()),
            metrics_port: Some(9200),
            repos: vec![repo("r1")],
            plans: vec![plan("p1", "r1")],
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.data_dir, temp_dir.path());
        assert_eq!(config.metrics_port, Some(9200));
        assert_eq!(config.config.plans.len(), 1);
    }

    #[test]
    fn test_resolve_missing_data_dir_fails() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_repo_reference() {
        let config = Config {
            repos: vec![repo("r1")],
            plans: vec![plan("p1", "missing")],
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown repo"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids_and_bad_schedules() {
        let dup = Config {
            repos: vec![repo("r1"), repo("r1")],
            plans: vec![],
        };
        assert!(dup.validate().is_err());

        let mut bad_plan = plan("p1", "r1");
        bad_plan.schedule = Some("not a schedule".to_string());
        let bad = Config {
            repos: vec![repo("r1")],
            plans: vec![bad_plan],
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_store_bumps_generation() {
        let store = ConfigStore::new(Config::default()).unwrap();
        assert_eq!(store.modno(), 1);

        let before = store.snapshot();
        let applied = store
            .apply(Config {
                repos: vec![repo("r1")],
                plans: vec![],
            })
            .unwrap();
        assert_eq!(applied.modno, 2);
        assert_eq!(store.modno(), 2);
        // Earlier snapshots stay untouched
        assert!(before.config.repos.is_empty());
        assert!(store.snapshot().config.get_repo("r1").is_some());
    }

    #[test]
    fn test_config_store_rejects_invalid_config() {
        let store = ConfigStore::new(Config::default()).unwrap();
        let result = store.apply(Config {
            repos: vec![],
            plans: vec![plan("p1", "r1")],
        });
        assert!(result.is_err());
        assert_eq!(store.modno(), 1);
    }
}
