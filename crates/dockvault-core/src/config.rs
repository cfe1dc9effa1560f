use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: Paths,
    #[serde(default)]
    pub archive: ArchiveSettings,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub space: SpaceSettings,
    #[serde(default)]
    pub restore: RestoreSettings,
    pub remote: Option<Remote>,
    pub notify: Option<Notify>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Paths {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    pub repository: String,
    #[serde(default = "default_lock")]
    pub lock: PathBuf,
    #[serde(default = "default_staging")]
    pub staging: PathBuf,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArchiveSettings {
    pub binary: String,
    pub compression: String,
    pub encryption: String,
    pub passphrase: Option<String>,
    pub passcommand: Option<String>,
    pub auto_init: bool,
    pub verify: bool,
    pub compact: bool,
    pub data_root_scope: String,
    pub sample_limit: usize,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            binary: "borg".to_string(),
            compression: "lz4".to_string(),
            encryption: "repokey-blake2".to_string(),
            passphrase: None,
            passcommand: None,
            auto_init: false,
            verify: true,
            compact: true,
            data_root_scope: "docker-data".to_string(),
            sample_limit: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Retention {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
            keep_yearly: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    DataRoot,
    Volumes,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Selection {
    pub mode: Mode,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub priority: Vec<String>,
    pub skip_in_use: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceSettings {
    pub docker_binary: String,
    pub units: Vec<String>,
    pub transition_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub start_attempts: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            units: vec!["docker.socket".to_string(), "docker.service".to_string()],
            transition_timeout_secs: 120,
            poll_interval_ms: 1000,
            start_attempts: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SpaceSettings {
    pub overhead_percent: u64,
}

impl Default for SpaceSettings {
    fn default() -> Self {
        Self {
            overhead_percent: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RestoreSettings {
    pub keep_relocated: bool,
    pub functional_check: bool,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            keep_relocated: false,
            functional_check: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Remote {
    Rclone {
        alias: String,
        #[serde(default = "default_rclone")]
        binary: String,
    },
    S3 {
        endpoint: String,
        bucket: String,
        access_key: String,
        secret_key: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_region")]
        region: String,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Notify {
    pub recipient: String,
    #[serde(default = "default_sender")]
    pub sender: String,
    #[serde(default = "default_sendmail")]
    pub sendmail: String,
    #[serde(default)]
    pub only_on_failure: bool,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/var/lib/docker")
}

fn default_lock() -> PathBuf {
    PathBuf::from("/run/dockvault.lock")
}

fn default_staging() -> PathBuf {
    PathBuf::from("/var/tmp/dockvault")
}

fn default_rclone() -> String {
    "rclone".to_string()
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_sender() -> String {
    "dockvault@localhost".to_string()
}

fn default_sendmail() -> String {
    "/usr/sbin/sendmail".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.as_ref().display()))?;
        cfg.validate()
            .with_context(|| format!("invalid config: {}", path.as_ref().display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.repository.trim().is_empty() {
            return Err(anyhow!("paths.repository must not be empty"));
        }
        // borg runs with varying working directories.
        if self.repository_is_local() && !self.repository_path().is_absolute() {
            return Err(anyhow!(
                "paths.repository must be an absolute path or a remote URL: {}",
                self.paths.repository
            ));
        }
        if !self.paths.data_root.is_absolute() {
            return Err(anyhow!(
                "paths.data_root must be absolute: {}",
                self.paths.data_root.display()
            ));
        }
        if self.service.transition_timeout_secs == 0 {
            return Err(anyhow!("service.transition_timeout_secs must be positive"));
        }
        if self.service.start_attempts == 0 {
            return Err(anyhow!("service.start_attempts must be positive"));
        }
        if self.archive.data_root_scope.contains('@') || self.archive.data_root_scope.is_empty() {
            return Err(anyhow!(
                "archive.data_root_scope must be non-empty and must not contain '@'"
            ));
        }
        let r = &self.retention;
        if [r.keep_daily, r.keep_weekly, r.keep_monthly, r.keep_yearly]
            .iter()
            .all(|n| *n == 0)
        {
            return Err(anyhow!("retention would prune every archive"));
        }
        Ok(())
    }

    /// True when the repository lives on this host's filesystem.
    pub fn repository_is_local(&self) -> bool {
        let repo = &self.paths.repository;
        if repo.contains("://") {
            return repo.starts_with("file://");
        }
        // scp-style `user@host:path`
        !matches!(repo.split_once(':'), Some((host, _)) if !host.contains('/'))
    }

    pub fn repository_path(&self) -> PathBuf {
        PathBuf::from(
            self.paths
                .repository
                .strip_prefix("file://")
                .unwrap_or(&self.paths.repository),
        )
    }
}
