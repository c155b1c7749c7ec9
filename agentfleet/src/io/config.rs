//! Deployer configuration stored under `config/agentfleet.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Deployer configuration (TOML).
///
/// Edited by humans; every field has a default so the file is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DeployConfig {
    pub ssh: SshSettings,
    pub timeouts: TimeoutSettings,
    pub runtime: RuntimeSettings,
    pub schedule: ScheduleSettings,
    pub service: ServiceSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshSettings {
    /// Dedicated non-interactive deploy key. `~/` is expanded.
    pub deploy_key: PathBuf,
    /// Bound on the connectivity probe, in seconds.
    pub connect_timeout_secs: u64,
    /// Extra `-o` options passed to every ssh invocation.
    pub options: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            deploy_key: PathBuf::from("~/.ssh/agentfleet_deploy"),
            connect_timeout_secs: 10,
            options: vec!["StrictHostKeyChecking=accept-new".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Upper bound for any single remote command after the probe.
    pub stage_secs: u64,
    /// Wait between graceful and forced termination.
    pub stop_grace_secs: u64,
    /// Truncate captured remote output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            stage_secs: 30 * 60,
            stop_grace_secs: 3,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeSettings {
    pub python: String,
    /// Minimum `major.minor`.
    pub min_version: String,
    pub package_manager: String,
    pub packages: Vec<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            min_version: "3.11".to_string(),
            package_manager: "apt-get".to_string(),
            packages: vec![
                "python3".to_string(),
                "python3-venv".to_string(),
                "python3-pip".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleSettings {
    pub code_backup: String,
    pub data_backup: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            code_backup: "30 2 * * *".to_string(),
            data_backup: "0 3 * * *".to_string(),
        }
    }
}

/// How a profile's running process is identified on the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessIdentityKind {
    #[default]
    CommandLine,
    PidFile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceSettings {
    pub health_port: u16,
    pub process_identity: ProcessIdentityKind,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            health_port: 8600,
            process_identity: ProcessIdentityKind::default(),
        }
    }
}

/// Build and cache artifacts never mirrored (and never deleted remotely).
pub const DEFAULT_EXCLUDES: [&str; 9] = [
    ".git/",
    ".venv/",
    "venv/",
    "__pycache__/",
    "*.pyc",
    ".pytest_cache/",
    ".mypy_cache/",
    "node_modules/",
    "target/",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Patterns excluded in addition to [`DEFAULT_EXCLUDES`].
    pub extra_exclude: Vec<String>,
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ssh.connect_timeout_secs == 0 {
            return Err(anyhow!("ssh.connect_timeout_secs must be > 0"));
        }
        if self.timeouts.stage_secs == 0 {
            return Err(anyhow!("timeouts.stage_secs must be > 0"));
        }
        if self.timeouts.output_limit_bytes == 0 {
            return Err(anyhow!("timeouts.output_limit_bytes must be > 0"));
        }
        if parse_min_version(&self.runtime.min_version).is_none() {
            return Err(anyhow!(
                "runtime.min_version must look like 3.11, got '{}'",
                self.runtime.min_version
            ));
        }
        if self.runtime.python.trim().is_empty() || self.runtime.package_manager.trim().is_empty()
        {
            return Err(anyhow!(
                "runtime.python and runtime.package_manager must be non-empty"
            ));
        }
        for (name, expr) in [
            ("schedule.code_backup", &self.schedule.code_backup),
            ("schedule.data_backup", &self.schedule.data_backup),
        ] {
            if !is_cron_schedule(expr) {
                return Err(anyhow!("{name} is not a cron schedule: '{expr}'"));
            }
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stage_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.connect_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.stop_grace_secs)
    }

    /// Default excludes followed by the configured extras, without repeats.
    pub fn excludes(&self) -> Vec<String> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect();
        for pattern in &self.sync.extra_exclude {
            let pattern = pattern.trim();
            if !pattern.is_empty() && !excludes.iter().any(|p| p == pattern) {
                excludes.push(pattern.to_string());
            }
        }
        excludes
    }

    /// Deploy key with a leading `~/` expanded against the operator's home.
    pub fn deploy_key(&self) -> PathBuf {
        expand_home(&self.ssh.deploy_key)
    }
}

/// `3.11` -> `(3, 11)`.
pub fn parse_min_version(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn is_cron_schedule(expr: &str) -> bool {
    let expr = expr.trim();
    expr.starts_with('@') || expr.split_whitespace().count() == 5
}

pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DeployConfig::default()`.
pub fn load_config(path: &Path) -> Result<DeployConfig> {
    if !path.exists() {
        let cfg = DeployConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DeployConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
