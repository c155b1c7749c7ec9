//! Profile naming rules and the per-profile remote layout.
//!
//! Remote paths are kept relative to the remote user's home directory so the
//! same layout works for any account; callers expand them with `$HOME` (shell)
//! or `%h` (systemd).

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

static PROFILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("profile regex should be valid")
});

/// Validate a profile name (lowercase, digits, `-` and `_`).
pub fn validate_profile(name: &str) -> Result<()> {
    if PROFILE_RE.is_match(name) {
        return Ok(());
    }
    Err(anyhow!(
        "invalid profile name '{name}' (expected lowercase letters, digits, '-' or '_')"
    ))
}

/// `alice-b` -> `ALICE_B`, used for environment variable prefixes.
pub fn env_prefix(profile: &str) -> String {
    profile.to_ascii_uppercase().replace('-', "_")
}

/// Remote paths owned by a single profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    pub profile: String,
    pub install_root: String,
    pub venv_dir: String,
    pub data_dir: String,
    pub secrets_dir: String,
    pub logs_dir: String,
    pub service_log: String,
    pub pid_file: String,
    pub unit_name: String,
    pub unit_path: String,
}

impl RemoteLayout {
    pub fn for_profile(profile: &str) -> Self {
        let install_root = format!("agentfleet/{profile}");
        let data_dir = format!("agentdata/{profile}");
        let logs_dir = format!("{data_dir}/logs");
        let unit_name = format!("agentfleet-{profile}.service");
        Self {
            profile: profile.to_string(),
            venv_dir: format!("{install_root}/.venv"),
            install_root,
            secrets_dir: format!("{data_dir}/secrets"),
            service_log: format!("{logs_dir}/service.log"),
            pid_file: format!("{data_dir}/service.pid"),
            unit_path: format!(".config/systemd/user/{unit_name}"),
            unit_name,
            logs_dir,
            data_dir,
        }
    }

    /// Command line that runs the managed service for this profile.
    pub fn entry_args(&self) -> Vec<String> {
        vec![
            "-m".to_string(),
            "core.agent".to_string(),
            "--profile".to_string(),
            self.profile.clone(),
        ]
    }

    pub fn backup_log(&self, kind: &str) -> String {
        format!("{}/backup_{kind}.log", self.logs_dir)
    }
}
