//! Canonical paths inside the operator's repository.

use std::path::{Path, PathBuf};

use crate::core::cascade::CredentialKind;

/// All operator-side paths for a repository root.
#[derive(Debug, Clone)]
pub struct OperatorPaths {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub registry_path: PathBuf,
    pub overrides_path: PathBuf,
    pub secrets_dir: PathBuf,
    pub shared_key_path: PathBuf,
    pub release_notes_dir: PathBuf,
}

impl OperatorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_dir = root.join("config");
        let secrets_dir = root.join("secrets");
        Self {
            config_path: config_dir.join("agentfleet.toml"),
            registry_path: config_dir.join("nodes.yaml"),
            overrides_path: config_dir.join("deploy_credentials.toml"),
            shared_key_path: secrets_dir.join("interop_shared_key.txt"),
            release_notes_dir: root.join("release_notes"),
            config_dir,
            secrets_dir,
            root,
        }
    }

    /// Use `path` instead of `config/agentfleet.toml`.
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    pub fn profile_secrets_dir(&self, profile: &str) -> PathBuf {
        self.secrets_dir.join(profile)
    }

    pub fn credential_file(&self, profile: &str, kind: CredentialKind) -> PathBuf {
        self.profile_secrets_dir(profile).join(kind.file_name())
    }

    pub fn chat_id_file(&self, profile: &str) -> PathBuf {
        self.profile_secrets_dir(profile).join("telegram_chat_id.txt")
    }

    pub fn release_notes(&self, profile: &str) -> PathBuf {
        self.release_notes_dir.join(format!("{profile}.md"))
    }
}

/// Read a small text file, trimmed. Missing, unreadable or blank means `None`.
pub fn read_trimmed(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_root() {
        let paths = OperatorPaths::new("/repo");
        assert_eq!(paths.registry_path, PathBuf::from("/repo/config/nodes.yaml"));
        assert_eq!(
            paths.credential_file("alice", CredentialKind::BotToken),
            PathBuf::from("/repo/secrets/alice/telegram_bot_token.txt")
        );
        assert_eq!(
            paths.release_notes("alice"),
            PathBuf::from("/repo/release_notes/alice.md")
        );
    }

    #[test]
    fn config_override_replaces_only_config_path() {
        let paths = OperatorPaths::new("/repo").with_config("/etc/agentfleet.toml");
        assert_eq!(paths.config_path, PathBuf::from("/etc/agentfleet.toml"));
        assert_eq!(paths.registry_path, PathBuf::from("/repo/config/nodes.yaml"));
    }

    #[test]
    fn read_trimmed_treats_blank_as_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("value.txt");
        assert_eq!(read_trimmed(&path), None);
        std::fs::write(&path, "  \n").expect("write");
        assert_eq!(read_trimmed(&path), None);
        std::fs::write(&path, " token\n").expect("write");
        assert_eq!(read_trimmed(&path).as_deref(), Some("token"));
    }
}
