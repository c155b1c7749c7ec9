//! Operator-side credential sources: override file, environment, local files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::core::cascade::{CredentialKind, ResolvedCredentials, resolve_all};
use crate::error::DeployError;
use crate::io::layout::{OperatorPaths, read_trimmed};

/// Per-profile explicit values, keyed by profile name.
pub type Overrides = BTreeMap<String, BTreeMap<CredentialKind, String>>;

/// Load `config/deploy_credentials.toml`. A missing file means no overrides.
///
/// The file holds one `[<profile>]` table of `KEY = "value"` pairs; unknown
/// keys are rejected so a typo cannot silently skip a secret.
pub fn load_overrides(path: &Path) -> Result<Overrides, DeployError> {
    if !path.exists() {
        return Ok(Overrides::new());
    }
    let contents = fs::read_to_string(path)
        .map_err(|err| DeployError::Config(format!("read {}: {err}", path.display())))?;
    parse_overrides(&contents)
        .map_err(|err| DeployError::Config(format!("{}: {}", path.display(), err.reason())))
}

pub fn parse_overrides(contents: &str) -> Result<Overrides, DeployError> {
    let raw: BTreeMap<String, BTreeMap<String, String>> =
        toml::from_str(contents).map_err(|err| DeployError::Config(format!("parse: {err}")))?;
    let mut overrides = Overrides::new();
    for (profile, table) in raw {
        let mut values = BTreeMap::new();
        for (key, value) in table {
            let kind = CredentialKind::from_key(&key).ok_or_else(|| {
                DeployError::Config(format!("[{profile}] unknown credential key '{key}'"))
            })?;
            values.insert(kind, value);
        }
        overrides.insert(profile, values);
    }
    Ok(overrides)
}

/// Resolve `profile`'s credentials from `explicit`, the process environment
/// and `secrets/<profile>/`.
pub fn resolve_credentials(
    paths: &OperatorPaths,
    profile: &str,
    explicit: &BTreeMap<CredentialKind, String>,
) -> ResolvedCredentials {
    resolve_all(
        profile,
        explicit,
        |name| std::env::var(name).ok(),
        |kind| read_trimmed(&paths.credential_file(profile, kind)),
    )
}

/// Fleet-wide key from `secrets/interop_shared_key.txt`, if present.
pub fn read_shared_key(paths: &OperatorPaths) -> Option<String> {
    read_trimmed(&paths.shared_key_path)
}
