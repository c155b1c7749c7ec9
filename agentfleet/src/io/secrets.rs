//! Write resolved secrets into the profile's private directory.

use std::fmt;

use tracing::{debug, info, instrument};

use crate::core::cascade::ResolvedCredentials;
use crate::core::profile::RemoteLayout;
use crate::error::DeployError;
use crate::io::remote::{Remote, home_path};

/// Fleet-wide key copied to every node.
pub const SHARED_KEY_FILE: &str = "interop_shared_key.txt";

/// One file to (over)write in the secrets directory.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretWrite {
    pub file_name: String,
    pub value: String,
}

impl fmt::Debug for SecretWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretWrite")
            .field("file_name", &self.file_name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Files to write for this run.
///
/// Only credentials that resolved to a value appear; everything else is left
/// as it is on the host. The shared key, when present locally, is always
/// included.
pub fn plan_secret_writes(
    resolved: &ResolvedCredentials,
    shared_key: Option<&str>,
) -> Vec<SecretWrite> {
    let mut writes: Vec<SecretWrite> = resolved
        .iter()
        .map(|(kind, value)| SecretWrite {
            file_name: kind.file_name().to_string(),
            value: value.value.clone(),
        })
        .collect();
    if let Some(key) = shared_key.map(str::trim).filter(|k| !k.is_empty()) {
        writes.push(SecretWrite {
            file_name: SHARED_KEY_FILE.to_string(),
            value: key.to_string(),
        });
    }
    writes
}

/// Script writing stdin to `secrets/<file_name>` with mode 0600 via rename.
pub fn write_secret_script(layout: &RemoteLayout, file_name: &str) -> String {
    let target = format!("{}/{file_name}", layout.secrets_dir);
    let tmp = format!("{}/.{file_name}.tmp", layout.secrets_dir);
    format!(
        "set -e\n\
         umask 077\n\
         mkdir -p {dir}\n\
         chmod 700 {dir}\n\
         cat > {tmp}\n\
         chmod 600 {tmp}\n\
         mv -f {tmp} {target}\n",
        dir = home_path(&layout.secrets_dir),
        tmp = home_path(&tmp),
        target = home_path(&target),
    )
}

/// Write every planned secret. Returns the file names written.
#[instrument(skip_all, fields(destination = %remote.destination(), profile = %layout.profile, count = writes.len()))]
pub fn provision_secrets<R: Remote>(
    remote: &R,
    layout: &RemoteLayout,
    writes: &[SecretWrite],
) -> Result<Vec<String>, DeployError> {
    if writes.is_empty() {
        debug!("no secrets supplied, leaving remote files untouched");
        return Ok(Vec::new());
    }
    let mut written = Vec::with_capacity(writes.len());
    for write in writes {
        remote
            .exec_with_input(
                &write_secret_script(layout, &write.file_name),
                write.value.as_bytes(),
            )
            .and_then(|out| out.check(&format!("write {}", write.file_name)))
            .map_err(DeployError::secret)?;
        written.push(write.file_name.clone());
    }
    info!(files = ?written, "secrets provisioned");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::cascade::{CredentialKind, resolve_all};
    use crate::io::remote::ExecOutput;
    use crate::test_support::FakeRemote;

    fn resolved(pairs: &[(CredentialKind, &str)]) -> ResolvedCredentials {
        let explicit: BTreeMap<CredentialKind, String> = pairs
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect();
        resolve_all("alice", &explicit, |_| None, |_| None)
    }

    #[test]
    fn plans_only_supplied_secrets_plus_shared_key() {
        let writes = plan_secret_writes(
            &resolved(&[(CredentialKind::BotToken, "123:abc")]),
            Some("shared\n"),
        );
        let names: Vec<&str> = writes.iter().map(|w| w.file_name.as_str()).collect();
        assert_eq!(names, vec!["telegram_bot_token.txt", SHARED_KEY_FILE]);
        assert_eq!(writes[1].value, "shared");
    }

    #[test]
    fn blank_shared_key_is_skipped() {
        assert!(plan_secret_writes(&resolved(&[]), Some("  ")).is_empty());
    }

    #[test]
    fn debug_output_hides_values() {
        let write = SecretWrite {
            file_name: "llm_api_key.txt".to_string(),
            value: "sk-live".to_string(),
        };
        assert!(!format!("{write:?}").contains("sk-live"));
    }

    #[test]
    fn writes_land_through_a_private_temp_file() {
        let remote = FakeRemote::new();
        let layout = RemoteLayout::for_profile("alice");
        let writes = plan_secret_writes(&resolved(&[(CredentialKind::LlmModel, "m-1")]), None);

        let written = provision_secrets(&remote, &layout, &writes).expect("provision");
        assert_eq!(written, vec!["llm_model.txt".to_string()]);
        assert_eq!(
            remote.secret_file("alice", "llm_model.txt").as_deref(),
            Some("m-1")
        );
        let script = write_secret_script(&layout, "llm_model.txt");
        assert!(script.contains("umask 077"));
        assert!(script.contains("chmod 600"));
    }

    #[test]
    fn nothing_supplied_touches_nothing() {
        let remote = FakeRemote::new();
        let written =
            provision_secrets(&remote, &RemoteLayout::for_profile("alice"), &[]).expect("ok");
        assert!(written.is_empty());
        assert!(remote.calls().is_empty());
    }

    #[test]
    fn failed_write_is_a_secret_failure() {
        let remote = FakeRemote::new();
        remote.respond("cat >", ExecOutput::failed(1, "No space left on device"));
        let writes = plan_secret_writes(&resolved(&[(CredentialKind::BotToken, "t")]), None);
        let err = provision_secrets(&remote, &RemoteLayout::for_profile("alice"), &writes)
            .unwrap_err();
        assert!(matches!(err, DeployError::Secret(_)));
    }
}
