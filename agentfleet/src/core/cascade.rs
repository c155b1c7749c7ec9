//! Layered credential resolution.
//!
//! Every credential is looked up in three places, strongest first: an explicit
//! value from the invocation, the `<PROFILE>_<KEY>` environment variable, and a
//! profile-scoped file on the operator machine. The first non-empty value wins;
//! nothing anywhere means the secret is not provisioned.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::profile::env_prefix;

/// Secret kinds the managed service reads from its secrets directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CredentialKind {
    BotToken,
    PairingCode,
    LlmApiKey,
    LlmBaseUrl,
    LlmModel,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 5] = [
        CredentialKind::BotToken,
        CredentialKind::PairingCode,
        CredentialKind::LlmApiKey,
        CredentialKind::LlmBaseUrl,
        CredentialKind::LlmModel,
    ];

    /// Key used in env var names and the override file.
    pub fn key(self) -> &'static str {
        match self {
            CredentialKind::BotToken => "BOT_TOKEN",
            CredentialKind::PairingCode => "PAIRING_CODE",
            CredentialKind::LlmApiKey => "LLM_API_KEY",
            CredentialKind::LlmBaseUrl => "LLM_BASE_URL",
            CredentialKind::LlmModel => "LLM_MODEL",
        }
    }

    /// File name, identical locally and on the remote host.
    pub fn file_name(self) -> &'static str {
        match self {
            CredentialKind::BotToken => "telegram_bot_token.txt",
            CredentialKind::PairingCode => "telegram_pairing_code.txt",
            CredentialKind::LlmApiKey => "llm_api_key.txt",
            CredentialKind::LlmBaseUrl => "llm_base_url.txt",
            CredentialKind::LlmModel => "llm_model.txt",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.key().eq_ignore_ascii_case(key))
    }

    pub fn env_var(self, profile: &str) -> String {
        format!("{}_{}", env_prefix(profile), self.key())
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Where a credential value came from, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Argument,
    Environment,
    File,
}

/// A resolved credential value and its origin.
#[derive(Clone, PartialEq, Eq)]
pub struct Resolved {
    pub source: Source,
    pub value: String,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("source", &self.source)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// One candidate in the cascade.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: Source,
    pub value: Option<String>,
}

impl Candidate {
    pub fn new(source: Source, value: Option<String>) -> Self {
        Self { source, value }
    }
}

/// Pick the first candidate with a non-blank value (trimmed).
pub fn first_present(candidates: &[Candidate]) -> Option<Resolved> {
    candidates.iter().find_map(|candidate| {
        let value = candidate.value.as_deref()?.trim();
        if value.is_empty() {
            return None;
        }
        Some(Resolved {
            source: candidate.source,
            value: value.to_string(),
        })
    })
}

/// Credentials resolved for one profile; kinds with no value are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCredentials {
    entries: BTreeMap<CredentialKind, Resolved>,
}

impl ResolvedCredentials {
    pub fn get(&self, kind: CredentialKind) -> Option<&Resolved> {
        self.entries.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CredentialKind, &Resolved)> {
        self.entries.iter().map(|(kind, resolved)| (*kind, resolved))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, kind: CredentialKind, resolved: Resolved) {
        self.entries.insert(kind, resolved);
    }
}

/// Resolve every credential kind for `profile`.
///
/// `explicit` holds invocation arguments (or override-file values), `env`
/// looks up an environment variable by name and `file` reads the
/// profile-scoped local file for a kind. Kept free of I/O so the precedence
/// rules are testable in isolation.
pub fn resolve_all<E, F>(
    profile: &str,
    explicit: &BTreeMap<CredentialKind, String>,
    env: E,
    file: F,
) -> ResolvedCredentials
where
    E: Fn(&str) -> Option<String>,
    F: Fn(CredentialKind) -> Option<String>,
{
    let mut resolved = ResolvedCredentials::default();
    for kind in CredentialKind::ALL {
        let candidates = [
            Candidate::new(Source::Argument, explicit.get(&kind).cloned()),
            Candidate::new(Source::Environment, env(&kind.env_var(profile))),
            Candidate::new(Source::File, file(kind)),
        ];
        if let Some(value) = first_present(&candidates) {
            resolved.insert(kind, value);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explicit(pairs: &[(CredentialKind, &str)]) -> BTreeMap<CredentialKind, String> {
        pairs
            .iter()
            .map(|(kind, value)| (*kind, value.to_string()))
            .collect()
    }

    #[test]
    fn argument_beats_environment_and_file() {
        let args = explicit(&[(CredentialKind::BotToken, "from-arg")]);
        let resolved = resolve_all(
            "alice",
            &args,
            |name| (name == "ALICE_BOT_TOKEN").then(|| "from-env".to_string()),
            |_| Some("from-file".to_string()),
        );

        let token = resolved.get(CredentialKind::BotToken).expect("token");
        assert_eq!(token.value, "from-arg");
        assert_eq!(token.source, Source::Argument);
    }

    #[test]
    fn environment_beats_file() {
        let resolved = resolve_all(
            "alice",
            &BTreeMap::new(),
            |name| (name == "ALICE_LLM_API_KEY").then(|| "env-key".to_string()),
            |kind| (kind == CredentialKind::LlmApiKey).then(|| "file-key".to_string()),
        );

        let key = resolved.get(CredentialKind::LlmApiKey).expect("llm key");
        assert_eq!(key.value, "env-key");
        assert_eq!(key.source, Source::Environment);
    }

    #[test]
    fn blank_values_fall_through_to_next_source() {
        let args = explicit(&[(CredentialKind::PairingCode, "   ")]);
        let resolved = resolve_all(
            "alice",
            &args,
            |_| Some(String::new()),
            |kind| (kind == CredentialKind::PairingCode).then(|| "4242\n".to_string()),
        );

        let code = resolved.get(CredentialKind::PairingCode).expect("code");
        assert_eq!(code.value, "4242");
        assert_eq!(code.source, Source::File);
    }

    #[test]
    fn absent_everywhere_is_skipped_not_an_error() {
        let resolved = resolve_all("alice", &BTreeMap::new(), |_| None, |_| None);
        assert!(resolved.is_empty());
    }

    #[test]
    fn env_var_names_use_profile_prefix() {
        assert_eq!(CredentialKind::BotToken.env_var("alice-b"), "ALICE_B_BOT_TOKEN");
        assert_eq!(
            CredentialKind::from_key("llm_api_key"),
            Some(CredentialKind::LlmApiKey)
        );
    }

    #[test]
    fn debug_output_redacts_values() {
        let resolved = Resolved {
            source: Source::File,
            value: "super-secret".to_string(),
        };
        assert!(!format!("{resolved:?}").contains("super-secret"));
    }
}
