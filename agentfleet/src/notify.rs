//! `notify` command: send a profile's release notes to its Telegram chat.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::cascade::CredentialKind;
use crate::core::profile::{RemoteLayout, validate_profile};
use crate::io::config::{DeployConfig, expand_home};
use crate::io::connect::Connector;
use crate::io::credentials::{load_overrides, resolve_credentials};
use crate::io::layout::{OperatorPaths, read_trimmed};
use crate::io::notify::{MessageSender, allowlist_script, compose_message, first_chat_id};
use crate::io::registry::load_registry_or_default;
use crate::io::remote::{Remote, SshTarget};

#[derive(Debug, Clone)]
pub struct NotifyArgs {
    pub profile: String,
    pub host: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyReport {
    pub chat_id: String,
    pub characters: usize,
}

/// Resolve token, chat and message, then deliver through `make_sender`.
pub fn run_notify<C, S, F>(
    paths: &OperatorPaths,
    cfg: &DeployConfig,
    connector: &C,
    args: &NotifyArgs,
    make_sender: F,
) -> Result<NotifyReport>
where
    C: Connector,
    S: MessageSender,
    F: FnOnce(&str) -> Result<S>,
{
    validate_profile(&args.profile)?;

    let notes_path = paths.release_notes(&args.profile);
    let notes = fs::read_to_string(&notes_path)
        .with_context(|| format!("read release notes {}", notes_path.display()))?;
    let message = compose_message(&notes)
        .ok_or_else(|| anyhow!("{} is empty; nothing to send", notes_path.display()))?;

    let explicit: BTreeMap<CredentialKind, String> = load_overrides(&paths.overrides_path)?
        .remove(&args.profile)
        .unwrap_or_default();
    let credentials = resolve_credentials(paths, &args.profile, &explicit);
    let token = credentials
        .get(CredentialKind::BotToken)
        .map(|resolved| resolved.value.clone())
        .ok_or_else(|| {
            anyhow!(
                "no bot token for '{}' (argument, {} or {})",
                args.profile,
                CredentialKind::BotToken.env_var(&args.profile),
                paths
                    .credential_file(&args.profile, CredentialKind::BotToken)
                    .display()
            )
        })?;

    let chat_id = match read_trimmed(&paths.chat_id_file(&args.profile)) {
        Some(id) => {
            debug!("chat id from local file");
            id
        }
        None => remote_chat_id(paths, cfg, connector, args)?,
    };

    let sender = make_sender(&token)?;
    sender.send(&chat_id, &message)?;
    info!(profile = %args.profile, %chat_id, "release notes sent");
    Ok(NotifyReport {
        chat_id,
        characters: message.chars().count(),
    })
}

/// First id from the host's allowlist file.
fn remote_chat_id<C: Connector>(
    paths: &OperatorPaths,
    cfg: &DeployConfig,
    connector: &C,
    args: &NotifyArgs,
) -> Result<String> {
    let entry = load_registry_or_default(&paths.registry_path)?.find(&args.profile)?;
    let host = args
        .host
        .clone()
        .or_else(|| entry.as_ref().map(|n| n.host.clone()))
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| {
            anyhow!(
                "no local chat id ({}) and no host to read the allowlist from",
                paths.chat_id_file(&args.profile).display()
            )
        })?;
    let user = args
        .user
        .clone()
        .or_else(|| entry.as_ref().and_then(|n| n.user.clone()));
    let key = entry
        .and_then(|n| n.key)
        .map(|key| expand_home(&key))
        .unwrap_or_else(|| cfg.deploy_key());

    let connection = connector.connect(&SshTarget::new(host, user), Some(&key))?;
    let layout = RemoteLayout::for_profile(&args.profile);
    let out = connection
        .session
        .exec(&allowlist_script(&layout))?
        .check("read chat allowlist")?;
    first_chat_id(&out.stdout).ok_or_else(|| {
        anyhow!(
            "allowlist on {} has no chat id",
            connection.session.destination()
        )
    })
}
