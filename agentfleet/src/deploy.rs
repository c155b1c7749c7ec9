//! `deploy` and `deploy_all` commands.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::core::cascade::CredentialKind;
use crate::core::profile::validate_profile;
use crate::core::summary::FleetSummary;
use crate::core::types::DeploymentJob;
use crate::error::DeployError;
use crate::fleet::{plan_fleet, run_fleet};
use crate::io::config::{DeployConfig, expand_home};
use crate::io::connect::Connector;
use crate::io::credentials::{load_overrides, read_shared_key, resolve_credentials};
use crate::io::layout::OperatorPaths;
use crate::io::registry::{load_registry, load_registry_or_default};
use crate::io::remote::SshTarget;
use crate::io::sync::SyncSource;
use crate::pipeline::{NodeRequest, PipelineSettings, run_node};

/// Arguments of a single-node deploy, after env defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct DeployArgs {
    pub profile: String,
    pub host: String,
    pub user: Option<String>,
    pub token: Option<String>,
    pub pairing_code: Option<String>,
    pub llm_key: Option<String>,
    pub repo_url: Option<String>,
    pub branch: String,
}

impl DeployArgs {
    /// Invocation values; these beat the override file.
    fn explicit(&self) -> BTreeMap<CredentialKind, String> {
        [
            (CredentialKind::BotToken, &self.token),
            (CredentialKind::PairingCode, &self.pairing_code),
            (CredentialKind::LlmApiKey, &self.llm_key),
        ]
        .into_iter()
        .filter_map(|(kind, value)| value.clone().map(|v| (kind, v)))
        .collect()
    }

    fn source(&self, paths: &OperatorPaths) -> SyncSource {
        match self.repo_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => SyncSource::Git {
                url: url.to_string(),
                branch: self.branch.clone(),
            },
            None => SyncSource::LocalTree(paths.root.clone()),
        }
    }
}

/// Deploy one profile to one host.
///
/// Errors only for problems found before contacting the host; stage failures
/// are reported in the returned job.
pub fn run_deploy<C: Connector>(
    paths: &OperatorPaths,
    cfg: &DeployConfig,
    connector: &C,
    args: &DeployArgs,
) -> Result<DeploymentJob> {
    validate_profile(&args.profile)?;
    if args.host.trim().is_empty() {
        return Err(DeployError::Config("host must not be empty".to_string()).into());
    }

    let mut explicit = load_overrides(&paths.overrides_path)?
        .remove(&args.profile)
        .unwrap_or_default();
    explicit.extend(args.explicit());

    // A registry entry for this profile may name its own deploy key.
    let registry = load_registry_or_default(&paths.registry_path)?;
    let deploy_key = registry
        .find(&args.profile)?
        .and_then(|node| node.key)
        .map(|key| expand_home(&key))
        .unwrap_or_else(|| cfg.deploy_key());

    let request = NodeRequest {
        profile: args.profile.clone(),
        target: SshTarget::new(args.host.trim(), args.user.clone()),
        deploy_key: Some(deploy_key),
        credentials: resolve_credentials(paths, &args.profile, &explicit),
        shared_key: read_shared_key(paths),
        source: args.source(paths),
    };
    Ok(run_node(
        connector,
        &request,
        &PipelineSettings::from_config(cfg),
    ))
}

/// Deploy every node in the registry.
pub fn run_deploy_all<C, F>(
    paths: &OperatorPaths,
    cfg: &DeployConfig,
    connector: &C,
    on_job: F,
) -> Result<FleetSummary>
where
    C: Connector,
    F: FnMut(&DeploymentJob),
{
    let registry = load_registry(&paths.registry_path)
        .with_context(|| format!("load {}", paths.registry_path.display()))?;
    let overrides = load_overrides(&paths.overrides_path)?;
    let shared_key = read_shared_key(paths);
    let plan = plan_fleet(
        &registry,
        cfg,
        &overrides,
        shared_key.as_deref(),
        &SyncSource::LocalTree(paths.root.clone()),
        |profile, explicit| resolve_credentials(paths, profile, explicit),
    )?;
    Ok(run_fleet(
        connector,
        &plan,
        &PipelineSettings::from_config(cfg),
        on_job,
    ))
}
