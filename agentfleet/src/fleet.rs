//! Fleet-wide deployment over the node registry.

use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use crate::core::cascade::{CredentialKind, ResolvedCredentials};
use crate::core::summary::{FleetSummary, SkippedNode};
use crate::core::types::DeploymentJob;
use crate::error::DeployError;
use crate::io::config::{DeployConfig, expand_home};
use crate::io::connect::Connector;
use crate::io::credentials::Overrides;
use crate::io::registry::{Node, Registry};
use crate::io::remote::SshTarget;
use crate::io::sync::SyncSource;
use crate::pipeline::{NodeRequest, PipelineSettings, run_node};

/// Nodes to deploy, in registry order, plus the ones left out.
#[derive(Debug, Clone, Default)]
pub struct FleetPlan {
    pub requests: Vec<NodeRequest>,
    pub skipped: Vec<SkippedNode>,
}

/// Build one request per deployable node.
///
/// `resolve` maps a profile and its explicit values to credentials; the
/// caller decides which environment and files back it.
pub fn plan_fleet<F>(
    registry: &Registry,
    cfg: &DeployConfig,
    overrides: &Overrides,
    shared_key: Option<&str>,
    source: &SyncSource,
    resolve: F,
) -> Result<FleetPlan, DeployError>
where
    F: Fn(&str, &BTreeMap<CredentialKind, String>) -> ResolvedCredentials,
{
    let mut plan = FleetPlan::default();
    let empty = BTreeMap::new();
    for node in registry.resolved_nodes()? {
        if node.is_placeholder() {
            info!(node = %node.id, host = %node.host, "skipping placeholder host");
            plan.skipped.push(SkippedNode {
                node: node.id.clone(),
                reason: format!("host '{}' is a placeholder", node.host),
            });
            continue;
        }
        let explicit = overrides.get(&node.profile).unwrap_or(&empty);
        let credentials = resolve(&node.profile, explicit);
        plan.requests.push(request_for(&node, cfg, credentials, shared_key, source));
    }
    Ok(plan)
}

fn request_for(
    node: &Node,
    cfg: &DeployConfig,
    credentials: ResolvedCredentials,
    shared_key: Option<&str>,
    source: &SyncSource,
) -> NodeRequest {
    NodeRequest {
        profile: node.profile.clone(),
        target: SshTarget::new(&node.host, node.user.clone()),
        deploy_key: Some(
            node.key
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| cfg.deploy_key()),
        ),
        credentials,
        shared_key: shared_key.map(str::to_string),
        source: source.clone(),
    }
}

/// Deploy every planned node, one at a time. A failed node is recorded and
/// the run moves on; `on_job` sees each job as it finishes.
#[instrument(skip_all, fields(nodes = plan.requests.len(), skipped = plan.skipped.len()))]
pub fn run_fleet<C, F>(
    connector: &C,
    plan: &FleetPlan,
    settings: &PipelineSettings,
    mut on_job: F,
) -> FleetSummary
where
    C: Connector,
    F: FnMut(&DeploymentJob),
{
    let mut summary = FleetSummary {
        skipped: plan.skipped.clone(),
        ..FleetSummary::default()
    };
    for request in &plan.requests {
        let job = run_node(connector, request, settings);
        if !job.succeeded() {
            warn!(profile = %job.profile, reason = %job.reason(), "node failed, continuing");
        }
        on_job(&job);
        summary.record(job);
    }
    info!(
        succeeded = summary.success_count(),
        failed = summary.failure_count(),
        "fleet run finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::core::cascade::resolve_all;
    use crate::io::credentials::parse_overrides;
    use crate::io::registry::parse_registry;

    fn resolver(profile: &str, explicit: &BTreeMap<CredentialKind, String>) -> ResolvedCredentials {
        resolve_all(profile, explicit, |_| None, |_| None)
    }

    #[test]
    fn placeholders_are_skipped_and_overrides_applied() {
        let registry = parse_registry(
            "nodes:\n  alice:\n    host: alice.lan\n    key: /keys/alice\n  bob:\n    host: bob.TBD\n  carol:\n    host: carol.lan\n    user: pi\n",
        )
        .expect("registry");
        let overrides = parse_overrides("[alice]\nBOT_TOKEN = \"t-1\"\n").expect("overrides");

        let plan = plan_fleet(
            &registry,
            &DeployConfig::default(),
            &overrides,
            Some("shared"),
            &SyncSource::LocalTree(PathBuf::from("/repo")),
            resolver,
        )
        .expect("plan");

        let profiles: Vec<&str> = plan.requests.iter().map(|r| r.profile.as_str()).collect();
        assert_eq!(profiles, vec!["alice", "carol"]);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].node, "bob");

        let alice = &plan.requests[0];
        assert_eq!(alice.deploy_key, Some(PathBuf::from("/keys/alice")));
        assert_eq!(
            alice.credentials.get(CredentialKind::BotToken).map(|r| r.value.as_str()),
            Some("t-1")
        );
        assert!(plan.requests[1].credentials.is_empty());
        assert_eq!(plan.requests[1].target.destination(), "pi@carol.lan");
        assert_eq!(plan.requests[1].shared_key.as_deref(), Some("shared"));
    }

    #[test]
    fn plan_follows_registry_order() {
        let registry = parse_registry(
            "nodes:\n  zed:\n    host: zed.lan\n  amy:\n    host: amy.lan\n  kim:\n    host: kim.lan\n",
        )
        .expect("registry");
        let plan = plan_fleet(
            &registry,
            &DeployConfig::default(),
            &Overrides::new(),
            None,
            &SyncSource::LocalTree(PathBuf::from("/repo")),
            resolver,
        )
        .expect("plan");
        let profiles: Vec<&str> = plan.requests.iter().map(|r| r.profile.as_str()).collect();
        assert_eq!(profiles, ["zed", "amy", "kim"]);
    }

    #[test]
    fn empty_registry_plans_nothing() {
        let plan = plan_fleet(
            &Registry::default(),
            &DeployConfig::default(),
            &Overrides::new(),
            None,
            &SyncSource::LocalTree(PathBuf::from("/repo")),
            resolver,
        )
        .expect("plan");
        assert!(plan.requests.is_empty());
        assert!(plan.skipped.is_empty());
    }
}
