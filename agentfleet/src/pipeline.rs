//! Single-node deployment pipeline.
//!
//! Stages run strictly in order: connect, sync, bootstrap, secrets, schedule,
//! lifecycle. The first failing stage ends the job; scheduling problems are
//! recorded as warnings and never end it.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, instrument};

use crate::core::cascade::ResolvedCredentials;
use crate::core::profile::{RemoteLayout, validate_profile};
use crate::core::types::{DeploymentJob, Stage};
use crate::error::DeployError;
use crate::io::bootstrap::bootstrap;
use crate::io::config::{DeployConfig, ProcessIdentityKind, RuntimeSettings, ScheduleSettings};
use crate::io::connect::Connector;
use crate::io::lifecycle::{StopOutcome, handle_for, restart};
use crate::io::remote::SshTarget;
use crate::io::scheduler::{ScheduleOutcome, install_schedule};
use crate::io::secrets::{plan_secret_writes, provision_secrets};
use crate::io::sync::{SyncSource, sync_tree};

/// Everything needed to deploy one profile to one host.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub profile: String,
    pub target: SshTarget,
    /// Key tried before the operator's ambient identity.
    pub deploy_key: Option<PathBuf>,
    pub credentials: ResolvedCredentials,
    pub shared_key: Option<String>,
    pub source: SyncSource,
}

/// Host-independent knobs, taken from `agentfleet.toml`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub runtime: RuntimeSettings,
    pub schedule: ScheduleSettings,
    pub excludes: Vec<String>,
    pub process_identity: ProcessIdentityKind,
    pub stop_grace: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &DeployConfig) -> Self {
        Self {
            runtime: cfg.runtime.clone(),
            schedule: cfg.schedule.clone(),
            excludes: cfg.excludes(),
            process_identity: cfg.service.process_identity,
            stop_grace: cfg.stop_grace(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&DeployConfig::default())
    }
}

/// Run every stage for one node. Never panics or returns early: the outcome,
/// including any failure, is recorded in the returned job.
#[instrument(skip_all, fields(profile = %request.profile, host = %request.target.host))]
pub fn run_node<C: Connector>(
    connector: &C,
    request: &NodeRequest,
    settings: &PipelineSettings,
) -> DeploymentJob {
    let mut job = DeploymentJob::new(&request.profile, &request.target.host);
    match drive(connector, request, settings, &mut job) {
        Ok(()) => info!(warnings = job.warnings.len(), "deployment succeeded"),
        Err((stage, err)) => {
            error!(%stage, err = %err, "deployment failed");
            job.fail(stage, err.to_string());
        }
    }
    job
}

fn drive<C: Connector>(
    connector: &C,
    request: &NodeRequest,
    settings: &PipelineSettings,
    job: &mut DeploymentJob,
) -> Result<(), (Stage, DeployError)> {
    let at = |stage: Stage| move |err: DeployError| (stage, err);

    validate_profile(&request.profile)
        .map_err(|err| (Stage::Connect, DeployError::Config(err.to_string())))?;
    let layout = RemoteLayout::for_profile(&request.profile);

    let connection = connector
        .connect(&request.target, request.deploy_key.as_deref())
        .map_err(at(Stage::Connect))?;
    job.auth = Some(connection.auth.clone());
    job.complete(Stage::Connect);
    let remote = &connection.session;

    sync_tree(remote, &request.source, &layout, &settings.excludes).map_err(at(Stage::Sync))?;
    job.complete(Stage::Sync);

    let report = bootstrap(remote, &layout, &settings.runtime).map_err(at(Stage::Bootstrap))?;
    for warning in report.warnings {
        job.warn(warning);
    }
    job.complete(Stage::Bootstrap);

    let writes = plan_secret_writes(&request.credentials, request.shared_key.as_deref());
    provision_secrets(remote, &layout, &writes).map_err(at(Stage::Secrets))?;
    job.complete(Stage::Secrets);

    if let ScheduleOutcome::Warning(message) =
        install_schedule(remote, &layout, &settings.schedule)
    {
        job.warn(message);
    }
    job.complete(Stage::Schedule);

    let handle = handle_for(settings.process_identity, &layout);
    let lifecycle = restart(remote, &layout, handle.as_ref(), settings.stop_grace)
        .map_err(at(Stage::Lifecycle))?;
    if lifecycle.stop == StopOutcome::Killed {
        job.warn("previous instance ignored TERM and was killed");
    }
    info!(
        previous = ?lifecycle.stop.prior_state(),
        state = ?lifecycle.state,
        "service cycled"
    );
    job.complete(Stage::Lifecycle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AuthPath, JobOutcome};
    use crate::io::remote::ExecOutput;
    use crate::test_support::ScriptedConnector;

    fn request(profile: &str, host: &str, source: SyncSource) -> NodeRequest {
        NodeRequest {
            profile: profile.to_string(),
            target: SshTarget::new(host, None),
            deploy_key: Some(PathBuf::from("/keys/deploy")),
            credentials: ResolvedCredentials::default(),
            shared_key: None,
            source,
        }
    }

    #[test]
    fn happy_path_completes_every_stage_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let connector = ScriptedConnector::new();
        let job = run_node(
            &connector,
            &request("alice", "alice.lan", SyncSource::LocalTree(temp.path().to_path_buf())),
            &PipelineSettings::default(),
        );

        assert!(job.succeeded(), "{}", job.reason());
        assert_eq!(job.completed, Stage::ORDER.to_vec());
        assert_eq!(job.auth, Some(AuthPath::DeployKey(PathBuf::from("/keys/deploy"))));
    }

    #[test]
    fn sync_failure_stops_later_stages() {
        let connector = ScriptedConnector::new();
        let job = run_node(
            &connector,
            &request("alice", "alice.lan", SyncSource::LocalTree(PathBuf::from("/nope/nope"))),
            &PipelineSettings::default(),
        );

        assert!(matches!(job.outcome, JobOutcome::Failed { stage: Stage::Sync, .. }));
        assert_eq!(job.completed, vec![Stage::Connect]);
        assert!(!connector.remote("alice.lan").ran("sys.version_info"));
    }

    #[test]
    fn scheduling_warning_does_not_fail_the_job() {
        let temp = tempfile::tempdir().expect("tempdir");
        let connector = ScriptedConnector::new();
        connector
            .remote("alice.lan")
            .reject_crontab_write("not allowed to use this program");
        let job = run_node(
            &connector,
            &request("alice", "alice.lan", SyncSource::LocalTree(temp.path().to_path_buf())),
            &PipelineSettings::default(),
        );

        assert!(job.succeeded());
        assert_eq!(job.warnings.len(), 1);
        assert!(job.completed.contains(&Stage::Lifecycle));
    }

    #[test]
    fn launch_failure_is_a_lifecycle_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let connector = ScriptedConnector::new();
        connector.remote("alice.lan").respond(
            crate::io::lifecycle::START_TAG,
            ExecOutput::failed(1, "cd: no such file"),
        );
        let job = run_node(
            &connector,
            &request("alice", "alice.lan", SyncSource::LocalTree(temp.path().to_path_buf())),
            &PipelineSettings::default(),
        );
        assert!(matches!(job.outcome, JobOutcome::Failed { stage: Stage::Lifecycle, .. }));
    }

    #[test]
    fn invalid_profile_never_connects() {
        let connector = ScriptedConnector::new();
        let job = run_node(
            &connector,
            &request("../etc", "h.lan", SyncSource::LocalTree(PathBuf::from("/"))),
            &PipelineSettings::default(),
        );
        assert!(!job.succeeded());
        assert!(connector.connections().is_empty());
    }
}
