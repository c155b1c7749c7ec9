//! Choose how a host is reached: deploy key first, operator identity second.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::types::AuthPath;
use crate::error::DeployError;
use crate::io::config::DeployConfig;
use crate::io::remote::{Remote, SessionSettings, SshSession, SshTarget};

/// Answers "does this host accept this credential right now?".
pub trait Prober {
    fn probe(&self, target: &SshTarget, auth: &AuthPath) -> Result<bool>;
}

/// Pick the auth path for a job.
///
/// The deploy key is tried without prompts; on any failure the operator's
/// ambient identity is tried once. There is no further fallback.
#[instrument(skip_all, fields(destination = %target.destination()))]
pub fn resolve_auth<P: Prober>(
    prober: &P,
    target: &SshTarget,
    deploy_key: Option<&Path>,
) -> Result<AuthPath, DeployError> {
    if let Some(key) = deploy_key {
        let auth = AuthPath::DeployKey(key.to_path_buf());
        match prober.probe(target, &auth) {
            Ok(true) => {
                info!(auth = %auth, "using deploy key");
                return Ok(auth);
            }
            Ok(false) => info!(key = %key.display(), "deploy key rejected, falling back"),
            Err(err) => warn!(err = %format!("{err:#}"), "deploy key probe errored, falling back"),
        }
    } else {
        debug!("no deploy key available");
    }

    match prober.probe(target, &AuthPath::Ambient) {
        Ok(true) => {
            info!(auth = %AuthPath::Ambient, "using ambient identity");
            Ok(AuthPath::Ambient)
        }
        Ok(false) => Err(DeployError::Connectivity(format!(
            "{} did not accept the deploy key or the ambient identity",
            target.destination()
        ))),
        Err(err) => Err(DeployError::connectivity(
            err.context(format!("probe {}", target.destination())),
        )),
    }
}

/// An authenticated session plus the path that got it.
#[derive(Debug)]
pub struct Connection<S> {
    pub auth: AuthPath,
    pub session: S,
}

/// Produces sessions for the pipeline. Faked in tests.
pub trait Connector {
    type Session: Remote;

    fn connect(
        &self,
        target: &SshTarget,
        deploy_key: Option<&Path>,
    ) -> Result<Connection<Self::Session>, DeployError>;
}

/// Real connector over the `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: SessionSettings,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(settings: SessionSettings, connect_timeout: Duration) -> Self {
        Self {
            settings,
            connect_timeout,
        }
    }

    pub fn from_config(cfg: &DeployConfig) -> Self {
        Self::new(
            SessionSettings {
                options: cfg.ssh.options.clone(),
                timeout: cfg.stage_timeout(),
                output_limit_bytes: cfg.timeouts.output_limit_bytes,
                control_dir: dirs::runtime_dir(),
            },
            cfg.connect_timeout(),
        )
    }
}

impl Prober for SshConnector {
    fn probe(&self, target: &SshTarget, auth: &AuthPath) -> Result<bool> {
        SshSession::new(target.clone(), auth.clone(), self.settings.clone())
            .probe(self.connect_timeout)
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn connect(
        &self,
        target: &SshTarget,
        deploy_key: Option<&Path>,
    ) -> Result<Connection<SshSession>, DeployError> {
        let key = deploy_key.filter(|key| {
            let present = key.is_file();
            if !present {
                debug!(key = %key.display(), "deploy key file missing");
            }
            present
        });
        let auth = resolve_auth(self, target, key)?;
        Ok(Connection {
            session: SshSession::new(target.clone(), auth.clone(), self.settings.clone()),
            auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;

    use anyhow::anyhow;

    use super::*;

    struct ScriptedProber {
        key_ok: Result<bool, String>,
        ambient_ok: bool,
        seen: RefCell<Vec<AuthPath>>,
    }

    impl ScriptedProber {
        fn new(key_ok: Result<bool, String>, ambient_ok: bool) -> Self {
            Self {
                key_ok,
                ambient_ok,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Prober for ScriptedProber {
        fn probe(&self, _target: &SshTarget, auth: &AuthPath) -> Result<bool> {
            self.seen.borrow_mut().push(auth.clone());
            match auth {
                AuthPath::DeployKey(_) => self.key_ok.clone().map_err(|e| anyhow!(e)),
                AuthPath::Ambient => Ok(self.ambient_ok),
            }
        }
    }

    fn target() -> SshTarget {
        SshTarget::new("alice.lan", Some("pi".to_string()))
    }

    #[test]
    fn accepted_deploy_key_wins_without_trying_ambient() {
        let prober = ScriptedProber::new(Ok(true), true);
        let key = PathBuf::from("/k/deploy");
        let auth = resolve_auth(&prober, &target(), Some(&key)).expect("auth");
        assert_eq!(auth, AuthPath::DeployKey(key));
        assert_eq!(prober.seen.borrow().len(), 1);
    }

    #[test]
    fn rejected_key_falls_back_once() {
        let prober = ScriptedProber::new(Ok(false), true);
        let auth = resolve_auth(&prober, &target(), Some(Path::new("/k/deploy"))).expect("auth");
        assert_eq!(auth, AuthPath::Ambient);
        assert_eq!(prober.seen.borrow().len(), 2);
    }

    #[test]
    fn probe_error_counts_as_rejection() {
        let prober = ScriptedProber::new(Err("ssh not found".to_string()), true);
        let auth = resolve_auth(&prober, &target(), Some(Path::new("/k/deploy"))).expect("auth");
        assert_eq!(auth, AuthPath::Ambient);
    }

    #[test]
    fn missing_key_goes_straight_to_ambient() {
        let prober = ScriptedProber::new(Ok(true), true);
        let auth = resolve_auth(&prober, &target(), None).expect("auth");
        assert_eq!(auth, AuthPath::Ambient);
        assert_eq!(*prober.seen.borrow(), vec![AuthPath::Ambient]);
    }

    #[test]
    fn both_paths_failing_is_a_connectivity_error() {
        let prober = ScriptedProber::new(Ok(false), false);
        let err = resolve_auth(&prober, &target(), Some(Path::new("/k/deploy"))).unwrap_err();
        assert!(matches!(err, DeployError::Connectivity(_)));
        assert!(err.reason().contains("pi@alice.lan"));
    }
}
