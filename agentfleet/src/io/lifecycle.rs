//! Stop and start the managed service process on a host.
//!
//! Which processes belong to a profile is decided by a [`ProcessHandle`], so
//! the stop/start logic does not care whether instances are found by command
//! line or by pid file.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::profile::RemoteLayout;
use crate::core::types::ServiceState;
use crate::error::DeployError;
use crate::io::config::ProcessIdentityKind;
use crate::io::remote::{Remote, home_path, shell_quote};

/// First line of every stop script.
pub const STOP_TAG: &str = "# agentfleet:stop";
/// First line of every start script.
pub const START_TAG: &str = "# agentfleet:start";

/// Shell fragments that find and signal a profile's instances.
pub trait ProcessHandle {
    /// Condition that succeeds while at least one instance runs.
    fn running_check(&self) -> String;
    /// Send `signal` (`TERM`, `KILL`) to every instance.
    fn signal(&self, signal: &str) -> String;
    /// Run right after the background launch; `$!` is the new pid.
    fn after_launch(&self) -> String {
        String::new()
    }
    /// Run once no instance is left.
    fn after_stop(&self) -> String {
        String::new()
    }
}

/// Instances are processes whose command line runs the profile's entry module.
#[derive(Debug, Clone)]
pub struct CommandLinePattern {
    pattern: String,
}

impl CommandLinePattern {
    pub fn for_layout(layout: &RemoteLayout) -> Self {
        // The bracket keeps the pattern from matching the shell that carries it.
        Self {
            pattern: format!(r"[c]ore\.agent --profile {}( |$)", layout.profile),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl ProcessHandle for CommandLinePattern {
    fn running_check(&self) -> String {
        format!("pgrep -f {} >/dev/null", shell_quote(&self.pattern))
    }

    fn signal(&self, signal: &str) -> String {
        format!("pkill -{signal} -f {}", shell_quote(&self.pattern))
    }
}

/// Instances are tracked through a pid file written at launch.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: String,
}

impl PidFile {
    pub fn for_layout(layout: &RemoteLayout) -> Self {
        Self {
            path: home_path(&layout.pid_file),
        }
    }
}

impl ProcessHandle for PidFile {
    fn running_check(&self) -> String {
        format!(
            "{{ [ -f {p} ] && kill -0 \"$(cat {p})\" 2>/dev/null; }}",
            p = self.path
        )
    }

    fn signal(&self, signal: &str) -> String {
        format!("kill -{signal} \"$(cat {p})\" 2>/dev/null", p = self.path)
    }

    fn after_launch(&self) -> String {
        format!("echo $! > {}", self.path)
    }

    fn after_stop(&self) -> String {
        format!("rm -f {}", self.path)
    }
}

pub fn handle_for(kind: ProcessIdentityKind, layout: &RemoteLayout) -> Box<dyn ProcessHandle> {
    match kind {
        ProcessIdentityKind::CommandLine => Box::new(CommandLinePattern::for_layout(layout)),
        ProcessIdentityKind::PidFile => Box::new(PidFile::for_layout(layout)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited within the grace period.
    Terminated,
    /// Needed `KILL`.
    Killed,
}

impl StopOutcome {
    /// State the service was in before the stop.
    pub fn prior_state(self) -> ServiceState {
        match self {
            StopOutcome::NotRunning => ServiceState::Stopped,
            StopOutcome::Terminated | StopOutcome::Killed => ServiceState::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleReport {
    pub stop: StopOutcome,
    pub state: ServiceState,
}

/// Graceful-then-forced stop. Prints one of `not-running`, `terminated`,
/// `killed`; exits non-zero if an instance survives `KILL`.
pub fn stop_script(layout: &RemoteLayout, handle: &dyn ProcessHandle, grace: Duration) -> String {
    let running = handle.running_check();
    format!(
        "{STOP_TAG}\n\
         systemctl --user stop {unit} >/dev/null 2>&1 || true\n\
         if ! {running}; then {cleanup}\necho not-running; exit 0; fi\n\
         {term} || true\n\
         i=0\n\
         while {running} && [ $i -lt {grace} ]; do sleep 1; i=$((i+1)); done\n\
         if ! {running}; then {cleanup}\necho terminated; exit 0; fi\n\
         {kill} || true\n\
         sleep 1\n\
         if {running}; then echo 'instance survived KILL' >&2; exit 1; fi\n\
         {cleanup}\n\
         echo killed\n",
        unit = layout.unit_name,
        cleanup = or_true(handle.after_stop()),
        term = handle.signal("TERM"),
        kill = handle.signal("KILL"),
        grace = grace.as_secs(),
    )
}

/// Detached launch with output appended to the service log.
pub fn start_script(layout: &RemoteLayout, handle: &dyn ProcessHandle) -> String {
    let python = format!("{}/bin/python", home_path(&layout.venv_dir));
    let args = layout
        .entry_args()
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{START_TAG}\n\
         set -e\n\
         mkdir -p {logs}\n\
         cd {root}\n\
         nohup setsid {python} {args} >> {log} 2>&1 < /dev/null &\n\
         {after}\n\
         echo started\n",
        logs = home_path(&layout.logs_dir),
        root = home_path(&layout.install_root),
        log = home_path(&layout.service_log),
        after = or_true(handle.after_launch()),
    )
}

fn or_true(fragment: String) -> String {
    if fragment.is_empty() {
        "true".to_string()
    } else {
        fragment
    }
}

pub fn parse_stop_outcome(stdout: &str) -> Option<StopOutcome> {
    match stdout.lines().rev().find(|l| !l.trim().is_empty())?.trim() {
        "not-running" => Some(StopOutcome::NotRunning),
        "terminated" => Some(StopOutcome::Terminated),
        "killed" => Some(StopOutcome::Killed),
        _ => None,
    }
}

#[instrument(skip_all, fields(destination = %remote.destination(), profile = %layout.profile))]
pub fn stop<R: Remote>(
    remote: &R,
    layout: &RemoteLayout,
    handle: &dyn ProcessHandle,
    grace: Duration,
) -> Result<StopOutcome, DeployError> {
    let out = remote
        .exec(&stop_script(layout, handle, grace))
        .and_then(|out| out.check("stop service"))
        .map_err(DeployError::lifecycle)?;
    let outcome = parse_stop_outcome(&out.stdout).ok_or_else(|| {
        DeployError::Lifecycle(format!("unexpected stop output: {}", out.stdout.trim()))
    })?;
    match outcome {
        StopOutcome::NotRunning => info!("no running instance"),
        StopOutcome::Terminated => info!("previous instance terminated"),
        StopOutcome::Killed => warn!("previous instance ignored TERM and was killed"),
    }
    Ok(outcome)
}

#[instrument(skip_all, fields(destination = %remote.destination(), profile = %layout.profile))]
pub fn start<R: Remote>(
    remote: &R,
    layout: &RemoteLayout,
    handle: &dyn ProcessHandle,
) -> Result<ServiceState, DeployError> {
    remote
        .exec(&start_script(layout, handle))
        .and_then(|out| out.check("start service"))
        .map_err(DeployError::lifecycle)?;
    info!(log = %layout.service_log, "service launched");
    Ok(ServiceState::Starting)
}

/// Stop whatever runs, then start one fresh instance.
pub fn restart<R: Remote>(
    remote: &R,
    layout: &RemoteLayout,
    handle: &dyn ProcessHandle,
    grace: Duration,
) -> Result<LifecycleReport, DeployError> {
    let stopped = stop(remote, layout, handle, grace)?;
    let state = start(remote, layout, handle)?;
    Ok(LifecycleReport {
        stop: stopped,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::remote::ExecOutput;
    use crate::test_support::FakeRemote;

    fn layout() -> RemoteLayout {
        RemoteLayout::for_profile("alice")
    }

    #[test]
    fn pattern_does_not_match_other_profiles_or_itself() {
        let handle = CommandLinePattern::for_layout(&layout());
        let re = regex::Regex::new(handle.pattern()).expect("valid regex");

        assert!(re.is_match("/home/pi/agentfleet/alice/.venv/bin/python -m core.agent --profile alice"));
        assert!(!re.is_match("python -m core.agent --profile alice2"));
        assert!(!re.is_match(&handle.running_check()));
    }

    #[test]
    fn stop_escalates_to_kill_after_grace() {
        let handle = CommandLinePattern::for_layout(&layout());
        let script = stop_script(&layout(), &handle, Duration::from_secs(3));
        let term = script.find("pkill -TERM").expect("term");
        let kill = script.find("pkill -KILL").expect("kill");
        assert!(term < kill);
        assert!(script.contains("[ $i -lt 3 ]"));
    }

    #[test]
    fn pid_file_strategy_records_and_clears_the_pid() {
        let handle = PidFile::for_layout(&layout());
        assert!(start_script(&layout(), &handle).contains("echo $! > \"$HOME\"/'agentdata/alice/service.pid'"));
        assert!(stop_script(&layout(), &handle, Duration::from_secs(1))
            .contains("rm -f \"$HOME\"/'agentdata/alice/service.pid'"));
    }

    #[test]
    fn start_is_detached_and_logged() {
        let script = start_script(&layout(), &CommandLinePattern::for_layout(&layout()));
        assert!(script.contains(
            "nohup setsid \"$HOME\"/'agentfleet/alice/.venv'/bin/python '-m' 'core.agent' '--profile' 'alice' >> \"$HOME\"/'agentdata/alice/logs/service.log' 2>&1 < /dev/null &"
        ));
    }

    #[test]
    fn parses_stop_outcomes() {
        assert_eq!(parse_stop_outcome("not-running\n"), Some(StopOutcome::NotRunning));
        assert_eq!(parse_stop_outcome("killed"), Some(StopOutcome::Killed));
        assert_eq!(parse_stop_outcome(""), None);
    }

    #[test]
    fn restart_without_prior_instance_is_fine() {
        let remote = FakeRemote::new();
        let handle = CommandLinePattern::for_layout(&layout());
        let report = restart(&remote, &layout(), &handle, Duration::from_secs(0)).expect("restart");
        assert_eq!(report.stop, StopOutcome::NotRunning);
        assert_eq!(report.state, ServiceState::Starting);
        assert_eq!(remote.lifecycle_events(), vec!["stop", "start"]);
        assert_eq!(remote.running_instances("alice"), 1);
    }

    #[test]
    fn second_restart_sees_a_running_instance() {
        let remote = FakeRemote::new();
        let handle = CommandLinePattern::for_layout(&layout());
        let first = restart(&remote, &layout(), &handle, Duration::from_secs(0)).expect("first");
        let second = restart(&remote, &layout(), &handle, Duration::from_secs(0)).expect("second");
        assert_eq!(first.stop.prior_state(), ServiceState::Stopped);
        assert_eq!(second.stop, StopOutcome::Terminated);
        assert_eq!(second.stop.prior_state(), ServiceState::Running);
        assert_eq!(StopOutcome::Killed.prior_state(), ServiceState::Running);
    }

    #[test]
    fn failed_stop_prevents_start() {
        let remote = FakeRemote::new();
        remote.respond(STOP_TAG, ExecOutput::failed(1, "instance survived KILL"));
        let handle = CommandLinePattern::for_layout(&layout());
        let err = restart(&remote, &layout(), &handle, Duration::from_secs(0)).unwrap_err();
        assert!(matches!(err, DeployError::Lifecycle(_)));
        assert!(!remote.ran(START_TAG));
    }
}
