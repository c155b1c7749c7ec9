//! Remote environment preparation: runtime, directories, virtualenv, unit.

use anyhow::Context;
use tracing::{info, instrument, warn};

use crate::core::profile::RemoteLayout;
use crate::error::DeployError;
use crate::io::config::{RuntimeSettings, parse_min_version};
use crate::io::descriptor::{register_unit_script, render_unit, write_unit_script};
use crate::io::remote::{Remote, home_path, shell_quote};

/// What bootstrap found and changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub runtime_version: (u32, u32),
    /// The package manager was invoked this run.
    pub runtime_installed: bool,
    /// Remote account the unit runs as.
    pub user: String,
    pub warnings: Vec<String>,
}

/// Bring the host to a state where the profile's service can run.
///
/// Every step is safe to repeat: an existing runtime, virtualenv or unit is
/// reused or overwritten, never duplicated.
#[instrument(skip_all, fields(destination = %remote.destination(), profile = %layout.profile))]
pub fn bootstrap<R: Remote>(
    remote: &R,
    layout: &RemoteLayout,
    runtime: &RuntimeSettings,
) -> Result<BootstrapReport, DeployError> {
    let minimum = parse_min_version(&runtime.min_version).ok_or_else(|| {
        DeployError::Config(format!("bad runtime.min_version '{}'", runtime.min_version))
    })?;

    let mut runtime_installed = false;
    let runtime_version = match probe_runtime(remote, &runtime.python)? {
        Some(found) if found >= minimum => found,
        found => {
            info!(?found, ?minimum, "runtime missing or too old, installing");
            install_runtime(remote, runtime)?;
            runtime_installed = true;
            match probe_runtime(remote, &runtime.python)? {
                Some(now) if now >= minimum => now,
                now => {
                    return Err(DeployError::Bootstrap(format!(
                        "{} is {} after install, need >= {}.{}",
                        runtime.python,
                        now.map(|(a, b)| format!("{a}.{b}"))
                            .unwrap_or_else(|| "absent".to_string()),
                        minimum.0,
                        minimum.1
                    )));
                }
            }
        }
    };

    remote
        .exec(&directories_script(layout))
        .and_then(|out| out.check("create profile directories"))
        .map_err(DeployError::bootstrap)?;

    remote
        .exec(&environment_script(layout, &runtime.python))
        .and_then(|out| out.check("prepare virtualenv"))
        .map_err(DeployError::bootstrap)?;

    let user = remote
        .exec("id -un")
        .and_then(|out| out.check("id -un"))
        .map(|out| out.stdout.trim().to_string())
        .map_err(DeployError::bootstrap)?;

    let unit = render_unit(layout, &user).map_err(DeployError::bootstrap)?;
    remote
        .exec_with_input(&write_unit_script(layout), unit.as_bytes())
        .and_then(|out| out.check("install unit file"))
        .map_err(DeployError::bootstrap)?;

    let mut warnings = Vec::new();
    let registered = remote
        .exec(&register_unit_script(layout))
        .and_then(|out| out.check("systemctl --user"));
    if let Err(err) = registered {
        let message = format!(
            "{} installed but not registered ({err:#}); run `loginctl enable-linger` for the user \
             and `systemctl --user daemon-reload` on the host",
            layout.unit_name
        );
        warn!("{message}");
        warnings.push(message);
    }

    info!(
        version = %format!("{}.{}", runtime_version.0, runtime_version.1),
        runtime_installed,
        %user,
        "bootstrap complete"
    );
    Ok(BootstrapReport {
        runtime_version,
        runtime_installed,
        user,
        warnings,
    })
}

/// `major.minor` of the remote interpreter, or `None` if it is not installed.
fn probe_runtime<R: Remote>(remote: &R, python: &str) -> Result<Option<(u32, u32)>, DeployError> {
    let out = remote
        .exec(&version_script(python))
        .context("probe runtime")
        .map_err(DeployError::bootstrap)?;
    if out.timed_out {
        return Err(DeployError::Bootstrap("runtime probe timed out".to_string()));
    }
    if !out.success() {
        return Ok(None);
    }
    Ok(parse_version(&out.stdout))
}

fn install_runtime<R: Remote>(remote: &R, runtime: &RuntimeSettings) -> Result<(), DeployError> {
    let manager = &runtime.package_manager;
    let present = remote
        .exec(&format!("command -v {}", shell_quote(manager)))
        .map_err(DeployError::bootstrap)?;
    if !present.success() {
        return Err(DeployError::Bootstrap(format!(
            "{manager} is not available on the host; install {} manually",
            runtime.python
        )));
    }
    remote
        .exec(&install_script(manager, &runtime.packages))
        .and_then(|out| out.check(&format!("{manager} install")))
        .map_err(DeployError::bootstrap)?;
    Ok(())
}

pub fn version_script(python: &str) -> String {
    format!(
        "{} -c 'import sys; print(\"%d.%d\" % sys.version_info[:2])'",
        shell_quote(python)
    )
}

/// Last non-empty line of the probe output, as `major.minor`.
pub fn parse_version(stdout: &str) -> Option<(u32, u32)> {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(parse_min_version)
}

fn install_script(manager: &str, packages: &[String]) -> String {
    let packages = packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    let manager = shell_quote(manager);
    format!(
        "set -e\n\
         if [ \"$(id -u)\" = 0 ]; then SUDO=; else SUDO='sudo -n'; fi\n\
         $SUDO {manager} update -q\n\
         $SUDO env DEBIAN_FRONTEND=noninteractive {manager} install -y -q {packages}\n"
    )
}

fn directories_script(layout: &RemoteLayout) -> String {
    format!(
        "set -e\nmkdir -p {install} {logs} {secrets}\nchmod 700 {secrets}\n",
        install = home_path(&layout.install_root),
        logs = home_path(&layout.logs_dir),
        secrets = home_path(&layout.secrets_dir),
    )
}

fn environment_script(layout: &RemoteLayout, python: &str) -> String {
    let venv = home_path(&layout.venv_dir);
    let requirements = home_path(&format!("{}/requirements.txt", layout.install_root));
    format!(
        "set -e\n\
         [ -x {venv}/bin/python ] || {python} -m venv {venv}\n\
         if [ -f {requirements} ]; then\n\
         {venv}/bin/python -m pip install -q --upgrade pip\n\
         {venv}/bin/python -m pip install -q -r {requirements}\n\
         fi\n",
        python = shell_quote(python),
    )
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
    fn parses_last_version_line() {
        assert_eq!(parse_version("3.12\n"), Some((3, 12)));
        assert_eq!(parse_version("warning: locale\n3.11\n\n"), Some((3, 11)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn current_runtime_skips_package_manager() {
        let remote = FakeRemote::new();
        let report = bootstrap(&remote, &layout(), &RuntimeSettings::default()).expect("bootstrap");

        assert_eq!(report.runtime_version, (3, 12));
        assert!(!report.runtime_installed);
        assert_eq!(report.user, "deploy");
        assert!(!remote.ran("apt-get"));
        let unit = remote.last_input_for("agentfleet-alice.service").expect("unit written");
        assert!(unit.contains("Environment=AGENT_USER=deploy"));
        assert!(remote.ran("systemctl --user daemon-reload"));
    }

    #[test]
    fn old_runtime_is_installed_then_rechecked() {
        let remote = FakeRemote::new();
        remote.respond_sequence(
            "sys.version_info",
            vec![ExecOutput::ok("3.8\n"), ExecOutput::ok("3.11\n")],
        );
        let report = bootstrap(&remote, &layout(), &RuntimeSettings::default()).expect("bootstrap");

        assert!(report.runtime_installed);
        assert_eq!(report.runtime_version, (3, 11));
        assert!(remote.ran("install -y -q 'python3' 'python3-venv' 'python3-pip'"));
    }

    #[test]
    fn missing_package_manager_is_a_bootstrap_failure() {
        let remote = FakeRemote::new();
        remote.respond("sys.version_info", ExecOutput::failed(127, "python3: not found"));
        remote.respond("command -v 'apt-get'", ExecOutput::failed(1, ""));

        let err = bootstrap(&remote, &layout(), &RuntimeSettings::default()).unwrap_err();
        assert!(matches!(err, DeployError::Bootstrap(_)));
        assert!(err.reason().contains("apt-get is not available"));
    }

    #[test]
    fn unregistered_unit_is_only_a_warning() {
        let remote = FakeRemote::new();
        remote.respond(
            "systemctl --user daemon-reload",
            ExecOutput::failed(1, "Failed to connect to bus"),
        );
        let report = bootstrap(&remote, &layout(), &RuntimeSettings::default()).expect("bootstrap");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("enable-linger"));
    }

    #[test]
    fn secrets_directory_is_private() {
        let script = directories_script(&layout());
        assert!(script.contains("chmod 700 \"$HOME\"/'agentdata/alice/secrets'"));
    }
}
