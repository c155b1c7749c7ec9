//! Remote host access over SSH.
//!
//! The [`Remote`] trait is the seam between the deployment stages and the
//! network: stages compose shell scripts and hand them to a `Remote`, tests
//! hand them to a scripted fake instead of a real host.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::AuthPath;
use crate::io::process::{CommandOutput, run_with_timeout};

/// Where to connect: `user@host` or just `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: Option<String>) -> Self {
        Self {
            host: host.into(),
            user: user.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    /// Exit code; `None` if killed by a signal or the deadline.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// Turn a non-zero exit into an error naming `what`.
    pub fn check(self, what: &str) -> Result<Self> {
        if self.timed_out {
            return Err(anyhow!("{what} timed out"));
        }
        if !self.success() {
            let detail = self.stderr.trim();
            let detail = if detail.is_empty() {
                self.stdout.trim()
            } else {
                detail
            };
            return Err(anyhow!(
                "{what} failed (exit {}): {detail}",
                self.code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            ));
        }
        Ok(self)
    }
}

impl From<CommandOutput> for ExecOutput {
    fn from(out: CommandOutput) -> Self {
        Self {
            code: if out.timed_out { None } else { out.status.code() },
            stdout: out.stdout_text(),
            stderr: out.stderr_text(),
            timed_out: out.timed_out,
        }
    }
}

/// Parameters for mirroring a local tree to the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRequest {
    pub local_root: PathBuf,
    /// Destination directory, relative to the remote home.
    pub remote_dir: String,
    pub excludes: Vec<String>,
}

/// Operations the deployment stages need from a host.
pub trait Remote {
    /// `user@host`, for logs and messages.
    fn destination(&self) -> String;

    /// Run a POSIX shell script on the host.
    fn exec(&self, script: &str) -> Result<ExecOutput>;

    /// Run a script with `input` on its stdin (file contents, crontab, keys).
    fn exec_with_input(&self, script: &str, input: &[u8]) -> Result<ExecOutput>;

    /// Make `request.remote_dir` an exact copy of `request.local_root`.
    fn mirror(&self, request: &MirrorRequest) -> Result<ExecOutput>;
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Shell word for a path relative to the remote home.
pub fn home_path(relative: &str) -> String {
    format!("\"$HOME\"/{}", shell_quote(relative))
}

/// Settings shared by every ssh/rsync invocation of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub options: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Directory for the shared-connection socket of ambient sessions. With
    /// `None` every command authenticates on its own.
    pub control_dir: Option<PathBuf>,
}

/// How long an idle shared ambient connection stays open.
const CONTROL_PERSIST_SECS: u64 = 120;

/// A `Remote` backed by the `ssh` and `rsync` binaries.
#[derive(Debug, Clone)]
pub struct SshSession {
    target: SshTarget,
    auth: AuthPath,
    settings: SessionSettings,
}

impl SshSession {
    pub fn new(target: SshTarget, auth: AuthPath, settings: SessionSettings) -> Self {
        Self {
            target,
            auth,
            settings,
        }
    }

    pub fn auth(&self) -> &AuthPath {
        &self.auth
    }

    /// ssh arguments before the destination.
    fn ssh_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for option in &self.settings.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let AuthPath::DeployKey(key) = &self.auth {
            args.push("-i".to_string());
            args.push(key.display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        if let (AuthPath::Ambient, Some(dir)) = (&self.auth, &self.settings.control_dir) {
            // The probe opens the master; later exec/rsync calls reuse it.
            for option in [
                "ControlMaster=auto".to_string(),
                format!("ControlPath={}", dir.join("agentfleet-%C").display()),
                format!("ControlPersist={CONTROL_PERSIST_SECS}"),
            ] {
                args.push("-o".to_string());
                args.push(option);
            }
        }
        args
    }

    fn ssh_command(&self, extra: &[String]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args())
            .args(extra)
            .arg(self.target.destination());
        cmd
    }

    /// Check the host answers with this session's credentials.
    ///
    /// Bounded by `connect_timeout` on the TCP/auth handshake and a matching
    /// wall-clock deadline on the whole probe.
    #[instrument(skip_all, fields(destination = %self.target.destination(), auth = %self.auth))]
    pub fn probe(&self, connect_timeout: Duration) -> Result<bool> {
        let extra = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        ];
        let mut cmd = self.ssh_command(&extra);
        cmd.arg("true");
        let deadline = match self.auth {
            // A prompt for the operator's passphrase needs more than the handshake bound.
            AuthPath::Ambient => self.settings.timeout,
            AuthPath::DeployKey(_) => connect_timeout + Duration::from_secs(5),
        };
        let out = run_with_timeout(cmd, None, deadline, self.settings.output_limit_bytes)
            .context("run ssh probe")?;
        if !out.success() {
            debug!(
                exit_code = ?out.status.code(),
                timed_out = out.timed_out,
                stderr = %out.stderr_text().trim(),
                "probe failed"
            );
        }
        Ok(out.success())
    }

    fn rsync_shell(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.ssh_args().iter().map(|arg| {
            if arg.contains(char::is_whitespace) {
                shell_quote(arg)
            } else {
                arg.clone()
            }
        }));
        parts.join(" ")
    }

    fn rsync_command(&self, request: &MirrorRequest) -> Command {
        let mut cmd = Command::new("rsync");
        cmd.arg("-az")
            .arg("--delete")
            .arg("--rsync-path")
            .arg(format!(
                "mkdir -p {} && rsync",
                shell_quote(&request.remote_dir)
            ))
            .arg("-e")
            .arg(self.rsync_shell());
        for pattern in &request.excludes {
            cmd.arg("--exclude").arg(pattern);
        }
        // Trailing slashes: copy the contents, not the directory itself.
        cmd.arg(format!("{}/", request.local_root.display()));
        cmd.arg(format!(
            "{}:{}/",
            self.target.destination(),
            request.remote_dir.trim_end_matches('/')
        ));
        cmd
    }
}

impl Remote for SshSession {
    fn destination(&self) -> String {
        self.target.destination()
    }

    fn exec(&self, script: &str) -> Result<ExecOutput> {
        let mut cmd = self.ssh_command(&[]);
        cmd.arg(format!("sh -c {}", shell_quote(script)));
        let out = run_with_timeout(cmd, None, self.settings.timeout, self.settings.output_limit_bytes)
            .with_context(|| format!("ssh {}", self.target.destination()))?;
        if out.timed_out {
            warn!(destination = %self.target.destination(), "remote command timed out");
        }
        Ok(out.into())
    }

    fn exec_with_input(&self, script: &str, input: &[u8]) -> Result<ExecOutput> {
        let mut cmd = self.ssh_command(&[]);
        cmd.arg(format!("sh -c {}", shell_quote(script)));
        let out = run_with_timeout(
            cmd,
            Some(input),
            self.settings.timeout,
            self.settings.output_limit_bytes,
        )
        .with_context(|| format!("ssh {}", self.target.destination()))?;
        Ok(out.into())
    }

    #[instrument(skip_all, fields(destination = %self.target.destination(), remote_dir = %request.remote_dir))]
    fn mirror(&self, request: &MirrorRequest) -> Result<ExecOutput> {
        let cmd = self.rsync_command(request);
        let out = run_with_timeout(cmd, None, self.settings.timeout, self.settings.output_limit_bytes)
            .context("run rsync")?;
        Ok(out.into())
    }
}

/// Check a local binary is on PATH and answers `version_flag`.
pub fn local_tool_available(program: &str, version_flag: &str) -> bool {
    Command::new(program)
        .arg(version_flag)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Public half of a key pair: `key.pub` next to `key`.
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}
