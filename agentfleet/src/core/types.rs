//! Shared deterministic types for deployment bookkeeping.
//!
//! These types describe what happened during a run. They never touch the
//! network or filesystem and are safe to construct directly in tests.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Pipeline stage for a single node, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Connect,
    Sync,
    Bootstrap,
    Secrets,
    Schedule,
    Lifecycle,
}

impl Stage {
    /// All stages in the order the pipeline runs them.
    pub const ORDER: [Stage; 6] = [
        Stage::Connect,
        Stage::Sync,
        Stage::Bootstrap,
        Stage::Secrets,
        Stage::Schedule,
        Stage::Lifecycle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Sync => "sync",
            Stage::Bootstrap => "bootstrap",
            Stage::Secrets => "secrets",
            Stage::Schedule => "schedule",
            Stage::Lifecycle => "lifecycle",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the remote host was reached for the rest of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPath {
    /// Dedicated non-interactive deploy key.
    DeployKey(PathBuf),
    /// Operator's default SSH identity (may prompt).
    Ambient,
}

impl fmt::Display for AuthPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPath::DeployKey(path) => write!(f, "deploy key {}", path.display()),
            AuthPath::Ambient => f.write_str("ambient identity"),
        }
    }
}

/// Lifecycle state of the managed service for one profile on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
}

/// Terminal outcome of a deployment job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Succeeded,
    Failed { stage: Stage, reason: String },
}

/// Ephemeral record of one (profile, host) deployment.
///
/// Lives only for the duration of an invocation; fleet runs summarize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentJob {
    pub profile: String,
    pub host: String,
    pub auth: Option<AuthPath>,
    /// Stages that finished, in order.
    pub completed: Vec<Stage>,
    /// Non-fatal problems (scheduling rejected, nothing to stop, ...).
    pub warnings: Vec<String>,
    pub outcome: JobOutcome,
}

impl DeploymentJob {
    pub fn new(profile: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            host: host.into(),
            auth: None,
            completed: Vec::new(),
            warnings: Vec::new(),
            outcome: JobOutcome::Succeeded,
        }
    }

    pub fn complete(&mut self, stage: Stage) {
        self.completed.push(stage);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn fail(&mut self, stage: Stage, reason: impl Into<String>) {
        self.outcome = JobOutcome::Failed {
            stage,
            reason: reason.into(),
        };
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded)
    }

    /// One-line reason for summaries.
    pub fn reason(&self) -> String {
        match &self.outcome {
            JobOutcome::Succeeded => "ok".to_string(),
            JobOutcome::Failed { stage, reason } => format!("{stage}: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_job_reports_stage_and_reason() {
        let mut job = DeploymentJob::new("alice", "alice.lan");
        job.complete(Stage::Connect);
        job.fail(Stage::Sync, "rsync exited with 23");

        assert!(!job.succeeded());
        assert_eq!(job.completed, vec![Stage::Connect]);
        assert_eq!(job.reason(), "sync: rsync exited with 23");
    }

    #[test]
    fn stage_order_is_pipeline_order() {
        let mut sorted = Stage::ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::ORDER.to_vec());
    }
}
