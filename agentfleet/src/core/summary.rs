//! End-of-run fleet summary.

use serde::Serialize;

use super::types::DeploymentJob;

/// Node left out of the run before any remote contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedNode {
    pub node: String,
    pub reason: String,
}

/// Aggregated outcomes of a fleet run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub jobs: Vec<DeploymentJob>,
    pub skipped: Vec<SkippedNode>,
}

impl FleetSummary {
    pub fn record(&mut self, job: DeploymentJob) {
        self.jobs.push(job);
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DeploymentJob> {
        self.jobs.iter().filter(|job| job.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeploymentJob> {
        self.jobs.iter().filter(|job| !job.succeeded())
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    /// True when no attempted node failed. Skipped placeholders do not count.
    pub fn all_succeeded(&self) -> bool {
        self.failure_count() == 0
    }

    /// Human-readable summary lines, including retry guidance on failure.
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "summary: {} succeeded, {} failed, {} skipped",
            self.success_count(),
            self.failure_count(),
            self.skipped.len()
        )];
        for job in self.succeeded() {
            lines.push(format!("  ok     {} ({})", job.profile, job.host));
            for warning in &job.warnings {
                lines.push(format!("         warning: {warning}"));
            }
        }
        for job in self.failed() {
            lines.push(format!(
                "  FAILED {} ({}): {}",
                job.profile,
                job.host,
                job.reason()
            ));
        }
        for skipped in &self.skipped {
            lines.push(format!("  skip   {}: {}", skipped.node, skipped.reason));
        }
        if !self.all_succeeded() {
            lines.push("retry failed nodes individually with:".to_string());
            for job in self.failed() {
                lines.push(format!("  agentfleet deploy {} {}", job.profile, job.host));
            }
            lines.push("or re-run `agentfleet deploy_all`; deployments are idempotent".to_string());
        }
        lines
    }
}
