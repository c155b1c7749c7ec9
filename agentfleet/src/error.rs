//! Failure taxonomy for deployments.
//!
//! Node-scoped variants abort only that node's pipeline. `Registry` and
//! `Config` abort before any remote contact.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("host unreachable or authentication rejected: {0}")]
    Connectivity(String),
    #[error("file sync failed: {0}")]
    Sync(String),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("secret provisioning failed: {0}")]
    Secret(String),
    #[error("service start failed: {0}")]
    Lifecycle(String),
    #[error("node registry: {0}")]
    Registry(String),
    #[error("configuration: {0}")]
    Config(String),
}

impl DeployError {
    /// Wrap an `anyhow` chain, keeping every context line.
    pub fn connectivity(err: anyhow::Error) -> Self {
        Self::Connectivity(format!("{err:#}"))
    }

    pub fn sync(err: anyhow::Error) -> Self {
        Self::Sync(format!("{err:#}"))
    }

    pub fn bootstrap(err: anyhow::Error) -> Self {
        Self::Bootstrap(format!("{err:#}"))
    }

    pub fn secret(err: anyhow::Error) -> Self {
        Self::Secret(format!("{err:#}"))
    }

    pub fn lifecycle(err: anyhow::Error) -> Self {
        Self::Lifecycle(format!("{err:#}"))
    }

    /// Reason without the category prefix, for per-stage summaries.
    pub fn reason(&self) -> &str {
        match self {
            DeployError::Connectivity(reason)
            | DeployError::Sync(reason)
            | DeployError::Bootstrap(reason)
            | DeployError::Secret(reason)
            | DeployError::Lifecycle(reason)
            | DeployError::Registry(reason)
            | DeployError::Config(reason) => reason,
        }
    }
}
