//! Side-effecting operations: local files, child processes, remote hosts.

pub mod bootstrap;
pub mod config;
pub mod connect;
pub mod credentials;
pub mod deploy_key;
pub mod descriptor;
pub mod layout;
pub mod lifecycle;
pub mod notify;
pub mod process;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod secrets;
pub mod sync;
