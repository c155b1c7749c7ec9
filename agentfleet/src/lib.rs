//! Idempotent deployer for a fleet of independently owned hosts.
//!
//! Each node gets the same pipeline: resolve how to connect, mirror the code
//! tree, prepare the runtime and service unit, write secrets, install the
//! maintenance crontab block and cycle the service process. Re-running with
//! the same inputs converges to the same remote state.
//!
//! - **[`core`]**: Pure logic (credential cascade, crontab patching, job
//!   bookkeeping). No I/O.
//! - **[`io`]**: Side effects (ssh/rsync, local files, HTTP), behind traits
//!   where tests need to substitute a fake host.
//!
//! [`pipeline`] and [`fleet`] compose the two; [`deploy`], [`nodes`] and
//! [`notify`] implement the CLI commands.

pub mod core;
pub mod deploy;
pub mod error;
pub mod exit_codes;
pub mod fleet;
pub mod io;
pub mod logging;
pub mod nodes;
pub mod notify;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
