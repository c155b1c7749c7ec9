//! Stable exit codes for agentfleet CLI commands.

/// Command succeeded; every attempted node deployed.
pub const OK: i32 = 0;
/// Invalid invocation, config or registry; no host was changed.
pub const INVALID: i32 = 1;
/// `deploy` failed, or every node of `deploy_all` failed.
pub const NODE_FAILED: i32 = 2;
/// `deploy_all` finished with some nodes failed and some deployed.
pub const PARTIAL: i32 = 3;
