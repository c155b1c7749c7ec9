//! CLI tests for commands that never reach a remote host.
//!
//! Spawns the agentfleet binary and verifies exit codes and the files it
//! leaves in the operator repository.

use std::process::Command;

use agentfleet::exit_codes;
use agentfleet::io::layout::OperatorPaths;
use agentfleet::io::registry::load_registry;

fn agentfleet(root: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_agentfleet"));
    cmd.arg("--root").arg(root).env("RUST_LOG", "off");
    cmd
}

#[test]
fn add_node_creates_registry() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = agentfleet(temp.path())
        .args(["add_node", "alice", "alice.lan", "pi"])
        .status()
        .expect("agentfleet add_node");
    assert_eq!(status.code(), Some(exit_codes::OK));

    let status = agentfleet(temp.path())
        .args(["add-node", "bob", "bob.lan"])
        .status()
        .expect("agentfleet add-node");
    assert_eq!(status.code(), Some(exit_codes::OK));

    let registry = load_registry(&OperatorPaths::new(temp.path()).registry_path).expect("load");
    assert_eq!(registry.nodes.len(), 2);
    assert_eq!(registry.nodes["alice"].user.as_deref(), Some("pi"));
}

#[test]
fn deploy_all_without_registry_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = agentfleet(temp.path())
        .arg("deploy_all")
        .output()
        .expect("agentfleet deploy_all");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn malformed_profile_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = agentfleet(temp.path())
        .args(["deploy", "Not A Profile", "h.lan"])
        .output()
        .expect("agentfleet deploy");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn broken_config_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = OperatorPaths::new(temp.path());
    std::fs::create_dir_all(&paths.config_dir).expect("config dir");
    std::fs::write(&paths.config_path, "[timeouts]\nstage_secs = \"soon\"\n").expect("config");

    let output = agentfleet(temp.path())
        .args(["add_node", "alice", "alice.lan"])
        .output()
        .expect("agentfleet add_node");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("agentfleet.toml"));
}
