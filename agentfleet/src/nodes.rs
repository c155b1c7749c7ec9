//! `add_node` and `install_deploy_key` commands.

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::config::{DeployConfig, expand_home};
use crate::io::connect::Connector;
use crate::io::deploy_key::{KeyInstall, install_key, read_public_key};
use crate::io::layout::OperatorPaths;
use crate::io::registry::{Node, load_registry_or_default, write_registry};
use crate::io::remote::{SshTarget, public_key_path};

/// Create or update a registry entry, keeping every other entry.
pub fn add_node(paths: &OperatorPaths, name: &str, host: &str, user: Option<&str>) -> Result<Node> {
    if host.trim().is_empty() {
        return Err(anyhow!("host must not be empty"));
    }
    let mut registry = load_registry_or_default(&paths.registry_path)?;
    registry.upsert(name, host, user)?;
    write_registry(&paths.registry_path, &registry)?;
    let node = registry
        .find(name)?
        .ok_or_else(|| anyhow!("node '{name}' missing after upsert"))?;
    info!(node = %node.id, host = %node.host, "registry updated");
    Ok(node)
}

/// Where to install a key: explicit host/user, else the registry entry.
pub fn key_target(
    paths: &OperatorPaths,
    node: &str,
    host: Option<&str>,
    user: Option<&str>,
) -> Result<(SshTarget, Option<Node>)> {
    let registry = load_registry_or_default(&paths.registry_path)?;
    let entry = registry.find(node)?;
    let host = host
        .map(str::to_string)
        .or_else(|| entry.as_ref().map(|n| n.host.clone()))
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| anyhow!("no host given and '{node}' has no registry entry with a host"))?;
    let user = user
        .map(str::to_string)
        .or_else(|| entry.as_ref().and_then(|n| n.user.clone()));
    Ok((SshTarget::new(host, user), entry))
}

/// Append the deploy public key to the host's `authorized_keys`.
///
/// Connects with the operator's ambient identity, since the deploy key is
/// not trusted yet.
pub fn install_deploy_key<C: Connector>(
    paths: &OperatorPaths,
    cfg: &DeployConfig,
    connector: &C,
    node: &str,
    host: Option<&str>,
    user: Option<&str>,
) -> Result<(SshTarget, KeyInstall)> {
    let (target, entry) = key_target(paths, node, host, user)?;
    let private_key = entry
        .and_then(|n| n.key)
        .map(|key| expand_home(&key))
        .unwrap_or_else(|| cfg.deploy_key());
    let public = public_key_path(&private_key);
    let key = read_public_key(&public).with_context(|| {
        format!(
            "deploy public key (create it with: ssh-keygen -t ed25519 -f {})",
            private_key.display()
        )
    })?;

    let connection = connector.connect(&target, None)?;
    let result = install_key(&connection.session, &key)
        .with_context(|| format!("install key on {}", target.destination()))?;
    Ok((target, result))
}
