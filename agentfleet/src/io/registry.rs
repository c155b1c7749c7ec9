//! Node registry (`config/nodes.yaml`).
//!
//! The file is shared with the managed service's control plane, so fields
//! this tool does not know about are carried through reads and writes.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Index;
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml_ng::{Mapping, Value};

use crate::core::profile::validate_profile;
use crate::error::DeployError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub nodes: NodeTable,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Node entries in file order. Fleet runs and rewrites keep the order the
/// operator wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTable(Vec<(String, NodeEntry)>);

impl NodeTable {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeEntry)> {
        self.0.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn get(&self, id: &str) -> Option<&NodeEntry> {
        self.iter().find(|(key, _)| *key == id).map(|(_, entry)| entry)
    }

    /// Existing entry for `id`, or a new empty one appended at the end.
    pub fn entry_or_default(&mut self, id: &str) -> &mut NodeEntry {
        let index = match self.0.iter().position(|(key, _)| key == id) {
            Some(index) => index,
            None => {
                self.0.push((id.to_string(), NodeEntry::default()));
                self.0.len() - 1
            }
        };
        &mut self.0[index].1
    }
}

impl Index<&str> for NodeTable {
    type Output = NodeEntry;

    fn index(&self, id: &str) -> &NodeEntry {
        match self.get(id) {
            Some(entry) => entry,
            None => panic!("no node '{id}' in registry"),
        }
    }
}

impl Serialize for NodeTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut mapping = Mapping::with_capacity(self.0.len());
        for (id, entry) in &self.0 {
            let value = serde_yaml_ng::to_value(entry).map_err(S::Error::custom)?;
            mapping.insert(Value::String(id.clone()), value);
        }
        mapping.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mapping = Option::<Mapping>::deserialize(deserializer)?.unwrap_or_default();
        let mut nodes = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let id = match key {
                Value::String(id) => id,
                Value::Number(n) => n.to_string(),
                other => return Err(D::Error::custom(format!("node id must be a string, got {other:?}"))),
            };
            let entry = serde_yaml_ng::from_value(value)
                .map_err(|err| D::Error::custom(format!("node '{id}': {err}")))?;
            nodes.push((id, entry));
        }
        Ok(Self(nodes))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Defaults to the node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Node-specific deploy key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A registry entry with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub profile: String,
    pub host: String,
    pub user: Option<String>,
    pub key: Option<PathBuf>,
}

impl Node {
    /// Host not filled in yet: empty or ending in `.TBD`.
    pub fn is_placeholder(&self) -> bool {
        is_placeholder_host(&self.host)
    }
}

pub fn is_placeholder_host(host: &str) -> bool {
    let host = host.trim();
    host.is_empty() || host.to_ascii_uppercase().ends_with(".TBD")
}

impl Registry {
    /// Resolved nodes in file order.
    ///
    /// Rejects invalid profile names and two nodes sharing a profile.
    pub fn resolved_nodes(&self) -> Result<Vec<Node>, DeployError> {
        let mut owners: HashMap<String, &str> = HashMap::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (id, entry) in self.nodes.iter() {
            let profile = entry
                .profile
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .unwrap_or(id)
                .to_string();
            validate_profile(&profile)
                .map_err(|err| DeployError::Registry(format!("node '{id}': {err}")))?;
            if let Some(other) = owners.insert(profile.clone(), id) {
                return Err(DeployError::Registry(format!(
                    "nodes '{other}' and '{id}' share profile '{profile}'"
                )));
            }
            nodes.push(Node {
                id: id.to_string(),
                profile,
                host: entry.host.trim().to_string(),
                user: entry
                    .user
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string),
                key: entry.key.clone(),
            });
        }
        Ok(nodes)
    }

    /// Look a node up by id, falling back to profile name.
    pub fn find(&self, name: &str) -> Result<Option<Node>, DeployError> {
        let nodes = self.resolved_nodes()?;
        if let Some(node) = nodes.iter().find(|n| n.id == name) {
            return Ok(Some(node.clone()));
        }
        Ok(nodes.into_iter().find(|n| n.profile == name))
    }

    /// Create or update `name`. Other entries and unknown fields are kept;
    /// `user` is only replaced when given.
    pub fn upsert(&mut self, name: &str, host: &str, user: Option<&str>) -> Result<(), DeployError> {
        validate_profile(name).map_err(|err| DeployError::Registry(format!("{err}")))?;
        let entry = self.nodes.entry_or_default(name);
        entry.host = host.trim().to_string();
        if let Some(user) = user.map(str::trim).filter(|u| !u.is_empty()) {
            entry.user = Some(user.to_string());
        }
        self.resolved_nodes().map(|_| ())
    }
}

/// Load the registry. A missing file is an error.
pub fn load_registry(path: &Path) -> Result<Registry, DeployError> {
    let contents = fs::read_to_string(path)
        .map_err(|err| DeployError::Registry(format!("read {}: {err}", path.display())))?;
    parse_registry(&contents)
        .map_err(|err| DeployError::Registry(format!("{}: {}", path.display(), err.reason())))
}

/// Load the registry, treating a missing file as empty.
pub fn load_registry_or_default(path: &Path) -> Result<Registry, DeployError> {
    if !path.exists() {
        return Ok(Registry::default());
    }
    load_registry(path)
}

pub fn parse_registry(contents: &str) -> Result<Registry, DeployError> {
    if contents.trim().is_empty() {
        return Ok(Registry::default());
    }
    let registry: Registry = serde_yaml_ng::from_str(contents)
        .map_err(|err| DeployError::Registry(format!("parse: {err}")))?;
    registry.resolved_nodes()?;
    Ok(registry)
}

/// Atomically write the registry (temp file + rename).
pub fn write_registry(path: &Path, registry: &Registry) -> Result<(), DeployError> {
    let buf = serde_yaml_ng::to_string(registry)
        .map_err(|err| DeployError::Registry(format!("serialize: {err}")))?;
    let io_err = |what: &str, p: &Path, err: std::io::Error| {
        DeployError::Registry(format!("{what} {}: {err}", p.display()))
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| io_err("create directory", parent, err))?;
    }
    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, buf).map_err(|err| io_err("write", &tmp_path, err))?;
    fs::rename(&tmp_path, path).map_err(|err| io_err("replace", path, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
nodes:
  alice:
    host: alice.lan
    user: pi
    telegram_topic: 12
  family:
    profile: family_hub
    host: hub.TBD
  bob:
    host: ''
";

    #[test]
    fn resolves_profiles_and_placeholders() {
        let registry = parse_registry(SAMPLE).expect("parse");
        let nodes = registry.resolved_nodes().expect("nodes");
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "family", "bob"]);

        assert_eq!(nodes[0].user.as_deref(), Some("pi"));
        assert!(!nodes[0].is_placeholder());
        assert_eq!(nodes[1].profile, "family_hub");
        assert!(nodes[1].is_placeholder());
        assert!(nodes[2].is_placeholder());
    }

    #[test]
    fn duplicate_profiles_are_rejected() {
        let err = parse_registry("nodes:\n  a:\n    profile: x\n    host: h1\n  b:\n    profile: x\n    host: h2\n")
            .unwrap_err();
        assert!(matches!(err, DeployError::Registry(_)));
        assert!(err.reason().contains("share profile 'x'"));
    }

    #[test]
    fn find_accepts_id_or_profile() {
        let registry = parse_registry(SAMPLE).expect("parse");
        assert_eq!(registry.find("family").expect("find").expect("node").profile, "family_hub");
        assert_eq!(registry.find("family_hub").expect("find").expect("node").id, "family");
        assert!(registry.find("nobody").expect("find").is_none());
    }

    #[test]
    fn upsert_keeps_other_entries_and_unknown_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config/nodes.yaml");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, SAMPLE).expect("write");

        let mut registry = load_registry(&path).expect("load");
        registry.upsert("bob", "bob.lan", None).expect("upsert");
        registry.upsert("alice", "alice2.lan", None).expect("upsert");
        write_registry(&path, &registry).expect("write");

        let reloaded = load_registry(&path).expect("reload");
        assert_eq!(reloaded.nodes.len(), 3);
        assert_eq!(reloaded.nodes["bob"].host, "bob.lan");
        assert_eq!(reloaded.nodes["alice"].host, "alice2.lan");
        assert_eq!(reloaded.nodes["alice"].user.as_deref(), Some("pi"));
        assert!(reloaded.nodes["alice"].extra.contains_key("telegram_topic"));
        assert_eq!(reloaded.nodes["family"].profile.as_deref(), Some("family_hub"));
    }

    #[test]
    fn rewrite_keeps_file_order_and_appends_new_nodes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nodes.yaml");
        fs::write(&path, "nodes:\n  zed:\n    host: zed.lan\n  amy:\n    host: amy.lan\n")
            .expect("write");

        let mut registry = load_registry(&path).expect("load");
        registry.upsert("amy", "amy2.lan", None).expect("upsert");
        registry.upsert("bea", "bea.lan", None).expect("upsert");
        write_registry(&path, &registry).expect("write");

        let text = fs::read_to_string(&path).expect("read");
        let zed = text.find("zed:").expect("zed");
        let amy = text.find("amy:").expect("amy");
        let bea = text.find("bea:").expect("bea");
        assert!(zed < amy && amy < bea, "{text}");

        let ids: Vec<String> = load_registry(&path)
            .expect("reload")
            .resolved_nodes()
            .expect("nodes")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, ["zed", "amy", "bea"]);
    }

    #[test]
    fn empty_nodes_key_is_an_empty_table() {
        let registry = parse_registry("nodes:\n").expect("parse");
        assert!(registry.nodes.is_empty());
    }

    #[test]
    fn missing_file_is_a_registry_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_registry(&temp.path().join("nodes.yaml")).unwrap_err();
        assert!(matches!(err, DeployError::Registry(_)));
        assert!(
            load_registry_or_default(&temp.path().join("nodes.yaml"))
                .expect("default")
                .nodes
                .is_empty()
        );
    }

    #[test]
    fn invalid_node_name_is_rejected_on_upsert() {
        let mut registry = Registry::default();
        assert!(registry.upsert("Bad Name", "h", None).is_err());
    }
}
