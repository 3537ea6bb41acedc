//! TopologySpec -> per-node daemon configuration.

use super::{Backend, TopologySpec, fragment, fragment_entry};
use crate::error::{HarnessError, Result};
use crate::ports::PortAllocator;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of each node's control socket inside its working directory.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";
/// File name of each node's generated config inside its working directory.
pub const CONFIG_FILE_NAME: &str = "node.yaml";

/// Where a mesh keeps its per-node state on disk.
#[derive(Debug, Clone)]
pub struct MeshLayout {
    root: PathBuf,
}

impl MeshLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory exclusively owned by `node`.
    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    pub fn control_socket(&self, node: &str) -> PathBuf {
        self.node_dir(node).join(CONTROL_SOCKET_NAME)
    }

    pub fn config_path(&self, node: &str) -> PathBuf {
        self.node_dir(node).join(CONFIG_FILE_NAME)
    }
}

/// Concrete configuration for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    /// Fragment list consumed by the daemon, in order
    pub fragments: Vec<Value>,
    pub control_socket: PathBuf,
    /// Loopback listeners this node will bind
    pub listeners: Vec<(Backend, u16)>,
    /// Outbound peer addresses, by peer name
    pub peers: BTreeMap<String, String>,
}

impl NodeConfig {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.fragments)?)
    }

    /// Persist the config, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// First fragment with the given key, if any.
    pub fn find(&self, key: &str) -> Option<&Value> {
        self.fragments
            .iter()
            .filter_map(fragment_entry)
            .find(|(k, _)| *k == key)
            .map(|(_, body)| body)
    }
}

/// Flatten `spec` into one [`NodeConfig`] per node.
///
/// Listener ports not set explicitly are reserved from the OS up front, so
/// every node can start concurrently. Fails before touching anything if the
/// topology is invalid.
pub fn materialize(
    spec: &TopologySpec,
    layout: &MeshLayout,
    log_level: &str,
) -> Result<BTreeMap<String, NodeConfig>> {
    spec.validate()?;

    let mut ports = PortAllocator::new();
    // (node, fragment index) -> (backend, port)
    let mut bound: BTreeMap<(String, usize), (Backend, u16)> = BTreeMap::new();
    // node -> its nodedef with listener ports filled in
    let mut filled: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for (name, node) in &spec.nodes {
        let mut fragments = Vec::with_capacity(node.nodedef.len());
        for (index, raw) in node.nodedef.iter().enumerate() {
            let Some(backend) = node.listener_at(index) else {
                fragments.push(raw.clone());
                continue;
            };
            let mut body = listener_body(name, index, raw)?;
            let port = match body.get("port") {
                Some(value) => value
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| {
                        HarnessError::construction(format!(
                            "node {name} listener {index} has invalid port {value:?}"
                        ))
                    })?,
                None => ports.reserve(backend)?,
            };
            body.insert("port".into(), Value::from(port));
            bound.insert((name.clone(), index), (backend, port));
            fragments.push(fragment(backend.listener_key(), body));
        }
        filled.insert(name.clone(), fragments);
    }

    let mut configs = BTreeMap::new();
    for (name, node) in &spec.nodes {
        let control_socket = layout.control_socket(name);
        let mut fragments = vec![
            fragment("node", mapping([("id", Value::from(name.as_str()))])),
            fragment("log-level", mapping([("level", Value::from(log_level))])),
            fragment(
                "control-service",
                mapping([
                    ("service", Value::from("control")),
                    ("filename", Value::from(control_socket.to_string_lossy().into_owned())),
                ]),
            ),
        ];

        let mut peers = BTreeMap::new();
        for (peer, connection) in &node.connections {
            let (backend, port) = bound
                .get(&(peer.clone(), connection.index))
                .copied()
                .ok_or_else(|| {
                    HarnessError::construction(format!(
                        "node {name} connects to {peer} at index {}, which is not a listener",
                        connection.index
                    ))
                })?;
            let address = backend.peer_address(port);
            let mut body = mapping([("address", Value::from(address.as_str()))]);
            if let Some(profile) = &connection.tls {
                body.insert("tls".into(), Value::from(profile.as_str()));
            }
            fragments.push(fragment(backend.peer_key(), body));
            peers.insert(peer.clone(), address);
        }

        let listeners = bound
            .iter()
            .filter(|((owner, _), _)| owner == name)
            .map(|(_, listener)| *listener)
            .collect();

        fragments.extend(filled.remove(name).unwrap_or_default());
        configs.insert(
            name.clone(),
            NodeConfig {
                name: name.clone(),
                fragments,
                control_socket,
                listeners,
                peers,
            },
        );
    }

    ports.release();
    Ok(configs)
}

fn listener_body(node: &str, index: usize, raw: &Value) -> Result<Mapping> {
    match fragment_entry(raw).map(|(_, body)| body) {
        Some(Value::Mapping(body)) => Ok(body.clone()),
        Some(Value::Null) => Ok(Mapping::new()),
        _ => Err(HarnessError::construction(format!(
            "node {node} listener {index} must be a mapping"
        ))),
    }
}

fn mapping<const N: usize>(entries: [(&str, Value); N]) -> Mapping {
    entries
        .into_iter()
        .map(|(k, v)| (Value::from(k), v))
        .collect()
}
