//! Declarative mesh topologies.
//!
//! A [`TopologySpec`] names every node, the peers each node dials, and the
//! raw configuration fragments handed to the daemon untouched. The document
//! shape mirrors the mesh-definition files the tests load:
//!
//! ```yaml
//! nodes:
//!   node1:
//!     connections: {}
//!     nodedef:
//!       - tcp-listener:
//!           cost: 4.5
//!   node2:
//!     connections:
//!       node1:
//!         index: 0
//!     nodedef: []
//! ```
//!
//! A connection's `index` selects a listener fragment in the *peer's*
//! `nodedef`; its optional `tls` names a `tls-client` profile defined in the
//! *connecting* node's own `nodedef`. [`TopologySpec::validate`] enforces both
//! before anything is materialized or launched.

mod materialize;

pub use materialize::{MeshLayout, NodeConfig, materialize};

use crate::error::{HarnessError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Transport backend of a listener / outbound peer stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    Tcp,
    Udp,
    Ws,
}

impl Backend {
    /// All backends, in the order test tables iterate them.
    pub fn all() -> &'static [Backend] {
        &[Backend::Tcp, Backend::Udp, Backend::Ws]
    }

    /// Config key of a listener on this backend.
    pub fn listener_key(&self) -> &'static str {
        match self {
            Backend::Tcp => "tcp-listener",
            Backend::Udp => "udp-listener",
            Backend::Ws => "ws-listener",
        }
    }

    /// Config key of an outbound connection on this backend.
    pub fn peer_key(&self) -> &'static str {
        match self {
            Backend::Tcp => "tcp-peer",
            Backend::Udp => "udp-peer",
            Backend::Ws => "ws-peer",
        }
    }

    /// Backend for a listener key, if `key` is one.
    pub fn from_listener_key(key: &str) -> Option<Self> {
        Backend::all()
            .iter()
            .copied()
            .find(|b| b.listener_key() == key)
    }

    /// Peer address for a loopback listener on `port`.
    pub fn peer_address(&self, port: u16) -> String {
        match self {
            Backend::Tcp | Backend::Udp => format!("127.0.0.1:{port}"),
            Backend::Ws => format!("ws://127.0.0.1:{port}"),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Tcp => write!(f, "tcp"),
            Backend::Udp => write!(f, "udp"),
            Backend::Ws => write!(f, "ws"),
        }
    }
}

/// One declared outbound link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Position of the listener fragment in the peer's `nodedef`
    pub index: usize,
    /// Name of a `tls-client` profile on the connecting node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<String>,
}

impl Connection {
    pub fn plain(index: usize) -> Self {
        Self { index, tls: None }
    }

    pub fn with_tls(index: usize, profile: impl Into<String>) -> Self {
        Self {
            index,
            tls: Some(profile.into()),
        }
    }
}

/// A single node of the topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// peer name -> link
    #[serde(default)]
    pub connections: BTreeMap<String, Connection>,
    /// Opaque configuration fragments, passed through to the daemon
    #[serde(default)]
    pub nodedef: Vec<Value>,
}

impl NodeSpec {
    /// Node with a single default listener on `backend`.
    pub fn with_listener(backend: Backend) -> Self {
        Self {
            connections: BTreeMap::new(),
            nodedef: vec![fragment(backend.listener_key(), Mapping::new())],
        }
    }

    /// Append a raw fragment.
    pub fn push_fragment(&mut self, fragment: Value) -> &mut Self {
        self.nodedef.push(fragment);
        self
    }

    /// Names of the `tls-client` profiles this node defines.
    pub fn tls_client_profiles(&self) -> BTreeSet<String> {
        self.nodedef
            .iter()
            .filter_map(|f| fragment_entry(f))
            .filter(|(key, _)| *key == "tls-client")
            .filter_map(|(_, body)| body.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Backend of the listener fragment at `index`, if it is one.
    pub fn listener_at(&self, index: usize) -> Option<Backend> {
        self.nodedef
            .get(index)
            .and_then(fragment_entry)
            .and_then(|(key, _)| Backend::from_listener_key(key))
    }
}

/// Build a single-key fragment `{ key: body }`.
pub fn fragment(key: &str, body: Mapping) -> Value {
    let mut map = Mapping::new();
    map.insert(Value::String(key.to_string()), Value::Mapping(body));
    Value::Mapping(map)
}

/// Split a single-key fragment into its key and body.
pub fn fragment_entry(fragment: &Value) -> Option<(&str, &Value)> {
    let map = fragment.as_mapping()?;
    if map.len() != 1 {
        return None;
    }
    let (key, body) = map.iter().next()?;
    Some((key.as_str()?, body))
}

/// Declarative description of a whole mesh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub nodes: BTreeMap<String, NodeSpec>,
}

impl TopologySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a topology document.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a topology document from disk.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Insert (or replace) a node.
    pub fn add_node(&mut self, name: impl Into<String>, spec: NodeSpec) -> &mut Self {
        self.nodes.insert(name.into(), spec);
        self
    }

    /// Declare that `from` dials `to` through `to`'s fragment at `index`.
    ///
    /// Does not validate; `from` must already exist.
    pub fn connect(&mut self, from: &str, to: &str, connection: Connection) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(from) {
            node.connections.insert(to.to_string(), connection);
        }
        self
    }

    pub fn node_names(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check every construction invariant. Nothing may start on failure.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(HarnessError::construction("topology has no nodes"));
        }

        for (name, node) in &self.nodes {
            if name.trim().is_empty() || name.chars().any(char::is_whitespace) {
                return Err(HarnessError::construction(format!(
                    "invalid node name {name:?}"
                )));
            }

            let profiles = node.tls_client_profiles();
            for (peer, connection) in &node.connections {
                if peer == name {
                    return Err(HarnessError::construction(format!(
                        "node {name} declares a connection to itself"
                    )));
                }
                let Some(peer_spec) = self.nodes.get(peer) else {
                    return Err(HarnessError::construction(format!(
                        "node {name} connects to undeclared peer {peer}"
                    )));
                };
                if connection.index >= peer_spec.nodedef.len() {
                    return Err(HarnessError::construction(format!(
                        "node {name} connects to {peer} at index {}, but {peer} has only {} fragments",
                        connection.index,
                        peer_spec.nodedef.len()
                    )));
                }
                if peer_spec.listener_at(connection.index).is_none() {
                    return Err(HarnessError::construction(format!(
                        "node {name} connects to {peer} at index {}, which is not a listener",
                        connection.index
                    )));
                }
                if let Some(profile) = &connection.tls {
                    if !profiles.contains(profile) {
                        return Err(HarnessError::construction(format!(
                            "node {name} uses undefined TLS profile {profile} for {peer}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Undirected edge set implied by the declared connections.
    pub fn edges(&self) -> BTreeSet<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|(name, node)| {
                node.connections.keys().map(move |peer| {
                    if name < peer {
                        (name.clone(), peer.clone())
                    } else {
                        (peer.clone(), name.clone())
                    }
                })
            })
            .collect()
    }

    /// Expected direct neighbors of every node (symmetric).
    pub fn neighbors(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut neighbors: BTreeMap<String, BTreeSet<String>> = self
            .nodes
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for (a, b) in self.edges() {
            neighbors.entry(a.clone()).or_default().insert(b.clone());
            neighbors.entry(b).or_default().insert(a);
        }
        neighbors
    }

    /// Chain: node *i* dials node *i-1*.
    pub fn linear(count: usize, backend: Backend) -> Self {
        let mut spec = Self::new();
        for i in 0..count {
            let mut node = NodeSpec::with_listener(backend);
            if i > 0 {
                node.connections
                    .insert(indexed_name(i - 1), Connection::plain(0));
            }
            spec.add_node(indexed_name(i), node);
        }
        spec
    }

    /// Star: every node dials node 0.
    pub fn star(count: usize, backend: Backend) -> Self {
        let mut spec = Self::new();
        for i in 0..count {
            let mut node = NodeSpec::with_listener(backend);
            if i > 0 {
                node.connections.insert(indexed_name(0), Connection::plain(0));
            }
            spec.add_node(indexed_name(i), node);
        }
        spec
    }

    /// Seeded random connected mesh: a random spanning tree plus up to
    /// `extra_links` additional distinct edges.
    pub fn random(count: usize, extra_links: usize, seed: u64, backend: Backend) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut spec = Self::new();
        for i in 0..count {
            spec.add_node(indexed_name(i), NodeSpec::with_listener(backend));
        }

        let mut linked = BTreeSet::new();
        for i in 1..count {
            let j = rng.gen_range(0..i);
            linked.insert((j, i));
        }

        let max_edges = count * count.saturating_sub(1) / 2;
        let target = (linked.len() + extra_links).min(max_edges);
        while linked.len() < target {
            let a = rng.gen_range(0..count);
            let b = rng.gen_range(0..count);
            if a != b {
                linked.insert((a.min(b), a.max(b)));
            }
        }

        for (low, high) in linked {
            spec.connect(
                &indexed_name(high),
                &indexed_name(low),
                Connection::plain(0),
            );
        }
        spec
    }
}

fn indexed_name(i: usize) -> String {
    format!("node{i}")
}
