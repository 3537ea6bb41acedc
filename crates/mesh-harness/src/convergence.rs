//! Convergence checking.
//!
//! A mesh has converged when every node's own view of its direct
//! connections matches the links declared in the topology, on both ends of
//! every link, and (where the daemon exposes a routing table) every node has
//! discovered every other node. Observations come from the `status` command
//! over a fresh control session per node; judging them is [`evaluate`], a
//! pure function.

use crate::control::{ControlSession, NodeStatus};
use crate::mesh::MeshHandle;
use crate::topology::TopologySpec;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// What one node reported about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeObservation {
    /// Peers the node reports active direct connections to
    pub connections: BTreeSet<String>,
    /// Nodes the node knows routes to, itself included; `None` when the
    /// daemon does not expose a routing table
    pub discovered: Option<BTreeSet<String>>,
    /// Why the node could not be observed
    pub error: Option<String>,
}

impl NodeObservation {
    pub fn from_status(node: &str, status: &NodeStatus) -> Self {
        let connections = status
            .connections
            .iter()
            .map(|c| c.node_id.clone())
            .collect();
        let discovered = status.routing_table.as_ref().map(|table| {
            table
                .keys()
                .cloned()
                .chain(std::iter::once(node.to_string()))
                .collect()
        });
        Self {
            connections,
            discovered,
            error: None,
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Outcome of one convergence check, kept for diagnosis on timeout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvergenceReport {
    pub converged: bool,
    /// Human-readable disagreements, one per offending node
    pub mismatches: Vec<String>,
    pub observations: BTreeMap<String, NodeObservation>,
}

impl ConvergenceReport {
    /// Report used when no check completed before the deadline.
    pub fn not_observed() -> Self {
        Self {
            converged: false,
            mismatches: vec!["no convergence check completed".to_string()],
            observations: BTreeMap::new(),
        }
    }
}

impl std::fmt::Display for ConvergenceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.converged {
            return write!(f, "converged ({} nodes)", self.observations.len());
        }
        write!(f, "{} mismatch(es)", self.mismatches.len())?;
        for mismatch in &self.mismatches {
            write!(f, "\n  {mismatch}")?;
        }
        Ok(())
    }
}

fn show(set: &BTreeSet<String>) -> String {
    let names: Vec<&str> = set.iter().map(String::as_str).collect();
    format!("[{}]", names.join(", "))
}

/// Judge `observations` against the links declared in `spec`.
pub fn evaluate(
    spec: &TopologySpec,
    observations: BTreeMap<String, NodeObservation>,
) -> ConvergenceReport {
    let all_nodes = spec.node_names();
    let expected = spec.neighbors();
    let mut mismatches = Vec::new();

    for (node, neighbors) in &expected {
        let Some(observed) = observations.get(node) else {
            mismatches.push(format!("{node}: not observed"));
            continue;
        };
        if let Some(error) = &observed.error {
            mismatches.push(format!("{node}: unreachable: {error}"));
            continue;
        }
        let mut problems = Vec::new();
        if &observed.connections != neighbors {
            problems.push(format!(
                "connected to {}, expected {}",
                show(&observed.connections),
                show(neighbors)
            ));
        }
        if let Some(discovered) = &observed.discovered {
            if discovered != &all_nodes {
                let missing: BTreeSet<String> =
                    all_nodes.difference(discovered).cloned().collect();
                let unknown: BTreeSet<String> =
                    discovered.difference(&all_nodes).cloned().collect();
                problems.push(format!(
                    "discovery missing {}, unexpected {}",
                    show(&missing),
                    show(&unknown)
                ));
            }
        }
        if !problems.is_empty() {
            mismatches.push(format!("{node}: {}", problems.join("; ")));
        }
    }

    ConvergenceReport {
        converged: mismatches.is_empty(),
        mismatches,
        observations,
    }
}

/// Ask one node for its status over a fresh session.
pub async fn observe_node(name: &str, control_socket: &Path, timeout: Duration) -> NodeObservation {
    let mut session = match ControlSession::connect_with_timeout(control_socket, timeout).await {
        Ok(session) => session,
        Err(e) => return NodeObservation::unreachable(e.to_string()),
    };
    let observation = match session.status().await {
        Ok(status) => NodeObservation::from_status(name, &status),
        Err(e) => NodeObservation::unreachable(e.to_string()),
    };
    session.close().await;
    observation
}

/// Observe every node of `mesh` concurrently and evaluate.
pub async fn observe(mesh: &MeshHandle) -> ConvergenceReport {
    let timeout = mesh.config().protocol_timeout;
    let observed = join_all(mesh.nodes().values().map(|node| async move {
        let observation = observe_node(node.name(), node.control_socket(), timeout).await;
        (node.name().to_string(), observation)
    }))
    .await;
    let report = evaluate(mesh.spec(), observed.into_iter().collect());
    debug!(
        mesh = %mesh.id(),
        converged = report.converged,
        mismatches = report.mismatches.len(),
        "Convergence check"
    );
    report
}

/// Whether `mesh` is converged right now.
pub async fn check_connections(mesh: &MeshHandle) -> bool {
    observe(mesh).await.converged
}
