//! A running mesh and its lifecycle.

use crate::config::{HarnessConfig, MAX_READY_POLL_INTERVAL};
use crate::control::ControlSession;
use crate::convergence::{self, ConvergenceReport};
use crate::error::{HarnessError, LeakedNode, Result};
use crate::node::{NodeProcess, NodeState};
use crate::poll::{PollFailure, Probe, poll_until};
use crate::sockets::{SocketAudit, SocketTable, port_in_use, process_alive, unix_socket_live};
use crate::topology::TopologySpec;
use crate::work::WorkAsserter;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Leak entry for in-process sockets that no single node can be blamed for.
pub const UNATTRIBUTED: &str = "unattributed";

/// Owner of every node of one mesh.
///
/// Dropping a handle that was never destroyed signals every node to stop,
/// but only [`destroy`](Self::destroy) followed by
/// [`wait_for_shutdown`](Self::wait_for_shutdown) verifies that they did.
#[derive(Debug)]
pub struct MeshHandle {
    id: Uuid,
    spec: TopologySpec,
    dir: Option<TempDir>,
    root: std::path::PathBuf,
    nodes: BTreeMap<String, NodeProcess>,
    /// Inode audit of the test process, for in-process meshes
    audit: Option<SocketAudit>,
    config: HarnessConfig,
    destroyed: bool,
}

impl MeshHandle {
    pub(crate) fn new(
        id: Uuid,
        spec: TopologySpec,
        dir: TempDir,
        nodes: BTreeMap<String, NodeProcess>,
        audit: Option<SocketAudit>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            id,
            spec,
            root: dir.path().to_path_buf(),
            dir: Some(dir),
            nodes,
            audit,
            config,
            destroyed: false,
        }
    }

    /// Mesh id used to correlate log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &TopologySpec {
        &self.spec
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Directory holding every node's working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeProcess> {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeProcess> {
        self.nodes.get(name)
    }

    /// Weakest state among the nodes.
    pub fn state(&self) -> NodeState {
        NodeState::weakest(self.nodes.values().map(NodeProcess::state))
    }

    /// Open a control session to `name`.
    pub async fn session(&self, name: &str) -> Result<ControlSession> {
        let node = self.nodes.get(name).ok_or_else(|| {
            HarnessError::Construction(format!("mesh {} has no node named {name}", self.id))
        })?;
        node.connect(self.config.protocol_timeout).await
    }

    /// Work asserter on a fresh session to `name`, polling at the configured
    /// `work_poll_interval`.
    pub async fn work_asserter(&self, name: &str) -> Result<WorkAsserter> {
        let session = self.session(name).await?;
        Ok(WorkAsserter::new(session).with_interval(self.config.work_poll_interval))
    }

    /// Whether the mesh is converged right now.
    pub async fn check_connections(&self) -> bool {
        convergence::check_connections(self).await
    }

    /// Wait until the mesh converges or `deadline` elapses.
    ///
    /// A node exiting during the wait fails it at once.
    pub async fn wait_for_ready(&self, deadline: Duration) -> Result<()> {
        let interval = self
            .config
            .ready_poll_interval
            .min(MAX_READY_POLL_INTERVAL);
        info!(mesh = %self.id, deadline = ?deadline, "Waiting for mesh to converge");

        let result = poll_until(deadline, interval, move || async move {
            if let Some(node) = self.nodes.values().find(|n| n.exit_status().is_some()) {
                return Err(HarnessError::NodeExited {
                    node: node.name().to_string(),
                    status: node.exit_status().unwrap_or_default(),
                });
            }
            let report = convergence::observe(self).await;
            if report.converged {
                Ok(Probe::Ready(()))
            } else {
                Ok(Probe::Pending(report))
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(mesh = %self.id, "Mesh converged");
                Ok(())
            }
            Err(PollFailure::Deadline { waited, last }) => {
                let report = last.unwrap_or_else(ConvergenceReport::not_observed);
                warn!(mesh = %self.id, waited = ?waited, report = %report, "Mesh did not converge");
                Err(HarnessError::ConvergenceTimeout {
                    waited,
                    report: Box::new(report),
                })
            }
            Err(PollFailure::Failed(err)) => Err(err),
        }
    }

    /// Stop every node and delete their working directories.
    ///
    /// Idempotent. Leaks are not judged here; see
    /// [`wait_for_shutdown`](Self::wait_for_shutdown).
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        info!(mesh = %self.id, nodes = self.nodes.len(), "Destroying mesh");

        let grace = self.config.termination_grace;
        join_all(self.nodes.values_mut().map(|node| node.stop(grace))).await;

        for node in self.nodes.values() {
            if node.state() != NodeState::Stopped {
                continue;
            }
            match std::fs::remove_dir_all(node.work_dir()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    node = %node.name(),
                    dir = %node.work_dir().display(),
                    error = %e,
                    "Failed to remove node directory"
                ),
            }
        }
    }

    /// Wait until every node has exited and released its sockets.
    ///
    /// Destroys the mesh first if needed. Out-of-process nodes are checked
    /// against the OS socket table by pid. In-process nodes are checked by
    /// their exit notification, their control socket and their listener
    /// ports, and the test process by any inet socket opened since launch
    /// (see [`SocketAudit`]). On success the mesh directory is removed.
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        self.destroy().await;

        if let Some(audit) = &self.audit {
            if !audit.attributable() {
                debug!(
                    mesh = %self.id,
                    "Other in-process meshes overlapped this one; skipping socket audit"
                );
            }
        }

        let timeout = self.config.shutdown_timeout;
        let interval = self.config.shutdown_poll_interval;
        let nodes = &self.nodes;
        let audit = self.audit.as_ref();
        let result = poll_until(timeout, interval, move || async move {
            let leaks = find_leaks(nodes, audit).await;
            if leaks.is_empty() {
                Ok(Probe::Ready(()))
            } else {
                Ok(Probe::Pending(leaks))
            }
        })
        .await;

        match result {
            Ok(()) => {
                if let Some(dir) = self.dir.take() {
                    if let Err(e) = dir.close() {
                        warn!(mesh = %self.id, error = %e, "Failed to remove mesh directory");
                    }
                }
                info!(mesh = %self.id, "Mesh shut down cleanly");
                Ok(())
            }
            Err(PollFailure::Deadline { waited, last }) => {
                let leaks = last.unwrap_or_default();
                for leak in &leaks {
                    warn!(mesh = %self.id, leak = %leak, "Resource outlived shutdown");
                }
                Err(HarnessError::ShutdownLeak { waited, leaks })
            }
            Err(PollFailure::Failed(err)) => Err(err),
        }
    }
}

/// Nodes still running or holding sockets.
async fn find_leaks(
    nodes: &BTreeMap<String, NodeProcess>,
    audit: Option<&SocketAudit>,
) -> Vec<LeakedNode> {
    let needs_table = nodes.values().any(|n| n.pid().is_some());
    let table = if needs_table {
        Some(SocketTable::snapshot().await)
    } else {
        None
    };

    let mut leaks = Vec::new();
    for node in nodes.values() {
        let exited = node.exit_status().is_some();
        let sockets = match (node.pid(), &table) {
            (Some(pid), Some(table)) => {
                let mut sockets = table.owned_by(pid);
                if !exited && process_alive(pid) {
                    sockets.push(format!("pid {pid} still running"));
                }
                sockets
            }
            _ => in_process_sockets(node).await,
        };
        if !exited || !sockets.is_empty() {
            debug!(node = %node.name(), exited, sockets = sockets.len(), "Node not yet released");
            leaks.push(LeakedNode {
                node: node.name().to_string(),
                pid: node.pid(),
                sockets,
            });
        }
    }

    if let Some(sockets) = audit.and_then(SocketAudit::leaked) {
        if !sockets.is_empty() {
            debug!(sockets = sockets.len(), "In-process sockets still open");
            leaks.push(LeakedNode {
                node: UNATTRIBUTED.to_string(),
                pid: None,
                sockets,
            });
        }
    }
    leaks
}

async fn in_process_sockets(node: &NodeProcess) -> Vec<String> {
    let mut held = Vec::new();
    if unix_socket_live(node.control_socket()).await {
        held.push(format!("control socket {}", node.control_socket().display()));
    }
    for &(backend, port) in node.listeners() {
        if port_in_use(backend, port) {
            held.push(format!("{backend} listener 127.0.0.1:{port}"));
        }
    }
    held
}

impl Drop for MeshHandle {
    fn drop(&mut self) {
        if !self.destroyed {
            debug!(mesh = %self.id, "Mesh dropped without destroy; signalling nodes");
        }
    }
}
