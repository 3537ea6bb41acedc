//! Mesh launch.
//!
//! [`MeshRunner`] turns a [`TopologySpec`] into a running mesh. How each node
//! actually runs is the [`NodeLauncher`]'s business: [`ProcessLauncher`]
//! spawns the daemon executable once per node, [`InProcessLauncher`] runs a
//! caller-supplied [`NodeFactory`] as a tokio task. Everything after launch
//! (ready-wait, teardown, shutdown checks) is strategy-agnostic and lives on
//! [`MeshHandle`].

use crate::config::HarnessConfig;
use crate::error::{HarnessError, LaunchFailure, Result};
use crate::mesh::MeshHandle;
use crate::node::{ExecutionHandle, NodeProcess};
use crate::poll::{Probe, poll_until};
use crate::sockets::{SocketAudit, unix_socket_live};
use crate::topology::{MeshLayout, NodeConfig, TopologySpec, materialize};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File capturing an out-of-process node's stdout, inside its work dir.
pub const STDOUT_LOG: &str = "stdout.log";
/// File capturing an out-of-process node's stderr, inside its work dir.
pub const STDERR_LOG: &str = "stderr.log";

/// Starts a single node from its materialized configuration.
#[async_trait]
pub trait NodeLauncher: Send + Sync {
    /// Short name of the strategy, for logs.
    fn strategy(&self) -> &'static str;

    /// Whether nodes run inside the calling process, sharing its pid.
    fn shares_process(&self) -> bool {
        false
    }

    /// Start the node described by `config`, already written to
    /// `config_path`, with `work_dir` as its working directory.
    ///
    /// Returning means the node was started, not that it is ready.
    async fn launch(
        &self,
        config: &NodeConfig,
        config_path: &Path,
        work_dir: &Path,
    ) -> Result<ExecutionHandle>;
}

/// In-process node implementation.
///
/// `run` must serve the control socket at `config.control_socket`, and
/// return once `shutdown` turns `true`.
#[async_trait]
pub trait NodeFactory: Send + Sync + 'static {
    async fn run(&self, config: NodeConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;
}

/// One daemon process per node: `<daemon> <config-flag> <config-path>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    daemon_bin: PathBuf,
    config_flag: String,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(daemon_bin: impl Into<PathBuf>, config: &HarnessConfig) -> Self {
        Self {
            daemon_bin: daemon_bin.into(),
            config_flag: config.config_flag.clone(),
            grace: config.termination_grace,
        }
    }

    /// Launcher for the daemon named by the harness config.
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        Ok(Self::new(config.require_daemon_bin()?, config))
    }

    pub fn daemon_bin(&self) -> &Path {
        &self.daemon_bin
    }
}

#[async_trait]
impl NodeLauncher for ProcessLauncher {
    fn strategy(&self) -> &'static str {
        "process"
    }

    async fn launch(
        &self,
        config: &NodeConfig,
        config_path: &Path,
        work_dir: &Path,
    ) -> Result<ExecutionHandle> {
        let stdout = std::fs::File::create(work_dir.join(STDOUT_LOG))?;
        let stderr = std::fs::File::create(work_dir.join(STDERR_LOG))?;

        let mut command = Command::new(&self.daemon_bin);
        command
            .arg(&self.config_flag)
            .arg(config_path)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .process_group(0);

        let child = command.spawn().map_err(|e| {
            HarnessError::Config(format!(
                "cannot spawn {}: {e}",
                self.daemon_bin.display()
            ))
        })?;
        debug!(node = %config.name, pid = ?child.id(), "Spawned daemon process");
        Ok(ExecutionHandle::for_process(child, self.grace))
    }
}

/// Node logic run as tokio tasks inside the test process.
#[derive(Clone)]
pub struct InProcessLauncher {
    factory: Arc<dyn NodeFactory>,
    grace: Duration,
}

impl InProcessLauncher {
    pub fn new(factory: Arc<dyn NodeFactory>, grace: Duration) -> Self {
        Self { factory, grace }
    }
}

impl std::fmt::Debug for InProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLauncher")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NodeLauncher for InProcessLauncher {
    fn strategy(&self) -> &'static str {
        "in-process"
    }

    fn shares_process(&self) -> bool {
        true
    }

    async fn launch(
        &self,
        config: &NodeConfig,
        _config_path: &Path,
        _work_dir: &Path,
    ) -> Result<ExecutionHandle> {
        let factory = Arc::clone(&self.factory);
        let config = config.clone();
        Ok(ExecutionHandle::for_task(
            move |shutdown| async move { factory.run(config, shutdown).await },
            self.grace,
        ))
    }
}

/// Materializes topologies and launches meshes.
#[derive(Clone)]
pub struct MeshRunner {
    launcher: Arc<dyn NodeLauncher>,
    config: HarnessConfig,
}

impl std::fmt::Debug for MeshRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshRunner")
            .field("strategy", &self.launcher.strategy())
            .field("config", &self.config)
            .finish()
    }
}

impl MeshRunner {
    pub fn new(launcher: Arc<dyn NodeLauncher>, config: HarnessConfig) -> Self {
        Self { launcher, config }
    }

    /// Runner spawning the configured daemon executable.
    pub fn out_of_process(config: HarnessConfig) -> Result<Self> {
        let launcher = ProcessLauncher::from_config(&config)?;
        Ok(Self::new(Arc::new(launcher), config))
    }

    /// Runner hosting nodes built by `factory` inside this process.
    pub fn in_process(factory: impl NodeFactory, config: HarnessConfig) -> Self {
        let launcher = InProcessLauncher::new(Arc::new(factory), config.termination_grace);
        Self::new(Arc::new(launcher), config)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Validate, materialize and launch `spec`.
    ///
    /// Every node is launched concurrently and must open its control socket.
    /// If any node fails, all nodes already started are stopped and the
    /// failures are returned together; no partial mesh survives.
    pub async fn start(&self, spec: &TopologySpec) -> Result<MeshHandle> {
        spec.validate()?;
        std::fs::create_dir_all(&self.config.base_dir)?;

        let id = Uuid::new_v4();
        let dir = tempfile::Builder::new()
            .prefix("mesh-")
            .tempdir_in(&self.config.base_dir)?;
        let layout = MeshLayout::new(dir.path());
        let configs = materialize(spec, &layout, &self.config.node_log_level)?;
        let audit = self.launcher.shares_process().then(SocketAudit::begin);

        info!(
            mesh = %id,
            nodes = configs.len(),
            strategy = self.launcher.strategy(),
            dir = %layout.root().display(),
            "Starting mesh"
        );

        let results = join_all(
            configs
                .values()
                .map(|config| self.launch_node(&layout, config)),
        )
        .await;

        let mut nodes = BTreeMap::new();
        let mut failures = Vec::new();
        let mut partial = Vec::new();
        for (name, result) in configs.keys().zip(results) {
            match result {
                Ok(node) => {
                    nodes.insert(name.clone(), node);
                }
                Err((reason, node)) => {
                    warn!(mesh = %id, node = %name, reason = %reason, "Node failed to start");
                    failures.push(LaunchFailure {
                        node: name.clone(),
                        reason,
                    });
                    partial.extend(node);
                }
            }
        }

        if !failures.is_empty() {
            let grace = self.config.termination_grace;
            join_all(
                nodes
                    .values_mut()
                    .chain(partial.iter_mut())
                    .map(|node| node.stop(grace)),
            )
            .await;
            return Err(HarnessError::Launch { failures });
        }

        info!(mesh = %id, "All nodes started");
        Ok(MeshHandle::new(
            id,
            spec.clone(),
            dir,
            nodes,
            audit,
            self.config.clone(),
        ))
    }

    /// Launch one node and wait for its control socket.
    ///
    /// On failure returns the reason, plus the node itself if it was started
    /// and must be stopped.
    async fn launch_node(
        &self,
        layout: &MeshLayout,
        config: &NodeConfig,
    ) -> std::result::Result<NodeProcess, (String, Option<NodeProcess>)> {
        let work_dir = layout.node_dir(&config.name);
        let config_path = layout.config_path(&config.name);
        config
            .write_to(&config_path)
            .map_err(|e| (e.to_string(), None))?;

        let handle = self
            .launcher
            .launch(config, &config_path, &work_dir)
            .await
            .map_err(|e| (e.to_string(), None))?;
        let mut node = NodeProcess::new(
            config.name.clone(),
            work_dir,
            config.control_socket.clone(),
            config.listeners.clone(),
            handle,
        );

        match self.wait_for_control_socket(&node).await {
            Ok(()) => {
                node.mark_running();
                debug!(node = %config.name, "Control socket accepting");
                Ok(node)
            }
            Err(e) => Err((e.to_string(), Some(node))),
        }
    }

    async fn wait_for_control_socket(&self, node: &NodeProcess) -> Result<()> {
        let result = poll_until(
            self.config.socket_appear_timeout,
            self.config.ready_poll_interval,
            move || async move {
                if let Some(status) = node.exit_status() {
                    return Err(HarnessError::NodeExited {
                        node: node.name().to_string(),
                        status,
                    });
                }
                if unix_socket_live(node.control_socket()).await {
                    Ok(Probe::Ready(()))
                } else if node.control_socket().exists() {
                    Ok(Probe::Pending("socket not accepting"))
                } else {
                    Ok(Probe::Pending("socket absent"))
                }
            },
        )
        .await;
        result.map_err(|failure| {
            failure.into_error(&format!("control socket {}", node.control_socket().display()))
        })
    }
}
