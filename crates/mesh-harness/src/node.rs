//! Live node instances.
//!
//! A [`NodeProcess`] is one running member of a mesh, whichever way it was
//! launched. Both launch strategies hand back an [`ExecutionHandle`]: a small
//! supervisor task that owns the child process (or the in-process node task),
//! publishes its exit, and escalates from a graceful stop to a forced one
//! after the grace period.

use crate::control::ControlSession;
use crate::error::Result;
use crate::topology::Backend;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Extra time allowed after the grace period for a forced stop to be reaped.
const REAP_MARGIN: Duration = Duration::from_secs(5);

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl NodeState {
    fn rank(self) -> u8 {
        match self {
            NodeState::Starting => 0,
            NodeState::Stopping => 1,
            NodeState::Stopped => 2,
            NodeState::Running => 3,
        }
    }

    /// Weakest state among `states`: the mesh is only as far along as its
    /// least advanced node. An empty set counts as stopped.
    pub fn weakest(states: impl IntoIterator<Item = NodeState>) -> NodeState {
        states
            .into_iter()
            .min_by_key(|s| s.rank())
            .unwrap_or(NodeState::Stopped)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Supervisor of one running node.
///
/// Dropping the handle without stopping it asks the supervisor to stop the
/// node; child processes are additionally spawned with kill-on-drop.
#[derive(Debug)]
pub struct ExecutionHandle {
    pid: Option<u32>,
    stop: watch::Sender<bool>,
    exit: watch::Receiver<Option<String>>,
    supervisor: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Supervise an OS child process.
    ///
    /// On stop the child's process group gets SIGTERM, then SIGKILL once
    /// `grace` has passed.
    pub fn for_process(child: Child, grace: Duration) -> Self {
        let pid = child.id();
        let (stop, stop_rx) = watch::channel(false);
        let (exit_tx, exit) = watch::channel(None);
        let supervisor = tokio::spawn(supervise_process(child, stop_rx, grace, exit_tx));
        Self {
            pid,
            stop,
            exit,
            supervisor,
        }
    }

    /// Supervise an in-process node task.
    ///
    /// `start` receives the shutdown signal the node must honor; it becomes
    /// `true` on stop. A node still running `grace` later is aborted.
    pub fn for_task<F, Fut>(start: F, grace: Duration) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let (exit_tx, exit) = watch::channel(None);
        let task = tokio::spawn(start(stop_rx.clone()));
        let supervisor = tokio::spawn(supervise_task(task, stop_rx, grace, exit_tx));
        Self {
            pid: None,
            stop,
            exit,
            supervisor,
        }
    }

    /// OS process id, for out-of-process nodes.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// How the node exited, once it has.
    pub fn exit_status(&self) -> Option<String> {
        if let Some(status) = self.exit.borrow().clone() {
            return Some(status);
        }
        self.supervisor
            .is_finished()
            .then(|| "supervisor ended without reporting exit".to_string())
    }

    /// Signal the node to stop; returns immediately.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait up to `timeout` for the node to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<String> {
        let mut exit = self.exit.clone();
        match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(status)) => status.clone(),
            Ok(Err(_)) => Some("supervisor ended without reporting exit".to_string()),
            Err(_) => None,
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

async fn supervise_process(
    mut child: Child,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
    exit: watch::Sender<Option<String>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(describe_exit(status)),
        _ = stop.wait_for(|stop| *stop) => None,
    };
    let status = match exited {
        Some(status) => status,
        None => graceful_kill(&mut child, grace).await,
    };
    exit.send_replace(Some(status));
}

/// SIGTERM to the process group, SIGKILL after `grace`.
async fn graceful_kill(child: &mut Child, grace: Duration) -> String {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pgid) = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw)
    {
        let _ = killpg(pgid, Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return describe_exit(status);
        }
        debug!(pid = pgid.as_raw(), "Grace period elapsed, sending SIGKILL");
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.start_kill();
    describe_exit(child.wait().await)
}

fn describe_exit(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

async fn supervise_task(
    mut task: JoinHandle<anyhow::Result<()>>,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
    exit: watch::Sender<Option<String>>,
) {
    let finished = tokio::select! {
        result = &mut task => Some(result),
        _ = stop.wait_for(|stop| *stop) => None,
    };
    let result = match finished {
        Some(result) => result,
        None => match tokio::time::timeout(grace, &mut task).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Grace period elapsed, aborting node task");
                task.abort();
                task.await
            }
        },
    };
    let status = match result {
        Ok(Ok(())) => "exited cleanly".to_string(),
        Ok(Err(e)) => format!("failed: {e:#}"),
        Err(e) if e.is_cancelled() => "aborted".to_string(),
        Err(_) => "panicked".to_string(),
    };
    exit.send_replace(Some(status));
}

/// One live node of a mesh.
#[derive(Debug)]
pub struct NodeProcess {
    name: String,
    work_dir: PathBuf,
    control_socket: PathBuf,
    listeners: Vec<(Backend, u16)>,
    state: NodeState,
    handle: ExecutionHandle,
}

impl NodeProcess {
    pub(crate) fn new(
        name: impl Into<String>,
        work_dir: PathBuf,
        control_socket: PathBuf,
        listeners: Vec<(Backend, u16)>,
        handle: ExecutionHandle,
    ) -> Self {
        Self {
            name: name.into(),
            work_dir,
            control_socket,
            listeners,
            state: NodeState::Starting,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working directory owned exclusively by this node.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn control_socket(&self) -> &Path {
        &self.control_socket
    }

    /// Loopback listeners the node was configured with.
    pub fn listeners(&self) -> &[(Backend, u16)] {
        &self.listeners
    }

    /// OS process id; `None` for in-process nodes.
    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Exit description, once the node has exited.
    pub fn exit_status(&self) -> Option<String> {
        self.handle.exit_status()
    }

    /// Open a fresh control session to this node.
    pub async fn connect(&self, timeout: Duration) -> Result<ControlSession> {
        ControlSession::connect_with_timeout(&self.control_socket, timeout).await
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = NodeState::Running;
    }

    /// Stop the node and wait for it to exit.
    ///
    /// Ends in [`NodeState::Stopped`] once the exit is confirmed; a node that
    /// cannot be confirmed stopped stays in [`NodeState::Stopping`].
    pub(crate) async fn stop(&mut self, grace: Duration) {
        if self.state == NodeState::Stopped {
            return;
        }
        self.state = NodeState::Stopping;
        self.handle.request_stop();
        match self.handle.wait_exit(grace + REAP_MARGIN).await {
            Some(status) => {
                info!(node = %self.name, status = %status, "Node stopped");
                self.state = NodeState::Stopped;
            }
            None => warn!(node = %self.name, pid = ?self.pid(), "Node did not exit"),
        }
    }
}
