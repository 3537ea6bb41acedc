//! Harness error types
//!
//! Every blocking operation in the harness returns a bounded, typed error
//! rather than hanging. The variants map onto the failure classes a mesh test
//! needs to tell apart: a broken topology, a node that would not start, a
//! mesh that never converged, a control socket that spoke nonsense and a
//! daemon that politely declined a request.

use crate::convergence::ConvergenceReport;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to launch a single node, collected into [`HarnessError::Launch`].
#[derive(Debug, Clone)]
pub struct LaunchFailure {
    /// Node that failed to start
    pub node: String,
    /// Why it failed
    pub reason: String,
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.node, self.reason)
    }
}

/// A node whose process or sockets outlived teardown.
#[derive(Debug, Clone)]
pub struct LeakedNode {
    /// Node name
    pub node: String,
    /// OS process id, when the node ran out of process
    pub pid: Option<u32>,
    /// Raw socket-table lines (or control socket paths) still held
    pub sockets: Vec<String>,
}

impl std::fmt::Display for LeakedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {})", self.node, pid)?,
            None => write!(f, "{} (in-process)", self.node)?,
        }
        for socket in &self.sockets {
            write!(f, "\n    {socket}")?;
        }
        Ok(())
    }
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Harness errors
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Invalid topology: dangling peer, undefined TLS profile, bad index
    #[error("Invalid topology: {0}")]
    Construction(String),

    /// One or more nodes failed to start; everything started was torn down
    #[error("Failed to launch mesh: {}", join_display(.failures))]
    Launch { failures: Vec<LaunchFailure> },

    /// Mesh never converged within the ready deadline
    #[error("Mesh did not converge within {waited:?}: {report}")]
    ConvergenceTimeout {
        waited: Duration,
        report: Box<ConvergenceReport>,
    },

    /// A polled condition was not reached within its deadline
    #[error("Timed out after {waited:?} waiting for {what} (last observed: {last})")]
    Deadline {
        what: String,
        waited: Duration,
        last: String,
    },

    /// Malformed or unexpected control-socket response
    #[error("Control protocol error: {0}")]
    Protocol(String),

    /// Valid protocol exchange, but the daemon declined the request
    #[error("Command `{command}` rejected: {reason}")]
    CommandRejected { command: String, reason: String },

    /// Session was invalidated by an earlier protocol error
    #[error("Control session is no longer usable after a protocol error")]
    SessionPoisoned,

    /// Could not reach a node's control socket
    #[error("Failed to connect to control socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A node exited while the mesh was expected to be running
    #[error("Node {node} exited unexpectedly: {status}")]
    NodeExited { node: String, status: String },

    /// Processes or sockets survived teardown
    #[error("Mesh shutdown leaked resources after {waited:?}: {}", join_display(.leaks))]
    ShutdownLeak {
        waited: Duration,
        leaks: Vec<LeakedNode>,
    },

    /// Key or certificate generation failed
    #[error("Certificate generation failed: {0}")]
    Certificate(String),

    /// Harness configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Shorthand for a construction error.
    pub fn construction(msg: impl Into<String>) -> Self {
        HarnessError::Construction(msg.into())
    }

    /// Shorthand for a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        HarnessError::Protocol(msg.into())
    }

    /// Whether this error is a deadline/timeout rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HarnessError::Deadline { .. } | HarnessError::ConvergenceTimeout { .. }
        )
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
