//! Client side of one node's control socket.

use super::protocol::{
    self, NodeStatus, PingResponse, WorkId, WorkStatus, banner_node, check_arg, parse_reply,
    parse_submit_ack,
};
use crate::error::{HarnessError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

/// Default bound on a single request/reply exchange.
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// One logical connection to a node's control socket.
///
/// Requests are strictly sequential. A malformed reply or a timed-out
/// exchange poisons the session (later calls fail with
/// [`HarnessError::SessionPoisoned`]); a command rejection does not.
/// [`work_submit`](Self::work_submit) consumes the session: the daemon turns
/// the connection into the unit's stdin stream, so callers reconnect for
/// anything that follows.
pub struct ControlSession {
    path: PathBuf,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    banner: String,
    timeout: Duration,
    poisoned: bool,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("path", &self.path)
            .field("banner", &self.banner)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl ControlSession {
    /// Connect with the default protocol timeout.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_timeout(path, DEFAULT_PROTOCOL_TIMEOUT).await
    }

    /// Connect and read the daemon's banner line.
    pub async fn connect_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(&path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(HarnessError::Connect { path, source }),
            Err(_) => {
                return Err(HarnessError::Connect {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                });
            }
        };

        let (read, writer) = stream.into_split();
        let mut session = Self {
            path,
            reader: BufReader::new(read),
            writer,
            banner: String::new(),
            timeout,
            poisoned: false,
        };
        session.banner = session.read_line("<banner>").await?;
        debug!(
            socket = %session.path.display(),
            banner = %session.banner,
            "Control session opened"
        );
        Ok(session)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Banner line sent by the daemon on connect.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Node name announced in the banner, if the banner carries one.
    pub fn node_name(&self) -> Option<&str> {
        banner_node(&self.banner)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Round-trip reachability probe to any node of the mesh.
    ///
    /// Only the success flag is checked; the payload is returned as-is.
    pub async fn ping(&mut self, target: &str) -> Result<PingResponse> {
        check_arg("ping", target)?;
        let command = format!("ping {target}");
        let reply: PingResponse = self.request_as(&command).await?;
        if !reply.success {
            return Err(HarnessError::CommandRejected {
                command,
                reason: reply
                    .error
                    .clone()
                    .unwrap_or_else(|| "ping unsuccessful".to_string()),
            });
        }
        Ok(reply)
    }

    /// The node's locally observed connection and routing state.
    pub async fn status(&mut self) -> Result<NodeStatus> {
        self.request_as("status").await
    }

    /// Submit work for `service` on `target`, consuming the session.
    ///
    /// The daemon acknowledges with the unit id and then treats the rest of
    /// the stream as the unit's stdin. The session half-closes its write side
    /// (empty stdin), reads the final reply and is dropped.
    pub async fn work_submit(
        mut self,
        target: &str,
        service: &str,
        params: Option<&str>,
    ) -> Result<WorkId> {
        check_arg("work submit", target)?;
        check_arg("work submit", service)?;
        let mut command = format!("work submit {target} {service}");
        if let Some(params) = params {
            if params.contains(['\n', '\r']) {
                return Err(HarnessError::CommandRejected {
                    command,
                    reason: "params must be a single line".to_string(),
                });
            }
            command.push(' ');
            command.push_str(params);
        }
        self.ensure_usable()?;

        self.write_line(&command).await?;
        let ack = self.read_line(&command).await?;
        let id = parse_submit_ack(&command, &ack)?;

        self.writer.shutdown().await.map_err(|e| {
            HarnessError::protocol(format!("cannot close stdin of work unit {id}: {e}"))
        })?;
        let done = self.read_line(&command).await?;
        if let Some(reason) = done.trim().strip_prefix(protocol::ERROR_PREFIX) {
            return Err(HarnessError::CommandRejected {
                command,
                reason: reason.trim().to_string(),
            });
        }

        debug!(work_id = %id, target, service, "Work unit submitted");
        Ok(id)
    }

    /// Ask the daemon to cancel a unit.
    pub async fn work_cancel(&mut self, id: &WorkId) -> Result<()> {
        check_arg("work cancel", id.as_str())?;
        self.request(&format!("work cancel {id}")).await.map(|_| ())
    }

    /// Free the daemon's bookkeeping for a unit.
    pub async fn work_release(&mut self, id: &WorkId) -> Result<()> {
        check_arg("work release", id.as_str())?;
        self.request(&format!("work release {id}")).await.map(|_| ())
    }

    /// Current state of a unit.
    ///
    /// Unknown units report [`WorkState::Released`](super::WorkState::Released).
    pub async fn work_status(&mut self, id: &WorkId) -> Result<WorkStatus> {
        check_arg("work status", id.as_str())?;
        match self.request(&format!("work status {id}")).await {
            Ok(value) => WorkStatus::from_json(id.clone(), value),
            Err(HarnessError::CommandRejected { reason, .. })
                if protocol::is_unknown_work(&reason) =>
            {
                Ok(WorkStatus::released(id.clone()))
            }
            Err(err) => Err(err),
        }
    }

    /// Close the session cleanly.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(socket = %self.path.display(), error = %e, "Control session close failed");
        }
    }

    /// Send one command and return its JSON reply.
    pub async fn request(&mut self, command: &str) -> Result<Value> {
        self.ensure_usable()?;
        self.write_line(command).await?;
        let line = self.read_line(command).await?;
        match parse_reply(command, &line) {
            Err(err @ HarnessError::Protocol(_)) => {
                self.poison(command, &err);
                Err(err)
            }
            other => other,
        }
    }

    async fn request_as<T: serde::de::DeserializeOwned>(&mut self, command: &str) -> Result<T> {
        let value = self.request(command).await?;
        serde_json::from_value(value).map_err(|e| {
            let err = HarnessError::protocol(format!("unexpected reply shape to `{command}`: {e}"));
            self.poison(command, &err);
            err
        })
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(HarnessError::SessionPoisoned);
        }
        Ok(())
    }

    fn poison(&mut self, command: &str, err: &HarnessError) {
        warn!(socket = %self.path.display(), command, error = %err, "Control session poisoned");
        self.poisoned = true;
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        match tokio::time::timeout(self.timeout, self.writer.write_all(&bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(HarnessError::Io(e))
            }
            Err(_) => {
                self.poisoned = true;
                Err(HarnessError::Deadline {
                    what: format!("control socket to accept `{line}`"),
                    waited: self.timeout,
                    last: "write pending".to_string(),
                })
            }
        }
    }

    async fn read_line(&mut self, command: &str) -> Result<String> {
        let mut line = String::new();
        match tokio::time::timeout(self.timeout, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) => {
                self.poisoned = true;
                Err(HarnessError::protocol(format!(
                    "control socket closed while waiting for reply to `{command}`"
                )))
            }
            Ok(Ok(_)) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(HarnessError::Io(e))
            }
            Err(_) => {
                self.poisoned = true;
                Err(HarnessError::Deadline {
                    what: format!("reply to `{command}`"),
                    waited: self.timeout,
                    last: "no reply".to_string(),
                })
            }
        }
    }
}
