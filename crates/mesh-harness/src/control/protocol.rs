//! Control-socket wire types and reply parsing.
//!
//! Requests are single text lines. Replies are single lines too: either a
//! JSON object, or a line starting with `ERROR:` when the daemon declines the
//! request. `work submit` is the exception; see
//! [`ControlSession::work_submit`](super::ControlSession::work_submit).

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Prefix of a command rejection line.
pub const ERROR_PREFIX: &str = "ERROR:";
/// Marker of the acknowledgement line sent after `work submit`.
const SUBMIT_ACK_MARKER: &str = "with ID ";

/// Reply to `ping <node>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PingResponse {
    /// Node that answered
    #[serde(default)]
    pub from: String,
    pub success: bool,
    /// Round-trip time in seconds
    #[serde(default)]
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One active direct connection as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "Cost", default)]
    pub cost: f64,
}

/// Reply to `status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(rename = "Connections", default)]
    pub connections: Vec<ConnectionInfo>,
    /// destination -> next hop; absent when the daemon does not expose it
    #[serde(rename = "RoutingTable", default)]
    pub routing_table: Option<BTreeMap<String, String>>,
    #[serde(rename = "KnownConnectionCosts", default)]
    pub known_connection_costs: Option<BTreeMap<String, BTreeMap<String, f64>>>,
}

/// Opaque work unit identifier returned by `work submit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(String);

impl WorkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Unknown to the daemon: released, or never existed
    Released,
}

impl WorkState {
    /// Whether the unit can no longer change state on its own.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkState::Pending | WorkState::Running)
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkState::Pending => "Pending",
            WorkState::Running => "Running",
            WorkState::Succeeded => "Succeeded",
            WorkState::Failed => "Failed",
            WorkState::Cancelled => "Cancelled",
            WorkState::Released => "Released",
        };
        f.write_str(name)
    }
}

/// Reply to `work status <id>`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkStatus {
    pub id: WorkId,
    pub state: WorkState,
    pub detail: String,
    pub work_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawWorkStatus {
    state: i64,
    #[serde(default)]
    state_name: Option<String>,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    work_type: String,
}

impl WorkStatus {
    /// Status reported for a unit the daemon no longer knows.
    pub fn released(id: WorkId) -> Self {
        Self {
            id,
            state: WorkState::Released,
            detail: "unknown work unit".to_string(),
            work_type: String::new(),
        }
    }

    /// Decode a `work status` JSON object.
    ///
    /// Numeric states are 0 Pending, 1 Running, 2 Succeeded, 3 Failed. A
    /// failed unit is Cancelled when the daemon says so, either through
    /// `StateName` or a cancel/kill detail.
    pub fn from_json(id: WorkId, value: Value) -> Result<Self> {
        let raw: RawWorkStatus = serde_json::from_value(value)
            .map_err(|e| HarnessError::protocol(format!("malformed work status: {e}")))?;

        let mut state = match raw.state {
            0 => WorkState::Pending,
            1 => WorkState::Running,
            2 => WorkState::Succeeded,
            3 => WorkState::Failed,
            other => {
                return Err(HarnessError::protocol(format!(
                    "unknown work state {other} for {id}"
                )));
            }
        };

        let named_cancelled = raw.state_name.as_deref().is_some_and(|n| {
            n.eq_ignore_ascii_case("cancelled") || n.eq_ignore_ascii_case("canceled")
        });
        let detail = raw.detail.to_ascii_lowercase();
        let detail_cancelled =
            state == WorkState::Failed && (detail.contains("cancel") || detail.contains("killed"));
        if named_cancelled || detail_cancelled {
            state = WorkState::Cancelled;
        }

        Ok(Self {
            id,
            state,
            detail: raw.detail,
            work_type: raw.work_type,
        })
    }
}

/// Classify one reply line to `command`.
///
/// `ERROR:` lines become [`HarnessError::CommandRejected`]; anything that is
/// not a JSON object is a [`HarnessError::Protocol`] desync.
pub fn parse_reply(command: &str, line: &str) -> Result<Value> {
    let line = line.trim();
    if let Some(reason) = line.strip_prefix(ERROR_PREFIX) {
        return Err(HarnessError::CommandRejected {
            command: command.to_string(),
            reason: reason.trim().to_string(),
        });
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(HarnessError::protocol(format!(
            "reply to `{command}` is not an object: {other}"
        ))),
        Err(e) => Err(HarnessError::protocol(format!(
            "unparseable reply to `{command}`: {e}: {line:?}"
        ))),
    }
}

/// Extract the work id from the acknowledgement line of `work submit`.
pub fn parse_submit_ack(command: &str, line: &str) -> Result<WorkId> {
    let line = line.trim();
    if let Some(reason) = line.strip_prefix(ERROR_PREFIX) {
        return Err(HarnessError::CommandRejected {
            command: command.to_string(),
            reason: reason.trim().to_string(),
        });
    }
    let id = line
        .split_once(SUBMIT_ACK_MARKER)
        .map(|(_, rest)| {
            rest.split(|c: char| c.is_whitespace() || c == '.')
                .next()
                .unwrap_or_default()
        })
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            HarnessError::protocol(format!("unexpected submit acknowledgement: {line:?}"))
        })?;
    Ok(WorkId::new(id))
}

/// Whether a rejection reason means "no such work unit".
pub fn is_unknown_work(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("unknown work unit") || reason.contains("not found")
}

/// Node name announced in the connection banner, e.g. `... node node1`.
pub fn banner_node(banner: &str) -> Option<&str> {
    banner
        .trim()
        .rsplit_once("node ")
        .map(|(_, name)| name.trim())
        .filter(|name| !name.is_empty() && !name.contains(char::is_whitespace))
}

/// Reject arguments that would break the line framing.
pub fn check_arg(command: &str, arg: &str) -> Result<()> {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(HarnessError::CommandRejected {
            command: command.to_string(),
            reason: format!("argument {arg:?} cannot be sent on the control socket"),
        });
    }
    Ok(())
}
