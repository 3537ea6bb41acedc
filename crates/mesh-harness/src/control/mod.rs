//! Control-socket client.
//!
//! Every node exposes a Unix-domain control socket in its working directory.
//! [`ControlSession`] speaks the line protocol on it; [`protocol`] holds the
//! wire types and reply classification.

pub mod protocol;
mod session;

pub use protocol::{ConnectionInfo, NodeStatus, PingResponse, WorkId, WorkState, WorkStatus};
pub use session::{ControlSession, DEFAULT_PROTOCOL_TIMEOUT};
