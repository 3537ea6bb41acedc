//! Mesh Functional Test Harness
//!
//! This crate drives an externally built mesh daemon through declarative
//! topologies and checks what the mesh does as a whole:
//!
//! - **Topologies**: named nodes, the peers they dial, and raw per-node
//!   configuration fragments, materialized into one daemon config per node
//! - **Two launch strategies**: one OS process per node, or node logic hosted
//!   as tokio tasks inside the test, behind the same [`MeshHandle`]
//! - **Convergence**: every node's own view of its links must match the
//!   declared topology, symmetrically
//! - **Control sockets**: ping, status and the work submit / cancel /
//!   release lifecycle, with typed errors for rejections and protocol desync
//! - **Clean teardown**: shutdown is only complete once the OS no longer
//!   lists any socket owned by a former node
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  materialize  ┌─────────────┐   launch    ┌─────────────┐
//! │ TopologySpec │──────────────►│ NodeConfig  │────────────►│ NodeProcess │
//! └──────────────┘               │  (per node) │ NodeLauncher│  (per node) │
//!                                └─────────────┘             └──────┬──────┘
//!                                                                   │ control socket
//!       ┌──────────────────┬──────────────────────┬─────────────────┤
//!       ▼                  ▼                      ▼                 ▼
//! ┌───────────┐   ┌────────────────┐    ┌────────────────┐   ┌─────────────┐
//! │ MeshHandle│   │ Convergence    │    │ ControlSession │   │ WorkAsserter│
//! │ lifecycle │   │ (status)       │    │ (ping, work)   │   │ (polling)   │
//! └───────────┘   └────────────────┘    └────────────────┘   └─────────────┘
//! ```
//!
//! Every wait (ready, shutdown, work state) goes through [`poll::poll_until`]
//! and is bounded by a caller-supplied deadline.
//!
//! # Usage
//!
//! ```no_run
//! use mesh_harness::{Backend, HarnessConfig, MeshRunner, TopologySpec};
//! use std::time::Duration;
//!
//! # async fn run() -> mesh_harness::Result<()> {
//! let runner = MeshRunner::out_of_process(HarnessConfig::from_env()?)?;
//! let mut mesh = runner.start(&TopologySpec::linear(3, Backend::Tcp)).await?;
//! mesh.wait_for_ready(Duration::from_secs(20)).await?;
//!
//! let mut session = mesh.session("node0").await?;
//! session.ping("node2").await?;
//!
//! mesh.destroy().await;
//! mesh.wait_for_shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod certs;
pub mod config;
pub mod control;
pub mod convergence;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod node;
pub mod poll;
pub mod ports;
pub mod runner;
pub mod sockets;
pub mod topology;
pub mod work;

pub use certs::{CertPair, CertStore};
pub use config::HarnessConfig;
pub use control::{ControlSession, PingResponse, WorkId, WorkState, WorkStatus};
pub use convergence::ConvergenceReport;
pub use error::{HarnessError, Result};
pub use mesh::MeshHandle;
pub use node::{NodeProcess, NodeState};
pub use runner::{InProcessLauncher, MeshRunner, NodeFactory, NodeLauncher, ProcessLauncher};
pub use topology::{Backend, Connection, NodeConfig, NodeSpec, TopologySpec};
pub use work::WorkAsserter;
