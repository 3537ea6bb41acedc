//! Shared setup for integration tests.

#![allow(dead_code)]

pub mod fake_node;

use mesh_harness::{HarnessConfig, TopologySpec};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use fake_node::FakeMesh;

/// Harness config with timeouts sized for the fake node.
pub fn fast_config(base_dir: &Path) -> HarnessConfig {
    HarnessConfig {
        base_dir: base_dir.to_path_buf(),
        ready_poll_interval: Duration::from_millis(50),
        work_poll_interval: Duration::from_millis(50),
        shutdown_poll_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(3),
        termination_grace: Duration::from_millis(500),
        protocol_timeout: Duration::from_secs(2),
        socket_appear_timeout: Duration::from_secs(5),
        ..HarnessConfig::default()
    }
}

/// Mesh definition shipped under `tests/mesh-definitions/`.
pub fn mesh_definition(name: &str) -> TopologySpec {
    let path: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests", "mesh-definitions", name]
        .iter()
        .collect();
    TopologySpec::from_yaml_file(&path)
        .unwrap_or_else(|e| panic!("cannot load {}: {e}", path.display()))
}

const COST_STAR: &str = r#"
nodes:
  node1:
    connections: {}
    nodedef:
      - tcp-listener:
          cost: 4.5
          nodecost:
            node2: 2.6
            node3: 3.2
  node2:
    connections:
      node1:
        index: 0
    nodedef: []
  node3:
    connections:
      node1:
        index: 0
    nodedef: []
  node4:
    connections:
      node1:
        index: 0
    nodedef: []
"#;

/// Four-node star whose hub listener carries a default cost and per-node
/// overrides for node2 and node3.
pub fn cost_star() -> TopologySpec {
    TopologySpec::from_yaml_str(COST_STAR).expect("cost star topology")
}

/// Entries left under a harness base directory.
pub fn leftovers(base_dir: &Path) -> Vec<String> {
    std::fs::read_dir(base_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}
