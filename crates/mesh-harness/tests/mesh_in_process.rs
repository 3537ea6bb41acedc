//! Mesh lifecycle, convergence and control-protocol tests against the
//! in-process fake node.

mod helpers;

use helpers::{FakeMesh, cost_star, fast_config, leftovers, mesh_definition};
use mesh_harness::logging::init_test_logging;
use mesh_harness::mesh::UNATTRIBUTED;
use mesh_harness::{
    Backend, HarnessError, MeshRunner, NodeState, TopologySpec, WorkState,
};
use std::time::Duration;

const READY_DEADLINE: Duration = Duration::from_secs(20);
const WORK_DEADLINE: Duration = Duration::from_secs(20);

const TWO_NODE_WORK: &str = r#"
nodes:
  node1:
    connections: {}
    nodedef:
      - tcp-listener:
          cost: 4.5
          nodecost:
            node2: 2.6
  node2:
    connections:
      node1:
        index: 0
    nodedef:
      - work-command:
          service: echosleep
          command: bash
          params: "-c \"for i in {1..5}; do echo $i; sleep 2; done\""
          runtime_ms: 60000
"#;

/// Same pair, with a unit that would finish on its own within 300ms.
const TWO_NODE_SHORT_WORK: &str = r#"
nodes:
  node1:
    connections: {}
    nodedef:
      - tcp-listener: {}
  node2:
    connections:
      node1:
        index: 0
    nodedef:
      - work-command:
          service: quick
          command: "true"
          runtime_ms: 300
"#;

/// Ping every node from every node.
async fn ping_all(mesh: &mesh_harness::MeshHandle) {
    let names: Vec<String> = mesh.nodes().keys().cloned().collect();
    for from in &names {
        let mut session = mesh.session(from).await.unwrap();
        for to in &names {
            let reply = session
                .ping(to)
                .await
                .unwrap_or_else(|e| panic!("ping {from} -> {to}: {e}"));
            assert_eq!(&reply.from, to);
        }
        session.close().await;
    }
}

#[tokio::test]
async fn test_mesh_startup_all_definitions() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));

    for shape in ["flat", "random", "tree"] {
        for backend in Backend::all() {
            let file = format!("{shape}-mesh-{backend}.yaml");
            let spec = mesh_definition(&file);
            let mut mesh = runner.start(&spec).await.unwrap();
            assert_eq!(mesh.state(), NodeState::Running);

            mesh.wait_for_ready(READY_DEADLINE)
                .await
                .unwrap_or_else(|e| panic!("{file}: {e}"));
            assert!(mesh.check_connections().await, "{file} flapped after ready");
            ping_all(&mesh).await;

            mesh.destroy().await;
            mesh.wait_for_shutdown()
                .await
                .unwrap_or_else(|e| panic!("{file}: {e}"));
        }
    }

    assert!(leftovers(base.path()).is_empty());
}

#[tokio::test]
async fn test_linear_mesh_startup_ten_nodes() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let mut mesh = runner
        .start(&TopologySpec::linear(10, Backend::Tcp))
        .await
        .unwrap();
    assert_eq!(mesh.nodes().len(), 10);

    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();
    let mut first = mesh.session("node0").await.unwrap();
    first.ping("node9").await.unwrap();
    first.close().await;

    mesh.wait_for_shutdown().await.unwrap();
    assert!(leftovers(base.path()).is_empty());
}

#[tokio::test]
async fn test_cost_weighted_star() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let mut mesh = runner.start(&cost_star()).await.unwrap();
    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();
    ping_all(&mesh).await;

    let mut hub = mesh.session("node1").await.unwrap();
    let status = hub.status().await.unwrap();
    assert_eq!(status.connections.len(), 3);
    hub.close().await;

    mesh.wait_for_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_converged_mesh_does_not_flap() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let mut mesh = runner
        .start(&TopologySpec::random(6, 3, 7, Backend::Tcp))
        .await
        .unwrap();

    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();
    for _ in 0..5 {
        assert!(mesh.check_connections().await);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    mesh.wait_for_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_node_work_cancel_and_release() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let spec = TopologySpec::from_yaml_str(TWO_NODE_WORK).unwrap();
    let mut mesh = runner.start(&spec).await.unwrap();
    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();

    let mut node1 = mesh.session("node1").await.unwrap();
    node1.ping("node2").await.unwrap();
    node1.close().await;
    let mut node2 = mesh.session("node2").await.unwrap();
    node2.ping("node1").await.unwrap();
    node2.close().await;

    // submit consumes its session; status polling needs a fresh one
    let submit = mesh.session("node1").await.unwrap();
    let work_id = submit.work_submit("node2", "echosleep", None).await.unwrap();
    let asserter = mesh.work_asserter("node1").await.unwrap();

    asserter.assert_running(WORK_DEADLINE, &work_id).await.unwrap();
    asserter.cancel(&work_id).await.unwrap();
    let cancelled = asserter.assert_cancelled(WORK_DEADLINE, &work_id).await.unwrap();
    assert_eq!(cancelled.work_type, "echosleep");

    asserter.release(&work_id).await.unwrap();
    let status = asserter.status(&work_id).await.unwrap();
    assert_eq!(status.state, WorkState::Released);

    // releasing twice is a rejection, and the session survives it
    let err = asserter.release(&work_id).await.unwrap_err();
    assert!(matches!(err, HarnessError::CommandRejected { .. }));
    assert!(!asserter.into_session().is_poisoned());

    mesh.wait_for_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_immediate_cancel_wins_over_completion() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let spec = TopologySpec::from_yaml_str(TWO_NODE_SHORT_WORK).unwrap();
    let mut mesh = runner.start(&spec).await.unwrap();
    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();

    let asserter = mesh.work_asserter("node1").await.unwrap();
    let work_id = mesh
        .session("node1")
        .await
        .unwrap()
        .work_submit("node2", "quick", None)
        .await
        .unwrap();
    asserter.cancel(&work_id).await.unwrap();
    asserter.assert_cancelled(WORK_DEADLINE, &work_id).await.unwrap();

    // well past the unit's run time it must still read Cancelled
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = asserter.status(&work_id).await.unwrap();
    assert_eq!(status.state, WorkState::Cancelled);

    asserter.release(&work_id).await.unwrap();
    asserter.assert_released(WORK_DEADLINE, &work_id).await.unwrap();

    mesh.wait_for_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_service_is_rejected() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let spec = TopologySpec::from_yaml_str(TWO_NODE_WORK).unwrap();
    let mut mesh = runner.start(&spec).await.unwrap();
    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();

    let session = mesh.session("node1").await.unwrap();
    let err = session
        .work_submit("node2", "no-such-service", None)
        .await
        .unwrap_err();
    match err {
        HarnessError::CommandRejected { reason, .. } => {
            assert!(reason.contains("no-such-service"))
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut session = mesh.session("node1").await.unwrap();
    let err = session.ping("node9").await.unwrap_err();
    assert!(matches!(err, HarnessError::CommandRejected { .. }));

    let err = mesh.session("node9").await.unwrap_err();
    assert!(matches!(err, HarnessError::Construction(_)), "{err}");

    mesh.wait_for_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dangling_peer_starts_nothing() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));

    let mut spec = TopologySpec::linear(3, Backend::Tcp);
    spec.connect("node2", "ghost", mesh_harness::Connection::plain(0));

    let err = runner.start(&spec).await.unwrap_err();
    assert!(matches!(err, HarnessError::Construction(_)), "{err}");
    assert!(leftovers(base.path()).is_empty());
}

#[tokio::test]
async fn test_undefined_tls_profile_starts_nothing() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));

    let mut spec = TopologySpec::linear(2, Backend::Tcp);
    spec.connect(
        "node1",
        "node0",
        mesh_harness::Connection::with_tls(0, "missing-profile"),
    );

    let err = runner.start(&spec).await.unwrap_err();
    assert!(matches!(err, HarnessError::Construction(_)), "{err}");
    assert!(leftovers(base.path()).is_empty());
}

#[tokio::test]
async fn test_partial_start_is_rolled_back() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(
        FakeMesh::new().failing("node1"),
        fast_config(base.path()),
    );

    let err = runner
        .start(&TopologySpec::linear(3, Backend::Tcp))
        .await
        .unwrap_err();
    match err {
        HarnessError::Launch { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].node, "node1");
            assert!(failures[0].reason.contains("refusing to start node1"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(leftovers(base.path()).is_empty());
}

#[tokio::test]
async fn test_ready_wait_times_out_with_report() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new().isolated(), fast_config(base.path()));
    let mut mesh = runner
        .start(&TopologySpec::linear(2, Backend::Tcp))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = mesh
        .wait_for_ready(Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        HarnessError::ConvergenceTimeout { report, .. } => {
            assert!(!report.converged);
            assert_eq!(report.mismatches.len(), 2);
            assert!(report.to_string().contains("node0: connected to []"));
        }
        other => panic!("unexpected {other:?}"),
    }

    mesh.wait_for_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let mut mesh = runner
        .start(&TopologySpec::star(4, Backend::Udp))
        .await
        .unwrap();
    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();

    let node_dirs: Vec<_> = mesh
        .nodes()
        .values()
        .map(|n| n.work_dir().to_path_buf())
        .collect();

    mesh.destroy().await;
    assert_eq!(mesh.state(), NodeState::Stopped);
    assert!(node_dirs.iter().all(|dir| !dir.exists()));
    mesh.destroy().await;
    assert_eq!(mesh.state(), NodeState::Stopped);

    mesh.wait_for_shutdown().await.unwrap();
    assert!(!mesh.root().exists());
}

#[tokio::test]
async fn test_leaked_listener_fails_shutdown() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(
        FakeMesh::new().leaking_listeners(),
        fast_config(base.path()),
    );
    let mut mesh = runner
        .start(&TopologySpec::linear(2, Backend::Tcp))
        .await
        .unwrap();
    mesh.wait_for_ready(READY_DEADLINE).await.unwrap();

    mesh.destroy().await;
    let err = mesh.wait_for_shutdown().await.unwrap_err();
    match err {
        HarnessError::ShutdownLeak { leaks, .. } => {
            // the inode audit may add its own entry when no other mesh overlapped
            let per_node: Vec<_> = leaks.iter().filter(|l| l.node != UNATTRIBUTED).collect();
            assert_eq!(per_node.len(), 2);
            assert!(per_node.iter().all(|leak| leak.pid.is_none()));
            assert!(per_node[0].sockets[0].starts_with("tcp listener 127.0.0.1:"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_meshes_do_not_collide() {
    init_test_logging();
    let base = tempfile::tempdir().unwrap();
    let runner = MeshRunner::in_process(FakeMesh::new(), fast_config(base.path()));
    let spec = TopologySpec::linear(3, Backend::Tcp);

    let (a, b) = tokio::join!(runner.start(&spec), runner.start(&spec));
    let (mut a, mut b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.root(), b.root());
    assert_ne!(a.id(), b.id());

    let (ready_a, ready_b) = tokio::join!(
        a.wait_for_ready(READY_DEADLINE),
        b.wait_for_ready(READY_DEADLINE)
    );
    ready_a.unwrap();
    ready_b.unwrap();

    a.wait_for_shutdown().await.unwrap();
    b.wait_for_shutdown().await.unwrap();
    assert!(leftovers(base.path()).is_empty());
}
