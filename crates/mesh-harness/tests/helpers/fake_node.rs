//! FakeMesh - an in-process stand-in for the mesh daemon
//!
//! Each node:
//! - serves the control socket named in its config (banner, `ping`,
//!   `status`, `work submit|cancel|release|status`)
//! - binds its tcp/ws/udp listeners and dials every configured peer
//! - gossips the set of nodes it can reach, building a next-hop routing table
//! - simulates work units: Pending, then Running for the service's
//!   `runtime_ms`, then Succeeded; cancel moves them to Cancelled
//!
//! Links are plain text lines (`GOSSIP <from> <known,...>`), over TCP for
//! tcp/ws backends and as datagrams for udp.

use anyhow::{Context, bail};
use mesh_harness::topology::fragment_entry;
use mesh_harness::{Backend, NodeConfig, NodeFactory};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Interval between gossip rounds.
const GOSSIP_INTERVAL: Duration = Duration::from_millis(50);
/// Time a submitted unit spends Pending before it runs.
const PENDING_FOR: Duration = Duration::from_millis(100);
/// Default run time of a work unit.
const DEFAULT_RUNTIME: Duration = Duration::from_secs(30);

/// Shared by every node of a fake mesh: which node offers which services.
#[derive(Default)]
struct Directory {
    services: HashMap<String, BTreeMap<String, Duration>>,
}

/// NodeFactory producing fake mesh nodes.
#[derive(Clone, Default)]
pub struct FakeMesh {
    directory: Arc<Mutex<Directory>>,
    /// Nodes that fail right after launch
    fail_nodes: BTreeSet<String>,
    /// Keep listeners open in a detached task after shutdown
    leak_listeners: bool,
    /// Open an outbound UDP socket per node and never close it
    leak_dial_sockets: bool,
    /// Never dial configured peers
    isolated: bool,
}

impl FakeMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` fail to start.
    pub fn failing(mut self, node: &str) -> Self {
        self.fail_nodes.insert(node.to_string());
        self
    }

    /// Keep listener sockets alive after the node reports exit.
    pub fn leaking_listeners(mut self) -> Self {
        self.leak_listeners = true;
        self
    }

    /// Leak one unlistened UDP socket per node. No port the harness knows
    /// about is involved, so only the socket audit can see it.
    pub fn leaking_dial_sockets(mut self) -> Self {
        self.leak_dial_sockets = true;
        self
    }

    /// Nodes that ignore their outbound peer stanzas, so the mesh never
    /// converges.
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnitState {
    Pending,
    Running,
    Succeeded,
    Cancelled,
}

struct Unit {
    service: String,
    started: Instant,
    runtime: Duration,
    cancelled: bool,
}

impl Unit {
    fn state(&self) -> UnitState {
        let age = self.started.elapsed();
        if self.cancelled {
            UnitState::Cancelled
        } else if age < PENDING_FOR {
            UnitState::Pending
        } else if age < PENDING_FOR + self.runtime {
            UnitState::Running
        } else {
            UnitState::Succeeded
        }
    }
}

/// Mutable view of one node.
#[derive(Default)]
struct NodeView {
    /// Directly connected peers -> link cost
    connections: BTreeMap<String, f64>,
    /// Destination -> next hop
    routes: BTreeMap<String, String>,
    units: HashMap<String, Unit>,
    next_unit: u64,
}

struct FakeNode {
    name: String,
    view: Mutex<NodeView>,
    directory: Arc<Mutex<Directory>>,
}

impl FakeNode {
    fn known(&self) -> BTreeSet<String> {
        let view = self.view.lock().unwrap();
        view.routes
            .keys()
            .cloned()
            .chain(std::iter::once(self.name.clone()))
            .collect()
    }

    fn gossip_line(&self) -> String {
        let known: Vec<String> = self.known().into_iter().collect();
        format!("GOSSIP {} {}\n", self.name, known.join(","))
    }

    fn absorb(&self, line: &str, cost: f64) -> Option<String> {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("GOSSIP") {
            return None;
        }
        let from = parts.next()?.to_string();
        let known = parts.next().unwrap_or_default();

        let mut view = self.view.lock().unwrap();
        view.connections.insert(from.clone(), cost);
        view.routes.insert(from.clone(), from.clone());
        for dest in known.split(',').filter(|d| !d.is_empty()) {
            if dest != self.name {
                view.routes
                    .entry(dest.to_string())
                    .or_insert_with(|| from.clone());
            }
        }
        Some(from)
    }

    fn drop_link(&self, peer: &str) {
        let mut view = self.view.lock().unwrap();
        view.connections.remove(peer);
        view.routes.retain(|_, hop| hop != peer);
    }

    fn reachable(&self, target: &str) -> bool {
        target == self.name || self.view.lock().unwrap().routes.contains_key(target)
    }
}

#[async_trait::async_trait]
impl NodeFactory for FakeMesh {
    async fn run(
        &self,
        config: NodeConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if self.fail_nodes.contains(&config.name) {
            bail!("refusing to start {}", config.name);
        }

        let node = Arc::new(FakeNode {
            name: config.name.clone(),
            view: Mutex::new(NodeView::default()),
            directory: Arc::clone(&self.directory),
        });
        self.directory
            .lock()
            .unwrap()
            .services
            .insert(config.name.clone(), work_services(&config));

        if self.leak_dial_sockets {
            let socket = std::net::UdpSocket::bind(("127.0.0.1", 0))?;
            socket.connect(("127.0.0.1", 9))?;
            std::mem::forget(socket);
        }

        let mut tasks = JoinSet::new();

        for (index, &(backend, port)) in config.listeners.iter().enumerate() {
            let cost = listener_cost(&config, index);
            match backend {
                Backend::Tcp | Backend::Ws => {
                    let listener = TcpListener::bind(("127.0.0.1", port))
                        .await
                        .with_context(|| format!("bind {backend} listener {port}"))?;
                    if self.leak_listeners {
                        let std_listener = listener.into_std()?;
                        let held = std_listener.try_clone()?;
                        tokio::spawn(async move {
                            let _held = held;
                            std::future::pending::<()>().await;
                        });
                        let listener = TcpListener::from_std(std_listener)?;
                        tasks.spawn(accept_links(Arc::clone(&node), listener, cost));
                    } else {
                        tasks.spawn(accept_links(Arc::clone(&node), listener, cost));
                    }
                }
                Backend::Udp => {
                    let socket = UdpSocket::bind(("127.0.0.1", port))
                        .await
                        .with_context(|| format!("bind udp listener {port}"))?;
                    tasks.spawn(serve_udp(Arc::clone(&node), socket, None));
                }
            }
        }

        let dial: Vec<String> = if self.isolated {
            Vec::new()
        } else {
            config.peers.values().cloned().collect()
        };
        for address in dial {
            let node = Arc::clone(&node);
            if let Some(target) = address.strip_prefix("ws://") {
                tasks.spawn(dial_tcp(node, target.to_string()));
            } else if peer_is_udp(&config, &address) {
                let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
                let target: SocketAddr = address.parse()?;
                tasks.spawn(serve_udp(node, socket, Some(target)));
            } else {
                tasks.spawn(dial_tcp(node, address));
            }
        }

        let control = UnixListener::bind(&config.control_socket)
            .with_context(|| format!("bind {}", config.control_socket.display()))?;
        tasks.spawn(serve_control(Arc::clone(&node), control));

        let _ = shutdown.wait_for(|stop| *stop).await;
        tasks.shutdown().await;
        let _ = std::fs::remove_file(&config.control_socket);
        Ok(())
    }
}

fn work_services(config: &NodeConfig) -> BTreeMap<String, Duration> {
    config
        .fragments
        .iter()
        .filter_map(fragment_entry)
        .filter(|(key, _)| *key == "work-command")
        .filter_map(|(_, body)| {
            let service = body.get("service")?.as_str()?.to_string();
            let runtime = body
                .get("runtime_ms")
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RUNTIME);
            Some((service, runtime))
        })
        .collect()
}

fn listener_cost(config: &NodeConfig, index: usize) -> f64 {
    config
        .fragments
        .iter()
        .filter_map(fragment_entry)
        .filter(|(key, _)| key.ends_with("-listener"))
        .nth(index)
        .and_then(|(_, body)| body.get("cost"))
        .and_then(|cost| cost.as_f64())
        .unwrap_or(1.0)
}

fn peer_is_udp(config: &NodeConfig, address: &str) -> bool {
    config
        .fragments
        .iter()
        .filter_map(fragment_entry)
        .any(|(key, body)| {
            key == "udp-peer" && body.get("address").and_then(|a| a.as_str()) == Some(address)
        })
}

async fn accept_links(node: Arc<FakeNode>, listener: TcpListener, cost: f64) {
    let mut links = JoinSet::new();
    while let Ok((stream, _)) = listener.accept().await {
        links.spawn(run_link(Arc::clone(&node), stream, cost));
    }
}

async fn dial_tcp(node: Arc<FakeNode>, address: String) {
    loop {
        if let Ok(stream) = TcpStream::connect(&address).await {
            run_link(Arc::clone(&node), stream, 1.0).await;
        }
        tokio::time::sleep(GOSSIP_INTERVAL).await;
    }
}

async fn run_link(node: Arc<FakeNode>, stream: TcpStream, cost: f64) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
    let mut peer = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if write.write_all(node.gossip_line().as_bytes()).await.is_err() {
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(from) = node.absorb(&line, cost) {
                        peer = Some(from);
                    }
                }
                _ => break,
            },
        }
    }
    if let Some(peer) = peer {
        node.drop_link(&peer);
    }
}

async fn serve_udp(node: Arc<FakeNode>, socket: UdpSocket, dial: Option<SocketAddr>) {
    let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
    let mut peers: BTreeSet<SocketAddr> = dial.into_iter().collect();
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let line = node.gossip_line();
                for peer in &peers {
                    let _ = socket.send_to(line.as_bytes(), peer).await;
                }
            }
            received = socket.recv_from(&mut buf) => {
                if let Ok((len, from)) = received {
                    let line = String::from_utf8_lossy(&buf[..len]).into_owned();
                    if node.absorb(line.trim(), 1.0).is_some() {
                        peers.insert(from);
                    }
                }
            }
        }
    }
}

async fn serve_control(node: Arc<FakeNode>, listener: UnixListener) {
    let mut sessions = JoinSet::new();
    while let Ok((stream, _)) = listener.accept().await {
        sessions.spawn(control_session(Arc::clone(&node), stream));
    }
}

async fn control_session(node: Arc<FakeNode>, stream: UnixStream) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    write
        .write_all(format!("Mesh Control, node {}\n", node.name).as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let reply = match words.as_slice() {
            ["ping", target] => ping(&node, target),
            ["status"] => status(&node),
            ["work", "submit", target, service, ..] => {
                match submit(&node, target, service) {
                    Ok(id) => {
                        let ack = format!(
                            "Work unit created with ID {id}. Send stdin data and EOF.\n"
                        );
                        write.write_all(ack.as_bytes()).await?;
                        let mut stdin = Vec::new();
                        reader.read_to_end(&mut stdin).await?;
                        write
                            .write_all(format!("{}\n", json!({"Result": "Job Started"})).as_bytes())
                            .await?;
                        return Ok(());
                    }
                    Err(reason) => format!("ERROR: {reason}"),
                }
            }
            ["work", "cancel", id] => with_unit(&node, id, |unit| {
                unit.cancelled = true;
                json!({"Cancelled": true})
            }),
            ["work", "release", id] => {
                let removed = node.view.lock().unwrap().units.remove(*id);
                match removed {
                    Some(_) => json!({"Released": id}).to_string(),
                    None => format!("ERROR: unknown work unit {id}"),
                }
            }
            ["work", "status", id] => with_unit(&node, id, |unit| {
                let (state, name) = match unit.state() {
                    UnitState::Pending => (0, "Pending"),
                    UnitState::Running => (1, "Running"),
                    UnitState::Succeeded => (2, "Succeeded"),
                    UnitState::Cancelled => (3, "Cancelled"),
                };
                json!({"State": state, "StateName": name, "Detail": name, "WorkType": unit.service})
            }),
            _ => format!("ERROR: unknown command {:?}", line.trim()),
        };
        write.write_all(format!("{reply}\n").as_bytes()).await?;
    }
}

fn ping(node: &FakeNode, target: &str) -> String {
    if node.reachable(target) {
        json!({"From": target, "Success": true, "Time": 0.001}).to_string()
    } else {
        json!({"From": "", "Success": false, "Error": format!("no route to {target}")}).to_string()
    }
}

fn status(node: &FakeNode) -> String {
    let view = node.view.lock().unwrap();
    let connections: Vec<_> = view
        .connections
        .iter()
        .map(|(peer, cost)| json!({"NodeID": peer, "Cost": cost}))
        .collect();
    json!({
        "NodeID": node.name,
        "Connections": connections,
        "RoutingTable": view.routes,
    })
    .to_string()
}

fn submit(node: &FakeNode, target: &str, service: &str) -> Result<String, String> {
    if !node.reachable(target) {
        return Err(format!("no route to {target}"));
    }
    let runtime = node
        .directory
        .lock()
        .unwrap()
        .services
        .get(target)
        .and_then(|services| services.get(service).copied())
        .ok_or_else(|| format!("unknown work type {service} on {target}"))?;

    let mut view = node.view.lock().unwrap();
    view.next_unit += 1;
    let id = format!("{}w{}", node.name, view.next_unit);
    view.units.insert(
        id.clone(),
        Unit {
            service: service.to_string(),
            started: Instant::now(),
            runtime,
            cancelled: false,
        },
    );
    Ok(id)
}

fn with_unit(
    node: &FakeNode,
    id: &str,
    f: impl FnOnce(&mut Unit) -> serde_json::Value,
) -> String {
    let mut view = node.view.lock().unwrap();
    match view.units.get_mut(id) {
        Some(unit) => f(unit).to_string(),
        None => format!("ERROR: unknown work unit {id}"),
    }
}
