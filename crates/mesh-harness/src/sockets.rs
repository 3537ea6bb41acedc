//! OS-level socket enumeration.
//!
//! Teardown is verified against what the kernel reports, not against what
//! the harness believes it closed. For out-of-process nodes that means the
//! `ss` socket table filtered by owning pid, with `/proc/<pid>/fd` as a
//! fallback on hosts without `ss`. In-process nodes share the test's pid, so
//! their listeners are checked by trying to bind the ports they held, and
//! every other inet socket they open is tracked by inode through a
//! [`SocketAudit`].

use crate::topology::Backend;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::process::Command;
use tracing::debug;

const PROC_ROOT: &str = "/proc";

/// Inet socket tables under `/proc/<pid>/net`.
const INET_TABLES: [&str; 4] = ["tcp", "tcp6", "udp", "udp6"];

/// Audits not yet dropped, process-wide.
static LIVE_AUDITS: AtomicUsize = AtomicUsize::new(0);
/// Audits ever begun, process-wide.
static AUDITS_BEGUN: AtomicU64 = AtomicU64::new(0);

/// A point-in-time snapshot of the host's socket table.
#[derive(Debug, Clone, Default)]
pub struct SocketTable {
    /// `ss` output lines, or `None` when `ss` could not be run
    lines: Option<Vec<String>>,
}

impl SocketTable {
    /// Capture `ss -tuanpx` (TCP, UDP and Unix sockets with owning processes).
    pub async fn snapshot() -> Self {
        let output = Command::new("ss")
            .arg("-tuanpx")
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                Self {
                    lines: Some(text.lines().map(str::to_string).collect()),
                }
            }
            Ok(output) => {
                debug!(status = %output.status, "ss failed; falling back to /proc");
                Self { lines: None }
            }
            Err(e) => {
                debug!(error = %e, "ss unavailable; falling back to /proc");
                Self { lines: None }
            }
        }
    }

    /// Build a table from captured `ss` output.
    pub fn from_ss_output(text: &str) -> Self {
        Self {
            lines: Some(text.lines().map(str::to_string).collect()),
        }
    }

    /// Sockets held by `pid`, one descriptive line each.
    pub fn owned_by(&self, pid: u32) -> Vec<String> {
        match &self.lines {
            Some(lines) => filter_owned(lines, pid),
            None => proc_sockets(Path::new(PROC_ROOT), pid),
        }
    }
}

/// `ss` lines whose process column names `pid`.
fn filter_owned(lines: &[String], pid: u32) -> Vec<String> {
    let needle = format!("pid={pid},");
    lines
        .iter()
        .filter(|line| line.contains(&needle))
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

/// `(fd, link target)` for every socket descriptor under `<proc_root>/<pid>/fd`.
fn socket_fds(proc_root: &Path, pid: u32) -> Vec<(String, String)> {
    let fd_dir = proc_root.join(pid.to_string()).join("fd");
    let Ok(entries) = std::fs::read_dir(&fd_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let target = std::fs::read_link(entry.path()).ok()?;
            let target = target.to_string_lossy().into_owned();
            target
                .starts_with("socket:")
                .then(|| (entry.file_name().to_string_lossy().into_owned(), target))
        })
        .collect()
}

/// Socket descriptors listed under `<proc_root>/<pid>/fd`.
fn proc_sockets(proc_root: &Path, pid: u32) -> Vec<String> {
    let mut sockets: Vec<String> = socket_fds(proc_root, pid)
        .into_iter()
        .map(|(fd, target)| format!("fd {fd} -> {target}"))
        .collect();
    sockets.sort();
    sockets
}

/// TCP and UDP sockets held by `pid`, keyed by inode.
///
/// Unix sockets are left out: the runtime keeps its own, and node control
/// sockets are checked by path.
fn inet_sockets(proc_root: &Path, pid: u32) -> BTreeMap<u64, String> {
    let held: BTreeSet<u64> = socket_fds(proc_root, pid)
        .iter()
        .filter_map(|(_, target)| {
            target
                .strip_prefix("socket:[")?
                .strip_suffix(']')?
                .parse()
                .ok()
        })
        .collect();

    let mut sockets = BTreeMap::new();
    if held.is_empty() {
        return sockets;
    }
    let net_dir = proc_root.join(pid.to_string()).join("net");
    for table in INET_TABLES {
        let Ok(text) = std::fs::read_to_string(net_dir.join(table)) else {
            continue;
        };
        for line in text.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(local), Some(inode)) = (fields.get(1), fields.get(9)) else {
                continue;
            };
            let Ok(inode) = inode.parse::<u64>() else {
                continue;
            };
            if held.contains(&inode) {
                let proto = table.trim_end_matches('6');
                sockets.insert(inode, format!("{proto} {}", decode_address(local)));
            }
        }
    }
    sockets
}

/// Render a `/proc/net` address (`0100007F:BC03`) as `127.0.0.1:48131`.
///
/// IPv6 addresses are left in kernel hex, with the port decoded.
fn decode_address(field: &str) -> String {
    let Some((addr, port)) = field.split_once(':') else {
        return field.to_string();
    };
    let port = u16::from_str_radix(port, 16)
        .map(|p| p.to_string())
        .unwrap_or_else(|_| port.to_string());
    match u32::from_str_radix(addr, 16) {
        Ok(raw) if addr.len() == 8 => format!("{}:{port}", Ipv4Addr::from(raw.to_le_bytes())),
        _ => format!("[{addr}]:{port}"),
    }
}

/// Inet sockets opened by in-process nodes that outlive them.
///
/// In-process nodes share the test's pid, so their sockets are told apart by
/// inode: a socket counts against the mesh when it was opened after
/// [`begin`](Self::begin) and is still held when [`leaked`](Self::leaked)
/// looks. That attribution holds only while no other audit overlapped this
/// one in the same process; otherwise `leaked` declines to answer.
#[derive(Debug)]
pub struct SocketAudit {
    baseline: BTreeSet<u64>,
    generation: u64,
    exclusive: bool,
}

impl SocketAudit {
    /// Record the inet sockets this process holds right now.
    pub fn begin() -> Self {
        let others = LIVE_AUDITS.fetch_add(1, Ordering::SeqCst);
        let generation = AUDITS_BEGUN.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            baseline: inet_sockets(Path::new(PROC_ROOT), std::process::id())
                .into_keys()
                .collect(),
            generation,
            exclusive: others == 0,
        }
    }

    /// Whether no other audit has run alongside this one.
    pub fn attributable(&self) -> bool {
        self.exclusive && AUDITS_BEGUN.load(Ordering::SeqCst) == self.generation
    }

    /// Sockets opened since `begin` and still held, or `None` when other
    /// audits overlapped and the sockets cannot be attributed.
    pub fn leaked(&self) -> Option<Vec<String>> {
        if !self.attributable() {
            return None;
        }
        Some(opened_since(
            &self.baseline,
            Path::new(PROC_ROOT),
            std::process::id(),
        ))
    }
}

/// Inet sockets held by `pid` that are not in `baseline`.
fn opened_since(baseline: &BTreeSet<u64>, proc_root: &Path, pid: u32) -> Vec<String> {
    inet_sockets(proc_root, pid)
        .into_iter()
        .filter(|(inode, _)| !baseline.contains(inode))
        .map(|(inode, socket)| format!("{socket} (inode {inode})"))
        .collect()
}

impl Drop for SocketAudit {
    fn drop(&mut self) {
        LIVE_AUDITS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Whether `pid` still names a live (or unreaped) process.
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
        Err(_) => false,
    }
}

/// Whether a loopback listener port is still held by someone.
pub fn port_in_use(backend: Backend, port: u16) -> bool {
    let addr = (Ipv4Addr::LOCALHOST, port);
    match backend {
        Backend::Tcp | Backend::Ws => TcpListener::bind(addr).is_err(),
        Backend::Udp => UdpSocket::bind(addr).is_err(),
    }
}

/// Whether something still accepts connections on a Unix control socket.
pub async fn unix_socket_live(path: &Path) -> bool {
    tokio::net::UnixStream::connect(path).await.is_ok()
}
