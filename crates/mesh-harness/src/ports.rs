//! Loopback port reservation.
//!
//! Listeners without an explicit port get one from the OS. Reservations are
//! held open until every listener of a mesh has a port, so two listeners of
//! the same mesh never receive the same number.

use crate::error::Result;
use crate::topology::Backend;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};

enum Reservation {
    Tcp(#[allow(dead_code)] TcpListener),
    Udp(#[allow(dead_code)] UdpSocket),
}

/// Hands out free loopback ports, holding each until released.
#[derive(Default)]
pub struct PortAllocator {
    held: Vec<Reservation>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a free port usable by a listener on `backend`.
    pub fn reserve(&mut self, backend: Backend) -> Result<u16> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let port = match backend {
            Backend::Tcp | Backend::Ws => {
                let listener = TcpListener::bind(addr)?;
                let port = listener.local_addr()?.port();
                self.held.push(Reservation::Tcp(listener));
                port
            }
            Backend::Udp => {
                let socket = UdpSocket::bind(addr)?;
                let port = socket.local_addr()?.port();
                self.held.push(Reservation::Udp(socket));
                port
            }
        };
        Ok(port)
    }

    /// Number of ports currently held.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Close every reservation so the daemons can bind the ports.
    pub fn release(&mut self) {
        self.held.clear();
    }
}
