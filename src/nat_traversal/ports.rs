/**
 * nat_traversal/ports.rs
 *
 * Fresh local UDP port candidates for each traversal attempt
 */

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, UdpSocket};
use std::sync::{Mutex, PoisonError};

/// Ports handed out recently are never handed out again until this many
/// newer ports have been issued
const RECENT_PORTS: usize = 1024;

pub struct PortPool {
    bind_ip: IpAddr,
    recent: Mutex<VecDeque<u16>>,
}

impl PortPool {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_PORTS)),
        }
    }

    /// Ask the OS for `count` distinct free ports, skipping recently issued ones
    pub fn acquire(&self, count: usize) -> io::Result<Vec<u16>> {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut held = Vec::with_capacity(count);
        let mut ports = Vec::with_capacity(count);
        let max_attempts = count * 16 + 16;

        for _ in 0..max_attempts {
            if ports.len() == count {
                break;
            }
            // Keep each probe socket open until all ports are chosen so the
            // OS cannot return the same port twice within one call
            let socket = UdpSocket::bind((self.bind_ip, 0))?;
            let port = socket.local_addr()?.port();
            held.push(socket);
            if ports.contains(&port) || recent.contains(&port) {
                continue;
            }
            ports.push(port);
        }

        if ports.len() < count {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("only found {} of {} fresh ports", ports.len(), count),
            ));
        }

        for &port in &ports {
            if recent.len() == RECENT_PORTS {
                recent.pop_front();
            }
            recent.push_back(port);
        }
        Ok(ports)
    }
}
