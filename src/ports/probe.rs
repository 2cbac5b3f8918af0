use std::net::{Ipv4Addr, TcpListener};

/// OS-level liveness check for a port.
pub trait PortProbe: Send + Sync {
    fn is_bound(&self, port: u16) -> bool;
}

/// A port counts as bound when a listener cannot be opened on loopback.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_bound(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err()
    }
}

/// Trust the store alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl PortProbe for NoProbe {
    fn is_bound(&self, _port: u16) -> bool {
        false
    }
}
