//! Network module - Handles the TCP link to the peer and UDP discovery
//!
//! Provides:
//! - Transport server owning the listener and the single peer connection
//! - Per-connection reader/writer tasks
//! - Limited-broadcast sends on every usable interface
//! - A minimal peer used for testing the link end to end

mod server;
mod connection;
mod broadcast;
mod peer;

pub use server::*;
pub use broadcast::*;
pub use peer::*;

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Configuration for the transport server
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP listen port, also the UDP broadcast destination port
    pub port: u16,
    /// Address to bind the listener to
    pub bind_address: IpAddr,
    /// Size of each socket read
    pub read_buffer_size: usize,
    /// Disable Nagle on the accepted connection
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            read_buffer_size: 1024,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }
}

/// Events emitted by the transport server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer connection was accepted
    ClientConnected { addr: SocketAddr },
    /// The peer connection was torn down
    ClientDisconnected,
    /// Raw bytes from one socket read, not yet parsed
    DataReceived(Bytes),
    /// A queued send was written to the socket
    DataSent { len: usize },
    /// A discovery datagram left through the given interface address
    BroadcastSent { interface: Ipv4Addr },
}

/// What the session needs from a transport
pub trait PacketTransport: Send + Sync {
    /// Whether a peer connection is currently held
    fn is_client_connected(&self) -> bool;

    /// Queue a frame for the peer without blocking
    fn send(&self, frame: Bytes);

    /// Send a frame as UDP broadcast on all usable interfaces
    fn send_broadcast(&self, frame: Bytes);

    /// Tear down the connection and listen again
    fn restart(&self);
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
