//! Discovery module
//!
//! Listens for the UDP announcements a host broadcasts while it waits for a
//! peer. An announcement is a regular frame carrying a handshake-shaped
//! payload `[0, 1, 2, status]`; the sender address and the advertised status
//! are recorded per host.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{decode_frame, HostStatus, Packet, BROADCAST_MARKERS};

/// Hosts silent for this long are reported lost
pub const HOST_EXPIRY: Duration = Duration::from_secs(5);

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// A host seen announcing itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    /// Source address of the announcement
    pub addr: IpAddr,
    /// TCP port the host listens on
    pub port: u16,
    /// Status carried in the last announcement
    pub status: HostStatus,
    pub last_seen: Instant,
}

impl DiscoveredHost {
    /// Address to connect a peer to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Events from the discovery listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A new host was discovered
    HostDiscovered(DiscoveredHost),
    /// A known host announced a different status
    HostUpdated(DiscoveredHost),
    /// A host stopped announcing
    HostLost(IpAddr),
}

/// Extract the advertised status from a datagram, if it holds an announcement
///
/// A datagram carries exactly one frame, so it is decoded strictly.
pub fn parse_announcement(datagram: &[u8]) -> Option<HostStatus> {
    let payload = match decode_frame(datagram) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::trace!("Not an announcement: {}", e);
            return None;
        }
    };

    match Packet::parse(&payload) {
        Ok(Packet::Handshake(h)) if (h.m1, h.m2) == BROADCAST_MARKERS => {
            Some(HostStatus::from_byte(h.m3))
        }
        _ => None,
    }
}

type HostMap = Arc<RwLock<HashMap<IpAddr, DiscoveredHost>>>;

/// Discovery listener
pub struct Discovery {
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    /// Discovered hosts
    hosts: HostMap,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    event_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    running: Arc<RwLock<bool>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Discovery {
    /// Create a listener for announcements sent to `bind_addr`
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);

        Self {
            bind_addr,
            local_addr: None,
            hosts: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            running: Arc::new(RwLock::new(false)),
            shutdown_tx: None,
        }
    }

    /// Take the event receiver
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.event_rx.take()
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the UDP socket and start listening
    pub async fn start(&mut self) -> DiscoveryResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(DiscoveryError::AlreadyRunning);
            }
            let socket = UdpSocket::bind(self.bind_addr).await?;
            let local_addr = socket.local_addr()?;
            self.local_addr = Some(local_addr);
            *running = true;

            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
            self.shutdown_tx = Some(shutdown_tx);

            tokio::spawn(listen(
                socket,
                local_addr.port(),
                self.hosts.clone(),
                self.event_tx.clone(),
                self.running.clone(),
                shutdown_rx,
            ));

            tracing::info!("Listening for host announcements on {}", local_addr);
        }
        Ok(())
    }

    /// Stop listening
    pub async fn stop(&mut self) -> DiscoveryResult<()> {
        if !*self.running.read().await {
            return Err(DiscoveryError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        Ok(())
    }

    /// Get all discovered hosts
    pub async fn discovered_hosts(&self) -> Vec<DiscoveredHost> {
        let hosts = self.hosts.read().await;
        hosts.values().cloned().collect()
    }
}

async fn listen(
    socket: UdpSocket,
    port: u16,
    hosts: HostMap,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    running: Arc<RwLock<bool>>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut buf = [0u8; 512];
    let mut prune = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        if let Some(status) = parse_announcement(&buf[..n]) {
                            record(&hosts, &event_tx, from.ip(), port, status).await;
                        } else {
                            tracing::trace!("Ignoring {} byte datagram from {}", n, from);
                        }
                    }
                    Err(e) => tracing::warn!("Discovery receive error: {}", e),
                }
            }

            _ = prune.tick() => {
                let lost: Vec<IpAddr> = {
                    let mut hosts = hosts.write().await;
                    let lost: Vec<IpAddr> = hosts
                        .values()
                        .filter(|h| h.last_seen.elapsed() >= HOST_EXPIRY)
                        .map(|h| h.addr)
                        .collect();
                    for addr in &lost {
                        hosts.remove(addr);
                    }
                    lost
                };
                for addr in lost {
                    tracing::info!("Host {} lost", addr);
                    let _ = event_tx.send(DiscoveryEvent::HostLost(addr)).await;
                }
            }

            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    *running.write().await = false;
    tracing::info!("Discovery stopped");
}

async fn record(
    hosts: &HostMap,
    event_tx: &mpsc::Sender<DiscoveryEvent>,
    addr: IpAddr,
    port: u16,
    status: HostStatus,
) {
    let host = DiscoveredHost {
        addr,
        port,
        status,
        last_seen: Instant::now(),
    };

    let event = {
        let mut hosts = hosts.write().await;
        match hosts.insert(addr, host.clone()) {
            None => {
                tracing::info!("Discovered host {} ({:?})", addr, status);
                Some(DiscoveryEvent::HostDiscovered(host))
            }
            Some(previous) if previous.status != status => {
                tracing::debug!("Host {} status {:?} -> {:?}", addr, previous.status, status);
                Some(DiscoveryEvent::HostUpdated(host))
            }
            Some(_) => None,
        }
    };

    if let Some(event) = event {
        let _ = event_tx.send(event).await;
    }
}
