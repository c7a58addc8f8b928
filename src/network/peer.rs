//! Test peer
//!
//! The device side of the link, reduced to what is needed to drive a host:
//! connect, keep the handshake alive, stream control packets and report what
//! the host sends back.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{
    encode, parse_frames, CodecError, ControlPacket, HandshakePacket, HostStatus, PacketId,
    StatusPacket,
};

/// Peer errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type PeerResult<T> = Result<T, PeerError>;

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How often the handshake is repeated; it also keeps the host watchdog fed
    pub handshake_interval_ms: u64,
    /// Handshake sent on connect and on every interval
    pub handshake: HandshakePacket,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            handshake_interval_ms: 500,
            handshake: HandshakePacket::peer(),
        }
    }
}

/// Events emitted by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Connected to the host
    Connected { server_addr: SocketAddr },
    /// The host reported its status
    StatusReceived(HostStatus),
    /// Any other payload from the host
    PacketReceived(Bytes),
    /// Connection ended
    Disconnected { reason: String },
}

/// Peer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Minimal device-side peer
pub struct Peer {
    config: PeerConfig,
    state: Arc<RwLock<PeerState>>,
    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: Option<mpsc::Receiver<PeerEvent>>,
    /// Outbound payloads, framed by the connection task
    outbound: Arc<RwLock<Option<mpsc::Sender<Bytes>>>>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(PeerState::Disconnected)),
            event_tx,
            event_rx: Some(event_rx),
            outbound: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.event_rx.take()
    }

    /// Connect to a host
    pub async fn connect(&self, server_addr: SocketAddr) -> PeerResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != PeerState::Disconnected {
                return Err(PeerError::AlreadyConnected);
            }
            *state = PeerState::Connecting;
        }

        tracing::info!("Connecting to {}", server_addr);

        let stream = match tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = PeerState::Disconnected;
                return Err(PeerError::Io(e));
            }
            Err(_) => {
                *self.state.write().await = PeerState::Disconnected;
                return Err(PeerError::Timeout);
            }
        };
        stream.set_nodelay(true)?;

        let handshake_frame = encode(&self.config.handshake.to_payload())?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(256);
        *self.outbound.write().await = Some(outbound_tx);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        *self.state.write().await = PeerState::Connected;
        let _ = self.event_tx.send(PeerEvent::Connected { server_addr }).await;

        tokio::spawn(run_connection(
            stream,
            handshake_frame,
            Duration::from_millis(self.config.handshake_interval_ms.max(1)),
            outbound_rx,
            shutdown_rx,
            self.event_tx.clone(),
            self.state.clone(),
            self.outbound.clone(),
        ));

        Ok(())
    }

    /// Close the connection
    pub async fn disconnect(&self) -> PeerResult<()> {
        if *self.state.read().await == PeerState::Disconnected {
            return Err(PeerError::NotConnected);
        }
        if let Some(tx) = &*self.shutdown_tx.read().await {
            let _ = tx.send(()).await;
        }
        Ok(())
    }

    /// Send a raw payload; it is framed before hitting the socket
    pub async fn send_payload(&self, payload: Bytes) -> PeerResult<()> {
        let tx = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(PeerError::NotConnected)?;
        tx.send(payload).await.map_err(|_| PeerError::SendChannelClosed)
    }

    pub async fn send_control(&self, packet: &ControlPacket) -> PeerResult<()> {
        self.send_payload(packet.to_payload()).await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == PeerState::Connected
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    stream: TcpStream,
    handshake_frame: Bytes,
    handshake_interval: Duration,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: mpsc::Receiver<()>,
    event_tx: mpsc::Sender<PeerEvent>,
    state: Arc<RwLock<PeerState>>,
    outbound: Arc<RwLock<Option<mpsc::Sender<Bytes>>>>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut handshake_timer = tokio::time::interval(handshake_interval);
    let mut buf = [0u8; 1024];

    let disconnect_reason = loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => break "Connection closed".to_string(),
                    Ok(n) => {
                        for payload in parse_frames(&buf[..n]) {
                            let _ = event_tx.send(classify(payload)).await;
                        }
                    }
                    Err(e) => break format!("Error: {}", e),
                }
            }

            Some(payload) = outbound_rx.recv() => {
                match encode(&payload) {
                    Ok(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            break format!("Send error: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Dropping outbound payload: {}", e),
                }
            }

            _ = handshake_timer.tick() => {
                if let Err(e) = writer.write_all(&handshake_frame).await {
                    break format!("Handshake error: {}", e);
                }
            }

            _ = shutdown_rx.recv() => {
                break "Peer shutdown requested".to_string();
            }
        }
    };

    *outbound.write().await = None;
    *state.write().await = PeerState::Disconnected;

    let _ = writer.shutdown().await;
    tracing::info!("Disconnected: {}", disconnect_reason);

    let _ = event_tx
        .send(PeerEvent::Disconnected {
            reason: disconnect_reason,
        })
        .await;
}

fn classify(payload: Bytes) -> PeerEvent {
    let is_status =
        payload.first() == Some(&(PacketId::Status as u8)) && payload.len() == StatusPacket::SIZE;
    if is_status {
        if let Ok(status) = StatusPacket::from_payload(&payload) {
            return PeerEvent::StatusReceived(status.status);
        }
    }
    PeerEvent::PacketReceived(payload)
}
