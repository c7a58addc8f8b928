//! Transport server
//!
//! Owns the listening socket and at most one accepted peer connection. All
//! operations are non-blocking and safe to call from any task or thread; the
//! socket work itself runs on tasks spawned onto the runtime the server was
//! created on. Every transport fault ends in [`TransportServer::restart`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::ClientConnection;
use super::{broadcast_interfaces, send_broadcast_datagram, PacketTransport, TransportConfig, TransportEvent};

/// Delay between attempts when the listener cannot be re-bound
const RESTART_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("No tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Default)]
struct ServerState {
    started: bool,
    /// Bumped on every start; tasks of older listen sessions are stale
    generation: u64,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    /// Listener parked here once the single client has been accepted
    listener: Option<TcpListener>,
    client: Option<ClientConnection>,
}

struct Shared {
    config: TransportConfig,
    runtime: Handle,
    state: Mutex<ServerState>,
    /// Serializes restarts
    restart_lock: tokio::sync::Mutex<()>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

/// Single-peer TCP server with UDP discovery broadcast
#[derive(Clone)]
pub struct TransportServer {
    shared: Arc<Shared>,
}

impl TransportServer {
    /// Create a stopped server bound to the current tokio runtime
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let runtime = Handle::try_current()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                state: Mutex::new(ServerState::default()),
                restart_lock: tokio::sync::Mutex::new(()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        })
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.shared.event_rx.lock().take()
    }

    /// Start listening. Starting a running server only logs a warning.
    pub fn start(&self) -> TransportResult<()> {
        let mut state = self.shared.state.lock();
        if state.started {
            tracing::warn!("TCP server already running");
            return Ok(());
        }

        let bind_addr = SocketAddr::new(self.shared.config.bind_address, self.shared.config.port);
        tracing::info!("Starting TCP server on {}", bind_addr);

        let std_listener = StdTcpListener::bind(bind_addr)
            .map_err(|source| TransportError::Bind { addr: bind_addr, source })?;
        std_listener.set_nonblocking(true)?;
        let listener = {
            let _guard = self.shared.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        let local_addr = listener.local_addr()?;

        state.generation += 1;
        state.started = true;
        state.local_addr = Some(local_addr);

        let server = self.clone();
        let generation = state.generation;
        state.accept_task = Some(
            self.shared
                .runtime
                .spawn(async move { server.accept_client(listener, generation).await }),
        );

        tracing::info!("Waiting for TCP client on {}...", local_addr);
        Ok(())
    }

    /// Stop and wait until the sockets held by server tasks are released
    pub async fn shutdown(&self) {
        for task in self.stop() {
            let _ = task.await;
        }
    }

    /// Stop, then start again. Runs on a spawned task and returns immediately;
    /// if the port cannot be bound the task keeps retrying. Requests made
    /// against the same listen session collapse into one restart.
    pub fn restart(&self) {
        let generation = self.shared.state.lock().generation;
        self.restart_from(generation);
    }

    fn restart_from(&self, generation: u64) {
        let server = self.clone();
        self.shared
            .runtime
            .spawn(async move { server.restart_now(generation).await });
    }

    async fn restart_now(&self, generation: u64) {
        let _guard = self.shared.restart_lock.lock().await;

        let current = self.shared.state.lock().generation;
        if current != generation {
            tracing::debug!("Listen session {} already replaced, skipping restart", generation);
            return;
        }

        self.shutdown().await;

        loop {
            match self.start() {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!("Restart failed: {}. Retrying in {:?}", e, RESTART_RETRY_DELAY);
                    tokio::time::sleep(RESTART_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Restart on behalf of a task, unless a newer listen session already
    /// replaced the one it belongs to
    pub(super) fn restart_if_current(&self, generation: u64, reason: &str) {
        {
            let state = self.shared.state.lock();
            if !state.started || state.generation != generation {
                tracing::debug!("{} on stale connection, ignoring", reason);
                return;
            }
        }
        tracing::warn!("{}. Restarting TCP server...", reason);
        self.restart_from(generation);
    }

    /// Close the connection (emitting a disconnect first) and the listener,
    /// returning the aborted tasks. Stopping a stopped server only logs a
    /// warning.
    pub fn stop(&self) -> Vec<JoinHandle<()>> {
        let (client, accept_task, listener) = {
            let mut state = self.shared.state.lock();
            if !state.started {
                tracing::warn!("TCP server not running");
                return Vec::new();
            }
            state.started = false;
            state.local_addr = None;
            (state.client.take(), state.accept_task.take(), state.listener.take())
        };

        tracing::info!("Stopping TCP server...");
        let mut tasks = Vec::new();

        if let Some(client) = client {
            tracing::info!("Closing connection to {}", client.addr());
            tasks.extend(client.close());
            self.emit(TransportEvent::ClientDisconnected);
        }
        if let Some(task) = accept_task {
            task.abort();
            tasks.push(task);
        }
        drop(listener);

        tracing::info!("TCP server stopped");
        tasks
    }

    async fn accept_client(self, listener: TcpListener, generation: u64) {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(self.shared.config.nodelay) {
                    tracing::warn!("Failed to set TCP_NODELAY: {}", e);
                }

                let mut state = self.shared.state.lock();
                if !state.started || state.generation != generation {
                    tracing::debug!("Dropping connection from {} accepted after stop", addr);
                    return;
                }

                tracing::info!("Connection to client {} established", addr);
                self.emit(TransportEvent::ClientConnected { addr });

                state.client = Some(ClientConnection::spawn(
                    stream,
                    addr,
                    generation,
                    self.shared.config.read_buffer_size,
                    self.clone(),
                    &self.shared.runtime,
                ));
                state.listener = Some(listener);
                state.accept_task = None;
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                self.restart_if_current(generation, "Accept failed");
            }
        }
    }

    /// Queue a frame for the connected peer
    pub fn send(&self, data: Bytes) {
        let (result, generation) = {
            let state = self.shared.state.lock();
            if !state.started {
                tracing::warn!("TCP server not started");
                return;
            }
            match &state.client {
                Some(client) => (client.send(data), state.generation),
                None => {
                    tracing::warn!("No client connected");
                    return;
                }
            }
        };

        if let Err(e) = result {
            tracing::warn!("{}. Restarting TCP server...", e);
            self.restart_from(generation);
        }
    }

    /// Send a datagram to the limited-broadcast address through every usable
    /// interface. Each interface gets its own socket and send task.
    pub fn send_broadcast(&self, data: Bytes) {
        let port = self.shared.config.port;
        let interfaces = broadcast_interfaces();
        if interfaces.is_empty() {
            tracing::debug!("No interface available for broadcast");
        }

        for interface in interfaces {
            let server = self.clone();
            let data = data.clone();
            self.shared.runtime.spawn(async move {
                match send_broadcast_datagram(interface, port, &data).await {
                    Ok(_) => server.emit(TransportEvent::BroadcastSent { interface }),
                    Err(e) => tracing::debug!("Broadcast via {} failed: {}", interface, e),
                }
            });
        }
    }

    pub(super) fn emit(&self, event: TransportEvent) {
        if self.shared.event_tx.send(event).is_err() {
            tracing::trace!("Transport event dropped, no listener");
        }
    }

    #[cfg(test)]
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    pub fn is_client_connected(&self) -> bool {
        self.shared.state.lock().client.is_some()
    }

    /// Address the listener is bound to, while started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local_addr
    }
}

impl PacketTransport for TransportServer {
    fn is_client_connected(&self) -> bool {
        TransportServer::is_client_connected(self)
    }

    fn send(&self, frame: Bytes) {
        TransportServer::send(self, frame)
    }

    fn send_broadcast(&self, frame: Bytes) {
        TransportServer::send_broadcast(self, frame)
    }

    fn restart(&self) {
        TransportServer::restart(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback_server() -> TransportServer {
        let config = TransportConfig::new(0).with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        TransportServer::new(config).unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn generation(server: &TransportServer) -> u64 {
        server.shared.state.lock().generation
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        let next = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(next.is_err(), "unexpected event {:?}", next);
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = loopback_server();
        assert!(!server.is_started());
        assert!(!server.is_client_connected());
        assert!(server.take_event_receiver().is_some());
        assert!(server.take_event_receiver().is_none());
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            TransportServer::new(TransportConfig::default()),
            Err(TransportError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let server = loopback_server();
        assert_ok!(server.start());
        let addr = server.local_addr().unwrap();
        assert_ok!(server.start());
        assert_eq!(server.local_addr(), Some(addr));

        server.stop();
        assert!(!server.is_started());
        server.stop();
        assert!(!server.is_started());
    }

    #[tokio::test]
    async fn test_connect_receive_and_disconnect() {
        let server = loopback_server();
        let mut events = server.take_event_receiver().unwrap();
        assert_ok!(server.start());

        let addr = server.local_addr().unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();

        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));
        assert!(server.is_client_connected());

        peer.write_all(&[0xBE, 0xEF, 0x01, 0x07, 0x06]).await.unwrap();
        match next_event(&mut events).await {
            TransportEvent::DataReceived(data) => assert_eq!(&data[..], &[0xBE, 0xEF, 0x01, 0x07, 0x06]),
            other => panic!("unexpected event {:?}", other),
        }

        // Peer close ends in a restart: disconnect event, then a fresh listener
        drop(peer);
        assert_eq!(next_event(&mut events).await, TransportEvent::ClientDisconnected);
        wait_until(|| server.is_started()).await;
        assert!(!server.is_client_connected());

        let mut again = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));

        server.send(Bytes::from_static(&[1, 2, 3]));
        let mut buf = [0u8; 3];
        timeout(WAIT, again.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(next_event(&mut events).await, TransportEvent::DataSent { len: 3 });

        server.shutdown().await;
        assert_eq!(next_event(&mut events).await, TransportEvent::ClientDisconnected);
    }

    #[tokio::test]
    async fn test_send_without_client_is_noop() {
        let server = loopback_server();
        server.send(Bytes::from_static(&[1]));
        assert_ok!(server.start());
        server.send(Bytes::from_static(&[1]));
        assert!(server.is_started());
        server.stop();
    }

    #[tokio::test]
    async fn test_restart_keeps_listening() {
        let server = loopback_server();
        assert_ok!(server.start());
        server.restart_now(generation(&server)).await;

        assert!(server.is_started());
        let addr = server.local_addr().unwrap();
        assert_ok!(TcpStream::connect(addr).await);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_reset_peer_restarts() {
        let server = loopback_server();
        let mut events = server.take_event_receiver().unwrap();
        assert_ok!(server.start());

        let peer = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));
        let before = generation(&server);

        // Zero linger turns the close into a reset
        #[allow(deprecated)]
        peer.set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);
        server.send(Bytes::from_static(&[1, 2, 3]));

        loop {
            match next_event(&mut events).await {
                TransportEvent::DataSent { .. } => continue,
                event => {
                    assert_eq!(event, TransportEvent::ClientDisconnected);
                    break;
                }
            }
        }
        wait_until(|| server.is_started()).await;
        assert!(!server.is_client_connected());

        let _again = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));
        assert_quiet(&mut events).await;
        assert_eq!(generation(&server), before + 1);
        assert!(server.is_client_connected());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_restart_request_ignored() {
        let server = loopback_server();
        let mut events = server.take_event_receiver().unwrap();
        assert_ok!(server.start());

        let _first = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));
        let old = generation(&server);

        server.restart_now(old).await;
        assert_eq!(next_event(&mut events).await, TransportEvent::ClientDisconnected);

        let _second = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));

        // Late reports from the first connection's tasks
        server.restart_if_current(old, "Connection closed by peer");
        server.restart_from(old);

        assert_quiet(&mut events).await;
        assert!(server.is_client_connected());
        assert_eq!(generation(&server), old + 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlapping_restarts_collapse() {
        let server = loopback_server();
        let mut events = server.take_event_receiver().unwrap();
        assert_ok!(server.start());

        let _first = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));
        let before = generation(&server);

        server.restart();
        server.restart();
        assert_eq!(next_event(&mut events).await, TransportEvent::ClientDisconnected);
        wait_until(|| server.is_started()).await;

        let _second = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, TransportEvent::ClientConnected { .. }));

        assert_quiet(&mut events).await;
        assert!(server.is_client_connected());
        assert_eq!(generation(&server), before + 1);

        server.shutdown().await;
    }
}
