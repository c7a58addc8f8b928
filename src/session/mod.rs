//! Session module - Protocol semantics on top of the raw byte stream
//!
//! The session consumes transport events, extracts frames, tracks whether the
//! peer completed its handshake and buffers control packets until the
//! application polls them. A fixed-period tick drives three mutually exclusive
//! timers:
//! - discovery broadcast while no peer is connected
//! - handshake timeout while a connected peer has not handshaked
//! - watchdog while a handshaked peer is connected
//!
//! Handshake flag, control switch and queue share one lock; the timer
//! accumulators have their own. The two are never held together and no I/O
//! happens under either.

mod queue;

pub use queue::*;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::network::{PacketTransport, TransportEvent};
use crate::protocol::{
    encode, parse_frames, CodecResult, ControlPacket, HandshakePacket, HostStatus, Packet,
    PacketError, StatusPacket,
};

/// Session timing and feature switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Period of the background tick in milliseconds
    pub tick_ms: u64,
    pub watchdog_enabled: bool,
    pub watchdog_timeout_ms: u64,
    pub handshake_enabled: bool,
    pub handshake_timeout_ms: u64,
    pub broadcast_enabled: bool,
    pub broadcast_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            watchdog_enabled: true,
            watchdog_timeout_ms: 2000,
            handshake_enabled: true,
            handshake_timeout_ms: 5000,
            broadcast_enabled: true,
            broadcast_interval_ms: 1000,
        }
    }
}

/// Timer that ran out during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerExpiry {
    /// Discovery broadcast is due
    Broadcast,
    /// Connected peer did not handshake in time
    HandshakeTimeout,
    /// No data from a handshaked peer in time
    WatchdogTimeout,
}

struct Inbound {
    handshake_received: bool,
    control_enabled: bool,
    queue: ControlQueue,
}

#[derive(Debug, Default)]
struct Timers {
    broadcast_ms: u64,
    handshake_ms: u64,
    watchdog_ms: u64,
}

impl Timers {
    fn advance(
        &mut self,
        config: &SessionConfig,
        dt_ms: u64,
        connected: bool,
        handshaked: bool,
    ) -> Option<TimerExpiry> {
        let mut expiry = None;

        if !connected && config.broadcast_enabled {
            self.broadcast_ms += dt_ms;
            if self.broadcast_ms >= config.broadcast_interval_ms {
                self.broadcast_ms = 0;
                expiry = Some(TimerExpiry::Broadcast);
            }
        } else {
            self.broadcast_ms = 0;
        }

        if connected && !handshaked {
            self.handshake_ms += dt_ms;
            if self.handshake_ms >= config.handshake_timeout_ms {
                self.handshake_ms = 0;
                expiry = Some(TimerExpiry::HandshakeTimeout);
            }
        } else {
            self.handshake_ms = 0;
        }

        if connected && handshaked && config.watchdog_enabled {
            self.watchdog_ms += dt_ms;
            if self.watchdog_ms >= config.watchdog_timeout_ms {
                self.watchdog_ms = 0;
                expiry = Some(TimerExpiry::WatchdogTimeout);
            }
        } else {
            self.watchdog_ms = 0;
        }

        expiry
    }
}

/// Protocol session with a single peer
pub struct Session<T: PacketTransport> {
    config: SessionConfig,
    transport: T,
    inbound: Mutex<Inbound>,
    timers: Mutex<Timers>,
    status: AtomicU8,
}

impl<T: PacketTransport> Session<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        tracing::info!(
            "Session: handshake {}, watchdog {}, broadcast {}",
            if config.handshake_enabled { "enabled" } else { "disabled" },
            if config.watchdog_enabled { "enabled" } else { "disabled" },
            if config.broadcast_enabled { "enabled" } else { "disabled" },
        );

        Self {
            config,
            transport,
            inbound: Mutex::new(Inbound {
                handshake_received: false,
                control_enabled: false,
                queue: ControlQueue::new(),
            }),
            timers: Mutex::new(Timers::default()),
            status: AtomicU8::new(HostStatus::Undefined.to_byte()),
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// React to one transport event
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ClientConnected { addr } => {
                tracing::info!("Peer {} connected", addr);
            }
            TransportEvent::ClientDisconnected => {
                self.inbound.lock().handshake_received = false;
                tracing::info!("Peer disconnected");
            }
            TransportEvent::DataReceived(data) => {
                self.reset_watchdog();
                for payload in parse_frames(&data) {
                    self.handle_payload(&payload);
                }
            }
            TransportEvent::DataSent { len } => {
                tracing::trace!("{} bytes sent", len);
            }
            TransportEvent::BroadcastSent { interface } => {
                tracing::trace!("Broadcast sent via {}", interface);
            }
        }
    }

    /// Classify one validated payload
    pub fn handle_payload(&self, payload: &[u8]) {
        match Packet::parse(payload) {
            Ok(Packet::Handshake(handshake)) => self.record_handshake(handshake.is_valid()),
            Ok(Packet::Control(control)) => self.enqueue_control(control),
            Ok(other) => {
                tracing::warn!("Packet ID {} not accepted from peer", other.id() as u8);
            }
            Err(e @ PacketError::TooShort { kind: "Handshake", .. }) => {
                tracing::warn!("{}", e);
                self.record_handshake(false);
            }
            Err(e) => tracing::warn!("Dropping packet: {}", e),
        }
    }

    fn record_handshake(&self, valid: bool) {
        let previous = {
            let mut inbound = self.inbound.lock();
            std::mem::replace(&mut inbound.handshake_received, valid)
        };

        match (previous, valid) {
            (false, true) => tracing::info!("Handshake complete"),
            (true, false) => tracing::warn!("Invalid handshake, peer no longer trusted"),
            (false, false) => tracing::debug!("Invalid handshake"),
            (true, true) => {}
        }
    }

    fn enqueue_control(&self, packet: ControlPacket) {
        let outcome = {
            let mut inbound = self.inbound.lock();
            if !inbound.control_enabled {
                None
            } else {
                Some(inbound.queue.push(packet))
            }
        };

        match outcome {
            None => tracing::trace!("Control packets disabled, packet dropped"),
            Some(PushOutcome::Queued) => {}
            Some(PushOutcome::Filled) => tracing::warn!("Control packet buffer overflow!"),
            Some(PushOutcome::Dropped) => tracing::debug!("Control packet buffer full, packet dropped"),
        }
    }

    fn reset_watchdog(&self) {
        self.timers.lock().watchdog_ms = 0;
    }

    /// Whether the peer handshaked, or handshaking is disabled
    pub fn handshake_received(&self) -> bool {
        !self.config.handshake_enabled || self.inbound.lock().handshake_received
    }

    /// Connected and handshaked: application data may flow
    pub fn is_ready(&self) -> bool {
        self.transport.is_client_connected() && self.handshake_received()
    }

    /// Advance the timers by `dt_ms` and act on an expiry
    pub fn tick(&self, dt_ms: u64) -> Option<TimerExpiry> {
        let connected = self.transport.is_client_connected();
        let handshaked = self.handshake_received();

        let expiry = self
            .timers
            .lock()
            .advance(&self.config, dt_ms, connected, handshaked);

        match expiry {
            Some(TimerExpiry::Broadcast) => {
                let payload = HandshakePacket::broadcast(self.status()).to_payload();
                if let Some(frame) = self.frame(&payload) {
                    self.transport.send_broadcast(frame);
                }
            }
            Some(TimerExpiry::HandshakeTimeout) => {
                tracing::warn!("Handshake was not successful");
                self.transport.restart();
            }
            Some(TimerExpiry::WatchdogTimeout) => {
                tracing::warn!("Watchdog time exceeded");
                self.transport.restart();
            }
            None => {}
        }

        expiry
    }

    pub fn status(&self) -> HostStatus {
        HostStatus::from_byte(self.status.load(Ordering::SeqCst))
    }

    /// Replace the host status; a changed value is sent to a ready peer
    pub fn update_status(&self, status: HostStatus) {
        let previous = self.status.swap(status.to_byte(), Ordering::SeqCst);
        if previous == status.to_byte() {
            return;
        }

        tracing::debug!("Host status {:?} -> {:?}", HostStatus::from_byte(previous), status);
        match self.send_packet(&StatusPacket::new(status).to_payload()) {
            Ok(true) => tracing::debug!("Status {:?} sent to peer", status),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to send status: {}", e),
        }
    }

    /// Send an application payload to a ready peer. Returns whether it was
    /// handed to the transport.
    pub fn send_packet(&self, payload: &[u8]) -> CodecResult<bool> {
        let frame = encode(payload)?;
        if !self.is_ready() {
            return Ok(false);
        }
        self.transport.send(frame);
        Ok(true)
    }

    /// Newest queued control packet, if any
    pub fn poll_next(&self) -> Option<ControlPacket> {
        self.inbound.lock().queue.pop()
    }

    /// Accept or refuse control packets; refusing drops everything queued
    pub fn set_control_acceptance(&self, enabled: bool) {
        let mut inbound = self.inbound.lock();
        inbound.control_enabled = enabled;
        if !enabled {
            inbound.queue.clear();
        }
    }

    pub fn control_acceptance(&self) -> bool {
        self.inbound.lock().control_enabled
    }

    /// Number of queued control packets
    pub fn queued(&self) -> usize {
        self.inbound.lock().queue.len()
    }

    fn frame(&self, payload: &[u8]) -> Option<Bytes> {
        match encode(payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!("Failed to encode packet: {}", e);
                None
            }
        }
    }
}

impl<T: PacketTransport + 'static> Session<T> {
    /// Start the event consumer and the tick loop
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> [JoinHandle<()>; 2] {
        let session = self.clone();
        let event_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_event(event);
            }
            tracing::debug!("Transport event channel closed");
        });

        let session = self.clone();
        let tick_ms = self.config.tick_ms.max(1);
        let tick_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                session.tick(tick_ms);
            }
        });

        [event_task, tick_task]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Peer, PeerConfig, PeerEvent, TransportConfig, TransportServer};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::time::timeout;

    #[derive(Default)]
    struct MockTransport {
        connected: AtomicBool,
        sent: Mutex<Vec<Bytes>>,
        broadcasts: Mutex<Vec<Bytes>>,
        restarts: AtomicUsize,
    }

    impl MockTransport {
        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn restarts(&self) -> usize {
            self.restarts.load(Ordering::SeqCst)
        }
    }

    impl PacketTransport for MockTransport {
        fn is_client_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send(&self, frame: Bytes) {
            self.sent.lock().push(frame);
        }

        fn send_broadcast(&self, frame: Bytes) {
            self.broadcasts.lock().push(frame);
        }

        fn restart(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(config: SessionConfig) -> Session<MockTransport> {
        Session::new(config, MockTransport::default())
    }

    fn deliver(session: &Session<MockTransport>, payload: &[u8]) {
        let frame = encode(payload).unwrap();
        session.handle_event(TransportEvent::DataReceived(frame));
    }

    fn handshake(session: &Session<MockTransport>) {
        deliver(session, &[0, 3, 1, 4]);
    }

    fn control(throttle: i16) -> Bytes {
        ControlPacket {
            throttle,
            ..Default::default()
        }
        .to_payload()
    }

    #[test]
    fn test_handshake_validity() {
        let session = session(SessionConfig::default());
        assert!(!session.handshake_received());

        handshake(&session);
        assert!(session.handshake_received());

        deliver(&session, &[0, 3, 1, 5]);
        assert!(!session.handshake_received());

        handshake(&session);
        deliver(&session, &[0, 3, 1]);
        assert!(!session.handshake_received());
    }

    #[test]
    fn test_handshake_disabled() {
        let session = session(SessionConfig {
            handshake_enabled: false,
            ..Default::default()
        });
        assert!(session.handshake_received());
    }

    #[test]
    fn test_disconnect_clears_handshake() {
        let session = session(SessionConfig::default());
        handshake(&session);
        session.handle_event(TransportEvent::ClientDisconnected);
        assert!(!session.handshake_received());
    }

    #[test]
    fn test_watchdog_fires_on_hundredth_tick() {
        let session = session(SessionConfig {
            watchdog_timeout_ms: 1000,
            ..Default::default()
        });
        session.transport().set_connected(true);
        handshake(&session);

        for _ in 0..99 {
            assert_eq!(session.tick(10), None);
        }
        assert_eq!(session.transport().restarts(), 0);

        assert_eq!(session.tick(10), Some(TimerExpiry::WatchdogTimeout));
        assert_eq!(session.transport().restarts(), 1);
    }

    #[test]
    fn test_data_resets_watchdog() {
        let session = session(SessionConfig {
            watchdog_timeout_ms: 1000,
            ..Default::default()
        });
        session.transport().set_connected(true);
        handshake(&session);

        for _ in 0..50 {
            session.tick(10);
        }
        // Even a frame that gets dropped counts as traffic
        session.handle_event(TransportEvent::DataReceived(Bytes::from_static(&[0x00])));
        for _ in 0..99 {
            assert_eq!(session.tick(10), None);
        }
        assert_eq!(session.tick(10), Some(TimerExpiry::WatchdogTimeout));
    }

    #[test]
    fn test_watchdog_disabled() {
        let session = session(SessionConfig {
            watchdog_enabled: false,
            ..Default::default()
        });
        session.transport().set_connected(true);
        handshake(&session);

        for _ in 0..1000 {
            assert_eq!(session.tick(10), None);
        }
        assert_eq!(session.transport().restarts(), 0);
    }

    #[test]
    fn test_handshake_timeout() {
        let session = session(SessionConfig {
            handshake_timeout_ms: 500,
            ..Default::default()
        });
        session.transport().set_connected(true);

        for _ in 0..49 {
            assert_eq!(session.tick(10), None);
        }
        assert_eq!(session.tick(10), Some(TimerExpiry::HandshakeTimeout));
        assert_eq!(session.transport().restarts(), 1);
    }

    #[test]
    fn test_handshake_disabled_runs_watchdog() {
        let session = session(SessionConfig {
            handshake_enabled: false,
            handshake_timeout_ms: 100,
            watchdog_timeout_ms: 200,
            ..Default::default()
        });
        session.transport().set_connected(true);

        let expiries: Vec<_> = (0..20).filter_map(|_| session.tick(10)).collect();
        assert_eq!(expiries, vec![TimerExpiry::WatchdogTimeout]);
    }

    #[test]
    fn test_broadcast_while_disconnected() {
        let session = session(SessionConfig {
            broadcast_interval_ms: 1000,
            ..Default::default()
        });
        session.update_status(HostStatus::NotInFlight);

        for _ in 0..99 {
            assert_eq!(session.tick(10), None);
        }
        assert_eq!(session.tick(10), Some(TimerExpiry::Broadcast));

        let broadcasts = session.transport().broadcasts.lock().clone();
        assert_eq!(broadcasts, vec![encode(&[0, 1, 2, 1]).unwrap()]);

        // Connecting stops and resets the broadcast timer
        session.transport().set_connected(true);
        handshake(&session);
        for _ in 0..150 {
            assert_ne!(session.tick(10), Some(TimerExpiry::Broadcast));
        }
    }

    #[test]
    fn test_broadcast_disabled() {
        let session = session(SessionConfig {
            broadcast_enabled: false,
            ..Default::default()
        });
        for _ in 0..500 {
            assert_eq!(session.tick(10), None);
        }
        assert!(session.transport().broadcasts.lock().is_empty());
    }

    #[test]
    fn test_control_queue_overflow() {
        let session = session(SessionConfig::default());
        session.set_control_acceptance(true);

        for i in 0..300 {
            deliver(&session, &control(i));
        }
        assert_eq!(session.queued(), CONTROL_QUEUE_CAPACITY);

        for _ in 0..CONTROL_QUEUE_CAPACITY {
            assert!(session.poll_next().is_some());
        }
        assert!(session.poll_next().is_none());
    }

    #[test]
    fn test_poll_next_is_lifo() {
        let session = session(SessionConfig::default());
        session.set_control_acceptance(true);

        let mut data = encode(&control(1)).unwrap().to_vec();
        data.extend_from_slice(&encode(&control(2)).unwrap());
        session.handle_event(TransportEvent::DataReceived(Bytes::from(data)));

        assert_eq!(session.poll_next().map(|p| p.throttle), Some(2));
        assert_eq!(session.poll_next().map(|p| p.throttle), Some(1));
        assert_eq!(session.poll_next(), None);
    }

    #[test]
    fn test_disabling_control_clears_queue() {
        let session = session(SessionConfig::default());
        assert!(!session.control_acceptance());

        deliver(&session, &control(1));
        assert_eq!(session.queued(), 0);

        session.set_control_acceptance(true);
        deliver(&session, &control(1));
        deliver(&session, &control(2));
        assert_eq!(session.queued(), 2);

        session.set_control_acceptance(false);
        assert!(session.poll_next().is_none());

        session.set_control_acceptance(true);
        assert!(session.poll_next().is_none());
    }

    #[test]
    fn test_unknown_and_short_packets_dropped() {
        let session = session(SessionConfig::default());
        session.set_control_acceptance(true);

        deliver(&session, &[42, 1, 2]);
        deliver(&session, &[101, 0, 0]);
        deliver(&session, &[1, 2]);
        deliver(&session, &[]);
        assert_eq!(session.queued(), 0);
        assert!(!session.handshake_received());
    }

    #[test]
    fn test_update_status_only_sends_changes_when_ready() {
        let session = session(SessionConfig::default());

        session.update_status(HostStatus::NotInFlight);
        assert!(session.transport().sent.lock().is_empty());

        session.transport().set_connected(true);
        handshake(&session);

        session.update_status(HostStatus::NotInFlight);
        assert!(session.transport().sent.lock().is_empty());

        session.update_status(HostStatus::InFlight);
        session.update_status(HostStatus::InFlight);
        let sent = session.transport().sent.lock().clone();
        assert_eq!(sent, vec![encode(&[1, 2]).unwrap()]);
        assert_eq!(session.status(), HostStatus::InFlight);
    }

    #[test]
    fn test_send_packet_gated_on_ready() {
        let session = session(SessionConfig::default());
        assert_eq!(session.send_packet(&[1, 9, 9]), Ok(false));

        session.transport().set_connected(true);
        assert_eq!(session.send_packet(&[1, 9, 9]), Ok(false));

        handshake(&session);
        assert!(session.is_ready());
        assert_eq!(session.send_packet(&[1, 9, 9]), Ok(true));
        assert!(session.send_packet(&[0u8; 300]).is_err());
        assert_eq!(session.transport().sent.lock().len(), 1);
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_peer_end_to_end() {
        let transport_config =
            TransportConfig::new(0).with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let server = TransportServer::new(transport_config).unwrap();
        let events = server.take_event_receiver().unwrap();
        server.start().unwrap();

        let session = Arc::new(Session::new(
            SessionConfig {
                broadcast_enabled: false,
                ..Default::default()
            },
            server.clone(),
        ));
        let tasks = session.spawn(events);
        session.set_control_acceptance(true);

        let mut peer = Peer::new(PeerConfig::default());
        let mut peer_events = peer.take_event_receiver().unwrap();
        peer.connect(server.local_addr().unwrap()).await.unwrap();

        wait_for(|| session.is_ready()).await;

        peer.send_control(&ControlPacket {
            pitch: -250,
            ..Default::default()
        })
        .await
        .unwrap();
        wait_for(|| session.queued() > 0).await;
        assert_eq!(session.poll_next().map(|p| p.pitch), Some(-250));

        session.update_status(HostStatus::InFlight);
        let status = timeout(Duration::from_secs(5), async {
            loop {
                match peer_events.recv().await {
                    Some(PeerEvent::StatusReceived(status)) => break Some(status),
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(status, Some(HostStatus::InFlight));

        peer.disconnect().await.unwrap();
        wait_for(|| !session.handshake_received()).await;

        for task in tasks {
            task.abort();
        }
        server.shutdown().await;
    }
}
