//! Client lifecycle state machine.
//!
//! Drives one client handle from `Inited` through connecting, the session
//! handshake and heartbeats, to disconnect or cleanup. Uses the action
//! pattern: methods take time as input and return [`ConnectionAction`]s for
//! the driver to execute. Timers are not actions; the driver sleeps until
//! [`Connection::next_deadline`] and calls [`Connection::tick`].
//!
//! # State Machine
//!
//! ```text
//!            connect()          handshake ok
//! ┌────────┐ ───────> ┌────────────┐ ─────> ┌───────────┐
//! │ Inited │          │ Connecting │        │ Connected │
//! └────────┘ <─────── └────────────┘ <───── └───────────┘
//!   ^  ^   ConnectFailed    ^   lost + reconnect │    │
//!   │  │                    └────────────────────┘    │ disconnect()
//!   │  │ closed         ┌───────────────┐             │
//!   │  └─────────────── │ Disconnecting │ <───────────┘
//!   │                   └───────────────┘
//!   │ kick / lost without reconnect
//!
//!   any state ── cleanup() ──> CleanedUp (terminal)
//! ```
//!
//! Every transport is opened under a fresh [`AttemptId`]. Transport events
//! carrying an attempt that is no longer current are dropped, so a late
//! `Disconnected` from a torn-down transport can never leak into a newer
//! connection's event sequence.

use std::{collections::VecDeque, fmt, time::Duration};

use pitaya_proto::{
    HandshakeRequest, HandshakeResponse, Kick, Message, MessageKind, Packet, PacketType,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ClientConfig, MAX_TIMEOUT},
    env::Timestamp,
    error::{CancelReason, ConnectionError},
    event::{Event, EventKind},
};

/// Reason reported when the session handshake is rejected.
pub const HANDSHAKE_ERROR: &str = "Handshake Error";

/// Reason reported when the retry limit is reached.
pub const EXCEED_MAX_RETRY: &str = "Exceed Max Retry";

/// Reason reported when the server stops answering heartbeats.
pub const HEARTBEAT_TIMEOUT: &str = "Heartbeat Timeout";

/// Reason reported when transport connect plus handshake take too long.
pub const CONNECT_TIMEOUT: &str = "Connect Timeout";

const RTT_SAMPLES: usize = 3;

/// Client lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Initialized, no connection
    Inited,
    /// Transport connect, handshake or reconnect backoff in progress
    Connecting,
    /// Session established
    Connected,
    /// Caller-initiated close in progress
    Disconnecting,
    /// Handle released; terminal
    CleanedUp,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt-{}", self.0)
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Application data sent in the session handshake
    pub handshake_data: Option<String>,
}

impl Target {
    /// Target without handshake data.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, handshake_data: None }
    }

    /// Attach handshake data.
    #[must_use]
    pub fn with_handshake_data(mut self, data: impl Into<String>) -> Self {
        self.handshake_data = Some(data.into());
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a transport failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Resolve, connect or I/O failure; eligible for retry
    Network,
    /// TLS negotiation or pin validation failure; never retried
    Handshake,
}

/// Transport connect failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    /// Failure class
    pub kind: FailureKind,
    /// Human-readable reason, surfaced in events
    pub reason: String,
}

impl ConnectFailure {
    /// Network-level failure.
    pub fn network(reason: impl Into<String>) -> Self {
        Self { kind: FailureKind::Network, reason: reason.into() }
    }

    /// TLS or pinning failure.
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self { kind: FailureKind::Handshake, reason: reason.into() }
    }
}

/// What the transport reports back to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Transport is up (TLS negotiated and pins validated, if any)
    Connected,
    /// Transport could not be established
    ConnectFailed(ConnectFailure),
    /// Packet received
    Packet(Packet),
    /// Transport closed; always the last event of an attempt
    Disconnected {
        /// Close reason
        reason: String,
    },
}

/// Actions returned by the state machine for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a transport to `target` and report its events under `attempt`
    OpenTransport {
        /// Attempt the transport belongs to
        attempt: AttemptId,
        /// Where to connect
        target: Target,
    },

    /// Write a packet on the transport
    SendPacket {
        /// Transport to write on
        attempt: AttemptId,
        /// Packet to write
        packet: Packet,
        /// Caller token to acknowledge once the write completed
        ack: Option<u32>,
    },

    /// Close the transport
    CloseTransport {
        /// Transport to close
        attempt: AttemptId,
        /// Close reason
        reason: String,
    },

    /// Deliver an event to the registered handlers
    Emit(Event),

    /// Resolve every pending call with a cancellation error
    FailPendingCalls(CancelReason),

    /// Response for a pending request
    Response(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase<I> {
    Idle,
    /// Transport connecting; deadline covers connect and handshake
    Opening { deadline: I },
    /// Handshake sent, awaiting the server response
    Handshaking { deadline: I },
    /// Waiting to retry
    Backoff { until: I },
    Established,
    /// Close requested, awaiting the transport's final event
    Closing { deadline: I },
}

#[derive(Debug, Clone)]
struct Heartbeat<I> {
    interval: Duration,
    last_sent: I,
    last_received: I,
    probe: Option<I>,
}

/// Round-trip estimate over the last few heartbeat samples.
#[derive(Debug, Clone, Default)]
struct RttWindow {
    samples: VecDeque<Duration>,
}

impl RttWindow {
    fn record(&mut self, sample: Duration) {
        if self.samples.len() == RTT_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn estimate(&self) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        match sorted.as_slice() {
            [] => None,
            [only] => Some(*only),
            [a, b, ..] => Some((*a + *b) / 2),
        }
    }
}

/// Client lifecycle state machine.
///
/// Pure state machine: no I/O and no clock. Generic over the instant type so
/// tests can drive it with virtual time.
///
/// # Invariants
///
/// - At most one transport attempt is current at a time
/// - `Connected` is only entered after a successful session handshake
/// - Pending calls are failed on every path out of `Connected`
#[derive(Debug, Clone)]
pub struct Connection<I> {
    state: ClientState,
    phase: Phase<I>,
    config: ClientConfig,
    target: Option<Target>,
    attempt: Option<AttemptId>,
    next_attempt: u64,
    retries: u32,
    heartbeat: Option<Heartbeat<I>>,
    rtt: RttWindow,
}

impl<I: Timestamp> Connection<I> {
    /// Create a state machine in [`ClientState::Inited`].
    pub fn new(config: ClientConfig) -> Self {
        Self {
            state: ClientState::Inited,
            phase: Phase::Idle,
            config,
            target: None,
            attempt: None,
            next_attempt: 1,
            retries: 0,
            heartbeat: None,
            rtt: RttWindow::default(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Configuration the machine was created with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current transport attempt, if one is open or opening.
    #[must_use]
    pub fn attempt(&self) -> Option<AttemptId> {
        self.attempt
    }

    /// Retries performed for the current connect sequence.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Heartbeat interval negotiated by the server, while connected.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat.as_ref().map(|h| h.interval)
    }

    /// Round-trip estimate from recent heartbeats.
    ///
    /// Mean of the two lowest of the last three samples; fewer samples are
    /// averaged as available.
    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.estimate()
    }

    /// Start connecting to `target`.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not in `Inited`
    pub fn connect(
        &mut self,
        target: Target,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.require(ClientState::Inited, "connect")?;

        info!(%target, "connecting");
        self.state = ClientState::Connecting;
        self.retries = 0;
        self.target = Some(target);

        Ok(self.open_transport(now))
    }

    /// Caller-initiated disconnect.
    ///
    /// From `Connected` the transport is closed and `Disconnect` is emitted
    /// once it reports closed. From `Connecting` this is only allowed while
    /// reconnect is enabled, and cancels the connect sequence.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` from any other state, or from
    ///   `Connecting` with reconnect disabled
    pub fn disconnect(&mut self, now: I) -> Result<Vec<ConnectionAction>, ConnectionError> {
        match self.state {
            ClientState::Connected => {},
            ClientState::Connecting if self.config.enable_reconnect => {},
            state => return Err(ConnectionError::InvalidState { state, operation: "disconnect" }),
        }

        info!(state = %self.state, "disconnecting");
        self.heartbeat = None;
        let mut actions = vec![ConnectionAction::FailPendingCalls(CancelReason::Disconnected)];

        match self.attempt {
            Some(attempt) => {
                self.state = ClientState::Disconnecting;
                self.phase = Phase::Closing { deadline: now + self.connect_timeout() };
                actions.push(ConnectionAction::CloseTransport {
                    attempt,
                    reason: "disconnect".to_string(),
                });
            },
            None => actions.extend(self.finish_disconnect()),
        }

        Ok(actions)
    }

    /// Release the handle.
    ///
    /// Cancels pending calls and reconnect work and closes the transport.
    /// Emits no events.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if already cleaned up
    pub fn cleanup(&mut self) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state == ClientState::CleanedUp {
            return Err(ConnectionError::InvalidState {
                state: ClientState::CleanedUp,
                operation: "cleanup",
            });
        }

        debug!(state = %self.state, "cleanup");
        let mut actions = vec![ConnectionAction::FailPendingCalls(CancelReason::Cleanup)];
        if let Some(attempt) = self.attempt.take() {
            actions.push(ConnectionAction::CloseTransport { attempt, reason: "cleanup".to_string() });
        }

        self.state = ClientState::CleanedUp;
        self.phase = Phase::Idle;
        self.heartbeat = None;
        self.target = None;

        Ok(actions)
    }

    /// Write an application data packet.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` if not `Connected`
    pub fn send_data(
        &mut self,
        packet: Packet,
        ack: Option<u32>,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.require(ClientState::Connected, "send")?;
        let Some(attempt) = self.attempt else {
            return Err(ConnectionError::InvalidState { state: self.state, operation: "send" });
        };

        Ok(vec![ConnectionAction::SendPacket { attempt, packet, ack }])
    }

    /// Process a transport event.
    ///
    /// Events for an attempt that is not current are ignored.
    pub fn handle_transport(
        &mut self,
        attempt: AttemptId,
        event: TransportEvent,
        now: I,
    ) -> Vec<ConnectionAction> {
        if self.attempt != Some(attempt) {
            debug!(%attempt, ?event, "dropping event from stale transport");
            return Vec::new();
        }

        match (self.state, event) {
            (ClientState::Connecting, TransportEvent::Connected) => {
                self.start_handshake(attempt, now)
            },
            (ClientState::Connecting, TransportEvent::ConnectFailed(failure)) => {
                self.attempt = None;
                self.attempt_failed(failure, now)
            },
            (ClientState::Connecting, TransportEvent::Disconnected { reason }) => {
                self.attempt = None;
                self.attempt_failed(ConnectFailure::network(reason), now)
            },
            (ClientState::Connected, TransportEvent::Disconnected { reason }) => {
                self.attempt = None;
                self.connection_lost(reason, now)
            },
            (
                ClientState::Disconnecting,
                TransportEvent::Disconnected { .. } | TransportEvent::ConnectFailed(_),
            ) => {
                self.attempt = None;
                self.finish_disconnect()
            },
            (_, TransportEvent::Packet(packet)) => self.handle_packet(attempt, packet, now),
            (state, event) => {
                debug!(%state, ?event, "ignoring transport event");
                Vec::new()
            },
        }
    }

    /// Process timers: connect timeout, reconnect backoff, heartbeats.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        match self.phase {
            Phase::Opening { deadline } | Phase::Handshaking { deadline } if now >= deadline => {
                warn!("connect attempt timed out");
                let mut actions = self.close_current(CONNECT_TIMEOUT);
                actions.extend(self.attempt_failed(ConnectFailure::network(CONNECT_TIMEOUT), now));
                actions
            },
            Phase::Backoff { until } if now >= until => {
                debug!(retry = self.retries, "reconnecting");
                self.open_transport(now)
            },
            Phase::Closing { deadline } if now >= deadline => {
                warn!("transport did not confirm close");
                self.attempt = None;
                self.finish_disconnect()
            },
            Phase::Established => self.tick_heartbeat(now),
            _ => Vec::new(),
        }
    }

    /// Earliest instant at which [`Connection::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<I> {
        match self.phase {
            Phase::Idle => None,
            Phase::Opening { deadline }
            | Phase::Handshaking { deadline }
            | Phase::Closing { deadline } => Some(deadline),
            Phase::Backoff { until } => Some(until),
            Phase::Established => self.heartbeat.as_ref().map(|hb| {
                let send_at = hb.last_sent + hb.interval;
                let expire_at = hb.last_received + self.heartbeat_timeout(hb.interval);
                send_at.min(expire_at)
            }),
        }
    }

    fn require(&self, expected: ClientState, operation: &'static str) -> Result<(), ConnectionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConnectionError::InvalidState { state: self.state, operation })
        }
    }

    fn heartbeat_timeout(&self, interval: Duration) -> Duration {
        interval.saturating_mul(self.config.heartbeat_timeout_factor).min(MAX_TIMEOUT)
    }

    fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout.min(MAX_TIMEOUT)
    }

    fn open_transport(&mut self, now: I) -> Vec<ConnectionAction> {
        let Some(target) = self.target.clone() else {
            return self.give_up("no target");
        };

        let attempt = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        self.attempt = Some(attempt);
        self.phase = Phase::Opening { deadline: now + self.connect_timeout() };

        debug!(%attempt, %target, "opening transport");
        vec![ConnectionAction::OpenTransport { attempt, target }]
    }

    fn start_handshake(&mut self, attempt: AttemptId, now: I) -> Vec<ConnectionAction> {
        let deadline = match self.phase {
            Phase::Opening { deadline } => deadline,
            _ => now + self.connect_timeout(),
        };

        let user_data = self.target.as_ref().and_then(|t| t.handshake_data.clone());
        match HandshakeRequest::new(user_data).into_packet() {
            Ok(packet) => {
                debug!(%attempt, "transport up, sending handshake");
                self.phase = Phase::Handshaking { deadline };
                vec![ConnectionAction::SendPacket { attempt, packet, ack: None }]
            },
            Err(error) => {
                warn!(%error, "failed to encode handshake");
                self.reject_handshake()
            },
        }
    }

    fn handle_packet(&mut self, attempt: AttemptId, packet: Packet, now: I) -> Vec<ConnectionAction> {
        if let Some(hb) = self.heartbeat.as_mut() {
            hb.last_received = now;
        }

        match (self.phase, packet.kind) {
            (Phase::Handshaking { .. }, PacketType::Handshake) => {
                self.complete_handshake(attempt, &packet, now)
            },
            (Phase::Handshaking { .. } | Phase::Established, PacketType::Kick) => {
                self.kicked(&packet)
            },
            (Phase::Established, PacketType::Heartbeat) => {
                if let Some(sent) = self.heartbeat.as_mut().and_then(|hb| hb.probe.take()) {
                    self.rtt.record(now - sent);
                }
                Vec::new()
            },
            (Phase::Established, PacketType::Data) => self.handle_message(&packet),
            (phase, kind) => {
                debug!(?phase, ?kind, "ignoring packet");
                Vec::new()
            },
        }
    }

    fn complete_handshake(
        &mut self,
        attempt: AttemptId,
        packet: &Packet,
        now: I,
    ) -> Vec<ConnectionAction> {
        let response = match HandshakeResponse::from_packet(packet) {
            Ok(response) if response.is_ok() => response,
            Ok(response) => {
                warn!(code = response.code, "server rejected handshake");
                return self.reject_handshake();
            },
            Err(error) => {
                warn!(%error, "malformed handshake response");
                return self.reject_handshake();
            },
        };

        self.state = ClientState::Connected;
        self.phase = Phase::Established;
        self.retries = 0;
        self.heartbeat = response.heartbeat_interval().map(|interval| Heartbeat {
            interval: interval.min(MAX_TIMEOUT),
            last_sent: now,
            last_received: now,
            probe: None,
        });

        info!(heartbeat = ?self.heartbeat_interval(), "connected");
        vec![
            ConnectionAction::SendPacket {
                attempt,
                packet: Packet::empty(PacketType::HandshakeAck),
                ack: None,
            },
            ConnectionAction::Emit(Event::new(EventKind::Connected)),
        ]
    }

    fn handle_message(&mut self, packet: &Packet) -> Vec<ConnectionAction> {
        let message = match Message::from_packet(packet) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping malformed message");
                return Vec::new();
            },
        };

        match message.kind {
            MessageKind::Response => vec![ConnectionAction::Response(message)],
            MessageKind::Push => {
                let route = message.route.unwrap_or_default();
                vec![ConnectionAction::Emit(Event::push(route, &message.body))]
            },
            kind => {
                debug!(?kind, "ignoring client-bound message of unexpected kind");
                Vec::new()
            },
        }
    }

    fn kicked(&mut self, packet: &Packet) -> Vec<ConnectionAction> {
        let reason = match Kick::from_packet(packet) {
            Ok(kick) => kick.reason,
            Err(error) => {
                warn!(%error, "malformed kick");
                String::new()
            },
        };

        info!(%reason, "kicked by server");
        let mut actions = self.close_current("kicked");
        actions.push(ConnectionAction::FailPendingCalls(CancelReason::ConnectionLost));
        actions.push(ConnectionAction::Emit(Event::with_reason(EventKind::KickedByServer, reason)));

        self.state = ClientState::Inited;
        self.phase = Phase::Idle;
        self.heartbeat = None;
        actions
    }

    fn tick_heartbeat(&mut self, now: I) -> Vec<ConnectionAction> {
        let Some(hb) = self.heartbeat.as_ref() else {
            return Vec::new();
        };

        if now - hb.last_received > self.heartbeat_timeout(hb.interval) {
            warn!(interval = ?hb.interval, "heartbeat timeout");
            let mut actions = self.close_current(HEARTBEAT_TIMEOUT);
            actions.extend(self.connection_lost(HEARTBEAT_TIMEOUT.to_string(), now));
            return actions;
        }

        let (Some(attempt), Some(hb)) = (self.attempt, self.heartbeat.as_mut()) else {
            return Vec::new();
        };
        if now < hb.last_sent + hb.interval {
            return Vec::new();
        }

        hb.last_sent = now;
        hb.probe.get_or_insert(now);
        vec![ConnectionAction::SendPacket {
            attempt,
            packet: Packet::empty(PacketType::Heartbeat),
            ack: None,
        }]
    }

    fn close_current(&mut self, reason: &str) -> Vec<ConnectionAction> {
        self.attempt
            .take()
            .map(|attempt| ConnectionAction::CloseTransport { attempt, reason: reason.to_string() })
            .into_iter()
            .collect()
    }

    fn reject_handshake(&mut self) -> Vec<ConnectionAction> {
        let mut actions = self.close_current(HANDSHAKE_ERROR);
        actions.extend(self.give_up(HANDSHAKE_ERROR));
        actions
    }

    fn attempt_failed(&mut self, failure: ConnectFailure, now: I) -> Vec<ConnectionAction> {
        warn!(kind = ?failure.kind, reason = %failure.reason, "connect attempt failed");

        if failure.kind == FailureKind::Handshake || !self.config.enable_reconnect {
            return self.give_up(&failure.reason);
        }

        let mut actions = vec![ConnectionAction::Emit(Event::with_reason(
            EventKind::ConnectError,
            failure.reason,
        ))];
        actions.extend(self.schedule_retry(now));
        actions
    }

    fn connection_lost(&mut self, reason: String, now: I) -> Vec<ConnectionAction> {
        warn!(%reason, "connection lost");
        self.heartbeat = None;

        let mut actions = vec![
            ConnectionAction::FailPendingCalls(CancelReason::ConnectionLost),
            ConnectionAction::Emit(Event::with_reason(EventKind::UnexpectedDisconnect, reason)),
        ];

        if self.config.enable_reconnect {
            self.state = ClientState::Connecting;
            self.retries = 0;
            actions.extend(self.schedule_retry(now));
        } else {
            self.state = ClientState::Inited;
            self.phase = Phase::Idle;
        }

        actions
    }

    fn schedule_retry(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.config.reconnect_max_retries.exhausted(self.retries) {
            return self.give_up(EXCEED_MAX_RETRY);
        }

        self.retries += 1;
        let delay = self.config.reconnect_delay_for(self.retries).min(MAX_TIMEOUT);
        self.state = ClientState::Connecting;
        self.phase = Phase::Backoff { until: now + delay };

        debug!(retry = self.retries, ?delay, "reconnect scheduled");
        vec![ConnectionAction::Emit(Event::new(EventKind::ReconnectStarted))]
    }

    fn give_up(&mut self, reason: &str) -> Vec<ConnectionAction> {
        self.state = ClientState::Inited;
        self.phase = Phase::Idle;
        self.heartbeat = None;

        vec![ConnectionAction::Emit(Event::with_reason(EventKind::ConnectFailed, reason))]
    }

    fn finish_disconnect(&mut self) -> Vec<ConnectionAction> {
        info!("disconnected");
        self.state = ClientState::Inited;
        self.phase = Phase::Idle;
        self.heartbeat = None;

        vec![ConnectionAction::Emit(Event::new(EventKind::Disconnect))]
    }
}
