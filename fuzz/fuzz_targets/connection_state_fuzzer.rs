//! Fuzz target for the connection state machine
//!
//! # Strategy
//!
//! - Caller operations: connect, disconnect, send, cleanup
//! - Transport events for the current attempt and for stale attempts
//! - Arbitrary inbound packets, including garbage bodies
//! - Time advancing in arbitrary steps
//!
//! # Invariants
//!
//! - `Connected` is only entered through a `Connected` event
//! - `CleanedUp` is terminal: nothing but errors afterwards
//! - Attempt ids only grow and packets are only sent on the current attempt

#![no_main]

use std::{
    ops::{Add, Sub},
    time::Duration,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pitaya_core::{
    AttemptId, ClientConfig, ClientState, ConnectFailure, Connection, ConnectionAction, EventKind,
    RetryLimit, Target, TransportEvent,
};
use pitaya_proto::{Packet, PacketType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Tick(Duration);

impl Add<Duration> for Tick {
    type Output = Tick;
    fn add(self, rhs: Duration) -> Tick {
        Tick(self.0 + rhs)
    }
}

impl Sub for Tick {
    type Output = Duration;
    fn sub(self, rhs: Tick) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

#[derive(Debug, Arbitrary)]
enum Op {
    Connect,
    Disconnect,
    Cleanup,
    Send,
    Up { stale: bool },
    Failed { handshake: bool, stale: bool },
    Closed { stale: bool },
    Packet { kind: u8, body: Vec<u8>, stale: bool },
    Advance(u16),
}

#[derive(Debug, Arbitrary)]
struct Input {
    reconnect: bool,
    max_retries: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let config = ClientConfig {
        enable_reconnect: input.reconnect,
        reconnect_max_retries: RetryLimit::Limited(u32::from(input.max_retries % 8)),
        ..ClientConfig::default()
    };
    let mut conn = Connection::new(config);
    let mut now = Tick(Duration::ZERO);
    let mut last_attempt = AttemptId(0);

    for op in input.ops {
        let before = conn.state();
        let target_attempt = |stale: bool, conn: &Connection<Tick>| {
            if stale {
                AttemptId(last_attempt.0.saturating_sub(1))
            } else {
                conn.attempt().unwrap_or(AttemptId(0))
            }
        };

        let actions = match op {
            Op::Connect => conn.connect(Target::new("localhost", 3250), now).unwrap_or_default(),
            Op::Disconnect => conn.disconnect(now).unwrap_or_default(),
            Op::Cleanup => conn.cleanup().unwrap_or_default(),
            Op::Send => conn.send_data(Packet::empty(PacketType::Data), Some(1)).unwrap_or_default(),
            Op::Up { stale } => {
                let attempt = target_attempt(stale, &conn);
                conn.handle_transport(attempt, TransportEvent::Connected, now)
            },
            Op::Failed { handshake, stale } => {
                let attempt = target_attempt(stale, &conn);
                let failure = if handshake {
                    ConnectFailure::handshake("TLS Handshake Error")
                } else {
                    ConnectFailure::network("refused")
                };
                conn.handle_transport(attempt, TransportEvent::ConnectFailed(failure), now)
            },
            Op::Closed { stale } => {
                let attempt = target_attempt(stale, &conn);
                let event = TransportEvent::Disconnected { reason: "eof".into() };
                conn.handle_transport(attempt, event, now)
            },
            Op::Packet { kind, body, stale } => {
                let Some(kind) = PacketType::from_u8(kind % 6) else { continue };
                let attempt = target_attempt(stale, &conn);
                conn.handle_transport(attempt, TransportEvent::Packet(Packet::new(kind, body)), now)
            },
            Op::Advance(ms) => {
                now = now + Duration::from_millis(u64::from(ms));
                conn.tick(now)
            },
        };

        if before == ClientState::CleanedUp {
            assert!(actions.is_empty());
            assert_eq!(conn.state(), ClientState::CleanedUp);
        }

        for action in &actions {
            match action {
                ConnectionAction::OpenTransport { attempt, .. } => {
                    assert!(attempt.0 > last_attempt.0);
                    last_attempt = *attempt;
                },
                ConnectionAction::SendPacket { attempt, .. } => {
                    assert_eq!(Some(*attempt), conn.attempt());
                },
                ConnectionAction::Emit(event) if event.kind == EventKind::Connected => {
                    assert_ne!(before, ClientState::Connected);
                    assert_eq!(conn.state(), ClientState::Connected);
                },
                _ => {},
            }
        }
    }
});
