//! Reliable delivery: sequence numbers, acknowledgements and retries.
//!
//! The engine is a plain state machine with no I/O and no timers of its
//! own. The link actor feeds it sends, inbound ACK/NAK signals and the
//! current time, and writes whatever [`Outbound`] packets it returns.
//!
//! ```text
//!            send                  ack (matching seq)
//!   IDLE ──────────► SENT ──────────────────────────► ACKED ──► next in FIFO
//!                     │  ▲
//!            timeout, │  │ rewrite identical packet
//!       retries left  ▼  │
//!                   RETRYING
//!                     │
//!   timeout, none left└───────────────────────────► FAILED ──► next in FIFO
//! ```
//!
//! At most one ack-required packet is on the line at a time; everything
//! queued behind it waits, including fire-and-forget packets, so the write
//! order always matches the send order.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{PcomError, Result};
use crate::protocol::{wrap, WireMessage, SEQ_MASK, SEQ_MODULUS};

/// Default time to wait for an ACK before retransmitting.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Default number of retransmissions after the first send.
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Successful delivery of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Sequence number the packet was sent with.
    pub sequence: u8,
    /// Transmissions it took, first send included. Wider than the retry
    /// budget so `max_retries = u8::MAX` still counts every send.
    pub attempts: u16,
}

/// Result of one delivery.
pub type DeliveryResult = Result<Receipt>;

/// Sender half of a delivery's result channel.
pub type Completion = oneshot::Sender<DeliveryResult>;

/// Receiver half of a delivery's result channel.
pub type DeliveryReceiver = oneshot::Receiver<DeliveryResult>;

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub ack_timeout: Duration,
    pub max_retries: u8,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// A packet the caller must write to the transport.
#[derive(Debug)]
pub struct Outbound {
    pub sequence: u8,
    pub packet: Bytes,
    /// Present for fire-and-forget packets: resolve it once the write
    /// completes. Ack-required packets are resolved by the engine.
    pub completion: Option<Completion>,
}

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Nothing awaiting an ACK.
    Idle,
    /// A packet is on the line awaiting an ACK.
    Sent {
        sequence: u8,
        retries_remaining: u8,
    },
}

/// A send waiting for its turn.
#[derive(Debug)]
struct Queued {
    sequence: u8,
    packet: Bytes,
    ack_required: bool,
    result: Completion,
}

/// The one outstanding ack-required packet.
#[derive(Debug)]
struct PendingDelivery {
    sequence: u8,
    packet: Bytes,
    retries_remaining: u8,
    attempts: u16,
    deadline: Instant,
    result: Completion,
}

/// Sans-io reliable delivery state machine.
#[derive(Debug)]
pub struct DeliveryEngine {
    config: DeliveryConfig,
    next_sequence: u8,
    queue: VecDeque<Queued>,
    outstanding: Option<PendingDelivery>,
    closed: bool,
}

impl DeliveryEngine {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            next_sequence: 0,
            queue: VecDeque::new(),
            outstanding: None,
            closed: false,
        }
    }

    /// Serialize and queue a wire message.
    ///
    /// The packet requires an ACK when the message's `response_required`
    /// attribute is set. Encoding failures resolve the returned receiver
    /// with the error and consume no sequence number.
    pub fn send(
        &mut self,
        message: &WireMessage,
        now: Instant,
    ) -> (DeliveryReceiver, Vec<Outbound>) {
        match message.encode() {
            Ok(payload) => self.send_payload(&payload, message.attributes.response_required, now),
            Err(e) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(e));
                (rx, Vec::new())
            }
        }
    }

    /// Queue an already serialized payload.
    pub fn send_payload(
        &mut self,
        payload: &[u8],
        ack_required: bool,
        now: Instant,
    ) -> (DeliveryReceiver, Vec<Outbound>) {
        let (tx, rx) = oneshot::channel();
        let outbound = self.enqueue(payload, ack_required, tx, now);
        (rx, outbound)
    }

    /// Queue a payload whose result goes to an existing channel.
    pub fn enqueue(
        &mut self,
        payload: &[u8],
        ack_required: bool,
        result: Completion,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.closed {
            let _ = result.send(Err(PcomError::LinkClosed));
            return Vec::new();
        }

        let sequence = self.next_sequence;
        let packet = match wrap(payload, sequence, ack_required) {
            Ok(packet) => packet,
            Err(e) => {
                let _ = result.send(Err(e));
                return Vec::new();
            }
        };
        self.next_sequence = (sequence + 1) % SEQ_MODULUS;

        debug!(sequence, ack_required, len = packet.len(), "Queued packet");
        self.queue.push_back(Queued {
            sequence,
            packet,
            ack_required,
            result,
        });
        self.pump(now)
    }

    /// Handle an ACK from the peer.
    pub fn on_ack(&mut self, sequence: u8, now: Instant) -> Vec<Outbound> {
        match self.take_matching(sequence) {
            Some(pending) => {
                debug!(sequence, attempts = pending.attempts, "Delivery acknowledged");
                let _ = pending.result.send(Ok(Receipt {
                    sequence,
                    attempts: pending.attempts,
                }));
                self.pump(now)
            }
            None => Vec::new(),
        }
    }

    /// Handle a NAK from the peer. Rejections are final, never retried.
    pub fn on_nak(&mut self, sequence: u8, status: u8, now: Instant) -> Vec<Outbound> {
        match self.take_matching(sequence) {
            Some(pending) => {
                warn!(sequence, status, "Delivery rejected by peer");
                let _ = pending
                    .result
                    .send(Err(PcomError::DeliveryRejected { sequence, status }));
                self.pump(now)
            }
            None => Vec::new(),
        }
    }

    /// Handle timer expiry. A no-op before the deadline.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<Outbound> {
        let Some(pending) = self.outstanding.as_mut() else {
            return Vec::new();
        };
        if now < pending.deadline {
            return Vec::new();
        }

        if pending.retries_remaining > 0 {
            pending.retries_remaining -= 1;
            pending.attempts += 1;
            pending.deadline = now + self.config.ack_timeout;
            warn!(
                sequence = pending.sequence,
                attempt = pending.attempts,
                retries_remaining = pending.retries_remaining,
                "No ACK, retransmitting"
            );
            return vec![Outbound {
                sequence: pending.sequence,
                packet: pending.packet.clone(),
                completion: None,
            }];
        }

        let Some(pending) = self.outstanding.take() else {
            return Vec::new();
        };
        error!(
            sequence = pending.sequence,
            attempts = pending.attempts,
            "Delivery failed, retries exhausted"
        );
        let _ = pending.result.send(Err(PcomError::DeliveryTimeout {
            sequence: pending.sequence,
            attempts: pending.attempts,
        }));
        self.pump(now)
    }

    /// Fail everything outstanding and queued with `LinkClosed` and refuse
    /// further sends.
    pub fn close(&mut self) {
        self.closed = true;
        if let Some(pending) = self.outstanding.take() {
            let _ = pending.result.send(Err(PcomError::LinkClosed));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.result.send(Err(PcomError::LinkClosed));
        }
    }

    /// When the outstanding packet times out, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|p| p.deadline)
    }

    pub fn state(&self) -> DeliveryState {
        match &self.outstanding {
            None => DeliveryState::Idle,
            Some(p) => DeliveryState::Sent {
                sequence: p.sequence,
                retries_remaining: p.retries_remaining,
            },
        }
    }

    /// Restart numbering at 0 for the next packet that is queued.
    pub fn reset_sequence(&mut self) {
        self.next_sequence = 0;
    }

    /// Number of sends waiting behind the outstanding packet.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_matching(&mut self, sequence: u8) -> Option<PendingDelivery> {
        let sequence = sequence & SEQ_MASK;
        match self.outstanding.as_ref().map(|p| p.sequence) {
            Some(expected) if expected == sequence => self.outstanding.take(),
            Some(expected) => {
                warn!(got = sequence, expected, "Ignoring ACK/NAK for other sequence");
                None
            }
            None => {
                debug!(sequence, "Ignoring ACK/NAK with nothing outstanding");
                None
            }
        }
    }

    /// Release queued packets until one needs an ACK.
    fn pump(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        while self.outstanding.is_none() {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            if next.ack_required {
                out.push(Outbound {
                    sequence: next.sequence,
                    packet: next.packet.clone(),
                    completion: None,
                });
                self.outstanding = Some(PendingDelivery {
                    sequence: next.sequence,
                    packet: next.packet,
                    retries_remaining: self.config.max_retries,
                    attempts: 1,
                    deadline: now + self.config.ack_timeout,
                    result: next.result,
                });
            } else {
                out.push(Outbound {
                    sequence: next.sequence,
                    packet: next.packet,
                    completion: Some(next.result),
                });
            }
        }
        out
    }
}

impl Default for DeliveryEngine {
    fn default() -> Self {
        Self::new(DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{unwrap, Packet};

    fn sent_sequence(out: &[Outbound]) -> u8 {
        assert_eq!(out.len(), 1, "expected exactly one packet");
        match unwrap(&out[0].packet).unwrap() {
            Packet::Data { sequence, .. } => sequence,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sequence_wraps_after_sixteen() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();
        let mut sequences = Vec::new();

        for _ in 0..17 {
            let (mut rx, out) = engine.send_payload(b"x", true, now);
            let seq = sent_sequence(&out);
            sequences.push(seq);
            assert!(engine.on_ack(seq, now).is_empty());
            assert_eq!(rx.try_recv().unwrap().unwrap().sequence, seq);
        }

        let expected: Vec<u8> = (0..16).chain(0..1).collect();
        assert_eq!(sequences, expected);
    }

    #[test]
    fn test_retry_budget_then_timeout() {
        let mut engine = DeliveryEngine::default();
        let start = Instant::now();
        let (mut rx, out) = engine.send_payload(b"cmd", true, start);
        let original = out[0].packet.clone();

        let mut transmissions = vec![original.clone()];
        for _ in 0..3 {
            let now = engine.deadline().unwrap();
            let out = engine.on_timeout(now);
            assert_eq!(out.len(), 1);
            transmissions.push(out[0].packet.clone());
        }
        assert_eq!(engine.state(), DeliveryState::Sent { sequence: 0, retries_remaining: 0 });

        let now = engine.deadline().unwrap();
        assert!(engine.on_timeout(now).is_empty());

        assert_eq!(transmissions.len(), 4);
        assert!(transmissions.iter().all(|p| *p == original));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(PcomError::DeliveryTimeout { sequence: 0, attempts: 4 })
        ));
        assert_eq!(engine.state(), DeliveryState::Idle);
    }

    #[test]
    fn test_timeout_before_deadline_is_noop() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();
        let (_rx, _out) = engine.send_payload(b"a", true, now);
        assert!(engine.on_timeout(now + Duration::from_millis(499)).is_empty());
        assert_eq!(engine.state(), DeliveryState::Sent { sequence: 0, retries_remaining: 3 });
    }

    #[test]
    fn test_mismatched_ack_ignored_matching_resolves_once() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();
        let (mut rx, _out) = engine.send_payload(b"a", true, now);

        assert!(engine.on_ack(5, now).is_empty());
        assert!(rx.try_recv().is_err());
        assert!(matches!(engine.state(), DeliveryState::Sent { sequence: 0, .. }));

        engine.on_ack(0, now);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Receipt { sequence: 0, attempts: 1 });

        // A duplicate ACK finds nothing outstanding.
        assert!(engine.on_ack(0, now).is_empty());
        assert_eq!(engine.state(), DeliveryState::Idle);
    }

    #[test]
    fn test_nak_rejects_without_retry() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();
        let (mut rx, _out) = engine.send_payload(b"a", true, now);

        assert!(engine.on_nak(0, 7, now).is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(PcomError::DeliveryRejected { sequence: 0, status: 7 })
        ));
        assert_eq!(engine.deadline(), None);
    }

    #[test]
    fn test_fifo_one_outstanding() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();

        let (_rx1, out1) = engine.send_payload(b"1", true, now);
        let (_rx2, out2) = engine.send_payload(b"2", true, now);
        let (_rx3, out3) = engine.send_payload(b"3", false, now);

        assert_eq!(sent_sequence(&out1), 0);
        assert!(out2.is_empty());
        assert!(out3.is_empty());
        assert_eq!(engine.queued(), 2);

        let released = engine.on_ack(0, now);
        assert_eq!(sent_sequence(&released), 1);

        let released = engine.on_ack(1, now);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].sequence, 2);
        assert!(released[0].completion.is_some());
        assert_eq!(engine.state(), DeliveryState::Idle);
    }

    #[test]
    fn test_fire_and_forget_carries_completion() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();

        let (mut rx, mut out) = engine.send_payload(b"evt", false, now);
        assert_eq!(out.len(), 1);
        assert_eq!(engine.state(), DeliveryState::Idle);

        let completion = out.remove(0).completion.unwrap();
        completion.send(Ok(Receipt { sequence: 0, attempts: 1 })).unwrap();
        assert!(rx.try_recv().unwrap().is_ok());

        // Fire-and-forget packets still consume a sequence number.
        let (_rx, out) = engine.send_payload(b"cmd", true, now);
        assert_eq!(sent_sequence(&out), 1);
    }

    #[test]
    fn test_close_fails_everything() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();

        let (mut rx1, _) = engine.send_payload(b"1", true, now);
        let (mut rx2, _) = engine.send_payload(b"2", true, now);
        engine.close();

        assert!(matches!(rx1.try_recv().unwrap(), Err(PcomError::LinkClosed)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(PcomError::LinkClosed)));
        assert_eq!(engine.deadline(), None);

        let (mut rx3, out) = engine.send_payload(b"3", true, now);
        assert!(out.is_empty());
        assert!(matches!(rx3.try_recv().unwrap(), Err(PcomError::LinkClosed)));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_reset_sequence() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();
        for _ in 0..5 {
            let (_rx, _out) = engine.send_payload(b"e", false, now);
        }
        engine.reset_sequence();
        let (_rx, out) = engine.send_payload(b"e", false, now);
        assert_eq!(out[0].sequence, 0);
    }

    #[test]
    fn test_oversized_payload_fails_without_sequence() {
        let mut engine = DeliveryEngine::default();
        let now = Instant::now();
        let big = vec![0u8; crate::protocol::MAX_PAYLOAD_SIZE + 1];

        let (mut rx, out) = engine.send_payload(&big, true, now);
        assert!(out.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Err(PcomError::Framing(_))));

        let (_rx, out) = engine.send_payload(b"ok", true, now);
        assert_eq!(sent_sequence(&out), 0);
    }

    #[test]
    fn test_send_uses_response_required_attribute() {
        use crate::protocol::{Attributes, MessageType};

        let mut engine = DeliveryEngine::default();
        let now = Instant::now();
        let mut message = WireMessage {
            msg_id: 1,
            from: 0xFC00,
            to: 0x0100,
            response_code: 2,
            msg_status: 0,
            message_type: MessageType::Command,
            attributes: Attributes { high_priority: false, response_required: true },
            format: "B".into(),
            data: vec![crate::codec::Value::UInt(7)],
        };

        let (_rx, out) = engine.send(&message, now);
        assert_eq!(sent_sequence(&out), 0);
        assert!(out[0].completion.is_none());
        assert!(matches!(engine.state(), DeliveryState::Sent { sequence: 0, .. }));

        message.format = "B\0".into();
        let (mut rx, out) = engine.send(&message, now);
        assert!(out.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Err(PcomError::Encoding(_))));
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn test_largest_retry_budget_counts_every_send() {
        let config =
            DeliveryConfig { ack_timeout: Duration::from_millis(10), max_retries: u8::MAX };
        let mut engine = DeliveryEngine::new(config);
        let (mut rx, out) = engine.send_payload(b"a", true, Instant::now());
        assert_eq!(out.len(), 1);

        let mut retransmissions = 0;
        while let Some(deadline) = engine.deadline() {
            retransmissions += engine.on_timeout(deadline).len();
        }

        assert_eq!(retransmissions, usize::from(u8::MAX));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(PcomError::DeliveryTimeout { sequence: 0, attempts: 256 })
        ));
        assert_eq!(engine.state(), DeliveryState::Idle);
    }

    #[test]
    fn test_custom_config() {
        let config = DeliveryConfig { ack_timeout: Duration::from_millis(50), max_retries: 0 };
        let mut engine = DeliveryEngine::new(config);
        let now = Instant::now();
        let (mut rx, _out) = engine.send_payload(b"a", true, now);

        assert_eq!(engine.deadline(), Some(now + Duration::from_millis(50)));
        assert!(engine.on_timeout(now + Duration::from_millis(50)).is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(PcomError::DeliveryTimeout { attempts: 1, .. })
        ));
    }
}
