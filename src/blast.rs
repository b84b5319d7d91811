//! Blast tracker: one packet per datagram, transmitted repeatedly until an
//! application-level ACK arrives, with heartbeats gating retention and a
//! receive-side duplicate-suppression window.

use crate::config::{HEARTBEAT_DEADLINE, HEARTBEAT_PERIOD, TIME_UNTIL_SENDING_AGAIN_BLAST};
use crate::logger;
use crate::separator::{BlastAck, BlastHeader, BLAST_HEADER_SIZE};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlastWireError {
    #[error("blast packet too short for its header")]
    Truncated,
    #[error("unknown blast packet type")]
    UnknownType,
    #[error("blast header claims {claimed} payload bytes, datagram carries {carried}")]
    LengthMismatch { claimed: usize, carried: usize },
    #[error("blast heartbeat with a nonzero length")]
    BadHeartbeat,
}

/// What the scheduler must do with an inbound blast datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum BlastInbound {
    /// First sight (or the suppression window elapsed): write the payload
    /// to the inner interface, then send `ack`.
    Deliver { ack: [u8; BLAST_HEADER_SIZE] },
    /// A copy seen recently: do not re-deliver, but still send `ack`.
    Suppressed { ack: [u8; BLAST_HEADER_SIZE] },
    /// An ACK from the peer; `removed` is false for duplicate ACKs.
    AckHandled { removed: bool },
    /// A heartbeat; peer liveness refreshed.
    Heartbeat,
}

struct Unconfirmed {
    header: BlastHeader,
    payload: Vec<u8>,
    /// Timestamp of the most recent copy sent.
    sent_at: u64,
}

/// Sender and receiver state of the blast flavor. All timestamps are
/// microseconds from the same clock as the event log.
pub struct BlastTracker {
    unconfirmed: FxHashMap<u16, Unconfirmed>,
    /// One slot per possible identifier; 0 means never delivered.
    delivery_stamps: Vec<u64>,
    last_heartbeat_sent: u64,
    /// 0 until the first heartbeat arrives.
    last_heartbeat_received: u64,
}

impl BlastTracker {
    pub fn new() -> Self {
        Self {
            unconfirmed: FxHashMap::default(),
            delivery_stamps: vec![0; usize::from(u16::MAX) + 1],
            last_heartbeat_sent: 0,
            last_heartbeat_received: 0,
        }
    }

    /// Starts the heartbeat clock; called once before the loop runs.
    pub fn start_clock(&mut self, now: u64) {
        self.last_heartbeat_sent = now;
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed.len()
    }

    /// True while heartbeats from the peer are fresh enough to make
    /// retransmission worthwhile.
    pub fn heartbeat_alive(&self, now: u64) -> bool {
        now.saturating_sub(self.last_heartbeat_received) <= HEARTBEAT_DEADLINE
    }

    /// Encodes a new outgoing packet and records it for resending. The
    /// returned flag is false when the peer has been silent past the
    /// heartbeat deadline: the packet still goes out once, but delivery is
    /// hopeless so it is not retained.
    pub fn send_native(
        &mut self,
        identifier: u16,
        protocol: u8,
        payload: &[u8],
        now: u64,
    ) -> (Vec<u8>, bool) {
        let header = BlastHeader {
            packet_size: payload.len() as u16,
            protocol,
            identifier,
            ack: BlastAck::NeedsAck,
        };
        let wire = encode_with_payload(&header, payload);

        let retain = self.heartbeat_alive(now);
        if retain {
            let previous = self.unconfirmed.insert(
                identifier,
                Unconfirmed {
                    header,
                    payload: payload.to_vec(),
                    sent_at: now,
                },
            );
            if previous.is_some() {
                logger::warn(format!(
                    "blast identifier {identifier} reused while still unconfirmed; the older copy is gone"
                ));
            }
        }
        (wire, retain)
    }

    /// Re-encodes every unconfirmed packet whose last copy is older than
    /// `period_us` and refreshes its send timestamp. The caller checks
    /// heartbeat liveness first.
    pub fn collect_resends(&mut self, now: u64, period_us: u64) -> Vec<Vec<u8>> {
        let mut wires = Vec::new();
        for entry in self.unconfirmed.values_mut() {
            if entry.sent_at + period_us < now {
                entry.sent_at = now;
                wires.push(encode_with_payload(&entry.header, &entry.payload));
            }
        }
        wires
    }

    pub fn heartbeat_due(&self, now: u64) -> bool {
        now.saturating_sub(self.last_heartbeat_sent) > HEARTBEAT_PERIOD
    }

    pub fn make_heartbeat(&mut self, now: u64) -> [u8; BLAST_HEADER_SIZE] {
        self.last_heartbeat_sent = now;
        BlastHeader {
            packet_size: 0,
            protocol: 0,
            identifier: 0,
            ack: BlastAck::Heartbeat,
        }
        .encode()
    }

    /// Microseconds until the scheduler must wake: the oldest pending
    /// resend or the next heartbeat send, whichever comes first. Resends
    /// are gated on peer liveness, so with no fresh heartbeat only the
    /// heartbeat deadline counts.
    pub fn next_wake_us(&self, now: u64, period_us: u64) -> u64 {
        let resend_deadline = if self.heartbeat_alive(now) {
            self.unconfirmed
                .values()
                .map(|entry| entry.sent_at)
                .min()
                .unwrap_or(now)
                .saturating_add(period_us)
        } else {
            u64::MAX
        };
        let heartbeat_deadline = self.last_heartbeat_sent.saturating_add(HEARTBEAT_PERIOD);
        resend_deadline.min(heartbeat_deadline).saturating_sub(now)
    }

    /// Classifies an inbound blast datagram and updates tracker state.
    pub fn on_wire(
        &mut self,
        datagram: &[u8],
        now: u64,
    ) -> Result<(BlastHeader, BlastInbound), BlastWireError> {
        if datagram.len() < BLAST_HEADER_SIZE {
            return Err(BlastWireError::Truncated);
        }
        let header = BlastHeader::decode(datagram).map_err(|_| BlastWireError::UnknownType)?;
        let carried = datagram.len() - BLAST_HEADER_SIZE;
        if usize::from(header.packet_size) != carried {
            return Err(BlastWireError::LengthMismatch {
                claimed: usize::from(header.packet_size),
                carried,
            });
        }

        let inbound = match header.ack {
            BlastAck::NeedsAck => {
                let ack = BlastHeader {
                    packet_size: 0,
                    protocol: 0,
                    identifier: header.identifier,
                    ack: BlastAck::IsAck,
                }
                .encode();
                let stamp = self.delivery_stamps[usize::from(header.identifier)];
                if stamp == 0 || now.saturating_sub(stamp) >= TIME_UNTIL_SENDING_AGAIN_BLAST {
                    BlastInbound::Deliver { ack }
                } else {
                    BlastInbound::Suppressed { ack }
                }
            }
            BlastAck::IsAck => BlastInbound::AckHandled {
                removed: self.unconfirmed.remove(&header.identifier).is_some(),
            },
            BlastAck::Heartbeat => {
                if header.packet_size != 0 {
                    return Err(BlastWireError::BadHeartbeat);
                }
                self.last_heartbeat_received = now;
                BlastInbound::Heartbeat
            }
        };
        Ok((header, inbound))
    }

    /// Records that a packet with this identifier reached the inner
    /// interface; copies arriving within the suppression window will not
    /// be delivered again.
    pub fn mark_delivered(&mut self, identifier: u16, now: u64) {
        self.delivery_stamps[usize::from(identifier)] = now;
    }
}

impl Default for BlastTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_with_payload(header: &BlastHeader, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(BLAST_HEADER_SIZE + payload.len());
    wire.extend_from_slice(&header.encode());
    wire.extend_from_slice(payload);
    wire
}

#[cfg(test)]
mod tests {
    use super::*;

    // A plausible epoch-microseconds base so saturating arithmetic behaves
    // like it does with the real clock.
    const T0: u64 = 1_700_000_000_000_000;

    fn tracker_with_live_peer(now: u64) -> BlastTracker {
        let mut tracker = BlastTracker::new();
        tracker.start_clock(now);
        let heartbeat = [0, 0, 0, 0, 0, 2];
        tracker.on_wire(&heartbeat, now).unwrap();
        tracker
    }

    #[test]
    fn packet_is_retained_while_peer_is_alive() {
        let mut tracker = tracker_with_live_peer(T0);
        let (wire, retained) = tracker.send_native(7, 4, &[0xAB; 32], T0 + 100);
        assert!(retained);
        assert_eq!(tracker.unconfirmed_len(), 1);
        assert_eq!(wire.len(), BLAST_HEADER_SIZE + 32);
        assert_eq!(&wire[..BLAST_HEADER_SIZE], &[0x00, 0x20, 0x04, 0x00, 0x07, 0x00]);
    }

    #[test]
    fn packet_not_retained_without_recent_heartbeat() {
        let mut tracker = BlastTracker::new();
        tracker.start_clock(T0);
        // No heartbeat ever received: transmitted once, not retained.
        let (wire, retained) = tracker.send_native(1, 4, &[1, 2, 3], T0);
        assert!(!retained);
        assert!(!wire.is_empty());
        assert_eq!(tracker.unconfirmed_len(), 0);

        // Heartbeat too old: same outcome.
        let mut tracker = tracker_with_live_peer(T0);
        let (_, retained) = tracker.send_native(2, 4, &[0; 4], T0 + HEARTBEAT_DEADLINE + 1);
        assert!(!retained);
    }

    #[test]
    fn identifier_collision_replaces_older_entry() {
        let mut tracker = tracker_with_live_peer(T0);
        tracker.send_native(5, 4, &[1; 4], T0 + 10);
        tracker.send_native(5, 4, &[2; 4], T0 + 20);
        assert_eq!(tracker.unconfirmed_len(), 1);
    }

    #[test]
    fn ack_removes_exactly_one_entry() {
        let mut tracker = tracker_with_live_peer(T0);
        tracker.send_native(0x1234, 4, &[9; 16], T0 + 10);
        assert_eq!(tracker.unconfirmed_len(), 1);

        let ack = [0x00, 0x00, 0x00, 0x12, 0x34, 0x01];
        let (_, inbound) = tracker.on_wire(&ack, T0 + 20).unwrap();
        assert_eq!(inbound, BlastInbound::AckHandled { removed: true });
        assert_eq!(tracker.unconfirmed_len(), 0);

        // A duplicate ACK is benign.
        let (_, inbound) = tracker.on_wire(&ack, T0 + 30).unwrap();
        assert_eq!(inbound, BlastInbound::AckHandled { removed: false });
    }

    #[test]
    fn needs_ack_is_delivered_then_suppressed_then_delivered_again() {
        let mut tracker = BlastTracker::new();
        let mut datagram = vec![0x00, 0x04, 0x04, 0x00, 0x2A, 0x00];
        datagram.extend_from_slice(&[0xEE; 4]);

        let (header, inbound) = tracker.on_wire(&datagram, T0).unwrap();
        assert_eq!(header.identifier, 0x2A);
        let expected_ack = [0x00, 0x00, 0x00, 0x00, 0x2A, 0x01];
        assert_eq!(inbound, BlastInbound::Deliver { ack: expected_ack });
        tracker.mark_delivered(header.identifier, T0);

        // A copy inside the window is suppressed but still acknowledged.
        let (_, inbound) = tracker.on_wire(&datagram, T0 + 1_000).unwrap();
        assert_eq!(inbound, BlastInbound::Suppressed { ack: expected_ack });

        // After the window the same identifier delivers again.
        let (_, inbound) = tracker
            .on_wire(&datagram, T0 + TIME_UNTIL_SENDING_AGAIN_BLAST)
            .unwrap();
        assert_eq!(inbound, BlastInbound::Deliver { ack: expected_ack });
    }

    #[test]
    fn resend_sweep_refreshes_timestamps() {
        let period = 100_000;
        let mut tracker = tracker_with_live_peer(T0);
        tracker.send_native(1, 4, &[1; 8], T0);
        tracker.send_native(2, 4, &[2; 8], T0 + 50_000);

        // Only the first packet has aged past the period.
        let resends = tracker.collect_resends(T0 + period + 1, period);
        assert_eq!(resends.len(), 1);
        assert_eq!(resends[0][4], 1); // identifier low byte

        // Swept entries were refreshed: nothing due immediately after.
        assert!(tracker.collect_resends(T0 + period + 2, period).is_empty());
    }

    #[test]
    fn heartbeat_cadence() {
        let mut tracker = BlastTracker::new();
        tracker.start_clock(T0);
        assert!(!tracker.heartbeat_due(T0 + HEARTBEAT_PERIOD));
        assert!(tracker.heartbeat_due(T0 + HEARTBEAT_PERIOD + 1));

        let wire = tracker.make_heartbeat(T0 + HEARTBEAT_PERIOD + 1);
        assert_eq!(wire, [0, 0, 0, 0, 0, 2]);
        assert!(!tracker.heartbeat_due(T0 + HEARTBEAT_PERIOD + 2));
    }

    #[test]
    fn next_wake_tracks_oldest_resend_and_heartbeat() {
        let period = 300_000;
        let mut tracker = tracker_with_live_peer(T0);

        // Nothing unconfirmed: wait one full period from now (shorter than
        // the heartbeat deadline here).
        assert_eq!(tracker.next_wake_us(T0, period), period);

        tracker.send_native(1, 4, &[0; 4], T0);
        assert_eq!(tracker.next_wake_us(T0 + 100_000, period), 200_000);

        // Past both deadlines the wait clamps to zero.
        assert_eq!(tracker.next_wake_us(T0 + 2_000_000, period), 0);
    }

    #[test]
    fn next_wake_ignores_stale_entries_when_peer_is_silent() {
        let period = 300_000;
        let mut tracker = tracker_with_live_peer(T0);
        tracker.send_native(1, 4, &[0; 4], T0);
        tracker.make_heartbeat(T0);

        // Past the heartbeat deadline nothing will be resent, so only the
        // next heartbeat send matters.
        let silent = T0 + HEARTBEAT_DEADLINE + HEARTBEAT_PERIOD + 50_000;
        assert!(!tracker.heartbeat_alive(silent));
        let wake = tracker.next_wake_us(silent, period);
        assert_eq!(wake, 0); // a heartbeat is already overdue

        tracker.make_heartbeat(silent);
        assert_eq!(tracker.next_wake_us(silent, period), HEARTBEAT_PERIOD);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut tracker = BlastTracker::new();
        let mut datagram = vec![0x00, 0x08, 0x04, 0x00, 0x01, 0x00];
        datagram.extend_from_slice(&[0; 4]);
        assert_eq!(
            tracker.on_wire(&datagram, T0),
            Err(BlastWireError::LengthMismatch {
                claimed: 8,
                carried: 4
            })
        );
    }

    #[test]
    fn nonzero_heartbeat_is_rejected() {
        let mut tracker = BlastTracker::new();
        let mut datagram = vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x02];
        datagram.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(tracker.on_wire(&datagram, T0), Err(BlastWireError::BadHeartbeat));
        // The bad heartbeat must not refresh liveness.
        assert!(!tracker.heartbeat_alive(T0));
    }
}
