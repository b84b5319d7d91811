//! Bundle assembler: accumulates inner packets with precomputed separators
//! and decides when the pending bundle leaves for the network.
//!
//! The assembler is clock-free. Arrivals carry the current timestamp and
//! the time of the last send; the Context owns both. Flushing returns the
//! assembled bundle bytes, it does not touch sockets.

use crate::config::{Flavor, MuxPolicy};
use crate::separator::{self, NormalSeparator, FAST_SEPARATOR_SIZE, SIZE_PROTOCOL_FIELD};
use smallvec::SmallVec;

/// Why a bundle was emitted; recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    PacketLimit,
    SizeThreshold,
    Timeout,
    Period,
    /// The arriving packet would not fit under the MTU, so the stored
    /// packets left first.
    Overflow,
}

impl FlushReason {
    pub fn log_label(self) -> &'static str {
        match self {
            FlushReason::PacketLimit => "numpkt",
            FlushReason::SizeThreshold => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Period => "period",
            FlushReason::Overflow => "MTU",
        }
    }
}

/// An assembled outgoing bundle.
#[derive(Debug)]
pub struct Bundle {
    pub bytes: Vec<u8>,
    pub packet_count: usize,
    pub reason: FlushReason,
}

/// Result of offering one inner packet to the assembler.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// The packet was buffered; nothing is due yet.
    Stored,
    /// One or two bundles became due: an overflow flush of the previously
    /// stored packets, a triggered flush that includes this packet, or
    /// both.
    Flushed(SmallVec<[Bundle; 2]>),
    /// The packet cannot fit in any bundle for this path and was dropped.
    RejectedTooLarge,
}

struct StoredPacket {
    protocol: u8,
    /// Precomputed for the position the packet was stored at. Unused in
    /// the Fast flavor, whose separator is fixed-width.
    separator: NormalSeparator,
    payload: Vec<u8>,
}

/// Accumulates packets for the Normal and Fast flavors.
pub struct BundleAssembler {
    flavor: Flavor,
    policy: MuxPolicy,
    stored: Vec<StoredPacket>,
    /// Separators plus payloads; Protocol fields not included (Normal).
    muxed_size: usize,
}

impl BundleAssembler {
    pub fn new(flavor: Flavor, policy: MuxPolicy) -> Self {
        debug_assert!(flavor != Flavor::Blast);
        Self {
            flavor,
            policy,
            stored: Vec::new(),
            muxed_size: 0,
        }
    }

    pub fn num_stored(&self) -> usize {
        self.stored.len()
    }

    pub fn pending_size(&self) -> usize {
        self.muxed_size
    }

    pub fn policy(&self) -> &MuxPolicy {
        &self.policy
    }

    /// Offers one inner packet. `now_us` is the arrival timestamp and
    /// `last_sent_us` the timestamp of the last flush, both in
    /// microseconds.
    pub fn accept(
        &mut self,
        protocol: u8,
        payload: &[u8],
        now_us: u64,
        last_sent_us: u64,
    ) -> AcceptOutcome {
        if payload.len() > self.policy.size_max {
            return AcceptOutcome::RejectedTooLarge;
        }

        let mut bundles: SmallVec<[Bundle; 2]> = SmallVec::new();

        // If multiplexing this packet would push the bundle past the MTU,
        // the stored packets leave first and this one starts a new bundle.
        if !self.stored.is_empty()
            && self.predicted_size(protocol, payload.len()) > self.policy.size_max
        {
            bundles.push(self.build_bundle(FlushReason::Overflow));
        }

        let first = self.stored.is_empty();
        let sep = separator::encode_normal(payload.len(), first);
        self.muxed_size += payload.len()
            + match self.flavor {
                Flavor::Fast => FAST_SEPARATOR_SIZE,
                _ => sep.len(),
            };
        self.stored.push(StoredPacket {
            protocol,
            separator: sep,
            payload: payload.to_vec(),
        });

        if let Some(reason) = self.fired_trigger(now_us, last_sent_us) {
            bundles.push(self.build_bundle(reason));
        }

        if bundles.is_empty() {
            AcceptOutcome::Stored
        } else {
            AcceptOutcome::Flushed(bundles)
        }
    }

    /// Period expiry: flush whatever is stored, or nothing.
    pub fn flush_period(&mut self) -> Option<Bundle> {
        if self.stored.is_empty() {
            None
        } else {
            Some(self.build_bundle(FlushReason::Period))
        }
    }

    fn fired_trigger(&self, now_us: u64, last_sent_us: u64) -> Option<FlushReason> {
        if self.stored.len() >= self.policy.limit_num_packets {
            return Some(FlushReason::PacketLimit);
        }
        if self.muxed_size >= self.policy.size_threshold {
            return Some(FlushReason::SizeThreshold);
        }
        if now_us.saturating_sub(last_sent_us) >= self.policy.timeout_us {
            return Some(FlushReason::Timeout);
        }
        None
    }

    /// On-wire size of the pending bundle if `new_len` bytes of protocol
    /// `new_protocol` were appended, Protocol fields included.
    fn predicted_size(&self, new_protocol: u8, new_len: usize) -> usize {
        match self.flavor {
            Flavor::Fast => self.muxed_size + FAST_SEPARATOR_SIZE + new_len,
            _ => {
                let new_sep = separator::encode_normal(new_len, self.stored.is_empty());
                let single = self.stored.iter().all(|p| p.protocol == new_protocol);
                let protocol_bytes = if single {
                    SIZE_PROTOCOL_FIELD
                } else {
                    (self.stored.len() + 1) * SIZE_PROTOCOL_FIELD
                };
                self.muxed_size + new_sep.len() + new_len + protocol_bytes
            }
        }
    }

    fn build_bundle(&mut self, reason: FlushReason) -> Bundle {
        let packet_count = self.stored.len();
        let single_protocol = self
            .stored
            .windows(2)
            .all(|pair| pair[0].protocol == pair[1].protocol);
        let mut bytes = Vec::with_capacity(self.muxed_size + packet_count);

        match self.flavor {
            Flavor::Fast => {
                for packet in &self.stored {
                    bytes.extend_from_slice(&separator::encode_fast(
                        packet.payload.len() as u16,
                        packet.protocol,
                    ));
                    bytes.extend_from_slice(&packet.payload);
                }
            }
            _ => {
                for (position, packet) in self.stored.iter().enumerate() {
                    if position == 0 {
                        if single_protocol {
                            bytes.push(packet.separator.first_byte_with_spb());
                            bytes.extend_from_slice(&packet.separator.as_slice()[1..]);
                        } else {
                            bytes.extend_from_slice(packet.separator.as_slice());
                        }
                        // the Protocol field is always present after the
                        // first separator
                        bytes.push(packet.protocol);
                    } else {
                        bytes.extend_from_slice(packet.separator.as_slice());
                        if !single_protocol {
                            bytes.push(packet.protocol);
                        }
                    }
                    bytes.extend_from_slice(&packet.payload);
                }
            }
        }

        self.stored.clear();
        self.muxed_size = 0;
        Bundle {
            bytes,
            packet_count,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAXTIMEOUT;

    fn policy(limit: usize, threshold: usize, timeout: u64, size_max: usize) -> MuxPolicy {
        MuxPolicy {
            limit_num_packets: limit,
            size_threshold: threshold,
            timeout_us: timeout,
            period_us: MAXTIMEOUT,
            size_max,
        }
    }

    fn expect_single_flush(outcome: AcceptOutcome) -> Bundle {
        match outcome {
            AcceptOutcome::Flushed(mut bundles) => {
                assert_eq!(bundles.len(), 1);
                bundles.pop().unwrap()
            }
            other => panic!("expected a flush, got {other:?}"),
        }
    }

    #[test]
    fn default_limit_sends_every_packet_immediately() {
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(1, 1400, MAXTIMEOUT, 1400));
        let bundle = expect_single_flush(assembler.accept(4, &[0xAA; 10], 0, 0));
        assert_eq!(bundle.packet_count, 1);
        assert_eq!(bundle.reason, FlushReason::PacketLimit);
        assert_eq!(assembler.num_stored(), 0);
    }

    #[test]
    fn single_protocol_bundle_layout() {
        // Two packets of protocol 4, lengths 10 and 20: SPB set, one
        // Protocol byte after the first separator.
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(2, 1400, MAXTIMEOUT, 1400));
        assert!(matches!(
            assembler.accept(4, &[0x11; 10], 0, 0),
            AcceptOutcome::Stored
        ));
        let bundle = expect_single_flush(assembler.accept(4, &[0x22; 20], 0, 0));

        let mut expected = vec![0x8A, 0x04];
        expected.extend_from_slice(&[0x11; 10]);
        expected.push(0x14);
        expected.extend_from_slice(&[0x22; 20]);
        assert_eq!(bundle.bytes, expected);
        assert_eq!(bundle.packet_count, 2);
    }

    #[test]
    fn mixed_protocol_bundle_layout() {
        // Protocols 4 and 143, lengths 5 and 300: SPB clear, a Protocol
        // byte after every separator, two-byte separator for the long one.
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(2, 1400, MAXTIMEOUT, 1400));
        assembler.accept(4, &[0x33; 5], 0, 0);
        let bundle = expect_single_flush(assembler.accept(143, &[0x44; 300], 0, 0));

        let mut expected = vec![0x05, 0x04];
        expected.extend_from_slice(&[0x33; 5]);
        expected.extend_from_slice(&[0x82, 0x2C, 0x8F]);
        expected.extend_from_slice(&[0x44; 300]);
        assert_eq!(bundle.bytes, expected);
    }

    #[test]
    fn fast_bundle_layout() {
        let mut assembler = BundleAssembler::new(Flavor::Fast, policy(2, 1400, MAXTIMEOUT, 1400));
        assembler.accept(4, &[0x55; 8], 0, 0);
        let bundle = expect_single_flush(assembler.accept(143, &[0x66; 4], 0, 0));

        let mut expected = vec![0x00, 0x08, 0x04];
        expected.extend_from_slice(&[0x55; 8]);
        expected.extend_from_slice(&[0x00, 0x04, 0x8F]);
        expected.extend_from_slice(&[0x66; 4]);
        assert_eq!(bundle.bytes, expected);
    }

    #[test]
    fn count_trigger_includes_arriving_packet() {
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(3, 1400, MAXTIMEOUT, 1400));
        assert!(matches!(
            assembler.accept(4, &[1; 10], 0, 0),
            AcceptOutcome::Stored
        ));
        assert!(matches!(
            assembler.accept(4, &[2; 10], 0, 0),
            AcceptOutcome::Stored
        ));
        let bundle = expect_single_flush(assembler.accept(4, &[3; 10], 0, 0));
        assert_eq!(bundle.packet_count, 3);
        assert_eq!(bundle.reason, FlushReason::PacketLimit);
    }

    #[test]
    fn timeout_trigger_fires_on_arrival() {
        let timeout = 2_000;
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(10, 1400, timeout, 1400));
        assert!(matches!(
            assembler.accept(4, &[1; 10], 1_000, 0),
            AcceptOutcome::Stored
        ));
        // Arrival after the timeout flushes both packets at once.
        let bundle = expect_single_flush(assembler.accept(4, &[2; 10], 2_500, 0));
        assert_eq!(bundle.packet_count, 2);
        assert_eq!(bundle.reason, FlushReason::Timeout);
    }

    #[test]
    fn size_trigger() {
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(10, 64, MAXTIMEOUT, 1400));
        assert!(matches!(
            assembler.accept(4, &[1; 30], 0, 0),
            AcceptOutcome::Stored
        ));
        let bundle = expect_single_flush(assembler.accept(4, &[2; 40], 0, 0));
        assert_eq!(bundle.packet_count, 2);
        assert_eq!(bundle.reason, FlushReason::SizeThreshold);
    }

    #[test]
    fn period_flush_returns_pending_packets() {
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(10, 1400, MAXTIMEOUT, 1400));
        assert!(assembler.flush_period().is_none());
        assembler.accept(4, &[1; 10], 0, 0);
        assembler.accept(4, &[2; 10], 0, 0);
        let bundle = assembler.flush_period().expect("pending packets");
        assert_eq!(bundle.packet_count, 2);
        assert_eq!(bundle.reason, FlushReason::Period);
        assert!(assembler.flush_period().is_none());
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(10, 200, MAXTIMEOUT, 200));
        assert!(matches!(
            assembler.accept(4, &[0; 201], 0, 0),
            AcceptOutcome::RejectedTooLarge
        ));
        assert_eq!(assembler.num_stored(), 0);
    }

    #[test]
    fn overflow_flushes_stored_packets_first() {
        // 300 bytes of room: a 180-byte packet stays stored, and a second
        // 250-byte packet forces the first one out alone.
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(10, 200, MAXTIMEOUT, 300));
        assert!(matches!(
            assembler.accept(4, &[1; 180], 0, 0),
            AcceptOutcome::Stored
        ));
        let outcome = assembler.accept(4, &[2; 250], 0, 0);
        let bundles = match outcome {
            AcceptOutcome::Flushed(bundles) => bundles,
            other => panic!("expected overflow flush, got {other:?}"),
        };
        // The overflow bundle holds the old packet; the new one tripped the
        // size threshold right after being stored.
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].reason, FlushReason::Overflow);
        assert_eq!(bundles[0].packet_count, 1);
        assert_eq!(bundles[1].packet_count, 1);
        assert_eq!(assembler.num_stored(), 0);
    }

    #[test]
    fn overflow_restarts_first_position_encoding() {
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(10, 250, MAXTIMEOUT, 250));
        assembler.accept(4, &[1; 150], 0, 0);
        let outcome = assembler.accept(4, &[2; 100], 0, 0);
        let bundles = match outcome {
            AcceptOutcome::Flushed(bundles) => bundles,
            other => panic!("expected overflow flush, got {other:?}"),
        };
        assert_eq!(bundles[0].reason, FlushReason::Overflow);
        // The retained packet became position 0 of the next bundle: its
        // separator must use the first-position encoding (two bytes for a
        // 100-byte packet: 100 > 63).
        assert_eq!(assembler.num_stored(), 1);
        let next = assembler.flush_period().unwrap();
        assert_eq!(next.bytes[0], 0x80 | 0x40); // SPB + LXT, high bits of 100 are 0
        assert_eq!(next.bytes[1], 100 & 0x7F);
    }

    #[test]
    fn roundtrip_through_parser() {
        let mut assembler = BundleAssembler::new(Flavor::Normal, policy(3, 1400, MAXTIMEOUT, 1400));
        assembler.accept(4, &[9; 70], 0, 0);
        assembler.accept(142, &[8; 5], 0, 0);
        let bundle = expect_single_flush(assembler.accept(143, &[7; 130], 0, 0));

        let packets = crate::demux::parse_bundle(Flavor::Normal, &bundle.bytes).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0], (4, vec![9; 70]));
        assert_eq!(packets[1], (142, vec![8; 5]));
        assert_eq!(packets[2], (143, vec![7; 130]));
    }

    #[test]
    fn fast_roundtrip_through_parser() {
        let mut assembler = BundleAssembler::new(Flavor::Fast, policy(2, 1400, MAXTIMEOUT, 1400));
        assembler.accept(4, &[1; 700], 0, 0);
        let bundle = expect_single_flush(assembler.accept(143, &[2; 20], 0, 0));

        let packets = crate::demux::parse_bundle(Flavor::Fast, &bundle.bytes).unwrap();
        assert_eq!(packets, vec![(4, vec![1; 700]), (143, vec![2; 20])]);
    }
}
