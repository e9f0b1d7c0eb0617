//! Packet-sequence-count ordering: gap and overlap detection.
use std::collections::{HashSet, VecDeque};
use std::io::Read;

use crate::error::Result;
use crate::packet::{PacketFormat, PrimaryHeader, SpacePacket};
use crate::stats::StatsCollector;

/// Packets older than this many accepted fingerprints are pruned from the
/// overlap-detection seen-set (see spec §5's bounded-window guidance).
const SEEN_SET_WINDOW: usize = 4096;

/// Outcome of pulling the next packet through the sequencer.
pub enum SequencerEvent {
    /// A packet arrived with the expected sequence count.
    Accepted(SpacePacket),
    /// A packet arrived whose sequence count was neither the expected value
    /// nor a previously-seen duplicate. The sequencer's state has already
    /// been advanced to this packet; the caller must discard any partial
    /// packet it was holding, since it is no longer contiguous with the
    /// stream.
    Mismatch { packet: SpacePacket, expected: u16 },
    /// The underlying stream is exhausted.
    EndOfStream,
}

/// Per-stream ordering state: last accepted sequence count and a bounded
/// seen-set used to recognize overlap replay.
struct SequenceState {
    last_accepted_seq: Option<u16>,
    seen: HashSet<(u32, u8, u16)>,
    seen_order: VecDeque<(u32, u8, u16)>,
}

impl SequenceState {
    fn new() -> Self {
        Self {
            last_accepted_seq: None,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    fn remember(&mut self, fingerprint: (u32, u8, u16)) {
        if self.seen.insert(fingerprint) {
            self.seen_order.push_back(fingerprint);
            if self.seen_order.len() > SEEN_SET_WINDOW {
                if let Some(oldest) = self.seen_order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
    }
}

/// Enforces monotonic packet-sequence-count ordering modulo 16384 over the
/// stream of valid packets the reader produces.
pub struct PacketSequencer {
    state: SequenceState,
    format: PacketFormat,
}

impl PacketSequencer {
    pub fn new(format: PacketFormat) -> Self {
        Self {
            state: SequenceState::new(),
            format,
        }
    }

    /// Pulls the next accepted (or mismatched) packet from `stream`,
    /// transparently skipping invalid and overlap-replayed packets.
    pub fn next<R: Read>(
        &mut self,
        stream: &mut R,
        stats: &mut StatsCollector,
    ) -> Result<SequencerEvent> {
        loop {
            let packet = match SpacePacket::read(stream, self.format) {
                Ok(packet) => packet,
                Err(crate::error::DepacketizerError::EndOfStream) => {
                    return Ok(SequencerEvent::EndOfStream)
                }
                Err(e) => return Err(e),
            };
            stats.on_packet_read(&packet);

            if !packet.is_valid() {
                log::warn!(
                    "skipping invalid packet seq={} apid={}",
                    packet.primary_header.sequence_count,
                    packet.primary_header.apid
                );
                stats.on_invalid_packet(&packet);
                continue;
            }

            let fingerprint = packet.fingerprint();

            let Some(last_seq) = self.state.last_accepted_seq else {
                self.accept(&packet, fingerprint);
                return Ok(SequencerEvent::Accepted(packet));
            };

            let expected = PrimaryHeader::next_sequence_count(last_seq);
            if packet.primary_header.sequence_count == expected {
                self.accept(&packet, fingerprint);
                return Ok(SequencerEvent::Accepted(packet));
            }

            if self.state.seen.contains(&fingerprint) {
                log::warn!(
                    "dropping overlap-replayed packet seq={}",
                    packet.primary_header.sequence_count
                );
                continue;
            }

            log::warn!(
                "sequence mismatch: expected {expected}, got {}",
                packet.primary_header.sequence_count
            );
            stats.on_sequence_error(&packet, expected);
            self.accept(&packet, fingerprint);
            return Ok(SequencerEvent::Mismatch { packet, expected });
        }
    }

    fn accept(&mut self, packet: &SpacePacket, fingerprint: (u32, u8, u16)) {
        self.state.last_accepted_seq = Some(packet.primary_header.sequence_count);
        self.state.remember(fingerprint);
    }
}
