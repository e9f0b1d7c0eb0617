//! The central state machine: drives the sequencer and sync scanner to
//! carve frame byte-buffers out of the packet stream.
use std::io::Read;

use crate::error::Result;
use crate::frame::{FrameHeaderFormat, HEADER_LEN};
use crate::packet::{PacketFormat, SpacePacket};
use crate::sequencer::{PacketSequencer, SequencerEvent};
use crate::stats::StatsCollector;
use crate::sync::{self, SyncOutcome};

/// Minimum bytes needed at the start of a frame before its declared
/// product length (bytes 4-7) can be read: 4-byte marker + 4-byte length.
const MIN_PROCESSABLE_LEN: usize = 8;

/// Outcome of assembling the next frame.
pub enum AssemblerEvent {
    /// A frame's bytes were fully carved out. `corrupt` is true if a
    /// sequence-count gap was spliced over while filling it.
    Frame {
        bytes: Vec<u8>,
        corrupt: bool,
    },
    EndOfStream,
}

enum FillOutcome {
    Done {
        bytes: Vec<u8>,
        corrupt: bool,
    },
    /// A second marker was found inside a single packet that already held
    /// more than one frame's worth of data. The remainder has been retained
    /// as a partial; the caller should resume at SEEK_MARKER.
    Resync,
    EndOfStream,
}

/// Drives [PacketSequencer] and the [crate::sync] scanner through the
/// SEEK_MARKER / HEADER_SHORT / FILL state machine described in spec §4.5.
pub struct FrameAssembler {
    sequencer: PacketSequencer,
    partial: Option<SpacePacket>,
    packet_format: PacketFormat,
    header_format: FrameHeaderFormat,
}

impl FrameAssembler {
    pub fn new(packet_format: PacketFormat, header_format: FrameHeaderFormat) -> Self {
        Self {
            sequencer: PacketSequencer::new(packet_format),
            partial: None,
            packet_format,
            header_format,
        }
    }

    /// Discards any held partial packet without touching sequencer state.
    /// Called by the depacketizer after discarding a checksum-invalid frame.
    pub fn clear_partial(&mut self) {
        self.partial = None;
    }

    /// Assembles the next frame's raw bytes, or reports end of stream.
    pub fn next_frame<R: Read>(
        &mut self,
        stream: &mut R,
        stats: &mut StatsCollector,
    ) -> Result<AssemblerEvent> {
        loop {
            let Some(start_pkt) = self.seek_marker(stream, stats)? else {
                return Ok(AssemblerEvent::EndOfStream);
            };

            match self.fill(start_pkt, stream, stats)? {
                FillOutcome::Done { bytes, corrupt } => {
                    return Ok(AssemblerEvent::Frame { bytes, corrupt })
                }
                FillOutcome::Resync => continue,
                FillOutcome::EndOfStream => return Ok(AssemblerEvent::EndOfStream),
            }
        }
    }

    /// Pulls the next packet relevant to a marker search: a held partial
    /// first, then the sequencer. A sequence mismatch here always discards
    /// any held partial (it's no longer contiguous) and hands back the
    /// mismatched packet itself as the next thing to search.
    fn pull_for_seek<R: Read>(
        &mut self,
        stream: &mut R,
        stats: &mut StatsCollector,
    ) -> Result<Option<SpacePacket>> {
        match self.sequencer.next(stream, stats)? {
            SequencerEvent::Accepted(packet) => Ok(Some(packet)),
            SequencerEvent::Mismatch { packet, .. } => {
                self.partial = None;
                Ok(Some(packet))
            }
            SequencerEvent::EndOfStream => Ok(None),
        }
    }

    /// SEEK_MARKER: finds the next frame start, returning the packet whose
    /// `data()` begins at the marker (and holds at least [MIN_PROCESSABLE_LEN]
    /// bytes, melding in a following packet if needed, the HEADER_SHORT case).
    fn seek_marker<R: Read>(
        &mut self,
        stream: &mut R,
        stats: &mut StatsCollector,
    ) -> Result<Option<SpacePacket>> {
        let marker = self.header_format.marker();

        loop {
            let mut pkt = None;

            if let Some(partial) = self.partial.take() {
                match sync::scan(&[], partial.data(), marker) {
                    SyncOutcome::Found { index, joined } => {
                        let mut p = partial;
                        p.set_data(&joined[index..]);
                        pkt = Some(p);
                    }
                    SyncOutcome::NotFound { retained_tail } => {
                        self.partial = Some(SpacePacket::make_partial(
                            partial.primary_header,
                            retained_tail,
                            self.packet_format,
                        ));
                    }
                }
            }

            let mut pkt = match pkt {
                Some(pkt) => pkt,
                None => {
                    let Some(mut next) = self.pull_for_seek(stream, stats)? else {
                        return Ok(None);
                    };
                    if let Some(tail) = self.partial.take() {
                        let mut joined = tail.data().to_vec();
                        joined.extend_from_slice(next.data());
                        next.set_data(&joined);
                    }
                    next
                }
            };

            match sync::scan(&[], pkt.data(), marker) {
                SyncOutcome::Found { index, joined } => {
                    pkt.set_data(&joined[index..]);
                    log::debug!("found frame sync marker at data offset {index}");

                    if pkt.data().len() < MIN_PROCESSABLE_LEN {
                        let Some(next) = self.pull_for_seek(stream, stats)? else {
                            return Ok(None);
                        };
                        let mut joined = pkt.data().to_vec();
                        joined.extend_from_slice(next.data());
                        let mut merged = next;
                        merged.set_data(&joined);
                        pkt = merged;
                    }
                    return Ok(Some(pkt));
                }
                SyncOutcome::NotFound { retained_tail } => {
                    self.partial = Some(SpacePacket::make_partial(
                        pkt.primary_header,
                        retained_tail,
                        self.packet_format,
                    ));
                }
            }
        }
    }

    /// HEADER_SHORT + FILL: reads further packets until the declared frame
    /// length is reached, exceeded (carving a new partial from the
    /// remainder), or a sequence gap is spliced over with filler.
    fn fill<R: Read>(
        &mut self,
        start_pkt: SpacePacket,
        stream: &mut R,
        stats: &mut StatsCollector,
    ) -> Result<FillOutcome> {
        let marker = self.header_format.marker();
        let product_length = start_pkt.product_length(marker).unwrap_or(0) as usize;
        let mut expected_frame_len = product_length + HEADER_LEN;
        if self.packet_format == PacketFormat::Wide {
            expected_frame_len = round_up_16(expected_frame_len);
        }
        log::debug!("frame start found, expected length {expected_frame_len}");

        if expected_frame_len < start_pkt.data().len() {
            return self.carve_overshoot_from_single_packet(start_pkt, expected_frame_len, marker);
        }

        let mut current_header = start_pkt.primary_header;
        let mut frame_buf = start_pkt.data().to_vec();
        let mut corrupt = false;

        loop {
            let accumulated = frame_buf.len();
            match accumulated.cmp(&expected_frame_len) {
                std::cmp::Ordering::Equal => {
                    return Ok(FillOutcome::Done {
                        bytes: frame_buf,
                        corrupt,
                    })
                }
                std::cmp::Ordering::Greater => {
                    let remaining = accumulated - expected_frame_len;
                    let split_at = frame_buf.len() - remaining;
                    let tail = frame_buf.split_off(split_at);
                    self.partial = Some(SpacePacket::make_partial(
                        current_header,
                        tail,
                        self.packet_format,
                    ));
                    return Ok(FillOutcome::Done {
                        bytes: frame_buf,
                        corrupt,
                    });
                }
                std::cmp::Ordering::Less => {}
            }

            match self.sequencer.next(stream, stats)? {
                SequencerEvent::Accepted(packet) => {
                    current_header = packet.primary_header;
                    frame_buf.extend_from_slice(packet.data());
                }
                SequencerEvent::Mismatch { packet, expected } => {
                    corrupt = true;
                    let missing = sequence_gap(expected, packet.primary_header.sequence_count);
                    let per_packet_max = self.packet_format.max_payload();
                    log::warn!("splicing {missing} filler window(s) over a sequence gap");
                    for _ in 0..missing {
                        frame_buf.extend(std::iter::repeat(0_u8).take(per_packet_max));
                    }
                    current_header = packet.primary_header;
                    frame_buf.extend_from_slice(packet.data());
                }
                SequencerEvent::EndOfStream => {
                    stats.on_truncated_frame();
                    return Ok(FillOutcome::EndOfStream);
                }
            }
        }
    }

    /// OVERSHOOT_CHECK: the marker-bearing packet already contains more
    /// than one frame's worth of data. Scans the already-in-hand window for
    /// a second marker (an internally inconsistent header if found), then
    /// carves the frame and keeps the tail as a partial.
    fn carve_overshoot_from_single_packet(
        &mut self,
        pkt: SpacePacket,
        expected_frame_len: usize,
        marker: [u8; 4],
    ) -> Result<FillOutcome> {
        let data = pkt.data();
        let window_end = expected_frame_len.min(data.len());
        let window = &data[4.min(data.len())..window_end];
        if window.windows(marker.len()).any(|w| w == marker) {
            log::error!("spurious second marker found inside a single-packet frame; resyncing");
            self.partial = None;
            return Ok(FillOutcome::Resync);
        }

        let tail = data[expected_frame_len..].to_vec();
        let frame_bytes = data[..expected_frame_len].to_vec();
        self.partial = Some(SpacePacket::make_partial(
            pkt.primary_header,
            tail,
            self.packet_format,
        ));
        Ok(FillOutcome::Done {
            bytes: frame_bytes,
            corrupt: false,
        })
    }
}

fn round_up_16(len: usize) -> usize {
    (len + 15) & !15
}

/// Number of packets missing between `expected` and `actual` sequence
/// counts, modulo [crate::packet::SEQ_COUNT_MOD].
fn sequence_gap(expected: u16, actual: u16) -> usize {
    use crate::packet::SEQ_COUNT_MOD;
    (((actual as i32) - (expected as i32)).rem_euclid(SEQ_COUNT_MOD as i32)) as usize
}
