//! Reassembles CCSDS space-packet telemetry into EMIT-style science frames:
//! packet CRC validation and sequencing, frame-sync detection, and frame
//! header parsing/checksum validation, exposed as a lazy iterator over a
//! byte stream.
pub mod assembler;
pub mod error;
pub mod frame;
pub mod packet;
pub mod sequencer;
pub mod stats;
pub mod sync;

use std::io::Read;

pub use error::{DepacketizerError, Result};
pub use frame::{DecodedFrame, FrameHeaderFormat, LeapSecondConverter, NaiveGpsConverter};
pub use packet::PacketFormat;
pub use stats::StatsCollector;

use assembler::{AssemblerEvent, FrameAssembler};

/// Selects the on-wire packet and frame header variants a [Depacketizer]
/// expects to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub packet_format: PacketFormat,
    pub frame_header_format: FrameHeaderFormat,
}

/// A fully reassembled science frame: its parsed header plus the raw bytes
/// (header followed by science payload) it was decoded from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: DecodedFrame,
    pub bytes: Vec<u8>,
    /// Set if a sequence-count gap was spliced over with filler while this
    /// frame was assembled. The frame is still emitted; only its header
    /// checksum determines whether it's discarded outright.
    pub corrupt: bool,
}

/// Drives the packet sequencer, frame assembler, and frame decoder over a
/// byte stream, yielding one [Frame] per successfully validated science
/// frame header. A frame whose header checksum fails is discarded and
/// never reaches the caller; the iterator resumes searching for the next
/// frame sync marker in its place.
pub struct Depacketizer<R: Read, C: LeapSecondConverter = NaiveGpsConverter> {
    stream: R,
    assembler: FrameAssembler,
    config: Config,
    converter: C,
    stats: StatsCollector,
}

impl<R: Read> Depacketizer<R, NaiveGpsConverter> {
    pub fn new(stream: R, config: Config) -> Self {
        Self::with_converter(stream, config, NaiveGpsConverter)
    }
}

impl<R: Read, C: LeapSecondConverter> Depacketizer<R, C> {
    pub fn with_converter(stream: R, config: Config, converter: C) -> Self {
        Self {
            stream,
            assembler: FrameAssembler::new(config.packet_format, config.frame_header_format),
            config,
            converter,
            stats: StatsCollector::default(),
        }
    }

    /// Running counts and fingerprints accumulated so far.
    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }
}

impl<R: Read, C: LeapSecondConverter> Iterator for Depacketizer<R, C> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let event = match self.assembler.next_frame(&mut self.stream, &mut self.stats) {
                Ok(event) => event,
                Err(e) => return Some(Err(e)),
            };

            let (bytes, corrupt) = match event {
                AssemblerEvent::Frame { bytes, corrupt } => (bytes, corrupt),
                AssemblerEvent::EndOfStream => return None,
            };

            if bytes.len() < frame::HEADER_LEN {
                log::warn!("discarding truncated frame of {} bytes", bytes.len());
                self.stats.on_truncated_frame();
                continue;
            }

            let header =
                DecodedFrame::decode(&bytes[..frame::HEADER_LEN], self.config.frame_header_format);
            if !header.checksum_valid {
                log::error!("frame header checksum invalid, discarding frame and resyncing");
                self.stats
                    .on_corrupt_frame(header.corrupt_name(&self.converter));
                self.assembler.clear_partial();
                continue;
            }

            if corrupt {
                self.stats
                    .on_corrupt_frame(header.corrupt_name(&self.converter));
            }
            self.stats.on_frame_emitted();

            return Some(Ok(Frame {
                header,
                bytes,
                corrupt,
            }));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crc::{Crc, CRC_32_ISO_HDLC};
    use packet::PrimaryHeader;

    const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

    fn narrow_packet(seq: u16, data: &[u8]) -> Vec<u8> {
        let primary_header = PrimaryHeader {
            version: 0,
            packet_type: 0,
            secondary_header_flag: true,
            apid: 100,
            sequence_flags: 3,
            sequence_count: seq,
            data_length: (11 + data.len() + 4 - 1) as u16,
        };
        let sec_hdr = vec![0_u8; 11];
        let mut region = primary_header.encode().to_vec();
        region.extend_from_slice(&sec_hdr);
        region.extend_from_slice(data);
        let crc = CRC32.checksum(&region);

        let mut body = sec_hdr;
        body.extend_from_slice(data);
        body.extend_from_slice(&crc.to_be_bytes());

        let mut out = primary_header.encode().to_vec();
        out.extend(body);
        out
    }

    fn valid_frame_header(dcid: u32, product_len: u32) -> Vec<u8> {
        let mut h = vec![0_u8; frame::HEADER_LEN];
        h[0..4].copy_from_slice(&FrameHeaderFormat::V1.marker());
        h[4..8].copy_from_slice(&product_len.to_le_bytes());
        h[28..32].copy_from_slice(&dcid.to_le_bytes());
        let checksum = frame::compute_checksum(&h[0..319 * 4]);
        h[1276..1280].copy_from_slice(&checksum.to_le_bytes());
        h
    }

    #[test]
    fn end_to_end_happy_path_yields_one_frame() {
        let product_len = 100_u32;
        let mut frame_bytes = valid_frame_header(42, product_len);
        frame_bytes.extend(vec![0x5A_u8; product_len as usize]);

        let mut stream_bytes = Vec::new();
        for (i, chunk) in frame_bytes.chunks(80).enumerate() {
            stream_bytes.extend(narrow_packet(i as u16, chunk));
        }

        let config = Config {
            packet_format: PacketFormat::Narrow,
            frame_header_format: FrameHeaderFormat::V1,
        };
        let depacketizer = Depacketizer::new(stream_bytes.as_slice(), config);
        let frames: Vec<_> = depacketizer.collect::<Result<Vec<_>>>().unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.dcid, 42);
        assert!(!frames[0].corrupt);
        assert_eq!(frames[0].bytes, frame_bytes);
    }

    #[test]
    fn invalid_checksum_frame_is_dropped() {
        let product_len = 16_u32;
        let mut frame_bytes = valid_frame_header(9, product_len);
        frame_bytes[50] ^= 0xFF;
        frame_bytes.extend(vec![0x01_u8; product_len as usize]);

        let stream_bytes = narrow_packet(0, &frame_bytes);

        let config = Config {
            packet_format: PacketFormat::Narrow,
            frame_header_format: FrameHeaderFormat::V1,
        };
        let depacketizer = Depacketizer::new(stream_bytes.as_slice(), config);
        let frames: Vec<_> = depacketizer.collect::<Result<Vec<_>>>().unwrap();

        assert!(frames.is_empty());
    }
}
