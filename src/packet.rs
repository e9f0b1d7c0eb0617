//! CCSDS space packet definition, reading, and CRC validation.
use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::io::Read;

use crate::error::{DepacketizerError, Result};

/// The zlib/PNG CRC-32 variant (polynomial 0xEDB88320) used to validate packets.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Packet sequence counts increment modulo this value.
pub const SEQ_COUNT_MOD: u16 = 16384;

const PRIMARY_HDR_LEN: usize = 6;
const CRC_LEN: usize = 4;

const NARROW_SEC_HDR_LEN: usize = 11;
const WIDE_SEC_HDR_LEN: usize = 13;

/// Maximum on-wire payload size (data field, excluding the 6-byte primary
/// header) for each packet format variant.
pub const NARROW_MAX_PAYLOAD: usize = 1479;
pub const WIDE_MAX_PAYLOAD: usize = 1477;

/// Selects the secondary-header length and trailing-bytes layout of a packet
/// stream, per the two variants this pipeline is configured to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketFormat {
    /// 11-byte secondary header, CRC immediately follows the payload.
    Narrow,
    /// 13-byte secondary header carrying a real-data-length field; the CRC
    /// is followed by 0 or more garbage bytes padding out the declared
    /// packet length.
    Wide,
}

impl PacketFormat {
    fn sec_hdr_len(self) -> usize {
        match self {
            PacketFormat::Narrow => NARROW_SEC_HDR_LEN,
            PacketFormat::Wide => WIDE_SEC_HDR_LEN,
        }
    }

    /// Maximum payload (post-primary-header) size for this format.
    pub fn max_payload(self) -> usize {
        match self {
            PacketFormat::Narrow => NARROW_MAX_PAYLOAD,
            PacketFormat::Wide => WIDE_MAX_PAYLOAD,
        }
    }
}

/// CCSDS primary header bitfields (133.0-B-2), packed big-endian into 6 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    pub packet_type: u8,
    pub secondary_header_flag: bool,
    pub apid: u16,
    pub sequence_flags: u8,
    pub sequence_count: u16,
    /// Raw on-wire value: actual payload length minus one.
    pub data_length: u16,
}

impl PrimaryHeader {
    pub fn encode(&self) -> [u8; PRIMARY_HDR_LEN] {
        let word0 = (u16::from(self.version) & 0x7) << 13
            | (u16::from(self.packet_type) & 0x1) << 12
            | (self.secondary_header_flag as u16) << 11
            | (self.apid & 0x7FF);
        let word1 = (u16::from(self.sequence_flags) & 0x3) << 14 | (self.sequence_count & 0x3FFF);

        let mut out = [0_u8; PRIMARY_HDR_LEN];
        out[0..2].copy_from_slice(&word0.to_be_bytes());
        out[2..4].copy_from_slice(&word1.to_be_bytes());
        out[4..6].copy_from_slice(&self.data_length.to_be_bytes());
        out
    }

    pub fn decode<R: Read>(buffer: &mut R) -> std::io::Result<Self> {
        let word0 = buffer.read_u16::<BigEndian>()?;
        let word1 = buffer.read_u16::<BigEndian>()?;
        let data_length = buffer.read_u16::<BigEndian>()?;

        Ok(Self {
            version: ((word0 & 0xE000) >> 13) as u8,
            packet_type: ((word0 & 0x1000) >> 12) as u8,
            secondary_header_flag: (word0 & 0x0800) != 0,
            apid: word0 & 0x07FF,
            sequence_flags: ((word1 & 0xC000) >> 14) as u8,
            sequence_count: word1 & 0x3FFF,
            data_length,
        })
    }

    /// `(current + 1) mod 16384`.
    pub fn next_sequence_count(current: u16) -> u16 {
        (current + 1) % SEQ_COUNT_MOD
    }
}

/// A parsed CCSDS space packet, or a synthetic [SpacePacket::make_partial]
/// packet standing in for bytes left over from the previous frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpacePacket {
    pub primary_header: PrimaryHeader,
    /// Everything after the primary header: secondary header, user data,
    /// CRC, and (wide format) trailing garbage.
    pub body: Vec<u8>,
    pub format: PacketFormat,
    /// True for packets synthesized from leftover frame bytes rather than
    /// read directly off the wire.
    pub is_partial: bool,
}

impl SpacePacket {
    /// Reads one packet from `stream`. Returns
    /// [DepacketizerError::EndOfStream] if fewer than 6 header bytes remain.
    pub fn read<R: Read>(stream: &mut R, format: PacketFormat) -> Result<Self> {
        let mut hdr_buf = [0_u8; PRIMARY_HDR_LEN];
        let n = read_up_to(stream, &mut hdr_buf)?;
        if n != PRIMARY_HDR_LEN {
            return Err(DepacketizerError::EndOfStream);
        }

        let primary_header = PrimaryHeader::decode(&mut hdr_buf.as_slice())?;
        let mut body = vec![0_u8; primary_header.data_length as usize + 1];
        stream.read_exact(&mut body)?;

        Ok(Self {
            primary_header,
            body,
            format,
            is_partial: false,
        })
    }

    /// Builds a synthetic packet from leftover frame bytes, keeping the
    /// primary header of the packet the bytes were carved from so the
    /// result still looks like a plausible packet to downstream code. No
    /// correctness claim is made about the preserved header fields.
    pub fn make_partial(
        primary_header: PrimaryHeader,
        data: Vec<u8>,
        format: PacketFormat,
    ) -> Self {
        let sec_hdr = vec![0_u8; format.sec_hdr_len()];
        let crc = vec![0_u8; CRC_LEN];
        let mut body = sec_hdr;
        body.extend(data);
        body.extend(crc);

        Self {
            primary_header,
            body,
            format,
            is_partial: true,
        }
    }

    /// Builds a synthetic zero-filled "garbage" packet of `len` data bytes,
    /// used by the assembler to splice over a detected gap.
    pub fn make_filler(primary_header: PrimaryHeader, len: usize, format: PacketFormat) -> Self {
        Self::make_partial(primary_header, vec![0_u8; len], format)
    }

    pub fn total_size(&self) -> usize {
        PRIMARY_HDR_LEN + self.body.len()
    }

    fn real_data_len(&self) -> usize {
        match self.format {
            PacketFormat::Narrow => self.body.len().saturating_sub(NARROW_SEC_HDR_LEN + CRC_LEN),
            PacketFormat::Wide => {
                if self.body.len() < WIDE_SEC_HDR_LEN + CRC_LEN {
                    0
                } else {
                    u16::from_be_bytes([self.body[10], self.body[11]]) as usize
                }
            }
        }
    }

    /// User data with the secondary header, CRC, optional narrow-format pad
    /// byte, and (wide format) garbage bytes stripped off.
    pub fn data(&self) -> &[u8] {
        let sec_hdr_len = self.format.sec_hdr_len();
        if self.body.len() < sec_hdr_len {
            return &[];
        }
        match self.format {
            PacketFormat::Narrow => {
                let end = self
                    .body
                    .len()
                    .saturating_sub(CRC_LEN + self.pad_len())
                    .max(sec_hdr_len);
                &self.body[sec_hdr_len..end]
            }
            PacketFormat::Wide => {
                let real_len = self.real_data_len();
                let end = (sec_hdr_len + real_len).min(self.body.len());
                &self.body[sec_hdr_len..end]
            }
        }
    }

    /// Replaces the user-data region in place, preserving the secondary
    /// header and CRC bytes around it.
    pub fn set_data(&mut self, data: &[u8]) {
        let sec_hdr_len = self.format.sec_hdr_len();
        let sec_hdr = self.body[..sec_hdr_len.min(self.body.len())].to_vec();
        let crc = if self.body.len() >= CRC_LEN {
            self.body[self.body.len() - CRC_LEN..].to_vec()
        } else {
            vec![0_u8; CRC_LEN]
        };

        let mut body = sec_hdr;
        body.extend_from_slice(data);
        body.extend(crc);
        self.body = body;
    }

    /// Coarse time: seconds since instrument epoch, from the secondary header.
    pub fn coarse_time(&self) -> u32 {
        if self.body.len() >= 4 {
            u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]])
        } else {
            0
        }
    }

    /// Fine time: units of 1/256 s, from the secondary header.
    pub fn fine_time(&self) -> u8 {
        self.body.get(4).copied().unwrap_or(0)
    }

    fn subheader_byte_index(&self) -> usize {
        match self.format {
            PacketFormat::Narrow => 10,
            PacketFormat::Wide => 12,
        }
    }

    pub fn subheader_id(&self) -> u8 {
        self.body
            .get(self.subheader_byte_index())
            .copied()
            .unwrap_or(0)
            & 0x7F
    }

    pub fn pad_byte_flag(&self) -> bool {
        self.body
            .get(self.subheader_byte_index())
            .map(|b| b & 0x80 != 0)
            .unwrap_or(false)
    }

    /// Length of the narrow-format pad byte sitting between the user data
    /// and the CRC, present only when [SpacePacket::pad_byte_flag] is set.
    /// Wide format has no such byte; its length is carried explicitly in
    /// the secondary header instead.
    fn pad_len(&self) -> usize {
        match self.format {
            PacketFormat::Narrow if self.pad_byte_flag() => 1,
            _ => 0,
        }
    }

    /// `(coarse, fine, sequence_count)`, used as a fingerprint to detect
    /// overlap replay and to label missing/invalid packets in stats.
    pub fn fingerprint(&self) -> (u32, u8, u16) {
        (
            self.coarse_time(),
            self.fine_time(),
            self.primary_header.sequence_count,
        )
    }

    /// Whether this packet's stored CRC matches the recomputed one.
    pub fn is_valid(&self) -> bool {
        let Some((region, stored)) = self.crc_region_and_stored() else {
            return false;
        };
        CRC32.checksum(&region) == stored
    }

    fn crc_region_and_stored(&self) -> Option<(Vec<u8>, u32)> {
        let sec_hdr_len = self.format.sec_hdr_len();
        if self.body.len() < sec_hdr_len + CRC_LEN {
            return None;
        }
        let garbage_len = match self.format {
            PacketFormat::Narrow => 0,
            PacketFormat::Wide => self
                .body
                .len()
                .saturating_sub(sec_hdr_len + self.real_data_len() + CRC_LEN),
        };
        let crc_start = self.body.len().saturating_sub(CRC_LEN + garbage_len);
        let crc_end = crc_start + CRC_LEN;
        if crc_end > self.body.len() {
            return None;
        }
        let stored = u32::from_be_bytes(self.body[crc_start..crc_end].try_into().ok()?);

        // The narrow-format pad byte sits between the data and the CRC and
        // isn't part of the checksummed region.
        let hash_end = crc_start.saturating_sub(self.pad_len());
        let mut region = self.primary_header.encode().to_vec();
        region.extend_from_slice(&self.body[..hash_end]);
        Some((region, stored))
    }

    /// True if `data()`'s first 4 bytes equal the frame start marker.
    pub fn is_header_packet(&self, marker: [u8; 4]) -> bool {
        let data = self.data();
        data.len() >= 4 && data[0..4] == marker
    }

    /// The declared science-data product length, little-endian, from bytes
    /// 4-7 of `data()`. Only meaningful when [SpacePacket::is_header_packet] is true.
    pub fn product_length(&self, marker: [u8; 4]) -> Option<u32> {
        if !self.is_header_packet(marker) || self.data().len() < 8 {
            return None;
        }
        Some(u32::from_le_bytes(self.data()[4..8].try_into().ok()?))
    }
}

fn read_up_to<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn primary_header_roundtrip(
        #[values(0, 3, 7)] version: u8,
        #[values(true, false)] secondary_header_flag: bool,
        #[values(0, 1, 2, 3)] sequence_flags: u8,
    ) {
        let expected = PrimaryHeader {
            version,
            packet_type: 0,
            secondary_header_flag,
            apid: 1234,
            sequence_flags,
            sequence_count: 16355,
            data_length: 1478,
        };

        let encoded = expected.encode();
        let recovered = PrimaryHeader::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(expected, recovered);
    }

    #[test]
    fn crc32_reference_value() {
        // "abc" -> 0x352441C2 per the standard IEEE/zlib CRC-32 reference.
        assert_eq!(CRC32.checksum(b"abc"), 0x352441C2);
    }

    fn build_narrow_packet(seq: u16, data: &[u8]) -> Vec<u8> {
        let primary_header = PrimaryHeader {
            version: 0,
            packet_type: 0,
            secondary_header_flag: true,
            apid: 100,
            sequence_flags: 3,
            sequence_count: seq,
            data_length: (NARROW_SEC_HDR_LEN + data.len() + CRC_LEN - 1) as u16,
        };
        let mut sec_hdr = vec![0_u8; NARROW_SEC_HDR_LEN];
        sec_hdr[0..4].copy_from_slice(&1000_u32.to_be_bytes());
        sec_hdr[4] = 5;

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

    #[test]
    fn read_and_validate_narrow_roundtrip() {
        let data = b"hello world, this is science data";
        let wire = build_narrow_packet(42, data);
        let mut cursor = wire.as_slice();

        let packet = SpacePacket::read(&mut cursor, PacketFormat::Narrow).unwrap();
        assert_eq!(packet.total_size(), wire.len());
        assert!(packet.is_valid());
        assert_eq!(packet.data(), data);
        assert_eq!(packet.primary_header.sequence_count, 42);
        assert_eq!(packet.coarse_time(), 1000);
        assert_eq!(packet.fine_time(), 5);
    }

    /// Builds a narrow packet with the pad-byte flag set and an extra pad
    /// byte inserted between the data and the CRC, mirroring what a real
    /// sensor emits to keep the payload word-aligned.
    fn build_narrow_packet_with_pad(seq: u16, data: &[u8]) -> Vec<u8> {
        let primary_header = PrimaryHeader {
            version: 0,
            packet_type: 0,
            secondary_header_flag: true,
            apid: 100,
            sequence_flags: 3,
            sequence_count: seq,
            data_length: (NARROW_SEC_HDR_LEN + data.len() + 1 + CRC_LEN - 1) as u16,
        };
        let mut sec_hdr = vec![0_u8; NARROW_SEC_HDR_LEN];
        sec_hdr[0..4].copy_from_slice(&1000_u32.to_be_bytes());
        sec_hdr[NARROW_SEC_HDR_LEN - 1] = 0x80;

        // The pad byte sits before the CRC on the wire but isn't part of the
        // checksummed region.
        let mut region = primary_header.encode().to_vec();
        region.extend_from_slice(&sec_hdr);
        region.extend_from_slice(data);
        let crc = CRC32.checksum(&region);

        let mut body = sec_hdr;
        body.extend_from_slice(data);
        body.push(0);
        body.extend_from_slice(&crc.to_be_bytes());

        let mut out = primary_header.encode().to_vec();
        out.extend(body);
        out
    }

    #[test]
    fn pad_byte_is_excluded_from_data_and_crc_region() {
        let data = b"science payload needing a pad byte";
        let wire = build_narrow_packet_with_pad(3, data);
        let mut cursor = wire.as_slice();

        let packet = SpacePacket::read(&mut cursor, PacketFormat::Narrow).unwrap();
        assert!(packet.pad_byte_flag());
        assert!(packet.is_valid());
        assert_eq!(packet.data(), data);
    }

    #[test]
    fn invalid_crc_detected() {
        let data = b"science data payload";
        let mut wire = build_narrow_packet(1, data);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        let mut cursor = wire.as_slice();
        let packet = SpacePacket::read(&mut cursor, PacketFormat::Narrow).unwrap();
        assert!(!packet.is_valid());
    }

    #[test]
    fn end_of_stream_on_short_header() {
        let wire = [0_u8; 3];
        let mut cursor = wire.as_slice();
        let err = SpacePacket::read(&mut cursor, PacketFormat::Narrow).unwrap_err();
        assert!(matches!(err, DepacketizerError::EndOfStream));
    }

    #[test]
    fn header_packet_and_product_length() {
        let marker = [0x81, 0xFF, 0xFF, 0x81];
        let mut data = marker.to_vec();
        data.extend_from_slice(&1_280_000_u32.to_le_bytes());
        let wire = build_narrow_packet(0, &data);
        let mut cursor = wire.as_slice();
        let packet = SpacePacket::read(&mut cursor, PacketFormat::Narrow).unwrap();

        assert!(packet.is_header_packet(marker));
        assert_eq!(packet.product_length(marker), Some(1_280_000));
    }

    fn build_wide_packet(seq: u16, data: &[u8], garbage: usize) -> Vec<u8> {
        let total_len = WIDE_SEC_HDR_LEN + data.len() + CRC_LEN + garbage;
        let primary_header = PrimaryHeader {
            version: 0,
            packet_type: 0,
            secondary_header_flag: true,
            apid: 100,
            sequence_flags: 3,
            sequence_count: seq,
            data_length: (total_len - 1) as u16,
        };
        let mut sec_hdr = vec![0_u8; WIDE_SEC_HDR_LEN];
        sec_hdr[0..4].copy_from_slice(&2000_u32.to_be_bytes());
        sec_hdr[4] = 9;
        sec_hdr[10..12].copy_from_slice(&(data.len() as u16).to_be_bytes());

        let mut region = primary_header.encode().to_vec();
        region.extend_from_slice(&sec_hdr);
        region.extend_from_slice(data);
        let crc = CRC32.checksum(&region);

        let mut body = sec_hdr;
        body.extend_from_slice(data);
        body.extend_from_slice(&crc.to_be_bytes());
        body.extend(vec![0xAA_u8; garbage]);

        let mut out = primary_header.encode().to_vec();
        out.extend(body);
        out
    }

    #[test]
    fn wide_format_strips_garbage() {
        let data = b"wide format science payload";
        let wire = build_wide_packet(7, data, 3);
        let mut cursor = wire.as_slice();
        let packet = SpacePacket::read(&mut cursor, PacketFormat::Wide).unwrap();

        assert!(packet.is_valid());
        assert_eq!(packet.data(), data);
    }
}
