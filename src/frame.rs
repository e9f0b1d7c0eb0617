//! Science-frame header parsing: checksum validation, instrument-mode
//! classification, timing derivation, and canonical naming.
use byteorder::{ByteOrder, LittleEndian};
use lazy_static::lazy_static;
use std::collections::HashMap;

/// Fixed length of every frame header, regardless of format version.
pub const HEADER_LEN: usize = 1280;

const CHECKSUM_WORD_COUNT: usize = 319;
const ROIC_BLOCK_LEN: usize = 66;

lazy_static! {
    /// GPS epoch, used by [NaiveGpsConverter]. Built from fixed y/m/d/h/m/s
    /// components rather than parsed from a string, so there's no runtime
    /// parse failure mode to handle.
    static ref GPS_EPOCH: chrono::DateTime<chrono::Utc> = chrono::NaiveDate::from_ymd_opt(1980, 1, 6)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .expect("1980-01-06T00:00:00 is a valid calendar date and time");
}

/// Selects the frame sync marker and the offsets of the handful of header
/// fields that moved between header format revisions (spec §6's table).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameHeaderFormat {
    V1,
    V15,
}

struct FormatOffsets {
    planned_num_frames: usize,
    os_time_timestamp: usize,
    os_time: usize,
    num_bands: usize,
    coadd_flag_byte: usize,
}

impl FrameHeaderFormat {
    /// The 4-byte sequence that opens a frame of this header format.
    pub fn marker(self) -> [u8; 4] {
        match self {
            FrameHeaderFormat::V1 => [0x81, 0xFF, 0xFF, 0x81],
            FrameHeaderFormat::V15 => [0x82, 0xFF, 0xFF, 0x81],
        }
    }

    fn offsets(self) -> FormatOffsets {
        match self {
            FrameHeaderFormat::V1 => FormatOffsets {
                planned_num_frames: 922,
                os_time_timestamp: 926,
                os_time: 930,
                num_bands: 938,
                coadd_flag_byte: 1010,
            },
            FrameHeaderFormat::V15 => FormatOffsets {
                planned_num_frames: 1002,
                os_time_timestamp: 1012,
                os_time: 1016,
                num_bands: 1024,
                coadd_flag_byte: 1096,
            },
        }
    }
}

lazy_static! {
    /// Closed set of named ROIC register-block templates used to classify
    /// a frame's instrument mode by exact 66-byte equality.
    ///
    /// These are illustrative stand-ins for the instrument's real register
    /// maps, which are proprietary hardware detail outside this pipeline's
    /// scope; the lookup mechanism (hash on the 66-byte key) is what's
    /// load-bearing, not the specific byte patterns.
    static ref INSTRUMENT_MODE_TABLE: HashMap<[u8; ROIC_BLOCK_LEN], &'static str> = {
        let mut table = HashMap::new();
        table.insert([0x01_u8; ROIC_BLOCK_LEN], "science");
        table.insert([0x02_u8; ROIC_BLOCK_LEN], "dark");
        table.insert([0x03_u8; ROIC_BLOCK_LEN], "test_pattern");
        table
    };
}

const UNKNOWN_INSTRUMENT_MODE: &str = "unknown";

/// Delegates GPS-to-UTC conversion (leap-second aware) to an external time
/// library; this pipeline only needs the GPS-nanosecond value, per spec §1's
/// "no GPS-to-UTC leap-second computation" non-goal.
pub trait LeapSecondConverter {
    fn gps_ns_to_utc(&self, gps_ns: u64) -> chrono::DateTime<chrono::Utc>;
}

/// A converter that treats GPS nanoseconds as UTC nanoseconds directly,
/// ignoring the ~18s of accumulated leap seconds. Useful for tests and as a
/// placeholder until a real leap-second table is wired in by the caller.
pub struct NaiveGpsConverter;

impl LeapSecondConverter for NaiveGpsConverter {
    fn gps_ns_to_utc(&self, gps_ns: u64) -> chrono::DateTime<chrono::Utc> {
        *GPS_EPOCH + chrono::Duration::nanoseconds(gps_ns as i64)
    }
}

/// A fully parsed and classified science frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data_size: u32,
    pub frame_count_a: u64,
    pub frame_count_b: u64,
    pub compression_flag: bool,
    pub processed_flag: bool,
    pub dcid: u32,
    pub acquisition_status: u32,
    pub first_frame_flag: bool,
    pub cloudy_flag: bool,
    pub line_timestamp: u32,
    pub line_count: u64,
    pub roic_block: [u8; ROIC_BLOCK_LEN],
    pub frame_count_in_acquisition: u64,
    pub solar_zenith: u32,
    pub planned_num_frames: u32,
    pub os_time_timestamp: u32,
    pub os_time: u64,
    pub num_bands: u16,
    pub coadd_flag: bool,
    pub checksum: u32,
    pub checksum_valid: bool,
    /// Number of header bytes actually present (payload starts right after).
    header_format: FrameHeaderFormat,
}

impl DecodedFrame {
    /// Parses the 1280-byte header of `frame`. The trailing payload
    /// (`data_size` bytes, plus up to 15 filler bytes in the wide packet
    /// format) is not retained here; callers index it directly off the
    /// original frame buffer via [HEADER_LEN].
    pub fn decode(frame: &[u8], header_format: FrameHeaderFormat) -> Self {
        debug_assert!(frame.len() >= HEADER_LEN);
        let offsets = header_format.offsets();

        let data_size = LittleEndian::read_u32(&frame[4..8]);
        let frame_count_a = LittleEndian::read_u64(&frame[8..16]);
        let frame_count_b = LittleEndian::read_u64(&frame[16..24]);
        let flags_byte = frame[24];
        let dcid = LittleEndian::read_u32(&frame[28..32]);
        let acquisition_status = LittleEndian::read_u32(&frame[32..36]);
        let line_timestamp = LittleEndian::read_u32(&frame[36..40]);
        let line_count = LittleEndian::read_u64(&frame[44..52]);

        let mut roic_block = [0_u8; ROIC_BLOCK_LEN];
        roic_block.copy_from_slice(&frame[108..108 + ROIC_BLOCK_LEN]);

        let frame_count_in_acquisition = LittleEndian::read_u64(&frame[810..818]);
        let solar_zenith = LittleEndian::read_u32(&frame[822..826]);

        let planned_num_frames = LittleEndian::read_u32(
            &frame[offsets.planned_num_frames..offsets.planned_num_frames + 4],
        );
        let os_time_timestamp = LittleEndian::read_u32(
            &frame[offsets.os_time_timestamp..offsets.os_time_timestamp + 4],
        );
        let os_time = LittleEndian::read_u64(&frame[offsets.os_time..offsets.os_time + 8]);
        let num_bands = LittleEndian::read_u16(&frame[offsets.num_bands..offsets.num_bands + 2]);
        let coadd_flag = frame[offsets.coadd_flag_byte] & 0x1 != 0;

        let checksum = LittleEndian::read_u32(&frame[1276..1280]);
        let checksum_valid = checksum_of(&frame[..HEADER_LEN]) == 0;

        Self {
            data_size,
            frame_count_a,
            frame_count_b,
            compression_flag: flags_byte & 0x1 != 0,
            processed_flag: flags_byte & 0x4 != 0,
            dcid,
            acquisition_status,
            first_frame_flag: acquisition_status & 0x1 != 0,
            cloudy_flag: acquisition_status & 0x4 != 0,
            line_timestamp,
            line_count,
            roic_block,
            frame_count_in_acquisition,
            solar_zenith,
            planned_num_frames,
            os_time_timestamp,
            os_time,
            num_bands,
            coadd_flag,
            checksum,
            checksum_valid,
            header_format,
        }
    }

    /// Named instrument mode matching this frame's ROIC register block, or
    /// [UNKNOWN_INSTRUMENT_MODE] if no template matches.
    pub fn instrument_mode(&self) -> &'static str {
        INSTRUMENT_MODE_TABLE
            .get(&self.roic_block)
            .copied()
            .unwrap_or(UNKNOWN_INSTRUMENT_MODE)
    }

    /// Frame start time in nanoseconds since the GPS epoch, derived from the
    /// free-running 100kHz line-timestamp counter and an OS clock snapshot
    /// (spec §4.6).
    pub fn start_time_gps_ns(&self) -> u64 {
        start_time_gps_ns(self.line_timestamp, self.os_time_timestamp, self.os_time)
    }

    /// Single-digit acquisition-status classification used in frame names:
    /// 0/1 for nominal data (1 if this is the first frame of the
    /// acquisition), 4/5 for cloudy data, matching the convention the
    /// downstream cube reassembler uses for non-corrupt frames.
    fn status_digit(&self) -> u8 {
        let base = if self.cloudy_flag { 4 } else { 0 };
        base + self.first_frame_flag as u8
    }

    /// Canonical frame name per spec §6.
    pub fn name(&self, converter: &dyn LeapSecondConverter) -> String {
        self.render_name(self.status_digit(), converter)
    }

    /// Corrupt-frame variant: identical to [DecodedFrame::name] but with the
    /// acquisition-status field overridden to the digit `9`.
    pub fn corrupt_name(&self, converter: &dyn LeapSecondConverter) -> String {
        self.render_name(9, converter)
    }

    fn render_name(&self, status_digit: u8, converter: &dyn LeapSecondConverter) -> String {
        let utc = converter.gps_ns_to_utc(self.start_time_gps_ns());
        format!(
            "{:010}_{}_{:05}_{:05}_{}_{}",
            self.dcid,
            utc.format("%Y%m%dt%H%M%S"),
            self.frame_count_in_acquisition,
            self.planned_num_frames,
            status_digit,
            self.processed_flag as u8,
        )
    }

    pub fn header_format(&self) -> FrameHeaderFormat {
        self.header_format
    }
}

/// `(-sum of the header's first 319 little-endian u32 words) mod 2^32`,
/// i.e. the value the header's trailing checksum word should hold. Summing
/// all 320 words (including the checksum itself) of a valid header yields 0.
fn checksum_of(header: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for i in 0..CHECKSUM_WORD_COUNT + 1 {
        sum = sum.wrapping_add(LittleEndian::read_u32(&header[i * 4..i * 4 + 4]));
    }
    sum
}

/// Computes the checksum value that should be written at header bytes
/// 1276-1279 given the first 319 header words.
pub fn compute_checksum(header_without_checksum_word: &[u8]) -> u32 {
    debug_assert_eq!(header_without_checksum_word.len(), CHECKSUM_WORD_COUNT * 4);
    let mut sum: u32 = 0;
    for chunk in header_without_checksum_word.chunks_exact(4) {
        sum = sum.wrapping_add(LittleEndian::read_u32(chunk));
    }
    sum.wrapping_neg()
}

fn start_time_gps_ns(line_timestamp: u32, os_time_timestamp: u32, os_time_ns: u64) -> u64 {
    let effective_lt: u64 = if line_timestamp >= os_time_timestamp {
        u64::from(line_timestamp)
    } else {
        u64::from(line_timestamp) + (1_u64 << 32)
    };
    os_time_ns + (effective_lt - u64::from(os_time_timestamp)) * 10_000
}
