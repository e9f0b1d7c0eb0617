//! Running counters and human-readable reporting for a depacketizer run.
use std::collections::BTreeSet;
use std::fmt;

use crate::packet::{PrimaryHeader, SpacePacket, SEQ_COUNT_MOD};

/// Aggregates counts and fingerprints of interesting events encountered
/// while depacketizing a stream, and renders them as the plain-text
/// "SDP PROCESSING STATS" report.
#[derive(Debug, Default)]
pub struct StatsCollector {
    pub ccsds_pkts_read: u64,
    pub bytes_read: u64,
    pub frames_read: u64,
    pub truncated_frame_errors: u64,
    pub invalid_pkt_errors: u64,
    pub invalid_psc: BTreeSet<String>,
    pub pkt_seq_errors: u64,
    pub missing_psc: BTreeSet<String>,
    pub corrupt_frame_names: BTreeSet<String>,
}

fn fingerprint_key(coarse: u32, fine: u8, seq: u16) -> String {
    // Zero-padded so lexicographic sort matches numeric sort, per spec §4.7.
    format!("{coarse:010}_{fine:03}_{seq:05}")
}

impl StatsCollector {
    pub fn on_packet_read(&mut self, packet: &SpacePacket) {
        self.ccsds_pkts_read += 1;
        self.bytes_read += packet.total_size() as u64;
    }

    pub fn on_invalid_packet(&mut self, packet: &SpacePacket) {
        self.invalid_pkt_errors += 1;
        let (coarse, fine, seq) = packet.fingerprint();
        self.invalid_psc.insert(fingerprint_key(coarse, fine, seq));
    }

    /// Enumerates the missing `(coarse, fine, seq)` triples from `expected`
    /// through `current.sequence_count - 1`, wrapping at 16384, labeled with
    /// the current packet's time.
    pub fn on_sequence_error(&mut self, current: &SpacePacket, expected: u16) {
        self.pkt_seq_errors += 1;
        let coarse = current.coarse_time();
        let fine = current.fine_time();
        let current_seq = current.primary_header.sequence_count;

        let mut seq = expected;
        while seq != current_seq {
            self.missing_psc.insert(fingerprint_key(coarse, fine, seq));
            seq = PrimaryHeader::next_sequence_count(seq);
        }
        debug_assert!(expected < SEQ_COUNT_MOD);
    }

    pub fn on_frame_emitted(&mut self) {
        self.frames_read += 1;
    }

    pub fn on_truncated_frame(&mut self) {
        self.truncated_frame_errors += 1;
    }

    pub fn on_corrupt_frame(&mut self, name: String) {
        self.corrupt_frame_names.insert(name);
    }
}

impl fmt::Display for StatsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SDP PROCESSING STATS")?;
        writeln!(f, "--------------------\n")?;
        writeln!(f, "Total CCSDS Packets Read: {}", self.ccsds_pkts_read)?;
        writeln!(f, "Total bytes read: {}\n", self.bytes_read)?;
        writeln!(f, "Total Frames Read: {}\n", self.frames_read)?;
        writeln!(
            f,
            "Corrupt Frame Errors Encountered: {}",
            self.corrupt_frame_names.len()
        )?;
        for name in &self.corrupt_frame_names {
            writeln!(f, "{name}")?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "Invalid Packet Errors Encountered: {}",
            self.invalid_pkt_errors
        )?;
        for fp in &self.invalid_psc {
            writeln!(f, "{fp}")?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "Packet Sequence Count Errors Encountered: {}",
            self.pkt_seq_errors
        )?;
        writeln!(
            f,
            "Total Missing Packet Sequence Count Values: {}",
            self.missing_psc.len()
        )?;
        for fp in &self.missing_psc {
            writeln!(f, "{fp}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn report_contains_required_sections() {
        let stats = StatsCollector::default();
        let report = stats.to_string();
        for section in [
            "SDP PROCESSING STATS",
            "Total CCSDS Packets Read",
            "Total bytes read",
            "Total Frames Read",
            "Corrupt Frame Errors Encountered",
            "Invalid Packet Errors Encountered",
            "Packet Sequence Count Errors Encountered",
            "Total Missing Packet Sequence Count Values",
        ] {
            assert!(report.contains(section), "missing section {section}");
        }
    }

    #[test]
    fn missing_psc_sorted_after_zero_padding() {
        let mut stats = StatsCollector::default();
        stats.missing_psc.insert(fingerprint_key(5, 0, 100));
        stats.missing_psc.insert(fingerprint_key(5, 0, 9));
        let values: Vec<_> = stats.missing_psc.iter().cloned().collect();
        assert_eq!(values, vec!["0000000005_000_00009", "0000000005_000_00100"]);
    }
}
