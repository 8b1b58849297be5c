use std::collections::VecDeque;

use bytes::BytesMut;

use rtp::sequence::seq_greater_than;

use crate::jitter::{JitterStats, PacketStatus, StatusLog};
use crate::node::{DataEntry, SubType};

/// Frame-assembly buffer for video.
///
/// Packets of one coded frame share a timestamp and the last one carries
/// the marker. A frame is released only when its packet run is complete;
/// after an SSRC refresh nothing is released until a decoder configuration
/// frame (IDR with parameter sets) starts a new decodable sequence.
pub struct VideoJitterBuffer {
    entries: VecDeque<DataEntry>,
    last_released_seq: u16,
    released_any: bool,
    waiting_for_idr: bool,
    pub stats: JitterStats,
    pub status_log: StatusLog,
}

impl Default for VideoJitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoJitterBuffer {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_released_seq: 0,
            released_any: false,
            waiting_for_idr: true,
            stats: JitterStats::default(),
            status_log: StatusLog::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.released_any = false;
        self.waiting_for_idr = true;
        self.stats = JitterStats::default();
    }

    pub fn add(&mut self, entry: DataEntry) {
        if self.released_any && !seq_greater_than(entry.seq, self.last_released_seq) {
            self.stats.discarded += 1;
            self.status_log.record(entry.seq, PacketStatus::Discarded);
            return;
        }

        self.stats.received += 1;

        match self
            .entries
            .iter()
            .position(|e| !seq_greater_than(entry.seq, e.seq))
        {
            Some(pos) => {
                if self.entries[pos].seq == entry.seq {
                    self.stats.duplicate += 1;
                    self.status_log.record(entry.seq, PacketStatus::Duplicate);
                    return;
                }
                self.stats.reordered += 1;
                self.status_log.record(entry.seq, PacketStatus::Reordered);
                self.entries.insert(pos, entry);
            }
            None => {
                self.status_log.record(entry.seq, PacketStatus::Ok);
                self.entries.push_back(entry);
            }
        }
    }

    /// Assembles and returns the next complete frame, or `None` while
    /// packets are still missing.
    ///
    /// Returns the concatenated payload tagged with the frame's timestamp
    /// and the sequence of its last packet.
    pub fn get_frame(&mut self) -> Option<DataEntry> {
        let first = self.entries.front()?;

        // a contiguous run from the front up to a marker forms one frame
        if self.released_any {
            let expected = self.last_released_seq.wrapping_add(1);
            if first.seq != expected {
                return None;
            }
        }

        let timestamp = first.timestamp;
        let mut end = None;
        let mut prev_seq = first.seq.wrapping_sub(1);
        for (i, e) in self.entries.iter().enumerate() {
            if e.seq != prev_seq.wrapping_add(1) || e.timestamp != timestamp {
                return None;
            }
            prev_seq = e.seq;
            if e.mark {
                end = Some(i);
                break;
            }
        }
        let end = end?;

        if self.waiting_for_idr {
            if self.entries[0].subtype == SubType::BitstreamCodecConfig {
                self.waiting_for_idr = false;
            } else {
                // undecodable frame, drop it whole
                for _ in 0..=end {
                    let e = self.entries.pop_front().unwrap();
                    self.released_any = true;
                    self.last_released_seq = e.seq;
                    self.stats.discarded += 1;
                    self.status_log.record(e.seq, PacketStatus::Discarded);
                }
                return self.get_frame();
            }
        }

        let mut data = BytesMut::new();
        let mut frame = DataEntry {
            subtype: self.entries[0].subtype,
            timestamp,
            ..Default::default()
        };
        for _ in 0..=end {
            let e = self.entries.pop_front().unwrap();
            data.extend_from_slice(&e.data);
            self.released_any = true;
            self.last_released_seq = e.seq;
            frame.seq = e.seq;
            frame.mark = e.mark;
            frame.data_type = e.data_type;
        }
        frame.data = data.freeze();
        Some(frame)
    }

    /// Sequence numbers currently missing in front of buffered data, used
    /// to drive NACK generation.
    pub fn missing_sequence_numbers(&self) -> Vec<u16> {
        let mut missing = vec![];
        if !self.released_any {
            return missing;
        }
        let mut expected = self.last_released_seq.wrapping_add(1);
        for e in &self.entries {
            while e.seq != expected {
                missing.push(expected);
                expected = expected.wrapping_add(1);
            }
            expected = expected.wrapping_add(1);
        }
        missing
    }
}
