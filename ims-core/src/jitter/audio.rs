use std::collections::VecDeque;

use bytes::Bytes;

use rtp::sequence::seq_greater_than;

use crate::config::AudioCodec;
use crate::jitter::{JitterStats, PacketStatus, StatusLog};
use crate::node::{DataEntry, SubType};

pub const DEFAULT_MIN_DEPTH: u32 = 4;
pub const DEFAULT_INIT_DEPTH: u32 = 4;
pub const DEFAULT_MAX_DEPTH: u32 = 9;
pub const FRAME_MS: u32 = 20;

/// Sequence-ordered playout buffer for audio with a jitter-adaptive target
/// depth.
///
/// Entries are held in increasing sequence order (signed-circular compare)
/// and released one frame per 20 ms once the buffered depth has reached the
/// current target. Gaps are covered by synthetic comfort entries so the
/// renderer clock never stalls.
pub struct AudioJitterBuffer {
    codec: AudioCodec,
    min_depth: u32,
    max_depth: u32,
    target_depth: u32,

    entries: VecDeque<DataEntry>,
    played_any: bool,
    last_played_seq: u16,
    last_played_timestamp: u32,
    next_play_time: u32,

    /// IIR-smoothed arrival jitter in milliseconds.
    arrival_jitter_ms: f64,
    last_arrival_time: u32,
    last_arrival_timestamp: u32,

    pub stats: JitterStats,
    pub status_log: StatusLog,
}

impl AudioJitterBuffer {
    pub fn new(codec: AudioCodec) -> Self {
        Self {
            codec,
            min_depth: DEFAULT_MIN_DEPTH,
            max_depth: DEFAULT_MAX_DEPTH,
            target_depth: DEFAULT_INIT_DEPTH,
            entries: VecDeque::new(),
            played_any: false,
            last_played_seq: 0,
            last_played_timestamp: 0,
            next_play_time: 0,
            arrival_jitter_ms: 0.0,
            last_arrival_time: 0,
            last_arrival_timestamp: 0,
            stats: JitterStats::default(),
            status_log: StatusLog::default(),
        }
    }

    pub fn set_depth(&mut self, init: u32, min: u32, max: u32) {
        self.target_depth = init;
        self.min_depth = min;
        self.max_depth = max;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn target_depth(&self) -> u32 {
        self.target_depth
    }

    pub fn arrival_jitter_ms(&self) -> u32 {
        self.arrival_jitter_ms as u32
    }

    /// Clears entries and playout state after an SSRC change.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.played_any = false;
        self.arrival_jitter_ms = 0.0;
        self.last_arrival_time = 0;
        self.last_arrival_timestamp = 0;
        self.next_play_time = 0;
        self.stats = JitterStats::default();
    }

    pub fn add(&mut self, entry: DataEntry, now: u32) {
        self.update_arrival_jitter(&entry, now);

        if self.played_any && !seq_greater_than(entry.seq, self.last_played_seq) {
            // strictly older than (or equal to) the last played frame
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

        self.adapt_depth();
    }

    /// Returns the next frame once the playout gate opens, `None` while the
    /// buffer is still filling or between frame ticks.
    pub fn get(&mut self, now: u32) -> Option<DataEntry> {
        if self.entries.is_empty() {
            return None;
        }

        // gate until the target depth is reached, then pace one per frame
        if self.next_play_time == 0 {
            if (self.entries.len() as u32) < self.target_depth {
                return None;
            }
            self.next_play_time = now;
        } else if now < self.next_play_time {
            return None;
        }

        self.next_play_time += FRAME_MS;

        let front_seq = self.entries.front().map(|e| e.seq).unwrap_or_default();
        let expected = self.last_played_seq.wrapping_add(1);

        if self.last_played_timestamp != 0 && front_seq != expected {
            // a gap reached the playout point: synthesize comfort data
            self.stats.lost += 1;
            self.status_log.record(expected, PacketStatus::Lost);
            self.last_played_seq = expected;
            self.last_played_timestamp = self.last_played_timestamp.wrapping_add(FRAME_MS);
            return Some(DataEntry {
                subtype: SubType::PcmNoData,
                data: Bytes::new(),
                timestamp: self.last_played_timestamp,
                seq: expected,
                ..Default::default()
            });
        }

        let entry = self.entries.pop_front()?;
        self.played_any = true;
        self.last_played_seq = entry.seq;
        self.last_played_timestamp = entry.timestamp;
        Some(entry)
    }

    fn update_arrival_jitter(&mut self, entry: &DataEntry, now: u32) {
        if self.last_arrival_time != 0 {
            let transit = now.wrapping_sub(self.last_arrival_time) as f64;
            let expected = entry
                .timestamp
                .wrapping_sub(self.last_arrival_timestamp) as f64;
            let d = (transit - expected).abs();
            self.arrival_jitter_ms += (d - self.arrival_jitter_ms) / 16.0;
        }
        self.last_arrival_time = now;
        self.last_arrival_timestamp = entry.timestamp;
    }

    fn adapt_depth(&mut self) {
        let wanted = (self.arrival_jitter_ms / FRAME_MS as f64).ceil() as u32 + self.min_depth;
        self.target_depth = wanted.clamp(self.min_depth, self.max_depth);
    }
}
