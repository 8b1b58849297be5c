use std::collections::VecDeque;

use rtp::sequence::seq_greater_than;

use crate::jitter::{JitterStats, PacketStatus, StatusLog};
use crate::node::DataEntry;

/// Sequence-ordered holding buffer for real-time text.
///
/// Unlike audio there is no playout clock here; the renderer drains the
/// buffer and applies the RFC 4103 loss-wait rule itself. Redundant copies
/// of already-buffered sequences are dropped, stale sequences are dropped
/// unless they open a fresh stream.
pub struct TextJitterBuffer {
    entries: VecDeque<DataEntry>,
    last_played_seq: u16,
    played_any: bool,
    pub stats: JitterStats,
    pub status_log: StatusLog,
}

impl Default for TextJitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextJitterBuffer {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_played_seq: 0,
            played_any: false,
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

    pub fn last_played_seq(&self) -> Option<u16> {
        self.played_any.then_some(self.last_played_seq)
    }

    /// Clears everything after an SSRC refresh; the next arrival is treated
    /// as a fresh first packet.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.played_any = false;
        self.stats = JitterStats::default();
    }

    pub fn add(&mut self, entry: DataEntry) {
        if self.played_any && !seq_greater_than(entry.seq, self.last_played_seq) {
            // old or already played; reset() reopens the window for restarts
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
                    // a redundant copy recovered a sequence we already hold
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

    /// Looks at the next entry without taking it.
    pub fn peek(&self) -> Option<&DataEntry> {
        self.entries.front()
    }

    /// Takes the next entry in sequence order.
    pub fn get(&mut self) -> Option<DataEntry> {
        let entry = self.entries.pop_front()?;
        self.played_any = true;
        self.last_played_seq = entry.seq;
        Some(entry)
    }

    /// Records a loss the renderer declared after its wait expired.
    pub fn mark_lost(&mut self, seq: u16) {
        self.stats.lost += 1;
        self.status_log.record(seq, PacketStatus::Lost);
    }
}
