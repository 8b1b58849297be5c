/// Signed-circular comparison of 16-bit sequence numbers, RFC 3550 style:
/// `a` is considered newer than `b` when it is at most half the sequence
/// space ahead.
pub fn seq_greater_than(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < (1 << 15)
}

/// Forward distance from `b` to `a` through the 16-bit wrap.
pub fn seq_distance(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b)
}

/// Hands out consecutive 16-bit sequence numbers, tracking roll-overs.
#[derive(Debug, Clone)]
pub struct Sequencer {
    sequence_number: u16,
    roll_over_count: u64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(rand::random::<u16>())
    }
}

impl Sequencer {
    pub fn new(sequence_number: u16) -> Self {
        Self {
            sequence_number,
            roll_over_count: 0,
        }
    }

    pub fn next_sequence_number(&mut self) -> u16 {
        self.sequence_number = self.sequence_number.wrapping_add(1);
        if self.sequence_number == 0 {
            self.roll_over_count += 1;
        }
        self.sequence_number
    }

    pub fn roll_over_count(&self) -> u64 {
        self.roll_over_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_compare() {
        assert!(seq_greater_than(2, 1));
        assert!(!seq_greater_than(1, 2));
        assert!(!seq_greater_than(5, 5));
        // wrap-around: 2 is newer than 65534
        assert!(seq_greater_than(2, 65534));
        assert!(!seq_greater_than(65534, 2));
        // exactly half the space apart is "older"
        assert!(!seq_greater_than(0x8000, 0));
    }

    #[test]
    fn test_sequencer_wraps_and_counts() {
        let mut s = Sequencer::new(65534);
        assert_eq!(s.next_sequence_number(), 65535);
        assert_eq!(s.next_sequence_number(), 0);
        assert_eq!(s.roll_over_count(), 1);
        assert_eq!(s.next_sequence_number(), 1);
    }
}
