//! Sequence number tracking for reliable packet de-duplication
//!
//! Reliable packets are retransmitted until acknowledged, so the receiver
//! sees the same sequence more than once whenever an ack is lost.

/// Tracks received sequence numbers to drop duplicates
///
/// Uses a sliding window approach to handle out-of-order packets
/// and sequence number wraparound.
pub struct SequenceTracker {
    /// Highest sequence number seen, `None` until the first packet
    highest_sequence: Option<u32>,
    /// Bitmap of recently received sequences
    /// Bit N represents whether (highest_sequence - N) was received
    received_bitmap: u64,
    /// Total packets accepted
    packets_accepted: u64,
    /// Total duplicates dropped
    duplicates: u64,
    /// Window size for out-of-order detection
    window_size: u32,
}

impl SequenceTracker {
    /// Create a new sequence tracker
    pub fn new() -> Self {
        Self {
            highest_sequence: None,
            received_bitmap: 0,
            packets_accepted: 0,
            duplicates: 0,
            window_size: 64,
        }
    }

    /// Record a received sequence number.
    ///
    /// Returns `true` if the packet is new and should be delivered, `false`
    /// for a duplicate or a packet too old to judge.
    pub fn accept(&mut self, sequence: u32) -> bool {
        let Some(highest) = self.highest_sequence else {
            self.highest_sequence = Some(sequence);
            self.received_bitmap = 1;
            self.packets_accepted += 1;
            return true;
        };

        let diff = sequence_diff(sequence, highest);

        if diff > 0 {
            if diff < self.window_size as i64 {
                self.received_bitmap <<= diff;
            } else {
                // Large jump - reset tracking
                self.received_bitmap = 0;
            }
            self.received_bitmap |= 1;
            self.highest_sequence = Some(sequence);
            self.packets_accepted += 1;
            return true;
        }

        let offset = (-diff) as u32;
        if offset >= self.window_size {
            // Older than the window, delivered long ago or never coming
            self.duplicates += 1;
            return false;
        }

        let mask = 1u64 << offset;
        if self.received_bitmap & mask != 0 {
            self.duplicates += 1;
            return false;
        }

        // Late arrival inside the window
        self.received_bitmap |= mask;
        self.packets_accepted += 1;
        true
    }

    /// Get total packets accepted
    pub fn packets_accepted(&self) -> u64 {
        self.packets_accepted
    }

    /// Get total duplicates dropped
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Reset tracking
    pub fn reset(&mut self) {
        self.highest_sequence = None;
        self.received_bitmap = 0;
        self.packets_accepted = 0;
        self.duplicates = 0;
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed difference between two sequence numbers, wraparound aware
fn sequence_diff(a: u32, b: u32) -> i64 {
    a.wrapping_sub(b) as i32 as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_packets() {
        let mut tracker = SequenceTracker::new();

        for i in 0..10 {
            assert!(tracker.accept(i), "Sequence {} should be new", i);
        }

        assert_eq!(tracker.packets_accepted(), 10);
        assert_eq!(tracker.duplicates(), 0);
    }

    #[test]
    fn test_duplicate_packets() {
        let mut tracker = SequenceTracker::new();

        assert!(tracker.accept(0));
        assert!(tracker.accept(1));
        assert!(!tracker.accept(1));
        assert!(!tracker.accept(0));

        assert_eq!(tracker.packets_accepted(), 2);
        assert_eq!(tracker.duplicates(), 2);
    }

    #[test]
    fn test_out_of_order() {
        let mut tracker = SequenceTracker::new();

        tracker.accept(0);
        tracker.accept(1);
        tracker.accept(3);

        // Late arrival of packet 2 is still new
        assert!(tracker.accept(2));
        // Second copy is not
        assert!(!tracker.accept(2));
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut tracker = SequenceTracker::new();

        assert!(tracker.accept(u32::MAX - 1));
        assert!(tracker.accept(u32::MAX));
        assert!(tracker.accept(0));
        assert!(!tracker.accept(u32::MAX));
    }

    #[test]
    fn test_packets_older_than_window_are_dropped() {
        let mut tracker = SequenceTracker::new();

        tracker.accept(0);
        tracker.accept(100);
        assert!(!tracker.accept(1));
    }

    #[test]
    fn test_reset() {
        let mut tracker = SequenceTracker::new();

        tracker.accept(4);
        tracker.accept(4);
        tracker.reset();

        assert_eq!(tracker.packets_accepted(), 0);
        assert_eq!(tracker.duplicates(), 0);
        assert!(tracker.accept(4));
    }
}
