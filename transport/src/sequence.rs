//! Receive-direction sequence tracking.
//!
//! Classifies every arriving sequence number against the expected stream
//! position and accumulates loss/disorder statistics. The tracker only
//! observes and reports — it never reorders frames or requests
//! retransmission; UDP delivery stays unordered and lossy.

use tracing::{debug, info, warn};

/// How a packet's sequence number relates to the stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    // ---
    /// Exactly the expected sequence.
    InOrder,

    /// Jumped ahead of the expected sequence by this many packets.
    Gap(u32),

    /// Behind the expected sequence but ahead of the newest seen packet.
    OutOfOrder,

    /// At or behind the newest seen packet.
    Duplicate,
}

/// One recorded hole in the sequence numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRecord {
    // ---
    pub expected: u32,
    pub received: u32,
    pub gap_size: u32,
}

/// Tuning knobs for the tracker.
#[derive(Debug, Clone)]
pub struct SequenceTrackerConfig {
    // ---
    /// Gaps strictly larger than this are recorded and logged; smaller
    /// ones still count into `missing_count` but are treated as routine
    /// jitter. The asymmetry keeps single-frame gaps out of the log.
    pub gap_record_threshold: u32,

    /// Emit a progress line every N observed packets (0 disables).
    pub log_every_packets: u64,
}

impl Default for SequenceTrackerConfig {
    fn default() -> Self {
        // ---
        Self {
            gap_record_threshold: 1,
            log_every_packets: 200,
        }
    }
}

/// Point-in-time snapshot of the tracker's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceStats {
    // ---
    pub total_received: u64,
    pub last_sequence: u32,
    pub missing_count: u64,
    pub out_of_order_count: u64,
    pub duplicate_count: u64,
    pub gaps: Vec<GapRecord>,
}

impl SequenceStats {
    // ---
    /// Fraction of expected packets that never arrived, based on the
    /// highest sequence seen. Zero until anything is received.
    pub fn loss_rate(&self) -> f64 {
        // ---
        if self.last_sequence == 0 {
            0.0
        } else {
            self.missing_count as f64 / self.last_sequence as f64
        }
    }
}

/// Expected-sequence state for one receive direction.
///
/// Reset whenever the control plane signals a new logical stream (a new
/// utterance from the gateway restarts numbering at 1).
#[derive(Debug)]
pub struct SequenceTracker {
    // ---
    config: SequenceTrackerConfig,
    expected_sequence: u32,
    last_received_sequence: u32,
    total_received: u64,
    out_of_order: u64,
    duplicates: u64,
    missing: u64,
    gaps: Vec<GapRecord>,
}

impl SequenceTracker {
    // ---
    pub fn new(config: SequenceTrackerConfig) -> Self {
        // ---
        Self {
            config,
            expected_sequence: 1,
            last_received_sequence: 0,
            total_received: 0,
            out_of_order: 0,
            duplicates: 0,
            missing: 0,
            gaps: Vec::new(),
        }
    }

    /// Classifies one arriving sequence number and updates the counters.
    ///
    /// Two independent checks run against different reference points: the
    /// classification compares against `expected_sequence`, the progression
    /// update compares against `last_received_sequence`. Both branches
    /// execute on every packet.
    pub fn observe(&mut self, sequence: u32) -> Classification {
        // ---
        self.total_received += 1;

        let classification = if sequence > self.expected_sequence {
            let gap_size = sequence - self.expected_sequence;
            self.missing += gap_size as u64;

            if gap_size > self.config.gap_record_threshold {
                self.gaps.push(GapRecord {
                    expected: self.expected_sequence,
                    received: sequence,
                    gap_size,
                });
                warn!(
                    "Sequence gap detected: expected {}, got {} ({} packets missing)",
                    self.expected_sequence, sequence, gap_size
                );
            }

            Classification::Gap(gap_size)
        } else if sequence < self.expected_sequence {
            if sequence <= self.last_received_sequence {
                self.duplicates += 1;
                Classification::Duplicate
            } else {
                self.out_of_order += 1;
                Classification::OutOfOrder
            }
        } else {
            Classification::InOrder
        };

        if sequence > self.last_received_sequence {
            self.last_received_sequence = sequence;
            self.expected_sequence = sequence + 1;
        }

        if self.config.log_every_packets > 0
            && self.total_received % self.config.log_every_packets == 0
        {
            debug!(
                "Packet #{}: seq={}, expected={}",
                self.total_received, sequence, self.expected_sequence
            );
        }

        classification
    }

    /// Reinitializes all counters for a new logical stream.
    pub fn reset(&mut self) {
        // ---
        self.expected_sequence = 1;
        self.last_received_sequence = 0;
        self.total_received = 0;
        self.out_of_order = 0;
        self.duplicates = 0;
        self.missing = 0;
        self.gaps.clear();
        debug!("Sequence tracking reset for new stream");
    }

    /// Snapshot of the current counters.
    pub fn stats(&self) -> SequenceStats {
        // ---
        SequenceStats {
            total_received: self.total_received,
            last_sequence: self.last_received_sequence,
            missing_count: self.missing,
            out_of_order_count: self.out_of_order,
            duplicate_count: self.duplicates,
            gaps: self.gaps.clone(),
        }
    }

    /// Logs a human-readable summary.
    ///
    /// Called on stream-stop and on session teardown.
    pub fn report(&self) {
        // ---
        let stats = self.stats();
        info!(
            "Stream summary: {} received, last seq {}, {} missing, {} out-of-order, {} duplicates",
            stats.total_received,
            stats.last_sequence,
            stats.missing_count,
            stats.out_of_order_count,
            stats.duplicate_count
        );

        if stats.gaps.is_empty() {
            info!("No sequence gaps detected");
        } else {
            info!("{} sequence gaps detected", stats.gaps.len());
            for gap in stats.gaps.iter().rev().take(5) {
                info!(
                    "  gap: expected {}, got {} ({} missing)",
                    gap.expected, gap.received, gap.gap_size
                );
            }
        }

        if stats.last_sequence > 0 {
            info!("Packet loss rate: {:.2}%", stats.loss_rate() * 100.0);
        }
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        // ---
        Self::new(SequenceTrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn observe_all(tracker: &mut SequenceTracker, seqs: &[u32]) -> Vec<Classification> {
        seqs.iter().map(|&s| tracker.observe(s)).collect()
    }

    #[test]
    fn in_order_stream_has_clean_stats() {
        // ---
        let mut tracker = SequenceTracker::default();
        let classes = observe_all(&mut tracker, &[1, 2, 3, 4]);

        assert!(classes.iter().all(|c| *c == Classification::InOrder));
        let stats = tracker.stats();
        assert_eq!(stats.total_received, 4);
        assert_eq!(stats.last_sequence, 4);
        assert_eq!(stats.missing_count, 0);
        assert!(stats.gaps.is_empty());
        assert_eq!(stats.loss_rate(), 0.0);
    }

    #[test]
    fn single_frame_gap_counts_but_is_not_recorded() {
        // ---
        let mut tracker = SequenceTracker::default();
        let classes = observe_all(&mut tracker, &[1, 2, 3, 5, 6]);

        assert_eq!(classes[3], Classification::Gap(1));
        let stats = tracker.stats();
        assert_eq!(stats.missing_count, 1);
        // Size-1 gaps are routine jitter: counted, never recorded.
        assert!(stats.gaps.is_empty());
    }

    #[test]
    fn multi_frame_gap_is_recorded() {
        // ---
        let mut tracker = SequenceTracker::default();
        let classes = observe_all(&mut tracker, &[1, 2, 5, 6]);

        assert_eq!(classes[2], Classification::Gap(2));
        let stats = tracker.stats();
        assert_eq!(stats.missing_count, 2);
        assert_eq!(
            stats.gaps,
            vec![GapRecord {
                expected: 3,
                received: 5,
                gap_size: 2
            }]
        );
    }

    #[test]
    fn replayed_packet_is_a_duplicate() {
        // ---
        let mut tracker = SequenceTracker::default();
        observe_all(&mut tracker, &[1, 2, 3]);

        assert_eq!(tracker.observe(2), Classification::Duplicate);
        let stats = tracker.stats();
        assert_eq!(stats.duplicate_count, 1);
        assert_eq!(stats.last_sequence, 3);
    }

    #[test]
    fn duplicate_boundary_is_at_last_received() {
        // ---
        // After [1, 3], last received is 3 and expected is 4. A late 2
        // satisfies `sequence <= last_received_sequence` and so counts as
        // a duplicate, not out-of-order: the boundary is the newest seen
        // packet, not the expected position.
        let mut tracker = SequenceTracker::default();
        observe_all(&mut tracker, &[1, 3]);

        assert_eq!(tracker.observe(2), Classification::Duplicate);
        assert_eq!(tracker.observe(3), Classification::Duplicate);
        let stats = tracker.stats();
        assert_eq!(stats.duplicate_count, 2);
        assert_eq!(stats.out_of_order_count, 0);
    }

    #[test]
    fn gap_then_progress_keeps_expected_in_sync() {
        // ---
        let mut tracker = SequenceTracker::default();
        observe_all(&mut tracker, &[1, 5]);

        let stats = tracker.stats();
        assert_eq!(stats.missing_count, 3);
        assert_eq!(stats.last_sequence, 5);
        assert_eq!(tracker.observe(6), Classification::InOrder);
    }

    #[test]
    fn loss_rate_uses_last_sequence_as_denominator() {
        // ---
        let mut tracker = SequenceTracker::default();
        observe_all(&mut tracker, &[1, 2, 5, 6, 7, 8, 9, 10]);

        let stats = tracker.stats();
        assert_eq!(stats.missing_count, 2);
        assert_eq!(stats.last_sequence, 10);
        assert!((stats.loss_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn reset_restores_start_values() {
        // ---
        let mut tracker = SequenceTracker::default();
        observe_all(&mut tracker, &[1, 2, 9, 9]);
        tracker.reset();

        let stats = tracker.stats();
        assert_eq!(stats.total_received, 0);
        assert_eq!(stats.last_sequence, 0);
        assert_eq!(stats.missing_count, 0);
        assert_eq!(stats.duplicate_count, 0);
        assert!(stats.gaps.is_empty());

        // A fresh stream starts at 1 again.
        assert_eq!(tracker.observe(1), Classification::InOrder);
    }

    #[test]
    fn zero_sequence_after_reset_is_a_duplicate() {
        // ---
        // expected=1, last=0: sequence 0 is at the last-received boundary.
        let mut tracker = SequenceTracker::default();
        assert_eq!(tracker.observe(0), Classification::Duplicate);
    }

    #[test]
    fn configurable_record_threshold() {
        // ---
        let mut tracker = SequenceTracker::new(SequenceTrackerConfig {
            gap_record_threshold: 0,
            log_every_packets: 0,
        });
        observe_all(&mut tracker, &[1, 3]);

        // With the threshold lowered, size-1 gaps are recorded too.
        assert_eq!(tracker.stats().gaps.len(), 1);
    }
}
