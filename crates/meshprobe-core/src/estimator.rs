//! Loss and latency estimation
//!
//! Probes are tracked in a fixed circular buffer of [`ProbeSlot`]s. Sending a
//! probe takes the slot under the write cursor; a matching acknowledgement
//! clears the slot's `sent_at` and stores the round trip time. Reports look
//! at the last `window` slots before the cursor.
//!
//! There is no timeout scan. The buffer holds `max_response_delay` worth of
//! slots beyond the test window, and a probe that was never acknowledged is
//! simply overwritten when the cursor wraps around to it. Until then it counts
//! as a failure in every report that covers it.
//!
//! All times are milliseconds; the estimator never reads a clock itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Invalid estimator or session parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },

    #[error("message period ({message_period_ms} ms) exceeds test period ({test_period_ms} ms)")]
    PeriodExceedsTest {
        message_period_ms: u64,
        test_period_ms: u64,
    },

    #[error("cannot load configuration from {path}: {reason}")]
    File { path: String, reason: String },
}

/// Probe timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Interval between probes
    pub message_period_ms: u64,
    /// Length of the window a report covers
    pub test_period_ms: u64,
    /// How long a probe may stay unacknowledged before its slot can be reused
    pub max_response_delay_ms: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            message_period_ms: 100,
            test_period_ms: 3000,
            max_response_delay_ms: 2000,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("message period", self.message_period_ms),
            ("test period", self.test_period_ms),
            ("max response delay", self.max_response_delay_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { name });
            }
        }
        if self.message_period_ms > self.test_period_ms {
            return Err(ConfigError::PeriodExceedsTest {
                message_period_ms: self.message_period_ms,
                test_period_ms: self.test_period_ms,
            });
        }
        Ok(())
    }

    /// Slots in the circular buffer
    pub fn capacity(&self) -> usize {
        let span = self.test_period_ms + self.max_response_delay_ms;
        (span / self.message_period_ms.max(1)) as usize
    }

    /// Slots covered by a report
    pub fn window(&self) -> usize {
        (self.test_period_ms / self.message_period_ms.max(1)) as usize
    }
}

/// One tracked probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSlot {
    /// Send time of a probe still awaiting its acknowledgement.
    /// `None` when the slot is unused or its probe was acknowledged.
    pub sent_at: Option<u64>,
    /// Round trip time, recorded when the probe was acknowledged
    pub elapsed_ms: Option<u64>,
}

/// Result of feeding an acknowledgement to the estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { elapsed_ms: u64 },
    /// No in-flight probe has this timestamp (late, duplicate or unknown)
    Unmatched,
}

/// Success rate and latency over the report window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Time the report was computed at
    pub now: u64,
    /// `successes / window`, 0 for an empty window
    pub success_rate: f64,
    /// Mean round trip over acknowledged slots, 0 if none
    pub average_latency_ms: f64,
    /// Window slots not waiting for an acknowledgement
    pub successes: usize,
    /// Window size in slots
    pub window: usize,
    /// Window slots with a recorded round trip
    pub matched: usize,
    /// Window slots still waiting
    pub in_flight: usize,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Success rate: {:.2} ({} of {}) - Average response time: {:.2} ms",
            self.success_rate, self.successes, self.window, self.average_latency_ms
        )
    }
}

/// Circular-buffer probe matcher
#[derive(Debug, Clone)]
pub struct Estimator {
    slots: Vec<ProbeSlot>,
    /// Next slot to write
    cursor: usize,
    window: usize,
    message_period_ms: u64,
    /// Scheduled time of the last probe
    last_send: u64,
}

impl Estimator {
    /// Create an estimator whose first probe is due one period after `start`
    pub fn new(config: &EstimatorConfig, start: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_slots(
            config.capacity(),
            config.window(),
            config.message_period_ms,
            start,
        ))
    }

    /// Create an estimator with explicit buffer geometry.
    ///
    /// The buffer always has at least one slot and the window never exceeds it.
    pub fn with_slots(capacity: usize, window: usize, message_period_ms: u64, start: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![ProbeSlot::default(); capacity],
            cursor: 0,
            window: window.min(capacity),
            message_period_ms,
            last_send: start,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn slots(&self) -> &[ProbeSlot] {
        &self.slots
    }

    /// Allocate a probe if one is due. Returns the timestamp to stamp it with.
    ///
    /// The schedule advances by exactly one period per probe, so a late call
    /// does not shift every later probe.
    pub fn tick(&mut self, now: u64) -> Option<u64> {
        if now.saturating_sub(self.last_send) < self.message_period_ms {
            return None;
        }
        self.record_send(now);
        self.last_send += self.message_period_ms;
        Some(now)
    }

    /// Track a probe sent at `sent_at` in the slot under the cursor
    pub fn record_send(&mut self, sent_at: u64) {
        self.slots[self.cursor] = ProbeSlot {
            sent_at: Some(sent_at),
            elapsed_ms: None,
        };
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Match an acknowledgement echoing `origin_ts`, received at `now`.
    ///
    /// The scan starts at the oldest slot, so if two in-flight probes share a
    /// timestamp the older one is matched first.
    pub fn on_response(&mut self, origin_ts: u64, now: u64) -> MatchOutcome {
        let capacity = self.slots.len();
        let found = (0..capacity)
            .map(|i| (self.cursor + i) % capacity)
            .find(|&idx| self.slots[idx].sent_at == Some(origin_ts));

        match found {
            Some(idx) => {
                let elapsed_ms = now.saturating_sub(origin_ts);
                self.slots[idx] = ProbeSlot {
                    sent_at: None,
                    elapsed_ms: Some(elapsed_ms),
                };
                MatchOutcome::Matched { elapsed_ms }
            }
            None => MatchOutcome::Unmatched,
        }
    }

    /// Summarize the last `window` slots before the cursor
    pub fn report(&self, now: u64) -> Report {
        let capacity = self.slots.len();
        let window_slots = (1..=self.window)
            .map(|back| &self.slots[(self.cursor + capacity - back) % capacity]);

        let mut successes = 0;
        let mut matched = 0;
        let mut latency_sum = 0u64;
        for slot in window_slots {
            if slot.sent_at.is_none() {
                successes += 1;
                if let Some(elapsed) = slot.elapsed_ms {
                    matched += 1;
                    latency_sum += elapsed;
                }
            }
        }

        let success_rate = if self.window > 0 {
            successes as f64 / self.window as f64
        } else {
            0.0
        };
        let average_latency_ms = if matched > 0 {
            latency_sum as f64 / matched as f64
        } else {
            0.0
        };

        Report {
            now,
            success_rate,
            average_latency_ms,
            successes,
            window: self.window,
            matched,
            in_flight: self.window - successes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_geometry() {
        let config = EstimatorConfig::default();
        assert_eq!(config.capacity(), 50);
        assert_eq!(config.window(), 30);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate() {
        let zero = EstimatorConfig {
            message_period_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            zero.validate(),
            Err(ConfigError::NotPositive {
                name: "message period"
            })
        );

        let no_delay = EstimatorConfig {
            max_response_delay_ms: 0,
            ..Default::default()
        };
        assert!(no_delay.validate().is_err());

        let too_slow = EstimatorConfig {
            message_period_ms: 5000,
            test_period_ms: 3000,
            max_response_delay_ms: 2000,
        };
        assert!(matches!(
            too_slow.validate(),
            Err(ConfigError::PeriodExceedsTest { .. })
        ));
        assert!(Estimator::new(&too_slow, 0).is_err());
    }

    #[test]
    fn test_tick_waits_one_period() {
        let mut est = Estimator::with_slots(50, 30, 100, 1000);
        assert_eq!(est.tick(1000), None);
        assert_eq!(est.tick(1099), None);
        assert_eq!(est.tick(1100), Some(1100));
        assert_eq!(est.tick(1150), None);
        assert_eq!(est.cursor(), 1);
    }

    #[test]
    fn test_tick_does_not_drift() {
        let mut est = Estimator::with_slots(50, 30, 100, 0);
        // Late by 30 ms: next probe is still due at 200, not 230
        assert_eq!(est.tick(130), Some(130));
        assert_eq!(est.tick(199), None);
        assert_eq!(est.tick(200), Some(200));
    }

    #[test]
    fn test_tick_catches_up_after_stall() {
        let mut est = Estimator::with_slots(50, 30, 100, 0);
        assert_eq!(est.tick(350), Some(350));
        assert_eq!(est.tick(351), Some(351));
        assert_eq!(est.tick(352), Some(352));
        assert_eq!(est.tick(353), None);
    }

    #[test]
    fn test_tick_clears_stale_latency() {
        let mut est = Estimator::with_slots(2, 2, 10, 0);
        est.tick(10);
        est.on_response(10, 15);
        est.tick(20);
        // Wraps onto the acknowledged slot
        est.tick(30);
        assert_eq!(
            est.slots()[0],
            ProbeSlot {
                sent_at: Some(30),
                elapsed_ms: None
            }
        );
    }

    /// Send 30 probes, 10 ms apart starting at t=100
    fn thirty_probes() -> (Estimator, Vec<u64>) {
        let mut est = Estimator::with_slots(50, 30, 10, 90);
        let mut sent = Vec::new();
        for i in 0..30 {
            let now = 100 + i * 10;
            sent.push(est.tick(now).unwrap());
        }
        (est, sent)
    }

    #[test]
    fn test_all_probes_matched() {
        let (mut est, sent) = thirty_probes();
        for ts in &sent {
            assert_eq!(
                est.on_response(*ts, ts + 20),
                MatchOutcome::Matched { elapsed_ms: 20 }
            );
        }

        let report = est.report(500);
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(report.successes, 30);
        assert_eq!(report.matched, 30);
        assert_eq!(report.average_latency_ms, 20.0);
    }

    #[test]
    fn test_half_of_probes_matched() {
        let (mut est, sent) = thirty_probes();
        // Every other probe, with latencies 10, 20, ... 150
        for (i, ts) in sent.iter().step_by(2).enumerate() {
            est.on_response(*ts, ts + 10 * (i as u64 + 1));
        }

        let report = est.report(500);
        assert_eq!(report.success_rate, 0.5);
        assert_eq!(report.successes, 15);
        assert_eq!(report.in_flight, 15);
        assert_eq!(report.average_latency_ms, 80.0);
    }

    #[test]
    fn test_unmatched_response_is_a_noop() {
        let (mut est, sent) = thirty_probes();
        est.on_response(sent[0], sent[0] + 5);
        let before = est.slots().to_vec();

        // Unknown timestamp, and an acknowledgement that was already matched
        assert_eq!(est.on_response(12345, 500), MatchOutcome::Unmatched);
        assert_eq!(est.on_response(sent[0], 500), MatchOutcome::Unmatched);

        assert_eq!(est.slots(), &before[..]);
    }

    #[test]
    fn test_evicted_probe_cannot_be_matched() {
        let mut est = Estimator::with_slots(3, 2, 10, 0);
        est.tick(10);
        est.tick(20);
        est.tick(30);
        // Overwrites the probe sent at 10
        est.tick(40);

        assert_eq!(est.on_response(10, 45), MatchOutcome::Unmatched);
        assert_eq!(
            est.on_response(20, 45),
            MatchOutcome::Matched { elapsed_ms: 25 }
        );
    }

    #[test]
    fn test_unanswered_probes_count_as_failures() {
        let mut est = Estimator::with_slots(5, 3, 10, 0);
        for t in [10, 20, 30] {
            est.tick(t);
        }
        est.on_response(10, 12);

        let report = est.report(40);
        // Window is slots for 30, 20, 10
        assert_eq!(report.successes, 1);
        assert_eq!(report.in_flight, 2);
        assert!((report.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.average_latency_ms, 2.0);
    }

    #[test]
    fn test_empty_window_reports_zero() {
        let est = Estimator::with_slots(10, 0, 100, 0);
        let report = est.report(0);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.average_latency_ms, 0.0);
        assert_eq!(report.window, 0);
    }

    #[test]
    fn test_duplicate_timestamps_match_oldest_first() {
        let mut est = Estimator::with_slots(4, 4, 10, 0);
        est.record_send(100);
        est.record_send(100);

        est.on_response(100, 110);
        assert_eq!(est.slots()[0].sent_at, None);
        assert_eq!(est.slots()[1].sent_at, Some(100));
    }

    #[test]
    fn test_report_display() {
        let report = Report {
            now: 0,
            success_rate: 29.0 / 30.0,
            average_latency_ms: 12.4,
            successes: 29,
            window: 30,
            matched: 29,
            in_flight: 1,
        };
        assert_eq!(
            report.to_string(),
            "Success rate: 0.97 (29 of 30) - Average response time: 12.40 ms"
        );
    }
}
