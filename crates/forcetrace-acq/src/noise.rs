//! Causal noise rejection and median smoothing for live frames.
//!
//! Serial links to the sensor board occasionally deliver frames where
//! several channels jump by orders of magnitude for a single record
//! (bit errors, partially overwritten UART buffers). The filter rejects a
//! frame when too few channels moved by a plausible relative amount since
//! the previous accepted frame, and smooths accepted frames with a short
//! per-channel running median.
//!
//! A large, fast and legitimate excursion (a weight dropped on the board)
//! looks exactly like noise to the validity check, so after a bounded run
//! of consecutive rejections the next frame is accepted unconditionally.

use std::collections::VecDeque;

use forcetrace_core::{Frame, Sample};
use serde::{Deserialize, Serialize};

use crate::stats;

/// Whether rejected frames feed the smoothing history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Only accepted frames enter the median window
    AcceptedOnly,
    /// Every parsed frame enters the median window, accepted or not
    EveryFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseFilterConfig {
    /// Run the validity check at all
    pub enabled: bool,

    /// Relative change below which a channel counts as valid
    pub threshold: f64,

    /// Valid channels required to accept a frame
    pub min_valid_channels: usize,

    /// Consecutive rejections tolerated before a forced accept
    pub rejection_ceiling: u32,

    /// Running-median window length; 1 disables smoothing
    pub median_window: usize,

    pub history_policy: HistoryPolicy,
}

impl Default for NoiseFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 1.5,
            min_valid_channels: 2,
            rejection_ceiling: 10,
            median_window: 3,
            history_policy: HistoryPolicy::AcceptedOnly,
        }
    }
}

impl NoiseFilterConfig {
    /// No validity check and no smoothing: every frame becomes a sample
    pub fn passthrough() -> Self {
        Self {
            enabled: false,
            median_window: 1,
            ..Self::default()
        }
    }
}

/// Result of offering one frame to the filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Accepted(Sample),
    /// Frame judged noisy; no sample index was consumed
    Rejected {
        valid_channels: usize,
        consecutive: u32,
    },
}

/// Streaming validity check plus running-median smoothing.
///
/// State lives for one acquisition session and is never persisted.
pub struct StreamingNoiseFilter {
    config: NoiseFilterConfig,
    histories: Vec<VecDeque<f64>>,
    previous: Option<Vec<f64>>,
    consecutive_rejections: u32,
    next_index: u64,
}

impl StreamingNoiseFilter {
    pub fn new(config: NoiseFilterConfig, channel_count: usize) -> Self {
        let window = config.median_window.max(1);
        Self {
            config,
            histories: (0..channel_count)
                .map(|_| VecDeque::with_capacity(window))
                .collect(),
            previous: None,
            consecutive_rejections: 0,
            next_index: 0,
        }
    }

    pub fn config(&self) -> &NoiseFilterConfig {
        &self.config
    }

    /// Index the next accepted sample will receive
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.consecutive_rejections
    }

    /// Offer a frame; the frame must carry the session's channel count
    pub fn accept(&mut self, frame: &Frame) -> FilterOutcome {
        let mut forced = false;

        if self.config.enabled {
            if let Some(previous) = &self.previous {
                let valid = self.count_valid(previous, &frame.channels);
                let required = self.config.min_valid_channels.min(frame.channels.len());

                if valid < required {
                    self.consecutive_rejections += 1;

                    if self.consecutive_rejections <= self.config.rejection_ceiling {
                        if self.config.history_policy == HistoryPolicy::EveryFrame {
                            self.push_history(&frame.channels);
                        }
                        return FilterOutcome::Rejected {
                            valid_channels: valid,
                            consecutive: self.consecutive_rejections,
                        };
                    }

                    forced = true;
                    self.consecutive_rejections = 0;
                } else {
                    self.consecutive_rejections = 0;
                }
            }
        }

        let channels = self.smooth(&frame.channels);
        self.previous = Some(frame.channels.clone());

        let index = self.next_index;
        self.next_index += 1;

        FilterOutcome::Accepted(Sample {
            index,
            device_time: frame.device_time,
            channels,
            forced,
        })
    }

    /// Forget all history, as at the start of a new session
    pub fn reset(&mut self) {
        self.histories.iter_mut().for_each(VecDeque::clear);
        self.previous = None;
        self.consecutive_rejections = 0;
        self.next_index = 0;
    }

    /// Channels whose relative change against the previous accepted frame
    /// stays under the threshold. A zero previous value has no defined
    /// relative change and only counts when the current value is zero too.
    fn count_valid(&self, previous: &[f64], current: &[f64]) -> usize {
        previous
            .iter()
            .zip(current)
            .filter(|(&p, &c)| {
                if p == 0.0 {
                    c == 0.0
                } else {
                    (c - p).abs() / p.abs() < self.config.threshold
                }
            })
            .count()
    }

    fn push_history(&mut self, values: &[f64]) {
        let window = self.config.median_window.max(1);
        for (history, &value) in self.histories.iter_mut().zip(values) {
            history.push_back(value);
            if history.len() > window {
                history.pop_front();
            }
        }
    }

    fn smooth(&mut self, values: &[f64]) -> Vec<f64> {
        self.push_history(values);

        let window = self.config.median_window.max(1);
        self.histories
            .iter()
            .zip(values)
            .map(|(history, &raw)| {
                if history.len() == window {
                    let window: Vec<f64> = history.iter().copied().collect();
                    stats::median(&window).unwrap_or(raw)
                } else {
                    raw
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: i64, v: [f64; 4]) -> Frame {
        Frame::new(t, v.to_vec())
    }

    fn accepted(outcome: FilterOutcome) -> Sample {
        match outcome {
            FilterOutcome::Accepted(sample) => sample,
            other => panic!("expected accept, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_frames_always_accepted() {
        let mut filter = StreamingNoiseFilter::new(NoiseFilterConfig::default(), 4);

        for values in [[10.0; 4], [0.0; 4], [-3.0, 0.0, 7.0, 100.0]] {
            filter.reset();
            for t in 0..50 {
                let sample = accepted(filter.accept(&frame(t, values)));
                assert_eq!(sample.index, t as u64);
                assert!(!sample.forced);
            }
        }
    }

    #[test]
    fn test_noisy_frame_rejected_without_consuming_index() {
        let mut filter = StreamingNoiseFilter::new(NoiseFilterConfig::default(), 4);

        accepted(filter.accept(&frame(0, [100.0, 100.0, 100.0, 100.0])));

        // Only one channel within threshold
        let outcome = filter.accept(&frame(10, [100.0, 900.0, 900.0, 900.0]));
        assert_eq!(
            outcome,
            FilterOutcome::Rejected {
                valid_channels: 1,
                consecutive: 1
            }
        );

        let sample = accepted(filter.accept(&frame(20, [101.0, 102.0, 99.0, 100.0])));
        assert_eq!(sample.index, 1);
        assert_eq!(filter.consecutive_rejections(), 0);
    }

    #[test]
    fn test_forced_accept_after_ceiling() {
        let config = NoiseFilterConfig {
            median_window: 1,
            ..Default::default()
        };
        let ceiling = config.rejection_ceiling;
        let mut filter = StreamingNoiseFilter::new(config, 4);

        accepted(filter.accept(&frame(0, [10.0; 4])));

        // Load applied: every channel jumps far beyond the threshold
        for i in 1..=ceiling {
            let outcome = filter.accept(&frame(i as i64, [500.0; 4]));
            assert!(matches!(outcome, FilterOutcome::Rejected { consecutive, .. } if consecutive == i));
        }

        let sample = accepted(filter.accept(&frame(99, [500.0; 4])));
        assert!(sample.forced);
        assert_eq!(sample.index, 1);
        assert_eq!(sample.channels, vec![500.0; 4]);
        assert_eq!(filter.consecutive_rejections(), 0);

        // The new level is now the reference
        assert!(!accepted(filter.accept(&frame(100, [505.0; 4]))).forced);
    }

    #[test]
    fn test_median_smoothing_after_warmup() {
        let config = NoiseFilterConfig {
            enabled: false,
            ..Default::default()
        };
        let mut filter = StreamingNoiseFilter::new(config, 4);

        let s0 = accepted(filter.accept(&frame(0, [1.0, 1.0, 1.0, 1.0])));
        let s1 = accepted(filter.accept(&frame(1, [9.0, 2.0, 2.0, 2.0])));
        let s2 = accepted(filter.accept(&frame(2, [2.0, 3.0, 3.0, 3.0])));
        let s3 = accepted(filter.accept(&frame(3, [3.0, 4.0, 4.0, 4.0])));

        // Warm-up passes raw values through
        assert_eq!(s0.channels[0], 1.0);
        assert_eq!(s1.channels[0], 9.0);
        // Median of [1, 9, 2] and [9, 2, 3]
        assert_eq!(s2.channels[0], 2.0);
        assert_eq!(s3.channels[0], 3.0);
        assert_eq!(s3.channels[1], 3.0);
    }

    #[test]
    fn test_history_policy_on_reject() {
        let mut every = StreamingNoiseFilter::new(
            NoiseFilterConfig {
                history_policy: HistoryPolicy::EveryFrame,
                ..Default::default()
            },
            4,
        );
        let mut accepted_only = StreamingNoiseFilter::new(NoiseFilterConfig::default(), 4);

        for filter in [&mut every, &mut accepted_only] {
            accepted(filter.accept(&frame(0, [10.0; 4])));
            accepted(filter.accept(&frame(1, [10.0; 4])));
            assert!(matches!(
                filter.accept(&frame(2, [1000.0; 4])),
                FilterOutcome::Rejected { .. }
            ));
        }

        // Window [10, 1000, 11] vs [10, 10, 11]
        let a = accepted(every.accept(&frame(3, [11.0; 4])));
        let b = accepted(accepted_only.accept(&frame(3, [11.0; 4])));
        assert_eq!(a.channels[0], 11.0);
        assert_eq!(b.channels[0], 10.0);
    }

    #[test]
    fn test_passthrough_keeps_raw_values() {
        let mut filter = StreamingNoiseFilter::new(NoiseFilterConfig::passthrough(), 4);

        accepted(filter.accept(&frame(0, [1.0; 4])));
        let sample = accepted(filter.accept(&frame(1, [1000.0, 2.0, 3.0, 4.0])));
        assert_eq!(sample.channels, vec![1000.0, 2.0, 3.0, 4.0]);
    }
}
