//! Offline reprocessing of a completed capture.
//!
//! The batch path optionally runs the streaming noise filter first, then
//! conditions each channel series as a whole and converts the result. It
//! produces [`Reading`]s with the same index and step-time rules as a live
//! session, so both paths export identically.

use serde::{Deserialize, Serialize};

use forcetrace_core::{ChannelId, Error, Frame, Reading, Result};

use crate::calibration::CalibrationSet;
use crate::filtering::{BatchConditioner, ConditioningConfig};
use crate::noise::{FilterOutcome, NoiseFilterConfig, StreamingNoiseFilter};
use crate::pipeline::StepClock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprocessConfig {
    /// Streaming filter applied before batch conditioning, if any
    pub streaming: Option<NoiseFilterConfig>,

    pub conditioning: ConditioningConfig,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            streaming: None,
            conditioning: ConditioningConfig::standard(),
        }
    }
}

/// Condition and convert a full capture
pub fn reprocess(
    frames: &[Frame],
    calibration: &CalibrationSet,
    config: &ReprocessConfig,
) -> Result<Vec<Reading>> {
    let channel_count = calibration.channel_count();
    if let Some(bad) = frames.iter().find(|f| f.channel_count() != channel_count) {
        return Err(Error::InvalidInput(format!(
            "frame at {} ms has {} channels, expected {}",
            bad.device_time,
            bad.channel_count(),
            channel_count
        )));
    }

    let conditioner = BatchConditioner::new(config.conditioning.clone())?;

    // (index, device_time, raw channels) after the optional streaming pass
    let rows: Vec<(u64, i64, Vec<f64>)> = match &config.streaming {
        Some(noise) => {
            let mut filter = StreamingNoiseFilter::new(noise.clone(), channel_count);
            frames
                .iter()
                .filter_map(|frame| match filter.accept(frame) {
                    FilterOutcome::Accepted(s) => Some((s.index, s.device_time, s.channels)),
                    FilterOutcome::Rejected { .. } => None,
                })
                .collect()
        }
        None => frames
            .iter()
            .enumerate()
            .map(|(i, f)| (i as u64, f.device_time, f.channels.clone()))
            .collect(),
    };

    let conditioned: Vec<Vec<Option<f64>>> = (0..channel_count)
        .map(|ch| {
            let series: Vec<f64> = rows.iter().map(|(_, _, values)| values[ch]).collect();
            conditioner.condition(&series)
        })
        .collect::<Result<_>>()?;

    let mut clock = StepClock::new();
    let readings: Vec<Reading> = rows
        .iter()
        .enumerate()
        .map(|(row, &(index, device_time, _))| {
            let (step_time, _) = clock.step(device_time);
            let forces = conditioned
                .iter()
                .enumerate()
                .map(|(ch, series)| {
                    series[row].and_then(|raw| calibration.convert(ChannelId(ch), raw))
                })
                .collect();

            Reading {
                index,
                device_time,
                step_time,
                forces,
            }
        })
        .collect();

    tracing::info!(
        frames = frames.len(),
        readings = readings.len(),
        stages = config.conditioning.stages.len(),
        "capture reprocessed"
    );

    Ok(readings)
}
