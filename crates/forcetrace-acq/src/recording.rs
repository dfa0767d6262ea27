//! Building calibration datasets from recorded sessions.
//!
//! A calibration run records the unloaded board first, then one batch of
//! samples per known mass placed on a single sensor. The sensor under test
//! is the channel that moved furthest from baseline under the first mass.

use std::path::{Path, PathBuf};

use forcetrace_core::{CalibrationPoint, ChannelId, Error, Reading, Result, Sample, STANDARD_GRAVITY};

use crate::dataset;
use crate::stats;

/// Two-character sensor label used in dataset file names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationLabel(String);

impl CalibrationLabel {
    pub fn parse(raw: &str) -> Result<Self> {
        let label = raw.trim().to_uppercase();
        if label.chars().count() != 2 {
            return Err(Error::InvalidInput(format!(
                "label must be exactly 2 characters, got `{}`",
                label
            )));
        }
        Ok(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Per-channel mean of a batch of samples
pub fn channel_means(samples: &[Sample]) -> Result<Vec<f64>> {
    let first = samples.first().ok_or(Error::NoData)?;
    let channel_count = first.channels.len();

    (0..channel_count)
        .map(|ch| {
            let values: Vec<f64> = samples
                .iter()
                .filter_map(|s| s.channels.get(ch).copied())
                .collect();
            stats::mean(&values).ok_or(Error::NoData)
        })
        .collect()
}

/// Samples back from readings captured through an identity calibration.
///
/// Readings carrying an absent value are dropped.
pub fn samples_from_readings(readings: &[Reading]) -> Vec<Sample> {
    readings
        .iter()
        .filter_map(|r| {
            let channels: Option<Vec<f64>> = r.forces.iter().copied().collect();
            channels.map(|channels| Sample {
                index: r.index,
                device_time: r.device_time,
                channels,
                forced: false,
            })
        })
        .collect()
}

/// Accumulates calibration points for one sensor
#[derive(Debug, Clone)]
pub struct CalibrationRecorder {
    label: CalibrationLabel,
    baseline: Vec<f64>,
    channel: Option<ChannelId>,
    points: Vec<CalibrationPoint>,
}

impl CalibrationRecorder {
    /// Start from samples recorded with no load on the board
    pub fn new(label: CalibrationLabel, baseline: &[Sample]) -> Result<Self> {
        let baseline = channel_means(baseline)?;
        tracing::info!(label = label.as_str(), ?baseline, "baseline recorded");

        Ok(Self {
            label,
            baseline,
            channel: None,
            points: Vec::new(),
        })
    }

    pub fn baseline(&self) -> &[f64] {
        &self.baseline
    }

    /// Sensor under test, known once the first mass is recorded
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Record samples taken with `mass_kg` on the sensor under test
    pub fn add_mass(&mut self, mass_kg: f64, samples: &[Sample]) -> Result<CalibrationPoint> {
        if !mass_kg.is_finite() || mass_kg < 0.0 {
            return Err(Error::InvalidInput(format!("invalid mass {} kg", mass_kg)));
        }

        let means = channel_means(samples)?;
        if means.len() != self.baseline.len() {
            return Err(Error::InvalidInput(format!(
                "expected {} channels, got {}",
                self.baseline.len(),
                means.len()
            )));
        }

        let channel = match self.channel {
            Some(channel) => channel,
            None => {
                let channel = self.most_deviating(&means);
                tracing::info!(channel = %channel, "sensor under test detected");
                self.channel = Some(channel);
                channel
            }
        };

        let point = CalibrationPoint::new(mass_kg * STANDARD_GRAVITY, means[channel.index()]);
        tracing::info!(channel = %channel, force = point.applied_force, raw = point.raw_code, "calibration point");
        self.points.push(point);
        Ok(point)
    }

    fn most_deviating(&self, means: &[f64]) -> ChannelId {
        let index = means
            .iter()
            .zip(&self.baseline)
            .map(|(m, b)| (m - b).abs())
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, d)| if d > best.1 { (i, d) } else { best })
            .0;
        ChannelId(index)
    }

    /// Baseline point followed by every recorded mass
    pub fn points(&self) -> Vec<CalibrationPoint> {
        let Some(channel) = self.channel else {
            return Vec::new();
        };

        std::iter::once(CalibrationPoint::new(0.0, self.baseline[channel.index()]))
            .chain(self.points.iter().copied())
            .collect()
    }

    /// `<LABEL>_V<n>_calibration.csv`
    pub fn file_name(&self) -> Option<String> {
        self.channel
            .map(|channel| format!("{}_{}_calibration.csv", self.label.as_str(), channel.label()))
    }

    /// Write the dataset into `dir`, returning the file path
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let (Some(channel), Some(name)) = (self.channel, self.file_name()) else {
            return Err(Error::NoData);
        };

        let path = dir.join(name);
        dataset::write_points(&path, channel, &self.points())?;
        tracing::info!(path = %path.display(), points = self.points.len() + 1, "calibration dataset saved");
        Ok(path)
    }
}
