//! Fundamental types for the forcetrace pipeline.
//!
//! Data moves through the pipeline as
//! `Frame` (parsed) → `Sample` (noise-filtered) → `Reading` (calibrated).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Standard gravity used to convert calibration masses to newtons.
pub const STANDARD_GRAVITY: f64 = 9.81;

/// Channel count of the reference four-sensor board.
pub const DEFAULT_CHANNEL_COUNT: usize = 4;

/// Zero-based channel identifier.
///
/// Displayed with the device's one-based label (`V1`, `V2`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub usize);

impl ChannelId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    /// Device label, e.g. `V1` for index 0
    pub fn label(&self) -> String {
        format!("V{}", self.0 + 1)
    }

    /// Parse a one-based device label such as `V3`
    pub fn from_label(label: &str) -> Option<Self> {
        let number: usize = label.strip_prefix('V')?.parse().ok()?;
        number.checked_sub(1).map(Self)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0 + 1)
    }
}

/// One parsed multi-channel record, before any filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Device clock in milliseconds
    pub device_time: i64,

    /// Raw sensor codes, one per channel
    pub channels: Vec<f64>,
}

impl Frame {
    pub fn new(device_time: i64, channels: Vec<f64>) -> Self {
        Self {
            device_time,
            channels,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// A frame that passed the streaming noise filter.
///
/// Values are still raw codes, smoothed once the filter history is warm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Gap-free sequence index; rejected frames never consume one
    pub index: u64,
    pub device_time: i64,
    pub channels: Vec<f64>,
    /// Accepted through the forced-accept escape rather than the validity check
    pub forced: bool,
}

/// A calibrated sample, the unit stored in the session buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub index: u64,
    pub device_time: i64,
    /// `device_time` minus the previous reading's, 0 for the first reading
    pub step_time: i64,
    /// Force per channel; `None` when the channel has no conversion function
    pub forces: Vec<Option<f64>>,
}

impl Reading {
    pub fn channel_count(&self) -> usize {
        self.forces.len()
    }
}

/// One weight/measurement pairing for a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Applied force in newtons
    pub applied_force: f64,
    /// Mean raw sensor code observed under that force
    pub raw_code: f64,
}

impl CalibrationPoint {
    pub fn new(applied_force: f64, raw_code: f64) -> Self {
        Self {
            applied_force,
            raw_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_labels() {
        assert_eq!(ChannelId::new(0).label(), "V1");
        assert_eq!(ChannelId::new(3).to_string(), "V4");
        assert_eq!(ChannelId::from_label("V2"), Some(ChannelId(1)));
        assert_eq!(ChannelId::from_label("V0"), None);
        assert_eq!(ChannelId::from_label("X1"), None);
    }
}
