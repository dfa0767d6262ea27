//! Polynomial calibration: fitting raw codes to force and applying the fit.
//!
//! Each channel gets at most one [`ConversionFunction`] per session,
//! fitted by ordinary least squares over that channel's
//! [`CalibrationPoint`]s. A [`CalibrationSet`] holds the functions for all
//! channels and is handed to the acquisition core by the caller.

use forcetrace_core::{CalibrationPoint, ChannelId, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::linalg;
use crate::stats;

/// Intercept magnitude (newtons) above which a linear fit is suspicious
pub const INTERCEPT_WARNING_THRESHOLD: f64 = 5.0;

/// Polynomial degree of a calibration fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationDegree {
    Linear,
    Quadratic,
}

impl CalibrationDegree {
    pub fn degree(&self) -> usize {
        match self {
            Self::Linear => 1,
            Self::Quadratic => 2,
        }
    }

    /// Distinct raw codes needed for a determined fit
    pub fn required_points(&self) -> usize {
        self.degree() + 1
    }

    pub fn from_degree(degree: usize) -> Option<Self> {
        match degree {
            1 => Some(Self::Linear),
            2 => Some(Self::Quadratic),
            _ => None,
        }
    }
}

/// Raw code to force mapping for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversionFunction {
    Linear { slope: f64, intercept: f64 },
    Quadratic { a: f64, b: f64, c: f64 },
}

impl ConversionFunction {
    /// Evaluate the polynomial at a raw code
    pub fn evaluate(&self, raw: f64) -> f64 {
        match *self {
            Self::Linear { slope, intercept } => slope * raw + intercept,
            Self::Quadratic { a, b, c } => a * raw * raw + b * raw + c,
        }
    }

    pub fn degree(&self) -> CalibrationDegree {
        match self {
            Self::Linear { .. } => CalibrationDegree::Linear,
            Self::Quadratic { .. } => CalibrationDegree::Quadratic,
        }
    }

    pub fn is_finite(&self) -> bool {
        match *self {
            Self::Linear { slope, intercept } => slope.is_finite() && intercept.is_finite(),
            Self::Quadratic { a, b, c } => a.is_finite() && b.is_finite() && c.is_finite(),
        }
    }

    /// Constant term, the force predicted for a raw code of zero
    pub fn intercept(&self) -> f64 {
        match *self {
            Self::Linear { intercept, .. } => intercept,
            Self::Quadratic { c, .. } => c,
        }
    }
}

impl fmt::Display for ConversionFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Linear { slope, intercept } => {
                write!(f, "F = {:.6} * x + {:.4}", slope, intercept)
            }
            Self::Quadratic { a, b, c } => {
                write!(f, "F = {:.6e} * x^2 + {:.6} * x + {:.4}", a, b, c)
            }
        }
    }
}

/// Non-fatal sanity findings reported with a fit
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationWarning {
    /// No point with zero applied force
    MissingBaseline,
    /// Linear fit intercept exceeds [`INTERCEPT_WARNING_THRESHOLD`]
    LargeIntercept { intercept: f64 },
}

impl fmt::Display for CalibrationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBaseline => write!(f, "no zero-force baseline point; expect an offset"),
            Self::LargeIntercept { intercept } => write!(
                f,
                "large intercept {:.3} N (limit {} N); check the calibration",
                intercept, INTERCEPT_WARNING_THRESHOLD
            ),
        }
    }
}

/// A fitted function plus the warnings raised while fitting it
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationFit {
    pub channel: ChannelId,
    pub function: ConversionFunction,
    pub warnings: Vec<CalibrationWarning>,
}

/// Least-squares fit of force against raw code for one channel.
///
/// Fails with [`Error::InsufficientCalibrationData`] when fewer distinct
/// raw codes than `degree + 1` are supplied. Sanity warnings are logged
/// once here and returned with the fit.
pub fn fit(
    channel: ChannelId,
    points: &[CalibrationPoint],
    degree: CalibrationDegree,
) -> Result<CalibrationFit> {
    let required = degree.required_points();
    let available = distinct_raw_codes(points);
    if available < required {
        return Err(Error::InsufficientCalibrationData {
            channel: channel.label(),
            required,
            available,
        });
    }

    let raw: Vec<f64> = points.iter().map(|p| p.raw_code).collect();
    let force: Vec<f64> = points.iter().map(|p| p.applied_force).collect();

    // Raw codes sit around 10^2..10^4; centre and scale before the normal
    // equations, then expand back to raw-code coefficients.
    let center = stats::mean(&raw).unwrap_or(0.0);
    let scale = stats::std_dev(&raw)
        .filter(|s| *s > 0.0)
        .unwrap_or(1.0);
    let scaled: Vec<f64> = raw.iter().map(|x| (x - center) / scale).collect();

    let coeffs = linalg::polyfit(&scaled, &force, degree.degree()).ok_or_else(|| {
        Error::InvalidInput(format!("calibration fit for {} is ill-conditioned", channel))
    })?;

    let function = match degree {
        CalibrationDegree::Linear => {
            let slope = coeffs[1] / scale;
            ConversionFunction::Linear {
                slope,
                intercept: coeffs[0] - slope * center,
            }
        }
        CalibrationDegree::Quadratic => {
            let a = coeffs[2] / (scale * scale);
            let b = coeffs[1] / scale - 2.0 * a * center;
            let c = coeffs[0] - coeffs[1] * center / scale + a * center * center;
            ConversionFunction::Quadratic { a, b, c }
        }
    };

    if !function.is_finite() {
        return Err(Error::InvalidInput(format!(
            "calibration fit for {} produced non-finite coefficients",
            channel
        )));
    }

    let mut warnings = Vec::new();
    if !points.iter().any(|p| p.applied_force == 0.0) {
        warnings.push(CalibrationWarning::MissingBaseline);
    }
    if let ConversionFunction::Linear { intercept, .. } = function {
        if intercept.abs() > INTERCEPT_WARNING_THRESHOLD {
            warnings.push(CalibrationWarning::LargeIntercept { intercept });
        }
    }

    tracing::info!(channel = %channel, points = points.len(), "fitted {}", function);
    for warning in &warnings {
        tracing::warn!(channel = %channel, "calibration: {}", warning);
    }

    Ok(CalibrationFit {
        channel,
        function,
        warnings,
    })
}

fn distinct_raw_codes(points: &[CalibrationPoint]) -> usize {
    let mut raw: Vec<f64> = points
        .iter()
        .map(|p| p.raw_code)
        .filter(|x| x.is_finite())
        .collect();
    raw.sort_by(|a, b| a.total_cmp(b));
    raw.dedup();
    raw.len()
}

/// Conversion functions for every channel of a session.
///
/// Channels without a function stay uncalibrated: their forces are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    functions: Vec<Option<ConversionFunction>>,
}

impl CalibrationSet {
    /// All channels uncalibrated
    pub fn uncalibrated(channel_count: usize) -> Self {
        Self {
            functions: vec![None; channel_count],
        }
    }

    /// Every channel mapped through `F = x`, so readings carry raw codes
    pub fn identity(channel_count: usize) -> Self {
        let unit = ConversionFunction::Linear {
            slope: 1.0,
            intercept: 0.0,
        };
        Self {
            functions: vec![Some(unit); channel_count],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.functions.len()
    }

    /// Register a channel's function, replacing any earlier one
    pub fn register(&mut self, channel: ChannelId, function: ConversionFunction) -> Result<()> {
        let count = self.functions.len();
        let slot = self.functions.get_mut(channel.index()).ok_or_else(|| {
            Error::InvalidInput(format!(
                "channel {} outside session of {} channels",
                channel, count
            ))
        })?;
        *slot = Some(function);
        Ok(())
    }

    pub fn with(mut self, channel: ChannelId, function: ConversionFunction) -> Result<Self> {
        self.register(channel, function)?;
        Ok(self)
    }

    pub fn function(&self, channel: ChannelId) -> Option<&ConversionFunction> {
        self.functions.get(channel.index()).and_then(Option::as_ref)
    }

    pub fn is_calibrated(&self, channel: ChannelId) -> bool {
        self.function(channel).is_some()
    }

    /// Channels that have a function
    pub fn calibrated_channels(&self) -> Vec<ChannelId> {
        self.functions
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|_| ChannelId(i)))
            .collect()
    }

    /// Force for one raw code; `None` when the channel is uncalibrated
    pub fn convert(&self, channel: ChannelId, raw: f64) -> Option<f64> {
        self.function(channel).map(|f| f.evaluate(raw))
    }

    /// Convert one value per channel, in channel order
    pub fn convert_all(&self, raw: &[f64]) -> Vec<Option<f64>> {
        raw.iter()
            .enumerate()
            .map(|(i, &x)| self.convert(ChannelId(i), x))
            .collect()
    }
}
