//! Signal filters and the batch conditioning chain for completed series.
//!
//! The batch chain is non-causal: it runs once over a fully collected
//! channel series. Stages run in a fixed canonical order, each assuming
//! the conditioning done by the ones before it:
//!
//! 1. non-negativity gate (negative codes become missing)
//! 2. Hampel outlier replacement
//! 3. missing-value fill
//! 4. Savitzky-Golay smoothing with mirrored edges
//! 5. exponential averaging
//! 6. zero-phase Butterworth low-pass
//! 7. residual z-score clipping with interpolation
//!
//! Series carry `Option<f64>` so stages can mark and later fill gaps.
//! Dense stages (4-6) run independently over each contiguous run of
//! present values when gaps remain.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use forcetrace_core::{Error, Result};

use crate::linalg;
use crate::stats;

/// A channel series with gaps
pub type Series = Vec<Option<f64>>;

/// Butterworth low-pass filter (order 1 or 2), transposed direct form II
#[derive(Debug, Clone)]
pub struct ButterworthFilter {
    order: usize,
    cutoff_normalized: f64,
    a: Vec<f64>,
    b: Vec<f64>,
    state: Vec<f64>,
}

impl ButterworthFilter {
    /// Create a new Butterworth low-pass filter
    ///
    /// # Arguments
    /// * `order` - Filter order (1 or 2; anything else uses 2)
    /// * `cutoff_freq` - Cutoff frequency in Hz
    /// * `sample_rate` - Sampling rate in Hz
    pub fn new(order: usize, cutoff_freq: f64, sample_rate: f64) -> Self {
        Self::normalized(order, cutoff_freq / (sample_rate / 2.0))
    }

    /// Create from a cutoff expressed as a fraction of the Nyquist rate
    pub fn normalized(order: usize, cutoff_normalized: f64) -> Self {
        let cutoff_normalized = cutoff_normalized.clamp(1e-6, 1.0 - 1e-6);

        // Pre-warp the cutoff frequency for the bilinear transform
        let omega = (std::f64::consts::PI * cutoff_normalized / 2.0).tan();

        let (order, (a, b)) = match order {
            1 => (1, Self::coefficients_order1(omega)),
            _ => (2, Self::coefficients_order2(omega)),
        };

        Self {
            order,
            cutoff_normalized,
            state: vec![0.0; a.len() - 1],
            a,
            b,
        }
    }

    fn coefficients_order1(omega: f64) -> (Vec<f64>, Vec<f64>) {
        let k = omega / (1.0 + omega);
        let a = vec![1.0, -(1.0 - omega) / (1.0 + omega)];
        let b = vec![k, k];
        (a, b)
    }

    fn coefficients_order2(omega: f64) -> (Vec<f64>, Vec<f64>) {
        let omega_sq = omega * omega;
        let sqrt2 = std::f64::consts::SQRT_2;

        let denom = 1.0 + sqrt2 * omega + omega_sq;

        let a = vec![
            1.0,
            2.0 * (omega_sq - 1.0) / denom,
            (1.0 - sqrt2 * omega + omega_sq) / denom,
        ];

        let k = omega_sq / denom;
        let b = vec![k, 2.0 * k, k];

        (a, b)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn cutoff_normalized(&self) -> f64 {
        self.cutoff_normalized
    }

    /// Feedback coefficients, `a[0] == 1`
    pub fn a(&self) -> &[f64] {
        &self.a
    }

    /// Feed-forward coefficients
    pub fn b(&self) -> &[f64] {
        &self.b
    }

    /// Process a single sample through the filter
    pub fn filter(&mut self, x: f64) -> f64 {
        Self::step(&self.a, &self.b, &mut self.state, x)
    }

    /// Filter an entire signal from a zeroed state
    pub fn filter_signal(&mut self, signal: &[f64]) -> Vec<f64> {
        self.reset();
        signal.iter().map(|&x| self.filter(x)).collect()
    }

    /// Reset filter state
    pub fn reset(&mut self) {
        self.state.iter_mut().for_each(|s| *s = 0.0);
    }

    /// Forward-backward filtering with zero phase distortion.
    ///
    /// The signal is padded at both ends by odd reflection, and each pass
    /// starts from the filter's steady state for its first sample, so a
    /// constant input comes back unchanged.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        if n < 2 {
            return signal.to_vec();
        }

        let pad = (3 * self.a.len().max(self.b.len())).min(n - 1);
        let first = signal[0];
        let last = signal[n - 1];

        let mut extended = Vec::with_capacity(n + 2 * pad);
        extended.extend((1..=pad).rev().map(|k| 2.0 * first - signal[k]));
        extended.extend_from_slice(signal);
        extended.extend((1..=pad).map(|k| 2.0 * last - signal[n - 1 - k]));

        let zi = self.steady_state();

        let forward = self.run_from(&extended, &zi);
        let reversed: Vec<f64> = forward.into_iter().rev().collect();
        let backward = self.run_from(&reversed, &zi);

        backward.into_iter().rev().skip(pad).take(n).collect()
    }

    fn run_from(&self, signal: &[f64], zi: &[f64]) -> Vec<f64> {
        let x0 = signal.first().copied().unwrap_or(0.0);
        let mut state: Vec<f64> = zi.iter().map(|z| z * x0).collect();
        signal
            .iter()
            .map(|&x| Self::step(&self.a, &self.b, &mut state, x))
            .collect()
    }

    /// Initial state giving a unit-step steady state response
    fn steady_state(&self) -> Vec<f64> {
        let n = self.a.len() - 1;

        // I - companion(a)^T
        let mut system = DMatrix::<f64>::identity(n, n);
        for i in 0..n {
            system[(i, 0)] += self.a[i + 1];
            if i + 1 < n {
                system[(i, i + 1)] -= 1.0;
            }
        }

        let rhs = DVector::from_fn(n, |i, _| self.b[i + 1] - self.a[i + 1] * self.b[0]);

        system
            .lu()
            .solve(&rhs)
            .map(|zi| zi.iter().copied().collect())
            .unwrap_or_else(|| vec![0.0; n])
    }

    fn step(a: &[f64], b: &[f64], state: &mut [f64], x: f64) -> f64 {
        let n = state.len();
        let y = b[0] * x + state.first().copied().unwrap_or(0.0);

        for i in 0..n {
            let next = if i + 1 < n { state[i + 1] } else { 0.0 };
            state[i] = b[i + 1] * x - a[i + 1] * y + next;
        }

        y
    }
}

/// Exponential moving average (EMA) filter
#[derive(Debug, Clone)]
pub struct ExponentialFilter {
    alpha: f64,
    state: Option<f64>,
}

impl ExponentialFilter {
    /// Create new EMA filter
    ///
    /// # Arguments
    /// * `alpha` - Smoothing factor (0-1). Higher = less smoothing
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            state: None,
        }
    }

    pub fn filter(&mut self, x: f64) -> f64 {
        match self.state {
            Some(prev) => {
                let y = self.alpha * x + (1.0 - self.alpha) * prev;
                self.state = Some(y);
                y
            }
            None => {
                self.state = Some(x);
                x
            }
        }
    }

    pub fn filter_signal(&mut self, signal: &[f64]) -> Vec<f64> {
        self.state = None;
        signal.iter().map(|&x| self.filter(x)).collect()
    }

    pub fn reset(&mut self) {
        self.state = None;
    }
}

/// Savitzky-Golay filter for smoothing while preserving peaks
#[derive(Debug, Clone)]
pub struct SavitzkyGolayFilter {
    window_size: usize,
    poly_order: usize,
    coefficients: Vec<f64>,
}

impl SavitzkyGolayFilter {
    /// Create new Savitzky-Golay filter
    ///
    /// # Arguments
    /// * `window_size` - Must be odd and > poly_order
    /// * `poly_order` - Polynomial order (typically 2 or 3)
    pub fn new(window_size: usize, poly_order: usize) -> Result<Self> {
        if window_size % 2 == 0 {
            return Err(Error::Config(format!(
                "Savitzky-Golay window must be odd, got {}",
                window_size
            )));
        }
        if window_size <= poly_order {
            return Err(Error::Config(format!(
                "Savitzky-Golay window {} must exceed polynomial order {}",
                window_size, poly_order
            )));
        }

        let coefficients = Self::compute_coefficients(window_size, poly_order).ok_or_else(|| {
            Error::Config("Savitzky-Golay design matrix is singular".into())
        })?;

        Ok(Self {
            window_size,
            poly_order,
            coefficients,
        })
    }

    /// Convolution weights for the window center, via least squares
    fn compute_coefficients(window_size: usize, poly_order: usize) -> Option<Vec<f64>> {
        let half = (window_size / 2) as i32;
        let m = poly_order + 1;

        let x: Vec<f64> = (0..window_size).map(|i| (i as i32 - half) as f64).collect();
        let a = linalg::vandermonde(&x, poly_order);

        // Row 0 of (A^T A)^-1 A^T evaluates the fitted polynomial at x = 0
        let mut e0 = DVector::<f64>::zeros(m);
        e0[0] = 1.0;
        let v = (a.transpose() * &a).lu().solve(&e0)?;

        Some((a * v).iter().copied().collect())
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn poly_order(&self) -> usize {
        self.poly_order
    }

    /// Filter a signal, extending it by mirror reflection about each end
    pub fn filter_signal(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        if n < self.window_size {
            return signal.to_vec();
        }

        let half = (self.window_size / 2) as isize;
        let last = n as isize - 1;
        let mirror = |i: isize| -> f64 {
            let idx = if i < 0 {
                -i
            } else if i > last {
                2 * last - i
            } else {
                i
            };
            signal[idx as usize]
        };

        (0..n as isize)
            .map(|i| {
                self.coefficients
                    .iter()
                    .enumerate()
                    .map(|(j, &coef)| coef * mirror(i + j as isize - half))
                    .sum()
            })
            .collect()
    }
}

/// Replace interior points deviating from their window median by more than
/// `n_sigmas` robust standard deviations. Points within `half_width` of
/// either end are left untouched.
pub fn hampel(series: &[Option<f64>], half_width: usize, n_sigmas: f64) -> Series {
    let n = series.len();
    let mut result = series.to_vec();
    if half_width == 0 || n <= 2 * half_width {
        return result;
    }

    for i in half_width..(n - half_width) {
        let Some(value) = series[i] else { continue };

        let window: Vec<f64> = series[(i - half_width)..=(i + half_width)]
            .iter()
            .flatten()
            .copied()
            .collect();

        let Some(median) = stats::median(&window) else {
            continue;
        };
        let Some(mad) = stats::mad(&window, median) else {
            continue;
        };

        if (value - median).abs() > n_sigmas * stats::MAD_SCALE * mad {
            result[i] = Some(median);
        }
    }

    result
}

/// Fill interior gaps from the nearest present neighbour (earlier one on
/// ties), then extend the edges from the first and last present values.
pub fn fill_nearest(series: &[Option<f64>]) -> Series {
    let present: Vec<usize> = present_indices(series);
    let mut result = series.to_vec();

    for (left, right) in present.iter().zip(present.iter().skip(1)) {
        for i in (left + 1)..*right {
            let source = if i - left <= right - i { *left } else { *right };
            result[i] = series[source];
        }
    }

    fill_edges(&mut result, &present);
    result
}

/// Fill interior gaps by linear interpolation, then extend the edges
pub fn fill_linear(series: &[Option<f64>]) -> Series {
    let present: Vec<usize> = present_indices(series);
    let mut result = series.to_vec();

    for (&left, &right) in present.iter().zip(present.iter().skip(1)) {
        let (Some(y0), Some(y1)) = (series[left], series[right]) else {
            continue;
        };
        let span = (right - left) as f64;
        for i in (left + 1)..right {
            let t = (i - left) as f64 / span;
            result[i] = Some(y0 + t * (y1 - y0));
        }
    }

    fill_edges(&mut result, &present);
    result
}

/// Mark points more than `threshold` standard scores from the series mean
/// as missing. A constant series has no outliers.
pub fn zscore_mask(series: &[Option<f64>], threshold: f64) -> Series {
    let values: Vec<f64> = series.iter().flatten().copied().collect();
    let (Some(mu), Some(sigma)) = (stats::mean(&values), stats::std_dev(&values)) else {
        return series.to_vec();
    };
    if sigma <= f64::EPSILON * mu.abs().max(1.0) {
        return series.to_vec();
    }

    series
        .iter()
        .map(|v| v.filter(|x| ((x - mu) / sigma).abs() <= threshold))
        .collect()
}

fn present_indices(series: &[Option<f64>]) -> Vec<usize> {
    series
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|_| i))
        .collect()
}

/// Backward-fill the leading gap, forward-fill the trailing gap
fn fill_edges(series: &mut [Option<f64>], present: &[usize]) {
    let (Some(&first), Some(&last)) = (present.first(), present.last()) else {
        return;
    };
    let (head, tail) = (series[first], series[last]);
    series[..first].iter_mut().for_each(|v| *v = head);
    series[last + 1..].iter_mut().for_each(|v| *v = tail);
}

/// Apply a dense transform to every contiguous run of present values
fn map_runs<F>(series: &[Option<f64>], mut f: F) -> Series
where
    F: FnMut(&[f64]) -> Vec<f64>,
{
    let mut result = series.to_vec();
    let mut start = 0;

    while start < series.len() {
        if series[start].is_none() {
            start += 1;
            continue;
        }

        let end = series[start..]
            .iter()
            .position(Option::is_none)
            .map_or(series.len(), |p| start + p);

        let run: Vec<f64> = series[start..end].iter().flatten().copied().collect();
        for (slot, value) in result[start..end].iter_mut().zip(f(&run)) {
            *slot = Some(value);
        }

        start = end;
    }

    result
}

/// One conditioning stage of the batch chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ConditioningStage {
    NonNegativeGate,
    OutlierReplace { half_width: usize, n_sigmas: f64 },
    FillMissing,
    SavitzkyGolay { window: usize, poly_order: usize },
    Exponential { alpha: f64 },
    ZeroPhaseLowpass { order: usize, cutoff: f64 },
    ResidualClip { threshold: f64 },
}

impl ConditioningStage {
    /// Position in the canonical stage order
    pub fn rank(&self) -> u8 {
        match self {
            Self::NonNegativeGate => 1,
            Self::OutlierReplace { .. } => 2,
            Self::FillMissing => 3,
            Self::SavitzkyGolay { .. } => 4,
            Self::Exponential { .. } => 5,
            Self::ZeroPhaseLowpass { .. } => 6,
            Self::ResidualClip { .. } => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NonNegativeGate => "non_negative_gate",
            Self::OutlierReplace { .. } => "outlier_replace",
            Self::FillMissing => "fill_missing",
            Self::SavitzkyGolay { .. } => "savitzky_golay",
            Self::Exponential { .. } => "exponential",
            Self::ZeroPhaseLowpass { .. } => "zero_phase_lowpass",
            Self::ResidualClip { .. } => "residual_clip",
        }
    }

    /// Run this stage over a series; output has the input's length
    pub fn apply(&self, series: &[Option<f64>]) -> Result<Series> {
        let out: Series = match *self {
            Self::NonNegativeGate => series.iter().map(|v| v.filter(|x| *x >= 0.0)).collect(),
            Self::OutlierReplace {
                half_width,
                n_sigmas,
            } => hampel(series, half_width, n_sigmas),
            Self::FillMissing => fill_nearest(series),
            Self::SavitzkyGolay { window, poly_order } => {
                let sg = SavitzkyGolayFilter::new(window, poly_order)?;
                map_runs(series, |run| sg.filter_signal(run))
            }
            Self::Exponential { alpha } => {
                let mut ema = ExponentialFilter::new(alpha);
                map_runs(series, |run| ema.filter_signal(run))
            }
            Self::ZeroPhaseLowpass { order, cutoff } => {
                let lowpass = ButterworthFilter::normalized(order, cutoff);
                map_runs(series, |run| lowpass.filtfilt(run))
            }
            Self::ResidualClip { threshold } => fill_linear(&zscore_mask(series, threshold)),
        };

        Ok(out)
    }
}

/// Ordered list of conditioning stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditioningConfig {
    pub stages: Vec<ConditioningStage>,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl ConditioningConfig {
    /// The full seven-stage chain with the reference parameters
    pub fn standard() -> Self {
        Self {
            stages: vec![
                ConditioningStage::NonNegativeGate,
                ConditioningStage::OutlierReplace {
                    half_width: 5,
                    n_sigmas: 3.0,
                },
                ConditioningStage::FillMissing,
                ConditioningStage::SavitzkyGolay {
                    window: 7,
                    poly_order: 2,
                },
                ConditioningStage::Exponential { alpha: 0.2 },
                ConditioningStage::ZeroPhaseLowpass {
                    order: 2,
                    cutoff: 0.1,
                },
                ConditioningStage::ResidualClip { threshold: 3.0 },
            ],
        }
    }

    /// Stages must follow the canonical order, each at most once
    pub fn validate(&self) -> Result<()> {
        for pair in self.stages.windows(2) {
            if pair[1].rank() <= pair[0].rank() {
                return Err(Error::Config(format!(
                    "conditioning stage `{}` cannot follow `{}`",
                    pair[1].name(),
                    pair[0].name()
                )));
            }
        }

        for stage in &self.stages {
            match *stage {
                ConditioningStage::SavitzkyGolay { window, poly_order } => {
                    SavitzkyGolayFilter::new(window, poly_order)?;
                }
                ConditioningStage::Exponential { alpha } if !(alpha > 0.0 && alpha <= 1.0) => {
                    return Err(Error::Config(format!("EMA alpha {} outside (0, 1]", alpha)));
                }
                ConditioningStage::ZeroPhaseLowpass { cutoff, .. }
                    if !(cutoff > 0.0 && cutoff < 1.0) =>
                {
                    return Err(Error::Config(format!(
                        "low-pass cutoff {} outside (0, 1)",
                        cutoff
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Runs a validated conditioning chain over completed channel series
#[derive(Debug, Clone)]
pub struct BatchConditioner {
    config: ConditioningConfig,
}

impl BatchConditioner {
    pub fn new(config: ConditioningConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ConditioningConfig {
        &self.config
    }

    /// Condition one raw channel series
    pub fn condition(&self, raw: &[f64]) -> Result<Series> {
        let mut series: Series = raw.iter().copied().map(Some).collect();
        for stage in &self.config.stages {
            series = stage.apply(&series)?;
            tracing::trace!(stage = stage.name(), len = series.len(), "conditioning stage applied");
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(series: &Series) -> Vec<f64> {
        series.iter().map(|v| v.expect("dense series")).collect()
    }

    #[test]
    fn test_butterworth_dc() {
        let mut filter = ButterworthFilter::new(2, 10.0, 100.0);

        // DC signal should pass through (approximately)
        let dc_signal = vec![1.0; 100];
        let filtered = filter.filter_signal(&dc_signal);

        // After settling, output should approach input
        let last_10_avg: f64 = filtered[90..].iter().sum::<f64>() / 10.0;
        assert!((last_10_avg - 1.0).abs() < 0.05, "DC should pass through");
    }

    #[test]
    fn test_butterworth_matches_reference_design() {
        // butter(2, 0.1)
        let filter = ButterworthFilter::normalized(2, 0.1);
        let b = [0.020083365564211, 0.040166731128423, 0.020083365564211];
        let a = [1.0, -1.561018075800718, 0.641351538057563];
        for (x, y) in filter.b().iter().zip(b) {
            assert!((x - y).abs() < 1e-8);
        }
        for (x, y) in filter.a().iter().zip(a) {
            assert!((x - y).abs() < 1e-8);
        }
    }

    #[test]
    fn test_filtfilt_preserves_constant() {
        let filter = ButterworthFilter::normalized(2, 0.1);
        let out = filter.filtfilt(&[42.0; 30]);
        assert!(out.iter().all(|v| (v - 42.0).abs() < 1e-9));
    }

    #[test]
    fn test_filtfilt_twice_is_near_idempotent() {
        let filter = ButterworthFilter::normalized(2, 0.1);
        let signal: Vec<f64> = (0..400)
            .map(|i| {
                let t = i as f64;
                (2.0 * std::f64::consts::PI * t / 200.0).sin()
                    + if i % 3 == 0 { 0.3 } else { -0.15 }
            })
            .collect();

        let once = filter.filtfilt(&signal);
        let twice = filter.filtfilt(&once);

        let change: Vec<f64> = once.iter().zip(&twice).map(|(a, b)| (a - b).abs()).collect();

        // Edge transients settle within a few dozen samples
        let interior = change[20..380].iter().copied().fold(0.0, f64::max);
        let overall = change.iter().copied().fold(0.0, f64::max);
        assert!(interior < 0.01, "interior change {}", interior);
        assert!(overall < 0.1, "edge change {}", overall);
    }

    #[test]
    fn test_exponential_filter() {
        let mut ema = ExponentialFilter::new(0.2);
        let out = ema.filter_signal(&[10.0, 20.0, 20.0]);
        assert_eq!(out[0], 10.0);
        assert!((out[1] - 12.0).abs() < 1e-12);
        assert!((out[2] - 13.6).abs() < 1e-12);
    }

    #[test]
    fn test_savitzky_golay_coefficients() {
        let sg = SavitzkyGolayFilter::new(7, 2).unwrap();
        let expected = [-2.0, 3.0, 6.0, 7.0, 6.0, 3.0, -2.0].map(|x| x / 21.0);
        for (c, e) in sg.coefficients().iter().zip(expected) {
            assert!((c - e).abs() < 1e-12);
        }

        assert!(SavitzkyGolayFilter::new(6, 2).is_err());
        assert!(SavitzkyGolayFilter::new(3, 3).is_err());
    }

    #[test]
    fn test_savitzky_golay_preserves_quadratic() {
        let sg = SavitzkyGolayFilter::new(7, 2).unwrap();
        let signal: Vec<f64> = (0..20).map(|i| 0.5 * (i as f64).powi(2) - i as f64).collect();
        let filtered = sg.filter_signal(&signal);

        // Interior points reproduce the quadratic exactly
        for i in 3..17 {
            assert!((filtered[i] - signal[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_savitzky_golay() {
        let filter = SavitzkyGolayFilter::new(5, 2).unwrap();

        // Signal with noise
        let signal: Vec<f64> = (0..20)
            .map(|i| (i as f64) + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();

        let filtered = filter.filter_signal(&signal);

        // Smoothed signal should have less variation
        let var_original: f64 = signal.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
        let var_filtered: f64 = filtered.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();

        assert!(var_filtered < var_original, "SG filter should reduce noise");
    }

    #[test]
    fn test_hampel_replaces_interior_outlier_only() {
        let mut data: Series = vec![Some(1.0); 20];
        data[10] = Some(100.0);
        data[1] = Some(100.0);

        let filtered = hampel(&data, 5, 3.0);

        assert_eq!(filtered[10], Some(1.0));
        // Boundary point untouched
        assert_eq!(filtered[1], Some(100.0));
    }

    #[test]
    fn test_fill_nearest_and_edges() {
        let series = vec![None, Some(1.0), None, None, None, Some(5.0), None];
        let filled = fill_nearest(&series);
        assert_eq!(
            filled,
            vec![Some(1.0), Some(1.0), Some(1.0), Some(1.0), Some(5.0), Some(5.0), Some(5.0)]
        );
    }

    #[test]
    fn test_fill_linear() {
        let series = vec![None, Some(0.0), None, None, Some(3.0)];
        let filled = fill_linear(&series);
        assert_eq!(dense(&filled), vec![0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zscore_mask() {
        let mut series: Series = (0..30).map(|i| Some((i % 3) as f64)).collect();
        series[15] = Some(500.0);
        let masked = zscore_mask(&series, 3.0);
        assert_eq!(masked[15], None);
        assert_eq!(masked.iter().filter(|v| v.is_none()).count(), 1);

        let flat = vec![Some(2.0); 10];
        assert_eq!(zscore_mask(&flat, 3.0), flat);
    }

    #[test]
    fn test_stage_order_enforced() {
        let bad = ConditioningConfig {
            stages: vec![
                ConditioningStage::Exponential { alpha: 0.2 },
                ConditioningStage::FillMissing,
            ],
        };
        assert!(bad.validate().is_err());
        assert!(ConditioningConfig::standard().validate().is_ok());
    }

    #[test]
    fn test_standard_chain_output_length_and_gaps() {
        let conditioner = BatchConditioner::new(ConditioningConfig::standard()).unwrap();

        let mut raw: Vec<f64> = (0..120).map(|i| 500.0 + 20.0 * (i as f64 / 15.0).sin()).collect();
        raw[40] = -1.0;
        raw[70] = 50_000.0;

        let out = conditioner.condition(&raw).unwrap();
        assert_eq!(out.len(), raw.len());
        let values = dense(&out);

        // Negative code and spike both absorbed
        assert!(values.iter().all(|v| *v > 400.0 && *v < 600.0));
    }

    #[test]
    fn test_all_negative_series_stays_missing() {
        let conditioner = BatchConditioner::new(ConditioningConfig::standard()).unwrap();
        let out = conditioner.condition(&[-1.0; 10]).unwrap();
        assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn test_dense_stage_runs_per_segment() {
        let stage = ConditioningStage::Exponential { alpha: 0.5 };
        let out = stage
            .apply(&[Some(0.0), Some(2.0), None, Some(10.0), Some(20.0)])
            .unwrap();
        assert_eq!(out, vec![Some(0.0), Some(1.0), None, Some(10.0), Some(15.0)]);
    }
}
