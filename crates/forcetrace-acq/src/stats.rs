//! Small robust-statistics helpers shared by the streaming and batch filters.

use std::cmp::Ordering;

/// Scale factor turning a median absolute deviation into a standard
/// deviation estimate for normally distributed data.
pub const MAD_SCALE: f64 = 1.4826;

/// Median of a slice; `None` for an empty slice
pub fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median absolute deviation around `center`
pub fn mad(data: &[f64], center: f64) -> Option<f64> {
    let deviations: Vec<f64> = data.iter().map(|&x| (x - center).abs()).collect();
    median(&deviations)
}

pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        None
    } else {
        Some(data.iter().sum::<f64>() / data.len() as f64)
    }
}

/// Population standard deviation
pub fn std_dev(data: &[f64]) -> Option<f64> {
    let mu = mean(data)?;
    let var = data.iter().map(|&x| (x - mu).powi(2)).sum::<f64>() / data.len() as f64;
    Some(var.sqrt())
}

/// Round half away from zero to `decimals` places; never returns -0.0
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}
