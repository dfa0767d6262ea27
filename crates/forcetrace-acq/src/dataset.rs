//! Calibration dataset storage.
//!
//! One CSV file per channel, two numeric columns (applied force in newtons,
//! mean raw code) under a header row. The channel is encoded in the file
//! name as a `V<n>` token, e.g. `AB_V3_calibration.csv` holds channel 3.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use forcetrace_core::{CalibrationPoint, ChannelId, Error, Result};

use crate::calibration::{self, CalibrationDegree, CalibrationFit, CalibrationSet};
use crate::stats;

/// One channel's stored calibration points
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationDataset {
    pub channel: ChannelId,
    pub path: PathBuf,
    pub points: Vec<CalibrationPoint>,
}

/// Channel named by the first `V<digits>` token of a file name
pub fn channel_from_file_name(name: &str) -> Option<ChannelId> {
    name.match_indices('V').find_map(|(pos, _)| {
        let digits: String = name[pos + 1..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if digits.is_empty() {
            return None;
        }
        ChannelId::from_label(&format!("V{}", digits))
    })
}

/// Read the points of one dataset file.
///
/// Rows with missing or non-numeric cells are skipped with a warning.
pub fn read_points(path: &Path) -> Result<Vec<CalibrationPoint>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut points = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let force = record.get(0).and_then(|s| s.trim().parse::<f64>().ok());
        let raw = record.get(1).and_then(|s| s.trim().parse::<f64>().ok());

        match (force, raw) {
            (Some(force), Some(raw)) if force.is_finite() && raw.is_finite() => {
                points.push(CalibrationPoint::new(force, raw));
            }
            _ => {
                tracing::warn!(
                    path = %path.display(),
                    row = row + 2,
                    "skipping non-numeric calibration row"
                );
            }
        }
    }

    Ok(points)
}

/// Write a dataset file, forces to 3 decimals and raw means to 2
pub fn write_points(path: &Path, channel: ChannelId, points: &[CalibrationPoint]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["Force_N".to_string(), format!("{}_mean", channel.label())])?;

    for point in points {
        writer.write_record([
            stats::round_to(point.applied_force, 3).to_string(),
            stats::round_to(point.raw_code, 2).to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Load every channel dataset found in a directory.
///
/// Files without a channel token are ignored. When two files name the same
/// channel, the one sorting last by file name wins.
pub fn load_directory(dir: &Path) -> Result<BTreeMap<ChannelId, CalibrationDataset>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::Storage(format!("read calibration dir {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut datasets = BTreeMap::new();
    for path in paths {
        let Some(channel) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(channel_from_file_name)
        else {
            tracing::debug!(path = %path.display(), "no channel token, ignoring");
            continue;
        };

        let points = read_points(&path)?;
        tracing::debug!(channel = %channel, points = points.len(), path = %path.display(), "loaded calibration dataset");

        let dataset = CalibrationDataset {
            channel,
            path,
            points,
        };
        if let Some(previous) = datasets.insert(channel, dataset) {
            tracing::warn!(
                channel = %channel,
                replaced = %previous.path.display(),
                "duplicate calibration dataset"
            );
        }
    }

    Ok(datasets)
}

impl CalibrationSet {
    /// Fit every channel dataset in `dir`.
    ///
    /// Channels with too little data, or outside the session's channel
    /// count, stay uncalibrated; the session still starts.
    pub fn fit_directory(
        dir: &Path,
        degree: CalibrationDegree,
        channel_count: usize,
    ) -> Result<(Self, Vec<CalibrationFit>)> {
        let mut set = Self::uncalibrated(channel_count);
        let mut fits = Vec::new();

        for (channel, dataset) in load_directory(dir)? {
            if channel.index() >= channel_count {
                tracing::warn!(channel = %channel, channel_count, "calibration dataset for unused channel");
                continue;
            }

            match calibration::fit(channel, &dataset.points, degree) {
                Ok(fit) => {
                    set.register(channel, fit.function)?;
                    fits.push(fit);
                }
                Err(e @ Error::InsufficientCalibrationData { .. }) => {
                    tracing::warn!(channel = %channel, "{}; channel stays uncalibrated", e);
                }
                Err(e) => return Err(e),
            }
        }

        if fits.is_empty() {
            tracing::warn!(dir = %dir.display(), "no channel could be calibrated");
        }

        Ok((set, fits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::ConversionFunction;
    use std::io::Write;

    #[test]
    fn test_channel_token() {
        assert_eq!(channel_from_file_name("AB_V3_calibration.csv"), Some(ChannelId(2)));
        assert_eq!(channel_from_file_name("AV_V1_calibration.csv"), Some(ChannelId(0)));
        assert_eq!(channel_from_file_name("V12.csv"), Some(ChannelId(11)));
        assert_eq!(channel_from_file_name("notes.csv"), None);
        assert_eq!(channel_from_file_name("V0.csv"), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("XY_V2_calibration.csv");
        let points = vec![
            CalibrationPoint::new(0.0, 101.2345),
            CalibrationPoint::new(4.905_000_1, 180.0),
        ];

        write_points(&path, ChannelId(1), &points).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Force_N,V2_mean"));

        let read = read_points(&path).unwrap();
        assert_eq!(read[0], CalibrationPoint::new(0.0, 101.23));
        assert_eq!(read[1], CalibrationPoint::new(4.905, 180.0));
    }

    #[test]
    fn test_bad_rows_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("V1.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "Force_N,V1_mean\n0,100\nabc,150\n9.81,\n9.81,200").unwrap();

        let points = read_points(&path).unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn test_fit_directory_partial() {
        let dir = tempfile::tempdir().unwrap();
        write_points(
            &dir.path().join("AB_V1_calibration.csv"),
            ChannelId(0),
            &[
                CalibrationPoint::new(0.0, 0.0),
                CalibrationPoint::new(9.81, 500.0),
            ],
        )
        .unwrap();
        // One point only: stays uncalibrated
        write_points(
            &dir.path().join("AB_V3_calibration.csv"),
            ChannelId(2),
            &[CalibrationPoint::new(0.0, 10.0)],
        )
        .unwrap();
        fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        let (set, fits) =
            CalibrationSet::fit_directory(dir.path(), CalibrationDegree::Linear, 4).unwrap();

        assert_eq!(fits.len(), 1);
        assert_eq!(set.calibrated_channels(), vec![ChannelId(0)]);
        match set.function(ChannelId(0)) {
            Some(ConversionFunction::Linear { slope, intercept }) => {
                assert!((slope - 0.01962).abs() < 1e-9);
                assert!(intercept.abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(load_directory(&missing), Err(Error::Storage(_))));
    }
}
