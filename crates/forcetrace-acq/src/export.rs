//! CSV serialization of session data.
//!
//! Readings export as
//! `index,device_time_ms,step_time_ms,force_channel_1..N` with forces
//! rounded to 3 decimals and uncalibrated channels left empty. Raw frame
//! captures use the device's own column names, `Time,V1..VN`.

use std::path::Path;

use forcetrace_core::{ChannelId, Error, Frame, Reading, Result};

use crate::stats;

/// Decimal places kept for exported forces
pub const FORCE_DECIMALS: i32 = 3;

fn reading_header(channel_count: usize) -> Vec<String> {
    let mut header = vec![
        "index".to_string(),
        "device_time_ms".to_string(),
        "step_time_ms".to_string(),
    ];
    header.extend((1..=channel_count).map(|i| format!("force_channel_{}", i)));
    header
}

/// Write every reading to `path`.
///
/// An empty series fails with [`Error::NoData`] and leaves no file behind.
pub fn write_readings(path: &Path, readings: &[Reading]) -> Result<()> {
    let first = readings.first().ok_or(Error::NoData)?;
    let channel_count = first.channel_count();

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(reading_header(channel_count))?;

    for reading in readings {
        if reading.channel_count() != channel_count {
            return Err(Error::InvalidInput(format!(
                "reading {} has {} channels, expected {}",
                reading.index,
                reading.channel_count(),
                channel_count
            )));
        }

        let mut record = vec![
            reading.index.to_string(),
            reading.device_time.to_string(),
            reading.step_time.to_string(),
        ];
        record.extend(reading.forces.iter().map(|force| {
            force
                .map(|f| stats::round_to(f, FORCE_DECIMALS).to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    tracing::info!(path = %path.display(), rows = readings.len(), "readings exported");
    Ok(())
}

/// Write raw frames as `Time,V1..VN`
pub fn write_raw_frames(path: &Path, frames: &[Frame]) -> Result<()> {
    let first = frames.first().ok_or(Error::NoData)?;
    let channel_count = first.channel_count();

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["Time".to_string()];
    header.extend((0..channel_count).map(|i| ChannelId(i).label()));
    writer.write_record(&header)?;

    for frame in frames {
        let mut record = vec![frame.device_time.to_string()];
        record.extend(frame.channels.iter().map(f64::to_string));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    tracing::info!(path = %path.display(), rows = frames.len(), "raw frames exported");
    Ok(())
}

/// Frames from readings recorded through an identity calibration.
///
/// Absent values become NaN.
pub fn frames_from_readings(readings: &[Reading]) -> Vec<Frame> {
    readings
        .iter()
        .map(|r| {
            Frame::new(
                r.device_time,
                r.forces.iter().map(|f| f.unwrap_or(f64::NAN)).collect(),
            )
        })
        .collect()
}

/// Read a raw capture written by [`write_raw_frames`].
///
/// The channel count comes from the header; rows that do not parse are
/// skipped with a warning.
pub fn read_raw_frames(path: &Path) -> Result<Vec<Frame>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let header = reader.headers()?.clone();
    if header.get(0).map(str::trim) != Some("Time") || header.len() < 2 {
        return Err(Error::InvalidInput(format!(
            "{}: expected a `Time,V1..` header",
            path.display()
        )));
    }
    let channel_count = header.len() - 1;

    let mut frames = Vec::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record?;
        let time = record.get(0).and_then(|s| s.trim().parse::<i64>().ok());
        let channels: Option<Vec<f64>> = (1..=channel_count)
            .map(|i| record.get(i).and_then(|s| s.trim().parse::<f64>().ok()))
            .collect();

        match (time, channels) {
            (Some(time), Some(channels)) if record.len() == channel_count + 1 => {
                frames.push(Frame::new(time, channels));
            }
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!(path = %path.display(), skipped, "skipped malformed raw rows");
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn reading(index: u64, forces: Vec<Option<f64>>) -> Reading {
        Reading {
            index,
            device_time: index as i64 * 10,
            step_time: if index == 0 { 0 } else { 10 },
            forces,
        }
    }

    #[test]
    fn test_write_readings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");

        write_readings(
            &path,
            &[
                reading(0, vec![Some(1.23456), None]),
                reading(1, vec![Some(-0.0004), Some(21.0)]),
            ],
        )
        .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "index,device_time_ms,step_time_ms,force_channel_1,force_channel_2",
                "0,0,0,1.235,",
                "1,10,10,0,21",
            ]
        );
    }

    #[test]
    fn test_empty_session_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");

        assert!(matches!(write_readings(&path, &[]), Err(Error::NoData)));
        assert!(!path.exists());
    }

    #[test]
    fn test_raw_frames_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let frames = vec![
            Frame::new(0, vec![512.0, 13.5, -2.0]),
            Frame::new(12, vec![515.0, 14.0, -1.0]),
        ];

        write_raw_frames(&path, &frames).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("Time,V1,V2,V3"));
        assert_eq!(read_raw_frames(&path).unwrap(), frames);
    }

    #[test]
    fn test_frames_from_identity_readings() {
        let frames = frames_from_readings(&[reading(3, vec![Some(512.0), Some(7.5)])]);
        assert_eq!(frames, vec![Frame::new(30, vec![512.0, 7.5])]);
    }

    #[test]
    fn test_raw_reader_skips_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(&path, "Time,V1,V2\n0,1,2\nx,1,2\n5,1\n10,3,4\n").unwrap();

        let frames = read_raw_frames(&path).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Frame::new(10, vec![3.0, 4.0]));
    }

    #[test]
    fn test_raw_reader_rejects_foreign_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.csv");
        fs::write(&path, "a,b\n1,2\n").unwrap();

        assert!(matches!(read_raw_frames(&path), Err(Error::InvalidInput(_))));
    }
}
