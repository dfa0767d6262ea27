//! Subcommand implementations.
//!
//! Each command takes a validated [`AppConfig`]; the binary only parses
//! arguments and installs logging.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;

use forcetrace_acq::{
    frames_from_readings, read_raw_frames, reprocess, samples_from_readings, write_raw_frames,
    write_readings, AcquisitionHandle, AcquisitionSession, CalibrationFit, CalibrationLabel,
    CalibrationRecorder, CalibrationSet, LineSource, NoiseFilterConfig, ReprocessConfig,
    SerialLineSource, StopSignal,
};
use forcetrace_core::{ChannelId, Error, Reading, Result};

use crate::config::AppConfig;

/// Per-run options of the `acquire` command
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Stop automatically after this long
    pub duration: Option<Duration>,

    /// Skip noise rejection and calibration, export `Time,V1..VN`
    pub raw: bool,

    /// Export path; a timestamped name in the output directory otherwise
    pub output: Option<PathBuf>,

    /// Stop on Enter or Ctrl-C
    pub interactive: bool,
}

/// Calibration for the session: fitted from the dataset directory, or all
/// channels uncalibrated when the directory does not exist.
pub fn load_calibration(config: &AppConfig, channel_count: usize) -> Result<CalibrationSet> {
    let dir = &config.calibration.dir;
    if !dir.is_dir() {
        tracing::warn!(dir = %dir.display(), "calibration directory not found; all channels uncalibrated");
        return Ok(CalibrationSet::uncalibrated(channel_count));
    }

    let (set, _) = CalibrationSet::fit_directory(dir, config.calibration_degree()?, channel_count)?;
    Ok(set)
}

/// Open the configured serial port and run [`acquire_from`]
pub async fn acquire(config: &AppConfig, options: AcquireOptions) -> Result<Option<PathBuf>> {
    if config.serial.port.is_empty() {
        return Err(Error::Config(
            "serial.port is not set (use --port or FORCETRACE_SERIAL__PORT)".into(),
        ));
    }

    let source = SerialLineSource::new(config.serial_config());
    acquire_from(source, config, options).await
}

/// Run one acquisition session on `source` and export what it captured.
///
/// Returns the export path, or `None` when nothing was captured. A
/// transport failure still exports the partial session before it is
/// returned.
pub async fn acquire_from<S>(
    source: S,
    config: &AppConfig,
    options: AcquireOptions,
) -> Result<Option<PathBuf>>
where
    S: LineSource + 'static,
{
    let channels = config.acquisition.channels;
    let mut pipeline = config.pipeline_config();
    let calibration = if options.raw {
        pipeline.noise = NoiseFilterConfig::passthrough();
        CalibrationSet::identity(channels)
    } else {
        load_calibration(config, channels)?
    };

    let handle = AcquisitionSession::start(source, calibration, pipeline).await?;
    let stop = handle.stop_signal();

    if options.interactive {
        println!("Capturing. Press Enter or Ctrl-C to stop.");
        spawn_enter_watcher(stop.clone());
    }

    let deadline = options.duration.map(|d| Instant::now() + d);
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.acquisition.status_interval_ms));

    loop {
        tokio::select! {
            _ = stop.raised() => break,
            _ = ctrl_c(options.interactive) => {
                tracing::info!("interrupted");
                break;
            }
            _ = wait_until(deadline) => {
                tracing::info!("capture duration reached");
                break;
            }
            _ = ticker.tick() => {
                if handle.is_finished() {
                    break;
                }
                report_status(&handle);
            }
        }
    }

    let summary = handle.stop().await;
    if let Some(e) = &summary.failure {
        tracing::error!(error = %e, readings = summary.readings.len(), "acquisition ended early");
    }

    let exported = if summary.is_empty() {
        tracing::warn!("No data captured");
        None
    } else {
        let path = options
            .output
            .clone()
            .unwrap_or_else(|| timestamped_path(config, options.raw));
        if options.raw {
            write_raw_frames(&path, &frames_from_readings(&summary.readings))?;
        } else {
            write_readings(&path, &summary.readings)?;
        }
        Some(path)
    };

    match summary.failure {
        Some(e) => Err(e),
        None => Ok(exported),
    }
}

fn report_status(handle: &AcquisitionHandle) {
    let stats = handle.stats();
    match handle.buffer().tail(1).pop() {
        Some(latest) => tracing::info!(
            readings = stats.readings,
            dropped = stats.parse_failures + stats.noise_rejections,
            forces = ?latest.forces,
            "capturing"
        ),
        None => tracing::info!(lines = stats.lines_read, "waiting for frames"),
    }
}

fn timestamped_path(config: &AppConfig, raw: bool) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let kind = if raw { "_raw" } else { "" };
    config
        .output
        .dir
        .join(format!("{}{}_{}.csv", config.output.prefix, kind, stamp))
}

/// Stdin is read on a detached thread; a pending blocking read would
/// otherwise hold the runtime open at exit.
fn spawn_enter_watcher(stop: StopSignal) {
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        stop.raise();
    });
}

async fn ctrl_c(enabled: bool) {
    if enabled && tokio::signal::ctrl_c().await.is_ok() {
        return;
    }
    std::future::pending::<()>().await
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Interactive calibration of one sensor.
///
/// Records the unloaded board, then one batch per mass typed by the
/// operator, and writes the dataset into `dir`.
pub async fn calibrate(config: &AppConfig, label: &str, dir: &Path) -> Result<PathBuf> {
    let label = CalibrationLabel::parse(label)?;
    if config.serial.port.is_empty() {
        return Err(Error::Config(
            "serial.port is not set (use --port or FORCETRACE_SERIAL__PORT)".into(),
        ));
    }
    std::fs::create_dir_all(dir)?;

    let channels = config.acquisition.channels;
    let source = SerialLineSource::new(config.serial_config());
    let handle =
        AcquisitionSession::start(source, CalibrationSet::identity(channels), config.pipeline_config())
            .await?;

    let result = record_calibration(&handle, label, dir).await;
    let summary = handle.stop().await;

    match (result, summary.failure) {
        (Ok(path), None) => Ok(path),
        (Err(e), _) => Err(e),
        (Ok(_), Some(e)) => Err(e),
    }
}

async fn record_calibration(
    handle: &AcquisitionHandle,
    label: CalibrationLabel,
    dir: &Path,
) -> Result<PathBuf> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    println!("Remove all load. Press Enter to start the baseline, Enter again to end it.");
    let baseline = record_segment(handle, &mut input).await?;
    let mut recorder = CalibrationRecorder::new(label, &samples_from_readings(&baseline))?;

    loop {
        println!("Mass in kg (empty line to finish):");
        let Some(line) = input.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Ok(mass) = line.parse::<f64>() else {
            println!("`{}` is not a number", line);
            continue;
        };

        println!("Place {} kg. Press Enter once settled, Enter again to end.", mass);
        let segment = record_segment(handle, &mut input).await?;
        match recorder.add_mass(mass, &samples_from_readings(&segment)) {
            Ok(point) => println!(
                "{}: {:.3} N at raw {:.2}",
                recorder.channel().map(|c| c.label()).unwrap_or_default(),
                point.applied_force,
                point.raw_code
            ),
            Err(e) => println!("Mass not recorded: {}", e),
        }
    }

    recorder.save(dir)
}

/// Readings appended between the next two Enter presses
async fn record_segment<R>(
    handle: &AcquisitionHandle,
    input: &mut tokio::io::Lines<R>,
) -> Result<Vec<Reading>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    input.next_line().await?;
    let start = handle.len();
    input.next_line().await?;

    let readings: Vec<Reading> = handle.snapshot().into_iter().skip(start).collect();
    println!("{} readings recorded", readings.len());
    Ok(readings)
}

/// Fit every dataset in `dir`, returning the set and the per-channel fits.
///
/// Fit warnings reach the operator through the log only.
pub fn fit(config: &AppConfig, dir: &Path) -> Result<(CalibrationSet, Vec<CalibrationFit>)> {
    let channels = config.acquisition.channels;
    let (set, fits) = CalibrationSet::fit_directory(dir, config.calibration_degree()?, channels)?;

    for line in fit_report(&set, &fits) {
        println!("{}", line);
    }

    Ok((set, fits))
}

/// One line per channel: its fitted function, or `uncalibrated`
pub fn fit_report(set: &CalibrationSet, fits: &[CalibrationFit]) -> Vec<String> {
    (0..set.channel_count())
        .map(ChannelId)
        .map(|channel| match fits.iter().find(|f| f.channel == channel) {
            Some(fit) => format!("{}: force = {}", channel, fit.function),
            None => format!("{}: uncalibrated", channel),
        })
        .collect()
}

/// Condition a raw `Time,V1..VN` capture and export calibrated readings
pub fn reprocess_capture(
    config: &AppConfig,
    input: &Path,
    output: Option<&Path>,
    streaming: bool,
) -> Result<PathBuf> {
    let frames = read_raw_frames(input)?;
    let channels = frames.first().ok_or(Error::NoData)?.channel_count();

    let calibration = load_calibration(config, channels)?;
    let reprocess_config = ReprocessConfig {
        streaming: streaming.then(|| config.noise.clone()),
        ..ReprocessConfig::default()
    };
    let readings = reprocess(&frames, &calibration, &reprocess_config)?;

    let path = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "capture".to_string());
            input.with_file_name(format!("{}_conditioned.csv", stem))
        }
    };
    write_readings(&path, &readings)?;
    Ok(path)
}
