//! Live acquisition pipeline.
//!
//! One worker task reads lines from a [`LineSource`] and runs each through
//! parse → streaming noise filter → unit conversion, appending the
//! resulting [`Reading`]s to a [`SharedBuffer`]. The controller holds an
//! [`AcquisitionHandle`]: it can snapshot the buffer or subscribe to new
//! readings at any time, and ends the session by raising the stop flag
//! and joining the worker.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use forcetrace_core::{Error, ParseFailure, Reading, Result};

use crate::acquisition::{LineRead, LineSource};
use crate::calibration::CalibrationSet;
use crate::noise::{FilterOutcome, NoiseFilterConfig, StreamingNoiseFilter};
use crate::parser::{FrameParser, ParserConfig};

/// Longest permitted transport read before the stop flag is re-checked
pub const MAX_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Configuration for an acquisition session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frame grammar, including the channel count N
    pub parser: ParserConfig,

    pub noise: NoiseFilterConfig,

    /// Bound on a single transport read
    pub read_timeout: Duration,

    /// Readings buffered per live subscriber before it starts lagging
    pub broadcast_capacity: usize,

    /// Minimum spacing of per-frame drop diagnostics
    pub drop_log_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            noise: NoiseFilterConfig::default(),
            read_timeout: Duration::from_millis(100),
            broadcast_capacity: 1024,
            drop_log_interval: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    pub fn with_channels(channel_count: usize) -> Self {
        Self {
            parser: ParserConfig::with_channels(channel_count),
            ..Self::default()
        }
    }

    pub fn channel_count(&self) -> usize {
        self.parser.channel_count
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_count() == 0 {
            return Err(Error::Config("channel count must be at least 1".into()));
        }
        if self.read_timeout.is_zero() || self.read_timeout > MAX_READ_TIMEOUT {
            return Err(Error::Config(format!(
                "read timeout must be within 1..={} ms, got {} ms",
                MAX_READ_TIMEOUT.as_millis(),
                self.read_timeout.as_millis()
            )));
        }
        if !(self.noise.threshold > 0.0) {
            return Err(Error::Config("noise threshold must be positive".into()));
        }
        if self.noise.median_window == 0 || self.noise.median_window % 2 == 0 {
            return Err(Error::Config(format!(
                "median window must be odd and at least 1, got {}",
                self.noise.median_window
            )));
        }
        if self.broadcast_capacity == 0 {
            return Err(Error::Config("broadcast capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Monotone, shareable stop flag
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    raised: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown; idempotent, never cleared
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is raised
    pub async fn raised(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}

/// Append-only reading log with a single writer and snapshot readers
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<RwLock<Vec<Reading>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless `stop` is raised; the check and the append happen
    /// under the write lock
    fn append_unless_stopped(&self, reading: Reading, stop: &StopSignal) -> bool {
        let mut readings = self.inner.write();
        if stop.is_raised() {
            return false;
        }
        readings.push(reading);
        true
    }

    /// Raise `stop` while holding the write lock, so no append can land
    /// after it returns
    fn seal(&self, stop: &StopSignal) {
        let _guard = self.inner.write();
        stop.raise();
    }

    /// Copy of every reading appended so far
    pub fn snapshot(&self) -> Vec<Reading> {
        self.inner.read().clone()
    }

    /// Copy of the last `n` readings
    pub fn tail(&self, n: usize) -> Vec<Reading> {
        let readings = self.inner.read();
        readings[readings.len().saturating_sub(n)..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Live session counters
#[derive(Debug, Default)]
pub struct SessionStats {
    lines_read: AtomicU64,
    parse_failures: AtomicU64,
    noise_rejections: AtomicU64,
    forced_accepts: AtomicU64,
    readings: AtomicU64,
    time_regressions: AtomicU64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            noise_rejections: self.noise_rejections.load(Ordering::Relaxed),
            forced_accepts: self.forced_accepts.load(Ordering::Relaxed),
            readings: self.readings.load(Ordering::Relaxed),
            time_regressions: self.time_regressions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub lines_read: u64,
    pub parse_failures: u64,
    pub noise_rejections: u64,
    pub forced_accepts: u64,
    pub readings: u64,
    pub time_regressions: u64,
}

/// Rate-limited diagnostic for dropped frames
#[derive(Debug)]
struct DropLog {
    interval: Duration,
    last_logged: Option<Instant>,
    suppressed: u64,
}

impl DropLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: None,
            suppressed: 0,
        }
    }

    /// Log `detail` if the interval has passed, otherwise count it as
    /// suppressed; returns whether a line was logged
    fn record(&mut self, reason: &str, detail: &dyn fmt::Display) -> bool {
        let due = self
            .last_logged
            .map_or(true, |at| at.elapsed() >= self.interval);

        if due {
            tracing::info!(
                reason,
                suppressed = self.suppressed,
                "dropped frame: {}",
                detail
            );
            self.last_logged = Some(Instant::now());
            self.suppressed = 0;
        } else {
            self.suppressed += 1;
        }
        due
    }

    /// Summarize drops suppressed since the last logged one
    fn flush(&mut self) -> u64 {
        let suppressed = std::mem::take(&mut self.suppressed);
        if suppressed > 0 {
            tracing::info!(suppressed, "further frame drops not logged");
        }
        suppressed
    }
}

/// Step time relative to the previous accepted frame
#[derive(Debug, Clone, Default)]
pub struct StepClock {
    previous: Option<i64>,
}

impl StepClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to `device_time`; returns the step and whether time ran
    /// backwards (a device reset). Steps beyond the `i64` range saturate.
    pub fn step(&mut self, device_time: i64) -> (i64, bool) {
        let (step, regressed) = match self.previous {
            Some(prev) => (device_time.saturating_sub(prev), device_time < prev),
            None => (0, false),
        };
        self.previous = Some(device_time);
        (step, regressed)
    }
}

/// Synchronous parse → filter → convert step for one line
pub struct FramePipeline {
    parser: FrameParser,
    filter: StreamingNoiseFilter,
    calibration: CalibrationSet,
    clock: StepClock,
    stats: Arc<SessionStats>,
    drops: DropLog,
}

impl FramePipeline {
    pub fn new(config: &PipelineConfig, calibration: CalibrationSet) -> Result<Self> {
        config.validate()?;
        if calibration.channel_count() != config.channel_count() {
            return Err(Error::InvalidInput(format!(
                "calibration covers {} channels, session has {}",
                calibration.channel_count(),
                config.channel_count()
            )));
        }

        Ok(Self {
            parser: FrameParser::new(config.parser.clone()),
            filter: StreamingNoiseFilter::new(config.noise.clone(), config.channel_count()),
            calibration,
            clock: StepClock::new(),
            stats: Arc::new(SessionStats::default()),
            drops: DropLog::new(config.drop_log_interval),
        })
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Process one raw line; `None` when the line was dropped
    pub fn process_line(&mut self, line: &str) -> Option<Reading> {
        SessionStats::bump(&self.stats.lines_read);

        let frame = match self.parser.parse(line) {
            Ok(frame) => frame,
            Err(ParseFailure::Empty) => {
                SessionStats::bump(&self.stats.parse_failures);
                return None;
            }
            Err(failure) => {
                SessionStats::bump(&self.stats.parse_failures);
                self.drops.record("parse", &failure);
                return None;
            }
        };

        let sample = match self.filter.accept(&frame) {
            FilterOutcome::Accepted(sample) => sample,
            FilterOutcome::Rejected {
                valid_channels,
                consecutive,
            } => {
                SessionStats::bump(&self.stats.noise_rejections);
                self.drops.record(
                    "noise",
                    &format_args!(
                        "{} valid channels, {} consecutive rejections",
                        valid_channels, consecutive
                    ),
                );
                return None;
            }
        };

        if sample.forced {
            SessionStats::bump(&self.stats.forced_accepts);
            tracing::debug!(index = sample.index, "frame force-accepted after rejection run");
        }

        let (step_time, regressed) = self.clock.step(sample.device_time);
        if regressed {
            SessionStats::bump(&self.stats.time_regressions);
            tracing::warn!(
                index = sample.index,
                device_time = sample.device_time,
                step_time,
                "device time went backwards"
            );
        }

        Some(Reading {
            index: sample.index,
            device_time: sample.device_time,
            step_time,
            forces: self.calibration.convert_all(&sample.channels),
        })
    }

    /// Append a processed reading unless the session is stopping; only
    /// appended readings are counted
    fn commit(&self, reading: Reading, buffer: &SharedBuffer, stop: &StopSignal) -> bool {
        let appended = buffer.append_unless_stopped(reading, stop);
        if appended {
            SessionStats::bump(&self.stats.readings);
        }
        appended
    }

    fn finish(&mut self) {
        self.drops.flush();
    }
}

/// Result of a finished session
#[derive(Debug)]
pub struct SessionSummary {
    /// Every reading appended during the session, in order
    pub readings: Vec<Reading>,
    pub stats: StatsSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Why the worker ended early, if it did
    pub failure: Option<Error>,
}

impl SessionSummary {
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Entry point for live sessions
pub struct AcquisitionSession;

impl AcquisitionSession {
    /// Open `source` and start the worker.
    ///
    /// Fails without spawning anything when the configuration is invalid,
    /// the calibration does not match the channel count, or the source
    /// cannot be opened.
    pub async fn start<S>(
        mut source: S,
        calibration: CalibrationSet,
        config: PipelineConfig,
    ) -> Result<AcquisitionHandle>
    where
        S: LineSource + 'static,
    {
        let pipeline = FramePipeline::new(&config, calibration)?;
        source.open().await?;

        let stop = StopSignal::new();
        let buffer = SharedBuffer::new();
        let stats = pipeline.stats();
        let (events, _) = broadcast::channel(config.broadcast_capacity);

        tracing::info!(
            source = %source.describe(),
            channels = config.channel_count(),
            "acquisition started"
        );

        let worker = Worker {
            source,
            pipeline,
            stop: stop.clone(),
            buffer: buffer.clone(),
            events: events.clone(),
            read_timeout: config.read_timeout,
        };
        let task = tokio::spawn(worker.run());

        Ok(AcquisitionHandle {
            stop,
            buffer,
            stats,
            events,
            task,
            started_at: Utc::now(),
        })
    }
}

/// Controller side of a running session
pub struct AcquisitionHandle {
    stop: StopSignal,
    buffer: SharedBuffer,
    stats: Arc<SessionStats>,
    events: broadcast::Sender<Reading>,
    task: JoinHandle<Result<()>>,
    started_at: DateTime<Utc>,
}

impl AcquisitionHandle {
    /// Clone of the stop flag, for stop triggers living elsewhere
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Reader view of the session buffer
    pub fn buffer(&self) -> SharedBuffer {
        self.buffer.clone()
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        self.buffer.snapshot()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Receive each reading as it is appended. Slow receivers lag and
    /// lose readings; the worker never waits for them.
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The worker has exited (source exhausted, failed, or stopped)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Raise the stop flag and wait for the worker
    pub async fn stop(self) -> SessionSummary {
        self.buffer.seal(&self.stop);
        self.join().await
    }

    /// Wait for the worker to exit on its own
    pub async fn join(self) -> SessionSummary {
        let failure = match self.task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => Some(Error::Worker(e.to_string())),
        };
        // Late appends are impossible once the worker has exited
        self.stop.raise();

        let stats = self.stats.snapshot();
        let readings = self.buffer.snapshot();

        tracing::info!(
            readings = readings.len(),
            lines = stats.lines_read,
            parse_failures = stats.parse_failures,
            noise_rejections = stats.noise_rejections,
            forced_accepts = stats.forced_accepts,
            "acquisition finished"
        );

        SessionSummary {
            readings,
            stats,
            started_at: self.started_at,
            finished_at: Utc::now(),
            failure,
        }
    }
}

struct Worker<S> {
    source: S,
    pipeline: FramePipeline,
    stop: StopSignal,
    buffer: SharedBuffer,
    events: broadcast::Sender<Reading>,
    read_timeout: Duration,
}

impl<S: LineSource> Worker<S> {
    async fn run(mut self) -> Result<()> {
        let result = self.read_loop().await;

        if let Err(e) = &result {
            tracing::error!(error = %e, "acquisition worker failed");
        }
        if let Err(e) = self.source.close().await {
            tracing::warn!(error = %e, "failed to release transport");
        }
        self.pipeline.finish();

        result
    }

    async fn read_loop(&mut self) -> Result<()> {
        loop {
            if self.stop.is_raised() {
                return Ok(());
            }

            let read = tokio::select! {
                biased;
                _ = self.stop.raised() => return Ok(()),
                read = self.source.read_line(self.read_timeout) => read?,
            };

            match read {
                LineRead::Idle => continue,
                LineRead::Closed => {
                    tracing::info!("line source exhausted");
                    return Ok(());
                }
                LineRead::Line(line) => {
                    let Some(reading) = self.pipeline.process_line(&line) else {
                        continue;
                    };
                    if !self.pipeline.commit(reading.clone(), &self.buffer, &self.stop) {
                        return Ok(());
                    }
                    let _ = self.events.send(reading);
                }
            }
        }
    }
}
