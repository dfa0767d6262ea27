//! Line transports feeding the acquisition core.
//!
//! The sensor board streams newline-terminated text records. This module
//! provides the [`LineSource`] abstraction the acquisition worker reads
//! from, with two backends:
//!
//! - [`SerialLineSource`] for the USB/UART link to the board
//! - [`ReplayLineSource`] replaying recorded or scripted lines

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use forcetrace_core::{Error, Result};

/// Outcome of one time-bounded read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// Nothing arrived before the deadline
    Idle,
    /// The source is exhausted or was closed
    Closed,
}

/// Trait for line-oriented transports
#[async_trait]
pub trait LineSource: Send {
    /// Acquire the underlying transport
    async fn open(&mut self) -> Result<()>;

    /// Wait for the next line; `None` once the source is exhausted.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no data.
    async fn recv_line(&mut self) -> Result<Option<String>>;

    /// Release the transport. Further reads report [`LineRead::Closed`].
    async fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Human-readable endpoint name for logs
    fn describe(&self) -> String;

    /// Read one line, giving up after `timeout`
    async fn read_line(&mut self, timeout: Duration) -> Result<LineRead> {
        match tokio::time::timeout(timeout, self.recv_line()).await {
            Err(_) => Ok(LineRead::Idle),
            Ok(Ok(Some(line))) => Ok(LineRead::Line(line)),
            Ok(Ok(None)) => Ok(LineRead::Closed),
            Ok(Err(e)) => Err(e),
        }
    }
}

/// Split complete lines off the front of a receive buffer.
///
/// Partial trailing data stays in `buffer` for the next read. Invalid
/// UTF-8 is replaced rather than rejected; the parser drops such lines.
pub fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&raw);
        lines.push(text.trim_end_matches(['\r', '\n']).to_string());
    }
    lines
}

/// Splits a byte stream into lines, dropping any line longer than
/// `max_len` bytes instead of buffering it without bound
#[derive(Debug)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    max_len: usize,
    discarding: bool,
    dropped: u64,
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_len.min(4096)),
            max_len: max_len.max(1),
            discarding: false,
            dropped: 0,
        }
    }

    /// Feed received bytes, returning every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = drain_lines(&mut self.buffer);

        // Remainder of a line already cut short
        if self.discarding && !lines.is_empty() {
            lines.remove(0);
            self.discarding = false;
        }

        let max_len = self.max_len;
        let before = lines.len();
        lines.retain(|line| line.len() <= max_len);
        self.dropped += (before - lines.len()) as u64;

        if self.buffer.len() > self.max_len {
            tracing::warn!(
                pending = self.buffer.len(),
                max_len = self.max_len,
                "no line terminator; dropping overlong line"
            );
            self.buffer.clear();
            self.discarding = true;
            self.dropped += 1;
        }

        lines
    }

    /// Bytes waiting for a line terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Overlong lines dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyACM0` or `COM3`
    pub port: String,

    pub baud_rate: u32,

    /// Port read timeout; bounds how long the reader thread takes to
    /// notice a close request
    pub poll_interval: Duration,

    /// Lines buffered between the reader thread and the worker
    pub queue_capacity: usize,

    /// Longest accepted line in bytes
    pub max_line_len: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            poll_interval: Duration::from_millis(50),
            queue_capacity: 1024,
            max_line_len: 4096,
        }
    }
}

/// Serial port line source.
///
/// A blocking reader thread owns the port, splits the byte stream into
/// lines and forwards them over a bounded channel. Receiving from the
/// channel is cancel-safe, so the worker can abandon a read at any time.
pub struct SerialLineSource {
    config: SerialConfig,
    rx: Option<mpsc::Receiver<Result<String>>>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl SerialLineSource {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            rx: None,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn reader_loop(
        mut port: Box<dyn serialport::SerialPort>,
        tx: mpsc::Sender<Result<String>>,
        stop: Arc<AtomicBool>,
        max_line_len: usize,
    ) {
        let mut lines = LineAssembler::new(max_line_len);
        let mut tmp = [0u8; 1024];

        while !stop.load(Ordering::Acquire) {
            match port.read(&mut tmp) {
                Ok(n) if n > 0 => {
                    for line in lines.push(&tmp[..n]) {
                        if tx.blocking_send(Ok(line)).is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(error = %e, "serial read failed");
                    let _ = tx.blocking_send(Err(Error::Transport(e.to_string())));
                    return;
                }
            }
        }

        tracing::debug!(dropped = lines.dropped(), "serial reader stopped");
    }
}

#[async_trait]
impl LineSource for SerialLineSource {
    async fn open(&mut self) -> Result<()> {
        if self.rx.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.config.port, self.config.baud_rate)
            .timeout(self.config.poll_interval)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| Error::Transport(format!("open {}: {}", self.config.port, e)))?;

        tracing::info!(port = %self.config.port, baud = self.config.baud_rate, "serial port opened");

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        self.stop.store(false, Ordering::Release);
        let stop = self.stop.clone();
        let max_line_len = self.config.max_line_len;

        self.reader = Some(tokio::task::spawn_blocking(move || {
            Self::reader_loop(port, tx, stop, max_line_len)
        }));
        self.rx = Some(rx);

        Ok(())
    }

    async fn recv_line(&mut self) -> Result<Option<String>> {
        match &mut self.rx {
            Some(rx) => rx.recv().await.transpose(),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        self.rx = None;

        if let Some(reader) = self.reader.take() {
            reader
                .await
                .map_err(|e| Error::Transport(format!("serial reader task failed: {}", e)))?;
            tracing::info!(port = %self.config.port, "serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.rx.is_some()
    }

    fn describe(&self) -> String {
        format!("serial:{}@{}", self.config.port, self.config.baud_rate)
    }
}

/// Replays a fixed list of lines, for tests and offline runs.
///
/// Optionally paces lines, fails with a transport error once the lines
/// run out, or stays open and silent after the last line like an idle
/// device would.
pub struct ReplayLineSource {
    lines: VecDeque<String>,
    interval: Option<Duration>,
    failure: Option<String>,
    hold_open: bool,
    is_open: bool,
}

impl ReplayLineSource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            interval: None,
            failure: None,
            hold_open: false,
            is_open: false,
        }
    }

    /// Delay before each line
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Fail with a transport error after the last line
    pub fn fail_after(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Never report end of stream; block like a silent device instead
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.lines.len()
    }
}

#[async_trait]
impl LineSource for ReplayLineSource {
    async fn open(&mut self) -> Result<()> {
        self.is_open = true;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<Option<String>> {
        if !self.is_open {
            return Ok(None);
        }

        if let Some(interval) = self.interval {
            tokio::time::sleep(interval).await;
        }

        if let Some(line) = self.lines.pop_front() {
            return Ok(Some(line));
        }

        if let Some(message) = self.failure.take() {
            return Err(Error::Transport(message));
        }

        if self.hold_open {
            std::future::pending::<()>().await;
        }

        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.is_open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn describe(&self) -> String {
        format!("replay:{} lines", self.lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_lines_keeps_partial_tail() {
        let mut buffer = b"Time:0,V1:1\r\nTime:1,V1:2\nTime:2".to_vec();
        let lines = drain_lines(&mut buffer);

        assert_eq!(lines, vec!["Time:0,V1:1", "Time:1,V1:2"]);
        assert_eq!(buffer, b"Time:2");

        buffer.extend_from_slice(b",V1:3\n");
        assert_eq!(drain_lines(&mut buffer), vec!["Time:2,V1:3"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_assembler_drops_unterminated_flood() {
        let mut lines = LineAssembler::new(16);

        assert!(lines.push(&[b'x'; 10]).is_empty());
        assert!(lines.push(&[b'x'; 10]).is_empty());
        assert_eq!(lines.pending(), 0);
        assert_eq!(lines.dropped(), 1);

        // The tail of the dropped line ends at the next terminator
        let out = lines.push(b"xxxx\nTime:1,V1:2\n");
        assert_eq!(out, vec!["Time:1,V1:2"]);
        assert_eq!(lines.dropped(), 1);
    }

    #[test]
    fn test_assembler_bounds_pending_bytes() {
        let mut lines = LineAssembler::new(64);
        for _ in 0..1000 {
            lines.push(&[b'7'; 50]);
            assert!(lines.pending() <= 64);
        }
        assert_eq!(lines.push(b"\nTime:0,V1:1\n"), vec!["Time:0,V1:1"]);
    }

    #[test]
    fn test_assembler_drops_complete_overlong_line() {
        let mut lines = LineAssembler::new(8);
        let out = lines.push(b"Time:0,V1:123456\nok\n");
        assert_eq!(out, vec!["ok"]);
        assert_eq!(lines.dropped(), 1);
    }

    #[tokio::test]
    async fn test_replay_source() {
        let mut source = ReplayLineSource::new(["a", "b"]);
        source.open().await.unwrap();
        assert!(source.is_open());

        let timeout = Duration::from_millis(50);
        assert_eq!(source.read_line(timeout).await.unwrap(), LineRead::Line("a".into()));
        assert_eq!(source.read_line(timeout).await.unwrap(), LineRead::Line("b".into()));
        assert_eq!(source.read_line(timeout).await.unwrap(), LineRead::Closed);

        source.close().await.unwrap();
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn test_read_is_time_bounded() {
        let mut source = ReplayLineSource::new(Vec::<String>::new()).hold_open();
        source.open().await.unwrap();

        let started = std::time::Instant::now();
        let read = source.read_line(Duration::from_millis(20)).await.unwrap();
        assert_eq!(read, LineRead::Idle);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let mut source = ReplayLineSource::new(["x"]).fail_after("unplugged");
        source.open().await.unwrap();

        assert!(source.recv_line().await.unwrap().is_some());
        assert!(matches!(source.recv_line().await, Err(Error::Transport(_))));
        assert_eq!(source.recv_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_serial_open_failure() {
        let mut source = SerialLineSource::new(SerialConfig {
            port: "/dev/forcetrace-does-not-exist".into(),
            ..Default::default()
        });
        assert!(matches!(source.open().await, Err(Error::Transport(_))));
        assert!(!source.is_open());
        source.close().await.unwrap();
    }
}
