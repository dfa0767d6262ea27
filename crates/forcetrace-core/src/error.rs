//! Error types for the forcetrace acquisition pipeline.

use thiserror::Error;

/// Reasons a raw text line was rejected by the frame parser.
///
/// Parsing is all-or-nothing: any of these means no frame was produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("empty line")]
    Empty,

    #[error("missing field #{index}")]
    MissingField { index: usize },

    #[error("tag mismatch in field #{index}: expected `{expected}`, got `{found}`")]
    TagMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("invalid number `{value}` in field #{index}")]
    InvalidNumber { index: usize, value: String },

    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelCount { expected: usize, actual: usize },

    #[error("unexpected trailing input after field #{index}")]
    TrailingInput { index: usize },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed frame: {0}")]
    Parse(#[from] ParseFailure),

    #[error("Insufficient calibration data for channel {channel}: need {required} distinct raw values, have {available}")]
    InsufficientCalibrationData {
        channel: String,
        required: usize,
        available: usize,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No data captured")]
    NoData,

    #[error("Acquisition worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
