//! # Forcetrace-Acq
//!
//! Acquisition, conditioning and calibration pipeline for multi-channel
//! force sensor boards streaming text frames over a serial link.
//!
//! ## Frame Format
//!
//! The board emits one record per line, a millisecond device clock
//! followed by N raw ADC codes:
//!
//! ```text
//! Time:1234,V1:512,V2:498,V3:505,V4:1021
//! ```
//!
//! ## Pipeline Stages
//!
//! 1. **Acquisition**: Read bounded-time lines from a transport
//! 2. **Parsing**: Strict all-or-nothing frame grammar
//! 3. **Noise rejection**: Relative-change validity check with a forced-accept escape
//! 4. **Smoothing**: Per-channel running median
//! 5. **Conversion**: Fitted polynomial per channel, raw code to newtons
//!
//! Completed captures can instead be run through the batch conditioning
//! chain (Hampel, Savitzky-Golay, EMA, zero-phase Butterworth) before
//! conversion; see [`reprocess`](mod@reprocess).

pub mod acquisition;
pub mod calibration;
pub mod dataset;
pub mod export;
pub mod filtering;
pub mod linalg;
pub mod noise;
pub mod parser;
pub mod pipeline;
pub mod recording;
pub mod reprocess;
pub mod stats;

pub use acquisition::*;
pub use calibration::*;
pub use dataset::*;
pub use export::*;
pub use filtering::*;
pub use noise::*;
pub use parser::*;
pub use pipeline::*;
pub use recording::*;
pub use reprocess::*;
