//! # Forcetrace-CLI
//!
//! Command-line driver for force sensor sessions.
//!
//! ## Commands
//!
//! - `acquire` - Stream frames from the serial board until stopped, then export
//! - `calibrate` - Record a baseline and known masses into a calibration dataset
//! - `fit` - Fit and print conversion functions from a dataset directory
//! - `reprocess` - Condition and convert a raw capture offline
//!
//! Settings come from [`AppConfig`]; flags given on the command line win.

pub mod commands;
pub mod config;

pub use commands::*;
pub use config::*;
