//! # Forcetrace-Core
//!
//! Core types and error taxonomy for the forcetrace force-sensor
//! acquisition pipeline.

pub mod error;
pub mod types;

pub use error::{Error, ParseFailure, Result};
pub use types::*;
