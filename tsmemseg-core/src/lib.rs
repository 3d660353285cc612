//! # tsmemseg Core
//!
//! Core types and utilities shared by the tsmemseg segmenter crates:
//! - Error handling types
//! - Bit-level reading with Exp-Golomb support
//! - 33-bit MPEG timestamp arithmetic

pub mod bitstream;
pub mod error;
pub mod timestamp;

pub use bitstream::{ebsp_to_rbsp, BitReader};
pub use error::{Error, Result};
pub use timestamp::{forward_diff, wrap33_diff, MAX_CLOCK_LEAP, PTS_CLOCK, TIMESTAMP_MAX};
