//! # tsmemseg Seg
//!
//! The segmenting pipeline of tsmemseg: packet accumulation and boundary
//! decisions, the fixed-size segment ring with its live index, named-FIFO
//! delivery, read pacing, and process lifecycle (idle timeout, closing
//! command, signal cleanup).
//!
//! The ingest thread owns the [`Segmenter`] and the fMP4 state; the
//! delivery thread only touches the ring's buffer pairs under the ring
//! lock. Readers always observe either the prior complete version of a
//! slot or the new one, never a torn write.

pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod pacing;
pub mod ring;
pub mod runner;
pub mod segmenter;

pub use error::{Result, SegError};
pub use ring::{Ring, SEGMENT_COUNT_EMPTY};
pub use runner::{run, RunStats, RunnerConfig};
pub use segmenter::{Flush, FlushKind, Segmenter, SegmenterConfig};
