//! # tsmemseg MP4
//!
//! Fragmented MP4 (ISO/IEC 14496-12) output for the tsmemseg segmenter.
//!
//! The [`Mp4Fragmenter`] consumes the TS packets of one flush at a time and
//! produces an initialization header (`ftyp` + `moov`, emitted once all
//! advertised elementary streams have valid parameters) plus per-flush
//! media fragments (`moof` + `mdat`, optionally preceded by `emsg` boxes
//! bridging ID3 timed metadata).
//!
//! Box construction is append-only with 32-bit size back-patching, so the
//! whole fragment is laid out in a single pass.

pub mod boxes;
pub mod fragmenter;

pub use fragmenter::Mp4Fragmenter;
