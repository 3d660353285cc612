//! # tsmemseg Codecs
//!
//! Codec-level parsing for the tsmemseg segmenter:
//!
//! - NAL start-code scanning and IRAP classification (H.264 type 5,
//!   HEVC types 19/20/21) for segment boundary decisions
//! - AVC SPS and HEVC VPS/SPS/PPS parameter-set parsing, down to the
//!   fields the `avcC`/`hvcC` configuration records need
//! - ADTS fixed-header parsing and cross-PES resynchronization
//!
//! None of this decodes media; parameter sets are parsed only far enough
//! to derive dimensions, aspect ratio, profile/tier/level and the HEVC
//! parallelism type.

pub mod adts;
pub mod avc;
pub mod hevc;
pub mod nal;

pub use adts::{sync_adts_payload, AdtsHeader, SAMPLING_FREQUENCY};
pub use avc::{slice_is_intra, AvcSps};
pub use hevc::{HevcPps, HevcSps, HevcVps};
pub use nal::{for_each_nal, IrapScanner, VideoCodec};
