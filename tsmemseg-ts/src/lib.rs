//! # tsmemseg TS
//!
//! MPEG Transport Stream parsing for the tsmemseg segmenter.
//!
//! This crate provides the pieces of TS handling the segmenter needs:
//!
//! - **188-byte packets**: header accessors with sync byte validation
//! - **PSI assembly**: pointer-field and continuity-counter handling for
//!   sections spanning multiple packets
//! - **PAT/PMT**: first-program tracking with first-of-category elementary
//!   stream selection (video, ADTS audio, ID3 metadata)
//! - **PES timestamps**: 33-bit PTS/DTS extraction
//! - **CRC-32**: the MPEG-2 section checksum (ISO/IEC 13818-1)
//!
//! There is no resynchronization: a packet whose first byte is not 0x47 is
//! counted and dropped by the caller.

pub mod error;
pub mod packet;
pub mod pes;
pub mod psi;

pub use error::{Result, TsError};
pub use packet::{
    adaptation_control, continuity_counter, is_unit_start, payload, payload_offset, pid, sync_byte,
    PACKET_SIZE, PID_PAT, SYNC_BYTE,
};
pub use pes::{read_pes_timestamp, write_pes_timestamp, PesHeader, PES_START_CODE_PREFIX};
pub use psi::{
    calculate_crc32, Pat, Pmt, PsiBuffer, STREAM_TYPE_AAC_ADTS, STREAM_TYPE_H264, STREAM_TYPE_H265,
    STREAM_TYPE_ID3_METADATA,
};
