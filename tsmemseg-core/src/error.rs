//! Error types for the tsmemseg workspace.
//!
//! This module provides the error hierarchy shared by all components.

use thiserror::Error;

/// Main error type for the tsmemseg workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport stream errors (packet/PSI/PES parsing).
    #[error("Transport stream error: {0}")]
    Ts(String),

    /// Codec parameter parsing errors (SPS/PPS/VPS/ADTS).
    #[error("Codec error: {0}")]
    Codec(String),

    /// Bitstream parsing errors.
    #[error("Bitstream error: {0}")]
    Bitstream(#[from] BitstreamError),

    /// ISO-BMFF construction errors.
    #[error("MP4 error: {0}")]
    Mp4(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// End of stream reached.
    #[error("End of stream")]
    EndOfStream,
}

/// Bitstream parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitstreamError {
    /// Unexpected end of bitstream.
    #[error("Unexpected end of bitstream")]
    UnexpectedEnd,

    /// Exp-Golomb decoding error.
    #[error("Exp-Golomb decoding error: value too large")]
    ExpGolombOverflow,

    /// Invalid syntax element value.
    #[error("Invalid syntax element: {element} = {value}")]
    InvalidSyntax {
        /// Name of the syntax element.
        element: &'static str,
        /// The offending value.
        value: i64,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid parameter error.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Create a codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// Check if this is an end-of-stream error.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidParameter("test parameter".into());
        assert_eq!(err.to_string(), "Invalid parameter: test parameter");
    }

    #[test]
    fn test_bitstream_error_conversion() {
        let err: Error = BitstreamError::UnexpectedEnd.into();
        assert!(matches!(err, Error::Bitstream(BitstreamError::UnexpectedEnd)));
    }

    #[test]
    fn test_is_eof() {
        assert!(Error::EndOfStream.is_eof());
        assert!(!Error::invalid_param("x").is_eof());
    }
}
