//! Segmenting pipeline error types.

use thiserror::Error;

/// Errors from ring setup, delivery and the ingest loop.
#[derive(Error, Debug)]
pub enum SegError {
    /// An endpoint could not be created; fatal at startup.
    #[error("Endpoint creation failed for {path}: {source}")]
    EndpointCreation {
        /// Path of the endpoint that failed.
        path: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Invalid runner configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error on the ingest or output path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the segmenting pipeline.
pub type Result<T> = std::result::Result<T, SegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SegError::Config("segment count out of range".into());
        assert_eq!(err.to_string(), "Invalid configuration: segment count out of range");
    }
}
