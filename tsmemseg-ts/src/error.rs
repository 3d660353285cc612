//! MPEG Transport Stream error types.

use thiserror::Error;

/// MPEG-TS specific errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TsError {
    /// Invalid sync byte (expected 0x47).
    #[error("Invalid sync byte: expected 0x47, got 0x{0:02X}")]
    InvalidSyncByte(u8),

    /// Packet too short.
    #[error("Packet too short: expected 188 bytes, got {0}")]
    PacketTooShort(usize),

    /// Invalid PSI section.
    #[error("Invalid PSI section: {0}")]
    InvalidPsi(String),

    /// CRC mismatch on a PSI section.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u32,
        /// Actual CRC value.
        actual: u32,
    },

    /// Invalid PES packet.
    #[error("Invalid PES packet: {0}")]
    InvalidPes(String),
}

impl TsError {
    /// Create an invalid PSI error.
    pub fn invalid_psi(msg: impl Into<String>) -> Self {
        TsError::InvalidPsi(msg.into())
    }

    /// Create an invalid PES error.
    pub fn invalid_pes(msg: impl Into<String>) -> Self {
        TsError::InvalidPes(msg.into())
    }
}

impl From<TsError> for tsmemseg_core::Error {
    fn from(err: TsError) -> Self {
        tsmemseg_core::Error::Ts(err.to_string())
    }
}

/// Result type for MPEG-TS operations.
pub type Result<T> = std::result::Result<T, TsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TsError::InvalidSyncByte(0xFF);
        assert_eq!(err.to_string(), "Invalid sync byte: expected 0x47, got 0xFF");
    }

    #[test]
    fn test_conversion_to_core_error() {
        let err: tsmemseg_core::Error = TsError::PacketTooShort(4).into();
        assert!(matches!(err, tsmemseg_core::Error::Ts(_)));
    }
}
