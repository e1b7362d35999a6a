//! Error types for castbridge-media.

use thiserror::Error;

/// Result type for castbridge-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for castbridge-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Byte slice is not a whole number of 188-byte TS packets.
    #[error("Invalid TS packet size: {0}")]
    InvalidPacketSize(usize),

    /// TS packet does not start with the 0x47 sync byte.
    #[error("Invalid sync byte: {0:#04x}")]
    InvalidSyncByte(u8),

    /// A PSI section was shorter than its declared length.
    #[error("Truncated PSI section: need {need} bytes, have {have}")]
    TruncatedSection { need: usize, have: usize },

    /// No PAT packet was found in the scanned bytes.
    #[error("PAT not found")]
    PatNotFound,

    /// The PAT declared no program, so no PMT PID could be resolved.
    #[error("PAT carries no program entry")]
    NoProgram,

    /// Unsupported audio parameters for ASC synthesis.
    #[error("Unsupported audio configuration: {0}")]
    UnsupportedAudio(String),
}
