//! Error types for the codec capability surface.

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Error type shared by every codec capability.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No decoder is registered for the stream's codec.
    #[error("Decoder not found: {0}")]
    DecoderNotFound(String),

    /// No encoder is registered under the requested name.
    #[error("Encoder not found: {0}")]
    EncoderNotFound(String),

    /// No bitstream filter is registered under the requested name.
    #[error("Bitstream filter not found: {0}")]
    FilterNotFound(String),

    /// The input could not be recognized or demuxed.
    #[error("Invalid input data: {0}")]
    InvalidData(String),

    /// A capability was used outside its contract (wrong frame size,
    /// header written twice, packet after trailer).
    #[error("Codec misuse: {0}")]
    Misuse(String),

    /// The backend reported a failure of its own.
    #[error("Codec backend error: {0}")]
    Backend(String),

    /// Source I/O failed underneath the demuxer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
