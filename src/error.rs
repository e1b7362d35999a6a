//! Session-level error taxonomy.
//!
//! Per-packet anomalies are logged and recovered inside the transcoder; the
//! variants here are the failures that end a session (or prevent one from
//! starting) and surface to callers as the status diagnostic text.

use castbridge_codec::CodecError;
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Terminal failures of a streaming session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The source could not be opened at all: bad URL, DNS failure,
    /// non-success status, or unknown total size. Surfaced at start; no
    /// session is created.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The download made no progress for longer than the idle timeout.
    #[error("Download stalled for {seconds}s")]
    SourceStalled { seconds: u64 },

    /// Local block store is missing required blocks. Surfaced at start.
    #[error("Source not synced: {0}")]
    SourceNotSynced(String),

    /// A synchronous read crossed the download watermark and could not be
    /// satisfied without blocking past the configured bound.
    #[error("transcoder caught up to download")]
    ReaderCaughtUp,

    /// The codec library failed during setup, or sustained per-packet
    /// failures exceeded the tolerated count.
    #[error("Codec failure: {0}")]
    Codec(#[from] CodecError),

    /// A committed segment could not be patched into conformance. The
    /// segment is still emitted; this variant only terminates the session
    /// when promoted explicitly.
    #[error("Bitstream patch failed: {0}")]
    BitstreamPatch(String),

    /// Disk spill failed and the memory cap left nowhere to keep the
    /// segment.
    #[error("Segment write failed: {0}")]
    SegmentWrite(String),

    /// The session was stopped by the caller.
    #[error("Session stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Diagnostic text stored on the session status.
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}
