//! Source readers.
//!
//! A source presents an arbitrary remote or locally-synced byte stream to
//! the demuxer through a synchronous pull interface. Three variants exist:
//! a progressive HTTP download spooled through a temp file, a sparse
//! range-fetching cache, and a fully-synced local block store. The variants
//! are a tagged enum, not a trait object; the capability set is exactly
//! `{read, seek, absolute_size, close}`.

mod block_store;
mod progressive;
mod range_cache;

pub use block_store::{BlockProvider, BlockStoreSource};
pub use progressive::{ProgressProbe, ProgressiveSource};
pub use range_cache::RangeCacheSource;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Seek origin, including the size-query whence the demux bridge forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Absolute,
    Relative,
    FromEnd,
    SizeQuery,
}

/// Where the bytes come from. The descriptor doubles as the session
/// deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceDescriptor {
    /// Progressive HTTP download through a temp file.
    ProgressiveHttp {
        url: String,
        #[serde(default)]
        wait_for_complete: bool,
    },
    /// Sparse range-fetching cache (compat variant).
    RangeHttp { url: String },
    /// Append-only content-addressed block log already synced locally.
    LocalBlock {
        blocks_core_key: String,
        block_offset: u64,
        block_length: u64,
        byte_offset: u64,
        byte_length: u64,
    },
}

impl SourceDescriptor {
    /// Stable key identifying the underlying content, used for session
    /// deduplication.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::ProgressiveHttp { url, .. } => format!("http:{}", url),
            Self::RangeHttp { url } => format!("http:{}", url),
            Self::LocalBlock {
                blocks_core_key,
                block_offset,
                byte_offset,
                byte_length,
                ..
            } => format!(
                "block:{}:{}:{}:{}",
                blocks_core_key, block_offset, byte_offset, byte_length
            ),
        }
    }

    /// URL of HTTP-backed variants, for pre-scan classification.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::ProgressiveHttp { url, .. } | Self::RangeHttp { url } => Some(url),
            Self::LocalBlock { .. } => None,
        }
    }
}

/// A source reader variant.
pub enum SourceReader {
    Progressive(ProgressiveSource),
    RangeCache(RangeCacheSource),
    BlockStore(BlockStoreSource),
}

impl SourceReader {
    /// Synchronous read at the current position. `Ok(0)` means end of
    /// stream, or — for the progressive variant in non-blocking mode — an
    /// underrun recorded via [`SourceReader::caught_up`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Progressive(s) => s.read(buf),
            Self::RangeCache(s) => s.read(buf),
            Self::BlockStore(s) => s.read(buf),
        }
    }

    /// Seek clamped to `[0, total]`; `Whence::SizeQuery` returns the total
    /// size without moving the position.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        match self {
            Self::Progressive(s) => s.seek(offset, whence),
            Self::RangeCache(s) => s.seek(offset, whence),
            Self::BlockStore(s) => s.seek(offset, whence),
        }
    }

    /// Total size in bytes, known for every variant once constructed.
    pub fn absolute_size(&self) -> u64 {
        match self {
            Self::Progressive(s) => s.absolute_size(),
            Self::RangeCache(s) => s.absolute_size(),
            Self::BlockStore(s) => s.absolute_size(),
        }
    }

    /// Whether the last `Ok(0)` was an underrun rather than end of stream.
    pub fn caught_up(&self) -> bool {
        match self {
            Self::Progressive(s) => s.caught_up(),
            _ => false,
        }
    }

    /// Download progress `(received, total)` for variants that download.
    pub fn download_progress(&self) -> Option<(u64, u64)> {
        match self {
            Self::Progressive(s) => Some(s.download_progress()),
            _ => None,
        }
    }

    /// Detached progress handle for variants that download.
    pub fn progress_probe(&self) -> Option<ProgressProbe> {
        match self {
            Self::Progressive(s) => Some(s.progress_probe()),
            _ => None,
        }
    }

    /// Stop background work and release the source.
    pub fn close(&mut self) {
        match self {
            Self::Progressive(s) => s.close(),
            Self::RangeCache(s) => s.close(),
            Self::BlockStore(_) => {}
        }
    }
}

/// Resolve and clamp a seek target. Shared by every variant.
pub(crate) fn resolve_seek(pos: u64, total: u64, offset: i64, whence: Whence) -> Result<u64> {
    let base = match whence {
        Whence::Absolute => 0i128,
        Whence::Relative => pos as i128,
        Whence::FromEnd => total as i128,
        Whence::SizeQuery => return Ok(total),
    };
    let target = (base + offset as i128).clamp(0, total as i128);
    Ok(target as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_seek_clamps() {
        assert_eq!(resolve_seek(10, 100, -20, Whence::Relative).unwrap(), 0);
        assert_eq!(resolve_seek(10, 100, 500, Whence::Absolute).unwrap(), 100);
        assert_eq!(resolve_seek(0, 100, -10, Whence::FromEnd).unwrap(), 90);
    }

    #[test]
    fn test_size_query_leaves_position() {
        assert_eq!(resolve_seek(42, 100, 0, Whence::SizeQuery).unwrap(), 100);
    }

    #[test]
    fn test_dedup_key_distinguishes_sources() {
        let a = SourceDescriptor::ProgressiveHttp {
            url: "http://host/a.mkv".to_string(),
            wait_for_complete: false,
        };
        let b = SourceDescriptor::ProgressiveHttp {
            url: "http://host/b.mkv".to_string(),
            wait_for_complete: false,
        };
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_dedup_key_ignores_wait_flag() {
        let a = SourceDescriptor::ProgressiveHttp {
            url: "http://host/a.mkv".to_string(),
            wait_for_complete: false,
        };
        let b = SourceDescriptor::ProgressiveHttp {
            url: "http://host/a.mkv".to_string(),
            wait_for_complete: true,
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_descriptor_serde_tagging() {
        let desc: SourceDescriptor = serde_json::from_str(
            r#"{"type":"progressive-http","url":"http://host/a.mkv"}"#,
        )
        .unwrap();
        assert_eq!(
            desc,
            SourceDescriptor::ProgressiveHttp {
                url: "http://host/a.mkv".to_string(),
                wait_for_complete: false,
            }
        );
    }

    #[test]
    fn test_reader_is_send() {
        fn is_send<T: Send>() {}
        is_send::<SourceReader>();
    }
}
