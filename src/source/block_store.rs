//! Local block-store source.
//!
//! The source lives in an append-only content-addressed block log already
//! synced to this node. The store may reuse its internal buffers, so every
//! block is copied byte-wise into an owned buffer at construction;
//! afterwards reads and seeks are pure in-memory operations.

use crate::error::{Result, SessionError};
use crate::source::{resolve_seek, Whence};
use bytes::Bytes;

/// Capability surface of the external block log.
pub trait BlockProvider: Send + Sync {
    /// Contiguous bytes synced from the start of the log.
    fn synced_len(&self) -> u64;

    /// Bytes at `[offset, offset + len)` in the log. The returned buffer
    /// may alias store-internal memory and must be copied by the caller.
    fn read(&self, offset: u64, len: usize) -> std::io::Result<Bytes>;

    /// Whether the whole range is locally present. The default derives it
    /// from the contiguous watermark; providers with per-block accounting
    /// can override.
    fn is_synced(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.synced_len())
    }
}

/// Reads from the log are chunked so huge ranges do not demand one giant
/// intermediate buffer from the provider.
const PRELOAD_CHUNK: usize = 4 * 1024 * 1024;

/// In-memory source over a fully-synced block range.
pub struct BlockStoreSource {
    data: Vec<u8>,
    pos: u64,
}

impl BlockStoreSource {
    /// Verify sync state and pre-load `byte_length` bytes starting at
    /// `byte_offset` within the block range at `block_offset`.
    pub fn new(
        provider: &dyn BlockProvider,
        block_offset: u64,
        block_length: u64,
        byte_offset: u64,
        byte_length: u64,
    ) -> Result<Self> {
        if !provider.is_synced(block_offset, block_length) {
            return Err(SessionError::SourceNotSynced(format!(
                "blocks [{}, {}) not fully present (synced to {})",
                block_offset,
                block_offset + block_length,
                provider.synced_len()
            )));
        }
        if byte_offset + byte_length > block_length {
            return Err(SessionError::SourceNotSynced(format!(
                "byte range [{}, {}) exceeds block range of {} bytes",
                byte_offset,
                byte_offset + byte_length,
                block_length
            )));
        }

        let start = block_offset + byte_offset;
        let mut data = Vec::with_capacity(byte_length as usize);
        let mut loaded = 0u64;
        while loaded < byte_length {
            let chunk = PRELOAD_CHUNK.min((byte_length - loaded) as usize);
            let block = provider.read(start + loaded, chunk)?;
            // Byte-wise copy into owned memory; the provider may recycle
            // its buffer as soon as this call returns.
            data.extend_from_slice(&block);
            loaded += block.len() as u64;
            if block.is_empty() {
                return Err(SessionError::SourceNotSynced(
                    "block store returned no data inside a synced range".to_string(),
                ));
            }
        }

        tracing::info!(
            bytes = data.len(),
            block_offset,
            byte_offset,
            "Pre-loaded block-store source"
        );
        Ok(Self { data, pos: 0 })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.data.len() as u64 - self.pos;
        let n = (buf.len() as u64).min(remaining) as usize;
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let target = resolve_seek(self.pos, self.data.len() as u64, offset, whence)?;
        if whence != Whence::SizeQuery {
            self.pos = target;
        }
        Ok(target)
    }

    pub fn absolute_size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TestProvider {
        data: Mutex<Vec<u8>>,
        synced: u64,
    }

    impl TestProvider {
        fn new(data: Vec<u8>) -> Self {
            let synced = data.len() as u64;
            Self {
                data: Mutex::new(data),
                synced,
            }
        }
    }

    impl BlockProvider for TestProvider {
        fn synced_len(&self) -> u64 {
            self.synced
        }

        fn read(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
            let data = self.data.lock().unwrap();
            let start = offset as usize;
            Ok(Bytes::copy_from_slice(&data[start..start + len]))
        }
    }

    fn ebml_header() -> Vec<u8> {
        let mut data = vec![0x1A, 0x45, 0xDF, 0xA3];
        data.extend((0..2048u32).map(|i| i as u8));
        data
    }

    #[test]
    fn test_preload_and_read_magic() {
        let provider = TestProvider::new(ebml_header());
        let len = provider.synced_len();
        let mut source = BlockStoreSource::new(&provider, 0, len, 0, len).unwrap();

        let mut magic = [0u8; 4];
        assert_eq!(source.read(&mut magic).unwrap(), 4);
        assert_eq!(magic, [0x1A, 0x45, 0xDF, 0xA3]);
    }

    #[test]
    fn test_rejects_unsynced_range() {
        let provider = TestProvider::new(vec![0u8; 100]);
        let result = BlockStoreSource::new(&provider, 0, 200, 0, 200);
        assert!(matches!(result, Err(SessionError::SourceNotSynced(_))));
    }

    #[test]
    fn test_rejects_byte_range_past_blocks() {
        let provider = TestProvider::new(vec![0u8; 100]);
        let result = BlockStoreSource::new(&provider, 0, 100, 50, 100);
        assert!(matches!(result, Err(SessionError::SourceNotSynced(_))));
    }

    #[test]
    fn test_byte_offset_window() {
        let provider = TestProvider::new((0..=255u8).cycle().take(1000).collect());
        let mut source = BlockStoreSource::new(&provider, 0, 1000, 10, 20).unwrap();
        assert_eq!(source.absolute_size(), 20);

        let mut buf = [0u8; 20];
        assert_eq!(source.read(&mut buf).unwrap(), 20);
        assert_eq!(buf[0], 10);
        assert_eq!(buf[19], 29);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reader_owns_bytes_after_provider_is_gone() {
        let provider = TestProvider::new(ebml_header());
        let len = provider.synced_len();
        let mut source = BlockStoreSource::new(&provider, 0, len, 0, len).unwrap();
        drop(provider);

        let mut magic = [0u8; 4];
        source.read(&mut magic).unwrap();
        assert_eq!(magic, [0x1A, 0x45, 0xDF, 0xA3]);
    }

    #[test]
    fn test_read_idempotent_after_seek() {
        let provider = TestProvider::new(ebml_header());
        let len = provider.synced_len();
        let mut source = BlockStoreSource::new(&provider, 0, len, 0, len).unwrap();

        let mut first = [0u8; 32];
        source.seek(100, Whence::Absolute).unwrap();
        source.read(&mut first).unwrap();

        let mut second = [0u8; 32];
        source.seek(100, Whence::Absolute).unwrap();
        source.read(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_size_query_does_not_move() {
        let provider = TestProvider::new(vec![1u8; 64]);
        let mut source = BlockStoreSource::new(&provider, 0, 64, 0, 64).unwrap();
        source.seek(10, Whence::Absolute).unwrap();
        assert_eq!(source.seek(0, Whence::SizeQuery).unwrap(), 64);
        let mut b = [0u8; 1];
        source.read(&mut b).unwrap();
        assert_eq!(b[0], 1);
        assert_eq!(source.seek(0, Whence::Relative).unwrap(), 11);
    }
}
