//! Growing segment catalog.
//!
//! Single writer (the transcoder), many readers (HTTP handlers). A segment
//! is published by inserting a fully-built `Arc` into the map, so a reader
//! either sees nothing or sees the complete immutable entry. The in-memory
//! footprint is capped: past `max_memory_segments` the least-recently-
//! accessed payload is written to `segment<i>.ts` in the session directory
//! by a background task that is only joined at destroy time, keeping `add`
//! non-blocking for the producer.

use crate::config::StoreConfig;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Payload {
    Memory(Bytes),
    Disk(PathBuf),
}

/// One committed segment. Timing metadata is immutable after publish.
pub struct Segment {
    pub index: u32,
    pub start_pts_secs: f64,
    pub duration_secs: f64,
    pub size: usize,
    created: Instant,
    payload: RwLock<Payload>,
    last_access: AtomicU64,
}

/// Metadata snapshot for playlists and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct SegmentMeta {
    pub index: u32,
    pub start_pts_secs: f64,
    pub duration_secs: f64,
    pub size: usize,
}

pub struct SegmentStore {
    segments: DashMap<u32, Arc<Segment>>,
    highest: AtomicI64,
    dir: PathBuf,
    config: StoreConfig,
    epoch: Instant,
    runtime: tokio::runtime::Handle,
    spill_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SegmentStore {
    /// Create a store rooted at `dir` (created if absent). Must be called
    /// from within a tokio runtime; spill tasks are spawned onto it.
    pub fn new(dir: PathBuf, config: StoreConfig) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            segments: DashMap::new(),
            highest: AtomicI64::new(-1),
            dir,
            config,
            epoch: Instant::now(),
            runtime: tokio::runtime::Handle::current(),
            spill_tasks: Mutex::new(Vec::new()),
        }))
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Commit a segment. Takes ownership of the bytes and publishes the
    /// entry atomically; never blocks on disk.
    pub fn add(self: &Arc<Self>, index: u32, start_pts_secs: f64, duration_secs: f64, bytes: Vec<u8>) {
        let segment = Arc::new(Segment {
            index,
            start_pts_secs,
            duration_secs,
            size: bytes.len(),
            created: Instant::now(),
            payload: RwLock::new(Payload::Memory(Bytes::from(bytes))),
            last_access: AtomicU64::new(self.now_millis()),
        });
        self.segments.insert(index, segment);
        self.highest.fetch_max(index as i64, Ordering::AcqRel);
        tracing::debug!(index, duration_secs, "Segment committed");

        self.enforce_memory_cap();
    }

    fn in_memory_segments(&self) -> Vec<Arc<Segment>> {
        self.segments
            .iter()
            .filter(|entry| matches!(*entry.value().payload.read(), Payload::Memory(_)))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn enforce_memory_cap(self: &Arc<Self>) {
        let mut resident = self.in_memory_segments();
        if resident.len() <= self.config.max_memory_segments {
            return;
        }
        resident.sort_by_key(|s| s.last_access.load(Ordering::Acquire));
        let excess = resident.len() - self.config.max_memory_segments;
        for segment in resident.into_iter().take(excess) {
            let store = Arc::clone(self);
            let task = self.runtime.spawn(async move {
                store.spill(segment).await;
            });
            self.spill_tasks.lock().push(task);
        }
    }

    async fn spill(&self, segment: Arc<Segment>) {
        let data = match &*segment.payload.read() {
            Payload::Memory(bytes) => bytes.clone(),
            Payload::Disk(_) => return,
        };
        let path = self.dir.join(format!("segment{}.ts", segment.index));
        match tokio::fs::write(&path, &data).await {
            Ok(()) => {
                *segment.payload.write() = Payload::Disk(path);
                tracing::trace!(index = segment.index, "Segment spilled to disk");
            }
            Err(e) => {
                // Downgrade: the segment stays memory-resident.
                tracing::warn!(index = segment.index, "Segment spill failed: {e}");
            }
        }
    }

    pub fn has(&self, index: u32) -> bool {
        self.segments.contains_key(&index)
    }

    /// Copy of the segment bytes, reading back from disk when spilled.
    pub async fn get(&self, index: u32) -> Option<Bytes> {
        let segment = self.segments.get(&index).map(|e| Arc::clone(e.value()))?;
        segment.last_access.store(self.now_millis(), Ordering::Release);
        let (memory, path) = match &*segment.payload.read() {
            Payload::Memory(bytes) => (Some(Bytes::copy_from_slice(bytes)), None),
            Payload::Disk(path) => (None, Some(path.clone())),
        };
        if let Some(bytes) = memory {
            return Some(bytes);
        }
        match tokio::fs::read(path.as_ref()?).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                tracing::warn!(index, "Failed to read spilled segment: {e}");
                None
            }
        }
    }

    /// Highest committed index, or -1 before the first segment.
    pub fn highest_complete(&self) -> i64 {
        self.highest.load(Ordering::Acquire)
    }

    pub fn segment_meta(&self, index: u32) -> Option<SegmentMeta> {
        self.segments.get(&index).map(|entry| {
            let s = entry.value();
            SegmentMeta {
                index: s.index,
                start_pts_secs: s.start_pts_secs,
                duration_secs: s.duration_secs,
                size: s.size,
            }
        })
    }

    /// Snapshot for playlist rendering: `(media_sequence, segments)` over
    /// the dense committed prefix, windowed when a playlist cap is set.
    pub fn playlist_view(&self) -> (u32, Vec<SegmentMeta>) {
        let highest = self.highest_complete();
        if highest < 0 {
            return (0, Vec::new());
        }
        let mut metas: Vec<SegmentMeta> = (0..=highest as u32)
            .filter_map(|i| self.segment_meta(i))
            .collect();
        if let Some(cap) = self.config.max_playlist_segments {
            let cap = cap as usize;
            if metas.len() > cap {
                metas.drain(..metas.len() - cap);
            }
        }
        let media_sequence = metas.first().map(|m| m.index).unwrap_or(0);
        (media_sequence, metas)
    }

    /// Drop segments older than the TTL, deleting spilled files.
    pub fn sweep_expired(&self) -> usize {
        let ttl = Duration::from_secs(self.config.segment_ttl_secs);
        let expired: Vec<u32> = self
            .segments
            .iter()
            .filter(|entry| entry.value().created.elapsed() >= ttl)
            .map(|entry| *entry.key())
            .collect();
        for index in &expired {
            if let Some((_, segment)) = self.segments.remove(index) {
                if let Payload::Disk(path) = &*segment.payload.read() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Swept expired segments");
        }
        expired.len()
    }

    /// Await pending spill writes and delete the session directory.
    pub async fn destroy(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.spill_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.segments.clear();
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::debug!("Session dir cleanup: {e}");
        }
    }
}

/// Periodic TTL sweep, one task per store.
pub fn start_ttl_sweeper(store: Arc<SegmentStore>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            store.sweep_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_memory: usize, ttl_secs: u64) -> StoreConfig {
        StoreConfig {
            max_memory_segments: max_memory,
            max_playlist_segments: None,
            segment_ttl_secs: ttl_secs,
        }
    }

    fn temp_store(config: StoreConfig) -> (Arc<SegmentStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("session"), config).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_add_get_highest() {
        let (store, _dir) = temp_store(test_config(30, 7200));
        assert_eq!(store.highest_complete(), -1);
        assert!(!store.has(0));

        store.add(0, 0.0, 2.0, vec![0x47; 376]);
        assert!(store.has(0));
        assert_eq!(store.highest_complete(), 0);

        let bytes = store.get(0).await.unwrap();
        assert_eq!(bytes.len(), 376);
        assert_eq!(bytes[0], 0x47);
        assert!(store.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_get_returns_a_copy() {
        let (store, _dir) = temp_store(test_config(30, 7200));
        store.add(0, 0.0, 2.0, vec![1u8; 16]);
        let a = store.get(0).await.unwrap();
        let b = store.get(0).await.unwrap();
        assert_eq!(a, b);
        // Different allocations, not a shared buffer.
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[tokio::test]
    async fn test_spill_past_memory_cap() {
        let (store, _dir) = temp_store(test_config(2, 7200));
        for i in 0..5u32 {
            store.add(i, i as f64 * 2.0, 2.0, vec![i as u8; 256]);
        }
        // Join spills.
        let tasks: Vec<_> = std::mem::take(&mut *store.spill_tasks.lock());
        for task in tasks {
            task.await.unwrap();
        }

        let resident = store.in_memory_segments().len();
        assert!(resident <= 2, "expected at most 2 resident, got {resident}");

        // Spilled segments still serve their exact bytes.
        for i in 0..5u32 {
            let bytes = store.get(i).await.unwrap();
            assert_eq!(bytes.len(), 256);
            assert!(bytes.iter().all(|&b| b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_playlist_view_dense_prefix() {
        let (store, _dir) = temp_store(test_config(30, 7200));
        store.add(0, 0.0, 2.0, vec![0; 8]);
        store.add(1, 2.0, 2.5, vec![0; 8]);
        store.add(2, 4.5, 1.8, vec![0; 8]);

        let (media_sequence, metas) = store.playlist_view();
        assert_eq!(media_sequence, 0);
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[1].duration_secs, 2.5);
        assert_eq!(metas[2].start_pts_secs, 4.5);
    }

    #[tokio::test]
    async fn test_playlist_view_window_cap() {
        let config = StoreConfig {
            max_memory_segments: 30,
            max_playlist_segments: Some(2),
            segment_ttl_secs: 7200,
        };
        let (store, _dir) = temp_store(config);
        for i in 0..5u32 {
            store.add(i, i as f64, 1.0, vec![0; 8]);
        }
        let (media_sequence, metas) = store.playlist_view();
        assert_eq!(metas.len(), 2);
        assert_eq!(media_sequence, 3);
    }

    #[tokio::test]
    async fn test_ttl_sweep() {
        let (store, _dir) = temp_store(test_config(30, 0));
        store.add(0, 0.0, 2.0, vec![0; 8]);
        assert_eq!(store.sweep_expired(), 1);
        assert!(!store.has(0));
    }

    #[tokio::test]
    async fn test_ttl_keeps_fresh_segments() {
        let (store, _dir) = temp_store(test_config(30, 7200));
        store.add(0, 0.0, 2.0, vec![0; 8]);
        assert_eq!(store.sweep_expired(), 0);
        assert!(store.has(0));
    }

    #[tokio::test]
    async fn test_destroy_removes_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session");
        let store = SegmentStore::new(path.clone(), test_config(1, 7200)).unwrap();
        for i in 0..4u32 {
            store.add(i, i as f64, 1.0, vec![0; 64]);
        }
        store.destroy().await;
        assert!(!path.exists());
    }
}
