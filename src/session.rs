//! Session lifecycle and deduplication.
//!
//! The registry is the process's only globally shared mutable state. Each
//! session owns its source reader, transcoder thread, segment store, and a
//! TTL sweeper; all session mutation happens from the owning tasks, with
//! the registry map guarded independently.

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::prescan;
use crate::server::net;
use crate::source::{
    BlockProvider, BlockStoreSource, ProgressiveSource, RangeCacheSource, SourceDescriptor,
    SourceReader,
};
use crate::store::{start_ttl_sweeper, SegmentStore};
use crate::transcode;
use castbridge_codec::CodecBackend;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Initializing,
    Downloading,
    Transcoding,
    Complete,
    Error,
}

/// State shared between the owning pipeline thread and status readers.
pub struct SessionShared {
    status: Mutex<SessionStatus>,
    progress: Mutex<f64>,
    diagnostic: Mutex<Option<String>>,
    stop: AtomicBool,
    /// Incremented around codec-library calls. A diagnostic only — never a
    /// lock, and never consulted by HTTP handlers.
    busy: std::sync::atomic::AtomicU32,
}

impl SessionShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(SessionStatus::Starting),
            progress: Mutex::new(0.0),
            diagnostic: Mutex::new(None),
            stop: AtomicBool::new(false),
            busy: std::sync::atomic::AtomicU32::new(0),
        })
    }

    pub fn enter_codec(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit_codec(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn codec_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire) > 0
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    pub fn progress(&self) -> f64 {
        *self.progress.lock()
    }

    pub fn set_progress(&self, progress: f64) {
        *self.progress.lock() = progress.clamp(0.0, 100.0);
    }

    pub fn diagnostic(&self) -> Option<String> {
        self.diagnostic.lock().clone()
    }

    pub fn set_diagnostic(&self, message: String) {
        *self.diagnostic.lock() = Some(message);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// One active session.
pub struct Session {
    pub id: String,
    pub descriptor: SourceDescriptor,
    pub shared: Arc<SessionShared>,
    pub store: Arc<SegmentStore>,
    pub created_at: DateTime<Utc>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Status snapshot returned by [`SessionManager::status`] and `list`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub progress: f64,
    pub diagnostic: Option<String>,
    pub segments: i64,
    pub created_at: DateTime<Utc>,
}

/// Options accompanying a start request.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Caller-provided title, used by the pre-scan classifier.
    pub title: Option<String>,
}

/// Result of a start request.
#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub session_id: String,
    pub playlist_url_local: String,
    pub playlist_url_lan: String,
}

pub struct SessionManager {
    codec: Arc<dyn CodecBackend>,
    config: Arc<Config>,
    client: reqwest::Client,
    block_provider: Mutex<Option<Arc<dyn BlockProvider>>>,
    registry: DashMap<String, Arc<Session>>,
    base_dir: PathBuf,
    port: AtomicU16,
}

impl SessionManager {
    pub fn new(codec: Arc<dyn CodecBackend>, config: Arc<Config>) -> Arc<Self> {
        let base_dir = std::env::temp_dir().join("castbridge-sessions");
        Arc::new(Self {
            codec,
            config,
            client: reqwest::Client::new(),
            block_provider: Mutex::new(None),
            registry: DashMap::new(),
            base_dir,
            port: AtomicU16::new(0),
        })
    }

    /// Register the block log used by local-block sources.
    pub fn register_block_provider(&self, provider: Arc<dyn BlockProvider>) {
        *self.block_provider.lock() = Some(provider);
    }

    /// Record the HTTP server's bound port for playlist URLs.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Release);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a session, idempotently per source descriptor: a live session
    /// for the same source is returned unchanged. Under the default
    /// single-active policy, sessions for other sources are torn down
    /// first.
    pub async fn start(
        self: &Arc<Self>,
        descriptor: SourceDescriptor,
        options: StartOptions,
    ) -> Result<StartResult> {
        let key = descriptor.dedup_key();
        if let Some(existing) = self.find_live(&key) {
            tracing::info!(session_id = %existing.id, "Reusing session for source");
            return Ok(self.urls(&existing.id));
        }

        if self.config.session.single_active {
            let others: Vec<String> = self
                .registry
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            for id in others {
                tracing::info!(session_id = %id, "Tearing down session for other source");
                self.stop(&id).await;
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let shared = SessionShared::new();
        let store = SegmentStore::new(self.base_dir.join(&id), self.config.store.clone())?;
        let session = Arc::new(Session {
            id: id.clone(),
            descriptor: descriptor.clone(),
            shared: Arc::clone(&shared),
            store: Arc::clone(&store),
            created_at: Utc::now(),
            watcher: Mutex::new(None),
            sweeper: Mutex::new(None),
        });
        self.registry.insert(id.clone(), Arc::clone(&session));
        shared.set_status(SessionStatus::Initializing);
        tracing::info!(session_id = %id, "Session starting");

        let classification = prescan::classify(descriptor.url(), options.title.as_deref());
        let reader = match self.open_source(&descriptor, &shared).await {
            Ok(reader) => reader,
            Err(e) => {
                // Source failures surface at start; the session is removed.
                self.registry.remove(&id);
                store.destroy().await;
                return Err(e);
            }
        };
        let probe = reader.progress_probe();
        shared.set_status(SessionStatus::Transcoding);

        let codec = Arc::clone(&self.codec);
        let config = Arc::clone(&self.config);
        let pipeline_store = Arc::clone(&store);
        let pipeline_shared = Arc::clone(&shared);
        let pipeline = tokio::task::spawn_blocking(move || {
            transcode::run_pipeline(
                codec,
                reader,
                classification,
                &config,
                pipeline_store,
                Arc::clone(&pipeline_shared),
                probe,
            )
        });

        let watcher_shared = Arc::clone(&shared);
        let watcher_id = id.clone();
        let watcher = tokio::spawn(async move {
            match pipeline.await {
                Ok(Ok(())) => {
                    watcher_shared.set_progress(100.0);
                    watcher_shared.set_status(SessionStatus::Complete);
                    tracing::info!(session_id = %watcher_id, "Session complete");
                }
                Ok(Err(e)) => {
                    watcher_shared.set_diagnostic(e.diagnostic());
                    watcher_shared.set_status(SessionStatus::Error);
                    tracing::warn!(session_id = %watcher_id, "Session failed: {e}");
                }
                Err(e) => {
                    watcher_shared.set_diagnostic(format!("pipeline panicked: {e}"));
                    watcher_shared.set_status(SessionStatus::Error);
                    tracing::error!(session_id = %watcher_id, "Pipeline task died: {e}");
                }
            }
        });
        *session.watcher.lock() = Some(watcher);
        *session.sweeper.lock() = Some(start_ttl_sweeper(Arc::clone(&store), 300));

        Ok(self.urls(&id))
    }

    async fn open_source(
        &self,
        descriptor: &SourceDescriptor,
        shared: &SessionShared,
    ) -> Result<SourceReader> {
        match descriptor {
            SourceDescriptor::ProgressiveHttp {
                url,
                wait_for_complete,
            } => {
                shared.set_status(SessionStatus::Downloading);
                let source =
                    ProgressiveSource::connect(&self.client, url, *wait_for_complete, &self.config)
                        .await?;
                Ok(SourceReader::Progressive(source))
            }
            SourceDescriptor::RangeHttp { url } => {
                let source = RangeCacheSource::connect(&self.client, url, &self.config).await?;
                Ok(SourceReader::RangeCache(source))
            }
            SourceDescriptor::LocalBlock {
                block_offset,
                block_length,
                byte_offset,
                byte_length,
                ..
            } => {
                let provider = self
                    .block_provider
                    .lock()
                    .clone()
                    .ok_or_else(|| {
                        SessionError::SourceNotSynced("no block provider registered".to_string())
                    })?;
                let source = BlockStoreSource::new(
                    &*provider,
                    *block_offset,
                    *block_length,
                    *byte_offset,
                    *byte_length,
                )?;
                Ok(SourceReader::BlockStore(source))
            }
        }
    }

    fn find_live(&self, key: &str) -> Option<Arc<Session>> {
        self.registry.iter().find_map(|entry| {
            let session = entry.value();
            if session.descriptor.dedup_key() == key
                && session.shared.status() != SessionStatus::Error
            {
                Some(Arc::clone(session))
            } else {
                None
            }
        })
    }

    fn urls(&self, id: &str) -> StartResult {
        let port = self.port.load(Ordering::Acquire);
        let lan_host = net::lan_ip().unwrap_or_else(|| "127.0.0.1".to_string());
        StartResult {
            session_id: id.to_string(),
            playlist_url_local: format!("http://127.0.0.1:{}/hls/{}/stream.m3u8", port, id),
            playlist_url_lan: format!("http://{}:{}/hls/{}/stream.m3u8", lan_host, port, id),
        }
    }

    /// Stop a session: flag the pipeline down, wait briefly for it to
    /// notice, then release every resource.
    pub async fn stop(&self, id: &str) -> bool {
        let Some((_, session)) = self.registry.remove(id) else {
            return false;
        };
        session.shared.request_stop();
        session.shared.set_diagnostic("Session stopped".to_string());
        session.shared.set_status(SessionStatus::Error);

        if let Some(watcher) = session.watcher.lock().take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), watcher).await;
        }
        if let Some(sweeper) = session.sweeper.lock().take() {
            sweeper.abort();
        }
        session.store.destroy().await;
        tracing::info!(session_id = %id, "Session stopped");
        true
    }

    /// Stop every session (shutdown path).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.registry.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn status(&self, id: &str) -> Option<SessionInfo> {
        self.get(id).map(|session| self.info(&session))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.registry
            .iter()
            .map(|entry| self.info(entry.value()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    fn info(&self, session: &Session) -> SessionInfo {
        SessionInfo {
            id: session.id.clone(),
            status: session.shared.status(),
            progress: session.shared.progress(),
            diagnostic: session.shared.diagnostic(),
            segments: session.store.highest_complete() + 1,
            created_at: session.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BlockProvider;
    use bytes::Bytes;
    use castbridge_codec::mock::{ContainerWriter, MockBackend, MockStreamDesc};
    use castbridge_codec::Rational;

    struct MemoryBlockLog {
        data: Vec<u8>,
    }

    impl BlockProvider for MemoryBlockLog {
        fn synced_len(&self) -> u64 {
            self.data.len() as u64
        }

        fn read(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
            let start = offset as usize;
            Ok(Bytes::copy_from_slice(&self.data[start..start + len]))
        }
    }

    fn sample_container(seconds: i64) -> Vec<u8> {
        let mut writer = ContainerWriter::new(
            false,
            &[MockStreamDesc::video(
                "h264",
                Rational::MILLIS,
                1920,
                1080,
            )],
        );
        // One keyframe per second at 25 fps.
        for i in 0..(seconds * 25) {
            let key = i % 25 == 0;
            writer.record(0, key, i * 40, &[0x42; 128]);
        }
        writer.finish()
    }

    fn block_descriptor(len: u64) -> SourceDescriptor {
        SourceDescriptor::LocalBlock {
            blocks_core_key: "test-key".to_string(),
            block_offset: 0,
            block_length: len,
            byte_offset: 0,
            byte_length: len,
        }
    }

    async fn manager_with_container(data: Vec<u8>) -> Arc<SessionManager> {
        let manager = SessionManager::new(
            Arc::new(MockBackend::new()),
            Arc::new(Config::default()),
        );
        manager.set_port(8411);
        manager.register_block_provider(Arc::new(MemoryBlockLog { data }));
        manager
    }

    async fn wait_for_terminal(manager: &SessionManager, id: &str) -> SessionStatus {
        for _ in 0..200 {
            match manager.status(id).map(|info| info.status) {
                Some(SessionStatus::Complete) => return SessionStatus::Complete,
                Some(SessionStatus::Error) => return SessionStatus::Error,
                Some(_) => tokio::time::sleep(Duration::from_millis(25)).await,
                None => break,
            }
        }
        manager
            .status(id)
            .map(|info| info.status)
            .unwrap_or(SessionStatus::Error)
    }

    #[tokio::test]
    async fn test_block_store_session_runs_to_complete() {
        let data = sample_container(8);
        let len = data.len() as u64;
        let manager = manager_with_container(data).await;

        let result = manager
            .start(block_descriptor(len), StartOptions::default())
            .await
            .unwrap();
        assert!(result
            .playlist_url_local
            .contains(&format!("/hls/{}/stream.m3u8", result.session_id)));

        let status = wait_for_terminal(&manager, &result.session_id).await;
        assert_eq!(status, SessionStatus::Complete);

        let info = manager.status(&result.session_id).unwrap();
        assert!(info.segments >= 2, "expected segments, got {}", info.segments);
        assert_eq!(info.progress, 100.0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_source() {
        let data = sample_container(8);
        let len = data.len() as u64;
        let manager = manager_with_container(data).await;

        let first = manager
            .start(block_descriptor(len), StartOptions::default())
            .await
            .unwrap();
        let second = manager
            .start(block_descriptor(len), StartOptions::default())
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.playlist_url_lan, second.playlist_url_lan);
        assert_eq!(manager.active_count(), 1);

        wait_for_terminal(&manager, &first.session_id).await;
    }

    #[tokio::test]
    async fn test_single_active_tears_down_other_sources() {
        let data = sample_container(8);
        let len = data.len() as u64;
        let manager = manager_with_container(data).await;

        let first = manager
            .start(block_descriptor(len), StartOptions::default())
            .await
            .unwrap();
        wait_for_terminal(&manager, &first.session_id).await;

        // Different byte range = different source.
        let other = SourceDescriptor::LocalBlock {
            blocks_core_key: "test-key".to_string(),
            block_offset: 0,
            block_length: len,
            byte_offset: 0,
            byte_length: len - 16,
        };
        let second = manager.start(other, StartOptions::default()).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(manager.active_count(), 1);
        assert!(manager.status(&first.session_id).is_none());

        wait_for_terminal(&manager, &second.session_id).await;
    }

    #[tokio::test]
    async fn test_unsynced_source_fails_start_without_session() {
        let data = sample_container(4);
        let manager = manager_with_container(data).await;

        // Ask for more bytes than the provider has synced.
        let result = manager
            .start(block_descriptor(1 << 30), StartOptions::default())
            .await;
        assert!(matches!(result, Err(SessionError::SourceNotSynced(_))));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_removes_session() {
        let data = sample_container(8);
        let len = data.len() as u64;
        let manager = manager_with_container(data).await;

        let result = manager
            .start(block_descriptor(len), StartOptions::default())
            .await
            .unwrap();
        assert!(manager.stop(&result.session_id).await);
        assert!(manager.status(&result.session_id).is_none());
        assert!(!manager.stop(&result.session_id).await);
    }
}
