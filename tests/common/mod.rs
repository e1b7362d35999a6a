//! Shared harness for integration tests.
//!
//! Boots the HLS server on an ephemeral port with a session manager backed
//! by the mock codec and an in-memory block log, so whole sessions run
//! end-to-end without a network or a native codec library.

use bytes::Bytes;
use castbridge::config::Config;
use castbridge::server::{create_router, AppContext};
use castbridge::session::{SessionManager, SessionStatus, StartOptions, StartResult};
use castbridge::source::{BlockProvider, SourceDescriptor};
use castbridge_codec::mock::{ContainerWriter, MockBackend, MockStreamDesc};
use castbridge_codec::Rational;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct MemoryBlockLog {
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

pub struct TestApp {
    pub addr: SocketAddr,
    pub manager: Arc<SessionManager>,
    pub source_len: u64,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::LocalBlock {
            blocks_core_key: "test-log".to_string(),
            block_offset: 0,
            block_length: self.source_len,
            byte_offset: 0,
            byte_length: self.source_len,
        }
    }

    pub async fn start_session(&self, title: Option<&str>) -> StartResult {
        self.manager
            .start(
                self.descriptor(),
                StartOptions {
                    title: title.map(|t| t.to_string()),
                },
            )
            .await
            .expect("session start")
    }

    pub async fn wait_for_terminal(&self, id: &str) -> SessionStatus {
        for _ in 0..400 {
            match self.manager.status(id).map(|info| info.status) {
                Some(SessionStatus::Complete) => return SessionStatus::Complete,
                Some(SessionStatus::Error) => return SessionStatus::Error,
                Some(_) => tokio::time::sleep(Duration::from_millis(25)).await,
                None => break,
            }
        }
        panic!("session {id} did not reach a terminal state");
    }
}

/// Annex-B keyframe payload: SPS + PPS + IDR slice.
pub fn keyframe_payload() -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x29, 0x01]);
    data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xEB, 0xE3, 0xCB]);
    data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);
    data.extend_from_slice(&[0x55; 96]);
    data
}

/// Annex-B delta payload: one non-IDR slice.
pub fn delta_payload() -> Vec<u8> {
    let mut data = vec![0, 0, 0, 1, 0x41, 0x9A];
    data.extend_from_slice(&[0x33; 96]);
    data
}

/// A mock container: H.264-style Annex-B video at 25 fps with a keyframe
/// every second, plus (optionally) E-AC-3-style audio in 1536-sample
/// frames.
pub fn sample_container(seconds: i64, with_audio: bool) -> Vec<u8> {
    let mut streams = vec![MockStreamDesc::video(
        "h264",
        Rational::new(1, 1000),
        1920,
        1080,
    )];
    if with_audio {
        streams.push(MockStreamDesc::audio("eac3", 48_000, 2));
    }
    let mut writer = ContainerWriter::new(false, &streams);

    let mut audio_samples: i64 = 0;
    for i in 0..(seconds * 25) {
        let pts_ms = i * 40;
        let key = i % 25 == 0;
        let payload = if key { keyframe_payload() } else { delta_payload() };
        writer.record(0, key, pts_ms, &payload);
        if with_audio {
            // Keep audio caught up with video.
            while audio_samples * 1000 / 48_000 <= pts_ms {
                writer.record(1, false, audio_samples, &vec![0u8; 1536 * 2 * 4]);
                audio_samples += 1536;
            }
        }
    }
    writer.finish()
}

pub async fn spawn_app(config: Config, container: Vec<u8>) -> TestApp {
    let source_len = container.len() as u64;
    let manager = SessionManager::new(Arc::new(MockBackend::new()), Arc::new(config));
    manager.register_block_provider(Arc::new(MemoryBlockLog { data: container }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    manager.set_port(addr.port());

    let ctx = AppContext {
        sessions: Arc::clone(&manager),
    };
    tokio::spawn(async move {
        axum::serve(listener, create_router(ctx))
            .await
            .expect("test server");
    });

    TestApp {
        addr,
        manager,
        source_len,
    }
}
