//! Progressive HTTP download source.
//!
//! An async downloader streams the response body into a temp file while a
//! synchronous reader serves the transcoder from a second handle. Two
//! watermarks gate reads: `written` (sequential download progress) and the
//! tail window `[tail_start, tail_start + tail_written)` filled by a range
//! fetch so the demuxer can reach the container index before the download
//! gets there.
//!
//! The reader never spins. On an underrun it either parks on the watermark
//! condvar until the downloader makes progress (the default on this
//! preemptive runtime) or, with `block_on_underrun` off, reports
//! end-of-stream immediately and lets the session terminate with the
//! caught-up diagnostic.

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::source::{resolve_seek, Whence};
use futures::StreamExt;
use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

struct DownloadState {
    written: u64,
    tail_start: u64,
    tail_written: u64,
    complete: bool,
    failed: Option<String>,
    last_progress: Instant,
}

struct Shared {
    state: Mutex<DownloadState>,
    cond: Condvar,
    notify: Notify,
}

impl Shared {
    fn wake(&self) {
        self.cond.notify_all();
        self.notify.notify_waiters();
    }
}

pub struct ProgressiveSource {
    shared: Arc<Shared>,
    file: File,
    pos: u64,
    total: u64,
    block_on_underrun: bool,
    idle_timeout: Duration,
    caught_up: bool,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _temp: TempPath,
}

impl ProgressiveSource {
    /// Connect to the URL, start the downloader and the tail range fetch,
    /// and wait for the initial buffer threshold (or the full download when
    /// `wait_for_complete` is set).
    pub async fn connect(
        client: &reqwest::Client,
        url: &str,
        wait_for_complete: bool,
        config: &Config,
    ) -> Result<Self> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| SessionError::SourceUnavailable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(SessionError::SourceUnavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }
        let total = response
            .content_length()
            .filter(|&len| len > 0)
            .ok_or_else(|| {
                SessionError::SourceUnavailable(format!("{}: total size unknown", url))
            })?;

        let temp = tempfile::NamedTempFile::new()?.into_temp_path();
        let shared = Arc::new(Shared {
            state: Mutex::new(DownloadState {
                written: 0,
                tail_start: total,
                tail_written: 0,
                complete: false,
                failed: None,
                last_progress: Instant::now(),
            }),
            cond: Condvar::new(),
            notify: Notify::new(),
        });

        let mut tasks = Vec::new();

        // Main download: stream the body we already opened.
        {
            let shared = Arc::clone(&shared);
            let path = temp.to_path_buf();
            tasks.push(tokio::spawn(async move {
                let result = run_body_download(response, &path, &shared).await;
                let mut state = shared.state.lock();
                match result {
                    Ok(()) => {
                        state.complete = true;
                        tracing::debug!(written = state.written, "Download complete");
                    }
                    Err(e) => {
                        tracing::warn!("Download failed: {e}");
                        state.failed = Some(e);
                    }
                }
                drop(state);
                shared.wake();
            }));
        }

        // Tail range fetch for the container index.
        let tail_len = config.source.tail_prefetch_bytes.min(total);
        if tail_len > 0 {
            let tail_start = total - tail_len;
            shared.state.lock().tail_start = tail_start;
            let shared = Arc::clone(&shared);
            let path = temp.to_path_buf();
            let client = client.clone();
            let url = url.to_string();
            tasks.push(tokio::spawn(async move {
                if let Err(e) =
                    run_tail_fetch(&client, &url, &path, tail_start, total, &shared).await
                {
                    // Tail prefetch is an optimization; reads past the
                    // watermark still resolve once the download arrives.
                    tracing::warn!("Tail range fetch failed: {e}");
                }
            }));
        }

        let threshold = if wait_for_complete {
            total
        } else {
            config.initial_buffer_bytes(total).min(total)
        };
        let idle_timeout = Duration::from_secs(config.source.idle_download_timeout_secs);
        if let Err(e) = await_written(&shared, threshold, idle_timeout).await {
            for task in &tasks {
                task.abort();
            }
            return Err(e);
        }

        let file = File::open(&temp)?;
        tracing::info!(total, threshold, "Progressive source ready");
        Ok(Self {
            shared,
            file,
            pos: 0,
            total,
            block_on_underrun: config.source.block_on_underrun,
            idle_timeout,
            caught_up: false,
            tasks,
            _temp: temp,
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.caught_up = false;
        if self.pos >= self.total || buf.is_empty() {
            return Ok(0);
        }

        loop {
            let available = {
                let mut state = self.shared.state.lock();
                if let Some(msg) = &state.failed {
                    return Err(SessionError::SourceUnavailable(msg.clone()));
                }
                let available = self.available_at(&state);
                if available == 0 {
                    if !self.block_on_underrun {
                        self.caught_up = true;
                        return Ok(0);
                    }
                    let stalled_for = state.last_progress.elapsed();
                    if stalled_for >= self.idle_timeout {
                        return Err(SessionError::SourceStalled {
                            seconds: stalled_for.as_secs(),
                        });
                    }
                    let _ = self
                        .shared
                        .cond
                        .wait_for(&mut state, Duration::from_millis(250));
                    continue;
                }
                available
            };

            let n = (buf.len() as u64).min(available) as usize;
            self.file.seek(SeekFrom::Start(self.pos))?;
            self.file.read_exact(&mut buf[..n])?;
            self.pos += n as u64;
            return Ok(n);
        }
    }

    /// Contiguous bytes readable at the current position under the
    /// watermark invariant.
    fn available_at(&self, state: &DownloadState) -> u64 {
        if state.complete {
            return self.total - self.pos;
        }
        if self.pos < state.written {
            return state.written - self.pos;
        }
        let tail_end = state.tail_start + state.tail_written;
        if self.pos >= state.tail_start && self.pos < tail_end {
            return tail_end - self.pos;
        }
        0
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let target = resolve_seek(self.pos, self.total, offset, whence)?;
        if whence != Whence::SizeQuery {
            self.pos = target;
        }
        Ok(target)
    }

    pub fn absolute_size(&self) -> u64 {
        self.total
    }

    pub fn caught_up(&self) -> bool {
        self.caught_up
    }

    pub fn download_progress(&self) -> (u64, u64) {
        self.progress_probe().get()
    }

    /// Cloneable handle reporting download progress after the reader has
    /// moved into the demux bridge.
    pub fn progress_probe(&self) -> ProgressProbe {
        ProgressProbe {
            shared: Arc::clone(&self.shared),
            total: self.total,
        }
    }

    pub fn close(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.wake();
    }
}

impl Drop for ProgressiveSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Download progress readout detached from the reader.
#[derive(Clone)]
pub struct ProgressProbe {
    shared: Arc<Shared>,
    total: u64,
}

impl ProgressProbe {
    /// `(received, total)` bytes.
    pub fn get(&self) -> (u64, u64) {
        let state = self.shared.state.lock();
        let received = if state.complete {
            self.total
        } else {
            state.written + state.tail_written
        };
        (received.min(self.total), self.total)
    }
}

async fn run_body_download(
    response: reqwest::Response,
    path: &std::path::Path,
    shared: &Shared,
) -> std::result::Result<(), String> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| e.to_string())?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        let mut state = shared.state.lock();
        state.written += chunk.len() as u64;
        state.last_progress = Instant::now();
        drop(state);
        shared.wake();
    }
    Ok(())
}

async fn run_tail_fetch(
    client: &reqwest::Client,
    url: &str,
    path: &std::path::Path,
    tail_start: u64,
    total: u64,
    shared: &Shared,
) -> std::result::Result<(), String> {
    let response = client
        .get(url)
        .header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", tail_start, total - 1),
        )
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(format!("range request answered HTTP {}", response.status()));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| e.to_string())?;
    file.seek(SeekFrom::Start(tail_start))
        .await
        .map_err(|e| e.to_string())?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        let mut state = shared.state.lock();
        state.tail_written += chunk.len() as u64;
        state.last_progress = Instant::now();
        drop(state);
        shared.wake();
    }
    tracing::debug!(tail_start, "Tail range fetch complete");
    Ok(())
}

async fn await_written(shared: &Arc<Shared>, threshold: u64, idle_timeout: Duration) -> Result<()> {
    loop {
        {
            let state = shared.state.lock();
            if let Some(msg) = &state.failed {
                return Err(SessionError::SourceUnavailable(msg.clone()));
            }
            if state.written >= threshold || state.complete {
                return Ok(());
            }
            let stalled_for = state.last_progress.elapsed();
            if stalled_for >= idle_timeout {
                return Err(SessionError::SourceStalled {
                    seconds: stalled_for.as_secs(),
                });
            }
        }
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}
