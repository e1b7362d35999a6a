//! Range-fetching cache source.
//!
//! Compatibility variant for sources that should not be downloaded in full.
//! A sparse cache of immutable `[start, end)` byte ranges is filled by an
//! async fetcher driven from a two-priority queue: High for the head/tail
//! prefetch and demand misses, Normal for sequential lookahead. Cache
//! misses park the reader on the fetch completion; large seeks bump a
//! generation counter that invalidates queued Normal lookahead which no
//! longer covers near-future reads.

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::source::{resolve_seek, Whence};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Demand fetch size on a cache miss.
const FETCH_CHUNK: u64 = 4 * 1024 * 1024;

/// Sequential reads required before lookahead kicks in.
const SEQUENTIAL_THRESHOLD: u64 = 4;

#[derive(Debug)]
struct CachedRange {
    data: Bytes,
    last_used: u64,
}

/// The sparse range cache. Kept separate from the reader so the policy is
/// testable without a network.
pub(crate) struct RangeCacheInner {
    ranges: BTreeMap<u64, CachedRange>,
    bytes: u64,
    budget: u64,
    tick: u64,
    failed: Option<String>,
    last_progress: Instant,
    /// Outstanding demand request, to avoid re-enqueueing the same miss.
    inflight: Option<(u64, u64)>,
}

impl RangeCacheInner {
    fn new(budget: u64) -> Self {
        Self {
            ranges: BTreeMap::new(),
            bytes: 0,
            budget,
            tick: 0,
            failed: None,
            last_progress: Instant::now(),
            inflight: None,
        }
    }

    /// Insert a fetched range and evict least-recently-used ranges past the
    /// byte budget.
    fn insert(&mut self, start: u64, data: Bytes) {
        if data.is_empty() || self.covers(start, start + data.len() as u64) {
            return;
        }
        self.bytes += data.len() as u64;
        self.tick += 1;
        let tick = self.tick;
        self.ranges.insert(start, CachedRange { data, last_used: tick });
        self.last_progress = Instant::now();

        while self.bytes > self.budget && self.ranges.len() > 1 {
            let oldest = self
                .ranges
                .iter()
                .min_by_key(|(_, r)| r.last_used)
                .map(|(&s, _)| s);
            if let Some(start) = oldest {
                if let Some(removed) = self.ranges.remove(&start) {
                    self.bytes -= removed.data.len() as u64;
                }
            } else {
                break;
            }
        }
    }

    /// Whether `[start, end)` is entirely inside one cached range.
    fn covers(&self, start: u64, end: u64) -> bool {
        self.range_at(start)
            .map(|(range_start, range)| end <= range_start + range.data.len() as u64)
            .unwrap_or(false)
    }

    fn range_at(&self, pos: u64) -> Option<(u64, &CachedRange)> {
        let (&start, range) = self.ranges.range(..=pos).next_back()?;
        if pos < start + range.data.len() as u64 {
            Some((start, range))
        } else {
            None
        }
    }

    /// Copy cached bytes at `pos` into `buf`; 0 on a miss.
    fn read_into(&mut self, pos: u64, buf: &mut [u8]) -> usize {
        self.tick += 1;
        let tick = self.tick;
        let Some((&start, _)) = self.ranges.range(..=pos).next_back() else {
            return 0;
        };
        let Some(range) = self.ranges.get_mut(&start) else {
            return 0;
        };
        let offset = (pos - start) as usize;
        if offset >= range.data.len() {
            return 0;
        }
        range.last_used = tick;
        let n = buf.len().min(range.data.len() - offset);
        buf[..n].copy_from_slice(&range.data[offset..offset + n]);
        n
    }

    /// End of contiguous cached coverage starting at `pos`.
    fn coverage_end(&self, pos: u64) -> u64 {
        let mut end = pos;
        while let Some((start, range)) = self.range_at(end) {
            let range_end = start + range.data.len() as u64;
            if range_end == end {
                break;
            }
            end = range_end;
        }
        end
    }
}

struct CacheShared {
    inner: Mutex<RangeCacheInner>,
    cond: Condvar,
    notify: Notify,
}

#[derive(Debug)]
struct FetchJob {
    start: u64,
    end: u64,
    generation: u64,
}

pub struct RangeCacheSource {
    shared: Arc<CacheShared>,
    total: u64,
    pos: u64,
    last_read_end: u64,
    sequential_reads: u64,
    high_tx: mpsc::UnboundedSender<FetchJob>,
    normal_tx: mpsc::UnboundedSender<FetchJob>,
    generation: Arc<AtomicU64>,
    prefetch_ahead: u64,
    idle_timeout: Duration,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RangeCacheSource {
    /// Resolve the total size, start the fetcher, prefetch head and tail at
    /// High priority, and wait until the head bytes are readable.
    pub async fn connect(client: &reqwest::Client, url: &str, config: &Config) -> Result<Self> {
        let total = resolve_total_size(client, url).await?;
        let shared = Arc::new(CacheShared {
            inner: Mutex::new(RangeCacheInner::new(config.source.range_cache_budget_bytes)),
            cond: Condvar::new(),
            notify: Notify::new(),
        });
        let generation = Arc::new(AtomicU64::new(0));

        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let fetcher = tokio::spawn(run_fetcher(
            client.clone(),
            url.to_string(),
            Arc::clone(&shared),
            Arc::clone(&generation),
            high_rx,
            normal_rx,
        ));

        let head_end = config.source.start_prefetch_bytes.min(total);
        let tail_start = total.saturating_sub(config.source.tail_prefetch_bytes);
        let gen = generation.load(Ordering::SeqCst);
        let _ = high_tx.send(FetchJob {
            start: 0,
            end: head_end,
            generation: gen,
        });
        if tail_start > head_end {
            let _ = high_tx.send(FetchJob {
                start: tail_start,
                end: total,
                generation: gen,
            });
        }

        let idle_timeout = Duration::from_secs(config.source.idle_download_timeout_secs);
        await_coverage(&shared, head_end.min(1), idle_timeout).await?;

        tracing::info!(total, "Range-cache source ready");
        Ok(Self {
            shared,
            total,
            pos: 0,
            last_read_end: 0,
            sequential_reads: 0,
            high_tx,
            normal_tx,
            generation,
            prefetch_ahead: config.source.prefetch_ahead_bytes,
            idle_timeout,
            tasks: vec![fetcher],
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.total || buf.is_empty() {
            return Ok(0);
        }

        loop {
            let n = {
                let mut inner = self.shared.inner.lock();
                if let Some(msg) = &inner.failed {
                    return Err(SessionError::SourceUnavailable(msg.clone()));
                }
                let n = inner.read_into(self.pos, buf);
                if n == 0 {
                    self.request_miss(&mut inner);
                    let stalled_for = inner.last_progress.elapsed();
                    if stalled_for >= self.idle_timeout {
                        return Err(SessionError::SourceStalled {
                            seconds: stalled_for.as_secs(),
                        });
                    }
                    let _ = self
                        .shared
                        .cond
                        .wait_for(&mut inner, Duration::from_millis(250));
                    continue;
                }
                n
            };

            self.note_sequential(n as u64);
            self.pos += n as u64;
            return Ok(n);
        }
    }

    fn request_miss(&self, inner: &mut RangeCacheInner) {
        let start = self.pos;
        let end = (start + FETCH_CHUNK).min(self.total);
        if inner.inflight == Some((start, end)) {
            return;
        }
        inner.inflight = Some((start, end));
        let _ = self.high_tx.send(FetchJob {
            start,
            end,
            generation: self.generation.load(Ordering::SeqCst),
        });
    }

    /// Track sequential reads and issue Normal-priority lookahead once a
    /// streak is established.
    fn note_sequential(&mut self, n: u64) {
        if self.pos == self.last_read_end {
            self.sequential_reads += 1;
        } else {
            self.sequential_reads = 0;
        }
        self.last_read_end = self.pos + n;

        if self.sequential_reads >= SEQUENTIAL_THRESHOLD {
            let inner = self.shared.inner.lock();
            let covered_to = inner.coverage_end(self.pos);
            drop(inner);
            let want_to = (self.pos + self.prefetch_ahead).min(self.total);
            if covered_to < want_to {
                let _ = self.normal_tx.send(FetchJob {
                    start: covered_to,
                    end: want_to,
                    generation: self.generation.load(Ordering::SeqCst),
                });
            }
        }
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let target = resolve_seek(self.pos, self.total, offset, whence)?;
        if whence == Whence::SizeQuery {
            return Ok(target);
        }
        // A long jump makes queued lookahead useless; invalidate it.
        if target.abs_diff(self.pos) > self.prefetch_ahead {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.sequential_reads = 0;
        self.pos = target;
        Ok(target)
    }

    pub fn absolute_size(&self) -> u64 {
        self.total
    }

    pub fn close(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for RangeCacheSource {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve_total_size(client: &reqwest::Client, url: &str) -> Result<u64> {
    let response = client
        .head(url)
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
    response.content_length().filter(|&len| len > 0).ok_or_else(|| {
        SessionError::SourceUnavailable(format!("{}: total size unknown", url))
    })
}

async fn run_fetcher(
    client: reqwest::Client,
    url: String,
    shared: Arc<CacheShared>,
    generation: Arc<AtomicU64>,
    mut high_rx: mpsc::UnboundedReceiver<FetchJob>,
    mut normal_rx: mpsc::UnboundedReceiver<FetchJob>,
) {
    loop {
        let (job, high) = tokio::select! {
            biased;
            job = high_rx.recv() => match job {
                Some(job) => (job, true),
                None => return,
            },
            job = normal_rx.recv() => match job {
                Some(job) => (job, false),
                None => return,
            },
        };

        // Stale lookahead from before a long seek.
        if !high && job.generation != generation.load(Ordering::SeqCst) {
            continue;
        }
        if job.start >= job.end {
            continue;
        }

        let result = client
            .get(&url)
            .header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", job.start, job.end - 1),
            )
            .send()
            .await;
        let outcome = match result {
            Ok(response) if response.status().is_success() => {
                response.bytes().await.map_err(|e| e.to_string())
            }
            Ok(response) => Err(format!("range request answered HTTP {}", response.status())),
            Err(e) => Err(e.to_string()),
        };

        let mut inner = shared.inner.lock();
        if inner.inflight == Some((job.start, job.end)) {
            inner.inflight = None;
        }
        match outcome {
            Ok(data) => {
                tracing::trace!(start = job.start, len = data.len(), high, "Range fetched");
                inner.insert(job.start, data);
            }
            Err(e) if high => {
                tracing::warn!("Demand range fetch failed: {e}");
                inner.failed = Some(e);
            }
            Err(e) => {
                tracing::debug!("Lookahead range fetch failed: {e}");
            }
        }
        drop(inner);
        shared.cond.notify_all();
        shared.notify.notify_waiters();
    }
}

async fn await_coverage(
    shared: &Arc<CacheShared>,
    threshold: u64,
    idle_timeout: Duration,
) -> Result<()> {
    loop {
        {
            let inner = shared.inner.lock();
            if let Some(msg) = &inner.failed {
                return Err(SessionError::SourceUnavailable(msg.clone()));
            }
            if threshold == 0 || inner.covers(0, threshold) {
                return Ok(());
            }
            let stalled_for = inner.last_progress.elapsed();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_read() {
        let mut inner = RangeCacheInner::new(1024);
        inner.insert(100, Bytes::from(vec![5u8; 50]));

        let mut buf = [0u8; 20];
        assert_eq!(inner.read_into(100, &mut buf), 20);
        assert_eq!(buf, [5u8; 20]);
        assert_eq!(inner.read_into(140, &mut buf), 10);
        assert_eq!(inner.read_into(150, &mut buf), 0);
        assert_eq!(inner.read_into(0, &mut buf), 0);
    }

    #[test]
    fn test_covers() {
        let mut inner = RangeCacheInner::new(1024);
        inner.insert(0, Bytes::from(vec![1u8; 100]));
        assert!(inner.covers(0, 100));
        assert!(inner.covers(10, 90));
        assert!(!inner.covers(50, 150));
    }

    #[test]
    fn test_lru_eviction_respects_budget() {
        let mut inner = RangeCacheInner::new(100);
        inner.insert(0, Bytes::from(vec![0u8; 60]));
        inner.insert(1000, Bytes::from(vec![1u8; 60]));
        // First range is older and gets evicted.
        assert!(inner.bytes <= 100);
        assert!(inner.covers(1000, 1060));
        assert!(!inner.covers(0, 60));
    }

    #[test]
    fn test_lru_touch_on_read_protects_range() {
        let mut inner = RangeCacheInner::new(130);
        inner.insert(0, Bytes::from(vec![0u8; 60]));
        inner.insert(1000, Bytes::from(vec![1u8; 60]));
        // Touch the older range, then overflow the budget.
        let mut buf = [0u8; 1];
        inner.read_into(0, &mut buf);
        inner.insert(2000, Bytes::from(vec![2u8; 60]));

        assert!(inner.covers(0, 60));
        assert!(!inner.covers(1000, 1060));
        assert!(inner.covers(2000, 2060));
    }

    #[test]
    fn test_coverage_end_spans_adjacent_ranges() {
        let mut inner = RangeCacheInner::new(1024);
        inner.insert(0, Bytes::from(vec![0u8; 100]));
        inner.insert(100, Bytes::from(vec![1u8; 100]));
        assert_eq!(inner.coverage_end(0), 200);
        assert_eq!(inner.coverage_end(150), 200);
        assert_eq!(inner.coverage_end(300), 300);
    }

    #[test]
    fn test_duplicate_insert_ignored() {
        let mut inner = RangeCacheInner::new(1024);
        inner.insert(0, Bytes::from(vec![0u8; 100]));
        inner.insert(0, Bytes::from(vec![9u8; 50]));
        assert_eq!(inner.bytes, 100);
        let mut buf = [0u8; 1];
        inner.read_into(0, &mut buf);
        assert_eq!(buf[0], 0);
    }
}
