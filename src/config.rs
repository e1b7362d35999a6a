//! Runtime configuration.
//!
//! Loaded from a TOML file with serde defaults for every knob, so an empty
//! file (or none at all) yields the documented defaults. CLI flags override
//! the server section after loading.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub transcode: TranscodeConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind; 0 asks the OS for an ephemeral port.
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Floor for the progressive startup buffer.
    #[serde(default = "default_initial_buffer_min")]
    pub initial_buffer_min_bytes: u64,

    /// Ceiling for the progressive startup buffer.
    #[serde(default = "default_initial_buffer_max")]
    pub initial_buffer_max_bytes: u64,

    /// Range fetch for the container index at the end of the file.
    #[serde(default = "default_tail_prefetch")]
    pub tail_prefetch_bytes: u64,

    /// Abort the session when the download makes no progress for this long.
    #[serde(default = "default_idle_timeout")]
    pub idle_download_timeout_secs: u64,

    /// Block reads that cross the download watermark until bytes arrive.
    /// When false an underrun read reports end-of-stream and the session
    /// terminates with the caught-up diagnostic.
    #[serde(default = "default_true")]
    pub block_on_underrun: bool,

    /// Head prefetch for the range-cache source.
    #[serde(default = "default_start_prefetch")]
    pub start_prefetch_bytes: u64,

    /// Sequential lookahead for the range-cache source.
    #[serde(default = "default_prefetch_ahead")]
    pub prefetch_ahead_bytes: u64,

    /// Byte budget of the range cache before LRU eviction.
    #[serde(default = "default_range_cache_budget")]
    pub range_cache_budget_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscodeConfig {
    /// Soft segment cut at keyframes, seconds.
    #[serde(default = "default_target_segment")]
    pub target_segment_duration_secs: f64,

    /// Hard segment cut, seconds.
    #[serde(default = "default_max_segment")]
    pub max_segment_duration_secs: f64,

    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: u64,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u64,

    /// Try software H.264 first; it reliably emits per-keyframe SPS/PPS.
    #[serde(default = "default_true")]
    pub prefer_software_encoder: bool,

    /// Splice captured SPS/PPS into keyframes that lack them. Off by
    /// default; repeat-headers on the encoder is the preferred route.
    #[serde(default)]
    pub inject_parameter_sets: bool,

    /// Cooperative yield cadence in packets.
    #[serde(default = "default_yield_every")]
    pub yield_every_n_packets: u32,

    /// Per-packet codec errors tolerated before the session goes to Error.
    #[serde(default = "default_max_codec_errors")]
    pub max_codec_errors: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// In-memory segments kept before spilling the least-recently-accessed
    /// to disk.
    #[serde(default = "default_max_memory_segments")]
    pub max_memory_segments: usize,

    /// Sliding-window cap on the playlist; none keeps every segment listed
    /// so receivers can seek from the start.
    #[serde(default)]
    pub max_playlist_segments: Option<u32>,

    /// Disk-side retention for spilled segments, seconds.
    #[serde(default = "default_segment_ttl")]
    pub segment_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Tear down sessions for other sources when a new one starts.
    #[serde(default = "default_true")]
    pub single_active: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_initial_buffer_min() -> u64 {
    2 * 1024 * 1024
}
fn default_initial_buffer_max() -> u64 {
    32 * 1024 * 1024
}
fn default_tail_prefetch() -> u64 {
    10 * 1024 * 1024
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_start_prefetch() -> u64 {
    4 * 1024 * 1024
}
fn default_prefetch_ahead() -> u64 {
    8 * 1024 * 1024
}
fn default_range_cache_budget() -> u64 {
    64 * 1024 * 1024
}
fn default_target_segment() -> f64 {
    2.0
}
fn default_max_segment() -> f64 {
    4.0
}
fn default_video_bitrate() -> u64 {
    4_000_000
}
fn default_audio_bitrate() -> u64 {
    192_000
}
fn default_yield_every() -> u32 {
    50
}
fn default_max_codec_errors() -> u32 {
    20
}
fn default_max_memory_segments() -> usize {
    30
}
fn default_segment_ttl() -> u64 {
    2 * 60 * 60
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            initial_buffer_min_bytes: default_initial_buffer_min(),
            initial_buffer_max_bytes: default_initial_buffer_max(),
            tail_prefetch_bytes: default_tail_prefetch(),
            idle_download_timeout_secs: default_idle_timeout(),
            block_on_underrun: true,
            start_prefetch_bytes: default_start_prefetch(),
            prefetch_ahead_bytes: default_prefetch_ahead(),
            range_cache_budget_bytes: default_range_cache_budget(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            target_segment_duration_secs: default_target_segment(),
            max_segment_duration_secs: default_max_segment(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
            prefer_software_encoder: true,
            inject_parameter_sets: false,
            yield_every_n_packets: default_yield_every(),
            max_codec_errors: default_max_codec_errors(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_memory_segments: default_max_memory_segments(),
            max_playlist_segments: None,
            segment_ttl_secs: default_segment_ttl(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            single_active: true,
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the path is
    /// absent or unreadable.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Progressive startup threshold:
    /// `clamp(max(min, 2% of size), min, max)`.
    pub fn initial_buffer_bytes(&self, total_size: u64) -> u64 {
        let two_percent = total_size / 50;
        two_percent
            .max(self.source.initial_buffer_min_bytes)
            .min(self.source.initial_buffer_max_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transcode.target_segment_duration_secs, 2.0);
        assert_eq!(config.transcode.max_segment_duration_secs, 4.0);
        assert_eq!(config.store.max_memory_segments, 30);
        assert_eq!(config.store.segment_ttl_secs, 7200);
        assert!(config.store.max_playlist_segments.is_none());
        assert!(config.transcode.prefer_software_encoder);
        assert!(!config.transcode.inject_parameter_sets);
        assert!(config.session.single_active);
        assert_eq!(config.source.tail_prefetch_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_initial_buffer_clamp() {
        let config = Config::default();
        // Small file: floor wins.
        assert_eq!(config.initial_buffer_bytes(10 * 1024 * 1024), 2 * 1024 * 1024);
        // 700 MB: 2% = 14 MB, between the bounds.
        let seven_hundred_mb = 700 * 1024 * 1024;
        assert_eq!(
            config.initial_buffer_bytes(seven_hundred_mb),
            seven_hundred_mb / 50
        );
        // Huge file: ceiling wins.
        assert_eq!(
            config.initial_buffer_bytes(100 * 1024 * 1024 * 1024),
            32 * 1024 * 1024
        );
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [transcode]
            target_segment_duration_secs = 3.0

            [store]
            max_memory_segments = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.transcode.target_segment_duration_secs, 3.0);
        assert_eq!(config.store.max_memory_segments, 5);
        // Untouched knobs keep defaults.
        assert_eq!(config.transcode.max_segment_duration_secs, 4.0);
        assert_eq!(config.store.segment_ttl_secs, 7200);
    }
}
