//! Packet, frame and stream descriptions shared by every backend.

use crate::rational::Rational;
use bytes::Bytes;
use std::any::Any;

/// Kind of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Description of a demuxed stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream index within the container.
    pub index: usize,
    pub kind: MediaKind,
    /// Codec name as the backend reports it ("h264", "hevc", "aac", "eac3").
    pub codec: String,
    /// Timebase the stream's packet timestamps are expressed in.
    pub time_base: Rational,
    /// Video dimensions; zero for audio.
    pub width: u32,
    pub height: u32,
    /// Audio parameters; zero for video.
    pub sample_rate: u32,
    pub channels: u16,
    /// Codec extradata as stored in the container.
    pub extradata: Option<Bytes>,
    /// NAL units are length-prefixed (AVCC) rather than start-code-prefixed.
    pub length_prefixed_nals: bool,
}

/// A compressed packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    /// Timebase `pts`/`dts`/`duration` are expressed in.
    pub time_base: Rational,
    pub key: bool,
    pub data: Bytes,
}

/// Backend-owned frame payload. Opaque to the pipeline; only the backend
/// that produced a frame can interpret it.
pub type FrameHandle = Box<dyn Any + Send>;

/// A decoded frame. The pipeline reads and rewrites the timing fields and
/// passes the payload through scaler/resampler/FIFO untouched.
pub struct Frame {
    pub pts: i64,
    pub time_base: Rational,
    /// Samples in this frame; zero for video.
    pub nb_samples: usize,
    pub key: bool,
    pub handle: FrameHandle,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("pts", &self.pts)
            .field("time_base", &self.time_base)
            .field("nb_samples", &self.nb_samples)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Target audio format for resampling and FIFO buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

/// Sample formats the pipeline can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Planar 32-bit float (the AAC encoder's native format).
    FloatPlanar,
    /// Interleaved 32-bit float.
    Float,
    /// Interleaved signed 16-bit.
    S16,
}

/// Request to open an encoder.
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    /// Encoder name ("libx264", "h264_videotoolbox", "aac", ...).
    pub codec_name: String,
    pub kind: MediaKind,
    /// Timebase the encoder's output packets will carry.
    pub time_base: Rational,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u64,
    /// Keyframe interval in frames; zero leaves the encoder default.
    pub gop_size: u32,
    /// Backend-specific open options ("profile" = "high", "repeat-headers" =
    /// "1", ...).
    pub options: Vec<(String, String)>,
}

/// Description of one output stream handed to the muxer.
#[derive(Debug, Clone)]
pub struct MuxStreamSpec {
    pub kind: MediaKind,
    pub codec: String,
    /// Timebase packets handed to `write_packet` are expressed in.
    pub time_base: Rational,
    pub extradata: Option<Bytes>,
}

impl EncoderSpec {
    /// Look up an open option by key.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
