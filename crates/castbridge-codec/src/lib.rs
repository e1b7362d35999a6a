//! Capability-scoped codec surface for the castbridge pipeline.
//!
//! The transcoder core never talks to a concrete codec library; it drives
//! the traits defined here. A backend supplies exactly the capabilities the
//! pipeline needs — demuxing over pull-style I/O, decode/encode in
//! send/receive form, scaling, resampling, a sample-accurate audio FIFO, an
//! MPEG-TS muxer writing into a caller-owned sink, and the AVCC→Annex-B
//! bitstream filter — and nothing richer, which keeps the pipeline portable
//! across FFmpeg bindings and test doubles.
//!
//! The `mock` feature ships a deterministic in-process backend used by the
//! test suite and by `castbridge --features mock-codec` demo builds.

pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod rational;
pub mod types;

pub use error::{CodecError, Result};
pub use rational::{rescale, Rational};
pub use types::{
    AudioFormat, EncoderSpec, Frame, FrameHandle, MediaKind, MuxStreamSpec, Packet, SampleFormat,
    StreamInfo,
};

/// Seek origin for [`MediaIo::seek`].
///
/// `Size` is the size-query whence: it returns the total size without
/// moving the position, matching the codec-library callback convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWhence {
    Start,
    Current,
    End,
    Size,
}

/// Pull-style synchronous I/O handed to a demuxer.
///
/// `read` returning `Ok(0)` means end of stream. Implementations must not
/// busy-wait; if they cannot produce bytes they either block on real
/// progress or report EOF and record why.
pub trait MediaIo: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn seek(&mut self, offset: i64, whence: IoWhence) -> Result<u64>;
    /// Total size when known.
    fn size(&self) -> Option<u64>;
}

/// An opened input container.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];
    /// Next packet in container order; `None` at end of stream.
    fn read_packet(&mut self) -> Result<Option<Packet>>;
}

/// A decoder in send/receive form. `send_packet(None)` enters drain mode.
pub trait Decoder: Send {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<()>;
    fn receive_frame(&mut self) -> Result<Option<Frame>>;
}

/// An encoder in send/receive form. `send_frame(None)` enters drain mode.
pub trait Encoder: Send {
    fn send_frame(&mut self, frame: Option<&Frame>) -> Result<()>;
    fn receive_packet(&mut self) -> Result<Option<Packet>>;
    /// Timebase of emitted packets.
    fn time_base(&self) -> Rational;
    /// Out-of-band codec configuration produced at open time (SPS/PPS for
    /// H.264, ASC for AAC). `None` when the encoder does not populate it.
    fn extradata(&self) -> Option<bytes::Bytes>;
    /// Fixed input frame size in samples, for audio encoders that require
    /// one (1024 for AAC-LC).
    fn frame_size(&self) -> Option<usize> {
        None
    }
}

/// Pixel-format/size converter.
pub trait Scaler: Send {
    fn convert(&mut self, frame: &Frame) -> Result<Frame>;
}

/// Sample-format/rate/layout converter.
pub trait Resampler: Send {
    fn convert(&mut self, frame: &Frame) -> Result<Frame>;
}

/// Sample-accurate audio buffer reconciling input frame sizes with the
/// encoder's fixed frame size.
pub trait AudioFifo: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;
    /// Read exactly `nb_samples` into a new frame; `None` if fewer are
    /// buffered.
    fn read(&mut self, nb_samples: usize) -> Result<Option<Frame>>;
    /// Buffered sample count.
    fn size(&self) -> usize;
}

/// Byte sink a muxer writes into. Every write is a fresh defensive copy on
/// the sink side; the muxer may reuse its buffers immediately after.
pub trait MuxSink: Send {
    fn write(&mut self, data: &[u8]);
}

/// An output muxer bound to a sink at creation.
pub trait Muxer: Send {
    fn write_header(&mut self) -> Result<()>;
    fn write_packet(&mut self, packet: &Packet) -> Result<()>;
    /// Push any internally buffered bytes to the sink.
    fn flush(&mut self) -> Result<()>;
    fn write_trailer(&mut self) -> Result<()>;
}

/// Packet-level bitstream filter (AVCC → Annex-B).
pub trait BitstreamFilter: Send {
    fn filter(&mut self, packet: &Packet) -> Result<Packet>;
}

/// Factory surface of a codec backend.
pub trait CodecBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Probe and open a container over pull-style I/O.
    fn open_input(&self, io: Box<dyn MediaIo>) -> Result<Box<dyn Demuxer>>;

    /// Whether an encoder with this exact name is available.
    fn has_encoder(&self, name: &str) -> bool;

    fn new_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>>;

    fn new_encoder(&self, spec: &EncoderSpec) -> Result<Box<dyn Encoder>>;

    fn new_scaler(
        &self,
        src: &StreamInfo,
        dst_width: u32,
        dst_height: u32,
    ) -> Result<Box<dyn Scaler>>;

    fn new_resampler(&self, src: &StreamInfo, dst: &AudioFormat) -> Result<Box<dyn Resampler>>;

    fn new_audio_fifo(&self, format: &AudioFormat) -> Result<Box<dyn AudioFifo>>;

    /// Create a muxer for `format` ("mpegts") writing into `sink`.
    /// `options` are format-specific ("mpegts_flags", "pcr_period", ...).
    fn new_muxer(
        &self,
        format: &str,
        streams: &[MuxStreamSpec],
        sink: Box<dyn MuxSink>,
        options: &[(String, String)],
    ) -> Result<Box<dyn Muxer>>;

    fn new_bitstream_filter(
        &self,
        name: &str,
        stream: &StreamInfo,
    ) -> Result<Box<dyn BitstreamFilter>>;
}
