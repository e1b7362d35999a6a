//! Deterministic in-process codec backend.
//!
//! Implements the full capability surface over a tiny record container so
//! the pipeline — demux bridge, decode/encode loops, FIFO feeding, segment
//! cutting, PSI patching — can run end-to-end in tests without a native
//! codec library. The muxer emits real 188-byte transport stream packets
//! (PAT/PMT included) and enforces the contract the pipeline is supposed to
//! uphold: MPEG-TS timebase on every written packet and monotonic DTS per
//! stream.

use crate::error::{CodecError, Result};
use crate::rational::Rational;
use crate::types::{
    AudioFormat, EncoderSpec, Frame, MediaKind, MuxStreamSpec, Packet, StreamInfo,
};
use crate::{
    AudioFifo, BitstreamFilter, CodecBackend, Decoder, Demuxer, Encoder, IoWhence, MediaIo,
    MuxSink, Muxer, Resampler, Scaler,
};
use bytes::Bytes;
use castbridge_media::ts;
use std::collections::VecDeque;

/// Container magic for the mock record format.
pub const CONTAINER_MAGIC: &[u8; 4] = b"CBX1";

const SPS_NAL: &[u8] = &[0x67, 0x64, 0x00, 0x29, 0x01];
const PPS_NAL: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB];
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

// ---------------------------------------------------------------------------
// Container writer (test input generation)
// ---------------------------------------------------------------------------

/// Stream description for [`ContainerWriter`].
#[derive(Debug, Clone)]
pub struct MockStreamDesc {
    pub kind: MediaKind,
    pub codec: String,
    pub time_base: Rational,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
}

impl MockStreamDesc {
    pub fn video(codec: &str, time_base: Rational, width: u32, height: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            codec: codec.to_string(),
            time_base,
            sample_rate: 0,
            channels: 0,
            width,
            height,
        }
    }

    pub fn audio(codec: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: MediaKind::Audio,
            codec: codec.to_string(),
            time_base: Rational::per_sample(sample_rate),
            sample_rate,
            channels,
            width: 0,
            height: 0,
        }
    }
}

/// Serializes streams and records into the mock container format.
pub struct ContainerWriter {
    buf: Vec<u8>,
}

impl ContainerWriter {
    pub fn new(length_prefixed_video: bool, streams: &[MockStreamDesc]) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(CONTAINER_MAGIC);
        buf.push(length_prefixed_video as u8);
        buf.push(streams.len() as u8);
        for s in streams {
            buf.push(match s.kind {
                MediaKind::Video => 0,
                MediaKind::Audio => 1,
            });
            buf.push(0);
            buf.extend_from_slice(&s.channels.to_le_bytes());
            let mut tag = [b' '; 4];
            for (i, b) in s.codec.bytes().take(4).enumerate() {
                tag[i] = b;
            }
            buf.extend_from_slice(&tag);
            buf.extend_from_slice(&s.time_base.num.to_le_bytes());
            buf.extend_from_slice(&s.time_base.den.to_le_bytes());
            buf.extend_from_slice(&if s.kind == MediaKind::Video {
                s.width.to_le_bytes()
            } else {
                s.sample_rate.to_le_bytes()
            });
            buf.extend_from_slice(&s.height.to_le_bytes());
        }
        Self { buf }
    }

    pub fn record(&mut self, stream_index: usize, key: bool, pts: i64, payload: &[u8]) {
        self.buf.push(stream_index as u8);
        self.buf.push(key as u8);
        self.buf.extend_from_slice(&[0, 0]);
        self.buf.extend_from_slice(&pts.to_le_bytes());
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// In-memory [`MediaIo`] over a byte buffer, for unit tests.
pub struct MemoryIo {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryIo {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl MediaIo for MemoryIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: IoWhence) -> Result<u64> {
        let len = self.data.len() as i64;
        let target = match whence {
            IoWhence::Start => offset,
            IoWhence::Current => self.pos as i64 + offset,
            IoWhence::End => len + offset,
            IoWhence::Size => return Ok(len as u64),
        };
        self.pos = target.clamp(0, len) as usize;
        Ok(self.pos as u64)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// The mock backend. Encoder availability is configurable so codec-missing
/// degradation paths can be tested.
pub struct MockBackend {
    encoders: Vec<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            encoders: vec![
                "libx264".to_string(),
                "h264_videotoolbox".to_string(),
                "aac".to_string(),
            ],
        }
    }

    /// A backend advertising exactly the given encoders.
    pub fn with_encoders(encoders: &[&str]) -> Self {
        Self {
            encoders: encoders.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn open_input(&self, io: Box<dyn MediaIo>) -> Result<Box<dyn Demuxer>> {
        MockDemuxer::open(io).map(|d| Box::new(d) as Box<dyn Demuxer>)
    }

    fn has_encoder(&self, name: &str) -> bool {
        self.encoders.iter().any(|e| e == name)
    }

    fn new_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(MockDecoder {
            kind: stream.kind,
            channels: stream.channels.max(1),
            queue: VecDeque::new(),
        }))
    }

    fn new_encoder(&self, spec: &EncoderSpec) -> Result<Box<dyn Encoder>> {
        if !self.has_encoder(&spec.codec_name) {
            return Err(CodecError::EncoderNotFound(spec.codec_name.clone()));
        }
        match spec.kind {
            MediaKind::Video => Ok(Box::new(MockVideoEncoder {
                time_base: spec.time_base,
                gop: spec.gop_size.max(1) as u64,
                repeat_headers: spec.option("repeat-headers") == Some("1"),
                frame_count: 0,
                first_key_emitted: false,
                queue: VecDeque::new(),
            })),
            MediaKind::Audio => Ok(Box::new(MockAudioEncoder {
                time_base: spec.time_base,
                populate_extradata: spec.option("populate-extradata") == Some("1"),
                sample_rate: spec.sample_rate,
                channels: spec.channels,
                queue: VecDeque::new(),
            })),
        }
    }

    fn new_scaler(
        &self,
        _src: &StreamInfo,
        _dst_width: u32,
        _dst_height: u32,
    ) -> Result<Box<dyn Scaler>> {
        Ok(Box::new(Passthrough))
    }

    fn new_resampler(&self, _src: &StreamInfo, _dst: &AudioFormat) -> Result<Box<dyn Resampler>> {
        Ok(Box::new(Passthrough))
    }

    fn new_audio_fifo(&self, format: &AudioFormat) -> Result<Box<dyn AudioFifo>> {
        Ok(Box::new(MockAudioFifo {
            pending: 0,
            format: *format,
        }))
    }

    fn new_muxer(
        &self,
        format: &str,
        streams: &[MuxStreamSpec],
        sink: Box<dyn MuxSink>,
        options: &[(String, String)],
    ) -> Result<Box<dyn Muxer>> {
        if format != "mpegts" {
            return Err(CodecError::Backend(format!(
                "mock backend only muxes mpegts, got {}",
                format
            )));
        }
        let option = |key: &str| {
            options
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let resend_headers = option("mpegts_flags")
            .map(|v| v.contains("resend_headers"))
            .unwrap_or(false);
        Ok(Box::new(MockMuxer {
            streams: streams.to_vec(),
            sink,
            resend_headers,
            omit_psi: option("omit-psi") == Some("1"),
            header_written: false,
            trailer_written: false,
            psi_cc: 0,
            stream_cc: vec![0; streams.len()],
            last_dts: vec![i64::MIN; streams.len()],
        }))
    }

    fn new_bitstream_filter(
        &self,
        name: &str,
        _stream: &StreamInfo,
    ) -> Result<Box<dyn BitstreamFilter>> {
        if name != "h264_mp4toannexb" {
            return Err(CodecError::FilterNotFound(name.to_string()));
        }
        Ok(Box::new(AvccToAnnexB))
    }
}

// ---------------------------------------------------------------------------
// Demuxer
// ---------------------------------------------------------------------------

struct MockDemuxer {
    io: Box<dyn MediaIo>,
    streams: Vec<StreamInfo>,
}

impl MockDemuxer {
    fn open(mut io: Box<dyn MediaIo>) -> Result<Self> {
        // Probe the magic, then rewind and parse the whole header, the way
        // a real demuxer re-reads after format detection. Exercises the
        // bridge's seek path.
        let mut magic = [0u8; 4];
        read_exact(&mut *io, &mut magic)?;
        if &magic != CONTAINER_MAGIC {
            return Err(CodecError::InvalidData("bad container magic".into()));
        }
        io.seek(0, IoWhence::Start)?;
        read_exact(&mut *io, &mut magic)?;

        let mut head = [0u8; 2];
        read_exact(&mut *io, &mut head)?;
        let length_prefixed = head[0] != 0;
        let stream_count = head[1] as usize;

        let mut streams = Vec::with_capacity(stream_count);
        for index in 0..stream_count {
            let mut desc = [0u8; 24];
            read_exact(&mut *io, &mut desc)?;
            let kind = if desc[0] == 0 {
                MediaKind::Video
            } else {
                MediaKind::Audio
            };
            let channels = u16::from_le_bytes([desc[2], desc[3]]);
            let codec = String::from_utf8_lossy(&desc[4..8]).trim_end().to_string();
            let num = i32::from_le_bytes([desc[8], desc[9], desc[10], desc[11]]);
            let den = i32::from_le_bytes([desc[12], desc[13], desc[14], desc[15]]);
            let rate_or_width = u32::from_le_bytes([desc[16], desc[17], desc[18], desc[19]]);
            let height = u32::from_le_bytes([desc[20], desc[21], desc[22], desc[23]]);
            streams.push(StreamInfo {
                index,
                kind,
                codec,
                time_base: Rational::new(num, den),
                width: if kind == MediaKind::Video {
                    rate_or_width
                } else {
                    0
                },
                height,
                sample_rate: if kind == MediaKind::Audio {
                    rate_or_width
                } else {
                    0
                },
                channels,
                extradata: None,
                length_prefixed_nals: kind == MediaKind::Video && length_prefixed,
            });
        }

        Ok(Self { io, streams })
    }
}

impl Demuxer for MockDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut head = [0u8; 16];
        if !read_exact_or_eof(&mut *self.io, &mut head)? {
            return Ok(None);
        }
        let stream_index = head[0] as usize;
        if stream_index >= self.streams.len() {
            return Err(CodecError::InvalidData(format!(
                "record for unknown stream {}",
                stream_index
            )));
        }
        let key = head[1] & 0x01 != 0;
        let pts = i64::from_le_bytes(head[4..12].try_into().unwrap());
        let len = u32::from_le_bytes(head[12..16].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        read_exact(&mut *self.io, &mut payload)?;
        let stream = &self.streams[stream_index];
        Ok(Some(Packet {
            stream_index,
            pts,
            dts: pts,
            duration: 0,
            time_base: stream.time_base,
            key,
            data: Bytes::from(payload),
        }))
    }
}

fn read_exact(io: &mut dyn MediaIo, buf: &mut [u8]) -> Result<()> {
    if !read_exact_or_eof(io, buf)? {
        return Err(CodecError::InvalidData("unexpected end of container".into()));
    }
    Ok(())
}

/// Fill `buf` completely, or return `Ok(false)` when the source reported
/// end-of-stream before the first byte. A mid-buffer EOF is an error.
fn read_exact_or_eof(io: &mut dyn MediaIo, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CodecError::InvalidData(
                "container truncated mid-record".into(),
            ));
        }
        filled += n;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Decoder and converters
// ---------------------------------------------------------------------------

/// Frame payload produced by the mock decoder.
#[derive(Clone)]
enum MockPayload {
    Video(Vec<u8>),
    Audio { nb_samples: usize },
}

struct MockDecoder {
    kind: MediaKind,
    channels: u16,
    queue: VecDeque<Frame>,
}

impl Decoder for MockDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<()> {
        let Some(packet) = packet else {
            return Ok(()); // no delay in the mock, drain is a no-op
        };
        let frame = match self.kind {
            MediaKind::Video => Frame {
                pts: packet.pts,
                time_base: packet.time_base,
                nb_samples: 0,
                key: packet.key,
                handle: Box::new(MockPayload::Video(packet.data.to_vec())),
            },
            MediaKind::Audio => {
                let nb_samples = packet.data.len() / (self.channels as usize * 4).max(1);
                Frame {
                    pts: packet.pts,
                    time_base: packet.time_base,
                    nb_samples,
                    key: false,
                    handle: Box::new(MockPayload::Audio { nb_samples }),
                }
            }
        };
        self.queue.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.queue.pop_front())
    }
}

struct Passthrough;

fn clone_frame(frame: &Frame) -> Result<Frame> {
    let payload = frame
        .handle
        .downcast_ref::<MockPayload>()
        .ok_or_else(|| CodecError::Misuse("frame from a different backend".into()))?;
    Ok(Frame {
        pts: frame.pts,
        time_base: frame.time_base,
        nb_samples: frame.nb_samples,
        key: frame.key,
        handle: Box::new(payload.clone()),
    })
}

impl Scaler for Passthrough {
    fn convert(&mut self, frame: &Frame) -> Result<Frame> {
        clone_frame(frame)
    }
}

impl Resampler for Passthrough {
    fn convert(&mut self, frame: &Frame) -> Result<Frame> {
        clone_frame(frame)
    }
}

struct MockAudioFifo {
    pending: usize,
    format: AudioFormat,
}

impl AudioFifo for MockAudioFifo {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.pending += frame.nb_samples;
        Ok(())
    }

    fn read(&mut self, nb_samples: usize) -> Result<Option<Frame>> {
        if nb_samples == 0 || self.pending < nb_samples {
            return Ok(None);
        }
        self.pending -= nb_samples;
        Ok(Some(Frame {
            pts: 0,
            time_base: Rational::per_sample(self.format.sample_rate),
            nb_samples,
            key: false,
            handle: Box::new(MockPayload::Audio { nb_samples }),
        }))
    }

    fn size(&self) -> usize {
        self.pending
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

struct MockVideoEncoder {
    time_base: Rational,
    gop: u64,
    repeat_headers: bool,
    frame_count: u64,
    first_key_emitted: bool,
    queue: VecDeque<Packet>,
}

impl Encoder for MockVideoEncoder {
    fn send_frame(&mut self, frame: Option<&Frame>) -> Result<()> {
        let Some(frame) = frame else {
            return Ok(());
        };
        let key = self.frame_count % self.gop == 0;
        self.frame_count += 1;

        let mut data = Vec::new();
        if key && (self.repeat_headers || !self.first_key_emitted) {
            data.extend_from_slice(START_CODE);
            data.extend_from_slice(SPS_NAL);
            data.extend_from_slice(START_CODE);
            data.extend_from_slice(PPS_NAL);
        }
        data.extend_from_slice(START_CODE);
        data.push(if key { 0x65 } else { 0x41 });
        // Deterministic slice body derived from the frame count.
        data.extend_from_slice(&self.frame_count.to_be_bytes());
        data.resize(data.len() + 32, 0x55);
        if key {
            self.first_key_emitted = true;
        }

        self.queue.push_back(Packet {
            stream_index: 0,
            pts: frame.pts,
            dts: frame.pts,
            duration: 0,
            time_base: self.time_base,
            key,
            data: Bytes::from(data),
        });
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>> {
        Ok(self.queue.pop_front())
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn extradata(&self) -> Option<Bytes> {
        let mut data = Vec::new();
        data.extend_from_slice(START_CODE);
        data.extend_from_slice(SPS_NAL);
        data.extend_from_slice(START_CODE);
        data.extend_from_slice(PPS_NAL);
        Some(Bytes::from(data))
    }
}

struct MockAudioEncoder {
    time_base: Rational,
    populate_extradata: bool,
    sample_rate: u32,
    channels: u16,
    queue: VecDeque<Packet>,
}

impl Encoder for MockAudioEncoder {
    fn send_frame(&mut self, frame: Option<&Frame>) -> Result<()> {
        let Some(frame) = frame else {
            return Ok(());
        };
        // Raw AAC-ish payload, sized roughly like a real 1024-sample frame.
        let data = vec![0xA5u8; 16 + frame.nb_samples / 8];
        self.queue.push_back(Packet {
            stream_index: 1,
            pts: frame.pts,
            dts: frame.pts,
            duration: frame.nb_samples as i64,
            time_base: self.time_base,
            key: true,
            data: Bytes::from(data),
        });
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<Packet>> {
        Ok(self.queue.pop_front())
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn extradata(&self) -> Option<Bytes> {
        if self.populate_extradata {
            let asc = castbridge_media::synthesize_asc(self.sample_rate, self.channels).ok()?;
            Some(Bytes::copy_from_slice(&asc))
        } else {
            None
        }
    }

    fn frame_size(&self) -> Option<usize> {
        Some(1024)
    }
}

// ---------------------------------------------------------------------------
// Muxer and bitstream filter
// ---------------------------------------------------------------------------

const PMT_PID: u16 = 0x1000;
const ES_PID_BASE: u16 = 0x0100;

struct MockMuxer {
    streams: Vec<MuxStreamSpec>,
    sink: Box<dyn MuxSink>,
    resend_headers: bool,
    omit_psi: bool,
    header_written: bool,
    trailer_written: bool,
    psi_cc: u8,
    stream_cc: Vec<u8>,
    last_dts: Vec<i64>,
}

impl MockMuxer {
    fn write_psi(&mut self) {
        let pat = ts::build_pat(PMT_PID, self.psi_cc);
        let entries: Vec<ts::PmtStreamEntry> = self
            .streams
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let stream_type = match s.kind {
                    MediaKind::Video => 0x1B,
                    MediaKind::Audio => 0x0F,
                };
                (stream_type, ES_PID_BASE + i as u16)
            })
            .collect();
        let pmt = ts::build_pmt(PMT_PID, ES_PID_BASE, &entries, self.psi_cc);
        self.psi_cc = (self.psi_cc + 1) & 0x0F;
        self.sink.write(&pat);
        self.sink.write(&pmt);
    }

    fn pes_wrap(stream: &MuxStreamSpec, packet: &Packet) -> Vec<u8> {
        let stream_id: u8 = match stream.kind {
            MediaKind::Video => 0xE0,
            MediaKind::Audio => 0xC0,
        };
        let mut pes = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0x80, 0x05];
        // 33-bit PTS in '0010' marker encoding.
        let pts = packet.pts as u64 & 0x1_FFFF_FFFF;
        pes.push(0x21 | (((pts >> 30) as u8) << 1));
        pes.push((pts >> 22) as u8);
        pes.push(0x01 | (((pts >> 15) as u8) << 1));
        pes.push((pts >> 7) as u8);
        pes.push(0x01 | ((pts as u8) << 1));
        pes.extend_from_slice(&packet.data);
        pes
    }
}

impl Muxer for MockMuxer {
    fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Err(CodecError::Misuse("header written twice".into()));
        }
        self.header_written = true;
        if !self.omit_psi {
            self.write_psi();
        }
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if !self.header_written || self.trailer_written {
            return Err(CodecError::Misuse("write_packet outside header/trailer".into()));
        }
        let index = packet.stream_index;
        let stream = self
            .streams
            .get(index)
            .ok_or_else(|| CodecError::Misuse(format!("unknown output stream {}", index)))?
            .clone();
        if packet.time_base != Rational::MPEGTS {
            return Err(CodecError::Misuse(
                "packet not rescaled to the mpegts timebase".into(),
            ));
        }
        if packet.dts < self.last_dts[index] {
            return Err(CodecError::Misuse(format!(
                "non-monotonic dts on stream {}: {} after {}",
                index, packet.dts, self.last_dts[index]
            )));
        }
        self.last_dts[index] = packet.dts;

        if self.resend_headers && stream.kind == MediaKind::Video && packet.key {
            self.write_psi();
        }
        let pes = Self::pes_wrap(&stream, packet);
        let packets = ts::packetize(ES_PID_BASE + index as u16, &pes, &mut self.stream_cc[index]);
        self.sink.write(&packets);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Per-packet flush semantics: bytes reach the sink on every write.
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        if !self.header_written {
            return Err(CodecError::Misuse("trailer before header".into()));
        }
        self.trailer_written = true;
        Ok(())
    }
}

struct AvccToAnnexB;

impl BitstreamFilter for AvccToAnnexB {
    fn filter(&mut self, packet: &Packet) -> Result<Packet> {
        let data = &packet.data;
        let mut out = Vec::with_capacity(data.len() + 8);
        let mut pos = 0;
        while pos < data.len() {
            if pos + 4 > data.len() {
                return Err(CodecError::InvalidData("truncated NAL length prefix".into()));
            }
            let len =
                u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                    as usize;
            pos += 4;
            if pos + len > data.len() {
                return Err(CodecError::InvalidData("NAL length exceeds packet".into()));
            }
            out.extend_from_slice(START_CODE);
            out.extend_from_slice(&data[pos..pos + len]);
            pos += len;
        }
        let mut filtered = packet.clone();
        filtered.data = Bytes::from(out);
        Ok(filtered)
    }
}
