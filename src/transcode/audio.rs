//! Audio transcode path: decode, resample, FIFO, encode.
//!
//! AAC-LC consumes fixed 1024-sample frames while input frames can be any
//! size, so resampled samples pass through a FIFO and the encoder is fed
//! exact frame-size reads. Output PTS is anchored once — `base_pts` is the
//! first input packet's PTS, never re-derived — and advances by the running
//! output-sample count, which keeps audio timing immune to input jitter.

use crate::error::Result;
use castbridge_codec::{
    rescale, AudioFifo, Decoder, Encoder, Packet, Rational, Resampler,
};

/// Encoder frames emitted per input packet at most; a pathological input
/// cannot spin the loop.
const MAX_FRAMES_PER_PACKET: usize = 3;

pub struct AudioPath {
    decoder: Box<dyn Decoder>,
    resampler: Box<dyn Resampler>,
    fifo: Box<dyn AudioFifo>,
    encoder: Box<dyn Encoder>,
    frame_size: usize,
    sample_rate: u32,
    base_pts_ms: Option<i64>,
    samples_out: u64,
}

impl AudioPath {
    pub fn new(
        decoder: Box<dyn Decoder>,
        resampler: Box<dyn Resampler>,
        fifo: Box<dyn AudioFifo>,
        encoder: Box<dyn Encoder>,
        sample_rate: u32,
    ) -> Self {
        let frame_size = encoder.frame_size().unwrap_or(1024);
        Self {
            decoder,
            resampler,
            fifo,
            encoder,
            frame_size,
            sample_rate,
            base_pts_ms: None,
            samples_out: 0,
        }
    }

    /// Decode one input packet and append any finished output packets
    /// (already on the MPEG-TS timebase) to `out`.
    pub fn process_packet(&mut self, packet: &Packet, out: &mut Vec<Packet>) -> Result<()> {
        if self.base_pts_ms.is_none() {
            self.base_pts_ms = Some(rescale(packet.pts, packet.time_base, Rational::MILLIS));
        }

        self.decoder.send_packet(Some(packet))?;
        while let Some(frame) = self.decoder.receive_frame()? {
            let resampled = self.resampler.convert(&frame)?;
            self.fifo.write(&resampled)?;
        }

        self.drain_fifo(MAX_FRAMES_PER_PACKET, false, out)
    }

    /// End of stream: flush the decoder, drain the FIFO completely
    /// (including a final short frame), and drain the encoder.
    pub fn flush(&mut self, out: &mut Vec<Packet>) -> Result<()> {
        self.decoder.send_packet(None)?;
        while let Some(frame) = self.decoder.receive_frame()? {
            let resampled = self.resampler.convert(&frame)?;
            self.fifo.write(&resampled)?;
        }

        self.drain_fifo(usize::MAX, true, out)?;

        self.encoder.send_frame(None)?;
        while let Some(packet) = self.encoder.receive_packet()? {
            out.push(self.finish_packet(packet));
        }
        Ok(())
    }

    fn drain_fifo(&mut self, max_frames: usize, include_partial: bool, out: &mut Vec<Packet>) -> Result<()> {
        let mut emitted = 0;
        loop {
            if emitted >= max_frames {
                break;
            }
            let want = if self.fifo.size() >= self.frame_size {
                self.frame_size
            } else if include_partial && self.fifo.size() > 0 {
                self.fifo.size()
            } else {
                break;
            };
            let Some(mut frame) = self.fifo.read(want)? else {
                break;
            };
            // PTS is the running output-sample count in the encoder's
            // 1/sample_rate timebase.
            frame.pts = self.samples_out as i64;
            frame.time_base = Rational::per_sample(self.sample_rate);
            self.encoder.send_frame(Some(&frame))?;
            self.samples_out += frame.nb_samples as u64;
            emitted += 1;

            while let Some(packet) = self.encoder.receive_packet()? {
                out.push(self.finish_packet(packet));
            }
        }
        Ok(())
    }

    /// Anchor an encoded packet on the output timeline and rescale it to
    /// the muxer timebase.
    fn finish_packet(&self, mut packet: Packet) -> Packet {
        let base_ms = self.base_pts_ms.unwrap_or(0);
        let pts = rescale(base_ms, Rational::MILLIS, Rational::MPEGTS)
            + rescale(packet.pts, packet.time_base, Rational::MPEGTS);
        packet.pts = pts;
        packet.dts = pts;
        packet.duration = rescale(packet.duration, packet.time_base, Rational::MPEGTS);
        packet.time_base = Rational::MPEGTS;
        packet
    }

    /// ASC-relevant parameters of the encoder path.
    pub fn encoder_extradata(&self) -> Option<bytes::Bytes> {
        self.encoder.extradata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use castbridge_codec::mock::MockBackend;
    use castbridge_codec::{
        AudioFormat, CodecBackend, EncoderSpec, MediaKind, SampleFormat, StreamInfo,
    };

    fn audio_stream(sample_rate: u32, channels: u16) -> StreamInfo {
        StreamInfo {
            index: 1,
            kind: MediaKind::Audio,
            codec: "eac3".to_string(),
            time_base: Rational::per_sample(sample_rate),
            width: 0,
            height: 0,
            sample_rate,
            channels,
            extradata: None,
            length_prefixed_nals: false,
        }
    }

    fn build_path(sample_rate: u32) -> AudioPath {
        let backend = MockBackend::new();
        let stream = audio_stream(sample_rate, 2);
        let format = AudioFormat {
            sample_rate,
            channels: 2,
            sample_format: SampleFormat::FloatPlanar,
        };
        let decoder = backend.new_decoder(&stream).unwrap();
        let resampler = backend.new_resampler(&stream, &format).unwrap();
        let fifo = backend.new_audio_fifo(&format).unwrap();
        let encoder = backend
            .new_encoder(&EncoderSpec {
                codec_name: "aac".to_string(),
                kind: MediaKind::Audio,
                time_base: Rational::per_sample(sample_rate),
                width: 0,
                height: 0,
                sample_rate,
                channels: 2,
                bitrate: 192_000,
                gop_size: 0,
                options: vec![],
            })
            .unwrap();
        AudioPath::new(decoder, resampler, fifo, encoder, sample_rate)
    }

    /// An input packet carrying `nb_samples` of f32 stereo.
    fn input_packet(pts: i64, sample_rate: u32, nb_samples: usize) -> Packet {
        Packet {
            stream_index: 1,
            pts,
            dts: pts,
            duration: nb_samples as i64,
            time_base: Rational::per_sample(sample_rate),
            key: true,
            data: Bytes::from(vec![0u8; nb_samples * 2 * 4]),
        }
    }

    #[test]
    fn test_fifo_reconciles_frame_sizes() {
        let mut path = build_path(48_000);
        let mut out = Vec::new();
        // 1536-sample frames (E-AC-3 size): first packet yields one
        // 1024-sample output, second brings the total to 3072 = 2 more.
        path.process_packet(&input_packet(0, 48_000, 1536), &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        path.process_packet(&input_packet(1536, 48_000, 1536), &mut out)
            .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_output_pts_follows_sample_count() {
        let mut path = build_path(48_000);
        let mut out = Vec::new();
        for i in 0..4i64 {
            path.process_packet(&input_packet(i * 1024, 48_000, 1024), &mut out)
                .unwrap();
        }
        assert_eq!(out.len(), 4);
        // base_pts = 0; packets at 0, 1024, 2048, 3072 samples = 1920-tick
        // steps at 90kHz.
        for (i, packet) in out.iter().enumerate() {
            assert_eq!(packet.time_base, Rational::MPEGTS);
            assert_eq!(packet.pts, i as i64 * 1920);
            assert_eq!(packet.dts, packet.pts);
        }
    }

    #[test]
    fn test_base_pts_anchors_output() {
        let mut path = build_path(48_000);
        let mut out = Vec::new();
        // First input packet starts 2 seconds in.
        path.process_packet(&input_packet(96_000, 48_000, 1024), &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pts, 180_000);
    }

    #[test]
    fn test_frames_per_packet_ceiling() {
        let mut path = build_path(48_000);
        let mut out = Vec::new();
        // A giant packet: 8192 samples would be 8 frames; only 3 may be
        // emitted now.
        path.process_packet(&input_packet(0, 48_000, 8192), &mut out)
            .unwrap();
        assert_eq!(out.len(), 3);
        // The remainder drains on following packets.
        path.process_packet(&input_packet(8192, 48_000, 0), &mut out)
            .unwrap();
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_flush_drains_partial_frame() {
        let mut path = build_path(48_000);
        let mut out = Vec::new();
        path.process_packet(&input_packet(0, 48_000, 1500), &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        path.flush(&mut out).unwrap();
        // 476 leftover samples emerge as one short frame.
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].pts, 1920);
    }
}
