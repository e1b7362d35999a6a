//! The streaming transcoder core.
//!
//! One synchronous pipeline per session: demux → (decode → scale/resample →
//! encode)? → mux → segment. It runs on a blocking thread and is the only
//! task allowed to touch the codec contexts; HTTP handlers read the segment
//! store, never the pipeline. Remux mode streams packets through with
//! bitstream conformance fixes; transcode mode re-encodes video to H.264
//! and audio to AAC-LC. Either way a single continuous MPEG-TS muxer feeds
//! the segmenter.

mod audio;
mod segmenter;

pub use audio::AudioPath;
pub use segmenter::Segmenter;

use crate::config::Config;
use crate::demux::{BridgeState, DemuxBridge};
use crate::error::{Result, SessionError};
use crate::prescan::Classification;
use crate::session::SessionShared;
use crate::source::{ProgressProbe, SourceReader};
use crate::store::SegmentStore;
use castbridge_codec::{
    rescale, AudioFormat, BitstreamFilter, CodecBackend, Decoder, Encoder, EncoderSpec, MediaKind,
    MuxStreamSpec, Muxer, Packet, Rational, SampleFormat, Scaler, StreamInfo,
};
use castbridge_media::synthesize_asc;
use std::sync::Arc;

const SOFTWARE_H264: &[&str] = &["libx264"];
const HARDWARE_H264: &[&str] = &["h264_videotoolbox", "h264_nvenc", "h264_vaapi"];

/// Pick the H.264 encoder honoring the software preference.
fn select_h264_encoder(codec: &dyn CodecBackend, prefer_software: bool) -> Option<String> {
    let (first, second) = if prefer_software {
        (SOFTWARE_H264, HARDWARE_H264)
    } else {
        (HARDWARE_H264, SOFTWARE_H264)
    };
    first
        .iter()
        .chain(second.iter())
        .find(|name| codec.has_encoder(name))
        .map(|name| name.to_string())
}

enum VideoAction {
    Copy {
        filter: Option<Box<dyn BitstreamFilter>>,
    },
    Transcode {
        decoder: Box<dyn Decoder>,
        scaler: Box<dyn Scaler>,
        encoder: Box<dyn Encoder>,
        encoder_tb: Rational,
    },
}

enum AudioAction {
    Copy,
    Transcode(AudioPath),
}

/// Run a session's pipeline to completion on the current (blocking) thread.
#[allow(clippy::too_many_arguments)]
pub fn run_pipeline(
    codec: Arc<dyn CodecBackend>,
    reader: SourceReader,
    classification: Classification,
    config: &Config,
    store: Arc<SegmentStore>,
    session: Arc<SessionShared>,
    probe: Option<ProgressProbe>,
) -> Result<()> {
    let (bridge, bridge_state) = DemuxBridge::new(reader);
    let mut demuxer = codec
        .open_input(Box::new(bridge))
        .map_err(|e| promote_open_error(&bridge_state, e))?;

    let video_in = demuxer
        .streams()
        .iter()
        .find(|s| s.kind == MediaKind::Video)
        .cloned()
        .ok_or_else(|| SessionError::Codec(castbridge_codec::CodecError::InvalidData(
            "source has no video stream".into(),
        )))?;
    let audio_in = demuxer
        .streams()
        .iter()
        .find(|s| s.kind == MediaKind::Audio)
        .cloned();

    // Degrade to remux when no H.264 encoder exists at runtime.
    let mut classification = classification;
    let mut encoder_name = None;
    if classification.needs_video_transcode {
        match select_h264_encoder(&*codec, config.transcode.prefer_software_encoder) {
            Some(name) => encoder_name = Some(name),
            None => {
                tracing::warn!("No H.264 encoder available; degrading to remux");
                classification =
                    classification.without_video_transcode("h264 encoder unavailable");
            }
        }
    }
    tracing::info!(
        mode = ?classification.mode(),
        reason = %classification.reason,
        "Pipeline classified"
    );

    let mut video_action = build_video_action(
        &*codec,
        &video_in,
        &classification,
        encoder_name.as_deref(),
        config,
    )?;
    let mut audio_action = match &audio_in {
        Some(stream) if classification.needs_audio_transcode => {
            AudioAction::Transcode(build_audio_path(&*codec, stream, config)?)
        }
        Some(_) => AudioAction::Copy,
        None => AudioAction::Copy,
    };

    let mux_streams = build_mux_streams(&video_in, audio_in.as_ref(), &video_action, &audio_action)?;
    let mut segmenter = Segmenter::new(Arc::clone(&store), &config.transcode);
    let mux_options = vec![
        (
            "mpegts_flags".to_string(),
            "+resend_headers+pat_pmt_at_frames".to_string(),
        ),
        ("pcr_period".to_string(), "20".to_string()),
        ("flush_packets".to_string(), "1".to_string()),
        ("max_interleave_delta".to_string(), "0".to_string()),
    ];
    let mut muxer = codec.new_muxer("mpegts", &mux_streams, segmenter.sink(), &mux_options)?;
    muxer.write_header()?;
    segmenter.capture_psi();

    let mut codec_errors = 0u32;
    let mut packets_since_yield = 0u32;
    let mut audio_out = Vec::new();

    loop {
        if session.should_stop() {
            return Err(SessionError::Stopped);
        }

        let packet = match demuxer.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                if bridge_state.caught_up() {
                    return Err(SessionError::ReaderCaughtUp);
                }
                break;
            }
            Err(e) => {
                if let Some(terminal) = bridge_state.take_terminal() {
                    return Err(terminal);
                }
                if bridge_state.caught_up() {
                    return Err(SessionError::ReaderCaughtUp);
                }
                return Err(e.into());
            }
        };

        session.enter_codec();
        let result = if packet.stream_index == video_in.index {
            process_video(&mut video_action, &mut segmenter, &mut *muxer, packet)
        } else if audio_in.as_ref().is_some_and(|a| a.index == packet.stream_index) {
            audio_out.clear();
            process_audio(&mut audio_action, &mut segmenter, &mut *muxer, packet, &mut audio_out)
        } else {
            Ok(()) // substream we do not carry (subtitles, data)
        };
        session.exit_codec();

        if let Err(e) = result {
            match e {
                SessionError::Codec(inner) => {
                    codec_errors += 1;
                    tracing::warn!(count = codec_errors, "Recoverable codec error: {inner}");
                    if codec_errors > config.transcode.max_codec_errors {
                        return Err(SessionError::Codec(inner));
                    }
                }
                other => return Err(other),
            }
        }

        packets_since_yield += 1;
        if packets_since_yield >= config.transcode.yield_every_n_packets {
            packets_since_yield = 0;
            if let Some(probe) = &probe {
                let (received, total) = probe.get();
                if total > 0 {
                    session.set_progress((received as f64 / total as f64 * 100.0).min(99.0));
                }
            }
            std::thread::yield_now();
        }
    }

    // End of stream: drain every codec context, then let the segmenter
    // flush the trailer and commit the remainder.
    flush_video(&mut video_action, &mut segmenter, &mut *muxer)?;
    if let AudioAction::Transcode(path) = &mut audio_action {
        audio_out.clear();
        path.flush(&mut audio_out)?;
        for packet in audio_out.drain(..) {
            segmenter.write_audio(&mut *muxer, with_stream_index(packet, 1))?;
        }
    }
    segmenter.finalize(&mut *muxer)?;

    session.set_progress(100.0);
    tracing::info!(
        segments = segmenter.segments_committed(),
        "Pipeline complete"
    );
    Ok(())
}

/// An open error caused by the source surfaces as the source error, not as
/// a codec failure.
fn promote_open_error(bridge_state: &BridgeState, e: castbridge_codec::CodecError) -> SessionError {
    if let Some(terminal) = bridge_state.take_terminal() {
        return terminal;
    }
    if bridge_state.caught_up() {
        return SessionError::ReaderCaughtUp;
    }
    SessionError::Codec(e)
}

fn build_video_action(
    codec: &dyn CodecBackend,
    stream: &StreamInfo,
    classification: &Classification,
    encoder_name: Option<&str>,
    config: &Config,
) -> Result<VideoAction> {
    if !classification.needs_video_transcode {
        let filter = if stream.length_prefixed_nals && stream.codec == "h264" {
            Some(codec.new_bitstream_filter("h264_mp4toannexb", stream)?)
        } else {
            None
        };
        return Ok(VideoAction::Copy { filter });
    }

    let encoder_name = encoder_name.unwrap_or("libx264");
    let decoder = codec.new_decoder(stream)?;
    let scaler = codec.new_scaler(stream, stream.width, stream.height)?;
    let encoder_tb = Rational::MILLIS;
    let encoder = codec.new_encoder(&EncoderSpec {
        codec_name: encoder_name.to_string(),
        kind: MediaKind::Video,
        time_base: encoder_tb,
        width: stream.width,
        height: stream.height,
        sample_rate: 0,
        channels: 0,
        bitrate: config.transcode.video_bitrate,
        gop_size: 48,
        options: vec![
            ("profile".to_string(), "high".to_string()),
            ("level".to_string(), "4.1".to_string()),
            ("repeat-headers".to_string(), "1".to_string()),
            ("bf".to_string(), "0".to_string()),
            ("thread_type".to_string(), "slice".to_string()),
        ],
    })?;
    tracing::info!(encoder = encoder_name, "Video transcode path ready");
    Ok(VideoAction::Transcode {
        decoder,
        scaler,
        encoder,
        encoder_tb,
    })
}

fn build_audio_path(
    codec: &dyn CodecBackend,
    stream: &StreamInfo,
    config: &Config,
) -> Result<AudioPath> {
    let sample_rate = if stream.sample_rate > 0 {
        stream.sample_rate
    } else {
        48_000
    };
    let channels = stream.channels.clamp(1, 2);
    let format = AudioFormat {
        sample_rate,
        channels,
        sample_format: SampleFormat::FloatPlanar,
    };
    let decoder = codec.new_decoder(stream)?;
    let resampler = codec.new_resampler(stream, &format)?;
    let fifo = codec.new_audio_fifo(&format)?;
    let encoder = codec.new_encoder(&EncoderSpec {
        codec_name: "aac".to_string(),
        kind: MediaKind::Audio,
        time_base: Rational::per_sample(sample_rate),
        width: 0,
        height: 0,
        sample_rate,
        channels,
        bitrate: config.transcode.audio_bitrate,
        gop_size: 0,
        options: vec![],
    })?;
    Ok(AudioPath::new(decoder, resampler, fifo, encoder, sample_rate))
}

/// Output stream table for the muxer: stream 0 video, stream 1 audio. AAC
/// extradata must be present before the header is written; when nothing
/// provides it, a 2-byte AudioSpecificConfig is synthesized.
fn build_mux_streams(
    video_in: &StreamInfo,
    audio_in: Option<&StreamInfo>,
    video_action: &VideoAction,
    audio_action: &AudioAction,
) -> Result<Vec<MuxStreamSpec>> {
    let video_spec = MuxStreamSpec {
        kind: MediaKind::Video,
        codec: match video_action {
            VideoAction::Copy { .. } => video_in.codec.clone(),
            VideoAction::Transcode { .. } => "h264".to_string(),
        },
        time_base: Rational::MPEGTS,
        extradata: match video_action {
            VideoAction::Copy { .. } => video_in.extradata.clone(),
            VideoAction::Transcode { encoder, .. } => encoder.extradata(),
        },
    };

    let mut streams = vec![video_spec];
    if let Some(audio_in) = audio_in {
        let (sample_rate, channels) = match audio_action {
            AudioAction::Transcode(_) => (
                if audio_in.sample_rate > 0 { audio_in.sample_rate } else { 48_000 },
                audio_in.channels.clamp(1, 2),
            ),
            AudioAction::Copy => (audio_in.sample_rate, audio_in.channels),
        };
        let out_codec = match audio_action {
            AudioAction::Copy => audio_in.codec.clone(),
            AudioAction::Transcode(_) => "aac".to_string(),
        };
        let extradata = match audio_action {
            AudioAction::Transcode(path) => path.encoder_extradata(),
            AudioAction::Copy => audio_in.extradata.clone(),
        };
        // The ASC must exist on AAC streams before the header is written.
        let extradata = match (extradata, out_codec.as_str()) {
            (Some(data), _) => Some(data),
            (None, "aac") => match synthesize_asc(sample_rate, channels) {
                Ok(asc) => {
                    tracing::debug!(sample_rate, channels, "Synthesized AAC ASC");
                    Some(bytes::Bytes::copy_from_slice(&asc))
                }
                Err(e) => {
                    tracing::warn!("Cannot synthesize AAC ASC: {e}");
                    None
                }
            },
            (None, _) => None,
        };
        streams.push(MuxStreamSpec {
            kind: MediaKind::Audio,
            codec: out_codec,
            time_base: Rational::MPEGTS,
            extradata,
        });
    }
    Ok(streams)
}

fn with_stream_index(mut packet: Packet, index: usize) -> Packet {
    packet.stream_index = index;
    packet
}

/// Rescale a copied packet onto the muxer timebase.
fn rescale_to_mux(mut packet: Packet, index: usize) -> Packet {
    let from = packet.time_base;
    packet.pts = rescale(packet.pts, from, Rational::MPEGTS);
    packet.dts = rescale(packet.dts, from, Rational::MPEGTS).min(packet.pts);
    packet.duration = rescale(packet.duration, from, Rational::MPEGTS);
    packet.time_base = Rational::MPEGTS;
    packet.stream_index = index;
    packet
}

fn process_video(
    action: &mut VideoAction,
    segmenter: &mut Segmenter,
    muxer: &mut dyn Muxer,
    packet: Packet,
) -> Result<()> {
    match action {
        VideoAction::Copy { filter } => {
            let packet = match filter {
                Some(filter) => filter.filter(&packet)?,
                None => packet,
            };
            segmenter.write_video(muxer, rescale_to_mux(packet, 0))
        }
        VideoAction::Transcode {
            decoder,
            scaler,
            encoder,
            encoder_tb,
        } => {
            decoder.send_packet(Some(&packet))?;
            while let Some(frame) = decoder.receive_frame()? {
                let mut scaled = scaler.convert(&frame)?;
                scaled.pts = rescale(frame.pts, frame.time_base, *encoder_tb);
                scaled.time_base = *encoder_tb;
                encoder.send_frame(Some(&scaled))?;
                while let Some(out) = encoder.receive_packet()? {
                    let mut out = rescale_to_mux(out, 0);
                    out.dts = out.pts; // no B-frames
                    segmenter.write_video(muxer, out)?;
                }
            }
            Ok(())
        }
    }
}

fn process_audio(
    action: &mut AudioAction,
    segmenter: &mut Segmenter,
    muxer: &mut dyn Muxer,
    packet: Packet,
    scratch: &mut Vec<Packet>,
) -> Result<()> {
    match action {
        AudioAction::Copy => segmenter.write_audio(muxer, rescale_to_mux(packet, 1)),
        AudioAction::Transcode(path) => {
            path.process_packet(&packet, scratch)?;
            for out in scratch.drain(..) {
                segmenter.write_audio(muxer, with_stream_index(out, 1))?;
            }
            Ok(())
        }
    }
}

fn flush_video(
    action: &mut VideoAction,
    segmenter: &mut Segmenter,
    muxer: &mut dyn Muxer,
) -> Result<()> {
    if let VideoAction::Transcode {
        decoder,
        scaler,
        encoder,
        encoder_tb,
    } = action
    {
        decoder.send_packet(None)?;
        while let Some(frame) = decoder.receive_frame()? {
            let mut scaled = scaler.convert(&frame)?;
            scaled.pts = rescale(frame.pts, frame.time_base, *encoder_tb);
            scaled.time_base = *encoder_tb;
            encoder.send_frame(Some(&scaled))?;
        }
        encoder.send_frame(None)?;
        while let Some(out) = encoder.receive_packet()? {
            let mut out = rescale_to_mux(out, 0);
            out.dts = out.pts;
            segmenter.write_video(muxer, out)?;
        }
    }
    Ok(())
}
