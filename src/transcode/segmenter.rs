//! Keyframe-aligned segment cutting over a single continuous muxer.
//!
//! The muxer is never torn down between segments; that would reset encoder
//! extradata and timestamp state and produce discontinuities the receiver
//! rejects. Instead every muxer write lands (as a fresh copy) in the
//! current-segment buffer, and at a cut the muxer is flushed and the buffer
//! harvested into the store. Patches applied to each harvested segment:
//! PAT/PMT injection when the segment does not open with PSI, and —
//! optionally — splicing the captured SPS/PPS into keyframes that lack
//! them.

use crate::config::TranscodeConfig;
use crate::error::Result;
use crate::store::SegmentStore;
use castbridge_codec::{MuxSink, Muxer, Packet, Rational};
use castbridge_media::annexb::{AnnexBScan, ParameterSets};
use castbridge_media::ts::PsiPair;
use castbridge_media::{annexb, ts};
use parking_lot::Mutex;
use std::sync::Arc;

/// Sink handed to the muxer. Appends a byte-wise copy of every write to the
/// shared current-segment buffer; the muxer may reuse its buffers freely.
pub struct SegmentSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MuxSink for SegmentSink {
    fn write(&mut self, data: &[u8]) {
        self.buf.lock().extend_from_slice(data);
    }
}

pub struct Segmenter {
    buf: Arc<Mutex<Vec<u8>>>,
    store: Arc<SegmentStore>,
    index: u32,
    /// Start PTS of the current segment in MPEG-TS ticks; `None` until the
    /// first packet.
    seg_start: Option<i64>,
    /// Highest packet end time seen, for the final segment's duration.
    end_pts: i64,
    psi: Option<PsiPair>,
    parameter_sets: Option<ParameterSets>,
    inject_parameter_sets: bool,
    target_ticks: i64,
    max_ticks: i64,
}

impl Segmenter {
    pub fn new(store: Arc<SegmentStore>, config: &TranscodeConfig) -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            store,
            index: 0,
            seg_start: None,
            end_pts: 0,
            psi: None,
            parameter_sets: None,
            inject_parameter_sets: config.inject_parameter_sets,
            target_ticks: (config.target_segment_duration_secs * 90_000.0) as i64,
            max_ticks: (config.max_segment_duration_secs * 90_000.0) as i64,
        }
    }

    /// Sink to hand the muxer at creation.
    pub fn sink(&self) -> Box<dyn MuxSink> {
        Box::new(SegmentSink {
            buf: Arc::clone(&self.buf),
        })
    }

    /// Cache the PAT/PMT pair out of the muxer's header write so later
    /// segments that do not open with PSI can be patched.
    pub fn capture_psi(&mut self) {
        if self.psi.is_some() {
            return;
        }
        let buf = self.buf.lock();
        match PsiPair::extract(&buf) {
            Ok(psi) => self.psi = Some(psi),
            Err(e) => tracing::debug!("PSI not yet visible in muxer output: {e}"),
        }
    }

    /// Write a video packet, cutting at keyframes once the target duration
    /// is reached and at the hard cap regardless.
    pub fn write_video(&mut self, muxer: &mut dyn Muxer, mut packet: Packet) -> Result<()> {
        let pts = packet.pts;
        if packet.key {
            self.on_keyframe(&mut packet);
            if let Some(start) = self.seg_start {
                if pts - start >= self.target_ticks {
                    self.cut(muxer, pts)?;
                }
            }
        } else {
            self.enforce_hard_cap(muxer, pts)?;
        }
        self.track(&packet);
        muxer.write_packet(&packet).map_err(crate::error::SessionError::from)?;
        Ok(())
    }

    /// Write an audio packet. Audio never cuts at the target, but the hard
    /// cap still applies so a keyframe drought cannot stall the stream.
    pub fn write_audio(&mut self, muxer: &mut dyn Muxer, packet: Packet) -> Result<()> {
        self.enforce_hard_cap(muxer, packet.pts)?;
        self.track(&packet);
        muxer.write_packet(&packet).map_err(crate::error::SessionError::from)?;
        Ok(())
    }

    fn track(&mut self, packet: &Packet) {
        if self.seg_start.is_none() {
            self.seg_start = Some(packet.pts);
        }
        self.end_pts = self.end_pts.max(packet.pts + packet.duration.max(0));
    }

    fn enforce_hard_cap(&mut self, muxer: &mut dyn Muxer, pts: i64) -> Result<()> {
        if let Some(start) = self.seg_start {
            if pts - start >= self.max_ticks {
                tracing::warn!(
                    segment = self.index,
                    "No keyframe within the hard cap; forcing a cut"
                );
                self.cut(muxer, pts)?;
            }
        }
        Ok(())
    }

    /// Keyframe bookkeeping: capture parameter sets from the first one,
    /// splice them into later ones that lack them when injection is on.
    fn on_keyframe(&mut self, packet: &mut Packet) {
        let scan = AnnexBScan::run(&packet.data);
        if scan.keyframe_head_ok() {
            if self.parameter_sets.is_none() {
                self.parameter_sets = ParameterSets::extract(&packet.data);
            }
            return;
        }
        match (&self.parameter_sets, self.inject_parameter_sets) {
            (Some(ps), true) => {
                let patched = annexb::prepend_parameter_sets(&packet.data, ps);
                packet.data = patched.into();
            }
            (Some(_), false) => {
                tracing::debug!(
                    segment = self.index,
                    "Keyframe without parameter sets; injection disabled"
                );
            }
            (None, _) => {
                tracing::debug!(
                    segment = self.index,
                    "Keyframe without parameter sets and none captured yet"
                );
            }
        }
    }

    /// Flush the muxer and commit the harvested bytes as a segment ending
    /// at `cut_pts`.
    fn cut(&mut self, muxer: &mut dyn Muxer, cut_pts: i64) -> Result<()> {
        muxer.flush().map_err(crate::error::SessionError::from)?;
        let Some(start) = self.seg_start else {
            return Ok(());
        };
        let bytes = std::mem::take(&mut *self.buf.lock());
        if bytes.is_empty() {
            return Ok(());
        }
        self.commit(bytes, start, cut_pts);
        self.seg_start = Some(cut_pts);
        Ok(())
    }

    fn commit(&mut self, bytes: Vec<u8>, start: i64, end: i64) {
        if self.psi.is_none() {
            if let Ok(psi) = PsiPair::extract(&bytes) {
                self.psi = Some(psi);
            }
        }
        let bytes = match &self.psi {
            Some(psi) => ts::ensure_leading_psi(bytes, psi),
            None => {
                if !ts::starts_with_pat(&bytes) {
                    tracing::warn!(
                        segment = self.index,
                        "No PSI captured; emitting segment without PAT patch"
                    );
                }
                bytes
            }
        };
        let duration = Rational::MPEGTS.to_seconds(end - start);
        self.store.add(
            self.index,
            Rational::MPEGTS.to_seconds(start),
            duration,
            bytes,
        );
        self.index += 1;
    }

    /// End of stream: flush, write the trailer, and commit the remainder
    /// with its true measured duration.
    pub fn finalize(&mut self, muxer: &mut dyn Muxer) -> Result<()> {
        muxer.flush().map_err(crate::error::SessionError::from)?;
        muxer.write_trailer().map_err(crate::error::SessionError::from)?;
        let bytes = std::mem::take(&mut *self.buf.lock());
        if let Some(start) = self.seg_start {
            if !bytes.is_empty() {
                let end = self.end_pts.max(start);
                self.commit(bytes, start, end);
            }
        }
        Ok(())
    }

    pub fn segments_committed(&self) -> u32 {
        self.index
    }
}
