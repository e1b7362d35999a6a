//! Source classification ahead of transcoder construction.
//!
//! The receiver plays H.264 + AAC in MPEG-TS and nothing else, so the
//! pipeline decides up front whether the source needs a container remux, a
//! video transcode, an audio transcode, or all three. The inputs are cheap
//! signals available before any demuxing: the URL's `type` query parameter,
//! the trailing path extension, and whatever title string the caller knows.

use regex::Regex;
use std::sync::OnceLock;

/// How the pipeline will treat the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Stream packets through, repackaged into MPEG-TS.
    Remux,
    /// Decode and re-encode to H.264 / AAC.
    Transcode,
}

/// Pre-scan result.
#[derive(Debug, Clone)]
pub struct Classification {
    pub needs_remux: bool,
    pub needs_video_transcode: bool,
    pub needs_audio_transcode: bool,
    pub reason: String,
}

impl Classification {
    pub fn mode(&self) -> PipelineMode {
        if self.needs_video_transcode || self.needs_audio_transcode {
            PipelineMode::Transcode
        } else {
            PipelineMode::Remux
        }
    }

    /// Drop the video transcode requirement (no H.264 encoder available),
    /// recording why.
    pub fn without_video_transcode(mut self, note: &str) -> Self {
        self.needs_video_transcode = false;
        self.reason = format!("{}; {}", self.reason, note);
        self
    }
}

fn video_tokens() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(hevc|h\.?265|x265)").expect("static regex"))
}

fn audio_tokens() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(ddp|dd\+|e-?ac-?3|ac-?3|dts|truehd)").expect("static regex")
    })
}

/// Classify a source from its URL and caller-provided title.
pub fn classify(url: Option<&str>, title: Option<&str>) -> Classification {
    let mut needs_remux = false;
    let mut needs_video = false;
    let mut needs_audio = false;
    let mut reasons: Vec<String> = Vec::new();

    let (path, mime_hint) = split_url(url);

    if mime_hint
        .as_deref()
        .is_some_and(|m| m.contains("x-matroska"))
        || path.to_ascii_lowercase().ends_with(".mkv")
    {
        needs_remux = true;
        reasons.push("matroska container".to_string());
    }

    let haystack = format!("{} {}", title.unwrap_or(""), path);
    if video_tokens().is_match(&haystack) {
        needs_video = true;
        reasons.push("hevc video".to_string());
    }
    if audio_tokens().is_match(&haystack) {
        needs_audio = true;
        reasons.push("non-aac audio".to_string());
    }

    if reasons.is_empty() {
        reasons.push("passthrough".to_string());
    }

    Classification {
        needs_remux,
        needs_video_transcode: needs_video,
        needs_audio_transcode: needs_audio,
        reason: reasons.join("; "),
    }
}

/// Split a URL into its path component and the `type` query parameter.
/// Tolerates bare paths and unparseable strings.
fn split_url(url: Option<&str>) -> (String, Option<String>) {
    let Some(raw) = url else {
        return (String::new(), None);
    };
    match url::Url::parse(raw) {
        Ok(parsed) => {
            let mime = parsed
                .query_pairs()
                .find(|(key, _)| key == "type")
                .map(|(_, value)| value.to_string());
            (parsed.path().to_string(), mime)
        }
        Err(_) => (raw.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hevc_ddp_mkv_needs_everything() {
        let c = classify(
            Some("http://host/media/Movie.2021.1080p.mkv"),
            Some("Movie.2021.1080p.HEVC.DDP5.1"),
        );
        assert!(c.needs_remux);
        assert!(c.needs_video_transcode);
        assert!(c.needs_audio_transcode);
        assert_eq!(c.mode(), PipelineMode::Transcode);
    }

    #[test]
    fn test_h264_aac_mp4_is_remux_only() {
        let c = classify(Some("http://host/Clip.mp4"), Some("Clip.h264.aac.mp4"));
        assert!(!c.needs_remux);
        assert!(!c.needs_video_transcode);
        assert!(!c.needs_audio_transcode);
        assert_eq!(c.mode(), PipelineMode::Remux);
    }

    #[test]
    fn test_mime_query_parameter() {
        let c = classify(
            Some("http://host/stream?type=video%2Fx-matroska"),
            None,
        );
        assert!(c.needs_remux);
        assert_eq!(c.mode(), PipelineMode::Remux);
    }

    #[test]
    fn test_audio_token_variants() {
        for title in ["Show.EAC3", "Show.E-AC-3", "Show.AC3.x264", "Show.DTS-HD", "Show.TrueHD"] {
            let c = classify(None, Some(title));
            assert!(c.needs_audio_transcode, "expected audio transcode for {title}");
        }
    }

    #[test]
    fn test_video_token_variants() {
        for title in ["Movie.x265", "Movie.H265", "Movie.h.265", "Movie.HEVC.1080p"] {
            let c = classify(None, Some(title));
            assert!(c.needs_video_transcode, "expected video transcode for {title}");
        }
    }

    #[test]
    fn test_tokens_found_in_url_path() {
        let c = classify(Some("http://host/dir/Movie.HEVC.mkv"), None);
        assert!(c.needs_video_transcode);
        assert!(c.needs_remux);
    }

    #[test]
    fn test_degrade_video_transcode() {
        let c = classify(None, Some("Movie.HEVC"))
            .without_video_transcode("h264 encoder unavailable");
        assert!(!c.needs_video_transcode);
        assert!(c.reason.contains("h264 encoder unavailable"));
        assert_eq!(c.mode(), PipelineMode::Remux);
    }
}
