//! HLS media playlist rendering.
//!
//! Single-rendition live playlist: the segment list grows while the
//! transcoder runs and gains `#EXT-X-ENDLIST` once the session completes.
//! Receivers that insist on absolute URIs get them via the host the caller
//! bakes into each segment URI.

use std::fmt::Write;

/// A segment entry in the playlist.
#[derive(Debug, Clone)]
pub struct PlaylistSegment {
    /// Duration in seconds.
    pub duration: f64,
    /// Segment URI (absolute or relative).
    pub uri: String,
}

/// A live media playlist for a single rendition.
#[derive(Debug, Clone)]
pub struct LivePlaylist {
    /// Target duration in seconds (ceiling of the longest segment).
    pub target_duration: u32,
    /// Index of the first segment in the list.
    pub media_sequence: u32,
    /// Complete segments, in index order.
    pub segments: Vec<PlaylistSegment>,
    /// Whether the stream has ended.
    pub ended: bool,
}

impl LivePlaylist {
    /// An empty playlist skeleton, valid before any segment exists.
    pub fn skeleton(target_duration: u32) -> Self {
        Self {
            target_duration,
            media_sequence: 0,
            segments: Vec::new(),
            ended: false,
        }
    }

    /// Render to M3U8 text.
    pub fn render(&self) -> String {
        let mut out = String::new();

        writeln!(out, "#EXTM3U").unwrap();
        writeln!(out, "#EXT-X-VERSION:3").unwrap();
        writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration).unwrap();
        writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence).unwrap();

        for segment in &self.segments {
            writeln!(out, "#EXTINF:{:.6},", segment.duration).unwrap();
            writeln!(out, "{}", segment.uri).unwrap();
        }

        if self.ended {
            writeln!(out, "#EXT-X-ENDLIST").unwrap();
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skeleton_render() {
        let m3u8 = LivePlaylist::skeleton(4).render();
        assert!(m3u8.starts_with("#EXTM3U\n"));
        assert!(m3u8.contains("#EXT-X-VERSION:3"));
        assert!(m3u8.contains("#EXT-X-TARGETDURATION:4"));
        assert!(m3u8.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(!m3u8.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_live_render() {
        let playlist = LivePlaylist {
            target_duration: 3,
            media_sequence: 0,
            segments: vec![
                PlaylistSegment {
                    duration: 2.002,
                    uri: "http://192.168.1.10:8411/hls/abc/segment0.ts".to_string(),
                },
                PlaylistSegment {
                    duration: 2.0,
                    uri: "http://192.168.1.10:8411/hls/abc/segment1.ts".to_string(),
                },
            ],
            ended: false,
        };

        let m3u8 = playlist.render();
        assert!(m3u8.contains("#EXTINF:2.002000,"));
        assert!(m3u8.contains("http://192.168.1.10:8411/hls/abc/segment0.ts"));
        assert!(m3u8.contains("segment1.ts"));
        assert!(!m3u8.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_ended_render() {
        let mut playlist = LivePlaylist::skeleton(2);
        playlist.segments.push(PlaylistSegment {
            duration: 1.5,
            uri: "segment0.ts".to_string(),
        });
        playlist.ended = true;
        let m3u8 = playlist.render();
        assert!(m3u8.trim_end().ends_with("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_media_sequence_advances() {
        let playlist = LivePlaylist {
            target_duration: 2,
            media_sequence: 7,
            segments: vec![PlaylistSegment {
                duration: 2.0,
                uri: "segment7.ts".to_string(),
            }],
            ended: false,
        };
        assert!(playlist.render().contains("#EXT-X-MEDIA-SEQUENCE:7"));
    }
}
