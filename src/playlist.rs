//! Playlist view over the live segment catalog.

use crate::store::SegmentStore;
use castbridge_media::playlist::{LivePlaylist, PlaylistSegment};

/// Render the current media playlist for a session.
///
/// `base` is `http://host:port` as the receiver reaches us; segment URIs
/// are absolute because some receivers refuse relative ones. Before any
/// segment exists a valid skeleton advertising the hard-cap target
/// duration is returned.
pub fn render(
    store: &SegmentStore,
    ended: bool,
    max_segment_duration_secs: f64,
    base: &str,
    session_id: &str,
) -> String {
    let (media_sequence, metas) = store.playlist_view();
    if metas.is_empty() {
        return LivePlaylist::skeleton(max_segment_duration_secs.ceil() as u32).render();
    }

    let target_duration = metas
        .iter()
        .map(|m| m.duration_secs)
        .fold(0.0f64, f64::max)
        .ceil() as u32;

    let playlist = LivePlaylist {
        target_duration: target_duration.max(1),
        media_sequence,
        segments: metas
            .iter()
            .map(|m| PlaylistSegment {
                duration: m.duration_secs,
                uri: format!("{}/hls/{}/segment{}.ts", base, session_id, m.index),
            })
            .collect(),
        ended,
    };
    playlist.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::SegmentStore;

    #[tokio::test]
    async fn test_skeleton_before_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("s"), StoreConfig::default()).unwrap();
        let m3u8 = render(&store, false, 4.0, "http://192.168.1.5:8411", "abc");
        assert!(m3u8.contains("#EXT-X-TARGETDURATION:4"));
        assert!(m3u8.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(!m3u8.contains("segment0.ts"));
        assert!(!m3u8.contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn test_live_playlist_with_absolute_urls() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("s"), StoreConfig::default()).unwrap();
        store.add(0, 0.0, 2.0, vec![0; 8]);
        store.add(1, 2.0, 2.6, vec![0; 8]);

        let m3u8 = render(&store, false, 4.0, "http://192.168.1.5:8411", "abc");
        assert!(m3u8.contains("#EXT-X-TARGETDURATION:3"));
        assert!(m3u8.contains("http://192.168.1.5:8411/hls/abc/segment0.ts"));
        assert!(m3u8.contains("http://192.168.1.5:8411/hls/abc/segment1.ts"));
        assert!(!m3u8.contains("#EXT-X-ENDLIST"));
    }

    #[tokio::test]
    async fn test_ended_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("s"), StoreConfig::default()).unwrap();
        store.add(0, 0.0, 2.0, vec![0; 8]);
        let m3u8 = render(&store, true, 4.0, "http://127.0.0.1:1", "abc");
        assert!(m3u8.trim_end().ends_with("#EXT-X-ENDLIST"));
    }
}
