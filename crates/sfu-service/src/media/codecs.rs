//! Media codec catalog.
//!
//! The engine negotiates codecs from the capabilities a router is created
//! with. The catalog here lists every codec this deployment knows how to
//! route; `AUDIO_CODECS` / `VIDEO_CODECS` select subsets by name.

use common::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One codec the router may negotiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    pub parameters: serde_json::Value,
}

fn catalog() -> Vec<(&'static str, RtpCodecCapability)> {
    vec![
        (
            "opus",
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: Some(2),
                parameters: json!({ "useinbandfec": 1, "usedtx": 1 }),
            },
        ),
        (
            "vp8",
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: json!({}),
            },
        ),
        (
            "vp9",
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP9".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: json!({ "profile-id": 2 }),
            },
        ),
        (
            "h264",
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: json!({
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f",
                    "level-asymmetry-allowed": 1,
                }),
            },
        ),
        (
            "av1",
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/AV1".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: json!({}),
            },
        ),
    ]
}

/// Select codecs by name. Empty selections mean "everything of that kind";
/// unknown names are logged and skipped.
#[must_use]
pub fn select(audio: &[String], video: &[String]) -> Vec<RtpCodecCapability> {
    let catalog = catalog();

    for name in audio.iter().chain(video) {
        if !catalog.iter().any(|(n, _)| n == name) {
            tracing::warn!(target: "sfu.media", codec = %name, "Unknown codec name ignored");
        }
    }

    catalog
        .into_iter()
        .filter(|(name, codec)| match codec.kind {
            MediaKind::Audio => audio.is_empty() || audio.iter().any(|a| a == name),
            MediaKind::Video => video.is_empty() || video.iter().any(|v| v == name),
        })
        .map(|(_, codec)| codec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_selection_returns_all() {
        let codecs = select(&[], &[]);
        assert_eq!(codecs.len(), 5);
        assert!(codecs.iter().any(|c| c.mime_type == "audio/opus"));
        assert!(codecs.iter().any(|c| c.mime_type == "video/AV1"));
    }

    #[test]
    fn test_video_subset() {
        let codecs = select(&[], &["vp8".to_string(), "h264".to_string()]);
        let video: Vec<_> = codecs
            .iter()
            .filter(|c| c.kind == MediaKind::Video)
            .collect();
        assert_eq!(video.len(), 2);
        // Audio untouched by a video selection
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
    }

    #[test]
    fn test_unknown_names_skipped() {
        let codecs = select(&["mp3".to_string()], &[]);
        // mp3 is not in the catalog; audio selection matches nothing
        assert!(codecs.iter().all(|c| c.kind != MediaKind::Audio));
    }
}
