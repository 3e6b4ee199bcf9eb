pub mod object_store;
pub mod prewarm;
pub mod store;

pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use prewarm::{PrewarmJob, PrewarmQueue, PrewarmWorker};
pub use store::{CachedLookup, MediaService, SavedMedia};

use serde::{Deserialize, Serialize};

/// Supported media kinds, ordered by send priority: audio is cheapest and
/// the most latency-sensitive on the `/start` path, photos are last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Photo,
}

impl MediaKind {
    /// Lower sorts first when ordering refs for dispatch and prewarming.
    pub fn send_rank(&self) -> u8 {
        match self {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
            MediaKind::Photo => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Photo => "photo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            "photo" => Some(MediaKind::Photo),
            _ => None,
        }
    }

    /// Telegram Bot API method used to send this kind.
    pub fn telegram_method(&self) -> &'static str {
        match self {
            MediaKind::Audio => "sendAudio",
            MediaKind::Video => "sendVideo",
            MediaKind::Photo => "sendPhoto",
        }
    }

    /// Field name carrying the payload in the method parameters.
    pub fn payload_field(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Photo => "photo",
        }
    }
}

/// Reference to a stored media blob. Carries no `file_id`; that is resolved
/// per tenant through the media cache at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub sha256: String,
    pub kind: MediaKind,
}

impl MediaRef {
    pub fn is_valid_sha256(&self) -> bool {
        self.sha256.len() == 64 && self.sha256.chars().all(|c| c.is_ascii_hexdigit())
    }
}

/// Sort refs into dispatch order: audio, then video, then photo. Stable, so
/// refs of the same kind keep their configured order.
pub fn sort_refs_for_dispatch(refs: &mut [MediaRef]) {
    refs.sort_by_key(|r| r.kind.send_rank());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_order_is_audio_video_photo() {
        let mut refs = vec![
            MediaRef { sha256: "p".into(), kind: MediaKind::Photo },
            MediaRef { sha256: "a".into(), kind: MediaKind::Audio },
            MediaRef { sha256: "v".into(), kind: MediaKind::Video },
        ];
        sort_refs_for_dispatch(&mut refs);
        let order: Vec<_> = refs.iter().map(|r| r.sha256.as_str()).collect();
        assert_eq!(order, ["a", "v", "p"]);
    }

    #[test]
    fn sha256_validation() {
        let good = MediaRef { sha256: "ab".repeat(32), kind: MediaKind::Photo };
        assert!(good.is_valid_sha256());
        let bad = MediaRef { sha256: "nope".into(), kind: MediaKind::Photo };
        assert!(!bad.is_valid_sha256());
    }

    #[test]
    fn send_rank_orders_audio_first() {
        let mut kinds = [MediaKind::Photo, MediaKind::Audio, MediaKind::Video];
        kinds.sort_by_key(|k| k.send_rank());
        assert_eq!(kinds, [MediaKind::Audio, MediaKind::Video, MediaKind::Photo]);
    }

    #[test]
    fn parse_round_trips() {
        for kind in [MediaKind::Audio, MediaKind::Video, MediaKind::Photo] {
            assert_eq!(MediaKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::parse("document"), None);
    }
}
