pub mod downsell;
pub mod shot;

pub use downsell::DownsellScheduler;
pub use shot::{FunnelTargetSource, ShotScheduler, ShotTargetSource};

use crate::media::MediaRef;
use crate::sender::SendBody;

/// Build the send body for configured content: media (with the text as
/// caption) when refs exist, plain text otherwise. `None` when there is
/// nothing to send.
pub(crate) fn content_body(text: &str, media_refs: &[MediaRef]) -> Option<SendBody> {
    if !media_refs.is_empty() {
        Some(SendBody::Media {
            refs: media_refs.to_vec(),
            caption: (!text.is_empty()).then(|| text.to_string()),
            raw: false,
        })
    } else if !text.is_empty() {
        Some(SendBody::Text {
            text: text.to_string(),
            disable_preview: false,
            raw: false,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    #[test]
    fn media_content_carries_text_as_caption() {
        let refs = vec![MediaRef {
            sha256: "ab".repeat(32),
            kind: MediaKind::Photo,
        }];
        match content_body("look", &refs) {
            Some(SendBody::Media { caption, refs, .. }) => {
                assert_eq!(caption.as_deref(), Some("look"));
                assert_eq!(refs.len(), 1);
            }
            other => panic!("expected media body, got {:?}", other),
        }
    }

    #[test]
    fn text_only_content() {
        match content_body("hello", &[]) {
            Some(SendBody::Text { text, .. }) => assert_eq!(text, "hello"),
            other => panic!("expected text body, got {:?}", other),
        }
    }

    #[test]
    fn empty_content_yields_none() {
        assert!(content_body("", &[]).is_none());
    }
}
