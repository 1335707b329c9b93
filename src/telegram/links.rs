//! `t.me` post link parsing.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::PostLink;

static POST_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.)?(?:t|telegram)\.me/(?:c/(\d+)|([A-Za-z][A-Za-z0-9_]{3,31}))/(?:\d+/)?(\d+)/?(?:\?.*)?$",
    )
    .unwrap()
});

/// Parse a public (`t.me/<username>/<id>`) or private
/// (`t.me/c/<internal>/<id>`) post link. A topic segment before the message
/// id is accepted and ignored.
pub fn parse_post_link(input: &str) -> Option<PostLink> {
    let link = input.trim();
    let caps = POST_LINK.captures(link)?;
    let message_id: i32 = caps.get(3)?.as_str().parse().ok()?;
    let from_peer = match (caps.get(1), caps.get(2)) {
        (Some(internal), _) => format!("-100{}", internal.as_str()),
        (None, Some(username)) => username.as_str().to_string(),
        (None, None) => return None,
    };
    Some(PostLink {
        link: link.to_string(),
        from_peer,
        message_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_link() {
        let p = parse_post_link("https://t.me/dealsdaily/1520").unwrap();
        assert_eq!(p.from_peer, "dealsdaily");
        assert_eq!(p.message_id, 1520);
    }

    #[test]
    fn test_private_link() {
        let p = parse_post_link("t.me/c/1234567890/42").unwrap();
        assert_eq!(p.from_peer, "-1001234567890");
        assert_eq!(p.message_id, 42);
    }

    #[test]
    fn test_topic_segment_ignored() {
        let p = parse_post_link("https://t.me/c/999/7/88?single").unwrap();
        assert_eq!(p.from_peer, "-100999");
        assert_eq!(p.message_id, 88);
    }

    #[test]
    fn test_rejects_non_links() {
        assert!(parse_post_link("hello").is_none());
        assert!(parse_post_link("https://t.me/dealsdaily").is_none());
        assert!(parse_post_link("https://example.com/a/1").is_none());
    }
}
