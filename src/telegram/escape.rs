/// The MarkdownV2 reserved set, per the Bot API formatting rules. Backslash
/// is escaped first so the pass is idempotent on already-escaped input.
const RESERVED: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escape text for `parse_mode=MarkdownV2`.
///
/// Already-escaped sequences are left alone: `escape(escape(s)) == escape(s)`.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            // A backslash followed by a reserved char is an existing escape;
            // keep it as-is. A bare backslash gets escaped itself.
            match chars.peek() {
                Some(&next) if RESERVED.contains(&next) => {
                    out.push('\\');
                    out.push(next);
                    chars.next();
                }
                _ => out.push_str("\\\\"),
            }
        } else if RESERVED.contains(&c) {
            out.push('\\');
            out.push(c);
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(escape_markdown_v2("a.b!c"), "a\\.b\\!c");
        assert_eq!(escape_markdown_v2("_em_ *b* [l](u)"), "\\_em\\_ \\*b\\* \\[l\\]\\(u\\)");
        assert_eq!(
            escape_markdown_v2("~`>#+-=|{}"),
            "\\~\\`\\>\\#\\+\\-\\=\\|\\{\\}"
        );
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(escape_markdown_v2("hello world"), "hello world");
        assert_eq!(escape_markdown_v2("héllo wörld 123"), "héllo wörld 123");
    }

    #[test]
    fn escape_is_idempotent() {
        let samples = [
            "hello world",
            "a.b!c",
            "price: $1.99 (50% off!)",
            "already \\. escaped",
            "trailing backslash \\",
            "mixed \\* and *",
        ];
        for s in samples {
            let once = escape_markdown_v2(s);
            let twice = escape_markdown_v2(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn bare_backslash_is_escaped() {
        assert_eq!(escape_markdown_v2("a\\z"), "a\\\\z");
        assert_eq!(escape_markdown_v2("\\"), "\\\\");
    }
}
