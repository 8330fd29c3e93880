use std::borrow::Cow;

use url::Url;

/// Neutral `href` used in place of any link that fails [`is_url_safe`].
pub const PLACEHOLDER_HREF: &str = "#";

/// Schemes rejected before URL parsing is even attempted.
///
/// Compared against the trimmed, lowercased input so `  JavaScript:` is caught
/// the same way as `javascript:`.
const BLOCKED_SCHEMES: &[&str] = &[
    "javascript:",
    "data:",
    "vbscript:",
    "file:",
    "about:",
    "chrome:",
    "chrome-extension:",
    "moz-extension:",
];

const SCRIPT_SCHEME: &str = "javascript:";

/// Strips markup and script-triggering patterns from untrusted feed text.
///
/// Removes:
/// - every `<...>` tag (an unterminated `<` is plain text and is kept)
/// - the `javascript:` protocol string, in any ASCII case
/// - inline event-handler prefixes such as `onclick=` or `onLoad =`
///
/// then trims surrounding whitespace. Removal can splice a new pattern
/// together (`java<b>script:`), so passes repeat until nothing changes. The
/// result is therefore idempotent and free of all three patterns; every other
/// character is preserved.
///
/// # Examples
///
/// ```
/// use feedsentry::util::sanitize_text;
///
/// assert_eq!(sanitize_text("<b>Alert</b>"), "Alert");
/// assert_eq!(sanitize_text("  click javascript:alert(1) "), "click alert(1)");
/// assert_eq!(sanitize_text(""), "");
/// ```
pub fn sanitize_text(input: &str) -> String {
    let mut current = input.trim().to_string();

    loop {
        let stripped = strip_event_handlers(&remove_ignore_ascii_case(
            &strip_tags(&current),
            SCRIPT_SCHEME,
        ));
        let next = stripped.trim();
        if next == current {
            return current;
        }
        current = next.to_string();
    }
}

/// Returns true if `url` is safe to expose as a navigable link.
///
/// Empty input and any denylisted scheme are rejected regardless of case or
/// surrounding whitespace. Everything else must parse as a URL whose scheme is
/// exactly `http` or `https`. Malformed URLs are unsafe, not errors.
///
/// # Examples
///
/// ```
/// use feedsentry::util::is_url_safe;
///
/// assert!(is_url_safe("https://example.com/post/1"));
/// assert!(!is_url_safe(" JavaScript:alert(1)"));
/// assert!(!is_url_safe("ftp://example.com/file"));
/// assert!(!is_url_safe("not a url"));
/// ```
pub fn is_url_safe(url: &str) -> bool {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return false;
    }

    let normalized = trimmed.to_lowercase();
    if BLOCKED_SCHEMES
        .iter()
        .any(|scheme| normalized.starts_with(scheme))
    {
        return false;
    }

    match Url::parse(trimmed) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// A link prepared for display.
///
/// When `safe` is false, `href` is [`PLACEHOLDER_HREF`]; consumers must render
/// such links as non-navigable and visually flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeLink {
    pub href: String,
    pub text: String,
    pub safe: bool,
}

/// Builds a [`SafeLink`] from an untrusted URL and label.
///
/// The label is always sanitized; the URL is kept only if it passes
/// [`is_url_safe`].
pub fn create_safe_link(url: &str, text: &str) -> SafeLink {
    let text = sanitize_text(text);

    if is_url_safe(url) {
        SafeLink {
            href: url.to_string(),
            text,
            safe: true,
        }
    } else {
        SafeLink {
            href: PLACEHOLDER_HREF.to_string(),
            text,
            safe: false,
        }
    }
}

/// Removes terminal control characters from text before it is printed.
///
/// Dropping ESC and the C1 range leaves any ANSI sequence inert. Tab and
/// newline are kept. Returns `Cow::Borrowed` when nothing needs removing.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_terminal_control) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|&c| !is_terminal_control(c)).collect())
}

fn is_terminal_control(c: char) -> bool {
    c.is_control() && c != '\n' && c != '\t'
}

/// Removes every `<` ... `>` span. A `<` with no later `>` is left alone.
fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(open) = rest.find('<') {
        match rest[open..].find('>') {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }

    out.push_str(rest);
    out
}

/// Removes all occurrences of an ASCII `pattern`, ignoring ASCII case.
fn remove_ignore_ascii_case(s: &str, pattern: &str) -> String {
    let bytes = s.as_bytes();
    let pat = pattern.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut start = 0;
    let mut i = 0;

    // ASCII bytes never occur inside a multi-byte UTF-8 sequence, so every
    // match position is a char boundary.
    while i + pat.len() <= bytes.len() {
        if bytes[i..i + pat.len()].eq_ignore_ascii_case(pat) {
            out.push_str(&s[start..i]);
            i += pat.len();
            start = i;
        } else {
            i += 1;
        }
    }

    out.push_str(&s[start..]);
    out
}

/// Removes `on<word>=` prefixes: `on`, one or more `[A-Za-z0-9_]`, optional
/// whitespace, then `=`. Case-insensitive.
fn strip_event_handlers(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut start = 0;
    let mut i = 0;

    while i + 2 <= bytes.len() {
        if !bytes[i..i + 2].eq_ignore_ascii_case(b"on") {
            i += 1;
            continue;
        }

        match event_handler_end(s, i + 2) {
            Some(end) => {
                out.push_str(&s[start..i]);
                i = end;
                start = end;
            }
            None => i += 1,
        }
    }

    out.push_str(&s[start..]);
    out
}

/// Given the byte offset just past `on`, returns the offset just past the `=`
/// if the remainder forms an event-handler attribute.
fn event_handler_end(s: &str, after_on: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut j = after_on;
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    if j == after_on {
        return None;
    }

    let whitespace: usize = s[j..]
        .chars()
        .take_while(|c| c.is_whitespace())
        .map(char::len_utf8)
        .sum();
    j += whitespace;

    (bytes.get(j) == Some(&b'=')).then_some(j + 1)
}
