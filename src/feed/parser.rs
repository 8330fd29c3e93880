use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use url::Url;

use super::types::{FeedItem, RawItem};

/// Host reported for items whose feed URL does not parse.
const UNKNOWN_HOST: &str = "unknown";

/// Errors for feed documents that are not well-formed XML.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The XML reader rejected the document (bad syntax, mismatched tags,
    /// undefined entities).
    #[error("XML parse error: {0}")]
    Xml(String),
    /// The document contained no element at all.
    #[error("Document has no root element")]
    NoRootElement,
    /// The document ended while elements were still open.
    #[error("Unexpected end of document: {0} unclosed element(s)")]
    Unclosed(usize),
    /// Elements or text appeared after the root element closed.
    #[error("Content after document root element")]
    TrailingContent,
}

/// Item fields and the tag names they are read from.
///
/// The rank orders fallbacks: when several tags for the same field appear,
/// the lowest rank wins; among equal ranks the first occurrence wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Published(u8),
    Author(u8),
    Summary(u8),
}

impl Field {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"pubDate" => Some(Field::Published(0)),
            b"published" => Some(Field::Published(1)),
            b"updated" => Some(Field::Published(2)),
            b"date" => Some(Field::Published(3)),
            b"creator" => Some(Field::Author(0)),
            b"author" => Some(Field::Author(1)),
            b"description" => Some(Field::Summary(0)),
            b"summary" => Some(Field::Summary(1)),
            b"encoded" => Some(Field::Summary(2)),
            b"content" => Some(Field::Summary(3)),
            _ => None,
        }
    }

    /// Field for an item child, honoring its namespace prefix.
    ///
    /// Title, link and body text only come from unprefixed, `atom:` or
    /// `content:` elements, so extension elements such as `<media:title>`
    /// are ignored. Dates and authors are accepted under any prefix
    /// (`dc:date`, `dc:creator`).
    fn from_element(e: &BytesStart<'_>) -> Option<Self> {
        let name = e.name();
        let field = Self::from_local_name(name.local_name().as_ref())?;
        let allowed = match (field, name.prefix()) {
            (_, None) => true,
            (Field::Published(_) | Field::Author(_), Some(_)) => true,
            (_, Some(prefix)) => matches!(prefix.as_ref(), b"atom" | b"content"),
        };
        allowed.then_some(field)
    }
}

#[derive(Default)]
struct ItemFields {
    title: Option<String>,
    link: Option<String>,
    published: Option<(u8, String)>,
    author: Option<(u8, String)>,
    summary: Option<(u8, String)>,
}

impl ItemFields {
    fn set(&mut self, field: Field, value: String) {
        if value.trim().is_empty() {
            return;
        }
        match field {
            Field::Title => {
                self.title.get_or_insert(value);
            }
            Field::Link => {
                self.link.get_or_insert(value);
            }
            Field::Published(rank) => set_ranked(&mut self.published, rank, value),
            Field::Author(rank) => set_ranked(&mut self.author, rank, value),
            Field::Summary(rank) => set_ranked(&mut self.summary, rank, value),
        }
    }

    fn finish(self) -> RawItem {
        RawItem {
            title: self.title.unwrap_or_default(),
            link: self.link.unwrap_or_default(),
            published: self.published.map(|(_, v)| v).unwrap_or_default(),
            author: self.author.map(|(_, v)| v).unwrap_or_default(),
            summary: self.summary.map(|(_, v)| v).unwrap_or_default(),
        }
    }
}

fn set_ranked(slot: &mut Option<(u8, String)>, rank: u8, value: String) {
    let replace = match slot {
        Some((existing, _)) => rank < *existing,
        None => true,
    };
    if replace {
        *slot = Some((rank, value));
    }
}

/// Text being collected for one direct child of an item.
struct Capture {
    field: Field,
    depth: usize,
    text: String,
    /// Atom `<link href="...">` when the element also has a body
    href: Option<String>,
    /// Atom `<author><name>` text, preferred over the whole author body
    name: Option<String>,
    in_name: bool,
}

struct OpenItem {
    depth: usize,
    fields: ItemFields,
    capture: Option<Capture>,
}

/// Parses an RSS or Atom document into sanitized items.
///
/// Every `<item>` (RSS) and `<entry>` (Atom) becomes one [`FeedItem`], in
/// document order. Missing fields default to empty; every text field is
/// sanitized and unsafe links are replaced by the placeholder (see
/// [`FeedItem::from_raw`]). `feed_url` only supplies `source_host`.
///
/// # Errors
///
/// Returns [`ParseError`] when the document is not well-formed XML. A
/// well-formed document with no items yields an empty `Vec`.
///
/// # Security
///
/// `quick-xml` never expands `<!ENTITY>` declarations; custom entity
/// references fail unescaping and surface as [`ParseError::Xml`].
pub fn parse_feed(raw: &str, feed_url: &str) -> Result<Vec<FeedItem>, ParseError> {
    let source_host = source_host(feed_url);
    let mut reader = Reader::from_str(raw);

    let mut items = Vec::new();
    let mut open: Option<OpenItem> = None;
    let mut depth: usize = 0;
    let mut seen_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ParseError::Xml(e.to_string()))?;

        match event {
            Event::Start(e) => {
                enter_root(depth, &mut seen_root)?;
                depth += 1;
                on_start(&e, depth, &mut open, &reader);
            }
            Event::Empty(e) => {
                enter_root(depth, &mut seen_root)?;
                on_empty(&e, depth + 1, &mut open, &mut items, &source_host, &reader);
            }
            Event::End(e) => {
                if depth == 0 {
                    return Err(ParseError::Xml(format!(
                        "unmatched end tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                on_end(depth, &mut open, &mut items, &source_host);
                depth -= 1;
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                if depth == 0 {
                    if !text.trim().is_empty() {
                        return Err(outside_root(seen_root));
                    }
                } else {
                    append_text(&mut open, &text);
                }
            }
            Event::CData(c) => {
                if depth == 0 {
                    return Err(outside_root(seen_root));
                }
                let text = reader
                    .decoder()
                    .decode(&c)
                    .map_err(|e| ParseError::Xml(e.to_string()))?;
                append_text(&mut open, &text);
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions, DOCTYPE
            _ => {}
        }
    }

    if depth > 0 {
        return Err(ParseError::Unclosed(depth));
    }
    if !seen_root {
        return Err(ParseError::NoRootElement);
    }

    Ok(items)
}

fn source_host(feed_url: &str) -> String {
    Url::parse(feed_url.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

fn enter_root(depth: usize, seen_root: &mut bool) -> Result<(), ParseError> {
    if depth == 0 {
        if *seen_root {
            return Err(ParseError::TrailingContent);
        }
        *seen_root = true;
    }
    Ok(())
}

fn outside_root(seen_root: bool) -> ParseError {
    if seen_root {
        ParseError::TrailingContent
    } else {
        ParseError::Xml("text outside of root element".to_string())
    }
}

fn is_item_element(local: &[u8]) -> bool {
    local == b"item" || local == b"entry"
}

fn on_start(e: &BytesStart<'_>, depth: usize, open: &mut Option<OpenItem>, reader: &Reader<&[u8]>) {
    let local = e.local_name();
    let local = local.as_ref();

    let Some(item) = open.as_mut() else {
        if is_item_element(local) {
            *open = Some(OpenItem {
                depth,
                fields: ItemFields::default(),
                capture: None,
            });
        }
        return;
    };

    match item.capture.as_mut() {
        None => {
            if depth != item.depth + 1 {
                return;
            }
            if let Some(field) = Field::from_element(e) {
                let href = (field == Field::Link)
                    .then(|| link_href(e, reader))
                    .flatten();
                item.capture = Some(Capture {
                    field,
                    depth,
                    text: String::new(),
                    href,
                    name: None,
                    in_name: false,
                });
            }
        }
        Some(capture) => {
            if matches!(capture.field, Field::Author(_))
                && depth == capture.depth + 1
                && local == b"name"
            {
                capture.in_name = true;
                capture.name.get_or_insert_with(String::new);
            }
        }
    }
}

fn on_empty(
    e: &BytesStart<'_>,
    depth: usize,
    open: &mut Option<OpenItem>,
    items: &mut Vec<FeedItem>,
    source_host: &str,
    reader: &Reader<&[u8]>,
) {
    let local = e.local_name();
    let local = local.as_ref();

    match open {
        None if is_item_element(local) => {
            items.push(FeedItem::from_raw(RawItem::default(), source_host));
        }
        Some(item)
            if item.capture.is_none()
                && depth == item.depth + 1
                && Field::from_element(e) == Some(Field::Link) =>
        {
            if let Some(href) = link_href(e, reader) {
                item.fields.set(Field::Link, href);
            }
        }
        _ => {}
    }
}

fn on_end(depth: usize, open: &mut Option<OpenItem>, items: &mut Vec<FeedItem>, source_host: &str) {
    let Some(item) = open.as_mut() else {
        return;
    };

    let mut field_done = false;
    if let Some(capture) = item.capture.as_mut() {
        if capture.in_name && depth == capture.depth + 1 {
            capture.in_name = false;
        }
        field_done = depth == capture.depth;
    }
    if field_done {
        if let Some(capture) = item.capture.take() {
            let (field, value) = finish_capture(capture);
            item.fields.set(field, value);
        }
    }

    if depth == item.depth {
        if let Some(item) = open.take() {
            items.push(FeedItem::from_raw(item.fields.finish(), source_host));
        }
    }
}

fn finish_capture(capture: Capture) -> (Field, String) {
    let value = match capture.field {
        Field::Author(_) => capture
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(capture.text),
        Field::Link if capture.text.trim().is_empty() => capture.href.unwrap_or_default(),
        _ => capture.text,
    };
    (capture.field, value)
}

fn append_text(open: &mut Option<OpenItem>, text: &str) {
    if let Some(capture) = open.as_mut().and_then(|item| item.capture.as_mut()) {
        capture.text.push_str(text);
        if capture.in_name {
            if let Some(name) = &mut capture.name {
                name.push_str(text);
            }
        }
    }
}

/// `href` of an Atom link with no `rel` or `rel="alternate"`.
fn link_href(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Option<String> {
    let mut href = None;
    let mut rel = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed link attribute");
                continue;
            }
        };
        let value = match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(value) => value.into_owned(),
            Err(_) => continue,
        };
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value),
            b"rel" => rel = Some(value),
            _ => {}
        }
    }

    match rel.as_deref() {
        None | Some("alternate") => href,
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::PLACEHOLDER_HREF;
    use pretty_assertions::assert_eq;

    const FEED_URL: &str = "https://feeds.example.com/security.xml";

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example Security</title>
    <link>https://example.com</link>
    <item>
      <title>First advisory</title>
      <link>https://example.com/advisory/1</link>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
      <dc:creator>Jane Analyst</dc:creator>
      <description><![CDATA[<p>Critical <b>RCE</b> in widget</p>]]></description>
    </item>
    <item>
      <title>Second advisory</title>
      <link>https://example.com/advisory/2</link>
      <author>desk@example.com</author>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_rss_items_in_order() {
        let items = parse_feed(RSS, FEED_URL).unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].title, "First advisory");
        assert_eq!(items[0].link, "https://example.com/advisory/1");
        assert!(items[0].link_safe);
        assert_eq!(items[0].author.as_deref(), Some("Jane Analyst"));
        assert_eq!(items[0].summary.as_deref(), Some("Critical RCE in widget"));
        assert_eq!(
            items[0].published.as_ref().map(|p| p.raw.as_str()),
            Some("Tue, 10 Jun 2025 04:00:00 GMT")
        );
        assert!(items[0].published_at().is_some());
        assert_eq!(items[0].source_host, "feeds.example.com");

        assert_eq!(items[1].title, "Second advisory");
        assert_eq!(items[1].author.as_deref(), Some("desk@example.com"));
        assert_eq!(items[1].summary, None);
        assert_eq!(items[1].published, None);
    }

    #[test]
    fn test_channel_title_not_taken_as_item_title() {
        let items = parse_feed(RSS, FEED_URL).unwrap();
        assert!(items.iter().all(|i| i.title != "Example Security"));
    }

    #[test]
    fn test_creator_preferred_over_author() {
        let doc = r#"<rss><channel><item>
            <author>fallback@example.com</author>
            <dc:creator xmlns:dc="http://purl.org/dc/elements/1.1/">Primary</dc:creator>
        </item></channel></rss>"#;
        let items = parse_feed(doc, FEED_URL).unwrap();
        assert_eq!(items[0].author.as_deref(), Some("Primary"));
    }

    #[test]
    fn test_escaped_markup_and_unsafe_link() {
        let doc = r#"<rss><channel><item>
            <title>&lt;b&gt;Alert&lt;/b&gt;</title>
            <link>javascript:alert(1)</link>
        </item></channel></rss>"#;
        let items = parse_feed(doc, FEED_URL).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Alert");
        assert!(!items[0].link_safe);
        assert_eq!(items[0].link, PLACEHOLDER_HREF);
    }

    #[test]
    fn test_nested_markup_in_title_uses_text_content() {
        let doc = "<rss><channel><item><title>Hello <b>World</b></title></item></channel></rss>";
        let items = parse_feed(doc, FEED_URL).unwrap();
        assert_eq!(items[0].title, "Hello World");
    }

    #[test]
    fn test_missing_fields_default_empty() {
        let doc = "<rss><channel><item></item></channel></rss>";
        let items = parse_feed(doc, FEED_URL).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "");
        assert_eq!(items[0].link, PLACEHOLDER_HREF);
        assert!(!items[0].link_safe);
    }

    #[test]
    fn test_parse_atom_entries() {
        let doc = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Feed</title>
  <entry>
    <title>Atom entry</title>
    <link rel="self" href="https://example.com/self"/>
    <link href="https://example.com/entry/1"/>
    <updated>2025-06-10T04:00:00Z</updated>
    <published>2025-06-09T04:00:00Z</published>
    <author><name>Atom Author</name><email>a@example.com</email></author>
    <summary>Short summary</summary>
  </entry>
</feed>"#;
        let items = parse_feed(doc, FEED_URL).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Atom entry");
        assert_eq!(items[0].link, "https://example.com/entry/1");
        assert_eq!(
            items[0].published.as_ref().map(|p| p.raw.as_str()),
            Some("2025-06-09T04:00:00Z")
        );
        assert_eq!(items[0].author.as_deref(), Some("Atom Author"));
        assert_eq!(items[0].summary.as_deref(), Some("Short summary"));
    }

    #[test]
    fn test_empty_channel_is_ok() {
        let doc = r#"<?xml version="1.0"?><rss version="2.0"><channel></channel></rss>"#;
        assert_eq!(parse_feed(doc, FEED_URL).unwrap(), Vec::new());
    }

    #[test]
    fn test_unclosed_document_is_error() {
        assert!(parse_feed("<rss><channel><item>", FEED_URL).is_err());
    }

    #[test]
    fn test_truncated_tag_is_error() {
        assert!(parse_feed("<not valid xml", FEED_URL).is_err());
    }

    #[test]
    fn test_mismatched_tags_is_error() {
        assert!(parse_feed("<rss><channel></rss></channel>", FEED_URL).is_err());
    }

    #[test]
    fn test_plain_text_is_error() {
        assert!(parse_feed("Service Unavailable", FEED_URL).is_err());
        assert_eq!(parse_feed("", FEED_URL), Err(ParseError::NoRootElement));
    }

    #[test]
    fn test_trailing_root_is_error() {
        assert_eq!(
            parse_feed("<rss></rss><rss></rss>", FEED_URL),
            Err(ParseError::TrailingContent)
        );
    }

    #[test]
    fn test_custom_entity_rejected() {
        let doc = r#"<?xml version="1.0"?>
<!DOCTYPE rss [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<rss><channel><item><title>&xxe;</title></item></channel></rss>"#;
        assert!(matches!(parse_feed(doc, FEED_URL), Err(ParseError::Xml(_))));
    }

    #[test]
    fn test_extension_elements_not_taken_as_fields() {
        let doc = r#"<rss xmlns:media="http://search.yahoo.com/mrss/"
            xmlns:content="http://purl.org/rss/1.0/modules/content/"><channel><item>
            <media:title>Thumbnail caption</media:title>
            <media:description>Image credit</media:description>
            <media:content url="https://cdn.example.com/a.jpg">Video</media:content>
            <title>Real headline</title>
            <content:encoded>Full body</content:encoded>
        </item></channel></rss>"#;
        let items = parse_feed(doc, FEED_URL).unwrap();
        assert_eq!(items[0].title, "Real headline");
        assert_eq!(items[0].summary.as_deref(), Some("Full body"));
    }

    #[test]
    fn test_unparseable_feed_url_gives_unknown_host() {
        let doc = "<rss><channel><item><title>x</title></item></channel></rss>";
        let items = parse_feed(doc, "not a url").unwrap();
        assert_eq!(items[0].source_host, UNKNOWN_HOST);
    }
}
