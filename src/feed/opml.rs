use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

use super::types::FeedSource;
use crate::util::{sanitize_text, validate_feed_url};

/// Maximum nesting depth for `<outline>` elements.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),
}

/// Reads an OPML file and returns the feed sources it lists.
///
/// Outlines whose `xmlUrl` fails [`validate_feed_url`] are skipped with a
/// warning rather than failing the whole import.
pub async fn import_file(path: &Path) -> Result<Vec<FeedSource>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_opml_content(&content)
}

/// Extracts feed sources from OPML text.
///
/// Any `<outline>` carrying an `xmlUrl` is a source, whatever its nesting;
/// folder outlines are traversed but not returned. The title comes from
/// `title`, then `text`, then the URL itself.
///
/// quick-xml does not expand `<!ENTITY>` declarations, so a custom entity
/// reference in an attribute is an error rather than an XXE vector.
pub fn parse_opml_content(content: &str) -> Result<Vec<FeedSource>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut sources = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                if let Some(source) = parse_outline(&e, &reader)? {
                    sources.push(source);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Some(source) = parse_outline(&e, &reader)? {
                    sources.push(source);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
    }

    Ok(sources)
}

fn parse_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Option<FeedSource>> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;
    let mut description = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?;
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value.trim().to_string()),
            b"title" => title = Some(sanitize_text(&value)),
            b"text" => text = Some(sanitize_text(&value)),
            b"description" => description = Some(sanitize_text(&value)),
            _ => {}
        }
    }

    let Some(url) = xml_url else {
        return Ok(None);
    };

    if let Err(e) = validate_feed_url(&url) {
        tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL in OPML");
        return Ok(None);
    }

    let title = title
        .filter(|t| !t.is_empty())
        .or(text.filter(|t| !t.is_empty()))
        .unwrap_or_else(|| url.clone());

    Ok(Some(FeedSource {
        title,
        url,
        description: description.filter(|d| !d.is_empty()),
    }))
}

/// Renders sources as an OPML 2.0 document.
pub fn export_opml(sources: &[FeedSource]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    for event in [
        Event::Start(BytesStart::new("head")),
        Event::Start(BytesStart::new("title")),
        Event::Text(BytesText::new("feedsentry sources")),
        Event::End(BytesEnd::new("title")),
        Event::End(BytesEnd::new("head")),
    ] {
        writer
            .write_event(event)
            .context("Failed to write head element")?;
    }

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for source in sources {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", source.title.as_str()));
        outline.push_attribute(("title", source.title.as_str()));
        outline.push_attribute(("xmlUrl", source.url.as_str()));
        if let Some(description) = &source.description {
            outline.push_attribute(("description", description.as_str()));
        }
        writer
            .write_event(Event::Empty(outline))
            .context("Failed to write outline element")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).context("Generated OPML contains invalid UTF-8")
}

/// Writes sources to `path` atomically.
///
/// Content goes to a uniquely named temporary file in the same directory,
/// is synced, then renamed over the destination.
pub fn export_to_file(sources: &[FeedSource], path: &Path) -> Result<()> {
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_opml(sources)?;

    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", suffix));

    let write_temp = || -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temporary file '{}'", temp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write '{}'", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync '{}'", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to rename '{}' to '{}'",
                temp_path.display(),
                path.display()
            )
        })
    };

    write_temp().inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}
