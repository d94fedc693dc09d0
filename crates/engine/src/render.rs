//! HTML building blocks for rendered archives
//!
//! Rendered archives are meant to be opened in a browser straight from the
//! unpacked tarball, so every link is relative and there are no scripts or
//! external stylesheets. Pages are emitted through a `quick_xml` writer,
//! which escapes all text and attribute values.

use folio_core::markup::{self, Segment, Token};
use folio_core::{ArchiveError, Result, Timestamp};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

const STYLE: &str = "body{font-family:sans-serif;max-width:60em;margin:2em auto;padding:0 1em}\
table{border-collapse:collapse}td,th{border:1px solid #ccc;padding:.3em .6em;text-align:left}\
.meta{color:#555;font-size:.9em}.field{margin:1em 0}.field h3{margin-bottom:.2em}\
img{max-width:100%}.skipped{color:#a33}";

/// Value cell of a metadata table, or any inline reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// Plain text
    Text(String),
    /// Hyperlink
    Link {
        /// Target, relative or absolute
        href: String,
        /// Visible text
        text: String,
    },
}

impl Cell {
    /// Plain text cell
    pub fn text(text: impl Into<String>) -> Self {
        Cell::Text(text.into())
    }

    /// Link cell
    pub fn link(href: impl Into<String>, text: impl Into<String>) -> Self {
        Cell::Link {
            href: href.into(),
            text: text.into(),
        }
    }
}

/// Streaming writer for one HTML page
pub struct HtmlWriter {
    writer: Writer<Vec<u8>>,
}

impl HtmlWriter {
    /// Open a page: doctype, head with title and style, body heading
    pub fn page(title: &str) -> Result<Self> {
        let mut html = HtmlWriter {
            writer: Writer::new(Vec::new()),
        };
        html.emit(Event::DocType(BytesText::from_escaped("html")))?;
        html.start("html", &[])?;
        html.start("head", &[])?;
        html.empty("meta", &[("charset", "utf-8")])?;
        html.element("title", &[], title)?;
        html.start("style", &[])?;
        html.emit(Event::Text(BytesText::from_escaped(STYLE)))?;
        html.end("style")?;
        html.end("head")?;
        html.start("body", &[])?;
        html.element("h1", &[], title)?;
        Ok(html)
    }

    /// Close the page and return its bytes
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.end("body")?;
        self.end("html")?;
        Ok(self.writer.into_inner())
    }

    fn emit(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| ArchiveError::internal(format!("html output failed: {}", e)))
    }

    /// Opening tag
    pub fn start(&mut self, tag: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let start = BytesStart::new(tag).with_attributes(attrs.iter().copied());
        self.emit(Event::Start(start))
    }

    /// Closing tag
    pub fn end(&mut self, tag: &str) -> Result<()> {
        self.emit(Event::End(BytesEnd::new(tag)))
    }

    /// Void element such as `br` or `img`
    pub fn empty(&mut self, tag: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let start = BytesStart::new(tag).with_attributes(attrs.iter().copied());
        self.emit(Event::Empty(start))
    }

    /// Escaped text
    pub fn text(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.emit(Event::Text(BytesText::new(text)))
    }

    /// Escaped text with line breaks kept as `<br/>`
    pub fn lines(&mut self, text: &str) -> Result<()> {
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                self.empty("br", &[])?;
            }
            self.text(line)?;
        }
        Ok(())
    }

    /// Element holding only text
    pub fn element(&mut self, tag: &str, attrs: &[(&str, &str)], text: &str) -> Result<()> {
        self.start(tag, attrs)?;
        self.text(text)?;
        self.end(tag)
    }

    /// Hyperlink
    pub fn anchor(&mut self, href: &str, text: &str) -> Result<()> {
        self.element("a", &[("href", href)], text)
    }

    /// Inline image
    pub fn image(&mut self, src: &str, alt: &str) -> Result<()> {
        self.empty("img", &[("src", src), ("alt", alt)])
    }

    /// Text or link
    pub fn cell(&mut self, cell: &Cell) -> Result<()> {
        match cell {
            Cell::Text(text) => self.text(text),
            Cell::Link { href, text } => self.anchor(href, text),
        }
    }

    /// Definition table of label/value pairs
    pub fn meta_table(&mut self, rows: &[(&str, Cell)]) -> Result<()> {
        self.start("table", &[("class", "meta")])?;
        for (label, value) in rows {
            self.start("tr", &[])?;
            self.element("th", &[], label)?;
            self.start("td", &[])?;
            self.cell(value)?;
            self.end("td")?;
            self.end("tr")?;
        }
        self.end("table")
    }

    /// Field content: text escaped with line breaks kept, tokens written by `token`
    pub fn content<F>(&mut self, content: &str, mut token: F) -> Result<()>
    where
        F: FnMut(&mut Self, &Token) -> Result<()>,
    {
        for segment in markup::parse(content) {
            match segment {
                Segment::Text(text) => self.lines(text)?,
                Segment::Token(t) => token(self, &t)?,
            }
        }
        Ok(())
    }
}

/// Whether a content type displays inline
pub fn is_image(content_type: &str) -> bool {
    content_type.starts_with("image/")
}

/// Millisecond timestamp as RFC 3339, or the raw number if out of range
pub fn timestamp(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Entry of the archive index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Page path relative to the archive root
    pub href: String,
    /// Node name
    pub title: String,
    /// Node kind label
    pub kind: &'static str,
    /// Nesting level below the top of the exported tree
    pub level: usize,
}

/// `index.html`
pub fn index_page(
    description: &str,
    generated_at: &str,
    entries: &[IndexEntry],
    has_external: bool,
) -> Result<Vec<u8>> {
    let mut html = HtmlWriter::page("Archive contents")?;
    if !description.is_empty() {
        html.element("p", &[], description)?;
    }
    html.element(
        "p",
        &[("class", "meta")],
        &format!("Generated {}, {} items", generated_at, entries.len()),
    )?;
    if has_external {
        html.start("p", &[])?;
        html.anchor(folio_bundle::paths::EXTERNAL_LINKS, "External filestore links")?;
        html.end("p")?;
    }
    html.start("ul", &[])?;
    for entry in entries {
        let indent = format!("margin-left:{}em", entry.level as f32 * 1.5);
        html.start("li", &[("style", indent.as_str())])?;
        html.anchor(&entry.href, &entry.title)?;
        html.text(" ")?;
        html.element("span", &[("class", "meta")], entry.kind)?;
        html.end("li")?;
    }
    html.end("ul")?;
    html.finish()
}

/// Outcome of one filestore reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStatus {
    /// Copied into the archive at this root-relative path
    Embedded(String),
    /// Not copied, with the reason
    Skipped(String),
    /// Filestore embedding was off
    Linked,
}

/// Row of `external-links.html`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRow {
    /// Referencing page, root-relative
    pub source_href: String,
    /// Referencing document name
    pub source_name: String,
    /// `filestore:path`
    pub location: String,
    /// What happened to the file
    pub status: ExternalStatus,
}

/// `external-links.html`
pub fn external_links_page(rows: &[ExternalRow]) -> Result<Vec<u8>> {
    let mut html = HtmlWriter::page("External filestore links")?;
    html.start("table", &[])?;
    html.start("tr", &[])?;
    for heading in ["Document", "Location", "Status"] {
        html.element("th", &[], heading)?;
    }
    html.end("tr")?;
    for row in rows {
        html.start("tr", &[])?;
        html.start("td", &[])?;
        html.anchor(&row.source_href, &row.source_name)?;
        html.end("td")?;
        html.element("td", &[], &row.location)?;
        html.start("td", &[])?;
        match &row.status {
            ExternalStatus::Embedded(path) => html.anchor(path, "included")?,
            ExternalStatus::Skipped(reason) => {
                html.element("span", &[("class", "skipped")], reason)?
            }
            ExternalStatus::Linked => html.text("not included")?,
        }
        html.end("td")?;
        html.end("tr")?;
    }
    html.end("table")?;
    html.finish()
}
