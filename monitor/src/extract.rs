//! Content extraction for tracked files.
//!
//! Every snapshot is stored as text. Plain-text formats are stored verbatim;
//! word-processor documents (`.docx`) are converted to a Markdown-like
//! representation first, so that successive snapshots of a document can be
//! compared line by line.
//!
//! Extraction never panics: corrupt or unsupported input is reported as an
//! [`ExtractError`] and the capture attempt that triggered it is dropped.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, trace};

/// Main document part inside a `.docx` package.
const DOCX_DOCUMENT_PART: &str = "word/document.xml";

/// Maximum decompressed bytes read from the document part (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Errors that can occur while extracting content.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The source file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A plain-text file is not valid UTF-8.
    #[error("file is not valid UTF-8 (invalid byte at offset {offset})")]
    InvalidUtf8 { offset: usize },

    /// The document package or its XML could not be parsed.
    #[error("document conversion failed: {0}")]
    Document(String),

    /// The blocking conversion task did not complete.
    #[error("conversion task failed: {0}")]
    Task(String),
}

/// Source formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Text read verbatim as UTF-8 (`.txt`, `.md` and anything unrecognised).
    PlainText,
    /// Office Open XML word-processor document, converted to Markdown.
    WordDocument,
}

impl SourceFormat {
    /// Picks the format from the file extension (case-insensitive).
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("docx") => Self::WordDocument,
            _ => Self::PlainText,
        }
    }
}

/// Reads a file and converts it into its stored textual representation.
///
/// Document conversion runs on the blocking pool so that a large document
/// does not stall other files' watchers.
///
/// # Errors
///
/// Returns [`ExtractError::Read`] if the file cannot be read, and the other
/// variants if its bytes cannot be converted.
pub async fn extract(path: &Path) -> Result<String, ExtractError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ExtractError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let format = SourceFormat::from_path(path);
    debug!(path = %path.display(), ?format, bytes = bytes.len(), "Extracting content");

    match format {
        SourceFormat::PlainText => extract_bytes(format, bytes),
        SourceFormat::WordDocument => tokio::task::spawn_blocking(move || extract_bytes(format, bytes))
            .await
            .map_err(|e| ExtractError::Task(e.to_string()))?,
    }
}

/// Converts raw bytes of the given format into text.
///
/// # Errors
///
/// Returns an error if plain text is not UTF-8 or a document is malformed.
pub fn extract_bytes(format: SourceFormat, bytes: Vec<u8>) -> Result<String, ExtractError> {
    match format {
        SourceFormat::PlainText => String::from_utf8(bytes).map_err(|e| ExtractError::InvalidUtf8 {
            offset: e.utf8_error().valid_up_to(),
        }),
        SourceFormat::WordDocument => docx_to_markdown(&bytes),
    }
}

/// Converts a `.docx` package into Markdown-like text.
///
/// # Errors
///
/// Returns [`ExtractError::Document`] if the bytes are not a zip archive, the
/// main document part is missing or oversized, or its XML is malformed.
pub fn docx_to_markdown(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Document(e.to_string()))?;

    let entry = archive
        .by_name(DOCX_DOCUMENT_PART)
        .map_err(|_| ExtractError::Document(format!("{DOCX_DOCUMENT_PART} not found")))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Document(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Document(format!(
            "{DOCX_DOCUMENT_PART} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }

    render_document_xml(&xml)
}

/// Paragraph being assembled from `w:p` content.
#[derive(Debug, Default)]
struct Paragraph {
    style: Option<String>,
    list_item: bool,
    text: String,
}

impl Paragraph {
    fn render(self) -> Option<String> {
        let text = self.text.trim_end();
        if text.trim().is_empty() {
            return None;
        }

        let prefix = match self.style.as_deref().and_then(heading_level) {
            Some(level) => format!("{} ", "#".repeat(level)),
            None if self.list_item => "- ".to_string(),
            None => String::new(),
        };

        Some(format!("{prefix}{text}"))
    }
}

/// Run being assembled from `w:r` content.
#[derive(Debug, Default)]
struct Run {
    bold: bool,
    italic: bool,
    text: String,
}

impl Run {
    fn render(self) -> String {
        let trimmed = self.text.trim();
        if trimmed.is_empty() || (!self.bold && !self.italic) {
            return self.text;
        }

        let marker = match (self.bold, self.italic) {
            (true, true) => "***",
            (true, false) => "**",
            _ => "*",
        };

        // Markers hug the text; surrounding spaces stay outside.
        let leading = &self.text[..self.text.len() - self.text.trim_start().len()];
        let trailing = &self.text[self.text.trim_end().len()..];
        format!("{leading}{marker}{trimmed}{marker}{trailing}")
    }
}

/// Maps a paragraph style id to a Markdown heading level.
fn heading_level(style: &str) -> Option<usize> {
    let normalized: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    if normalized == "title" {
        return Some(1);
    }

    normalized
        .strip_prefix("heading")
        .and_then(|level| level.parse::<usize>().ok())
        .filter(|level| (1..=6).contains(level))
}

/// Returns the `w:val` attribute of an element, if present.
fn val_attribute(element: &BytesStart<'_>) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"val")
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

/// Whether a toggle property such as `w:b` is switched on.
fn toggle_is_on(element: &BytesStart<'_>) -> bool {
    !matches!(
        val_attribute(element).as_deref(),
        Some("0" | "false" | "off" | "none")
    )
}

/// Walks `word/document.xml` and renders paragraphs as Markdown blocks.
fn render_document_xml(xml: &[u8]) -> Result<String, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut blocks: Vec<String> = Vec::new();
    let mut paragraph: Option<Paragraph> = None;
    let mut run: Option<Run> = None;
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ExtractError::Document(e.to_string()))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"p" if !is_empty => paragraph = Some(Paragraph::default()),
                    b"pStyle" => {
                        if let Some(p) = paragraph.as_mut() {
                            p.style = val_attribute(e);
                        }
                    }
                    b"numPr" => {
                        if let Some(p) = paragraph.as_mut() {
                            p.list_item = true;
                        }
                    }
                    b"r" if !is_empty => run = Some(Run::default()),
                    b"b" => {
                        if let Some(r) = run.as_mut() {
                            r.bold = toggle_is_on(e);
                        }
                    }
                    b"i" => {
                        if let Some(r) = run.as_mut() {
                            r.italic = toggle_is_on(e);
                        }
                    }
                    b"t" if !is_empty => in_text = true,
                    b"tab" => {
                        if let Some(r) = run.as_mut() {
                            r.text.push('\t');
                        }
                    }
                    b"br" | b"cr" => {
                        if let Some(r) = run.as_mut() {
                            r.text.push('\n');
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|e| ExtractError::Document(e.to_string()))?;
                match run.as_mut() {
                    Some(r) => r.text.push_str(&text),
                    None => {
                        if let Some(p) = paragraph.as_mut() {
                            p.text.push_str(&text);
                        }
                    }
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"r" => {
                    if let (Some(r), Some(p)) = (run.take(), paragraph.as_mut()) {
                        p.text.push_str(&r.render());
                    }
                }
                b"p" => {
                    if let Some(block) = paragraph.take().and_then(Paragraph::render) {
                        trace!(len = block.len(), "Rendered paragraph");
                        blocks.push(block);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(blocks.join("\n\n"))
}
