//! Document loading and chunking for the shared knowledge corpus.

use nestling_core::error::Error;
use regex_lite::Regex;
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Unsupported document type: {0}")]
    Unsupported(String),

    #[error("Document is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Document contains no text")]
    Empty,
}

impl From<IngestError> for Error {
    fn from(e: IngestError) -> Self {
        Error::Validation(e.to_string())
    }
}

/// Declared type of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Pdf,
    Word,
    Html,
    PlainText,
}

impl ContentType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" | "doc" => Some(Self::Word),
            "html" | "htm" => Some(Self::Html),
            "txt" | "md" | "text" => Some(Self::PlainText),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|e| e.to_str()).and_then(Self::from_extension)
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/pdf" => Some(Self::Pdf),
            "application/msword"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some(Self::Word),
            "text/html" | "application/xhtml+xml" => Some(Self::Html),
            "text/plain" | "text/markdown" => Some(Self::PlainText),
            _ => None,
        }
    }
}

/// Text extraction, one variant per supported source format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentLoader {
    /// Needs an external extractor.
    Pdf,
    /// Needs an external extractor.
    Word,
    Html,
    PlainText,
}

impl DocumentLoader {
    pub fn for_content_type(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Pdf => Self::Pdf,
            ContentType::Word => Self::Word,
            ContentType::Html => Self::Html,
            ContentType::PlainText => Self::PlainText,
        }
    }

    pub fn load(&self, bytes: &[u8]) -> Result<String, IngestError> {
        let text = match self {
            Self::Pdf => return Err(IngestError::Unsupported("pdf (convert to text first)".into())),
            Self::Word => return Err(IngestError::Unsupported("word (convert to text first)".into())),
            Self::Html => html_to_text(std::str::from_utf8(bytes)?),
            Self::PlainText => std::str::from_utf8(bytes)?.replace("\r\n", "\n"),
        };
        if text.trim().is_empty() {
            return Err(IngestError::Empty);
        }
        Ok(text)
    }
}

fn html_to_text(html: &str) -> String {
    // Literal patterns; a compile failure returns the input unchanged.
    let Ok(hidden) = Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>") else {
        return html.to_string();
    };
    let Ok(breaks) = Regex::new(r"(?i)<br\s*/?>|</(p|div|li|h[1-6]|tr|section|article)\s*>") else {
        return html.to_string();
    };
    let Ok(tags) = Regex::new(r"(?s)<[^>]*>") else {
        return html.to_string();
    };

    let text = hidden.replace_all(html, "");
    let text = breaks.replace_all(&text, "\n");
    let text = tags.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let mut out = String::new();
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        out.push_str(&line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Splits text on the coarsest separator that keeps chunks under
/// `chunk_size` characters, recursing into finer separators for pieces that
/// are still too large, then merges neighbours back up to the limit with
/// `chunk_overlap` characters carried between consecutive chunks.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Default for RecursiveSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators: ["\n\n", "\n", " ", ""].into_iter().map(String::from).collect(),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s.as_str()))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).map(String::as_str).unwrap_or("");
        let finer = separators.get(position + 1..).unwrap_or(&[]);

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|p| !p.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();
        for piece in pieces {
            if char_len(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, separator));
                fitting.clear();
            }
            if finer.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, finer));
            }
        }
        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, separator));
        }
        chunks
    }

    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);
            let joiner = if window.is_empty() { 0 } else { separator_len };
            if total + len + joiner > self.chunk_size && !window.is_empty() {
                push_chunk(&mut chunks, &window, separator);
                // Slide the window until only the overlap remains and the
                // next piece fits.
                while total > self.chunk_overlap
                    || (total > 0 && total + len + if window.is_empty() { 0 } else { separator_len } > self.chunk_size)
                {
                    let Some(first) = window.pop_front() else { break };
                    total -= char_len(first) + if window.is_empty() { 0 } else { separator_len };
                }
            }
            if !window.is_empty() {
                total += separator_len;
            }
            window.push_back(piece);
            total += len;
        }
        push_chunk(&mut chunks, &window, separator);
        chunks
    }
}

fn push_chunk(chunks: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
