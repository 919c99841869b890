//! Text chunking steps.
//!
//! All chunkers emit the same JSON shape: an array of [`Chunk`]s. Pages are
//! separated by form feeds (`\f`), as produced by PDF text extraction.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tdpflow_shared::{Result, TdpFlowError};

use crate::step::{AgentType, StepHeader, TransformStep, to_json, utf8};
use crate::toc::TocPayload;

/// Default upper bound for [`TextChunkAgent`] chunks, in characters.
pub const DEFAULT_MAX_CHARS: usize = 1500;

/// Default page window for [`PageChunkAgent`].
pub const DEFAULT_PAGES_PER_CHUNK: usize = 10;

const PREAMBLE: &str = "Preamble";

/// One chunk of text with optional heading and starting page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub text: String,
}

/// Parse a chunk array produced by one of the chunkers.
pub fn parse_chunks(content: &[u8]) -> Result<Vec<Chunk>> {
    serde_json::from_slice(content)
        .map_err(|e| TdpFlowError::content(format!("expected a chunk array: {e}")))
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    static BLANK_LINE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n[ \t\x0c]*\n").expect("valid regex"));

    BLANK_LINE_RE
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split on form feeds; a trailing form feed does not open an empty page.
fn split_pages(text: &str) -> Vec<&str> {
    let mut pages: Vec<&str> = text.split('\x0c').collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    pages
}

// ---------------------------------------------------------------------------
// TextChunkAgent
// ---------------------------------------------------------------------------

/// Packs paragraphs into chunks of at most `max_chars` characters.
pub struct TextChunkAgent {
    header: StepHeader,
    max_chars: usize,
}

impl AgentType for TextChunkAgent {
    const NAME: &'static str = "TextChunkAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl TextChunkAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
            max_chars: DEFAULT_MAX_CHARS,
        })
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }
}

#[async_trait]
impl TransformStep for TextChunkAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let text = utf8(content)?;
        let chunks: Vec<Chunk> = pack_paragraphs(text, self.max_chars)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                index,
                title: None,
                page: None,
                text,
            })
            .collect();
        to_json(&chunks)
    }
}

fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in split_paragraphs(text) {
        if char_len(para) > max_chars {
            flush(&mut current, &mut chunks);
            chunks.extend(pack_words(para, max_chars));
            continue;
        }
        if !current.is_empty() && char_len(&current) + 2 + char_len(para) > max_chars {
            flush(&mut current, &mut chunks);
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    flush(&mut current, &mut chunks);
    chunks
}

/// Oversize paragraph fallback: pack whitespace-separated words.
fn pack_words(para: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in para.split_whitespace() {
        for piece in split_long_word(word, max_chars) {
            if !current.is_empty() && char_len(&current) + 1 + char_len(piece) > max_chars {
                flush(&mut current, &mut chunks);
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(piece);
        }
    }
    flush(&mut current, &mut chunks);
    chunks
}

fn split_long_word(word: &str, max_chars: usize) -> Vec<&str> {
    if char_len(word) <= max_chars {
        return vec![word];
    }
    let boundaries: Vec<usize> = word
        .char_indices()
        .map(|(i, _)| i)
        .step_by(max_chars)
        .chain(std::iter::once(word.len()))
        .collect();
    boundaries.windows(2).map(|w| &word[w[0]..w[1]]).collect()
}

fn flush(current: &mut String, chunks: &mut Vec<String>) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

// ---------------------------------------------------------------------------
// SectionChunkAgent
// ---------------------------------------------------------------------------

/// One chunk per heading-delimited section.
pub struct SectionChunkAgent {
    header: StepHeader,
}

impl AgentType for SectionChunkAgent {
    const NAME: &'static str = "SectionChunkAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl SectionChunkAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for SectionChunkAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let text = utf8(content)?;
        to_json(&split_sections(text))
    }
}

/// Heading title of a Markdown (`## Title`) or numbered (`1.2 Title`) line.
fn heading_title(line: &str) -> Option<String> {
    static MD_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s{0,3}#{1,6}\s+(.+?)[\s#]*$").expect("valid regex")
    });
    static NUMBERED_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(\d+(?:\.\d+)*)\.?\s+([A-Z][^.]{0,78})$").expect("valid regex")
    });

    if let Some(caps) = MD_HEADING_RE.captures(line) {
        return Some(caps[1].trim().to_string());
    }
    NUMBERED_HEADING_RE
        .captures(line)
        .map(|caps| format!("{} {}", &caps[1], caps[2].trim()))
}

pub(crate) fn split_sections(text: &str) -> Vec<Chunk> {
    let normalized = text.replace('\x0c', "\n");
    let mut chunks = Vec::new();
    let mut title: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in normalized.lines() {
        if let Some(next) = heading_title(line) {
            push_section(&mut chunks, title.take(), &body, None);
            body.clear();
            title = Some(next);
        } else {
            body.push(line);
        }
    }
    push_section(&mut chunks, title, &body, None);
    chunks
}

/// Append a section chunk; an untitled section is the preamble and is
/// dropped when blank.
fn push_section(chunks: &mut Vec<Chunk>, title: Option<String>, body: &[&str], page: Option<u32>) {
    let body = body.join("\n");
    let body = body.trim();
    let (title, text) = match title {
        Some(title) if body.is_empty() => (title.clone(), title),
        Some(title) => {
            let text = format!("{title}\n{body}");
            (title, text)
        }
        None if body.is_empty() => return,
        None => (PREAMBLE.to_string(), body.to_string()),
    };
    chunks.push(Chunk {
        index: chunks.len(),
        title: Some(title),
        page,
        text,
    });
}

// ---------------------------------------------------------------------------
// PageChunkAgent
// ---------------------------------------------------------------------------

/// Groups consecutive pages into chunks.
pub struct PageChunkAgent {
    header: StepHeader,
    pages_per_chunk: usize,
    number_of_chunks: Option<usize>,
}

impl AgentType for PageChunkAgent {
    const NAME: &'static str = "PageChunkAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl PageChunkAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
            pages_per_chunk: DEFAULT_PAGES_PER_CHUNK,
            number_of_chunks: None,
        })
    }

    /// Chunk `pages_per_chunk` pages at a time, keeping at most `number_of_chunks`.
    pub fn with_window(mut self, pages_per_chunk: usize, number_of_chunks: Option<usize>) -> Self {
        self.pages_per_chunk = pages_per_chunk.max(1);
        self.number_of_chunks = number_of_chunks;
        self
    }
}

#[async_trait]
impl TransformStep for PageChunkAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let text = utf8(content)?;
        let pages = split_pages(text);
        let limit = self.number_of_chunks.unwrap_or(usize::MAX);

        let chunks: Vec<Chunk> = pages
            .chunks(self.pages_per_chunk)
            .take(limit)
            .enumerate()
            .map(|(index, window)| {
                let first = index * self.pages_per_chunk + 1;
                let last = first + window.len() - 1;
                let title = if first == last {
                    format!("Page {first}")
                } else {
                    format!("Pages {first}-{last}")
                };
                Chunk {
                    index,
                    title: Some(title),
                    page: u32::try_from(first).ok(),
                    text: window.join("\n").trim().to_string(),
                }
            })
            .collect();
        to_json(&chunks)
    }
}

// ---------------------------------------------------------------------------
// SectionChunkWithTableOfContentsAgent
// ---------------------------------------------------------------------------

/// Splits the raw source at the headers listed in a table of contents,
/// starting from the first page the TOC references.
pub struct SectionChunkWithTableOfContentsAgent {
    header: StepHeader,
    toc: TocPayload,
}

impl AgentType for SectionChunkWithTableOfContentsAgent {
    const NAME: &'static str = "SectionChunkWithTableOfContentsAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl SectionChunkWithTableOfContentsAgent {
    pub fn new(step_num: u32, toc: TocPayload) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
            toc,
        })
    }

    /// Configure from the output of a TOC extraction step.
    pub fn from_configuration(step_num: u32, payload: &[u8]) -> Result<Self> {
        Self::new(step_num, TocPayload::parse(payload)?)
    }
}

#[async_trait]
impl TransformStep for SectionChunkWithTableOfContentsAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let text = utf8(content)?;
        if self.toc.is_empty() {
            tracing::warn!("empty table of contents, falling back to heading detection");
            return to_json(&split_sections(text));
        }

        let pages = split_pages(text);
        let first_page = self.toc.first_page().unwrap_or(1).max(1) as usize;
        let start = (first_page - 1).min(pages.len().saturating_sub(1));
        let lines: Vec<&str> = pages[start..].iter().flat_map(|p| p.lines()).collect();

        let mut found: Vec<(usize, &crate::toc::TocEntry)> = Vec::new();
        let mut cursor = 0;
        for entry in &self.toc.toc {
            let wanted = normalize_heading(&entry.title);
            if wanted.is_empty() {
                continue;
            }
            if let Some(offset) = lines[cursor..]
                .iter()
                .position(|line| normalize_heading(line) == wanted)
            {
                found.push((cursor + offset, entry));
                cursor += offset + 1;
            }
        }

        if found.is_empty() {
            tracing::warn!(
                headers = self.toc.toc.len(),
                "no TOC header found in source, falling back to heading detection"
            );
            return to_json(&split_sections(text));
        }

        let mut chunks = Vec::new();
        push_section(&mut chunks, None, &lines[..found[0].0], None);
        for (i, (line_idx, entry)) in found.iter().enumerate() {
            let end = found.get(i + 1).map_or(lines.len(), |next| next.0);
            push_section(
                &mut chunks,
                Some(entry.title.clone()),
                &lines[line_idx + 1..end],
                Some(entry.page),
            );
        }
        to_json(&chunks)
    }
}

/// Lower-case, whitespace-collapsed heading text without section numbering.
fn normalize_heading(text: &str) -> String {
    static NUMBERING_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(?:#+|\d+(?:\.\d+)*\.?|[A-Z]\.)\s+").expect("valid regex")
    });

    NUMBERING_RE
        .replace(text.trim(), "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
