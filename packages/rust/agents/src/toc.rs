//! Table-of-contents extraction.
//!
//! Recognizes the two TOC line shapes found in technical documents:
//! dotted leaders (`Scope ........ 4`) and column-aligned numbered entries
//! (`1.2 Scope        4`).

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tdpflow_shared::{Result, TdpFlowError};

use crate::chunk::parse_chunks;
use crate::step::{AgentType, StepHeader, TransformStep, to_json, utf8};

/// One TOC line: heading title and the page it starts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub page: u32,
}

/// Output of [`TableOfContentsExtractionAgent`]: `{"toc": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocPayload {
    #[serde(default)]
    pub toc: Vec<TocEntry>,
}

impl TocPayload {
    /// Parse a TOC payload produced by an earlier step.
    pub fn parse(content: &[u8]) -> Result<Self> {
        serde_json::from_slice(content)
            .map_err(|e| TdpFlowError::content(format!("unreadable table of contents: {e}")))
    }

    /// Page of the first TOC entry.
    pub fn first_page(&self) -> Option<u32> {
        self.toc.first().map(|e| e.page)
    }

    pub fn is_empty(&self) -> bool {
        self.toc.is_empty()
    }
}

/// Extracts a TOC from page-chunk JSON or plain text.
pub struct TableOfContentsExtractionAgent {
    header: StepHeader,
}

impl AgentType for TableOfContentsExtractionAgent {
    const NAME: &'static str = "TableOfContentsExtractionAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl TableOfContentsExtractionAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for TableOfContentsExtractionAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let text = match parse_chunks(content) {
            Ok(chunks) => chunks
                .into_iter()
                .map(|c| c.text)
                .collect::<Vec<_>>()
                .join("\n"),
            Err(_) => utf8(content)?.to_string(),
        };
        let payload = extract_toc(&text);
        tracing::debug!(entries = payload.toc.len(), "table of contents extracted");
        to_json(&payload)
    }
}

/// Collect TOC entries in document order, skipping the "Contents" caption
/// and exact duplicates.
pub(crate) fn extract_toc(text: &str) -> TocPayload {
    static DOTTED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(.+?)\s*(?:\.\s*){3,}(\d{1,4})\s*$").expect("valid regex")
    });
    static ALIGNED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(\d+(?:\.\d+)*\.?\s+\S.*?)\s{2,}(\d{1,4})\s*$").expect("valid regex")
    });

    let mut toc: Vec<TocEntry> = Vec::new();
    for line in text.lines() {
        let Some(caps) = DOTTED_RE
            .captures(line)
            .or_else(|| ALIGNED_RE.captures(line))
        else {
            continue;
        };
        let title = caps[1].trim().trim_end_matches('.').trim().to_string();
        let Ok(page) = caps[2].parse::<u32>() else {
            continue;
        };
        let lowered = title.to_lowercase();
        if title.is_empty() || lowered == "contents" || lowered == "table of contents" {
            continue;
        }
        let entry = TocEntry { title, page };
        if !toc.contains(&entry) {
            toc.push(entry);
        }
    }
    TocPayload { toc }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOC_TEXT: &str = "Table of Contents\n\
        1 Scope ........................ 3\n\
        1.1 Purpose . . . . . . . . . . 3\n\
        2 Requirements                 5\n\
        Appendix A ..................... 12\n\
        \n\
        This paragraph mentions 3 things.\n";

    #[test]
    fn extracts_dotted_and_aligned_entries() {
        let payload = extract_toc(TOC_TEXT);
        let titles: Vec<&str> = payload.toc.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["1 Scope", "1.1 Purpose", "2 Requirements", "Appendix A"]
        );
        assert_eq!(payload.toc[2].page, 5);
        assert_eq!(payload.first_page(), Some(3));
    }

    #[test]
    fn payload_parse_rejects_garbage() {
        let err = TocPayload::parse(b"not json").unwrap_err();
        assert!(err.to_string().contains("table of contents"));
        assert!(TocPayload::parse(br#"{"toc":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn first_page_follows_entry_order() {
        let payload = TocPayload::parse(
            br#"{"toc":[{"title":"Intro","page":5},{"title":"Preface","page":3}]}"#,
        )
        .unwrap();
        assert_eq!(payload.first_page(), Some(5));
        assert_eq!(TocPayload::parse(br#"{"toc":[]}"#).unwrap().first_page(), None);
    }

    #[tokio::test]
    async fn agent_reads_chunk_json() {
        let agent = TableOfContentsExtractionAgent::new(2).unwrap();
        let chunks = serde_json::json!([
            {"index": 0, "title": "Pages 1-10", "page": 1, "text": TOC_TEXT}
        ]);
        let out = agent
            .process_content(chunks.to_string().as_bytes())
            .await
            .unwrap();
        let payload = TocPayload::parse(&out).unwrap();
        assert_eq!(payload.toc.len(), 4);
        assert_eq!(agent.compute_output_filename("doc_1.json"), "doc_2.json");
    }

    #[tokio::test]
    async fn agent_without_toc_yields_empty_payload() {
        let agent = TableOfContentsExtractionAgent::new(2).unwrap();
        let out = agent.process_content(b"just prose").await.unwrap();
        assert!(TocPayload::parse(&out).unwrap().is_empty());
    }
}
