//! Requirement extraction from section chunks.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tdpflow_shared::Result;

use crate::chunk::parse_chunks;
use crate::step::{AgentType, StepHeader, TransformStep, to_json};

/// A normative sentence lifted out of a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Sequential identifier, `REQ-0001` onwards.
    pub id: String,
    pub section: String,
    pub text: String,
    /// The modal verb that made the sentence normative.
    pub keyword: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "shall" | "must" => Priority::High,
            "should" => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

/// Turns section chunk JSON into a requirement list.
pub struct SectionToRequirementsAgent {
    header: StepHeader,
}

impl AgentType for SectionToRequirementsAgent {
    const NAME: &'static str = "SectionToRequirementsAgent";
    const OUTPUT_EXT: &'static str = "json";
}

impl SectionToRequirementsAgent {
    pub fn new(step_num: u32) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
        })
    }
}

#[async_trait]
impl TransformStep for SectionToRequirementsAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        static MODAL_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(shall|must|should|will)\b").expect("valid regex")
        });

        let chunks = parse_chunks(content)?;
        let mut requirements = Vec::new();

        for chunk in &chunks {
            let section = chunk.title.clone().unwrap_or_default();
            for sentence in sentences(&chunk.text) {
                let Some(caps) = MODAL_RE.captures(sentence) else {
                    continue;
                };
                let keyword = caps[1].to_lowercase();
                requirements.push(Requirement {
                    id: format!("REQ-{:04}", requirements.len() + 1),
                    section: section.clone(),
                    text: sentence.to_string(),
                    priority: Priority::from_keyword(&keyword),
                    keyword,
                });
            }
        }

        tracing::debug!(
            sections = chunks.len(),
            requirements = requirements.len(),
            "requirements extracted"
        );
        to_json(&requirements)
    }
}

/// Split text into trimmed sentences ending at `.`, `!` or `?` followed by
/// whitespace (or at end of text). Line breaks inside a sentence are folded.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().is_none_or(|(_, next)| next.is_whitespace());
        let at_paragraph = c == '\n' && chars.peek().is_some_and(|(_, next)| *next == '\n');
        if at_boundary || at_paragraph {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}
