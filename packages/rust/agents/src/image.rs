//! Image transcription through a vision model.

use std::sync::Arc;

use async_trait::async_trait;
use tdpflow_shared::{Result, TdpFlowError};

use crate::step::{AgentType, StepHeader, TransformStep};

/// A model that turns an image into Markdown.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn describe(
        &self,
        media_type: &str,
        image: &[u8],
        instructions: Option<&str>,
    ) -> Result<String>;
}

/// Identify an image by its magic bytes, returning the media type.
pub fn sniff_image(content: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"BM", "image/bmp"),
        (b"II*\x00", "image/tiff"),
        (b"MM\x00*", "image/tiff"),
    ];

    if content.len() >= 12 && &content[..4] == b"RIFF" && &content[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    SIGNATURES
        .iter()
        .find(|(magic, _)| content.starts_with(magic))
        .map(|(_, media_type)| *media_type)
}

/// Transcribes an image document into Markdown.
pub struct ImageDocumentAgent {
    header: StepHeader,
    model: Arc<dyn VisionModel>,
    special_instructions: Option<String>,
}

impl AgentType for ImageDocumentAgent {
    const NAME: &'static str = "ImageDocumentAgent";
    const OUTPUT_EXT: &'static str = "md";
}

impl ImageDocumentAgent {
    pub fn new(step_num: u32, model: Arc<dyn VisionModel>) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
            model,
            special_instructions: None,
        })
    }

    /// Extra guidance forwarded to the model, usually the source's
    /// special instructions.
    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.special_instructions = instructions.filter(|i| !i.trim().is_empty());
        self
    }
}

#[async_trait]
impl TransformStep for ImageDocumentAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let media_type = sniff_image(content)
            .ok_or_else(|| TdpFlowError::content("unsupported or unrecognised image format"))?;

        tracing::debug!(media_type, bytes = content.len(), "describing image");
        let markdown = self
            .model
            .describe(media_type, content, self.special_instructions.as_deref())
            .await?;

        if markdown.trim().is_empty() {
            return Err(TdpFlowError::content("vision model returned no text"));
        }
        Ok(markdown.into_bytes())
    }
}
