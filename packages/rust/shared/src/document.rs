//! Document records and their persisted lifecycle.
//!
//! A [`Document`] is either an ingested source (TDP) file or a derivative
//! produced by a transform step. The distinction is the [`Origin`] sum type:
//! derivative-only provenance lives in [`Derivation`], present only for the
//! `Derivative` variant. Status setters persist through an explicit
//! [`PersistenceService`] handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AssessmentConfig;
use crate::error::{Result, TdpFlowError};
use crate::persistence::PersistenceService;
use crate::types::{DocumentKind, LoadingMethod, ScenarioId, Status};

/// Sentinel for an unknown content size.
pub const UNKNOWN_SIZE_KB: f64 = -1.0;

fn unknown_size() -> f64 {
    UNKNOWN_SIZE_KB
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Provenance of a derivative: which document it came from and who made it.
///
/// `source_file_name` is a back-reference by name, never ownership, so
/// derivatives form a DAG keyed by file name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derivation {
    #[serde(default)]
    pub source_storage_url: String,
    pub source_file_name: String,
    pub processed_at: DateTime<Utc>,
    pub agent_name: String,
}

/// Whether a document was ingested or produced by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Source,
    Derivative(Derivation),
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A piece of content at rest within a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    file_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub storage_url: String,
    /// Opaque metadata blob.
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    status: Status,
    #[serde(default)]
    pub load_in_context: bool,
    #[serde(default)]
    pub loading_method: LoadingMethod,
    #[serde(default = "unknown_size")]
    pub size_kb: f64,
    #[serde(default)]
    consuming_derivative_names: Vec<String>,
    #[serde(default)]
    pub special_instructions: String,
    #[serde(default)]
    pub initial_assessment: String,
    #[serde(default)]
    pub final_assessment: String,
    #[serde(default)]
    pub error: String,
    origin: Origin,
}

impl Document {
    /// A new source document record.
    pub fn source(file_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::with_origin(file_name.into(), description.into(), Origin::Source)
    }

    /// A new derivative of `source`, produced by `agent_name`.
    pub fn derivative(
        file_name: impl Into<String>,
        source: &Document,
        agent_name: impl Into<String>,
    ) -> Self {
        let agent_name = agent_name.into();
        let description = format!("{agent_name} output for {}", source.file_name);
        Self::with_origin(
            file_name.into(),
            description,
            Origin::Derivative(Derivation {
                source_storage_url: source.storage_url.clone(),
                source_file_name: source.file_name.clone(),
                processed_at: Utc::now(),
                agent_name,
            }),
        )
    }

    fn with_origin(file_name: String, description: String, origin: Origin) -> Self {
        Self {
            file_name,
            description,
            storage_url: String::new(),
            metadata: String::new(),
            status: Status::Unknown,
            load_in_context: false,
            loading_method: LoadingMethod::Undecided,
            size_kb: UNKNOWN_SIZE_KB,
            consuming_derivative_names: Vec::new(),
            special_instructions: String::new(),
            initial_assessment: String::new(),
            final_assessment: String::new(),
            error: String::new(),
            origin,
        }
    }

    /// Set the initial status of a freshly created record (ingestion only).
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Set processing instructions for steps that honor them.
    pub fn with_special_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.special_instructions = instructions.into();
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Name of the document; unique within its scenario and kind, never changes.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Names of derivatives that consumed this document, in consumption order.
    pub fn consuming_derivative_names(&self) -> &[String] {
        &self.consuming_derivative_names
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn kind(&self) -> DocumentKind {
        match self.origin {
            Origin::Source => DocumentKind::Source,
            Origin::Derivative(_) => DocumentKind::Derivative,
        }
    }

    /// Provenance, for derivatives only.
    pub fn derivation(&self) -> Option<&Derivation> {
        match &self.origin {
            Origin::Source => None,
            Origin::Derivative(d) => Some(d),
        }
    }

    /// Name of the document this derivative was produced from.
    pub fn source_file_name(&self) -> Option<&str> {
        self.derivation().map(|d| d.source_file_name.as_str())
    }

    /// Name of the step that produced this derivative.
    pub fn agent_name(&self) -> Option<&str> {
        self.derivation().map(|d| d.agent_name.as_str())
    }

    /// File extension (text after the last `.`), empty when there is none.
    pub fn ext(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("")
    }

    /// Whether downstream consumers can read this document without transforming it.
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    /// Record `outgoing` as a consumer; names are kept unique.
    fn add_consumer(&mut self, outgoing: &str) {
        if !self.consuming_derivative_names.iter().any(|n| n == outgoing) {
            self.consuming_derivative_names.push(outgoing.to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Persisted lifecycle
    // -----------------------------------------------------------------------

    /// Persist this record into the namespace matching its kind.
    ///
    /// When content is given, the storage URL and size are refreshed from it.
    pub async fn write(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
        content: Option<&[u8]>,
    ) -> Result<()> {
        if let Some(bytes) = content {
            self.storage_url = store.locate(scenario, self.kind(), &self.file_name);
            self.size_kb = bytes.len() as f64 / 1024.0;
        }
        match self.kind() {
            DocumentKind::Source => store.write_source(scenario, self, content).await,
            DocumentKind::Derivative => store.write_derivative(scenario, self, content).await,
        }
    }

    /// Read this document's content from its namespace.
    pub async fn get_content(
        &self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
    ) -> Result<Vec<u8>> {
        store.read(scenario, self.kind(), &self.file_name).await
    }

    /// Load the stored record this derivative was produced from.
    pub async fn source_ref(
        &self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
    ) -> Result<Document> {
        let source = self.source_file_name().ok_or_else(|| {
            TdpFlowError::validation(format!("'{}' is not a derivative", self.file_name))
        })?;
        store.resolve_ref(scenario, source).await
    }

    pub async fn set_queued(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
    ) -> Result<()> {
        self.status = Status::Queued;
        self.write(store, scenario, None).await
    }

    pub async fn set_processing(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
    ) -> Result<()> {
        self.status = Status::Processing;
        self.error.clear();
        self.write(store, scenario, None).await
    }

    /// Mark processed, persist `content`, and cascade to the source document.
    ///
    /// The source (a source document, or another derivative) becomes
    /// `TRANSFORMED` with this document recorded as a consumer. A source that
    /// cannot be resolved is skipped.
    pub async fn set_processed(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
        content: Option<&[u8]>,
    ) -> Result<()> {
        self.status = Status::Processed;
        self.error.clear();
        if let Origin::Derivative(derivation) = &mut self.origin {
            derivation.processed_at = Utc::now();
        }
        self.write(store, scenario, content).await?;

        let Some(source_name) = self.source_file_name() else {
            return Ok(());
        };
        match store.resolve_ref(scenario, source_name).await {
            Ok(mut source) => {
                source
                    .set_transformed(store, scenario, Some(&self.file_name))
                    .await
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    file_name = %self.file_name,
                    source = source_name,
                    "source document not found, skipping cascade"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Mark failed with `message`. Terminal for the current attempt.
    pub async fn set_error(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
        message: impl Into<String>,
    ) -> Result<()> {
        self.status = Status::Error;
        self.error = message.into();
        self.write(store, scenario, None).await
    }

    /// Mark as a synthesized (not actually run) output of `agent_name` over `source`.
    pub async fn set_mocked(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
        source: &Document,
        agent_name: impl Into<String>,
    ) -> Result<()> {
        self.status = Status::Mocked;
        self.origin = Origin::Derivative(Derivation {
            source_storage_url: source.storage_url.clone(),
            source_file_name: source.file_name.clone(),
            processed_at: Utc::now(),
            agent_name: agent_name.into(),
        });
        self.write(store, scenario, None).await
    }

    /// Mark as subsumed by a derivative; the document is no longer loaded directly.
    pub async fn set_transformed(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
        outgoing: Option<&str>,
    ) -> Result<()> {
        self.status = Status::Transformed;
        self.load_in_context = false;
        self.loading_method = LoadingMethod::Obsolete;
        if let Some(name) = outgoing {
            self.add_consumer(name);
        }
        self.write(store, scenario, None).await
    }

    /// Measure the document and decide how it should be consumed.
    ///
    /// Content is looked up as a source first and as a derivative second; if
    /// neither exists the record is left untouched.
    pub async fn assess(
        &mut self,
        store: &dyn PersistenceService,
        scenario: &ScenarioId,
        policy: &AssessmentConfig,
    ) -> Result<()> {
        let content = match store.read_source(scenario, &self.file_name).await {
            Ok(bytes) => bytes,
            Err(_) => match store.read_derivative(scenario, &self.file_name).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(file_name = %self.file_name, error = %e, "nothing to assess");
                    return Ok(());
                }
            },
        };

        self.size_kb = content.len() as f64 / 1024.0;

        if self.status == Status::Transformed || self.loading_method == LoadingMethod::Obsolete {
            return self.write(store, scenario, None).await;
        }

        let ext = self.ext().to_lowercase();
        let in_context = policy.in_context_extensions.iter().any(|e| *e == ext)
            && self.size_kb <= policy.max_in_context_kb;

        if in_context {
            self.load_in_context = true;
            self.loading_method = LoadingMethod::InContext;
            self.initial_assessment =
                format!("{:.1} KB {ext} document, loaded in context", self.size_kb);
        } else {
            self.load_in_context = false;
            self.loading_method = LoadingMethod::Transform;
            self.initial_assessment =
                format!("{:.1} KB {ext} document, requires transformation", self.size_kb);
        }

        self.write(store, scenario, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn scenario() -> ScenarioId {
        ScenarioId::new("scenario-1").unwrap()
    }

    async fn stored_source(store: &MemoryStore, name: &str, content: &[u8]) -> Document {
        let mut doc = Document::source(name, "test source");
        doc.write(store, &scenario(), Some(content)).await.unwrap();
        doc
    }

    #[test]
    fn ext_is_text_after_last_dot() {
        assert_eq!(Document::source("report.final.pdf", "").ext(), "pdf");
        assert_eq!(Document::source("README", "").ext(), "");
    }

    #[test]
    fn derivative_points_back_to_source() {
        let mut source = Document::source("report.pdf", "");
        source.storage_url = "memory://s/source/report.pdf".into();
        let derived = Document::derivative("report_1.json", &source, "TextChunkAgent");

        assert_eq!(derived.kind(), DocumentKind::Derivative);
        assert_eq!(derived.source_file_name(), Some("report.pdf"));
        assert_eq!(derived.agent_name(), Some("TextChunkAgent"));
        assert_eq!(
            derived.derivation().unwrap().source_storage_url,
            "memory://s/source/report.pdf"
        );
        assert_eq!(source.kind(), DocumentKind::Source);
        assert!(source.source_file_name().is_none());
    }

    #[test]
    fn derivative_record_serializes_with_kind_tag() {
        let source = Document::source("a.txt", "");
        let derived = Document::derivative("a_1.json", &source, "TextChunkAgent");
        let json = serde_json::to_value(&derived).unwrap();
        assert_eq!(json["origin"]["kind"], "derivative");
        assert_eq!(json["origin"]["source_file_name"], "a.txt");

        let parsed: Document = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, derived);
    }

    #[tokio::test]
    async fn write_with_content_sets_url_and_size() {
        let store = MemoryStore::new();
        let doc = stored_source(&store, "a.txt", &[0u8; 2048]).await;
        assert_eq!(doc.storage_url, "memory://scenario-1/source/a.txt");
        assert_eq!(doc.size_kb, 2.0);
    }

    #[tokio::test]
    async fn set_processed_cascades_to_source_once() {
        let store = MemoryStore::new();
        let source = stored_source(&store, "report.pdf", b"pdf").await;

        let mut derived = Document::derivative("report_1.json", &source, "SectionChunkAgent");
        derived
            .set_processed(&store, &scenario(), Some(b"[]"))
            .await
            .unwrap();
        // A re-run of the same step must not duplicate the consumer entry.
        derived
            .set_processed(&store, &scenario(), Some(b"[]"))
            .await
            .unwrap();

        let source = store.get_source_ref(&scenario(), "report.pdf").await.unwrap();
        assert_eq!(source.status(), Status::Transformed);
        assert_eq!(source.loading_method, LoadingMethod::Obsolete);
        assert!(!source.load_in_context);
        assert_eq!(source.consuming_derivative_names(), ["report_1.json"]);

        let stored = store
            .get_derivative_ref(&scenario(), "report_1.json")
            .await
            .unwrap();
        assert_eq!(stored.status(), Status::Processed);
        assert_eq!(store.read_derivative(&scenario(), "report_1.json").await.unwrap(), b"[]");
    }

    #[tokio::test]
    async fn set_processed_cascades_to_derivative_parent() {
        let store = MemoryStore::new();
        let source = stored_source(&store, "a.txt", b"text").await;
        let mut first = Document::derivative("a_1.json", &source, "TextChunkAgent");
        first.set_processed(&store, &scenario(), Some(b"[]")).await.unwrap();

        let mut second = Document::derivative("a_2.index", &first, "SearchIndexAgent");
        second.set_processed(&store, &scenario(), Some(b"{}")).await.unwrap();

        let first = store.get_derivative_ref(&scenario(), "a_1.json").await.unwrap();
        assert_eq!(first.status(), Status::Transformed);
        assert_eq!(first.consuming_derivative_names(), ["a_2.index"]);
    }

    #[tokio::test]
    async fn set_processed_without_stored_source_still_succeeds() {
        let store = MemoryStore::new();
        let ghost = Document::source("ghost.txt", "");
        let mut derived = Document::derivative("ghost_1.json", &ghost, "TextChunkAgent");
        derived.set_processed(&store, &scenario(), Some(b"[]")).await.unwrap();
        assert_eq!(derived.status(), Status::Processed);
    }

    #[tokio::test]
    async fn set_error_records_message_and_clears_on_processing() {
        let store = MemoryStore::new();
        let source = stored_source(&store, "a.txt", b"x").await;
        let mut derived = Document::derivative("a_1.json", &source, "TextChunkAgent");

        derived
            .set_error(&store, &scenario(), "bad input")
            .await
            .unwrap();
        let stored = store.get_derivative_ref(&scenario(), "a_1.json").await.unwrap();
        assert_eq!(stored.status(), Status::Error);
        assert_eq!(stored.error, "bad input");

        derived.set_processing(&store, &scenario()).await.unwrap();
        assert_eq!(derived.status(), Status::Processing);
        assert!(derived.error.is_empty());

        derived.set_queued(&store, &scenario()).await.unwrap();
        let stored = store.get_derivative_ref(&scenario(), "a_1.json").await.unwrap();
        assert_eq!(stored.status(), Status::Queued);
    }

    #[tokio::test]
    async fn set_mocked_copies_provenance() {
        let store = MemoryStore::new();
        let source = stored_source(&store, "diagram.vsdx", b"zip").await;
        let mut mocked = Document::source("diagram_1.json", "Mocked output document.");

        mocked
            .set_mocked(&store, &scenario(), &source, "VisioAgent")
            .await
            .unwrap();

        assert_eq!(mocked.status(), Status::Mocked);
        assert_eq!(mocked.kind(), DocumentKind::Derivative);
        assert_eq!(mocked.source_file_name(), Some("diagram.vsdx"));
        assert_eq!(mocked.agent_name(), Some("VisioAgent"));
        assert_eq!(
            mocked.derivation().unwrap().source_storage_url,
            source.storage_url
        );
        assert!(
            store
                .get_derivative_ref(&scenario(), "diagram_1.json")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn assess_marks_small_text_in_context() {
        let store = MemoryStore::new();
        let mut doc = stored_source(&store, "notes.md", &[b'a'; 1024]).await;
        doc.assess(&store, &scenario(), &AssessmentConfig::default())
            .await
            .unwrap();

        assert_eq!(doc.size_kb, 1.0);
        assert!(doc.load_in_context);
        assert_eq!(doc.loading_method, LoadingMethod::InContext);
        assert!(doc.initial_assessment.contains("in context"));
    }

    #[tokio::test]
    async fn assess_routes_binary_formats_to_transformation() {
        let store = MemoryStore::new();
        let mut doc = stored_source(&store, "parts.xlsx", b"PK\x03\x04").await;
        doc.assess(&store, &scenario(), &AssessmentConfig::default())
            .await
            .unwrap();
        assert!(!doc.load_in_context);
        assert_eq!(doc.loading_method, LoadingMethod::Transform);
    }

    #[tokio::test]
    async fn assess_falls_back_to_derivative_content() {
        let store = MemoryStore::new();
        let source = Document::source("a.txt", "");
        let mut derived = Document::derivative("a_1.json", &source, "TextChunkAgent");
        derived.write(&store, &scenario(), Some(&[b'x'; 512])).await.unwrap();
        derived.size_kb = UNKNOWN_SIZE_KB;

        derived
            .assess(&store, &scenario(), &AssessmentConfig::default())
            .await
            .unwrap();
        assert_eq!(derived.size_kb, 0.5);
    }

    #[tokio::test]
    async fn assess_without_content_leaves_document_untouched() {
        let store = MemoryStore::new();
        let mut doc = Document::source("missing.txt", "");
        let before = doc.clone();
        doc.assess(&store, &scenario(), &AssessmentConfig::default())
            .await
            .unwrap();
        assert_eq!(doc, before);
    }

    #[tokio::test]
    async fn source_ref_requires_a_derivative() {
        let store = MemoryStore::new();
        let source = stored_source(&store, "a.txt", b"x").await;
        assert!(source.source_ref(&store, &scenario()).await.is_err());

        let derived = Document::derivative("a_1.json", &source, "TextChunkAgent");
        let found = derived.source_ref(&store, &scenario()).await.unwrap();
        assert_eq!(found.file_name(), "a.txt");
    }
}
