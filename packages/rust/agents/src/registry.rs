//! Step catalogue and the registry that builds steps with their backends.

use std::collections::HashMap;
use std::sync::Arc;

use tdpflow_shared::{AppConfig, Result, ScenarioId, TdpFlowError};

use crate::bridge::BridgeVisionModel;
use crate::chunk::{
    DEFAULT_PAGES_PER_CHUNK, PageChunkAgent, SectionChunkAgent,
    SectionChunkWithTableOfContentsAgent, TextChunkAgent,
};
use crate::excel::ExcelToJsonAgent;
use crate::image::{ImageDocumentAgent, VisionModel};
use crate::index::{DEFAULT_BATCH_SIZE, GraphStoreAgent, SearchIndexAgent, VectorStoreAgent};
use crate::requirements::SectionToRequirementsAgent;
use crate::sinks::{
    ElasticsearchIndex, Embedder, GraphStore, HashingEmbedder, Neo4jGraphStore, QdrantStore,
    SearchIndex, VectorStore,
};
use crate::step::{AgentType, TransformStep};
use crate::sysml::{JsonToSysmlAgent, SysmlChunkAgent, VisioJsonToSysmlAgent};
use crate::toc::TableOfContentsExtractionAgent;
use crate::visio::VisioAgent;

/// Chunks kept by the page chunker when scanning for a table of contents.
const TOC_SCAN_CHUNKS: usize = 1;

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

/// Every built-in transform step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    ImageDocument,
    TextChunk,
    SectionChunk,
    PageChunk,
    TableOfContentsExtraction,
    SectionChunkWithTableOfContents,
    SectionToRequirements,
    ExcelToJson,
    JsonToSysml,
    Visio,
    VisioJsonToSysml,
    SysmlChunk,
    SearchIndex,
    VectorStore,
    GraphStore,
}

impl StepKind {
    pub const ALL: [StepKind; 15] = [
        StepKind::ImageDocument,
        StepKind::TextChunk,
        StepKind::SectionChunk,
        StepKind::PageChunk,
        StepKind::TableOfContentsExtraction,
        StepKind::SectionChunkWithTableOfContents,
        StepKind::SectionToRequirements,
        StepKind::ExcelToJson,
        StepKind::JsonToSysml,
        StepKind::Visio,
        StepKind::VisioJsonToSysml,
        StepKind::SysmlChunk,
        StepKind::SearchIndex,
        StepKind::VectorStore,
        StepKind::GraphStore,
    ];

    /// The `AgentName` recorded on derivatives this step produces.
    pub fn name(self) -> &'static str {
        match self {
            Self::ImageDocument => ImageDocumentAgent::NAME,
            Self::TextChunk => TextChunkAgent::NAME,
            Self::SectionChunk => SectionChunkAgent::NAME,
            Self::PageChunk => PageChunkAgent::NAME,
            Self::TableOfContentsExtraction => TableOfContentsExtractionAgent::NAME,
            Self::SectionChunkWithTableOfContents => SectionChunkWithTableOfContentsAgent::NAME,
            Self::SectionToRequirements => SectionToRequirementsAgent::NAME,
            Self::ExcelToJson => ExcelToJsonAgent::NAME,
            Self::JsonToSysml => JsonToSysmlAgent::NAME,
            Self::Visio => VisioAgent::NAME,
            Self::VisioJsonToSysml => VisioJsonToSysmlAgent::NAME,
            Self::SysmlChunk => SysmlChunkAgent::NAME,
            Self::SearchIndex => SearchIndexAgent::NAME,
            Self::VectorStore => VectorStoreAgent::NAME,
            Self::GraphStore => GraphStoreAgent::NAME,
        }
    }

    pub fn output_ext(self) -> &'static str {
        match self {
            Self::ImageDocument => ImageDocumentAgent::OUTPUT_EXT,
            Self::TextChunk => TextChunkAgent::OUTPUT_EXT,
            Self::SectionChunk => SectionChunkAgent::OUTPUT_EXT,
            Self::PageChunk => PageChunkAgent::OUTPUT_EXT,
            Self::TableOfContentsExtraction => TableOfContentsExtractionAgent::OUTPUT_EXT,
            Self::SectionChunkWithTableOfContents => {
                SectionChunkWithTableOfContentsAgent::OUTPUT_EXT
            }
            Self::SectionToRequirements => SectionToRequirementsAgent::OUTPUT_EXT,
            Self::ExcelToJson => ExcelToJsonAgent::OUTPUT_EXT,
            Self::JsonToSysml => JsonToSysmlAgent::OUTPUT_EXT,
            Self::Visio => VisioAgent::OUTPUT_EXT,
            Self::VisioJsonToSysml => VisioJsonToSysmlAgent::OUTPUT_EXT,
            Self::SysmlChunk => SysmlChunkAgent::OUTPUT_EXT,
            Self::SearchIndex => SearchIndexAgent::OUTPUT_EXT,
            Self::VectorStore => VectorStoreAgent::OUTPUT_EXT,
            Self::GraphStore => GraphStoreAgent::OUTPUT_EXT,
        }
    }

    /// Look a kind up by its agent name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Build context
// ---------------------------------------------------------------------------

/// What a step may need from the run that constructs it.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub scenario: ScenarioId,
    /// The source document's special instructions.
    pub special_instructions: Option<String>,
    /// Output of an earlier step used to configure this one.
    pub configuration: Option<Vec<u8>>,
}

impl BuildContext {
    pub fn new(scenario: ScenarioId) -> Self {
        Self {
            scenario,
            special_instructions: None,
            configuration: None,
        }
    }

    pub fn with_special_instructions(mut self, instructions: Option<String>) -> Self {
        self.special_instructions = instructions;
        self
    }

    pub fn with_configuration(mut self, configuration: Option<Vec<u8>>) -> Self {
        self.configuration = configuration;
        self
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builds a custom step for `(step_num, context)`.
pub type StepFactory =
    Arc<dyn Fn(u32, &BuildContext) -> Result<Box<dyn TransformStep>> + Send + Sync>;

/// Wrap a closure as a [`StepFactory`].
pub fn step_factory<F>(factory: F) -> StepFactory
where
    F: Fn(u32, &BuildContext) -> Result<Box<dyn TransformStep>> + Send + Sync + 'static,
{
    Arc::new(factory)
}

struct CustomStep {
    output_ext: String,
    factory: StepFactory,
}

/// Owns backend handles and builds steps by kind or agent name.
pub struct AgentRegistry {
    search_index: Option<Arc<dyn SearchIndex>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    graph_store: Option<Arc<dyn GraphStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    vision: Option<Arc<dyn VisionModel>>,
    search_batch_size: usize,
    vector_batch_size: usize,
    custom: HashMap<String, CustomStep>,
}

impl AgentRegistry {
    /// A registry without backends. Content-only steps build; backend steps
    /// fail construction until a backend is attached.
    pub fn new() -> Self {
        Self {
            search_index: None,
            vector_store: None,
            graph_store: None,
            embedder: None,
            vision: None,
            search_batch_size: DEFAULT_BATCH_SIZE,
            vector_batch_size: DEFAULT_BATCH_SIZE,
            custom: HashMap::new(),
        }
    }

    /// Wire every backend from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new()
            .with_search_index(Arc::new(ElasticsearchIndex::from_config(&config.search_index)?))
            .with_vector_store(Arc::new(QdrantStore::from_config(&config.vector_store)?))
            .with_graph_store(Arc::new(Neo4jGraphStore::from_config(&config.graph_store)?))
            .with_embedder(Arc::new(HashingEmbedder::new(config.vector_store.dimensions)?))
            .with_vision(Arc::new(BridgeVisionModel::new(config.bridge.clone())))
            .with_batch_sizes(config.search_index.batch_size, config.vector_store.batch_size))
    }

    pub fn with_search_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.search_index = Some(index);
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn with_graph_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.graph_store = Some(store);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_batch_sizes(mut self, search: usize, vector: usize) -> Self {
        self.search_batch_size = search;
        self.vector_batch_size = vector;
        self
    }

    /// Register a scripted step under `name`. Built-in names are reserved.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        output_ext: impl Into<String>,
        factory: StepFactory,
    ) -> Result<()> {
        let name = name.into();
        let output_ext = output_ext.into();
        if StepKind::parse(&name).is_some() || self.custom.contains_key(&name) {
            return Err(TdpFlowError::construction(name, "agent name already registered"));
        }
        if output_ext.trim().is_empty() {
            return Err(TdpFlowError::construction(name, "output extension not provided"));
        }
        self.custom.insert(name, CustomStep { output_ext, factory });
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        StepKind::parse(name).is_some() || self.custom.contains_key(name)
    }

    /// Output extension of the step registered as `name`.
    pub fn output_ext(&self, name: &str) -> Option<String> {
        match StepKind::parse(name) {
            Some(kind) => Some(kind.output_ext().to_string()),
            None => self.custom.get(name).map(|c| c.output_ext.clone()),
        }
    }

    /// Build a step by agent name, built-in or registered.
    pub fn build_named(
        &self,
        name: &str,
        step_num: u32,
        ctx: &BuildContext,
    ) -> Result<Box<dyn TransformStep>> {
        if let Some(kind) = StepKind::parse(name) {
            return self.build(kind, step_num, ctx);
        }
        match self.custom.get(name) {
            Some(custom) => (custom.factory)(step_num, ctx),
            None => Err(TdpFlowError::construction(name, "unknown agent")),
        }
    }

    /// Build a built-in step.
    pub fn build(
        &self,
        kind: StepKind,
        step_num: u32,
        ctx: &BuildContext,
    ) -> Result<Box<dyn TransformStep>> {
        let collection = ctx.scenario.collection_name();
        let step: Box<dyn TransformStep> = match kind {
            StepKind::ImageDocument => Box::new(
                ImageDocumentAgent::new(step_num, require(kind, &self.vision, "vision model")?)?
                    .with_instructions(ctx.special_instructions.clone()),
            ),
            StepKind::TextChunk => Box::new(TextChunkAgent::new(step_num)?),
            StepKind::SectionChunk => Box::new(SectionChunkAgent::new(step_num)?),
            StepKind::PageChunk => Box::new(
                PageChunkAgent::new(step_num)?
                    .with_window(DEFAULT_PAGES_PER_CHUNK, Some(TOC_SCAN_CHUNKS)),
            ),
            StepKind::TableOfContentsExtraction => {
                Box::new(TableOfContentsExtractionAgent::new(step_num)?)
            }
            StepKind::SectionChunkWithTableOfContents => {
                let payload = ctx.configuration.as_deref().ok_or_else(|| {
                    TdpFlowError::construction(kind.name(), "requires a table of contents payload")
                })?;
                Box::new(SectionChunkWithTableOfContentsAgent::from_configuration(
                    step_num, payload,
                )?)
            }
            StepKind::SectionToRequirements => Box::new(SectionToRequirementsAgent::new(step_num)?),
            StepKind::ExcelToJson => Box::new(ExcelToJsonAgent::new(step_num)?),
            StepKind::JsonToSysml => Box::new(JsonToSysmlAgent::new(step_num)?),
            StepKind::Visio => Box::new(VisioAgent::new(step_num)?),
            StepKind::VisioJsonToSysml => Box::new(VisioJsonToSysmlAgent::new(step_num)?),
            StepKind::SysmlChunk => Box::new(SysmlChunkAgent::new(step_num)?),
            StepKind::SearchIndex => Box::new(
                SearchIndexAgent::new(
                    step_num,
                    require(kind, &self.search_index, "search index")?,
                    collection,
                )?
                .with_batch_size(self.search_batch_size),
            ),
            StepKind::VectorStore => Box::new(
                VectorStoreAgent::new(
                    step_num,
                    require(kind, &self.vector_store, "vector store")?,
                    require(kind, &self.embedder, "embedder")?,
                    collection,
                )?
                .with_batch_size(self.vector_batch_size),
            ),
            StepKind::GraphStore => Box::new(
                GraphStoreAgent::new(
                    step_num,
                    require(kind, &self.graph_store, "graph store")?,
                    collection,
                )?
                .with_batch_size(self.search_batch_size),
            ),
        };
        Ok(step)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn require<T: ?Sized>(kind: StepKind, handle: &Option<Arc<T>>, what: &str) -> Result<Arc<T>> {
    handle
        .clone()
        .ok_or_else(|| TdpFlowError::construction(kind.name(), format!("no {what} configured")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::EchoVision;
    use crate::index::tests::RecordingBackend;
    use crate::step::StepHeader;
    use async_trait::async_trait;

    fn ctx() -> BuildContext {
        BuildContext::new(ScenarioId::new("Scenario-A").unwrap())
    }

    fn full_registry() -> AgentRegistry {
        let backend = Arc::new(RecordingBackend::default());
        AgentRegistry::new()
            .with_search_index(backend.clone())
            .with_vector_store(backend.clone())
            .with_graph_store(backend)
            .with_embedder(Arc::new(HashingEmbedder::new(8).unwrap()))
            .with_vision(Arc::new(EchoVision::default()))
    }

    #[test]
    fn names_are_unique_and_parse_back() {
        for kind in StepKind::ALL {
            assert_eq!(StepKind::parse(kind.name()), Some(kind));
            assert!(!kind.output_ext().is_empty());
        }
        assert_eq!(StepKind::parse("NoSuchAgent"), None);
        assert_eq!(StepKind::SearchIndex.output_ext(), "index");
        assert_eq!(StepKind::JsonToSysml.to_string(), "JsonToSysmlAgent");
    }

    #[test]
    fn builds_every_kind_with_backends() {
        let registry = full_registry();
        let ctx = ctx().with_configuration(Some(br#"{"toc": []}"#.to_vec()));
        for (i, kind) in StepKind::ALL.into_iter().enumerate() {
            let step = registry.build(kind, i as u32 + 1, &ctx).unwrap();
            assert_eq!(step.name(), kind.name());
            assert_eq!(step.output_ext(), kind.output_ext());
            assert_eq!(step.step_num(), i as u32 + 1);
        }
    }

    #[test]
    fn missing_backend_fails_construction() {
        let registry = AgentRegistry::new();
        let err = registry.build(StepKind::SearchIndex, 1, &ctx()).err().unwrap();
        assert!(err.is_construction());
        assert!(err.to_string().contains("no search index configured"));

        let err = registry
            .build(StepKind::SectionChunkWithTableOfContents, 3, &ctx())
            .err()
            .unwrap();
        assert!(err.is_construction());
    }

    #[test]
    fn unreadable_toc_payload_is_content_error() {
        let registry = AgentRegistry::new();
        let ctx = ctx().with_configuration(Some(b"not json".to_vec()));
        let err = registry
            .build(StepKind::SectionChunkWithTableOfContents, 3, &ctx)
            .err()
            .unwrap();
        assert!(matches!(err, TdpFlowError::Content { .. }));
    }

    struct Upper {
        header: StepHeader,
    }

    #[async_trait]
    impl TransformStep for Upper {
        fn header(&self) -> &StepHeader {
            &self.header
        }

        async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
            Ok(content.to_ascii_uppercase())
        }
    }

    #[tokio::test]
    async fn custom_steps_register_and_build_by_name() {
        let mut registry = AgentRegistry::new();
        registry
            .register(
                "UpperAgent",
                "txt",
                step_factory(|n, _ctx| {
                    Ok(Box::new(Upper {
                        header: StepHeader::new("UpperAgent", n, "txt")?,
                    }))
                }),
            )
            .unwrap();

        assert!(registry.is_registered("UpperAgent"));
        assert_eq!(registry.output_ext("UpperAgent").as_deref(), Some("txt"));
        assert_eq!(registry.output_ext("TextChunkAgent").as_deref(), Some("json"));

        let step = registry.build_named("UpperAgent", 2, &ctx()).unwrap();
        assert_eq!(step.process_content(b"abc").await.unwrap(), b"ABC");

        let dup = registry.register(
            "TextChunkAgent",
            "json",
            step_factory(|n, _ctx| Ok(Box::new(TextChunkAgent::new(n)?))),
        );
        assert!(dup.unwrap_err().is_construction());
        assert!(registry.build_named("Nope", 1, &ctx()).err().unwrap().is_construction());
    }
}
