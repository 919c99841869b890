//! Transform steps ("agents") for tdpflow.
//!
//! This crate provides:
//! - [`step`]: the [`TransformStep`] contract and output naming
//! - content steps: chunking, TOC extraction, requirements, spreadsheets,
//!   Visio diagrams, SysML conversion and image transcription
//! - [`index`]: steps writing to the search, vector and graph backends in [`sinks`]
//! - [`bridge`]: the subprocess vision model
//! - [`AgentRegistry`]: builds steps by kind or agent name

pub mod bridge;
pub mod chunk;
pub mod excel;
pub mod image;
pub mod index;
pub mod registry;
pub mod requirements;
pub mod sinks;
pub mod step;
pub mod sysml;
pub mod toc;
pub mod visio;

pub use bridge::BridgeVisionModel;
pub use chunk::{
    Chunk, PageChunkAgent, SectionChunkAgent, SectionChunkWithTableOfContentsAgent,
    TextChunkAgent, parse_chunks,
};
pub use excel::{ExcelToJsonAgent, Sheet, Workbook};
pub use image::{ImageDocumentAgent, VisionModel, sniff_image};
pub use index::{GraphStoreAgent, SearchIndexAgent, VectorStoreAgent};
pub use registry::{AgentRegistry, BuildContext, StepFactory, StepKind, step_factory};
pub use requirements::{Priority, Requirement, SectionToRequirementsAgent};
pub use sinks::{
    ElasticsearchIndex, Embedder, GraphStore, HashingEmbedder, Manifest, Neo4jGraphStore,
    QdrantStore, Record, RecordFailure, SearchIndex, VectorStore,
};
pub use step::{AgentType, StepHeader, TransformStep, compute_output_filename, step_num_of};
pub use sysml::{JsonToSysmlAgent, SysmlChunkAgent, SysmlModel, VisioJsonToSysmlAgent, parse_sysml};
pub use toc::{TableOfContentsExtractionAgent, TocEntry, TocPayload};
pub use visio::{Diagram, DiagramEdge, DiagramPage, DiagramShape, VisioAgent};
