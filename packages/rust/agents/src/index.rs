//! Steps that push records into the search, vector and graph backends.
//!
//! Each step writes a [`Manifest`] as its output. Records that cannot be
//! prepared or are rejected individually become manifest failures; a
//! transport failure aborts the step.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tdpflow_shared::{Result, TdpFlowError};
use tracing::info;

use crate::sinks::{
    Embedder, GraphEdge, GraphNode, GraphStore, IndexDocument, Manifest, SearchIndex, VectorPoint,
    VectorStore, extract_records, point_id, record_key,
};
use crate::step::{AgentType, StepHeader, TransformStep, to_json, utf8};
use crate::sysml::parse_sysml;

/// Records per backend request.
pub const DEFAULT_BATCH_SIZE: usize = 50;

fn batch_size_or_default(batch_size: usize) -> usize {
    if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    }
}

// ---------------------------------------------------------------------------
// SearchIndexAgent
// ---------------------------------------------------------------------------

pub struct SearchIndexAgent {
    header: StepHeader,
    index: Arc<dyn SearchIndex>,
    collection: String,
    batch_size: usize,
}

impl AgentType for SearchIndexAgent {
    const NAME: &'static str = "SearchIndexAgent";
    const OUTPUT_EXT: &'static str = "index";
}

impl SearchIndexAgent {
    pub fn new(step_num: u32, index: Arc<dyn SearchIndex>, collection: impl Into<String>) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
            index,
            collection: collection.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size_or_default(batch_size);
        self
    }
}

#[async_trait]
impl TransformStep for SearchIndexAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let records = extract_records(content)?;
        let mut manifest = Manifest::new(self.index.backend(), &self.collection, records.len());

        let mut docs = Vec::with_capacity(records.len());
        for record in records {
            if record.text.trim().is_empty() {
                manifest.fail(&record.id, "record has no text");
                continue;
            }
            docs.push(IndexDocument {
                key: record_key(&self.collection, &record.id),
                record_id: record.id,
                title: record.title,
                text: record.text,
                source: self.header.name().to_string(),
            });
        }

        self.index.ensure_collection(&self.collection).await?;
        for batch in docs.chunks(self.batch_size) {
            let failures = self.index.upsert(&self.collection, batch).await?;
            manifest.stored += batch.len() - failures.len();
            for failure in failures {
                manifest.fail(failure.record, failure.error);
            }
        }

        info!(
            collection = %self.collection,
            stored = manifest.stored,
            failed = manifest.failures.len(),
            "records indexed"
        );
        to_json(&manifest)
    }
}

// ---------------------------------------------------------------------------
// VectorStoreAgent
// ---------------------------------------------------------------------------

pub struct VectorStoreAgent {
    header: StepHeader,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    collection: String,
    batch_size: usize,
}

impl AgentType for VectorStoreAgent {
    const NAME: &'static str = "VectorStoreAgent";
    const OUTPUT_EXT: &'static str = "vector";
}

impl VectorStoreAgent {
    pub fn new(
        step_num: u32,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        collection: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
            store,
            embedder,
            collection: collection.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size_or_default(batch_size);
        self
    }
}

#[async_trait]
impl TransformStep for VectorStoreAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let records = extract_records(content)?;
        let mut manifest = Manifest::new(self.store.backend(), &self.collection, records.len());

        let mut points = Vec::with_capacity(records.len());
        for record in records {
            if record.text.trim().is_empty() {
                manifest.fail(&record.id, "record has no text");
                continue;
            }
            let vector = match self.embedder.embed(&record.text).await {
                Ok(vector) => vector,
                Err(e) => {
                    manifest.fail(&record.id, format!("embedding failed: {e}"));
                    continue;
                }
            };
            let mut payload = Map::new();
            payload.insert("record_id".into(), Value::String(record.id.clone()));
            if let Some(title) = record.title {
                payload.insert("title".into(), Value::String(title));
            }
            payload.insert("text".into(), Value::String(record.text));
            points.push(VectorPoint {
                id: point_id(&self.collection, &record.id),
                vector,
                payload,
            });
        }

        self.store
            .ensure_collection(&self.collection, self.embedder.dimensions())
            .await?;
        for batch in points.chunks(self.batch_size) {
            self.store.upsert(&self.collection, batch).await?;
            manifest.stored += batch.len();
        }

        info!(
            collection = %self.collection,
            stored = manifest.stored,
            failed = manifest.failures.len(),
            "records embedded"
        );
        to_json(&manifest)
    }
}

// ---------------------------------------------------------------------------
// GraphStoreAgent
// ---------------------------------------------------------------------------

/// Merges a SysML model into the graph store: one node per package and
/// definition, `contains` edges from packages, `connects` edges between parts.
pub struct GraphStoreAgent {
    header: StepHeader,
    store: Arc<dyn GraphStore>,
    collection: String,
    batch_size: usize,
}

impl AgentType for GraphStoreAgent {
    const NAME: &'static str = "GraphStoreAgent";
    const OUTPUT_EXT: &'static str = "graph";
}

impl GraphStoreAgent {
    pub fn new(step_num: u32, store: Arc<dyn GraphStore>, collection: impl Into<String>) -> Result<Self> {
        Ok(Self {
            header: StepHeader::of::<Self>(step_num)?,
            store,
            collection: collection.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size_or_default(batch_size);
        self
    }
}

#[async_trait]
impl TransformStep for GraphStoreAgent {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    async fn process_content(&self, content: &[u8]) -> Result<Vec<u8>> {
        let model = parse_sysml(utf8(content)?)
            .map_err(|e| TdpFlowError::content(format!("graph input must be SysML: {e}")))?;

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut unresolved = Vec::new();

        for package in &model.packages {
            nodes.push(GraphNode {
                id: package.name.clone(),
                name: package.name.clone(),
                kind: "package".into(),
                package: package.name.clone(),
                text: String::new(),
            });
            let mut known = HashSet::new();
            for def in &package.definitions {
                let id = format!("{}::{}", package.name, def.name);
                known.insert(def.name.as_str());
                nodes.push(GraphNode {
                    id: id.clone(),
                    name: def.name.clone(),
                    kind: def.kind.clone(),
                    package: package.name.clone(),
                    text: def.text.clone(),
                });
                edges.push(GraphEdge {
                    from: package.name.clone(),
                    to: id,
                    kind: "contains".into(),
                    label: None,
                });
            }
            for connection in &package.connections {
                let record = format!("{}::{} -> {}", package.name, connection.from, connection.to);
                match (
                    known.contains(connection.from.as_str()),
                    known.contains(connection.to.as_str()),
                ) {
                    (true, true) => edges.push(GraphEdge {
                        from: format!("{}::{}", package.name, connection.from),
                        to: format!("{}::{}", package.name, connection.to),
                        kind: "connects".into(),
                        label: connection.label.clone(),
                    }),
                    _ => unresolved.push(record),
                }
            }
        }

        let mut manifest = Manifest::new(
            self.store.backend(),
            &self.collection,
            nodes.len() + edges.len() + unresolved.len(),
        );
        for record in unresolved {
            manifest.fail(record, "connection endpoint is not a definition in its package");
        }

        for batch in nodes.chunks(self.batch_size) {
            self.store.merge(&self.collection, batch, &[]).await?;
            manifest.stored += batch.len();
        }
        for batch in edges.chunks(self.batch_size) {
            self.store.merge(&self.collection, &[], batch).await?;
            manifest.stored += batch.len();
        }

        info!(
            collection = %self.collection,
            nodes = nodes.len(),
            edges = edges.len(),
            "graph merged"
        );
        to_json(&manifest)
    }
}
