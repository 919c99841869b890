//! Storage-backend contracts and the record/manifest plumbing shared by the
//! index, vector and graph steps.

pub mod elastic;
pub mod neo4j;
pub mod qdrant;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tdpflow_shared::{Result, TdpFlowError};

use crate::step::utf8;
use crate::sysml::parse_sysml;

pub use elastic::ElasticsearchIndex;
pub use neo4j::Neo4jGraphStore;
pub use qdrant::QdrantStore;

const USER_AGENT: &str = concat!("tdpflow/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One unit of text headed for a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
}

/// Pull records out of a step payload.
///
/// JSON payloads must be an array; each item contributes its `text` (string
/// or list of strings, falling back to `chunk`). Non-JSON text is read as
/// SysML definitions when it parses, otherwise as blank-line paragraphs.
/// Records without text are kept so the caller can report them.
pub fn extract_records(content: &[u8]) -> Result<Vec<Record>> {
    if let Ok(value) = serde_json::from_slice::<Value>(content) {
        let Value::Array(items) = value else {
            return Err(TdpFlowError::content("expected a JSON array of records"));
        };
        return Ok(items
            .iter()
            .enumerate()
            .map(|(i, item)| json_record(i, item))
            .collect());
    }

    let text = utf8(content)?;
    if let Ok(model) = parse_sysml(text) {
        return Ok(model
            .packages
            .iter()
            .flat_map(|p| {
                p.definitions.iter().map(move |d| Record {
                    id: format!("{}::{}", p.name, d.name),
                    title: Some(d.name.clone()),
                    text: d.text.clone(),
                })
            })
            .collect());
    }

    Ok(text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(i, p)| Record {
            id: format!("paragraph-{}", i + 1),
            title: None,
            text: p.to_string(),
        })
        .collect())
}

fn json_record(position: usize, item: &Value) -> Record {
    let text_of = |v: Option<&Value>| -> Option<String> {
        match v? {
            Value::String(s) => Some(s.clone()),
            Value::Array(parts) => Some(
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    };

    match item {
        Value::String(s) => Record {
            id: position.to_string(),
            title: None,
            text: s.clone(),
        },
        Value::Object(map) => {
            let id = match map.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => position.to_string(),
            };
            Record {
                id,
                title: map.get("title").and_then(Value::as_str).map(String::from),
                text: text_of(map.get("text"))
                    .or_else(|| text_of(map.get("chunk")))
                    .unwrap_or_default(),
            }
        }
        _ => Record {
            id: position.to_string(),
            title: None,
            text: String::new(),
        },
    }
}

/// Stable hex key for a record within a collection.
pub fn record_key(collection: &str, record_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update(b"/");
    hasher.update(record_id.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record: String,
    pub error: String,
}

/// Output of a storage-backend step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub backend: String,
    pub collection: String,
    pub total: usize,
    pub stored: usize,
    pub failures: Vec<RecordFailure>,
}

impl Manifest {
    pub fn new(backend: impl Into<String>, collection: impl Into<String>, total: usize) -> Self {
        Self {
            backend: backend.into(),
            collection: collection.into(),
            total,
            stored: 0,
            failures: Vec::new(),
        }
    }

    pub fn fail(&mut self, record: impl Into<String>, error: impl Into<String>) {
        let failure = RecordFailure {
            record: record.into(),
            error: error.into(),
        };
        tracing::warn!(
            backend = %self.backend,
            record = %failure.record,
            error = %failure.error,
            "record not stored"
        );
        self.failures.push(failure);
    }
}

// ---------------------------------------------------------------------------
// Backend contracts
// ---------------------------------------------------------------------------

/// Document pushed to a search index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    pub key: String,
    pub record_id: String,
    pub title: Option<String>,
    pub text: String,
    pub source: String,
}

/// Point pushed to a vector store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub package: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: String,
    pub label: Option<String>,
}

/// Full-text search backend. Upserts are keyed by [`IndexDocument::key`].
#[async_trait]
pub trait SearchIndex: Send + Sync {
    fn backend(&self) -> &str;

    async fn ensure_collection(&self, collection: &str) -> Result<()>;

    /// Returns per-document failures; transport failures are `Err`.
    async fn upsert(&self, collection: &str, docs: &[IndexDocument]) -> Result<Vec<RecordFailure>>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn backend(&self) -> &str;

    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<()>;

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<()>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    fn backend(&self) -> &str;

    async fn merge(&self, collection: &str, nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<()>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// HashingEmbedder
// ---------------------------------------------------------------------------

/// Feature-hashing bag-of-words embedder, L2 normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(TdpFlowError::construction(
                "HashingEmbedder",
                "dimensions must be positive",
            ));
        }
        Ok(Self { dimensions })
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) % self.dimensions as u64;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket as usize] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            return Err(TdpFlowError::content("nothing to embed"));
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

/// Numeric point id for stores that only accept integers or UUIDs.
pub fn point_id(collection: &str, record_id: &str) -> u64 {
    let digest = Sha256::digest(format!("{collection}/{record_id}").as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

pub(crate) fn build_client(backend: &str) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| TdpFlowError::backend(backend, format!("failed to build HTTP client: {e}")))
}

pub(crate) fn base_url(backend: &str, url: &str) -> Result<url::Url> {
    let mut parsed = url::Url::parse(url)
        .map_err(|e| TdpFlowError::construction(backend, format!("invalid url '{url}': {e}")))?;
    if !parsed.path().ends_with('/') {
        let path = format!("{}/", parsed.path());
        parsed.set_path(&path);
    }
    Ok(parsed)
}

pub(crate) fn endpoint(backend: &str, base: &url::Url, path: &str) -> Result<url::Url> {
    base.join(path)
        .map_err(|e| TdpFlowError::backend(backend, format!("invalid endpoint '{path}': {e}")))
}

/// Map a non-success response to a backend error carrying a body excerpt.
pub(crate) async fn check_status(backend: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(TdpFlowError::backend(
        backend,
        format!("{url}: HTTP {status}: {excerpt}"),
    ))
}
