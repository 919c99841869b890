//! Persistence contract for document records and their content.
//!
//! The pipeline never reaches for a global store: every operation that needs
//! persistence takes a [`PersistenceService`] handle. Implementations must
//! serialize concurrent writes to the same document; callers assume at most
//! one writer per document name per scenario.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::document::Document;
use crate::error::{Result, TdpFlowError};
use crate::types::{DocumentKind, ScenarioId};

/// Read/write contract for source (TDP) and derivative documents.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Read the raw content of a source document.
    async fn read_source(&self, scenario: &ScenarioId, file_name: &str) -> Result<Vec<u8>>;

    /// Read the raw content of a derivative document.
    async fn read_derivative(&self, scenario: &ScenarioId, file_name: &str) -> Result<Vec<u8>>;

    /// Upsert a source document record, replacing its content when given.
    async fn write_source(
        &self,
        scenario: &ScenarioId,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()>;

    /// Upsert a derivative document record, replacing its content when given.
    async fn write_derivative(
        &self,
        scenario: &ScenarioId,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()>;

    /// Load the stored record of a source document.
    async fn get_source_ref(&self, scenario: &ScenarioId, file_name: &str) -> Result<Document>;

    /// Load the stored record of a derivative document.
    async fn get_derivative_ref(&self, scenario: &ScenarioId, file_name: &str)
    -> Result<Document>;

    /// All document records of a scenario, sources first, then by name.
    async fn list_documents(&self, scenario: &ScenarioId) -> Result<Vec<Document>>;

    /// Storage URL under which a document's content is kept.
    fn locate(&self, scenario: &ScenarioId, kind: DocumentKind, file_name: &str) -> String;

    /// Read content from the namespace matching `kind`.
    async fn read(
        &self,
        scenario: &ScenarioId,
        kind: DocumentKind,
        file_name: &str,
    ) -> Result<Vec<u8>> {
        match kind {
            DocumentKind::Source => self.read_source(scenario, file_name).await,
            DocumentKind::Derivative => self.read_derivative(scenario, file_name).await,
        }
    }

    /// Resolve a name to a stored record, trying sources before derivatives.
    async fn resolve_ref(&self, scenario: &ScenarioId, file_name: &str) -> Result<Document> {
        match self.get_source_ref(scenario, file_name).await {
            Err(e) if e.is_not_found() => self.get_derivative_ref(scenario, file_name).await,
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

type Key = (String, DocumentKind, String);

#[derive(Debug, Clone)]
struct Entry {
    record: Document,
    content: Option<Vec<u8>>,
}

/// Mutex-guarded in-memory store. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scenario: &ScenarioId, kind: DocumentKind, file_name: &str) -> Key {
        (scenario.as_str().to_string(), kind, file_name.to_string())
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<Key, Entry>) -> T) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| TdpFlowError::Storage("memory store lock poisoned".into()))?;
        Ok(f(&mut guard))
    }

    fn read_kind(
        &self,
        scenario: &ScenarioId,
        kind: DocumentKind,
        file_name: &str,
    ) -> Result<Vec<u8>> {
        let key = Self::key(scenario, kind, file_name);
        self.with_entries(|entries| entries.get(&key).and_then(|e| e.content.clone()))?
            .ok_or_else(|| TdpFlowError::not_found(scenario.as_str(), kind, file_name))
    }

    fn write_kind(
        &self,
        scenario: &ScenarioId,
        kind: DocumentKind,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()> {
        let key = Self::key(scenario, kind, doc.file_name());
        self.with_entries(|entries| {
            let previous = entries.remove(&key).and_then(|e| e.content);
            entries.insert(
                key,
                Entry {
                    record: doc.clone(),
                    content: content.map(<[u8]>::to_vec).or(previous),
                },
            );
        })
    }

    fn get_kind(
        &self,
        scenario: &ScenarioId,
        kind: DocumentKind,
        file_name: &str,
    ) -> Result<Document> {
        let key = Self::key(scenario, kind, file_name);
        self.with_entries(|entries| entries.get(&key).map(|e| e.record.clone()))?
            .ok_or_else(|| TdpFlowError::not_found(scenario.as_str(), kind, file_name))
    }
}

#[async_trait]
impl PersistenceService for MemoryStore {
    async fn read_source(&self, scenario: &ScenarioId, file_name: &str) -> Result<Vec<u8>> {
        self.read_kind(scenario, DocumentKind::Source, file_name)
    }

    async fn read_derivative(&self, scenario: &ScenarioId, file_name: &str) -> Result<Vec<u8>> {
        self.read_kind(scenario, DocumentKind::Derivative, file_name)
    }

    async fn write_source(
        &self,
        scenario: &ScenarioId,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()> {
        self.write_kind(scenario, DocumentKind::Source, doc, content)
    }

    async fn write_derivative(
        &self,
        scenario: &ScenarioId,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()> {
        self.write_kind(scenario, DocumentKind::Derivative, doc, content)
    }

    async fn get_source_ref(&self, scenario: &ScenarioId, file_name: &str) -> Result<Document> {
        self.get_kind(scenario, DocumentKind::Source, file_name)
    }

    async fn get_derivative_ref(
        &self,
        scenario: &ScenarioId,
        file_name: &str,
    ) -> Result<Document> {
        self.get_kind(scenario, DocumentKind::Derivative, file_name)
    }

    async fn list_documents(&self, scenario: &ScenarioId) -> Result<Vec<Document>> {
        let mut docs: Vec<(DocumentKind, Document)> = self.with_entries(|entries| {
            entries
                .iter()
                .filter(|((s, _, _), _)| s == scenario.as_str())
                .map(|((_, kind, _), entry)| (*kind, entry.record.clone()))
                .collect()
        })?;
        docs.sort_by(|(ka, a), (kb, b)| {
            let derived_a = *ka == DocumentKind::Derivative;
            let derived_b = *kb == DocumentKind::Derivative;
            (derived_a, a.file_name()).cmp(&(derived_b, b.file_name()))
        });
        Ok(docs.into_iter().map(|(_, doc)| doc).collect())
    }

    fn locate(&self, scenario: &ScenarioId, kind: DocumentKind, file_name: &str) -> String {
        format!("memory://{scenario}/{kind}/{file_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> ScenarioId {
        ScenarioId::new("s1").unwrap()
    }

    #[tokio::test]
    async fn write_then_read_is_byte_identical() {
        let store = MemoryStore::new();
        let doc = Document::source("spec.txt", "a spec");
        let content = b"\x00\x01binary\xffpayload".to_vec();

        store
            .write_source(&scenario(), &doc, Some(&content))
            .await
            .expect("write");
        let read = store.read_source(&scenario(), "spec.txt").await.expect("read");
        assert_eq!(read, content);
    }

    #[tokio::test]
    async fn missing_documents_are_not_found() {
        let store = MemoryStore::new();
        let err = store.read_derivative(&scenario(), "nope.json").await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.get_source_ref(&scenario(), "nope.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn record_write_keeps_existing_content() {
        let store = MemoryStore::new();
        let mut doc = Document::source("a.txt", "");
        store
            .write_source(&scenario(), &doc, Some(b"hello"))
            .await
            .unwrap();
        doc.description = "updated".into();
        store.write_source(&scenario(), &doc, None).await.unwrap();

        assert_eq!(store.read_source(&scenario(), "a.txt").await.unwrap(), b"hello");
        let stored = store.get_source_ref(&scenario(), "a.txt").await.unwrap();
        assert_eq!(stored.description, "updated");
    }

    #[tokio::test]
    async fn kinds_are_separate_namespaces() {
        let store = MemoryStore::new();
        let doc = Document::source("same.json", "");
        store
            .write_derivative(&scenario(), &doc, Some(b"derived"))
            .await
            .unwrap();
        assert!(store.read_source(&scenario(), "same.json").await.is_err());
        assert_eq!(
            store
                .read(&scenario(), DocumentKind::Derivative, "same.json")
                .await
                .unwrap(),
            b"derived"
        );
    }

    #[tokio::test]
    async fn resolve_ref_falls_back_to_derivatives() {
        let store = MemoryStore::new();
        let doc = Document::source("x_1.json", "");
        store.write_derivative(&scenario(), &doc, None).await.unwrap();
        let found = store.resolve_ref(&scenario(), "x_1.json").await.unwrap();
        assert_eq!(found.file_name(), "x_1.json");
        assert!(store.resolve_ref(&scenario(), "y.json").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_documents_scoped_to_scenario() {
        let store = MemoryStore::new();
        let other = ScenarioId::new("s2").unwrap();
        store
            .write_source(&scenario(), &Document::source("b.txt", ""), None)
            .await
            .unwrap();
        store
            .write_derivative(&scenario(), &Document::source("a_1.json", ""), None)
            .await
            .unwrap();
        store
            .write_source(&other, &Document::source("c.txt", ""), None)
            .await
            .unwrap();

        let docs = store.list_documents(&scenario()).await.unwrap();
        let names: Vec<&str> = docs.iter().map(Document::file_name).collect();
        assert_eq!(names, vec!["b.txt", "a_1.json"]);
    }
}
