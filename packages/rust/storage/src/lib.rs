//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding document records
//! and their raw content, and implements [`PersistenceService`] on top of it.
//!
//! **Access rules:**
//! - Pipeline runs: read-write via [`Storage::open`]
//! - Status inspection: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use tdpflow_shared::{Document, DocumentKind, PersistenceService, Result, ScenarioId, TdpFlowError};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    path: PathBuf,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TdpFlowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            path: path.to_path_buf(),
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TdpFlowError::Storage(format!(
                "database {} does not exist",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            path: path.to_path_buf(),
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        TdpFlowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TdpFlowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    async fn read_content(
        &self,
        scenario: &ScenarioId,
        kind: DocumentKind,
        file_name: &str,
    ) -> Result<Vec<u8>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content FROM contents
                 WHERE scenario_id = ?1 AND kind = ?2 AND file_name = ?3",
                params![scenario.as_str(), kind.as_str(), file_name],
            )
            .await
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<Vec<u8>>(0)
                .map_err(|e| TdpFlowError::Storage(e.to_string())),
            Ok(None) => Err(TdpFlowError::not_found(scenario.as_str(), kind, file_name)),
            Err(e) => Err(TdpFlowError::Storage(e.to_string())),
        }
    }

    /// Upsert the record and, when given, the content of a document.
    async fn upsert_document(
        &self,
        scenario: &ScenarioId,
        kind: DocumentKind,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()> {
        self.check_writable()?;
        let record_json =
            serde_json::to_string(doc).map_err(|e| TdpFlowError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO documents (scenario_id, kind, file_name, record_json, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(scenario_id, kind, file_name) DO UPDATE SET
                   record_json = excluded.record_json,
                   status = excluded.status,
                   updated_at = excluded.updated_at",
                params![
                    scenario.as_str(),
                    kind.as_str(),
                    doc.file_name(),
                    record_json,
                    doc.status().as_str(),
                    now
                ],
            )
            .await
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        if let Some(bytes) = content {
            self.conn
                .execute(
                    "INSERT INTO contents (scenario_id, kind, file_name, content)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(scenario_id, kind, file_name) DO UPDATE SET
                       content = excluded.content",
                    params![scenario.as_str(), kind.as_str(), doc.file_name(), bytes.to_vec()],
                )
                .await
                .map_err(|e| TdpFlowError::Storage(e.to_string()))?;
        }

        tracing::debug!(
            scenario = %scenario,
            kind = %kind,
            file_name = doc.file_name(),
            status = %doc.status(),
            with_content = content.is_some(),
            "document written"
        );
        Ok(())
    }

    async fn get_document(
        &self,
        scenario: &ScenarioId,
        kind: DocumentKind,
        file_name: &str,
    ) -> Result<Document> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM documents
                 WHERE scenario_id = ?1 AND kind = ?2 AND file_name = ?3",
                params![scenario.as_str(), kind.as_str(), file_name],
            )
            .await
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_document(&row),
            Ok(None) => Err(TdpFlowError::not_found(scenario.as_str(), kind, file_name)),
            Err(e) => Err(TdpFlowError::Storage(e.to_string())),
        }
    }

    /// Distinct scenario ids with at least one document, sorted.
    pub async fn list_scenarios(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT scenario_id FROM documents ORDER BY scenario_id",
                params![],
            )
            .await
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(
                row.get::<String>(0)
                    .map_err(|e| TdpFlowError::Storage(e.to_string()))?,
            );
        }
        Ok(results)
    }
}

#[async_trait]
impl PersistenceService for Storage {
    async fn read_source(&self, scenario: &ScenarioId, file_name: &str) -> Result<Vec<u8>> {
        self.read_content(scenario, DocumentKind::Source, file_name)
            .await
    }

    async fn read_derivative(&self, scenario: &ScenarioId, file_name: &str) -> Result<Vec<u8>> {
        self.read_content(scenario, DocumentKind::Derivative, file_name)
            .await
    }

    async fn write_source(
        &self,
        scenario: &ScenarioId,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()> {
        self.upsert_document(scenario, DocumentKind::Source, doc, content)
            .await
    }

    async fn write_derivative(
        &self,
        scenario: &ScenarioId,
        doc: &Document,
        content: Option<&[u8]>,
    ) -> Result<()> {
        self.upsert_document(scenario, DocumentKind::Derivative, doc, content)
            .await
    }

    async fn get_source_ref(&self, scenario: &ScenarioId, file_name: &str) -> Result<Document> {
        self.get_document(scenario, DocumentKind::Source, file_name)
            .await
    }

    async fn get_derivative_ref(
        &self,
        scenario: &ScenarioId,
        file_name: &str,
    ) -> Result<Document> {
        self.get_document(scenario, DocumentKind::Derivative, file_name)
            .await
    }

    async fn list_documents(&self, scenario: &ScenarioId) -> Result<Vec<Document>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM documents
                 WHERE scenario_id = ?1
                 ORDER BY CASE kind WHEN 'source' THEN 0 ELSE 1 END, file_name",
                params![scenario.as_str()],
            )
            .await
            .map_err(|e| TdpFlowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_document(&row)?);
        }
        Ok(results)
    }

    fn locate(&self, scenario: &ScenarioId, kind: DocumentKind, file_name: &str) -> String {
        format!(
            "libsql://{}#{scenario}/{kind}/{file_name}",
            self.path.display()
        )
    }
}

/// Convert a `record_json` row to a [`Document`].
fn row_to_document(row: &libsql::Row) -> Result<Document> {
    let json: String = row
        .get(0)
        .map_err(|e| TdpFlowError::Storage(e.to_string()))?;
    serde_json::from_str(&json).map_err(|e| TdpFlowError::Storage(format!("invalid record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdpflow_shared::Status;
    use uuid::Uuid;

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("tdp_test_{}.db", Uuid::now_v7()))
    }

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        Storage::open(&temp_db()).await.expect("open test db")
    }

    fn scenario() -> ScenarioId {
        ScenarioId::new("Program-A").unwrap()
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_db();
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn content_roundtrip_is_byte_identical() {
        let storage = test_storage().await;
        let doc = Document::source("drawing.bin", "binary drawing");
        let content: Vec<u8> = (0..=255u8).collect();

        storage
            .write_source(&scenario(), &doc, Some(&content))
            .await
            .expect("write");
        let read = storage
            .read_source(&scenario(), "drawing.bin")
            .await
            .expect("read");
        assert_eq!(read, content);
    }

    #[tokio::test]
    async fn record_roundtrip_preserves_lifecycle_fields() {
        let storage = test_storage().await;
        let mut source = Document::source("a.txt", "source");
        source
            .write(&storage, &scenario(), Some(b"hello"))
            .await
            .unwrap();

        let mut derived = Document::derivative("a_1.json", &source, "TextChunkAgent");
        derived
            .set_processed(&storage, &scenario(), Some(b"[]"))
            .await
            .unwrap();

        let stored = storage
            .get_derivative_ref(&scenario(), "a_1.json")
            .await
            .unwrap();
        assert_eq!(stored.status(), Status::Processed);
        assert_eq!(stored.agent_name(), Some("TextChunkAgent"));
        assert!(stored.storage_url.starts_with("libsql://"));

        let source = storage.get_source_ref(&scenario(), "a.txt").await.unwrap();
        assert_eq!(source.status(), Status::Transformed);
        assert_eq!(source.consuming_derivative_names(), ["a_1.json"]);
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let storage = test_storage().await;
        let err = storage
            .read_derivative(&scenario(), "ghost.json")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = storage
            .get_source_ref(&scenario(), "ghost.txt")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn record_write_keeps_existing_content() {
        let storage = test_storage().await;
        let mut doc = Document::source("a.txt", "");
        storage
            .write_source(&scenario(), &doc, Some(b"v1"))
            .await
            .unwrap();
        doc.description = "second".into();
        storage
            .write_source(&scenario(), &doc, None)
            .await
            .unwrap();

        assert_eq!(
            storage.read_source(&scenario(), "a.txt").await.unwrap(),
            b"v1"
        );
        let stored = storage.get_source_ref(&scenario(), "a.txt").await.unwrap();
        assert_eq!(stored.description, "second");
    }

    #[tokio::test]
    async fn list_documents_orders_sources_first() {
        let storage = test_storage().await;
        let source = Document::source("z.txt", "");
        storage
            .write_source(&scenario(), &source, None)
            .await
            .unwrap();
        storage
            .write_derivative(
                &scenario(),
                &Document::derivative("a_1.json", &source, "TextChunkAgent"),
                None,
            )
            .await
            .unwrap();
        storage
            .write_source(
                &ScenarioId::new("other").unwrap(),
                &Document::source("b.txt", ""),
                None,
            )
            .await
            .unwrap();

        let docs = storage.list_documents(&scenario()).await.unwrap();
        let names: Vec<&str> = docs.iter().map(Document::file_name).collect();
        assert_eq!(names, vec!["z.txt", "a_1.json"]);

        let scenarios = storage.list_scenarios().await.unwrap();
        assert_eq!(scenarios, vec!["Program-A", "other"]);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = temp_db();
        let rw = Storage::open(&tmp).await.unwrap();
        rw.write_source(&scenario(), &Document::source("a.txt", ""), Some(b"x"))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.read_source(&scenario(), "a.txt").await.unwrap(), b"x");
        let result = ro
            .write_source(&scenario(), &Document::source("b.txt", ""), None)
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_database() {
        assert!(Storage::open_readonly(&temp_db()).await.is_err());
    }
}
