//! SQL migration definitions for the tdpflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: documents, contents",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Document records, one namespace per kind (source / derivative)
CREATE TABLE IF NOT EXISTS documents (
    scenario_id TEXT NOT NULL,
    kind        TEXT NOT NULL,
    file_name   TEXT NOT NULL,
    record_json TEXT NOT NULL,
    status      TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (scenario_id, kind, file_name)
);

CREATE INDEX IF NOT EXISTS idx_documents_scenario ON documents(scenario_id);

-- Raw document content
CREATE TABLE IF NOT EXISTS contents (
    scenario_id TEXT NOT NULL,
    kind        TEXT NOT NULL,
    file_name   TEXT NOT NULL,
    content     BLOB NOT NULL,
    PRIMARY KEY (scenario_id, kind, file_name)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index documents by status",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(scenario_id, status);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
