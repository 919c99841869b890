//! Core domain types for tdpflow scenarios and documents.

use serde::{Deserialize, Serialize};

use crate::error::TdpFlowError;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Processing status shared by source and derivative documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Unknown,
    Queued,
    Processing,
    Processed,
    Error,
    Transformed,
    InContext,
    InKnowledgebase,
    RequiresTransformation,
    Mocked,
}

impl Status {
    /// Every status, in declaration order.
    pub const ALL: [Status; 10] = [
        Status::Unknown,
        Status::Queued,
        Status::Processing,
        Status::Processed,
        Status::Error,
        Status::Transformed,
        Status::InContext,
        Status::InKnowledgebase,
        Status::RequiresTransformation,
        Status::Mocked,
    ];

    /// Whether a document in this status can be consumed downstream as-is.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            Status::Transformed
                | Status::InContext
                | Status::InKnowledgebase
                | Status::RequiresTransformation
                | Status::Processed
        )
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Queued => "QUEUED",
            Status::Processing => "PROCESSING",
            Status::Processed => "PROCESSED",
            Status::Error => "ERROR",
            Status::Transformed => "TRANSFORMED",
            Status::InContext => "IN_CONTEXT",
            Status::InKnowledgebase => "IN_KNOWLEDGEBASE",
            Status::RequiresTransformation => "REQUIRES_TRANSFORMATION",
            Status::Mocked => "MOCKED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = TdpFlowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TdpFlowError::validation(format!("unknown status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// LoadingMethod
// ---------------------------------------------------------------------------

/// How a document is made available to downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadingMethod {
    #[default]
    Undecided,
    InContext,
    Knowledgebase,
    Transform,
    /// Superseded by a derivative; consumers should read the derivative instead.
    Obsolete,
}

// ---------------------------------------------------------------------------
// DocumentKind
// ---------------------------------------------------------------------------

/// Which persistence namespace a document lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// An ingested TDP file.
    Source,
    /// The output of a transform step.
    Derivative,
}

impl DocumentKind {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Source => "source",
            DocumentKind::Derivative => "derivative",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// Identifier of a processing scenario (unit of work).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(String);

impl ScenarioId {
    /// Create a scenario id, rejecting blank identifiers.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TdpFlowError::validation("scenario id must not be empty"));
        }
        Ok(Self(id))
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Collection/index name used by the storage backends for this scenario.
    pub fn collection_name(&self) -> String {
        self.0.to_lowercase()
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = TdpFlowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Process-wide context identifying a unit of work.
///
/// Read-only from the pipeline's point of view; its document list is reached
/// through [`crate::PersistenceService::list_documents`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    #[serde(default)]
    pub description: String,
}

impl Scenario {
    pub fn new(id: ScenarioId) -> Self {
        Self {
            id,
            description: String::new(),
        }
    }
}
