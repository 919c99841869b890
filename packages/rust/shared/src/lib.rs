//! Shared types, error model, document lifecycle and configuration for tdpflow.
//!
//! This crate is the foundation depended on by all other tdpflow crates.
//! It provides:
//! - [`TdpFlowError`]: the unified error type
//! - Domain types ([`Status`], [`LoadingMethod`], [`DocumentKind`], [`ScenarioId`])
//! - The [`Document`] record and its persisted status transitions
//! - The [`PersistenceService`] contract and the in-memory [`MemoryStore`]
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod document;
pub mod error;
pub mod persistence;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AssessmentConfig, BridgeConfig, DefaultsConfig, GraphStoreConfig,
    SearchIndexConfig, StorageConfig, VectorStoreConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, secret_from_env,
};
pub use document::{Derivation, Document, Origin, UNKNOWN_SIZE_KB};
pub use error::{Result, TdpFlowError};
pub use persistence::{MemoryStore, PersistenceService};
pub use types::{DocumentKind, LoadingMethod, Scenario, ScenarioId, Status};
