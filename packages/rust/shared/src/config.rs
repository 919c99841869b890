//! Application configuration for tdpflow.
//!
//! User config lives at `~/.tdpflow/tdpflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TdpFlowError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tdpflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tdpflow";

// ---------------------------------------------------------------------------
// Config structs (matching tdpflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub search_index: SearchIndexConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub graph_store: GraphStoreConfig,

    /// Model bridge subprocess used by vision steps.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Consumability policy applied by `Document::assess`.
    #[serde(default)]
    pub assessment: AssessmentConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the database and other working files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Agent group used by `run` when none is given.
    #[serde(default = "default_group")]
    pub default_group: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            default_group: default_group(),
        }
    }
}

fn default_data_dir() -> String {
    "~/tdpflow-data".into()
}
fn default_group() -> String {
    "section-chunk".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file name, relative to `data_dir`.
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
        }
    }
}

fn default_db_file() -> String {
    "tdpflow.db".into()
}

/// `[search_index]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIndexConfig {
    #[serde(default = "default_search_url")]
    pub url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_search_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SearchIndexConfig {
    fn default() -> Self {
        Self {
            url: default_search_url(),
            api_key_env: default_search_api_key_env(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_search_url() -> String {
    "http://localhost:9200".into()
}
fn default_search_api_key_env() -> String {
    "TDPFLOW_SEARCH_API_KEY".into()
}
fn default_batch_size() -> usize {
    50
}

/// `[vector_store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_url")]
    pub url: String,

    #[serde(default = "default_vector_api_key_env")]
    pub api_key_env: String,

    /// Embedding dimension of the collection.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: default_vector_url(),
            api_key_env: default_vector_api_key_env(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_vector_url() -> String {
    "http://localhost:6333".into()
}
fn default_vector_api_key_env() -> String {
    "TDPFLOW_VECTOR_API_KEY".into()
}
fn default_dimensions() -> usize {
    300
}

/// `[graph_store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStoreConfig {
    #[serde(default = "default_graph_url")]
    pub url: String,

    #[serde(default = "default_graph_database")]
    pub database: String,

    #[serde(default = "default_graph_user")]
    pub user: String,

    #[serde(default = "default_graph_password_env")]
    pub password_env: String,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            url: default_graph_url(),
            database: default_graph_database(),
            user: default_graph_user(),
            password_env: default_graph_password_env(),
        }
    }
}

fn default_graph_url() -> String {
    "http://localhost:7474".into()
}
fn default_graph_database() -> String {
    "neo4j".into()
}
fn default_graph_user() -> String {
    "neo4j".into()
}
fn default_graph_password_env() -> String {
    "TDPFLOW_GRAPH_PASSWORD".into()
}

/// `[bridge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Runtime used to launch the bridge script.
    #[serde(default = "default_bridge_cmd")]
    pub cmd: String,

    /// Path to the bridge entry script.
    #[serde(default = "default_bridge_script")]
    pub script: String,

    /// Working directory for the bridge process. Empty means inherit.
    #[serde(default)]
    pub working_dir: String,

    /// Model identifier passed to the bridge with every task.
    #[serde(default = "default_bridge_model")]
    pub model: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cmd: default_bridge_cmd(),
            script: default_bridge_script(),
            working_dir: String::new(),
            model: default_bridge_model(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "bridge/vision.ts".into()
}
fn default_bridge_model() -> String {
    "gpt-4o".into()
}

/// `[assessment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentConfig {
    /// Largest document, in KB, that may be loaded into context directly.
    #[serde(default = "default_max_in_context_kb")]
    pub max_in_context_kb: f64,

    /// Lower-case extensions that can be read without transformation.
    #[serde(default = "default_in_context_extensions")]
    pub in_context_extensions: Vec<String>,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self {
            max_in_context_kb: default_max_in_context_kb(),
            in_context_extensions: default_in_context_extensions(),
        }
    }
}

fn default_max_in_context_kb() -> f64 {
    256.0
}
fn default_in_context_extensions() -> Vec<String> {
    ["txt", "md", "json", "csv", "sysml"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl AppConfig {
    /// Data directory with a leading `~` expanded.
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.defaults.data_dir)
    }

    /// Full path of the libSQL database file.
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.storage.db_file))
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| TdpFlowError::config("could not determine home directory"))?;
            Ok(home.join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read a secret from the env var named by a config entry.
///
/// Returns `None` when the variable is unset or empty; backends then connect
/// without credentials.
pub fn secret_from_env(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tdpflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| TdpFlowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tdpflow/tdpflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TdpFlowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TdpFlowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TdpFlowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| TdpFlowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TdpFlowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
