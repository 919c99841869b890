//! Qdrant vector store over its REST API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tdpflow_shared::{Result, TdpFlowError, VectorStoreConfig, secret_from_env};
use tracing::debug;
use url::Url;

use super::{VectorPoint, VectorStore, base_url, build_client, check_status, endpoint};

const BACKEND: &str = "qdrant";

pub struct QdrantStore {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl QdrantStore {
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(BACKEND)?,
            base: base_url(BACKEND, url)?,
            api_key,
        })
    }

    pub fn from_config(config: &VectorStoreConfig) -> Result<Self> {
        Self::new(&config.url, secret_from_env(&config.api_key_env))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let request = match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| TdpFlowError::backend(BACKEND, e.to_string()))?;
        let response = check_status(BACKEND, response).await?;
        response
            .json()
            .await
            .map_err(|e| TdpFlowError::backend(BACKEND, format!("unreadable response: {e}")))
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<()> {
        let exists_url = endpoint(BACKEND, &self.base, &format!("collections/{collection}/exists"))?;
        let reply = self.send(self.client.get(exists_url)).await?;
        if reply["result"]["exists"].as_bool().unwrap_or(false) {
            return Ok(());
        }

        debug!(collection, dimensions, "creating vector collection");
        let url = endpoint(BACKEND, &self.base, &format!("collections/{collection}"))?;
        let body = json!({"vectors": {"size": dimensions, "distance": "Cosine"}});
        self.send(self.client.put(url).json(&body)).await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut url = endpoint(BACKEND, &self.base, &format!("collections/{collection}/points"))?;
        url.set_query(Some("wait=true"));
        let reply = self
            .send(self.client.put(url).json(&json!({ "points": points })))
            .await?;

        match reply["status"].as_str() {
            Some("ok") | None => Ok(()),
            Some(other) => Err(TdpFlowError::backend(
                BACKEND,
                format!("upsert returned status {other}"),
            )),
        }
    }
}
