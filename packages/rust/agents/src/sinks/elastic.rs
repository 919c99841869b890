//! Elasticsearch search index over the REST bulk API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tdpflow_shared::{Result, SearchIndexConfig, TdpFlowError, secret_from_env};
use tracing::debug;
use url::Url;

use super::{IndexDocument, RecordFailure, SearchIndex, base_url, build_client, check_status, endpoint};

const BACKEND: &str = "elasticsearch";

pub struct ElasticsearchIndex {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl ElasticsearchIndex {
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(BACKEND)?,
            base: base_url(BACKEND, url)?,
            api_key,
        })
    }

    pub fn from_config(config: &SearchIndexConfig) -> Result<Self> {
        Self::new(&config.url, secret_from_env(&config.api_key_env))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("ApiKey {key}")),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| TdpFlowError::backend(BACKEND, e.to_string()))
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let url = endpoint(BACKEND, &self.base, collection)?;
        let response = self.send(self.client.head(url.clone())).await?;
        match response.status() {
            status if status.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            _ => {
                check_status(BACKEND, response).await?;
            }
        }

        debug!(index = collection, "creating search index");
        let mappings = json!({
            "mappings": {
                "properties": {
                    "record_id": {"type": "keyword"},
                    "source": {"type": "keyword"},
                    "title": {"type": "text"},
                    "text": {"type": "text"}
                }
            }
        });
        let response = self.send(self.client.put(url).json(&mappings)).await?;
        check_status(BACKEND, response).await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, docs: &[IndexDocument]) -> Result<Vec<RecordFailure>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = String::new();
        for doc in docs {
            let action = json!({"index": {"_index": collection, "_id": doc.key}});
            let source = json!({
                "record_id": doc.record_id,
                "title": doc.title,
                "text": doc.text,
                "source": doc.source,
            });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&source.to_string());
            body.push('\n');
        }

        let url = endpoint(BACKEND, &self.base, "_bulk")?;
        let response = self
            .send(
                self.client
                    .post(url)
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        let response = check_status(BACKEND, response).await?;
        let reply: Value = response
            .json()
            .await
            .map_err(|e| TdpFlowError::backend(BACKEND, format!("unreadable bulk response: {e}")))?;

        if !reply["errors"].as_bool().unwrap_or(false) {
            return Ok(Vec::new());
        }

        let items = reply["items"].as_array().cloned().unwrap_or_default();
        let failures = items
            .iter()
            .zip(docs)
            .filter_map(|(item, doc)| {
                let error = &item["index"]["error"];
                if error.is_null() {
                    return None;
                }
                let reason = error["reason"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| error.to_string());
                Some(RecordFailure {
                    record: doc.record_id.clone(),
                    error: reason,
                })
            })
            .collect();
        Ok(failures)
    }
}
