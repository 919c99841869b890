//! Neo4j graph store over the transactional HTTP API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tdpflow_shared::{GraphStoreConfig, Result, TdpFlowError, secret_from_env};
use url::Url;

use super::{GraphEdge, GraphNode, GraphStore, base_url, build_client, check_status, endpoint};

const BACKEND: &str = "neo4j";

const MERGE_NODES: &str = "UNWIND $nodes AS n \
    MERGE (e:Element {collection: $collection, id: n.id}) \
    SET e.name = n.name, e.kind = n.kind, e.package = n.package, e.text = n.text";

const MERGE_EDGES: &str = "UNWIND $edges AS r \
    MATCH (a:Element {collection: $collection, id: r.from}) \
    MATCH (b:Element {collection: $collection, id: r.to}) \
    MERGE (a)-[rel:RELATES {kind: r.kind}]->(b) \
    SET rel.label = r.label";

pub struct Neo4jGraphStore {
    client: Client,
    base: Url,
    database: String,
    user: String,
    password: Option<String>,
}

impl Neo4jGraphStore {
    pub fn new(url: &str, database: &str, user: &str, password: Option<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(BACKEND)?,
            base: base_url(BACKEND, url)?,
            database: database.to_string(),
            user: user.to_string(),
            password,
        })
    }

    pub fn from_config(config: &GraphStoreConfig) -> Result<Self> {
        Self::new(
            &config.url,
            &config.database,
            &config.user,
            secret_from_env(&config.password_env),
        )
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn merge(&self, collection: &str, nodes: &[GraphNode], edges: &[GraphEdge]) -> Result<()> {
        let mut statements = Vec::new();
        if !nodes.is_empty() {
            statements.push(json!({
                "statement": MERGE_NODES,
                "parameters": {"collection": collection, "nodes": nodes},
            }));
        }
        if !edges.is_empty() {
            statements.push(json!({
                "statement": MERGE_EDGES,
                "parameters": {"collection": collection, "edges": edges},
            }));
        }
        if statements.is_empty() {
            return Ok(());
        }

        let url = endpoint(BACKEND, &self.base, &format!("db/{}/tx/commit", self.database))?;
        let mut request = self
            .client
            .post(url)
            .json(&json!({ "statements": statements }));
        if let Some(password) = &self.password {
            request = request.basic_auth(&self.user, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| TdpFlowError::backend(BACKEND, e.to_string()))?;
        let reply: Value = check_status(BACKEND, response)
            .await?
            .json()
            .await
            .map_err(|e| TdpFlowError::backend(BACKEND, format!("unreadable response: {e}")))?;

        if let Some(error) = reply["errors"].as_array().and_then(|errors| errors.first()) {
            return Err(TdpFlowError::backend(
                BACKEND,
                format!(
                    "{}: {}",
                    error["code"].as_str().unwrap_or("unknown"),
                    error["message"].as_str().unwrap_or_default()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node(id: &str) -> GraphNode {
        GraphNode {
            id: id.into(),
            name: id.into(),
            kind: "part def".into(),
            package: "Car".into(),
            text: String::new(),
        }
    }

    #[tokio::test]
    async fn merges_nodes_and_edges_in_one_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .and(header_exists("Authorization"))
            .and(body_string_contains("MERGE (e:Element"))
            .and(body_string_contains("RELATES"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": [], "errors": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = Neo4jGraphStore::new(&server.uri(), "neo4j", "neo4j", Some("pw".into())).unwrap();
        let edge = GraphEdge {
            from: "Car".into(),
            to: "Car::Engine".into(),
            kind: "contains".into(),
            label: None,
        };
        store
            .merge("scenario-a", &[node("Car::Engine")], &[edge])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cypher_errors_are_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "errors": [{"code": "Neo.ClientError.Statement.SyntaxError", "message": "bad"}]
            })))
            .mount(&server)
            .await;

        let store = Neo4jGraphStore::new(&server.uri(), "neo4j", "neo4j", None).unwrap();
        let err = store.merge("s", &[node("A")], &[]).await.unwrap_err();
        assert!(err.to_string().contains("SyntaxError"));
    }

    #[tokio::test]
    async fn empty_merge_sends_nothing() {
        let store = Neo4jGraphStore::new("http://127.0.0.1:1", "neo4j", "neo4j", None).unwrap();
        store.merge("s", &[], &[]).await.unwrap();
    }
}
