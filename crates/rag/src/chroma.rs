//! ChromaDB REST client.
//!
//! Implements the consumed vector-store contract: collection listing, counts
//! and nearest-neighbour queries with `query_embeddings`, `n_results`,
//! `where` and `include`. The outer list dimension of query responses is 1
//! per call. Distance→similarity normalization belongs to the retriever, not
//! this client.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use lagrum_core::{CollectionQuery, Error, RawHit, Result, VectorSearch};

/// Chroma client configuration.
#[derive(Debug, Clone)]
pub struct ChromaConfig {
    /// REST endpoint.
    pub url: String,
    /// Request timeout; per-collection search timeouts are enforced above
    /// this client by the retriever.
    pub timeout: Duration,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self { url: "http://127.0.0.1:8000".to_string(), timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CollectionInfo {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query_embeddings: Vec<&'a [f32]>,
    n_results: usize,
    #[serde(skip_serializing_if = "Option::is_none", rename = "where")]
    where_filter: Option<&'a Value>,
    include: [&'static str; 3],
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<HashMap<String, Value>>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Deserialize)]
struct CountResponse(usize);

/// ChromaDB REST client with a collection name→id cache.
pub struct ChromaClient {
    client: Client,
    config: ChromaConfig,
    collection_ids: RwLock<HashMap<String, String>>,
}

impl ChromaClient {
    pub fn new(config: ChromaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Retrieval(e.to_string()))?;
        Ok(Self { client, config, collection_ids: RwLock::new(HashMap::new()) })
    }

    fn base(&self) -> String {
        format!("{}/api/v1", self.config.url.trim_end_matches('/'))
    }

    async fn fetch_collections(&self) -> Result<Vec<CollectionInfo>> {
        let response = self
            .client
            .get(format!("{}/collections", self.base()))
            .send()
            .await
            .map_err(|e| Error::Retrieval(format!("list_collections failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Retrieval(format!("list_collections returned {status}")));
        }

        response
            .json::<Vec<CollectionInfo>>()
            .await
            .map_err(|e| Error::Retrieval(format!("Invalid collections response: {e}")))
    }

    /// Resolve a collection name to its id, refreshing the cache on miss.
    async fn collection_id(&self, name: &str) -> Result<String> {
        if let Some(id) = self.collection_ids.read().get(name) {
            return Ok(id.clone());
        }

        let collections = self.fetch_collections().await?;
        {
            let mut cache = self.collection_ids.write();
            for coll in &collections {
                cache.insert(coll.name.clone(), coll.id.clone());
            }
        }

        self.collection_ids
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Collection not found: {name}")))
    }

    fn parse_hits(response: QueryResponse) -> Vec<RawHit> {
        let Some(ids) = response.ids.into_iter().next() else {
            return Vec::new();
        };
        let documents = response.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();
        let metadatas = response.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
        let distances = response.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();

        ids.into_iter()
            .enumerate()
            .map(|(i, id)| RawHit {
                id,
                document: documents.get(i).and_then(|d| d.clone()).unwrap_or_default(),
                metadata: metadatas.get(i).and_then(|m| m.clone()).unwrap_or_default(),
                distance: distances.get(i).copied().unwrap_or(1.0),
            })
            .collect()
    }
}

#[async_trait]
impl VectorSearch for ChromaClient {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.fetch_collections().await?;
        {
            let mut cache = self.collection_ids.write();
            for coll in &collections {
                cache.insert(coll.name.clone(), coll.id.clone());
            }
        }
        Ok(collections.into_iter().map(|c| c.name).collect())
    }

    async fn query(&self, query: &CollectionQuery) -> Result<Vec<RawHit>> {
        let id = self.collection_id(&query.collection).await?;

        let request = QueryRequest {
            query_embeddings: vec![query.embedding.as_slice()],
            n_results: query.n_results,
            where_filter: query.where_filter.as_ref(),
            include: ["metadatas", "documents", "distances"],
        };

        let response = self
            .client
            .post(format!("{}/collections/{}/query", self.base(), id))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Retrieval(format!("query {} failed: {e}", query.collection)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Retrieval(format!(
                "query {} returned {status}: {body}",
                query.collection
            )));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::Retrieval(format!("Invalid query response: {e}")))?;

        Ok(Self::parse_hits(parsed))
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let id = self.collection_id(collection).await?;
        let response = self
            .client
            .get(format!("{}/collections/{}/count", self.base(), id))
            .send()
            .await
            .map_err(|e| Error::Retrieval(format!("count {collection} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Retrieval(format!("count {collection} returned {status}")));
        }

        let parsed: CountResponse = response
            .json()
            .await
            .map_err(|e| Error::Retrieval(format!("Invalid count response: {e}")))?;
        Ok(parsed.0)
    }
}
