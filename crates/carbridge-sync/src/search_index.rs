//! Search index client over the Elasticsearch document API
//!
//! Implements the SearchIndex strategy with one request per operation:
//! `DELETE /{index}/_doc/{id}` and `POST /{index}/_doc/{id}`.

use async_trait::async_trait;
use carbridge_core::prelude::*;
use carbridge_core::SearchIndexConfig;
use reqwest::{Client, Method, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};
use url::Url;

/// Longest error body excerpt carried into logs
const MAX_ERROR_BODY: usize = 512;

/// HTTP search index client
pub struct HttpSearchIndex {
    client: Client,
    base_url: Url,
    config: SearchIndexConfig,
    running: AtomicBool,
}

impl HttpSearchIndex {
    pub fn new(config: SearchIndexConfig) -> Result<Self> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| SyncError::config("index.url is not set"))?;
        let base_url = Url::parse(raw)
            .map_err(|e| SyncError::config(format!("invalid index url {}: {}", raw, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::config(format!("index url {} cannot be a base", raw)));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::index_with_source("Failed to create client", e))?;

        Ok(Self {
            client,
            base_url,
            config,
            running: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> &str {
        &self.config.index
    }

    /// `{base}/{index}/_doc/{id}` with the identifier encoded as one segment
    ///
    /// `.` and `..` would be resolved away as dot-segments and hit the
    /// collection endpoint, so they are refused.
    fn doc_url(&self, id: &str) -> Result<Url> {
        if id == "." || id == ".." {
            return Err(SyncError::malformed(format!(
                "fzg_id {:?} cannot address a document",
                id
            )));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::config("index url cannot be a base"))?
            .pop_if_empty()
            .extend([self.config.index.as_str(), "_doc", id]);
        Ok(url)
    }

    /// Build request with authentication
    fn build_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("ApiKey {}", api_key));
        } else if let (Some(ref user), Some(ref pass)) =
            (&self.config.username, &self.config.password)
        {
            req = req.basic_auth(user, Some(pass));
        }

        req
    }

    async fn error_body(resp: reqwest::Response) -> String {
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        body
    }
}

#[async_trait]
impl Lifecycle for HttpSearchIndex {
    async fn start(&self) -> Result<()> {
        self.health_check().await?;
        self.running.store(true, Ordering::SeqCst);
        debug!(url = %self.base_url, index = %self.config.index, "Search index reachable");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for HttpSearchIndex {
    async fn health_check(&self) -> Result<()> {
        let resp = self
            .build_request(Method::GET, self.base_url.clone())
            .send()
            .await
            .map_err(|e| SyncError::index_with_source("Health check failed", e))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::index_status(
                format!("Health check returned {}", resp.status()),
                resp.status().as_u16(),
            ))
        }
    }

    fn component_name(&self) -> &'static str {
        "search_index"
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn delete_by_id(&self, id: &str) -> Result<DeleteOutcome> {
        let url = self.doc_url(id)?;
        trace!(%url, "Deleting document");

        let resp = self
            .build_request(Method::DELETE, url)
            .send()
            .await
            .map_err(|e| SyncError::index_with_source("Delete request failed", e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(DeleteOutcome::Deleted);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }

        let body = Self::error_body(resp).await;
        warn!(fzg_id = %id, status = status.as_u16(), body = %body, "Delete rejected");
        Err(SyncError::index_status(
            format!("Delete returned {}", status),
            status.as_u16(),
        ))
    }

    async fn create_with_id(&self, id: &str, document: &SearchDocument) -> Result<()> {
        let url = self.doc_url(id)?;
        trace!(%url, fields = document.len(), "Creating document");

        let resp = self
            .build_request(Method::POST, url)
            .json(document)
            .send()
            .await
            .map_err(|e| SyncError::index_with_source("Create request failed", e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = Self::error_body(resp).await;
        warn!(fzg_id = %id, status = status.as_u16(), body = %body, "Create rejected");
        Err(SyncError::index_status(
            format!("Create returned {}", status),
            status.as_u16(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn index_for(server: &MockServer) -> HttpSearchIndex {
        HttpSearchIndex::new(SearchIndexConfig {
            url: Some(server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    fn document(value: serde_json::Value) -> SearchDocument {
        CanonicalRecord::from_value(value).unwrap().project()
    }

    #[tokio::test]
    async fn test_delete_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/cars/_doc/X1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "deleted"})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/cars/_doc/X2"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"result": "not_found"})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/cars/_doc/X3"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let index = index_for(&server);
        assert_eq!(index.delete_by_id("X1").await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(index.delete_by_id("X2").await.unwrap(), DeleteOutcome::NotFound);

        let err = index.delete_by_id("X3").await.unwrap_err();
        assert!(matches!(err, SyncError::SearchIndex { status: Some(503), .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_create_posts_projection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cars/_doc/X1"))
            .and(body_json(json!({"fzg_id": "X1", "color": "red"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"result": "created"})))
            .expect(1)
            .mount(&server)
            .await;

        let index = index_for(&server);
        let doc = document(json!({"_id": "abc", "__v": 0, "fzg_id": "X1", "color": "red"}));
        index.create_with_id("X1", &doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_failure_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("mapper_parsing_exception"))
            .mount(&server)
            .await;

        let index = index_for(&server);
        let err = index
            .create_with_id("X1", &document(json!({"fzg_id": "X1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SearchIndex { status: Some(400), .. }));
    }

    #[tokio::test]
    async fn test_identifier_is_encoded_as_single_segment() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/cars/_doc/a%2Fb"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let index = index_for(&server);
        assert_eq!(index.delete_by_id("a/b").await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_dot_segment_identifiers_never_reach_the_collection() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let index = index_for(&server);
        let doc = document(json!({"fzg_id": "..", "color": "red"}));
        for id in [".", ".."] {
            let err = index.delete_by_id(id).await.unwrap_err();
            assert!(matches!(err, SyncError::MalformedEvent { .. }));
            let err = index.create_with_id(id, &doc).await.unwrap_err();
            assert!(matches!(err, SyncError::MalformedEvent { .. }));
        }
    }

    #[tokio::test]
    async fn test_dotted_identifier_keeps_its_segment() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/cars/_doc/a.b"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let index = index_for(&server);
        assert_eq!(index.delete_by_id("a.b").await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("Authorization", "ApiKey secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let index = HttpSearchIndex::new(SearchIndexConfig {
            url: Some(server.uri()),
            api_key: Some("secret".to_string()),
            ..Default::default()
        })
        .unwrap();
        index.start().await.unwrap();
        assert!(index.is_running());
    }

    #[test]
    fn test_new_requires_url() {
        let err = HttpSearchIndex::new(SearchIndexConfig::default()).err().unwrap();
        assert!(matches!(err, SyncError::Configuration { .. }));
    }
}
