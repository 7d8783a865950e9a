use std::time::Duration;

use async_trait::async_trait;
use docsync_core::{DocumentId, RemoteStore, StoreError, Value};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};

/// REST client for the shared document store.
///
/// Layout of the remote API:
/// ```text
/// {base}/documents/{doc}                     DELETE  remove document
/// {base}/documents/{doc}/keys                GET     list keys
/// {base}/documents/{doc}/values              DELETE  clear values
/// {base}/documents/{doc}/values/{key}        GET PUT DELETE
/// {base}/documents/{doc}/sets/{set}          GET DELETE
/// {base}/documents/{doc}/sets/{set}/{tag}    GET PUT DELETE
/// ```
///
/// Transport failures and gateway errors (502/503/504) are reported as
/// [`StoreError::Connectivity`].
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    http_client: HttpClient,
    base_url: String,
    api_token: Option<String>,
}

impl HttpRemoteStore {
    /// Create a new client for the store at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn document_url(&self, doc: &DocumentId) -> String {
        format!(
            "{}/documents/{}",
            self.base_url,
            urlencoding::encode(doc.as_str())
        )
    }

    fn value_url(&self, doc: &DocumentId, key: &str) -> String {
        format!("{}/values/{}", self.document_url(doc), urlencoding::encode(key))
    }

    fn set_url(&self, doc: &DocumentId, set: &str) -> String {
        format!("{}/sets/{}", self.document_url(doc), urlencoding::encode(set))
    }

    fn tag_url(&self, doc: &DocumentId, set: &str, tag: &str) -> String {
        format!("{}/{}", self.set_url(doc, set), urlencoding::encode(tag))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http_client.request(method, url);
        match &self.api_token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, op: &str) -> Result<Response, StoreError> {
        builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                StoreError::Connectivity(format!("{} request failed: {}", op, e))
            } else {
                StoreError::Internal(format!("{} request failed: {}", op, e))
            }
        })
    }

    async fn status_error(op: &str, response: Response) -> StoreError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let message = format!("{} failed with status {}: {}", op, status, text);
        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                StoreError::Connectivity(message)
            }
            _ => StoreError::Internal(message),
        }
    }

    /// Send a request expecting no body back. Returns false on 404.
    async fn execute(&self, builder: RequestBuilder, op: &str) -> Result<bool, StoreError> {
        let response = self.send(builder, op).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(Self::status_error(op, response).await);
        }
        Ok(true)
    }

    /// Send a request expecting a JSON body back. Returns `None` on 404.
    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        op: &str,
    ) -> Result<Option<T>, StoreError> {
        let response = self.send(builder, op).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::status_error(op, response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Connectivity(format!("Failed to read {} response: {}", op, e)))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("Invalid {} response: {}", op, e)))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn backend_name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, doc: &DocumentId, key: &str) -> Result<Option<Value>, StoreError> {
        let url = self.value_url(doc, key);
        let value = self.fetch(self.request(Method::GET, &url), "GET value").await?;
        debug!("GET {}/{} (found: {})", doc, key, value.is_some());
        Ok(value)
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set(&self, doc: &DocumentId, key: &str, value: &Value) -> Result<(), StoreError> {
        let url = self.value_url(doc, key);
        let builder = self.request(Method::PUT, &url).json(value);
        if !self.execute(builder, "PUT value").await? {
            return Err(StoreError::NotFound(format!("PUT {} returned 404", url)));
        }
        debug!("PUT {}/{}", doc, key);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, doc: &DocumentId, key: &str) -> Result<bool, StoreError> {
        let url = self.value_url(doc, key);
        self.execute(self.request(Method::DELETE, &url), "DELETE value")
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn keys(&self, doc: &DocumentId) -> Result<Vec<String>, StoreError> {
        let url = format!("{}/keys", self.document_url(doc));
        let keys: Option<Vec<String>> = self.fetch(self.request(Method::GET, &url), "GET keys").await?;
        Ok(keys.unwrap_or_default())
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear(&self, doc: &DocumentId) -> Result<(), StoreError> {
        let url = format!("{}/values", self.document_url(doc));
        self.execute(self.request(Method::DELETE, &url), "DELETE values")
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove_document(&self, doc: &DocumentId) -> Result<bool, StoreError> {
        let url = self.document_url(doc);
        let existed = self
            .execute(self.request(Method::DELETE, &url), "DELETE document")
            .await?;
        debug!("DELETE document {} (existed: {})", doc, existed);
        Ok(existed)
    }

    #[instrument(skip(self), level = "debug")]
    async fn add_tag(&self, doc: &DocumentId, set: &str, tag: &str) -> Result<(), StoreError> {
        let url = self.tag_url(doc, set, tag);
        if !self.execute(self.request(Method::PUT, &url), "PUT tag").await? {
            return Err(StoreError::NotFound(format!("PUT {} returned 404", url)));
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove_tag(
        &self,
        doc: &DocumentId,
        set: &str,
        tag: &str,
    ) -> Result<(), StoreError> {
        let url = self.tag_url(doc, set, tag);
        self.execute(self.request(Method::DELETE, &url), "DELETE tag")
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn has_tag(&self, doc: &DocumentId, set: &str, tag: &str) -> Result<bool, StoreError> {
        let url = self.tag_url(doc, set, tag);
        self.execute(self.request(Method::GET, &url), "GET tag").await
    }

    #[instrument(skip(self), level = "debug")]
    async fn tags(&self, doc: &DocumentId, set: &str) -> Result<Vec<String>, StoreError> {
        let url = self.set_url(doc, set);
        let tags: Option<Vec<String>> = self.fetch(self.request(Method::GET, &url), "GET set").await?;
        Ok(tags.unwrap_or_default())
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear_tags(&self, doc: &DocumentId, set: &str) -> Result<(), StoreError> {
        let url = self.set_url(doc, set);
        self.execute(self.request(Method::DELETE, &url), "DELETE set")
            .await?;
        Ok(())
    }
}
