//! Sync API Client - HTTP communication with the structured backend
//!
//! Handles all REST calls of the structured sync protocol:
//! - Incremental pull from a cursor
//! - Batch push with per-row conditional upsert on the server
//! - Version polling
//! - Attachment upload/fetch/delete
//!
//! Every call carries the bearer token; the server rejects calls without it
//! before running any logic.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::{SyncError, SyncResult};
use super::models::SyncBatch;
use super::queue::AttachmentRemote;
use super::structured_adapter::StructuredRemote;

/// API client for a structured sync server
pub struct SyncApiClient {
    client: Client,
    base_url: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl SyncApiClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, SyncApiError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        url::Url::parse(&base_url).map_err(|e| SyncApiError::NetworkError(format!("invalid URL: {}", e)))?;

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    async fn bearer(&self) -> Result<String, SyncApiError> {
        self.get_token().await.ok_or(SyncApiError::Unauthorized)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Rows changed since `cursor`, all category groups, and the current version
    pub async fn pull(&self, cursor: i64) -> Result<PullResponse, SyncApiError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .post(self.url("sync/pull"))
            .bearer_auth(token)
            .json(&PullRequest { cursor })
            .send()
            .await?;

        handle_response(response).await
    }

    /// Send a batch; the server upserts each row if `updatedAt` is not older
    pub async fn push(&self, batch: &SyncBatch) -> Result<PushResponse, SyncApiError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .post(self.url("sync/push"))
            .bearer_auth(token)
            .json(batch)
            .send()
            .await?;

        handle_response(response).await
    }

    pub async fn version(&self) -> Result<VersionResponse, SyncApiError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .get(self.url("sync/version"))
            .bearer_auth(token)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Check that the server is reachable and accepts the token
    pub async fn test_connection(&self) -> Result<i64, SyncApiError> {
        Ok(self.version().await?.version)
    }

    pub async fn upload_attachment(&self, content_id: &str, blob: &[u8]) -> Result<UploadResponse, SyncApiError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .put(self.url(&format!("attachments/{}", urlencoding::encode(content_id))))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.as_ref())
            .body(blob.to_vec())
            .send()
            .await?;

        handle_response(response).await
    }

    /// Download a blob. Empty bodies and HTML error pages are rejected.
    pub async fn fetch_attachment(&self, content_id: &str) -> Result<Vec<u8>, SyncApiError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .get(self.url(&format!("attachments/{}", urlencoding::encode(content_id))))
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(handle_error(response).await);
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<mime::Mime>().ok())
            .is_some_and(|m| m.type_() == mime::TEXT && m.subtype() == mime::HTML);
        if is_html {
            return Err(SyncApiError::InvalidResponse(format!("{}: got an HTML page", content_id)));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(SyncApiError::InvalidResponse(format!("{}: empty body", content_id)));
        }

        Ok(bytes.to_vec())
    }

    /// Delete a blob; already-missing blobs are fine
    pub async fn delete_attachment(&self, content_id: &str) -> Result<(), SyncApiError> {
        let token = self.bearer().await?;

        let response = self
            .client
            .delete(self.url(&format!("attachments/{}", urlencoding::encode(content_id))))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

#[async_trait]
impl StructuredRemote for SyncApiClient {
    async fn pull(&self, cursor: i64) -> SyncResult<PullResponse> {
        Ok(SyncApiClient::pull(self, cursor).await?)
    }

    async fn push(&self, batch: &SyncBatch) -> SyncResult<PushResponse> {
        Ok(SyncApiClient::push(self, batch).await?)
    }

    async fn version(&self) -> SyncResult<i64> {
        Ok(SyncApiClient::version(self).await?.version)
    }
}

#[async_trait]
impl AttachmentRemote for SyncApiClient {
    async fn upload(&self, content_id: &str, blob: &[u8]) -> SyncResult<String> {
        Ok(self.upload_attachment(content_id, blob).await?.content_id)
    }

    async fn fetch(&self, content_id: &str) -> SyncResult<Vec<u8>> {
        self.fetch_attachment(content_id).await.map_err(SyncError::from)
    }

    async fn delete(&self, content_id: &str) -> SyncResult<()> {
        Ok(self.delete_attachment(content_id).await?)
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub cursor: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub version: i64,
    #[serde(flatten)]
    pub batch: SyncBatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub version: i64,
    /// Rows the server actually changed
    #[serde(default)]
    pub applied: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub content_id: String,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - token required")]
    Unauthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| SyncApiError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();
    let path = response.url().path().to_string();

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::FORBIDDEN => SyncApiError::InvalidCredentials,
        StatusCode::NOT_FOUND => SyncApiError::NotFound(path),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            SyncApiError::Conflict(error_message(response).await)
        }
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => SyncApiError::QuotaExceeded,
        status if status.is_server_error() => SyncApiError::ServerError(error_message(response).await),
        _ => {
            let msg = error_message(response).await;
            SyncApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

/// Prefer the `{"error": ...}` body, fall back to raw text
async fn error_message(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or(text)
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::time::Duration;

    async fn client(server: &mockito::Server) -> SyncApiClient {
        let client = SyncApiClient::new(&server.url(), Duration::from_secs(5)).unwrap();
        client.set_token("tok".to_string()).await;
        client
    }

    #[tokio::test]
    async fn test_token_management() {
        let client = SyncApiClient::new("http://localhost:1", Duration::from_secs(1)).unwrap();
        assert!(client.get_token().await.is_none());

        client.set_token("test_token".to_string()).await;
        assert_eq!(client.get_token().await, Some("test_token".to_string()));

        client.clear_token().await;
        assert!(client.get_token().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_token_fails_before_request() {
        let client = SyncApiClient::new("http://localhost:1", Duration::from_secs(1)).unwrap();
        assert!(matches!(client.pull(0).await, Err(SyncApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_pull_sends_cursor_and_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sync/pull")
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::Json(serde_json::json!({"cursor": 7})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"version": 9, "groups": [{"id": "g1", "updatedAt": 5, "name": "Daily"}],
                    "transactions": [{"id": "t1", "scopeId": "s1", "updatedAt": 6,
                                      "amount": 20.0, "type": "income", "date": "2024-02-01"}]}"#,
            )
            .create_async()
            .await;

        let response = client(&server).await.pull(7).await.unwrap();
        mock.assert_async().await;

        assert_eq!(response.version, 9);
        assert_eq!(response.batch.groups.len(), 1);
        assert_eq!(response.batch.transactions[0].data.amount, 20.0);
        assert!(response.batch.settings.is_none());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/sync/push").with_status(403).create_async().await;
        server.mock("GET", "/sync/version").with_status(503).with_body("down").create_async().await;

        let client = client(&server).await;
        let err = SyncError::from(client.push(&SyncBatch::default()).await.unwrap_err());
        assert!(matches!(err, SyncError::AuthFailure(_)));

        let err = SyncError::from(client.version().await.unwrap_err());
        assert!(matches!(err, SyncError::NetworkFailure(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_html_and_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/attachments/a1")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html>login</html>")
            .create_async()
            .await;
        server
            .mock("GET", "/attachments/a2")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("GET", "/attachments/a3")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body([1u8, 2, 3])
            .create_async()
            .await;

        let client = client(&server).await;
        assert!(matches!(
            client.fetch_attachment("a1").await,
            Err(SyncApiError::InvalidResponse(_))
        ));
        assert!(matches!(
            client.fetch_attachment("a2").await,
            Err(SyncApiError::InvalidResponse(_))
        ));
        assert_eq!(client.fetch_attachment("a3").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_upload_and_quota() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/attachments/a1")
            .match_header("content-type", "application/octet-stream")
            .with_status(201)
            .with_body(r#"{"contentId": "a1"}"#)
            .create_async()
            .await;
        server
            .mock("PUT", "/attachments/a2")
            .with_status(507)
            .create_async()
            .await;

        let client = client(&server).await;
        assert_eq!(AttachmentRemote::upload(&client, "a1", b"x").await.unwrap(), "a1");
        assert!(matches!(
            AttachmentRemote::upload(&client, "a2", b"x").await,
            Err(SyncError::QuotaExceeded(_))
        ));
    }
}
