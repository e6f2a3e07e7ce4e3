//! WebDAV Transport - remote file store for the file-backed adapter
//!
//! Every remote file lives flat under one collection (`remote_path`).
//! Writes carry the ETag captured at read time (`If-Match`) or, for files
//! that did not exist, `If-None-Match: *`; the server answers 412 when the
//! file moved on in between.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::{SyncError, SyncResult};
use super::queue::AttachmentRemote;

const ATTACHMENTS_DIR: &str = "attachments";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:getetag/>
    <D:getcontentlength/>
    <D:resourcetype/>
  </D:prop>
</D:propfind>"#;

#[derive(Error, Debug)]
pub enum WebDavError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0} was modified")]
    PreconditionFailed(String),

    #[error("Insufficient storage for {0}")]
    InsufficientStorage(String),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

// ============================================================================
// Remote File Store
// ============================================================================

/// A file as listed by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub etag: Option<String>,
    pub size: Option<u64>,
}

/// A downloaded file with the version token it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: Vec<u8>,
    pub etag: Option<String>,
}

/// Write precondition derived from the last read of the same file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The server did not hand out a version token; write unconditionally
    None,
    /// The file must still be at this version
    MustMatch(String),
    /// The file must not exist yet
    MustNotExist,
}

/// Flat, ETag-versioned file storage
#[async_trait]
pub trait RemoteFileStore: Send + Sync {
    async fn list(&self) -> SyncResult<Vec<RemoteEntry>>;

    /// `None` when the file does not exist
    async fn get(&self, name: &str) -> SyncResult<Option<RemoteFile>>;

    /// Returns the new version token, when the server reports one
    async fn put(&self, name: &str, content: Vec<u8>, precondition: Precondition) -> SyncResult<Option<String>>;
}

// ============================================================================
// WebDAV Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebDavCredentials {
    pub username: String,
    pub password: String,
}

/// Parsed `<D:response>` of a PROPFIND
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub href: String,
    pub is_collection: bool,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
}

pub struct WebDavClient {
    client: Client,
    base_url: String,
    remote_path: String,
    credentials: WebDavCredentials,
}

impl WebDavClient {
    pub fn new(
        server_url: &str,
        remote_path: &str,
        credentials: WebDavCredentials,
        timeout: std::time::Duration,
    ) -> Result<Self, WebDavError> {
        let base_url = server_url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(WebDavError::InvalidUrl("URL must start with http:// or https://".to_string()));
        }
        url::Url::parse(&base_url).map_err(|e| WebDavError::InvalidUrl(e.to_string()))?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(std::time::Duration::from_secs(30)))
            .build()?;

        Ok(Self {
            client,
            base_url,
            remote_path: remote_path.trim_matches('/').to_string(),
            credentials,
        })
    }

    /// URL of the sync collection itself, with a trailing slash
    fn collection_url(&self) -> String {
        if self.remote_path.is_empty() {
            format!("{}/", self.base_url)
        } else {
            format!("{}/{}/", self.base_url, self.remote_path)
        }
    }

    fn file_url(&self, name: &str) -> String {
        let encoded: Vec<String> = name
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}{}", self.collection_url(), encoded.join("/"))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
    }

    /// Check credentials and that the sync collection is reachable
    pub async fn test_connection(&self) -> Result<bool, WebDavError> {
        self.mkdir_p("").await?;
        let response = self.propfind(&self.collection_url(), 0).await?;
        Ok(!response.is_empty())
    }

    /// PROPFIND - list a collection or get resource properties
    pub async fn propfind(&self, url: &str, depth: u32) -> Result<Vec<ResourceInfo>, WebDavError> {
        let response = self
            .request(dav_method(b"PROPFIND")?, url)
            .header("Depth", depth.to_string())
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(WebDavError::AuthFailed),
            StatusCode::NOT_FOUND => return Err(WebDavError::NotFound(url.to_string())),
            status if !status.is_success() => {
                return Err(WebDavError::Server {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            _ => {}
        }

        let xml = response.text().await?;
        parse_propfind_response(&xml)
    }

    /// GET - download a file with its ETag
    pub async fn get_with_etag(&self, name: &str) -> Result<(Vec<u8>, Option<String>), WebDavError> {
        let response = self.request(Method::GET, &self.file_url(name)).send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(WebDavError::AuthFailed),
            StatusCode::NOT_FOUND => return Err(WebDavError::NotFound(name.to_string())),
            status if !status.is_success() => {
                return Err(WebDavError::Server {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            _ => {}
        }

        let etag = etag_header(&response);
        let data = response.bytes().await?.to_vec();
        Ok((data, etag))
    }

    /// PUT - upload a file under a precondition. Creates the parent
    /// collection once when the server reports it missing.
    pub async fn put(&self, name: &str, data: &[u8], precondition: &Precondition) -> Result<Option<String>, WebDavError> {
        match self.put_once(name, data, precondition).await {
            Err(WebDavError::NotFound(_)) => {
                log::debug!("WebDAV: parent of {} missing, creating collection", name);
                let parent = name.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
                self.mkdir_p(parent).await?;
                self.put_once(name, data, precondition).await
            }
            other => other,
        }
    }

    async fn put_once(&self, name: &str, data: &[u8], precondition: &Precondition) -> Result<Option<String>, WebDavError> {
        let mut request = self
            .request(Method::PUT, &self.file_url(name))
            .body(data.to_vec());

        request = match precondition {
            Precondition::None => request,
            Precondition::MustMatch(etag) => request.header("If-Match", etag.as_str()),
            Precondition::MustNotExist => request.header("If-None-Match", "*"),
        };

        let response = request.send().await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT | StatusCode::OK => Ok(etag_header(&response)),
            StatusCode::PRECONDITION_FAILED => Err(WebDavError::PreconditionFailed(name.to_string())),
            // 409: intermediate collection missing
            StatusCode::CONFLICT | StatusCode::NOT_FOUND => Err(WebDavError::NotFound(name.to_string())),
            StatusCode::INSUFFICIENT_STORAGE | StatusCode::PAYLOAD_TOO_LARGE => {
                Err(WebDavError::InsufficientStorage(name.to_string()))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WebDavError::AuthFailed),
            status => Err(WebDavError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// DELETE - remove a file; a missing file is not an error
    pub async fn delete(&self, name: &str) -> Result<(), WebDavError> {
        let response = self.request(Method::DELETE, &self.file_url(name)).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WebDavError::AuthFailed),
            status => Err(WebDavError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// MKCOL - create one collection, tolerated when it already exists
    pub async fn mkcol(&self, url: &str) -> Result<(), WebDavError> {
        let response = self.request(dav_method(b"MKCOL")?, url).send().await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK | StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WebDavError::AuthFailed),
            status => Err(WebDavError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Create the sync collection (and `sub` below it) level by level
    pub async fn mkdir_p(&self, sub: &str) -> Result<(), WebDavError> {
        let full = format!("{}/{}", self.remote_path, sub.trim_matches('/'));
        let mut current = self.base_url.clone();

        for part in full.split('/').filter(|p| !p.is_empty()) {
            current = format!("{}/{}", current, urlencoding::encode(part));
            self.mkcol(&format!("{}/", current)).await?;
        }

        Ok(())
    }
}

fn dav_method(name: &'static [u8]) -> Result<Method, WebDavError> {
    Method::from_bytes(name).map_err(|e| WebDavError::InvalidRequest(e.to_string()))
}

fn etag_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// ETag without quoting or the weak prefix, for comparison only. Requests
/// always carry the token exactly as the server handed it out.
pub fn opaque_etag(raw: &str) -> &str {
    raw.trim().trim_start_matches("W/").trim_matches('"')
}

/// Quoting and the weak prefix can differ between PROPFIND and GET on some
/// servers
pub fn same_etag(a: &str, b: &str) -> bool {
    opaque_etag(a) == opaque_etag(b)
}

/// Last non-empty path segment of an href, percent-decoded
fn href_file_name(href: &str) -> Option<String> {
    let segment = href.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    Some(
        urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string()),
    )
}

/// Parse a PROPFIND multistatus body, independent of namespace prefixes
fn parse_propfind_response(xml: &str) -> Result<Vec<ResourceInfo>, WebDavError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<ResourceInfo> = None;
    let mut element = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"response" => current = Some(ResourceInfo::default()),
                    b"collection" => {
                        if let Some(info) = current.as_mut() {
                            info.is_collection = true;
                        }
                    }
                    _ => {}
                }
                element = name;
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(info) = current.as_mut() {
                        info.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| WebDavError::XmlParse(e.to_string()))?
                    .into_owned();
                if let Some(info) = current.as_mut() {
                    match element.as_slice() {
                        b"href" => info.href = text,
                        b"getetag" => info.etag = Some(text.trim().to_string()),
                        b"getcontentlength" => info.content_length = text.trim().parse().ok(),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"response" {
                    if let Some(info) = current.take() {
                        if !info.href.is_empty() {
                            resources.push(info);
                        }
                    }
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(WebDavError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    log::debug!("parse_propfind: parsed {} resources", resources.len());
    Ok(resources)
}

#[async_trait]
impl RemoteFileStore for WebDavClient {
    async fn list(&self) -> SyncResult<Vec<RemoteEntry>> {
        let resources = match self.propfind(&self.collection_url(), 1).await {
            Ok(resources) => resources,
            // Nothing synced yet
            Err(WebDavError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(resources
            .into_iter()
            .filter(|r| !r.is_collection)
            .filter_map(|r| {
                href_file_name(&r.href).map(|name| RemoteEntry {
                    name,
                    etag: r.etag,
                    size: r.content_length,
                })
            })
            .collect())
    }

    async fn get(&self, name: &str) -> SyncResult<Option<RemoteFile>> {
        match self.get_with_etag(name).await {
            Ok((content, etag)) => Ok(Some(RemoteFile { content, etag })),
            Err(WebDavError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, content: Vec<u8>, precondition: Precondition) -> SyncResult<Option<String>> {
        Ok(WebDavClient::put(self, name, &content, &precondition).await?)
    }
}

#[async_trait]
impl AttachmentRemote for WebDavClient {
    async fn upload(&self, content_id: &str, blob: &[u8]) -> SyncResult<String> {
        let name = format!("{}/{}", ATTACHMENTS_DIR, content_id);
        WebDavClient::put(self, &name, blob, &Precondition::None).await?;
        Ok(content_id.to_string())
    }

    async fn fetch(&self, content_id: &str) -> SyncResult<Vec<u8>> {
        let name = format!("{}/{}", ATTACHMENTS_DIR, content_id);
        match self.get_with_etag(&name).await {
            Ok((content, _)) => Ok(content),
            Err(WebDavError::NotFound(_)) => Err(SyncError::malformed(name, "attachment not found")),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, content_id: &str) -> SyncResult<()> {
        Ok(WebDavClient::delete(self, &format!("{}/{}", ATTACHMENTS_DIR, content_id)).await?)
    }
}

// ============================================================================
// Tests
// ============================================================================
