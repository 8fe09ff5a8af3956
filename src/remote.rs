//! HTTP client for the inspection server.
//!
//! `InspectionApi` is the seam the sync engine dispatches through; tests swap
//! in a recording fake. Every call carries the queue item's id as
//! `Idempotency-Key` so a replay after a lost ack is recognised server-side.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Remote as RemoteConfig;
use crate::error::SyncError;
use crate::model::{InspectionPayload, LocalId, PhotoBlob, TilePayload};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection refused, DNS failure, timeout: the server was never reached.
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("request rejected {status}: {body}")]
    Client { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid remote configuration: {0}")]
    Config(String),
}

impl RemoteError {
    /// 5xx, 408 and 429 are worth retrying; other 4xx are not.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let code = status.as_u16();
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            RemoteError::Server { status: code, body }
        } else {
            RemoteError::Client { status: code, body }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable(_) | RemoteError::Server { .. } | RemoteError::InvalidResponse(_)
        )
    }

    /// Whether the failure says something about connectivity.
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_))
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        if err.is_transient() {
            SyncError::TransientNetwork(err.to_string())
        } else {
            SyncError::PermanentValidation(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PhotoUpload {
    pub photo_id: LocalId,
    pub mime_type: String,
    pub content_base64: String,
}

impl From<&PhotoBlob> for PhotoUpload {
    fn from(photo: &PhotoBlob) -> Self {
        Self {
            photo_id: photo.photo_id,
            mime_type: photo.mime_type.clone(),
            content_base64: BASE64_STANDARD.encode(&photo.content),
        }
    }
}

/// Body of `POST /inspections/{id}/non-conformities`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NonConformityUpload {
    pub title: String,
    pub notes: String,
    pub photos: Vec<PhotoUpload>,
}

#[async_trait]
pub trait InspectionApi: Send + Sync {
    async fn create_inspection(
        &self,
        idempotency_key: &str,
        payload: &InspectionPayload,
    ) -> Result<String, RemoteError>;

    async fn update_inspection(
        &self,
        idempotency_key: &str,
        remote_id: &str,
        payload: &InspectionPayload,
    ) -> Result<(), RemoteError>;

    async fn create_tile(
        &self,
        idempotency_key: &str,
        inspection_remote_id: &str,
        payload: &TilePayload,
    ) -> Result<String, RemoteError>;

    async fn create_non_conformity(
        &self,
        idempotency_key: &str,
        inspection_remote_id: &str,
        upload: &NonConformityUpload,
    ) -> Result<String, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: Value,
}

#[derive(Clone)]
pub struct HttpInspectionApi {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpInspectionApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpInspectionApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpInspectionApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url =
            Url::parse(base_url).map_err(|err| RemoteError::Config(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::Config(format!("{base_url} cannot be a base URL")));
        }
        let http = Client::builder()
            .user_agent(concat!("tile-survey/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|err| RemoteError::Config(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &RemoteConfig) -> Result<Self, RemoteError> {
        Self::new(
            &cfg.base_url,
            cfg.token.clone(),
            Duration::from_millis(cfg.timeout_ms),
        )
    }

    /// Appends path segments to the base URL, escaping each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Config("base URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn build_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        idempotency_key: &str,
        body: &B,
    ) -> Result<reqwest::Request, RemoteError> {
        let url = self.endpoint(segments)?;
        let mut builder = self
            .http
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
            .build()
            .map_err(|err| RemoteError::Config(format!("failed to build request: {err}")))
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String, RemoteError> {
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "remote request");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| RemoteError::Unreachable(err.to_string()))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|err| RemoteError::Unreachable(format!("failed to read response: {err}")))?;
        if !status.is_success() {
            warn!(%method, %url, %status, "remote call failed");
            return Err(RemoteError::from_status(status, body));
        }
        debug!(%status, "remote response");
        Ok(body)
    }

    async fn execute_create(&self, request: reqwest::Request) -> Result<String, RemoteError> {
        let body = self.execute(request).await?;
        parse_created_id(&body)
    }
}

/// Reads `{"id": ...}` where the id may be a string or a number.
pub fn parse_created_id(body: &str) -> Result<String, RemoteError> {
    let created: CreatedResponse = serde_json::from_str(body)
        .map_err(|err| RemoteError::InvalidResponse(format!("create response: {err}")))?;
    match created.id {
        Value::String(id) if !id.trim().is_empty() => Ok(id),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(RemoteError::InvalidResponse(format!(
            "create response has unusable id {other}"
        ))),
    }
}

#[async_trait]
impl InspectionApi for HttpInspectionApi {
    async fn create_inspection(
        &self,
        idempotency_key: &str,
        payload: &InspectionPayload,
    ) -> Result<String, RemoteError> {
        let request = self.build_request(Method::POST, &["inspections"], idempotency_key, payload)?;
        self.execute_create(request).await
    }

    async fn update_inspection(
        &self,
        idempotency_key: &str,
        remote_id: &str,
        payload: &InspectionPayload,
    ) -> Result<(), RemoteError> {
        let request = self.build_request(
            Method::PUT,
            &["inspections", remote_id],
            idempotency_key,
            payload,
        )?;
        self.execute(request).await.map(|_| ())
    }

    async fn create_tile(
        &self,
        idempotency_key: &str,
        inspection_remote_id: &str,
        payload: &TilePayload,
    ) -> Result<String, RemoteError> {
        let request = self.build_request(
            Method::POST,
            &["inspections", inspection_remote_id, "tiles"],
            idempotency_key,
            payload,
        )?;
        self.execute_create(request).await
    }

    async fn create_non_conformity(
        &self,
        idempotency_key: &str,
        inspection_remote_id: &str,
        upload: &NonConformityUpload,
    ) -> Result<String, RemoteError> {
        let request = self.build_request(
            Method::POST,
            &["inspections", inspection_remote_id, "non-conformities"],
            idempotency_key,
            upload,
        )?;
        self.execute_create(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientInfo, SiteInfo, UploadStatus};
    use chrono::Utc;

    fn api(base: &str, token: Option<&str>) -> HttpInspectionApi {
        HttpInspectionApi::new(base, token.map(str::to_string), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn build_request_sets_headers_and_path() {
        let client = api("https://survey.example/api/v1/", Some("secret"));
        let payload = InspectionPayload {
            protocol_code: "P-1".into(),
            client: ClientInfo::default(),
            site: SiteInfo::default(),
        };
        let request = client
            .build_request(Method::PUT, &["inspections", "srv/7"], "key-1", &payload)
            .unwrap();

        assert_eq!(request.method(), Method::PUT);
        assert_eq!(
            request.url().as_str(),
            "https://survey.example/api/v1/inspections/srv%2F7"
        );
        let headers = request.headers();
        assert_eq!(headers.get(IDEMPOTENCY_HEADER).unwrap(), "key-1");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer secret");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn base_without_trailing_slash_and_no_token() {
        let client = api("http://localhost:8080", Some("  "));
        let request = client
            .build_request(Method::POST, &["inspections"], "k", &serde_json::json!({}))
            .unwrap();
        assert_eq!(request.url().as_str(), "http://localhost:8080/inspections");
        assert!(request.headers().get("authorization").is_none());
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(matches!(
            HttpInspectionApi::new("not a url", None, Duration::from_secs(1)),
            Err(RemoteError::Config(_))
        ));
        assert!(HttpInspectionApi::new("mailto:ops@example.com", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn status_classification() {
        let transient = [500u16, 502, 503, 408, 429];
        for code in transient {
            let err = RemoteError::from_status(StatusCode::from_u16(code).unwrap(), String::new());
            assert!(err.is_transient(), "{code} should be transient");
            assert!(!err.is_network());
        }
        for code in [400u16, 401, 404, 409, 422] {
            let err = RemoteError::from_status(StatusCode::from_u16(code).unwrap(), String::new());
            assert!(!err.is_transient(), "{code} should be permanent");
            assert!(matches!(SyncError::from(err), SyncError::PermanentValidation(_)));
        }
        assert!(matches!(
            SyncError::from(RemoteError::Unreachable("refused".into())),
            SyncError::TransientNetwork(_)
        ));
    }

    #[test]
    fn created_id_accepts_string_or_number() {
        assert_eq!(parse_created_id(r#"{"id":"abc"}"#).unwrap(), "abc");
        assert_eq!(parse_created_id(r#"{"id":42,"extra":true}"#).unwrap(), "42");
        assert!(matches!(
            parse_created_id(r#"{"id":null}"#),
            Err(RemoteError::InvalidResponse(_))
        ));
        assert!(parse_created_id("<html>").is_err());
    }

    #[test]
    fn photo_upload_embeds_base64() {
        let photo = PhotoBlob {
            photo_id: LocalId::new(),
            inspection_local_id: LocalId::new(),
            mime_type: "image/jpeg".into(),
            content: b"hello".to_vec(),
            upload_status: UploadStatus::Pending,
            created_at: Utc::now(),
        };
        let upload = PhotoUpload::from(&photo);
        assert_eq!(upload.content_base64, "aGVsbG8=");
        assert_eq!(upload.photo_id, photo.photo_id);
    }
}
