//! Client for the community REST backend: signed upload tickets and entity saves.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Entities whose forms carry a photo gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Activity,
    CampArea,
    Region,
}

impl EntityKind {
    pub fn path(self) -> &'static str {
        match self {
            EntityKind::Activity => "/activities",
            EntityKind::CampArea => "/camp-areas",
            EntityKind::Region => "/regions",
        }
    }

    /// Object-store folder uploads for this entity land in.
    pub fn default_folder(self) -> &'static str {
        match self {
            EntityKind::Activity => "activities",
            EntityKind::CampArea => "camp_area",
            EntityKind::Region => "community",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            EntityKind::Activity => "activity",
            EntityKind::CampArea => "camp_area",
            EntityKind::Region => "region",
        }
    }
}

/// Short-lived credential for one direct upload to the object store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadTicket {
    pub api_key: String,
    #[serde(deserialize_with = "string_or_number")]
    pub timestamp: String,
    pub signature: String,
    pub folder: String,
    #[serde(default, deserialize_with = "optional_string")]
    pub transformation: Option<String>,
    pub cloud_name: String,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match JsonValue::deserialize(d)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn optional_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match JsonValue::deserialize(d)? {
        JsonValue::Null => None,
        JsonValue::String(s) if s.is_empty() => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("signature request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend refused upload signature ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("save request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend rejected save ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[async_trait]
pub trait TicketProvider: Send + Sync {
    async fn fetch_ticket(&self, folder: &str) -> Result<UploadTicket, TicketError>;
}

/// Entity create/update endpoints. Payloads are JSON objects.
#[async_trait]
pub trait EntityApi: Send + Sync {
    async fn create(&self, kind: EntityKind, payload: JsonValue) -> Result<JsonValue, SubmitError>;
    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, SubmitError>;
}

#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    auth_token: Option<String>,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send_entity(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: &JsonValue,
    ) -> Result<JsonValue, SubmitError> {
        let resp = self.request(method, path).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(JsonValue::String(text)))
    }
}

/// Pull a human message out of a backend error body.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<JsonValue>(body) {
        for key in ["message", "error"] {
            match v.get(key) {
                Some(JsonValue::String(s)) => return s.clone(),
                Some(JsonValue::Object(o)) => {
                    if let Some(JsonValue::String(s)) = o.get("message") {
                        return s.clone();
                    }
                }
                _ => {}
            }
        }
    }
    body.trim().to_string()
}

#[async_trait]
impl TicketProvider for BackendClient {
    async fn fetch_ticket(&self, folder: &str) -> Result<UploadTicket, TicketError> {
        let resp = self
            .request(reqwest::Method::GET, "/utils/cloudinary-signature")
            .query(&[("folder", folder)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, folder, body = %text, "upload signature request failed");
            return Err(TicketError::Rejected {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        let ticket: UploadTicket = resp.json().await?;
        tracing::debug!(
            folder = %ticket.folder,
            cloud = %ticket.cloud_name,
            "obtained upload signature"
        );
        Ok(ticket)
    }
}

#[async_trait]
impl EntityApi for BackendClient {
    async fn create(&self, kind: EntityKind, payload: JsonValue) -> Result<JsonValue, SubmitError> {
        self.send_entity(reqwest::Method::POST, kind.path(), &payload)
            .await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, SubmitError> {
        let path = format!("{}/{}", kind.path(), id);
        self.send_entity(reqwest::Method::PUT, &path, &payload).await
    }
}
