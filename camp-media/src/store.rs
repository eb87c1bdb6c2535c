//! Signed direct uploads to the image host.

use crate::backend::UploadTicket;
use crate::media::MediaFile;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_UPLOAD_BASE: &str = "https://api.cloudinary.com/v1_1";

/// Provider text that signals the upload was over the plan's size limit.
const FILE_TOO_LARGE_MARKER: &str = "File size too large";

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("upload request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("file too large after compression: {message}")]
    FileTooLarge { message: String },
    #[error("image host rejected upload ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected image host response: {0}")]
    Malformed(String),
}

/// Map a provider failure message onto a typed error. All substring matching lives here.
pub fn classify_provider_error(status: u16, message: &str) -> ObjectStoreError {
    if message.contains(FILE_TOO_LARGE_MARKER) {
        ObjectStoreError::FileTooLarge {
            message: message.to_string(),
        }
    } else {
        ObjectStoreError::Rejected {
            status,
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload one file with a signed ticket, returning the hosted secure URL.
    async fn upload(
        &self,
        ticket: &UploadTicket,
        file: &MediaFile,
    ) -> Result<String, ObjectStoreError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    error: Option<ProviderError>,
}

#[derive(Deserialize)]
struct ProviderError {
    message: String,
}

#[derive(Clone)]
pub struct CloudinaryStore {
    upload_base: String,
    http: reqwest::Client,
}

impl CloudinaryStore {
    pub fn new(upload_base: Option<&str>) -> Self {
        Self {
            upload_base: upload_base
                .unwrap_or(DEFAULT_UPLOAD_BASE)
                .trim_end_matches('/')
                .to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn upload_url(&self, cloud_name: &str) -> String {
        format!("{}/{}/image/upload", self.upload_base, cloud_name)
    }

    fn form(
        ticket: &UploadTicket,
        file: &MediaFile,
    ) -> Result<reqwest::multipart::Form, ObjectStoreError> {
        let part = reqwest::multipart::Part::bytes(file.data.to_vec())
            .file_name(file.name.clone())
            .mime_str(&file.mime)
            .map_err(|e| {
                ObjectStoreError::Malformed(format!("invalid mime '{}': {e}", file.mime))
            })?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("api_key", ticket.api_key.clone())
            .text("timestamp", ticket.timestamp.clone())
            .text("signature", ticket.signature.clone())
            .text("folder", ticket.folder.clone());
        if let Some(t) = &ticket.transformation {
            form = form.text("transformation", t.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl ObjectStore for CloudinaryStore {
    async fn upload(
        &self,
        ticket: &UploadTicket,
        file: &MediaFile,
    ) -> Result<String, ObjectStoreError> {
        let url = self.upload_url(&ticket.cloud_name);
        let form = Self::form(ticket, file)?;
        let resp = self.http.post(&url).multipart(form).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let parsed: Option<UploadResponse> = serde_json::from_str(&text).ok();
        if let Some(err) = parsed.as_ref().and_then(|p| p.error.as_ref()) {
            tracing::warn!(
                %status,
                file = %file.name,
                message = %err.message,
                "image host rejected upload"
            );
            return Err(classify_provider_error(status.as_u16(), &err.message));
        }
        if !status.is_success() {
            tracing::warn!(%status, file = %file.name, body = %text, "image host upload failed");
            return Err(classify_provider_error(status.as_u16(), text.trim()));
        }
        match parsed.and_then(|p| p.secure_url) {
            Some(secure_url) => {
                tracing::debug!(file = %file.name, url = %secure_url, "uploaded image");
                Ok(secure_url)
            }
            None => Err(ObjectStoreError::Malformed(
                "response missing secure_url".to_string(),
            )),
        }
    }
}
