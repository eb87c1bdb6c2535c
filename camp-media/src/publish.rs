//! Upload orchestration: turn a gallery draft into hosted URLs ready for an entity save.
//!
//! The cover is uploaded first and on its own. Additional photos are uploaded
//! concurrently afterwards, one signed ticket per file. Any failure aborts the
//! publish and leaves the draft untouched so the user can resubmit.

use crate::backend::{TicketError, TicketProvider};
use crate::compress::{CompressOptions, compress_with_report};
use crate::gallery::{GalleryDraft, SlotOrigin};
use crate::media::MediaFile;
use crate::notice::Notice;
use crate::store::{ObjectStore, ObjectStoreError};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Per-flow publishing parameters.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub folder: String,
    pub compress: CompressOptions,
    /// Create flows refuse to publish a gallery without a cover.
    pub cover_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PublishStatus {
    Idle,
    UploadingCover,
    UploadingAdditional { count: usize },
    Saving,
    Done,
    Failed,
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStatus::Idle => f.write_str("idle"),
            PublishStatus::UploadingCover => f.write_str("uploading cover photo"),
            PublishStatus::UploadingAdditional { count } => {
                write!(f, "uploading {count} additional photos")
            }
            PublishStatus::Saving => f.write_str("saving"),
            PublishStatus::Done => f.write_str("done"),
            PublishStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Receives progress for UI display. Has no influence on the publish outcome.
pub trait ProgressSink: Send + Sync {
    fn status(&self, status: PublishStatus);
    fn notice(&self, notice: Notice);
}

impl ProgressSink for () {
    fn status(&self, _status: PublishStatus) {}
    fn notice(&self, _notice: Notice) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPhase {
    Cover,
    Additional,
}

impl fmt::Display for PublishPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishPhase::Cover => f.write_str("cover photo"),
            PublishPhase::Additional => f.write_str("additional photos"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishCause {
    #[error("a cover photo is required")]
    CoverMissing,
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

#[derive(Debug, Error)]
#[error("{phase} upload failed: {cause}")]
pub struct PublishError {
    pub phase: PublishPhase,
    #[source]
    pub cause: PublishCause,
}

impl PublishError {
    fn new(phase: PublishPhase, cause: PublishCause) -> Self {
        Self { phase, cause }
    }

    pub fn is_file_too_large(&self) -> bool {
        matches!(
            self.cause,
            PublishCause::ObjectStore(ObjectStoreError::FileTooLarge { .. })
        )
    }

    /// Text for the blocking error shown when a submit attempt ends.
    pub fn user_message(&self) -> String {
        match (&self.cause, self.phase) {
            (PublishCause::CoverMissing, _) => {
                "Please add a cover photo before saving.".to_string()
            }
            (
                PublishCause::ObjectStore(ObjectStoreError::FileTooLarge { .. }),
                PublishPhase::Cover,
            ) => "The cover photo is too large even after compression. \
                  Please choose a smaller image."
                .to_string(),
            (
                PublishCause::ObjectStore(ObjectStoreError::FileTooLarge { .. }),
                PublishPhase::Additional,
            ) => "One of the additional photos is too large even after compression. \
                  Please choose a smaller image."
                .to_string(),
            (_, PublishPhase::Cover) => {
                "Could not upload the cover photo. Please try again.".to_string()
            }
            (_, PublishPhase::Additional) => {
                "Could not upload the additional photos. Please try again.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedImage {
    pub url: String,
    /// False when the URL was already hosted and reused as-is.
    pub uploaded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishedGallery {
    pub cover: Option<PublishedImage>,
    pub additional: Vec<PublishedImage>,
}

impl PublishedGallery {
    pub fn cover_url(&self) -> Option<&str> {
        self.cover.as_ref().map(|c| c.url.as_str())
    }

    pub fn additional_urls(&self) -> Vec<&str> {
        self.additional.iter().map(|i| i.url.as_str()).collect()
    }

    pub fn upload_count(&self) -> usize {
        self.cover.iter().chain(&self.additional).filter(|i| i.uploaded).count()
    }

    /// Image fields for a create request.
    pub fn create_payload(&self) -> JsonValue {
        json!({
            "imageUrl": self.cover_url(),
            "additionalImages": self.additional_urls(),
        })
    }

    /// Image fields for an update request; kept URLs are separated from new uploads
    /// so the backend can work out which stored images were dropped.
    pub fn edit_payload(&self) -> JsonValue {
        let kept: Vec<&str> = self
            .additional
            .iter()
            .filter(|i| !i.uploaded)
            .map(|i| i.url.as_str())
            .collect();
        let added: Vec<&str> = self
            .additional
            .iter()
            .filter(|i| i.uploaded)
            .map(|i| i.url.as_str())
            .collect();
        json!({
            "imageUrl": self.cover_url(),
            "keptImages": kept,
            "additionalImages": added,
        })
    }
}

pub struct UploadOrchestrator {
    settings: PublishSettings,
    tickets: Arc<dyn TicketProvider>,
    store: Arc<dyn ObjectStore>,
}

impl UploadOrchestrator {
    pub fn new(
        settings: PublishSettings,
        tickets: Arc<dyn TicketProvider>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            settings,
            tickets,
            store,
        }
    }

    /// Upload every local slot and collect URLs in draft order.
    pub async fn publish(
        &self,
        draft: &GalleryDraft,
        progress: &dyn ProgressSink,
    ) -> Result<PublishedGallery, PublishError> {
        let result = self.run(draft, progress).await;
        if let Err(e) = &result {
            tracing::warn!(
                folder = %self.settings.folder,
                phase = ?e.phase,
                too_large = e.is_file_too_large(),
                error = %e,
                "publish failed"
            );
            progress.status(PublishStatus::Failed);
        }
        result
    }

    async fn run(
        &self,
        draft: &GalleryDraft,
        progress: &dyn ProgressSink,
    ) -> Result<PublishedGallery, PublishError> {
        if self.settings.cover_required && draft.cover().is_none() {
            return Err(PublishError::new(
                PublishPhase::Cover,
                PublishCause::CoverMissing,
            ));
        }

        let cover = match draft.cover() {
            Some(slot) => Some(match &slot.origin {
                SlotOrigin::Remote { url } => PublishedImage {
                    url: url.clone(),
                    uploaded: false,
                },
                SlotOrigin::Local { file, .. } => {
                    progress.status(PublishStatus::UploadingCover);
                    tracing::info!(
                        folder = %self.settings.folder,
                        file = %file.name,
                        "uploading cover photo"
                    );
                    let url = self
                        .upload_one(file, progress)
                        .await
                        .map_err(|cause| PublishError::new(PublishPhase::Cover, cause))?;
                    PublishedImage { url, uploaded: true }
                }
            }),
            None => None,
        };

        let pending = draft.additional().iter().filter(|s| s.is_local()).count();
        if pending > 0 {
            progress.status(PublishStatus::UploadingAdditional { count: pending });
            tracing::info!(
                folder = %self.settings.folder,
                count = pending,
                "uploading additional photos"
            );
        }
        // Remote slots resolve immediately; try_join_all keeps results in draft order.
        let additional = futures::future::try_join_all(draft.additional().iter().map(
            |slot| async move {
                match &slot.origin {
                    SlotOrigin::Remote { url } => Ok(PublishedImage {
                        url: url.clone(),
                        uploaded: false,
                    }),
                    SlotOrigin::Local { file, .. } => self
                        .upload_one(file, progress)
                        .await
                        .map(|url| PublishedImage { url, uploaded: true }),
                }
            },
        ))
        .await
        .map_err(|cause| PublishError::new(PublishPhase::Additional, cause))?;

        let published = PublishedGallery { cover, additional };
        tracing::debug!(
            folder = %self.settings.folder,
            uploads = published.upload_count(),
            kept = draft.to_ordered_list().len() - published.upload_count(),
            removed = draft.removed_urls().len(),
            "gallery published"
        );
        Ok(published)
    }

    async fn upload_one(
        &self,
        file: &MediaFile,
        progress: &dyn ProgressSink,
    ) -> Result<String, PublishCause> {
        let ticket = self.tickets.fetch_ticket(&self.settings.folder).await?;
        let (prepared, notice) = compress_with_report(file.clone(), &self.settings.compress).await;
        if let Some(n) = notice {
            progress.notice(n);
        }
        let url = self.store.upload(&ticket, &prepared).await?;
        Ok(url)
    }
}
