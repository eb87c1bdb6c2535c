//! Open form sessions, one gallery draft each.

use crate::backend::{EntityApi, EntityKind, SubmitError, TicketProvider};
use crate::config::FlowSettings;
use crate::gallery::{GalleryDraft, SlotId};
use crate::notice::Notice;
use crate::preview;
use crate::publish::{
    ProgressSink, PublishError, PublishStatus, PublishedGallery, UploadOrchestrator,
};
use crate::store::ObjectStore;
use parking_lot::{Mutex, RwLock};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Latest publish status plus notices not yet shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub status: PublishStatus,
    pub notices: Vec<Notice>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            status: PublishStatus::Idle,
            notices: Vec::new(),
        }
    }
}

impl ProgressSink for Mutex<Progress> {
    fn status(&self, status: PublishStatus) {
        tracing::debug!(status = %status, "publish progress");
        self.lock().status = status;
    }

    fn notice(&self, notice: Notice) {
        self.lock().notices.push(notice);
    }
}

#[derive(Debug, Error)]
pub enum SubmitFailure {
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Save(#[from] SubmitError),
}

impl SubmitFailure {
    pub fn user_message(&self) -> String {
        match self {
            SubmitFailure::Publish(e) => e.user_message(),
            SubmitFailure::Save(SubmitError::Rejected { message, .. }) if !message.is_empty() => {
                message.clone()
            }
            SubmitFailure::Save(_) => "Saving failed. Please try again.".to_string(),
        }
    }
}

/// One create/edit form. The draft stays locked for the whole submit so it
/// cannot change while its files are being uploaded.
pub struct DraftSession {
    pub kind: EntityKind,
    /// Set for edit forms.
    pub entity_id: Option<String>,
    pub draft: tokio::sync::Mutex<GalleryDraft>,
    pub progress: Mutex<Progress>,
    orchestrator: UploadOrchestrator,
}

impl DraftSession {
    pub fn new(
        kind: EntityKind,
        entity_id: Option<String>,
        draft: GalleryDraft,
        orchestrator: UploadOrchestrator,
    ) -> Self {
        Self {
            kind,
            entity_id,
            draft: tokio::sync::Mutex::new(draft),
            progress: Mutex::new(Progress::default()),
            orchestrator,
        }
    }

    pub fn is_edit(&self) -> bool {
        self.entity_id.is_some()
    }

    pub fn push_notices(&self, notices: impl IntoIterator<Item = Notice>) {
        self.progress.lock().notices.extend(notices);
    }

    /// Current status and pending notices. Never waits on the draft, so it can be
    /// polled while a submit holds it.
    pub fn progress(&self) -> Progress {
        self.progress.lock().clone()
    }

    /// Drop the oldest `count` notices once a client has shown them.
    pub fn acknowledge(&self, count: usize) -> Progress {
        let mut guard = self.progress.lock();
        let count = count.min(guard.notices.len());
        guard.notices.drain(..count);
        guard.clone()
    }

    /// Read previews for freshly added slots in the background and attach them by id.
    pub fn spawn_previews(self: &Arc<Self>, ids: Vec<SlotId>) {
        if ids.is_empty() {
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            for id in ids {
                let file = {
                    let draft = session.draft.lock().await;
                    draft.find(id).and_then(|s| s.local_file()).cloned()
                };
                let Some(file) = file else { continue };
                let url = preview::data_url(&file).await;
                if !session.draft.lock().await.attach_preview(id, url) {
                    tracing::debug!(slot = ?id, "slot removed before preview was ready");
                }
            }
        });
    }

    /// Upload the gallery, then create or update the entity with `fields` plus image URLs.
    pub async fn submit(
        &self,
        api: &dyn EntityApi,
        fields: JsonValue,
    ) -> Result<JsonValue, SubmitFailure> {
        let draft = self.draft.lock().await;
        self.progress.lock().status = PublishStatus::Idle;
        let published = self.orchestrator.publish(&draft, &self.progress).await?;
        self.progress.status(PublishStatus::Saving);
        let result = match &self.entity_id {
            Some(id) => {
                let payload = merge(fields, published.edit_payload());
                api.update(self.kind, id, payload).await
            }
            None => {
                let payload = merge(fields, published.create_payload());
                api.create(self.kind, payload).await
            }
        };
        match result {
            Ok(body) => {
                self.progress.status(PublishStatus::Done);
                log_published(self.kind, &published, draft.removed_urls().len());
                Ok(body)
            }
            Err(e) => {
                tracing::warn!(kind = ?self.kind, error = %e, "entity save failed");
                self.progress.status(PublishStatus::Failed);
                Err(e.into())
            }
        }
    }
}

fn log_published(kind: EntityKind, published: &PublishedGallery, removed: usize) {
    tracing::info!(
        kind = ?kind,
        cover = ?published.cover_url(),
        additional = published.additional.len(),
        uploaded = published.upload_count(),
        removed,
        "entity saved with gallery"
    );
}

/// Merge image fields into the form's own fields. Non-object fields are replaced.
fn merge(fields: JsonValue, images: JsonValue) -> JsonValue {
    let mut base = match fields {
        JsonValue::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    if let JsonValue::Object(images) = images {
        base.extend(images);
    }
    JsonValue::Object(base)
}

/// Request to open a form: `entity_id` and the URLs are only set when editing.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenDraft {
    pub kind: EntityKind,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub additional_urls: Vec<String>,
}

/// All sessions currently open, keyed by a random id.
pub struct DraftRegistry {
    sessions: RwLock<HashMap<String, Arc<DraftSession>>>,
    tickets: Arc<dyn TicketProvider>,
    store: Arc<dyn ObjectStore>,
}

const DRAFT_ID_LEN: usize = 16;

impl DraftRegistry {
    pub fn new(tickets: Arc<dyn TicketProvider>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            tickets,
            store,
        }
    }

    pub fn open(&self, req: OpenDraft, flow: FlowSettings) -> (String, Arc<DraftSession>) {
        let draft = if req.entity_id.is_some() {
            GalleryDraft::from_existing(flow.limits, req.cover_url, req.additional_urls)
        } else {
            GalleryDraft::new(flow.limits)
        };
        let mut publish = flow.publish;
        // only creation insists on a cover
        publish.cover_required = publish.cover_required && req.entity_id.is_none();
        let orchestrator =
            UploadOrchestrator::new(publish, Arc::clone(&self.tickets), Arc::clone(&self.store));
        let session = Arc::new(DraftSession::new(req.kind, req.entity_id, draft, orchestrator));
        let id = Alphanumeric.sample_string(&mut rand::rng(), DRAFT_ID_LEN);
        self.sessions.write().insert(id.clone(), Arc::clone(&session));
        tracing::info!(draft = %id, kind = ?req.kind, edit = session.is_edit(), "opened draft");
        (id, session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<DraftSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Drop a session. In-flight uploads are left to finish on their own.
    pub fn close(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            tracing::info!(draft = %id, "closed draft");
        }
        removed
    }
}
