use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, instrument};

use crate::backend::{EntityApi, EntityKind, SubmitError};
use crate::config;
use crate::drafts::{DraftRegistry, DraftSession, OpenDraft, Progress, SubmitFailure};
use crate::gallery::{GalleryError, MediaSlot, SlotId, SlotOrigin, SlotRole};
use crate::media::MediaFile;
use crate::notice::Notice;
use crate::publish::{PublishCause, PublishStatus};

#[derive(Clone)]
pub struct AppState {
    pub cfg: config::SharedConfig,
    pub drafts: Arc<DraftRegistry>,
    pub api: Arc<dyn EntityApi>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("draft not found")]
    DraftNotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Submit(#[from] SubmitFailure),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::DraftNotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Gallery(GalleryError::FileTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Gallery(GalleryError::IndexOutOfRange { .. }) => StatusCode::NOT_FOUND,
            ApiError::Submit(SubmitFailure::Publish(e)) => match e.cause {
                PublishCause::CoverMissing => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::BAD_GATEWAY,
            },
            ApiError::Submit(SubmitFailure::Save(SubmitError::Rejected { status, .. })) => {
                StatusCode::from_u16(*status)
                    .ok()
                    .filter(StatusCode::is_client_error)
                    .unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Submit(SubmitFailure::Save(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn user_message(&self) -> String {
        match self {
            ApiError::Submit(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string(), "message": self.user_message() });
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub id: SlotId,
    pub role: SlotRole,
    pub source: &'static str,
    pub name: Option<String>,
    pub size: Option<usize>,
    pub url: Option<String>,
    /// What to render: the remote URL or the local preview once it is ready.
    pub display: Option<String>,
}

impl From<&MediaSlot> for SlotView {
    fn from(slot: &MediaSlot) -> Self {
        let display = slot.display_ref().map(str::to_string);
        match &slot.origin {
            SlotOrigin::Local { file, .. } => SlotView {
                id: slot.id,
                role: slot.role,
                source: "local",
                name: Some(file.name.clone()),
                size: Some(file.size_bytes()),
                url: None,
                display,
            },
            SlotOrigin::Remote { url } => SlotView {
                id: slot.id,
                role: slot.role,
                source: "remote",
                name: None,
                size: None,
                url: Some(url.clone()),
                display,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DraftView {
    pub id: String,
    pub kind: EntityKind,
    pub entity_id: Option<String>,
    pub max_additional: usize,
    pub max_file_mb: f64,
    /// Cover first, then additional photos in display order.
    pub slots: Vec<SlotView>,
    pub status: PublishStatus,
    /// Pending until acknowledged through `notices/ack`.
    pub notices: Vec<Notice>,
}

// Waits for the draft, which a running submit holds; poll `progress` meanwhile.
async fn view(id: &str, session: &DraftSession) -> DraftView {
    let draft = session.draft.lock().await;
    let progress = session.progress();
    DraftView {
        id: id.to_string(),
        kind: session.kind,
        entity_id: session.entity_id.clone(),
        max_additional: draft.limits().max_additional,
        max_file_mb: draft.limits().max_file_mb,
        slots: draft.to_ordered_list().into_iter().map(SlotView::from).collect(),
        status: progress.status,
        notices: progress.notices,
    }
}

fn session(state: &AppState, id: &str) -> Result<Arc<DraftSession>, ApiError> {
    state.drafts.get(id).ok_or(ApiError::DraftNotFound)
}

/// Collect every file part of a multipart body, in order.
async fn read_files(mut multipart: Multipart) -> Result<Vec<MediaFile>, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let mime = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        files.push(MediaFile::new(name, mime.as_deref(), data));
    }
    Ok(files)
}

async fn read_single_file(multipart: Multipart) -> Result<MediaFile, ApiError> {
    read_files(multipart)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::BadRequest("no file in request".to_string()))
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(
            %method,
            %uri,
            %status,
            elapsed_ms = start.elapsed().as_millis(),
            "http 5xx"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            %method,
            %uri,
            %status,
            elapsed_ms = start.elapsed().as_millis(),
            "http 4xx"
        );
    }
    res
}

#[instrument(skip_all, fields(kind = ?req.kind))]
pub async fn open_draft(
    State(state): State<AppState>,
    Json(req): Json<OpenDraft>,
) -> Result<Json<DraftView>, ApiError> {
    let cfg = config::ConfigManager::to_struct(&state.cfg).await?;
    let flow = cfg.flow(req.kind);
    let (id, session) = state.drafts.open(req, flow);
    Ok(Json(view(&id, &session).await))
}

pub async fn get_draft(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    Ok(Json(view(&id, &session).await))
}

/// Status and notices only. Answers immediately, even during a submit.
pub async fn get_progress(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Progress>, ApiError> {
    Ok(Json(session(&state, &id)?.progress()))
}

#[derive(Deserialize)]
pub struct AckPayload {
    pub count: usize,
}

/// Drop the `count` oldest notices the client has displayed.
pub async fn ack_notices(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<AckPayload>,
) -> Result<Json<Progress>, ApiError> {
    Ok(Json(session(&state, &id)?.acknowledge(payload.count)))
}

pub async fn close_draft(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    if state.drafts.close(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::DraftNotFound)
    }
}

pub async fn set_cover(
    Path(id): Path<String>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    let file = read_single_file(multipart).await?;
    let slot = session.draft.lock().await.set_cover(file)?;
    session.spawn_previews(vec![slot]);
    Ok(Json(view(&id, &session).await))
}

pub async fn remove_cover(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    session.draft.lock().await.remove_cover();
    Ok(Json(view(&id, &session).await))
}

pub async fn add_photos(
    Path(id): Path<String>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    let files = read_files(multipart).await?;
    if files.is_empty() {
        return Err(ApiError::BadRequest("no files in request".to_string()));
    }
    let outcome = session.draft.lock().await.add_additional(files);
    if outcome.limit_reached() {
        tracing::info!(
            draft = %id,
            accepted = outcome.accepted.len(),
            "additional photo limit reached"
        );
    }
    session.push_notices(outcome.notices);
    session.spawn_previews(outcome.accepted);
    Ok(Json(view(&id, &session).await))
}

pub async fn replace_photo(
    Path((id, index)): Path<(String, usize)>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    let file = read_single_file(multipart).await?;
    let slot = session.draft.lock().await.replace_additional(index, file)?;
    session.spawn_previews(vec![slot]);
    Ok(Json(view(&id, &session).await))
}

pub async fn remove_photo(
    Path((id, index)): Path<(String, usize)>,
    State(state): State<AppState>,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    session.draft.lock().await.remove_additional(index)?;
    Ok(Json(view(&id, &session).await))
}

pub async fn make_cover(
    Path((id, index)): Path<(String, usize)>,
    State(state): State<AppState>,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    session.draft.lock().await.swap_cover(index)?;
    Ok(Json(view(&id, &session).await))
}

#[derive(Deserialize)]
pub struct MovePayload {
    pub to: usize,
}

pub async fn move_photo(
    Path((id, index)): Path<(String, usize)>,
    State(state): State<AppState>,
    Json(payload): Json<MovePayload>,
) -> Result<Json<DraftView>, ApiError> {
    let session = session(&state, &id)?;
    session
        .draft
        .lock()
        .await
        .move_additional(index, payload.to)?;
    Ok(Json(view(&id, &session).await))
}

#[derive(Deserialize)]
pub struct SubmitPayload {
    #[serde(default)]
    pub fields: JsonValue,
}

/// Publish the gallery and save the entity. The draft is closed only on success,
/// and any warnings raised while uploading are returned with the saved entity.
#[instrument(err, skip_all, fields(draft = %id))]
pub async fn submit_draft(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<SubmitPayload>,
) -> Result<Json<JsonValue>, ApiError> {
    let session = session(&state, &id)?;
    let entity = session.submit(state.api.as_ref(), payload.fields).await?;
    let notices = session.progress().notices;
    state.drafts.close(&id);
    Ok(Json(json!({ "entity": entity, "notices": notices })))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let api = Router::new()
        .route("/drafts", post(open_draft))
        .route("/drafts/{id}", get(get_draft).delete(close_draft))
        .route("/drafts/{id}/progress", get(get_progress))
        .route("/drafts/{id}/notices/ack", post(ack_notices))
        .route(
            "/drafts/{id}/cover",
            put(set_cover)
                .layer(DefaultBodyLimit::disable())
                .delete(remove_cover),
        )
        .route(
            "/drafts/{id}/photos",
            post(add_photos).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/drafts/{id}/photos/{index}",
            put(replace_photo)
                .layer(DefaultBodyLimit::disable())
                .delete(remove_photo),
        )
        .route("/drafts/{id}/photos/{index}/cover", post(make_cover))
        .route("/drafts/{id}/photos/{index}/move", post(move_photo))
        .route("/drafts/{id}/submit", post(submit_draft))
        .with_state(state)
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses));

    Router::new().nest("/api", api)
}

/// Serve the HTTP API on `bind`.
pub async fn serve(app: Router, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TicketError, TicketProvider, UploadTicket};
    use crate::gallery::{FlowLimits, GalleryDraft};
    use crate::store::{ObjectStore, ObjectStoreError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Tickets;

    #[async_trait]
    impl TicketProvider for Tickets {
        async fn fetch_ticket(&self, folder: &str) -> Result<UploadTicket, TicketError> {
            Ok(UploadTicket {
                api_key: "k".into(),
                timestamp: "1".into(),
                signature: "s".into(),
                folder: folder.into(),
                transformation: None,
                cloud_name: "camp".into(),
            })
        }
    }

    /// Each upload waits for a permit, so tests decide when uploads finish.
    struct Store {
        gate: Semaphore,
    }

    impl Store {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(64),
            })
        }

        fn held() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl ObjectStore for Store {
        async fn upload(
            &self,
            _ticket: &UploadTicket,
            file: &MediaFile,
        ) -> Result<String, ObjectStoreError> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| ObjectStoreError::Malformed(e.to_string()))?;
            Ok(format!("https://res.cloudinary.com/camp/{}", file.name))
        }
    }

    struct Api {
        reject: bool,
    }

    #[async_trait]
    impl EntityApi for Api {
        async fn create(
            &self,
            _kind: EntityKind,
            _payload: JsonValue,
        ) -> Result<JsonValue, SubmitError> {
            if self.reject {
                return Err(SubmitError::Rejected {
                    status: 422,
                    message: "Title is required".into(),
                });
            }
            Ok(json!({ "id": "1" }))
        }

        async fn update(
            &self,
            _kind: EntityKind,
            id: &str,
            _payload: JsonValue,
        ) -> Result<JsonValue, SubmitError> {
            Ok(json!({ "id": id }))
        }
    }

    fn app_state(config: &str, store: Arc<Store>, reject: bool) -> AppState {
        let cfg = config::ConfigManager::from_text(PathBuf::from("test.toml"), config).unwrap();
        AppState {
            cfg,
            drafts: Arc::new(DraftRegistry::new(Arc::new(Tickets), store)),
            api: Arc::new(Api { reject }),
        }
    }

    async fn open(state: &AppState) -> String {
        let req = OpenDraft {
            kind: EntityKind::Activity,
            entity_id: None,
            cover_url: None,
            additional_urls: vec![],
        };
        open_draft(State(state.clone()), Json(req)).await.unwrap().0.id
    }

    async fn multipart(files: &[(&str, Vec<u8>)]) -> Multipart {
        let boundary = "camp-media-boundary";
        let mut body = Vec::new();
        for (name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                     filename=\"{name}\"\r\nContent-Type: image/jpeg\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(req, &()).await.unwrap()
    }

    async fn with_cover(state: &AppState, id: &str, name: &str, data: Vec<u8>) {
        let form = multipart(&[(name, data)]).await;
        set_cover(Path(id.to_string()), State(state.clone()), form)
            .await
            .unwrap();
    }

    fn submit_body() -> Json<SubmitPayload> {
        Json(SubmitPayload {
            fields: json!({ "name": "Lake day" }),
        })
    }

    #[tokio::test]
    async fn add_photos_returns_limit_notice_until_acknowledged() {
        let state = app_state("[flows.activity]\nmax_additional = 1\n", Store::open(), false);
        let id = open(&state).await;
        let form = multipart(&[
            ("a.jpg", vec![1u8; 3]),
            ("b.jpg", vec![2u8; 3]),
            ("c.jpg", vec![3u8; 3]),
        ])
        .await;
        let view = add_photos(Path(id.clone()), State(state.clone()), form)
            .await
            .unwrap()
            .0;
        let names: Vec<_> = view.slots.iter().map(|s| s.name.as_deref()).collect();
        assert_eq!(names, vec![Some("a.jpg"), Some("b.jpg")]);
        assert_eq!(view.slots[0].role, SlotRole::Cover);
        let limit = Notice::LimitReached {
            max: 1,
            rejected: vec!["c.jpg".into()],
        };
        assert_eq!(view.notices, vec![limit.clone()]);

        // reading again does not lose the notice
        let again = get_draft(Path(id.clone()), State(state.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(again.notices, vec![limit]);

        let left = ack_notices(
            Path(id.clone()),
            State(state.clone()),
            Json(AckPayload { count: 1 }),
        )
        .await
        .unwrap()
        .0;
        assert!(left.notices.is_empty());
    }

    #[tokio::test]
    async fn progress_is_readable_while_submit_uploads() {
        let store = Store::held();
        let state = app_state("", store.clone(), false);
        let id = open(&state).await;
        with_cover(&state, &id, "cover.jpg", vec![1u8; 16]).await;

        let submit = tokio::spawn(submit_draft(
            Path(id.clone()),
            State(state.clone()),
            submit_body(),
        ));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = PublishStatus::Idle;
        while std::time::Instant::now() < deadline {
            seen = get_progress(Path(id.clone()), State(state.clone()))
                .await
                .unwrap()
                .0
                .status;
            if seen == PublishStatus::UploadingCover {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(seen, PublishStatus::UploadingCover);

        store.gate.add_permits(8);
        let body = submit.await.unwrap().unwrap().0;
        assert_eq!(body["entity"]["id"], "1");
        assert_eq!(body["notices"], json!([]));
        assert!(matches!(
            get_progress(Path(id), State(state)).await,
            Err(ApiError::DraftNotFound)
        ));
    }

    #[tokio::test]
    async fn submit_returns_compression_warning_and_closes_draft() {
        let state = app_state(
            "[flows.activity]\ncompress_target_mb = 0.001\n",
            Store::open(),
            false,
        );
        let id = open(&state).await;
        with_cover(&state, &id, "broken.jpg", vec![7u8; 4096]).await;

        let body = submit_draft(Path(id.clone()), State(state.clone()), submit_body())
            .await
            .unwrap()
            .0;
        assert_eq!(body["entity"]["id"], "1");
        let notices = body["notices"].as_array().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0]["kind"], "compression_skipped");
        assert_eq!(notices[0]["file_name"], "broken.jpg");
        assert!(state.drafts.get(&id).is_none());
    }

    #[tokio::test]
    async fn failed_submit_leaves_draft_open() {
        let state = app_state("", Store::open(), true);
        let id = open(&state).await;

        let err = submit_draft(Path(id.clone()), State(state.clone()), submit_body())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.user_message(), "Please add a cover photo before saving.");

        with_cover(&state, &id, "cover.jpg", vec![1u8; 16]).await;
        let err = submit_draft(Path(id.clone()), State(state.clone()), submit_body())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.user_message(), "Title is required");

        let session = state.drafts.get(&id).unwrap();
        assert_eq!(session.progress().status, PublishStatus::Failed);
        let view = get_draft(Path(id), State(state)).await.unwrap().0;
        assert_eq!(view.slots.len(), 1);
        assert_eq!(view.slots[0].source, "local");
    }

    #[test]
    fn error_statuses() {
        let e = ApiError::Gallery(GalleryError::FileTooLarge {
            file_name: "x.jpg".into(),
            limit_mb: 5.0,
        });
        assert_eq!(e.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(e.user_message(), "x.jpg is larger than 5 MB");

        let e = ApiError::Submit(SubmitFailure::Save(SubmitError::Rejected {
            status: 401,
            message: "Unauthorized".into(),
        }));
        assert_eq!(e.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(e.user_message(), "Unauthorized");

        let e = ApiError::Submit(SubmitFailure::Save(SubmitError::Rejected {
            status: 503,
            message: String::new(),
        }));
        assert_eq!(e.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(e.user_message(), "Saving failed. Please try again.");
    }

    #[test]
    fn slot_views_follow_draft_order() {
        let mut draft = GalleryDraft::from_existing(
            FlowLimits::default(),
            Some("https://cdn/c.jpg".into()),
            vec!["https://cdn/a.jpg".into()],
        );
        draft.add_additional(vec![MediaFile::new("new.jpg", None, vec![0u8; 3])]);
        let views: Vec<SlotView> = draft
            .to_ordered_list()
            .into_iter()
            .map(SlotView::from)
            .collect();
        assert_eq!(views.len(), 3);
        assert_eq!(views[0].role, SlotRole::Cover);
        assert_eq!(views[0].url.as_deref(), Some("https://cdn/c.jpg"));
        assert_eq!(views[0].display, views[0].url);
        assert_eq!(views[2].display, None);
        assert_eq!(views[2].source, "local");
        assert_eq!(views[2].name.as_deref(), Some("new.jpg"));
        assert_eq!(views[2].size, Some(3));
    }
}
