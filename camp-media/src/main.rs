mod backend;
mod compress;
mod config;
mod drafts;
mod gallery;
mod http;
mod media;
mod notice;
mod preview;
mod publish;
mod store;
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first so we can honor logging.filter directive.
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let shared = config::ConfigManager::load(path).await?;
    let cfg_snapshot = config::ConfigManager::to_struct(&shared).await?;
    let filter_directive = cfg_snapshot
        .logging
        .as_ref()
        .and_then(|l| l.filter.clone())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info,camp_media=debug".to_string());
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();
    cfg_snapshot.validate()?;

    let backend_cfg = cfg_snapshot.backend.clone().unwrap_or_default();
    let base_url = backend_cfg
        .base_url
        .ok_or_else(|| anyhow::anyhow!("[backend] base_url is not set"))?;
    let backend = Arc::new(backend::BackendClient::new(&base_url, backend_cfg.auth_token));
    let upload_base = cfg_snapshot
        .object_store
        .as_ref()
        .and_then(|o| o.upload_base.clone());
    let store = Arc::new(store::CloudinaryStore::new(upload_base.as_deref()));

    let state = http::AppState {
        cfg: shared,
        drafts: Arc::new(drafts::DraftRegistry::new(backend.clone(), store)),
        api: backend,
    };
    let app = http::router(state);
    http::serve(app, &cfg_snapshot.bind_address()).await?;
    Ok(())
}
