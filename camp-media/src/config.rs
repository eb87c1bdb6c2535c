use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use toml_edit::DocumentMut;

use crate::backend::EntityKind;
use crate::compress::CompressOptions;
use crate::gallery::{DEFAULT_MAX_ADDITIONAL, FlowLimits};
use crate::publish::PublishSettings;

#[cfg(feature = "embed_example")]
use rust_embed::RustEmbed;

#[cfg(feature = "embed_example")]
#[derive(RustEmbed)]
#[folder = "../"]
#[include = "camp-media.example.toml"]
struct ConfigAssets;

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "camp-media.toml";

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8787";

/// Strongly typed representation of the configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    pub backend: Option<Backend>,
    pub object_store: Option<ObjectStoreConfig>,
    /// Per-entity gallery settings keyed by `activity`, `camp_area` or `region`.
    #[serde(default)]
    pub flows: HashMap<EntityKind, Flow>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Backend {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ObjectStoreConfig {
    /// Upload API root; the cloud name and `/image/upload` are appended.
    pub upload_base: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Flow {
    pub folder: Option<String>,
    /// Hard ceiling checked when a file is selected.
    pub max_file_mb: Option<f64>,
    /// Soft size target handed to the compressor.
    pub compress_target_mb: Option<f64>,
    pub max_dimension: Option<u32>,
    pub max_additional: Option<usize>,
    pub cover_required: Option<bool>,
}

/// Everything a form needs to build its draft and orchestrator.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub limits: FlowLimits,
    pub publish: PublishSettings,
}

const DEFAULT_COMPRESS_TARGET_MB: f64 = 3.0;
const DEFAULT_MAX_DIMENSION: u32 = 1920;

fn default_max_file_mb(kind: EntityKind) -> f64 {
    match kind {
        EntityKind::Activity => 10.0,
        EntityKind::CampArea => 20.0,
        EntityKind::Region => 5.0,
    }
}

impl Config {
    pub fn bind_address(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind_address.clone())
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
    }

    /// Resolve settings for one entity kind, filling gaps with built-in defaults.
    pub fn flow(&self, kind: EntityKind) -> FlowSettings {
        let f = self.flows.get(&kind).cloned().unwrap_or_default();
        let max_file_mb = f.max_file_mb.unwrap_or_else(|| default_max_file_mb(kind));
        let compress_target_mb = f.compress_target_mb.unwrap_or(DEFAULT_COMPRESS_TARGET_MB);
        FlowSettings {
            limits: FlowLimits {
                max_file_mb,
                max_additional: f.max_additional.unwrap_or(DEFAULT_MAX_ADDITIONAL),
            },
            publish: PublishSettings {
                folder: f
                    .folder
                    .unwrap_or_else(|| kind.default_folder().to_string()),
                compress: CompressOptions::new(
                    compress_target_mb,
                    f.max_dimension.unwrap_or(DEFAULT_MAX_DIMENSION),
                ),
                cover_required: f.cover_required.unwrap_or(true),
            },
        }
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        for kind in [EntityKind::Activity, EntityKind::CampArea, EntityKind::Region] {
            let flow = self.flow(kind);
            let target = flow.publish.compress.max_size_mb;
            if flow.limits.max_file_mb <= 0.0 || target <= 0.0 {
                bail!("flows.{}: size limits must be positive", kind.key());
            }
            if target >= flow.limits.max_file_mb {
                bail!(
                    "flows.{}: compress_target_mb ({target}) must be lower than max_file_mb ({})",
                    kind.key(),
                    flow.limits.max_file_mb
                );
            }
            if flow.publish.folder.trim().is_empty() {
                bail!("flows.{}: folder must not be empty", kind.key());
            }
        }
        Ok(())
    }
}

/// Internal manager state kept behind an `Arc<RwLock<_>>`.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    doc: DocumentMut,
}

pub type SharedConfig = Arc<RwLock<ConfigManager>>;

impl ConfigManager {
    /// Load existing config file. If the file does not exist, creates it from the embedded example.
    pub async fn load(path: Option<PathBuf>) -> Result<SharedConfig> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            #[cfg(feature = "embed_example")]
            {
                if let Some(example_file) = ConfigAssets::get("camp-media.example.toml") {
                    let example_content = std::str::from_utf8(&example_file.data)
                        .with_context(|| "embedded example config is not valid UTF-8")?;

                    fs::write(&path, example_content)
                        .await
                        .with_context(|| format!("writing example config to {}", path.display()))?;

                    println!("Created default config file: {}", path.display());
                    println!("   Set [backend] base_url before submitting forms.");
                } else {
                    bail!(
                        "config file {} not found and embedded example is not available",
                        path.display()
                    );
                }
            }
            #[cfg(not(feature = "embed_example"))]
            {
                bail!("config file {} not found", path.display());
            }
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_text(path, &text)
    }

    pub(crate) fn from_text(path: PathBuf, text: &str) -> Result<SharedConfig> {
        let doc = text
            .parse::<DocumentMut>()
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(Arc::new(RwLock::new(Self { path, doc })))
    }

    /// Convert current document to strongly typed struct.
    pub async fn to_struct(cfg: &SharedConfig) -> Result<Config> {
        let guard = cfg.read().await;
        let typed: Config = toml_edit::de::from_document(guard.doc.clone())
            .with_context(|| format!("invalid config in {}", guard.path.display()))?;
        Ok(typed)
    }
}
