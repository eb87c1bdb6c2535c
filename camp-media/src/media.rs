use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A user-selected file held in memory until it is published.
#[derive(Clone)]
pub struct MediaFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
    pub last_modified: DateTime<Utc>,
}

impl Debug for MediaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFile")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("size", &self.data.len())
            .finish()
    }
}

impl MediaFile {
    /// Wrap raw bytes. Without a usable declared type the MIME is guessed from the file name.
    pub fn new(name: impl Into<String>, mime: Option<&str>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let declared = mime
            .and_then(|m| m.trim().parse::<mime::Mime>().ok())
            .filter(|m| *m != mime::APPLICATION_OCTET_STREAM);
        let mime = match declared {
            Some(m) => m.essence_str().to_string(),
            None => mime_guess::from_path(&name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };
        Self {
            name,
            mime,
            data: data.into(),
            last_modified: Utc::now(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn size_mb(&self) -> f64 {
        self.data.len() as f64 / BYTES_PER_MB
    }

    /// True when the file is strictly larger than `limit_mb` megabytes.
    pub fn exceeds_mb(&self, limit_mb: f64) -> bool {
        self.data.len() as f64 > limit_mb * BYTES_PER_MB
    }

    /// Same name and type, new content, fresh modification time.
    pub fn with_data(&self, data: impl Into<Bytes>) -> Self {
        Self {
            name: self.name.clone(),
            mime: self.mime.clone(),
            data: data.into(),
            last_modified: Utc::now(),
        }
    }
}
