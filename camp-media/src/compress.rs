//! Client-side image compression applied before an upload leaves the machine.
//!
//! `compress` is total: whatever goes wrong inside (corrupt bytes, a format we
//! cannot decode, a failed worker) the caller gets the original file back and a
//! warning is logged.

use crate::media::{BYTES_PER_MB, MediaFile};
use crate::notice::Notice;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CompressOptions {
    /// Soft ceiling for the transmitted size.
    pub max_size_mb: f64,
    /// Longest edge after resizing, in pixels.
    pub max_dimension: u32,
    pub initial_quality: u8,
    pub min_quality: u8,
    pub max_iterations: u32,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            max_size_mb: 3.0,
            max_dimension: 1920,
            initial_quality: 90,
            min_quality: 50,
            max_iterations: 10,
        }
    }
}

impl CompressOptions {
    pub fn new(max_size_mb: f64, max_dimension: u32) -> Self {
        Self {
            max_size_mb,
            max_dimension,
            ..Self::default()
        }
    }

    fn target_bytes(&self) -> usize {
        (self.max_size_mb * BYTES_PER_MB) as usize
    }
}

const QUALITY_STEP: u8 = 10;
const SHRINK_FACTOR: f64 = 0.9;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("unsupported image format {0}")]
    Unsupported(String),
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
    #[error("compression worker failed: {0}")]
    Worker(String),
}

/// Compress `file` towards `opts.max_size_mb`, returning the original on any failure.
#[cfg(test)]
pub async fn compress(file: MediaFile, opts: &CompressOptions) -> MediaFile {
    compress_with_report(file, opts).await.0
}

/// Compress `file` towards `opts.max_size_mb`. On any failure the original is
/// returned together with the warning to show the user.
pub async fn compress_with_report(
    file: MediaFile,
    opts: &CompressOptions,
) -> (MediaFile, Option<Notice>) {
    if file.size_bytes() <= opts.target_bytes() {
        return (file, None);
    }
    let data = file.data.clone();
    let worker_opts = opts.clone();
    let result = tokio::task::spawn_blocking(move || recompress(&data, &worker_opts))
        .await
        .map_err(|e| CompressError::Worker(e.to_string()))
        .and_then(|r| r);
    match result {
        Ok(Some(smaller)) => {
            tracing::debug!(
                file = %file.name,
                before_mb = file.size_mb(),
                after = smaller.len(),
                "compressed image"
            );
            (file.with_data(smaller), None)
        }
        Ok(None) => {
            tracing::debug!(
                file = %file.name,
                size = file.size_bytes(),
                "compression did not shrink image; keeping original"
            );
            (file, None)
        }
        Err(e) => {
            tracing::warn!(
                file = %file.name,
                error = %e,
                "image compression failed; uploading original"
            );
            let notice = Notice::CompressionSkipped {
                file_name: file.name.clone(),
                reason: e.to_string(),
            };
            (file, Some(notice))
        }
    }
}

/// Returns `Ok(None)` when no encoding beat the input size.
fn recompress(data: &[u8], opts: &CompressOptions) -> Result<Option<Vec<u8>>, CompressError> {
    let format = image::guess_format(data)?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(CompressError::Unsupported(format!("{format:?}")));
    }
    let mut img = image::load_from_memory_with_format(data, format)?;
    if let Some(tag) = exif_orientation(data) {
        img = apply_orientation(img, tag);
    }
    img = fit_within(img, opts.max_dimension);

    let target = opts.target_bytes();
    let mut quality = opts.initial_quality.clamp(1, 100);
    let mut best: Option<Vec<u8>> = None;
    for _ in 0..opts.max_iterations.max(1) {
        let encoded = encode(&img, format, quality)?;
        let done = encoded.len() <= target;
        if best.as_ref().is_none_or(|b| encoded.len() < b.len()) {
            best = Some(encoded);
        }
        if done {
            break;
        }
        if format == ImageFormat::Jpeg && quality > opts.min_quality {
            quality = quality.saturating_sub(QUALITY_STEP).max(opts.min_quality);
        } else {
            let (w, h) = img.dimensions();
            let nw = ((w as f64 * SHRINK_FACTOR) as u32).max(1);
            let nh = ((h as f64 * SHRINK_FACTOR) as u32).max(1);
            img = img.resize_exact(nw, nh, FilterType::CatmullRom);
        }
    }
    Ok(best.filter(|b| b.len() < data.len()))
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, CompressError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
        }
        _ => img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?,
    }
    Ok(buf)
}

/// Shrink so the longest edge is at most `max_dimension`; never upscales.
fn fit_within(img: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if max_dimension == 0 || (w <= max_dimension && h <= max_dimension) {
        return img;
    }
    img.resize(max_dimension, max_dimension, FilterType::CatmullRom)
}

/// EXIF orientation tag (1..=8), if the container carries one.
fn exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let reader = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = reader.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    match field.value.get_uint(0) {
        Some(v) if (1..=8).contains(&v) => Some(v as u16),
        _ => None,
    }
}

/// Bake the EXIF orientation into the pixels; re-encoding drops the tag.
fn apply_orientation(img: DynamicImage, tag: u16) -> DynamicImage {
    match tag {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}
