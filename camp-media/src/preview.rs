use crate::media::MediaFile;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Read a local file into a displayable `data:` URL off the async workers.
pub async fn data_url(file: &MediaFile) -> String {
    let data = file.data.clone();
    let mime = file.mime.clone();
    match tokio::task::spawn_blocking(move || encode(&mime, &data)).await {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(file = %file.name, error = %e, "preview worker failed; encoding inline");
            encode(&file.mime, &file.data)
        }
    }
}

fn encode(mime: &str, data: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(data))
}
