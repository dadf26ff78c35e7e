//! Streaming cached files back to clients.

use std::path::Path;

use anyhow::Context as _;
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

use super::handler::AppError;

/// Stream `path` with a guessed `Content-Type`.  With `attachment` set the
/// response also carries `Content-Disposition: attachment`.
pub(crate) async fn serve_file(path: &Path, attachment: Option<&str>) -> Result<Response, AppError> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open cached file: {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("stat cached file: {}", path.display()))?
        .len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Some(filename) = attachment
        && let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}
