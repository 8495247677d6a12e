//! Static file serving for the built web UI

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const INDEX: &str = "index.html";

/// Serves a single-page app from a directory on disk. Unknown paths fall
/// back to `index.html` so client-side routes survive a reload.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: Option<PathBuf>,
}

impl StaticFiles {
    pub fn new(root: Option<PathBuf>) -> Self {
        if let Some(root) = &root {
            if !root.join(INDEX).is_file() {
                warn!("No {} in UI directory {}", INDEX, root.display());
            }
        }
        Self { root }
    }

    /// Serve a request path such as `/assets/app.js`
    pub async fn serve(&self, path: &str) -> Response {
        let Some(root) = &self.root else {
            return (StatusCode::NOT_FOUND, "Web UI not configured").into_response();
        };

        let relative = path.trim_start_matches('/');
        let Some(relative) = sanitize(relative) else {
            debug!(path, "Rejected UI path");
            return (StatusCode::BAD_REQUEST, "Invalid path").into_response();
        };

        let relative = if relative.as_os_str().is_empty() {
            PathBuf::from(INDEX)
        } else {
            relative
        };

        if let Some(response) = read_file(&root.join(&relative)).await {
            return response;
        }

        if relative != Path::new(INDEX) {
            if let Some(response) = read_file(&root.join(INDEX)).await {
                return response;
            }
        }

        (StatusCode::NOT_FOUND, "Not found").into_response()
    }
}

/// Only plain path segments are allowed; `..`, absolute and prefixed
/// components are rejected.
fn sanitize(relative: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(segment) => clean.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

async fn read_file(path: &Path) -> Option<Response> {
    if !tokio::fs::metadata(path).await.ok()?.is_file() {
        return None;
    }
    let bytes = tokio::fs::read(path).await.ok()?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Some(
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime.as_ref().to_string())],
            bytes,
        )
            .into_response(),
    )
}
