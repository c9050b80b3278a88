//! Static asset collaborator: the document root behind the front door.
//!
//! Serves the application shell (with runtime-configuration token
//! substitution) and plain files with extension-derived content types. The
//! front door owns status-code translation; this module reports only
//! "not found" vs. "failed".

use std::path::{Component, Path, PathBuf};

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use tracing::warn;

/// Application shell file, served for the root path.
const SHELL: &str = "index.html";

/// Cache directive for immutable-ish static files.
const ASSET_CACHE: &str = "public, max-age=3600";

/// The shell embeds substituted runtime values, so clients must revalidate.
const SHELL_CACHE: &str = "no-cache";

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("asset read failed: {0}")]
    Io(#[from] std::io::Error),
}

pub struct AssetServer {
    root: PathBuf,
    /// `%TOKEN%` → value pairs substituted into the shell.
    substitutions: Vec<(String, String)>,
}

impl AssetServer {
    pub fn new(root: PathBuf, substitutions: Vec<(String, String)>) -> Self {
        Self {
            root,
            substitutions,
        }
    }

    /// Serve one GET path. The root path is the application shell; every
    /// other path resolves against the document root.
    pub async fn serve(&self, path: &str) -> Result<Response<Body>, AssetError> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() || trimmed == SHELL {
            return self.serve_shell().await;
        }

        let Some(file) = self.resolve(trimmed) else {
            return Err(AssetError::NotFound(path.to_string()));
        };

        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AssetError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mime = mime_guess::from_path(&file).first_or_octet_stream();
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime.as_ref())
            .header(header::CACHE_CONTROL, ASSET_CACHE)
            .body(Body::from(bytes))
            .expect("static response"))
    }

    async fn serve_shell(&self) -> Result<Response<Body>, AssetError> {
        let file = self.root.join(SHELL);
        let html = match tokio::fs::read_to_string(&file).await {
            Ok(html) => html,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AssetError::NotFound(format!("/{SHELL}")));
            }
            Err(e) => return Err(e.into()),
        };

        let mut rendered = html;
        for (token, value) in &self.substitutions {
            rendered = rendered.replace(token, value);
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(header::CACHE_CONTROL, SHELL_CACHE)
            .body(Body::from(rendered))
            .expect("shell response"))
    }

    /// Map a URL path to a file under the document root. Anything that is
    /// not a plain relative path (traversal, absolute components) does not
    /// resolve.
    fn resolve(&self, trimmed: &str) -> Option<PathBuf> {
        let rel = Path::new(trimmed);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            warn!(path = %trimmed, "rejected non-normal asset path");
            return None;
        }
        Some(self.root.join(rel))
    }
}
