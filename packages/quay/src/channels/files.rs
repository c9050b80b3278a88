//! Read-only file-system access channel.
//!
//! Serves directory listings, stat results, and file contents from a
//! configured workspace root. Content crosses the JSON boundary
//! base64-encoded.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::router::{ChannelHandler, ClientInfo};

/// Refuse to inline files larger than this into a reply.
const MAX_READ_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum FilesRequest {
    List {
        #[serde(default = "default_path")]
        path: String,
    },
    Stat {
        path: String,
    },
    Read {
        path: String,
    },
}

fn default_path() -> String {
    ".".to_string()
}

pub struct FilesChannel {
    root: PathBuf,
}

impl FilesChannel {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a request path to a file under the root. Only plain relative
    /// paths resolve; `.` means the root itself.
    fn resolve(&self, raw: &str) -> anyhow::Result<PathBuf> {
        if raw == "." || raw.is_empty() {
            return Ok(self.root.clone());
        }
        let rel = Path::new(raw);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("invalid path '{raw}'");
        }
        Ok(self.root.join(rel))
    }

    async fn list(&self, path: &str) -> anyhow::Result<Value> {
        let dir = self.resolve(path)?;
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "kind": kind_of(&meta),
                "size": meta.len(),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(json!({ "path": path, "entries": entries }))
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Value> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target).await?;
        let modified_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Ok(json!({
            "path": path,
            "kind": kind_of(&meta),
            "size": meta.len(),
            "modified_secs": modified_secs,
        }))
    }

    async fn read(&self, path: &str) -> anyhow::Result<Value> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target).await?;
        if !meta.is_file() {
            anyhow::bail!("'{path}' is not a file");
        }
        if meta.len() > MAX_READ_BYTES {
            anyhow::bail!("'{path}' is too large ({} bytes)", meta.len());
        }
        let bytes = tokio::fs::read(&target).await?;
        Ok(json!({
            "path": path,
            "size": bytes.len(),
            "data": BASE64.encode(&bytes),
        }))
    }
}

fn kind_of(meta: &std::fs::Metadata) -> &'static str {
    if meta.is_dir() {
        "dir"
    } else if meta.is_file() {
        "file"
    } else {
        "other"
    }
}

#[async_trait]
impl ChannelHandler for FilesChannel {
    async fn handle(&self, _client: &ClientInfo, payload: Value) -> anyhow::Result<Value> {
        let request: FilesRequest = serde_json::from_value(payload)?;
        match request {
            FilesRequest::List { path } => self.list(&path).await,
            FilesRequest::Stat { path } => self.stat(&path).await,
            FilesRequest::Read { path } => self.read(&path).await,
        }
    }
}
