//! Gateway configuration.
//!
//! Three equivalent ways to configure, layered by figment:
//!
//!   config.toml:     [session]
//!                    grace_secs = 60
//!
//!   env var:         QUAY_SESSION__GRACE_SECS=60   (double underscore = nesting)
//!
//!   CLI flags:       highest priority, applied to the resolved view.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Server knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Document root for static assets and the application shell.
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,
    /// Root the file-system channel serves from.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            document_root: default_document_root(),
            workspace_root: default_workspace_root(),
        }
    }
}

/// Session lifecycle knobs (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// How long a disconnected session stays resumable.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Outbound frames buffered per parked session before the oldest are
    /// dropped.
    #[serde(default = "default_outbox_limit")]
    pub outbox_limit: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
            outbox_limit: default_outbox_limit(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_document_root() -> PathBuf {
    PathBuf::from("public")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_grace_secs() -> u64 {
    30
}

fn default_outbox_limit() -> usize {
    256
}

/// Build a figment layering: defaults → config.toml → QUAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `QUAY_SESSION__GRACE_SECS=60`  →  `session.grace_secs = 60`
///   `QUAY_SERVER__PORT=8443`       →  `server.port = 8443`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("QUAY_").split("__"))
}

/// Resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub document_root: PathBuf,
    pub workspace_root: PathBuf,
    pub grace: Duration,
    pub outbox_limit: usize,
}

impl GatewayConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            document_root: fc.server.document_root.clone(),
            workspace_root: fc.server.workspace_root.clone(),
            grace: Duration::from_secs(fc.session.grace_secs),
            outbox_limit: fc.session.outbox_limit.max(1),
        }
    }

    /// Reject configurations the process cannot serve with. Runs before
    /// the listener binds; failures are fatal.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !self.document_root.is_dir() {
            return Err(GatewayError::StartupConfiguration(format!(
                "document root '{}' is not a directory",
                self.document_root.display()
            )));
        }
        if !self.workspace_root.is_dir() {
            return Err(GatewayError::StartupConfiguration(format!(
                "workspace root '{}' is not a directory",
                self.workspace_root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::{
        Figment,
        providers::{Format, Serialized, Toml},
    };

    #[test]
    fn defaults() {
        let fc: FileConfig = Figment::from(Serialized::defaults(FileConfig::default()))
            .extract()
            .unwrap();
        let config = GatewayConfig::from_file(&fc);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 0);
        assert_eq!(config.grace, Duration::from_secs(30));
        assert_eq!(config.outbox_limit, 256);
    }

    #[test]
    fn toml_overrides_defaults() {
        let fc: FileConfig = Figment::from(Serialized::defaults(FileConfig::default()))
            .merge(Toml::string(
                r#"
                [server]
                port = 9321

                [session]
                grace_secs = 5
                outbox_limit = 4
                "#,
            ))
            .extract()
            .unwrap();
        let config = GatewayConfig::from_file(&fc);
        assert_eq!(config.port, 9321);
        assert_eq!(config.grace, Duration::from_secs(5));
        assert_eq!(config.outbox_limit, 4);
    }

    #[test]
    fn missing_document_root_is_a_startup_error() {
        let config = GatewayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            document_root: PathBuf::from("/definitely/not/here"),
            workspace_root: PathBuf::from("."),
            grace: Duration::from_secs(30),
            outbox_limit: 16,
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            GatewayError::StartupConfiguration(_)
        ));
    }
}
