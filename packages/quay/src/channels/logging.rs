//! Runtime log-level control channel.
//!
//! The gateway installs its env-filter behind a reload layer; this channel
//! holds the reload handle and swaps the filter on request.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::router::{ChannelHandler, ClientInfo};

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Debug, Deserialize)]
struct LogLevelRequest {
    /// New filter directive, e.g. `debug` or `quay=trace,info`. Absent
    /// means "report the current one".
    #[serde(default)]
    level: Option<String>,
}

pub struct LogLevelChannel {
    handle: FilterHandle,
    current: Mutex<String>,
}

impl LogLevelChannel {
    pub fn new(handle: FilterHandle, initial: String) -> Self {
        Self {
            handle,
            current: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl ChannelHandler for LogLevelChannel {
    async fn handle(&self, _client: &ClientInfo, payload: Value) -> anyhow::Result<Value> {
        let request: LogLevelRequest = serde_json::from_value(payload)?;

        if let Some(level) = request.level {
            let filter = EnvFilter::try_new(&level)
                .map_err(|e| anyhow::anyhow!("invalid filter directive '{level}': {e}"))?;
            self.handle
                .reload(filter)
                .map_err(|e| anyhow::anyhow!("filter reload failed: {e}"))?;
            info!(%level, "log filter changed");
            *self.current.lock().expect("level lock poisoned") = level;
        }

        let current = self.current.lock().expect("level lock poisoned").clone();
        Ok(json!({ "level": current }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::ConnectionType;

    fn channel() -> LogLevelChannel {
        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        // In production the layer is moved into the global subscriber via
        // `.init()`, which keeps its Arc alive for the process lifetime so the
        // reload handle's Weak always upgrades. A test helper can't call
        // `.init()` (parallel tests would each try to set the global default),
        // so keep the layer alive the same way by leaking it.
        std::mem::forget(layer);
        LogLevelChannel::new(handle, "info".into())
    }

    fn client() -> ClientInfo {
        ClientInfo {
            kind: ConnectionType::Management,
            token: "t".into(),
            reconnected: false,
        }
    }

    #[tokio::test]
    async fn reports_current_level_without_a_change() {
        let reply = channel().handle(&client(), Value::Null).await.unwrap();
        assert_eq!(reply["level"], "info");
    }

    #[tokio::test]
    async fn applies_a_new_directive() {
        let channel = channel();
        let reply = channel
            .handle(&client(), json!({"level": "debug"}))
            .await
            .unwrap();
        assert_eq!(reply["level"], "debug");
    }

    #[tokio::test]
    async fn rejects_an_invalid_directive() {
        let err = channel()
            .handle(&client(), json!({"level": "quay=notalevel"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid filter directive"));
    }
}
