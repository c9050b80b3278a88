//! Host environment reporting channel.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::router::{ChannelHandler, ClientInfo};

pub struct EnvironmentChannel {
    started: Instant,
}

impl EnvironmentChannel {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for EnvironmentChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelHandler for EnvironmentChannel {
    async fn handle(&self, client: &ClientInfo, _payload: Value) -> anyhow::Result<Value> {
        Ok(json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "connection": client.kind.pipe_channel(),
        }))
    }
}
