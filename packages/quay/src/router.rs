//! Channel router: named service handlers multiplexed over a session.
//!
//! The channel table is built once at startup and immutable afterwards, so
//! steady-state dispatch reads it without locking. Handler failures are
//! reported back over the session; they never terminate the transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::GatewayError;
use crate::session::Session;
use crate::ws::protocol::{encode_envelope, ConnectionType, ServerMessage};
use crate::ws::transport::OutboundFrame;

/// Identity a handler gets for every interaction, enough to key and
/// rehydrate per-session state across reconnects.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub kind: ConnectionType,
    pub token: String,
    /// False on the first connect of a session, true on every resumption.
    pub reconnected: bool,
}

/// A handler's way to push out-of-band events to one session. Events for a
/// parked session are buffered (bounded, oldest dropped) until resumption.
#[derive(Clone)]
pub struct EventSink {
    session: Arc<Session>,
}

impl EventSink {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Deliver an event envelope to the client, now or after resumption.
    pub fn event(&self, channel: &str, payload: Value) {
        self.session.subscribe(channel);
        match encode_envelope(
            self.session.next_seq(),
            &ServerMessage::Event {
                channel: channel.to_string(),
                payload,
            },
        ) {
            Ok(text) => self.session.send(OutboundFrame::Text(text)),
            Err(e) => warn!(channel, error = %e, "failed to encode event"),
        }
    }
}

/// A named service endpoint.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Invoked once per (re)connect of a session, before any dispatch.
    /// Failures are logged and isolated; other handlers still get the
    /// notification. The sink stays valid for the session's lifetime, so
    /// handlers may keep it to emit events later.
    async fn client_attached(&self, client: &ClientInfo, events: &EventSink) -> anyhow::Result<()> {
        let _ = (client, events);
        Ok(())
    }

    /// Handle one inbound payload and produce the reply payload.
    async fn handle(&self, client: &ClientInfo, payload: Value) -> anyhow::Result<Value>;
}

pub struct ChannelRouter {
    /// Ordered so attach notifications visit handlers deterministically.
    channels: BTreeMap<String, Arc<dyn ChannelHandler>>,
}

/// Fallible startup-time construction; duplicate names are a
/// configuration error, not a runtime condition.
#[derive(Default)]
pub struct ChannelRouterBuilder {
    channels: BTreeMap<String, Arc<dyn ChannelHandler>>,
}

impl std::fmt::Debug for ChannelRouterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRouterBuilder")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ChannelRouterBuilder {
    pub fn register(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Self, GatewayError> {
        let name = name.into();
        if self.channels.contains_key(&name) {
            return Err(GatewayError::StartupConfiguration(format!(
                "channel '{name}' registered twice"
            )));
        }
        self.channels.insert(name, handler);
        Ok(self)
    }

    pub fn build(self) -> ChannelRouter {
        ChannelRouter {
            channels: self.channels,
        }
    }
}

impl ChannelRouter {
    pub fn builder() -> ChannelRouterBuilder {
        ChannelRouterBuilder::default()
    }

    /// Registered channel names, in notification order.
    pub fn names(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    /// Notify every handler that a client (re)connected. One handler's
    /// failure does not stop the others.
    pub async fn client_attached(&self, client: &ClientInfo, events: &EventSink) {
        for (name, handler) in &self.channels {
            if let Err(e) = handler.client_attached(client, events).await {
                warn!(channel = %name, error = %e, "client-attached hook failed");
            }
        }
    }

    /// Route one payload to its handler by channel name.
    pub async fn dispatch(
        &self,
        client: &ClientInfo,
        channel: &str,
        payload: Value,
    ) -> Result<Value, GatewayError> {
        let handler = self
            .channels
            .get(channel)
            .ok_or_else(|| GatewayError::dispatch(channel, "no such channel"))?;
        handler
            .handle(client, payload)
            .await
            .map_err(|e| GatewayError::dispatch(channel, e.to_string()))
    }
}
