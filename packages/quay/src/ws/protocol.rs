//! Wire protocol for the multiplexed gateway connection.
//!
//! Outbound envelope: `{ "v": 1, "seq": N, "type": "...", "data": {...} }`
//! Inbound frames carry `(channel, kind, payload)` plus an optional request
//! id for reply correlation. Raw-mode transports bypass all of this and
//! exchange opaque bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Protocol version stamped on every outbound envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Classes of logical sessions that are never cross-matched. A resumption
/// token only identifies a session within its own connection type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    #[default]
    Management,
    ExtensionHost,
    Terminal,
}

impl ConnectionType {
    /// Channel a raw (unframed) transport of this type feeds into.
    pub fn pipe_channel(self) -> &'static str {
        match self {
            Self::Management => "management",
            Self::ExtensionHost => "extension-host",
            Self::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.pipe_channel())
    }
}

/// Query parameters recognized on the upgrade URL, with explicit defaults.
///
/// `reconnectionToken` empty means "assign me a new session".
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeParams {
    #[serde(rename = "type", default)]
    pub kind: ConnectionType,
    #[serde(default)]
    pub reconnection_token: String,
    #[serde(default)]
    pub reconnection: bool,
    #[serde(default)]
    pub skip_web_socket_frames: bool,
}

/// Whether an inbound frame expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    #[default]
    Request,
    Event,
}

/// One multiplexed frame from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Target channel name.
    pub channel: String,
    #[serde(default)]
    pub kind: FrameKind,
    /// Correlation id echoed on the reply. Requests without an id get no
    /// reply envelope (fire-and-forget request).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

/// Messages from the gateway to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First envelope on every framed connection: the session identity the
    /// client must present to resume after a transport drop.
    Welcome {
        session: String,
        kind: ConnectionType,
        reconnected: bool,
    },
    /// Reply to a request frame.
    Reply {
        id: u64,
        channel: String,
        payload: Value,
    },
    /// Out-of-band event produced by a channel handler.
    Event { channel: String, payload: Value },
    /// Buffered messages were dropped while the session was parked; the
    /// stream has a gap of `count` envelopes before this point.
    Dropped { count: u64 },
    /// A recoverable failure, reported without closing the transport.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        code: u16,
        message: String,
    },
}

impl ServerMessage {
    /// Build an error message from a gateway error, preserving its status
    /// code for the client.
    pub fn from_error(id: Option<u64>, channel: Option<String>, err: &GatewayError) -> Self {
        Self::Error {
            id,
            channel,
            code: err.status().as_u16(),
            message: err.to_string(),
        }
    }
}

/// Wire envelope wrapping every outbound framed message.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version (currently 1).
    pub v: u32,
    /// Monotonically increasing per-session sequence number. Survives
    /// reconnects, so a client can detect replayed or missing envelopes.
    pub seq: u64,
    /// Message type tag (matches the serde `type` field in `data`).
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: Value,
}

/// Serialize a server message into envelope text for the wire or for the
/// parked-session outbox.
pub fn encode_envelope(seq: u64, msg: &ServerMessage) -> Result<String, GatewayError> {
    let data = serde_json::to_value(msg)
        .map_err(|e| GatewayError::TransportFatal(format!("encode failed: {e}")))?;
    let msg_type = data
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        seq,
        msg_type,
        data,
    };

    serde_json::to_string(&envelope)
        .map_err(|e| GatewayError::TransportFatal(format!("encode failed: {e}")))
}

/// Parse one inbound framed message.
pub fn decode_client_frame(bytes: &[u8]) -> Result<ClientFrame, GatewayError> {
    serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::ClientRequest(format!("invalid frame: {e}")))
}
