//! Gateway error taxonomy.
//!
//! A closed set of error kinds, each with an HTTP status for the front door
//! and a fatality flag for the startup path. Handlers report failures
//! in-band over the session; only startup and listener errors abort the
//! process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or disallowed HTTP request (bad method, bad upgrade,
    /// unparseable query parameters).
    #[error("bad request: {0}")]
    ClientRequest(String),

    /// Requested static resource does not exist.
    #[error("not found: {0}")]
    ResourceNotFound(String),

    /// Resumption for an unknown or expired token, or a fresh connect
    /// colliding with an already-attached session.
    #[error("session conflict: {0}")]
    SessionConflict(String),

    /// Unknown channel name or a handler-reported failure. Reported back
    /// over the session; never closes the transport.
    #[error("channel '{channel}' dispatch failed: {message}")]
    ChannelDispatch { channel: String, message: String },

    /// Socket-level failure on a live transport. The session survives and
    /// stays resumable for the grace window.
    #[error("transport failure: {0}")]
    TransportFatal(String),

    /// Invalid process configuration detected before the listener starts.
    #[error("invalid configuration: {0}")]
    StartupConfiguration(String),

    /// The listening socket itself failed.
    #[error("listener failure: {0}")]
    ServerBind(#[source] std::io::Error),
}

impl GatewayError {
    /// HTTP status surfaced when this error terminates a request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClientRequest(_) => StatusCode::BAD_REQUEST,
            Self::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionConflict(_) => StatusCode::CONFLICT,
            Self::ChannelDispatch { .. } => StatusCode::BAD_REQUEST,
            Self::TransportFatal(_)
            | Self::StartupConfiguration(_)
            | Self::ServerBind(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that must terminate the process with a non-zero status.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StartupConfiguration(_) | Self::ServerBind(_))
    }

    /// Convenience constructor for handler-reported channel failures.
    pub fn dispatch(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelDispatch {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
