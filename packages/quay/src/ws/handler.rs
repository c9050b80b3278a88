//! Per-connection lifecycle: resolve → attach → pump → detach.
//!
//! The session is resolved against the registry before the upgrade
//! completes, so identity conflicts surface as HTTP failures instead of
//! half-open sockets. After the upgrade the connection is two tasks: the
//! writer spawned by the transport layer and this reader loop. Closing the
//! transport never destroys the session; it parks it for the grace window.

use axum::extract::ws::WebSocket;
use axum::extract::WebSocketUpgrade;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::registry::Resolution;
use crate::router::{ClientInfo, EventSink};
use crate::server::AppState;
use crate::session::Session;
use crate::ws::protocol::{
    decode_client_frame, encode_envelope, FrameKind, ServerMessage, UpgradeParams,
};
use crate::ws::transport::{self, Inbound, OutboundFrame};

/// Upgrade response header carrying the session token, so clients on raw
/// (unframed) transports learn generated tokens too.
pub const SESSION_HEADER: &str = "x-quay-session";

/// Resolve the session and complete the upgrade, or fail the request.
pub fn handle_upgrade(state: AppState, ws: WebSocketUpgrade, params: UpgradeParams) -> Response {
    let resolution = match state.registry.resolve(
        params.kind,
        &params.reconnection_token,
        params.reconnection,
    ) {
        Ok(resolution) => resolution,
        Err(err) => {
            warn!(kind = %params.kind, error = %err, "upgrade refused");
            return err.into_response();
        }
    };

    let token = resolution.session.token().to_string();
    let raw = params.skip_web_socket_frames;
    let mut response = ws.on_upgrade(move |socket| run_connection(state, socket, resolution, raw));
    if let Ok(value) = HeaderValue::from_str(&token) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn run_connection(state: AppState, socket: WebSocket, resolution: Resolution, raw: bool) {
    let Resolution {
        session,
        ticket,
        is_new,
    } = resolution;

    let (sink, mut stream) = socket.split();
    let (handle, writer) = transport::spawn_writer(sink);

    let client = ClientInfo {
        kind: session.kind(),
        token: session.token().to_string(),
        reconnected: !is_new,
    };

    let greeting = if raw {
        None
    } else {
        let welcome = ServerMessage::Welcome {
            session: client.token.clone(),
            kind: client.kind,
            reconnected: client.reconnected,
        };
        match encode_envelope(session.next_seq(), &welcome) {
            Ok(text) => Some(OutboundFrame::Text(text)),
            Err(e) => {
                error!(error = %e, "failed to encode welcome, dropping connection");
                handle.close();
                let _ = writer.await;
                return;
            }
        }
    };

    let notice_session = Arc::clone(&session);
    let attached = state.registry.attach(&session, ticket, handle.clone(), greeting, |lost| {
        encode_envelope(
            notice_session.next_seq(),
            &ServerMessage::Dropped { count: lost },
        )
        .ok()
        .map(OutboundFrame::Text)
    });

    match attached {
        Ok(outcome) if outcome.flushed > 0 || outcome.lost > 0 => {
            debug!(
                kind = %client.kind,
                token = %client.token,
                flushed = outcome.flushed,
                lost = outcome.lost,
                "outbox flushed on reattach"
            );
        }
        Ok(_) => {}
        Err(_) => {
            // A newer transport claimed the session while this upgrade was
            // in flight; this socket lost the race.
            debug!(kind = %client.kind, token = %client.token, "superseded before attach");
            handle.close();
            let _ = writer.await;
            return;
        }
    }

    info!(
        kind = %client.kind,
        token = %client.token,
        reconnected = client.reconnected,
        raw,
        "transport attached"
    );
    state
        .channels
        .client_attached(&client, &EventSink::new(Arc::clone(&session)))
        .await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(msg) => match transport::classify(msg) {
                Inbound::Payload(bytes) => {
                    state.metrics.frame_received();
                    if raw {
                        handle_raw_payload(&state, &client, &session, bytes).await;
                    } else {
                        handle_framed_payload(&state, &client, &session, &bytes).await;
                    }
                }
                Inbound::Closed => break,
                Inbound::Ignored => {}
            },
            Err(e) => {
                // Abnormal reset. The socket is gone but the session stays
                // resumable for the grace window.
                warn!(kind = %client.kind, token = %client.token, error = %e, "transport failed");
                break;
            }
        }
    }

    state.registry.detach(&session, ticket);
    handle.close();
    let _ = writer.await;
    debug!(kind = %client.kind, token = %client.token, "connection finished");
}

/// Decode and dispatch one multiplexed frame, reporting failures in-band.
async fn handle_framed_payload(
    state: &AppState,
    client: &ClientInfo,
    session: &Arc<Session>,
    bytes: &[u8],
) {
    let frame = match decode_client_frame(bytes) {
        Ok(frame) => frame,
        Err(err) => {
            send_message(state, session, &ServerMessage::from_error(None, None, &err));
            return;
        }
    };

    match state
        .channels
        .dispatch(client, &frame.channel, frame.payload)
        .await
    {
        Ok(reply) => {
            session.subscribe(&frame.channel);
            if frame.kind == FrameKind::Request {
                if let Some(id) = frame.id {
                    send_message(
                        state,
                        session,
                        &ServerMessage::Reply {
                            id,
                            channel: frame.channel,
                            payload: reply,
                        },
                    );
                }
            }
        }
        Err(err) => {
            send_message(
                state,
                session,
                &ServerMessage::from_error(frame.id, Some(frame.channel), &err),
            );
        }
    }
}

/// A raw transport is a dedicated pipe into the channel named after its
/// connection type. There is no error framing, so failures are logged and
/// the payload dropped.
async fn handle_raw_payload(
    state: &AppState,
    client: &ClientInfo,
    session: &Arc<Session>,
    bytes: Bytes,
) {
    let channel = client.kind.pipe_channel();
    let payload = json!({ "data": BASE64.encode(&bytes) });

    let result = state.channels.dispatch(client, channel, payload).await;
    if result.is_ok() {
        session.subscribe(channel);
    }
    match result {
        Ok(Value::Null) => {}
        Ok(Value::String(b64)) => match BASE64.decode(b64.as_bytes()) {
            Ok(reply) => {
                session.send(OutboundFrame::Binary(reply.into()));
                state.metrics.frame_sent();
            }
            Err(e) => warn!(channel, error = %e, "raw reply was not base64"),
        },
        Ok(_) => warn!(channel, "raw reply ignored (not a byte payload)"),
        Err(err) => warn!(channel, error = %err, "raw dispatch failed"),
    }
}

fn send_message(state: &AppState, session: &Session, msg: &ServerMessage) {
    match encode_envelope(session.next_seq(), msg) {
        Ok(text) => {
            session.send(OutboundFrame::Text(text));
            state.metrics.frame_sent();
        }
        Err(e) => error!(error = %e, "failed to encode outbound message"),
    }
}
