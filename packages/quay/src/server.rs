//! HTTP front door and serve loop.
//!
//! Every inbound request lands in one fallback handler that classifies it:
//! requests carrying an upgrade signal go to the WebSocket layer (after the
//! session registry accepts them), everything else is a static resource
//! fetch against the document root. Exactly one HTTP response is written
//! per request; on the upgrade path, socket ownership moves to the
//! connection handler instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::extract::Query;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::assets::{AssetError, AssetServer};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::registry::SessionRegistry;
use crate::router::ChannelRouter;
use crate::ws;
use crate::ws::protocol::UpgradeParams;

/// Span maker that adds a unique request id to each incoming request.
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<SessionRegistry>,
    pub channels: Arc<ChannelRouter>,
    pub assets: Arc<AssetServer>,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    pub fn new(config: GatewayConfig, channels: ChannelRouter) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(SessionRegistry::new(
            config.grace,
            config.outbox_limit,
            Arc::clone(&metrics),
        ));
        let assets = Arc::new(AssetServer::new(
            config.document_root.clone(),
            vec![(
                "%QUAY_VERSION%".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            )],
        ));
        Self {
            config: Arc::new(config),
            registry,
            channels: Arc::new(channels),
            assets,
            metrics,
        }
    }
}

/// Build the gateway router: one front door for everything.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(front_door)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Classify and answer one inbound request.
async fn front_door(State(state): State<AppState>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();

    if parts.headers.contains_key(header::UPGRADE) {
        // The extractor enforces the single supported upgrade protocol and
        // handshake headers; its rejection is a textual 4xx.
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return rejection.into_response(),
        };
        let params = match Query::<UpgradeParams>::try_from_uri(&parts.uri) {
            Ok(Query(params)) => params,
            Err(e) => {
                return GatewayError::ClientRequest(format!("bad upgrade parameters: {e}"))
                    .into_response();
            }
        };
        return ws::handle_upgrade(state, upgrade, params);
    }

    serve_asset(&state, &parts.method, &parts.uri).await
}

async fn serve_asset(state: &AppState, method: &Method, uri: &Uri) -> Response {
    if *method != Method::GET {
        return GatewayError::ClientRequest(format!("method {method} not allowed")).into_response();
    }

    match state.assets.serve(uri.path()).await {
        Ok(response) => response.into_response(),
        Err(AssetError::NotFound(path)) => GatewayError::ResourceNotFound(path).into_response(),
        Err(AssetError::Io(e)) => {
            error!(path = %uri.path(), error = %e, "asset read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

/// Bind the listener and run until ctrl-c. Binding failure is fatal.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", state.config.host, state.config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(GatewayError::ServerBind)?;
    let actual_addr = listener.local_addr().map_err(GatewayError::ServerBind)?;

    // Periodic expired-session sweep; resolve also expires lazily, this
    // bounds how long a dead session can hold its buffers.
    let sweep_registry = Arc::clone(&state.registry);
    let sweep_period = state.config.grace.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_period);
        loop {
            interval.tick().await;
            let evicted = sweep_registry.sweep_expired();
            if evicted > 0 {
                info!(evicted, "swept expired sessions");
            }
        }
    });

    info!("Quay listening on http://{}", actual_addr);
    info!(
        channels = ?state.channels.names(),
        grace_secs = state.config.grace.as_secs(),
        "gateway ready"
    );

    let metrics = Arc::clone(&state.metrics);
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
        info!("received shutdown signal");
    };

    axum::serve(listener, build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")?;

    let snapshot = metrics.snapshot();
    info!(
        snapshot = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "final metrics"
    );
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::EnvironmentChannel;
    use crate::ws::SESSION_HEADER;
    use axum::body::Body;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
    use tower::ServiceExt;

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_state(root: &std::path::Path, grace: Duration) -> AppState {
        let config = GatewayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            document_root: root.to_path_buf(),
            workspace_root: root.to_path_buf(),
            grace,
            outbox_limit: 16,
        };
        let channels = ChannelRouter::builder()
            .register("environment", Arc::new(EnvironmentChannel::new()))
            .unwrap()
            .build();
        AppState::new(config, channels)
    }

    async fn start(grace: Duration) -> (SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>%QUAY_VERSION%</html>").unwrap();
        let state = test_state(dir.path(), grace);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        (addr, dir)
    }

    async fn connect(addr: SocketAddr, query: &str) -> Result<(Client, Option<String>), WsError> {
        let (stream, response) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/?{query}")).await?;
        let token = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok((stream, token))
    }

    async fn next_envelope(client: &mut Client) -> Value {
        loop {
            match client.next().await.expect("stream ended").expect("ws error") {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    async fn send_frame(client: &mut Client, frame: Value) {
        client
            .send(WsMessage::text(frame.to_string()))
            .await
            .unwrap();
    }

    // ---- static surface ----

    #[tokio::test]
    async fn shell_is_served_with_substitution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>%QUAY_VERSION%</html>").unwrap();
        let app = build_router(test_state(dir.path(), Duration::from_secs(30)));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn missing_asset_is_404_and_non_get_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), Duration::from_secs(30)));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/missing.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // ---- connection lifecycle ----

    #[tokio::test]
    async fn fresh_connect_welcomes_with_generated_token() {
        let (addr, _dir) = start(Duration::from_secs(30)).await;
        let (mut client, header_token) = connect(addr, "type=management").await.unwrap();

        let welcome = next_envelope(&mut client).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["data"]["reconnected"], false);

        let token = welcome["data"]["session"].as_str().unwrap().to_string();
        assert!(!token.is_empty());
        assert_eq!(header_token.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (addr, _dir) = start(Duration::from_secs(30)).await;
        let (mut client, _) = connect(addr, "").await.unwrap();
        let _welcome = next_envelope(&mut client).await;

        send_frame(&mut client, json!({"channel": "environment", "id": 7})).await;
        let reply = next_envelope(&mut client).await;
        assert_eq!(reply["type"], "reply");
        assert_eq!(reply["data"]["id"], 7);
        assert_eq!(reply["data"]["payload"]["os"], std::env::consts::OS);
    }

    #[tokio::test]
    async fn unknown_channel_reports_error_without_closing() {
        let (addr, _dir) = start(Duration::from_secs(30)).await;
        let (mut client, _) = connect(addr, "").await.unwrap();
        let _welcome = next_envelope(&mut client).await;

        send_frame(&mut client, json!({"channel": "nope", "id": 1})).await;
        let error = next_envelope(&mut client).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["data"]["channel"], "nope");

        // The transport survived the failure.
        send_frame(&mut client, json!({"channel": "environment", "id": 2})).await;
        let reply = next_envelope(&mut client).await;
        assert_eq!(reply["type"], "reply");
    }

    #[tokio::test]
    async fn reconnect_resumes_the_same_session() {
        let (addr, _dir) = start(Duration::from_secs(30)).await;

        let (mut client, _) = connect(addr, "").await.unwrap();
        let welcome = next_envelope(&mut client).await;
        let token = welcome["data"]["session"].as_str().unwrap().to_string();
        drop(client);

        let (mut client, _) = connect(
            addr,
            &format!("reconnectionToken={token}&reconnection=true"),
        )
        .await
        .unwrap();
        let welcome = next_envelope(&mut client).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["data"]["session"], token.as_str());
        assert_eq!(welcome["data"]["reconnected"], true);
    }

    #[tokio::test]
    async fn unknown_token_resumption_is_refused() {
        let (addr, _dir) = start(Duration::from_secs(30)).await;

        let result = connect(addr, "reconnectionToken=fabricated&reconnection=true").await;
        match result {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::CONFLICT);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected the upgrade to be refused"),
        }
    }

    #[tokio::test]
    async fn raw_mode_reports_token_in_header_only() {
        let (addr, _dir) = start(Duration::from_secs(30)).await;
        let (mut client, token) = connect(addr, "skipWebSocketFrames=true").await.unwrap();
        assert!(token.is_some_and(|t| !t.is_empty()));

        // No welcome envelope arrives on a raw transport.
        let raced = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
        assert!(raced.is_err(), "raw transport should stay silent");
    }

    #[tokio::test]
    async fn expired_session_cannot_resume() {
        let (addr, _dir) = start(Duration::ZERO).await;

        let (mut client, _) = connect(addr, "").await.unwrap();
        let welcome = next_envelope(&mut client).await;
        let token = welcome["data"]["session"].as_str().unwrap().to_string();
        drop(client);

        // Zero grace: parked means expired immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = connect(
            addr,
            &format!("reconnectionToken={token}&reconnection=true"),
        )
        .await;
        match result {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::CONFLICT);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected the upgrade to be refused"),
        }
    }
}
