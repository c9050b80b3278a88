//! Transport plumbing for one upgraded connection.
//!
//! The HTTP-to-WebSocket handshake itself is performed by the server's
//! upgrade machinery; this module owns everything after it: a writer task
//! draining outbound frames onto the socket, and the decode step that turns
//! raw WebSocket messages into protocol frames. Message boundaries are the
//! frame boundaries, so consumers never see partial frames.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One outbound unit: envelope text in framed mode, opaque bytes in raw
/// mode. Pre-encoded so parked sessions can buffer it as-is.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

pub(crate) enum WriterCommand {
    Frame(OutboundFrame),
    Close,
}

/// Cheap, cloneable grip on a live transport's writer task. Dropping every
/// handle (or sending `Close`) ends the task and closes the socket.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl TransportHandle {
    /// Queue a frame for the socket. Fails once the writer task has exited,
    /// which callers treat as "transport already gone".
    pub fn send(&self, frame: OutboundFrame) -> Result<(), OutboundFrame> {
        self.tx.send(WriterCommand::Frame(frame)).map_err(|e| {
            match e.0 {
                WriterCommand::Frame(frame) => frame,
                WriterCommand::Close => unreachable!("close is never returned"),
            }
        })
    }

    /// Ask the writer task to close the socket. Used when a newer transport
    /// supersedes this one; the superseded reader loop then sees the close
    /// and winds down on its own.
    pub fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close);
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").finish()
    }
}

#[cfg(test)]
impl TransportHandle {
    /// Handle backed by a bare channel, plus its receiving end, so tests
    /// can observe writes without a socket.
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<WriterCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Spawn the writer task for an upgraded socket's sink half.
pub fn spawn_writer(mut sink: SplitSink<WebSocket, Message>) -> (TransportHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();

    let task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCommand::Frame(OutboundFrame::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                WriterCommand::Frame(OutboundFrame::Binary(bytes)) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                WriterCommand::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
        debug!("transport writer finished");
    });

    (TransportHandle { tx }, task)
}

/// What one inbound WebSocket message decodes to.
#[derive(Debug)]
pub enum Inbound {
    /// A payload to hand to the dispatch layer (envelope text or raw bytes;
    /// the connection's mode decides how it is interpreted).
    Payload(Bytes),
    /// Remote closed cleanly.
    Closed,
    /// Control frame or other message to ignore.
    Ignored,
}

/// Classify one WebSocket message. Ping/pong are handled by the protocol
/// layer underneath and only ever show up here as `Ignored`.
pub fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Text(text) => Inbound::Payload(Bytes::from(text.as_bytes().to_vec())),
        Message::Binary(bytes) => Inbound::Payload(bytes),
        Message::Close(_) => Inbound::Closed,
        Message::Ping(_) | Message::Pong(_) => Inbound::Ignored,
    }
}
