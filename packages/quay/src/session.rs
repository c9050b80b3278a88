//! Logical session state.
//!
//! A session outlives any single transport connection: while a transport is
//! attached, frames flow straight through it; while the session is parked
//! (transport dropped, resumption pending) outbound frames land in a
//! bounded outbox that is flushed on the next attach. Overflow drops the
//! oldest frames and the flush announces the gap before delivering the
//! survivors.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::ws::protocol::ConnectionType;
use crate::ws::transport::{OutboundFrame, TransportHandle};

/// Registry identity: token uniqueness is scoped per connection type, so
/// identical tokens under different types are unrelated sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kind: ConnectionType,
    pub token: String,
}

/// Proof of which attach generation a transport belongs to. A superseded
/// transport holds a stale ticket, so its attach and detach calls are
/// rejected instead of clobbering the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachTicket {
    epoch: u64,
}

/// Result of flushing the outbox on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOutcome {
    /// Frames dropped by outbox overflow while the session was parked.
    pub lost: u64,
    /// Frames delivered from the outbox.
    pub flushed: usize,
}

enum Attachment {
    /// Parked: no transport, resumption allowed.
    Idle,
    /// A resolve succeeded and its upgrade is in flight.
    Claimed,
    /// A live transport is attached.
    Attached(TransportHandle),
}

struct SessionState {
    attachment: Attachment,
    epoch: u64,
    /// Set whenever no transport is attached; drives grace-window expiry.
    disconnected_at: Option<Instant>,
    outbox: VecDeque<OutboundFrame>,
    lost: u64,
}

pub struct Session {
    key: SessionKey,
    created_at: Instant,
    outbox_limit: usize,
    /// Outbound envelope sequence. Monotonic across reconnects.
    seq: AtomicU64,
    /// Channels this session has engaged; accumulates across reconnects.
    subscriptions: Mutex<HashSet<String>>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a session already claimed by the connection that caused it.
    /// Returns the ticket that connection must present to attach.
    pub fn new_claimed(key: SessionKey, outbox_limit: usize) -> (Self, AttachTicket) {
        let session = Self {
            key,
            created_at: Instant::now(),
            outbox_limit,
            seq: AtomicU64::new(0),
            subscriptions: Mutex::new(HashSet::new()),
            state: Mutex::new(SessionState {
                attachment: Attachment::Claimed,
                epoch: 1,
                disconnected_at: Some(Instant::now()),
                outbox: VecDeque::new(),
                lost: 0,
            }),
        };
        (session, AttachTicket { epoch: 1 })
    }

    pub fn kind(&self) -> ConnectionType {
        self.key.kind
    }

    pub fn token(&self) -> &str {
        &self.key.token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Record that a channel saw traffic from this session.
    pub fn subscribe(&self, channel: &str) {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .insert(channel.to_string());
    }

    /// Channels this session has engaged, in no particular order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Next outbound sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim the session for a new transport. `force` is the resumption
    /// path: it supersedes any live or in-flight transport, closing the old
    /// socket. Without `force` the claim only succeeds while parked.
    pub fn claim(&self, force: bool) -> Result<AttachTicket, ClaimRejected> {
        let mut state = self.state.lock().expect("session lock poisoned");
        match &state.attachment {
            Attachment::Idle => {}
            Attachment::Claimed | Attachment::Attached(_) if !force => {
                return Err(ClaimRejected);
            }
            Attachment::Claimed => {}
            Attachment::Attached(handle) => handle.close(),
        }
        state.attachment = Attachment::Claimed;
        state.epoch += 1;
        state.disconnected_at = Some(Instant::now());
        Ok(AttachTicket { epoch: state.epoch })
    }

    /// Install the transport for a claimed ticket and flush the outbox
    /// through it, in order: `greeting` first, then a gap notice (built by
    /// `lost_notice` when overflow dropped frames), then the buffered
    /// frames. Fails if a newer claim superseded the ticket.
    pub fn attach(
        &self,
        ticket: AttachTicket,
        handle: TransportHandle,
        greeting: Option<OutboundFrame>,
        lost_notice: impl FnOnce(u64) -> Option<OutboundFrame>,
    ) -> Result<AttachOutcome, ClaimRejected> {
        let mut state = self.state.lock().expect("session lock poisoned");
        if state.epoch != ticket.epoch {
            return Err(ClaimRejected);
        }

        if let Some(frame) = greeting {
            let _ = handle.send(frame);
        }
        let lost = std::mem::take(&mut state.lost);
        if lost > 0 {
            if let Some(frame) = lost_notice(lost) {
                let _ = handle.send(frame);
            }
        }
        let flushed = state.outbox.len();
        for frame in state.outbox.drain(..) {
            let _ = handle.send(frame);
        }

        state.attachment = Attachment::Attached(handle);
        state.disconnected_at = None;
        Ok(AttachOutcome { lost, flushed })
    }

    /// Park the session when its transport drops. A stale ticket (the
    /// transport was already superseded) is a no-op; returns whether the
    /// session actually moved to parked.
    pub fn detach(&self, ticket: AttachTicket) -> bool {
        let mut state = self.state.lock().expect("session lock poisoned");
        if state.epoch != ticket.epoch {
            return false;
        }
        state.attachment = Attachment::Idle;
        state.disconnected_at = Some(Instant::now());
        true
    }

    /// Deliver a frame through the attached transport, or buffer it while
    /// parked. Overflow drops the oldest buffered frame and counts it.
    pub fn send(&self, frame: OutboundFrame) {
        let mut state = self.state.lock().expect("session lock poisoned");
        let frame = match &state.attachment {
            Attachment::Attached(handle) => match handle.send(frame) {
                Ok(()) => return,
                // Writer already gone; buffer until detach catches up.
                Err(frame) => frame,
            },
            _ => frame,
        };

        if state.outbox.len() >= self.outbox_limit {
            state.outbox.pop_front();
            state.lost += 1;
        }
        state.outbox.push_back(frame);
    }

    pub fn is_attached(&self) -> bool {
        matches!(
            self.state.lock().expect("session lock poisoned").attachment,
            Attachment::Attached(_)
        )
    }

    /// How long the session has been without an attached transport, if it
    /// currently is.
    pub fn parked_for(&self) -> Option<Duration> {
        self.state
            .lock()
            .expect("session lock poisoned")
            .disconnected_at
            .map(|t| t.elapsed())
    }

    /// True when the grace window has elapsed without a resumption.
    pub fn expired(&self, grace: Duration) -> bool {
        self.parked_for().is_some_and(|parked| parked > grace)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.key.kind)
            .field("token", &self.key.token)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// The session is already owned by a live or in-flight transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRejected;
