//! Session registry: the authoritative map from (connection type, token)
//! to live sessions.
//!
//! All lifecycle transitions happen under one mutex, held without awaiting,
//! so concurrent claims on the same identity serialize and exactly one
//! transport wins. A dropped transport parks its session rather than
//! destroying it; parked sessions are destroyed lazily on the next resolve
//! or by the periodic sweep once the grace window elapses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::session::{AttachOutcome, AttachTicket, Session, SessionKey};
use crate::ws::protocol::ConnectionType;
use crate::ws::transport::{OutboundFrame, TransportHandle};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
    grace: Duration,
    outbox_limit: usize,
    metrics: Arc<GatewayMetrics>,
}

/// Outcome of a successful resolve: the session, the attach ticket the
/// winning transport must present, and whether the session is new.
pub struct Resolution {
    pub session: Arc<Session>,
    pub ticket: AttachTicket,
    pub is_new: bool,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("ticket", &self.ticket)
            .field("is_new", &self.is_new)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(grace: Duration, outbox_limit: usize, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            grace,
            outbox_limit,
            metrics,
        }
    }

    /// Resolve an upgrade to a session.
    ///
    /// - empty token: fresh session under a generated token; the caller
    ///   must hand the token back to the client.
    /// - known token, resumption: reattach, superseding any live transport.
    /// - known token, fresh connect: conflict while a transport is attached
    ///   or claimed; implicit resumption while parked.
    /// - unknown token, resumption: conflict (expired or never existed).
    /// - unknown token, fresh connect: fresh session under the client's
    ///   chosen token.
    pub fn resolve(
        &self,
        kind: ConnectionType,
        token: &str,
        is_resumption: bool,
    ) -> Result<Resolution, GatewayError> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");

        if token.is_empty() {
            let key = SessionKey {
                kind,
                token: Uuid::new_v4().to_string(),
            };
            return Ok(self.create_locked(&mut sessions, key));
        }

        let key = SessionKey {
            kind,
            token: token.to_string(),
        };

        // Lazy expiry: a session parked past the grace window is already
        // dead even if the sweep has not run yet.
        let expired = sessions.get(&key).is_some_and(|s| s.expired(self.grace));
        if expired {
            debug!(kind = %key.kind, token = %key.token, "session expired, evicting");
            sessions.remove(&key);
            self.metrics.sessions_evicted(1);
        }

        match sessions.get(&key) {
            Some(existing) => {
                let ticket = if is_resumption {
                    existing
                        .claim(true)
                        .expect("forced claim cannot be rejected")
                } else {
                    existing.claim(false).map_err(|_| {
                        self.metrics.session_conflict();
                        GatewayError::SessionConflict(format!(
                            "token already bound to a live {kind} session"
                        ))
                    })?
                };
                self.metrics.session_resumed();
                info!(kind = %kind, token = %key.token, "session resumed");
                Ok(Resolution {
                    session: Arc::clone(existing),
                    ticket,
                    is_new: false,
                })
            }
            None if is_resumption => {
                self.metrics.session_conflict();
                Err(GatewayError::SessionConflict(
                    "unknown or expired session token".into(),
                ))
            }
            None => Ok(self.create_locked(&mut sessions, key)),
        }
    }

    fn create_locked(
        &self,
        sessions: &mut HashMap<SessionKey, Arc<Session>>,
        key: SessionKey,
    ) -> Resolution {
        let (session, ticket) = Session::new_claimed(key.clone(), self.outbox_limit);
        let session = Arc::new(session);
        sessions.insert(key.clone(), Arc::clone(&session));
        self.metrics.session_created();
        info!(kind = %key.kind, token = %key.token, "session created");
        Resolution {
            session,
            ticket,
            is_new: true,
        }
    }

    /// Install a transport on a resolved session and flush anything that
    /// accumulated while it was parked. Fails when a newer claim superseded
    /// the ticket; the caller closes its socket.
    pub fn attach(
        &self,
        session: &Arc<Session>,
        ticket: AttachTicket,
        handle: TransportHandle,
        greeting: Option<OutboundFrame>,
        lost_notice: impl FnOnce(u64) -> Option<OutboundFrame>,
    ) -> Result<AttachOutcome, GatewayError> {
        let outcome = session
            .attach(ticket, handle, greeting, lost_notice)
            .map_err(|_| GatewayError::SessionConflict("superseded by a newer transport".into()))?;
        self.metrics.connection_opened();
        if outcome.lost > 0 {
            self.metrics.frames_dropped(outcome.lost);
        }
        Ok(outcome)
    }

    /// Park the session when its transport drops. Stale tickets (the
    /// transport was superseded) are ignored.
    pub fn detach(&self, session: &Arc<Session>, ticket: AttachTicket) {
        if session.detach(ticket) {
            debug!(kind = %session.kind(), token = %session.token(), "session parked");
        }
        self.metrics.connection_closed();
    }

    /// Destroy sessions parked past the grace window, discarding their
    /// buffered frames. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        let before = sessions.len();
        sessions.retain(|key, session| {
            let keep = !session.expired(self.grace);
            if !keep {
                info!(
                    kind = %key.kind,
                    token = %key.token,
                    age_secs = session.created_at().elapsed().as_secs(),
                    "session evicted"
                );
            }
            keep
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            self.metrics.sessions_evicted(evicted as u64);
        }
        evicted
    }

    /// Number of live (attached or parked) sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(grace: Duration) -> SessionRegistry {
        SessionRegistry::new(grace, 16, Arc::new(GatewayMetrics::new()))
    }

    const KIND: ConnectionType = ConnectionType::Management;

    fn attach_ok(reg: &SessionRegistry, res: &Resolution) -> TransportHandle {
        let (handle, _rx) = TransportHandle::test_pair();
        reg.attach(&res.session, res.ticket, handle.clone(), None, |_| None)
            .expect("attach");
        handle
    }

    #[test]
    fn empty_token_generates_fresh_nonempty_token() {
        let reg = registry(Duration::from_secs(30));
        let a = reg.resolve(KIND, "", false).unwrap();
        let b = reg.resolve(KIND, "", false).unwrap();

        assert!(a.is_new && b.is_new);
        assert!(!a.session.token().is_empty());
        assert_ne!(a.session.token(), b.session.token());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn resumption_reattaches_the_same_session() {
        let reg = registry(Duration::from_secs(30));
        let first = reg.resolve(KIND, "", false).unwrap();
        attach_ok(&reg, &first);
        let token = first.session.token().to_string();
        reg.detach(&first.session, first.ticket);

        let resumed = reg.resolve(KIND, &token, true).unwrap();
        assert!(!resumed.is_new);
        assert!(Arc::ptr_eq(&first.session, &resumed.session));
    }

    #[test]
    fn unknown_token_resumption_fails_and_creates_nothing() {
        let reg = registry(Duration::from_secs(30));
        let err = reg.resolve(KIND, "no-such-token", true).unwrap_err();
        assert!(matches!(err, GatewayError::SessionConflict(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn fresh_connect_conflicts_with_attached_session() {
        let reg = registry(Duration::from_secs(30));
        let first = reg.resolve(KIND, "tok", false).unwrap();
        attach_ok(&reg, &first);

        let err = reg.resolve(KIND, "tok", false).unwrap_err();
        assert!(matches!(err, GatewayError::SessionConflict(_)));
    }

    #[test]
    fn fresh_connect_implicitly_resumes_a_parked_session() {
        let reg = registry(Duration::from_secs(30));
        let first = reg.resolve(KIND, "tok", false).unwrap();
        attach_ok(&reg, &first);
        reg.detach(&first.session, first.ticket);

        let second = reg.resolve(KIND, "tok", false).unwrap();
        assert!(!second.is_new);
        assert!(Arc::ptr_eq(&first.session, &second.session));
    }

    #[test]
    fn resumption_supersedes_a_live_transport() {
        let reg = registry(Duration::from_secs(30));
        let first = reg.resolve(KIND, "tok", false).unwrap();
        attach_ok(&reg, &first);

        let second = reg.resolve(KIND, "tok", true).unwrap();
        assert!(Arc::ptr_eq(&first.session, &second.session));
        attach_ok(&reg, &second);

        // The superseded transport can no longer park the session.
        reg.detach(&first.session, first.ticket);
        assert!(first.session.is_attached());
    }

    #[test]
    fn same_token_under_other_kind_is_unrelated() {
        let reg = registry(Duration::from_secs(30));
        let mgmt = reg.resolve(ConnectionType::Management, "tok", false).unwrap();
        let term = reg.resolve(ConnectionType::Terminal, "tok", false).unwrap();
        assert!(mgmt.is_new && term.is_new);
        assert!(!Arc::ptr_eq(&mgmt.session, &term.session));
    }

    #[test]
    fn expired_session_is_unresolvable_and_swept() {
        let reg = registry(Duration::ZERO);
        let first = reg.resolve(KIND, "", false).unwrap();
        attach_ok(&reg, &first);
        let token = first.session.token().to_string();
        reg.detach(&first.session, first.ticket);
        std::thread::sleep(Duration::from_millis(2));

        // Grace window of zero: parked means expired.
        let err = reg.resolve(KIND, &token, true).unwrap_err();
        assert!(matches!(err, GatewayError::SessionConflict(_)));

        assert_eq!(reg.sweep_expired(), 0); // lazy expiry already removed it
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_only_evicts_parked_sessions() {
        let reg = registry(Duration::ZERO);
        let live = reg.resolve(KIND, "live", false).unwrap();
        attach_ok(&reg, &live);

        let parked = reg.resolve(KIND, "parked", false).unwrap();
        attach_ok(&reg, &parked);
        reg.detach(&parked.session, parked.ticket);
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(reg.sweep_expired(), 1);
        assert_eq!(reg.len(), 1);
        assert!(reg.resolve(KIND, "parked", true).is_err());
    }

    #[tokio::test]
    async fn concurrent_fresh_connects_have_exactly_one_winner() {
        let reg = Arc::new(registry(Duration::from_secs(30)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            tasks.push(tokio::spawn(async move {
                reg.resolve(KIND, "contended", false).and_then(|res| {
                    let (handle, _rx) = TransportHandle::test_pair();
                    reg.attach(&res.session, res.ticket, handle, None, |_| None)
                })
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(reg.len(), 1);
    }
}
