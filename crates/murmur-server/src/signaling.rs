//! Call signaling relay.
//!
//! Offer, answer, ICE, reject and hangup payloads are opaque: the relay
//! reads only the `to` field, stamps `from` with the sender's identity and
//! forwards the event to the target's personal room. Alongside relaying it
//! tracks one session per ordered (caller, callee) pair so a disconnect
//! can synthesize a hangup for the party left behind.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use murmur_shared::protocol::{ServerEvent, SignalKind};
use murmur_shared::types::UserId;

use crate::error::ServerError;
use crate::gateway::{ConnectionId, Gateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Offer relayed, no answer yet.
    Ringing,
    /// Answer relayed.
    Active,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub caller: UserId,
    pub callee: UserId,
    pub state: CallState,
    /// Connection the offer came from.
    pub caller_conn: ConnectionId,
    /// Connection the answer came from.
    pub callee_conn: Option<ConnectionId>,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    fn involves_conn(&self, conn: ConnectionId) -> bool {
        self.caller_conn == conn || self.callee_conn == Some(conn)
    }

    /// The other party of a session `conn` belonged to.
    fn peer_of_conn(&self, conn: ConnectionId) -> (&UserId, &UserId) {
        if self.caller_conn == conn {
            (&self.caller, &self.callee)
        } else {
            (&self.callee, &self.caller)
        }
    }
}

type SessionKey = (UserId, UserId);

#[derive(Clone)]
pub struct SignalingRelay {
    gateway: Gateway,
    sessions: Arc<Mutex<HashMap<SessionKey, CallSession>>>,
    strict: bool,
}

impl SignalingRelay {
    /// With `strict`, answer/reject/ICE events matching no session are
    /// dropped and reported to the sender instead of relayed.
    pub fn new(gateway: Gateway, strict: bool) -> Self {
        Self {
            gateway,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            strict,
        }
    }

    /// Relay one call-control event from `from` (on connection `conn`).
    /// Returns how many of the target's connections accepted it.
    pub async fn handle(
        &self,
        from: &UserId,
        conn: ConnectionId,
        kind: SignalKind,
        mut payload: Value,
    ) -> Result<usize, ServerError> {
        let to = target_of(&payload)?;
        if &to == from {
            return Err(ServerError::InvalidSignalingPayload(
                "cannot signal yourself".into(),
            ));
        }

        let tracked = self.apply(from, &to, conn, kind).await;
        if !tracked {
            if self.strict {
                return Err(ServerError::InvalidSignalingPayload(format!(
                    "no call in progress with {to}"
                )));
            }
            warn!(
                from = %from,
                to = %to,
                event = kind.event_name(),
                "Relaying signal for untracked call"
            );
        }

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("from".into(), json!(from));
        }

        let delivered = self
            .gateway
            .publish_to_user(&to, ServerEvent::signal(kind, payload))
            .await;
        if delivered == 0 {
            debug!(to = %to, event = kind.event_name(), "Signal target offline");
        }
        Ok(delivered)
    }

    /// Update the session table. Returns `false` for a ghost event.
    async fn apply(&self, from: &UserId, to: &UserId, conn: ConnectionId, kind: SignalKind) -> bool {
        let mut sessions = self.sessions.lock().await;
        // Key of a call placed by `to` and now being handled by `from`.
        let incoming = (to.clone(), from.clone());

        match kind {
            SignalKind::Offer => {
                if sessions.contains_key(&incoming) {
                    debug!(a = %from, b = %to, "Both parties offered, tracking both");
                }
                let previous = sessions.insert(
                    (from.clone(), to.clone()),
                    CallSession {
                        caller: from.clone(),
                        callee: to.clone(),
                        state: CallState::Ringing,
                        caller_conn: conn,
                        callee_conn: None,
                        started_at: Utc::now(),
                    },
                );
                if previous.is_some() {
                    debug!(caller = %from, callee = %to, "Offer replaces pending call");
                } else {
                    info!(caller = %from, callee = %to, "Call ringing");
                }
                true
            }
            SignalKind::Answer => match sessions.get_mut(&incoming) {
                Some(session) => {
                    if session.state == CallState::Ringing {
                        session.state = CallState::Active;
                        session.callee_conn = Some(conn);
                        info!(caller = %to, callee = %from, "Call active");
                    }
                    true
                }
                None => false,
            },
            SignalKind::Reject => {
                let removed = sessions.remove(&incoming).is_some();
                if removed {
                    info!(caller = %to, callee = %from, "Call rejected");
                }
                removed
            }
            SignalKind::Hangup => {
                let outgoing = sessions.remove(&(from.clone(), to.clone()));
                let incoming = sessions.remove(&incoming);
                for session in outgoing.iter().chain(incoming.iter()) {
                    info!(
                        by = %from,
                        peer = %to,
                        answered = session.state == CallState::Active,
                        secs = (Utc::now() - session.started_at).num_seconds(),
                        "Call ended"
                    );
                }
                // Ending something that is already over is harmless.
                true
            }
            SignalKind::IceCandidate => {
                sessions.contains_key(&incoming)
                    || sessions.contains_key(&(from.clone(), to.clone()))
            }
        }
    }

    /// Tear down sessions tied to a closed connection and tell the other
    /// party. When `user_offline` is set, ringing calls to `user` that were
    /// never answered are ended too.
    pub async fn connection_closed(
        &self,
        conn: ConnectionId,
        user: &UserId,
        user_offline: bool,
    ) -> usize {
        let ended: Vec<(UserId, UserId)> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, s)| {
                    s.involves_conn(conn)
                        || (user_offline && &s.callee == user && s.callee_conn.is_none())
                })
                .map(|(k, _)| k.clone())
                .collect();

            keys.iter()
                .filter_map(|k| sessions.remove(k))
                .map(|s| {
                    let (departed, peer) = if s.involves_conn(conn) {
                        s.peer_of_conn(conn)
                    } else {
                        (&s.callee, &s.caller)
                    };
                    (departed.clone(), peer.clone())
                })
                .collect()
        };

        for (departed, peer) in &ended {
            info!(departed = %departed, peer = %peer, "Ending call after disconnect");
            let payload = json!({
                "from": departed,
                "to": peer,
                "reason": "disconnected",
            });
            self.gateway
                .publish_to_user(peer, ServerEvent::signal(SignalKind::Hangup, payload))
                .await;
        }
        ended.len()
    }
}

#[cfg(test)]
impl SignalingRelay {
    async fn session(&self, caller: &UserId, callee: &UserId) -> Option<CallSession> {
        let sessions = self.sessions.lock().await;
        sessions.get(&(caller.clone(), callee.clone())).cloned()
    }

    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Read the mandatory `to` field of a signaling payload.
pub fn target_of(payload: &Value) -> Result<UserId, ServerError> {
    match payload.get("to") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(UserId::new(s.clone())),
        Some(_) => Err(ServerError::InvalidSignalingPayload(
            "`to` must be a non-empty user id".into(),
        )),
        None => Err(ServerError::InvalidSignalingPayload(
            "missing `to` field".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    struct Peer {
        id: UserId,
        conn: ConnectionId,
        rx: Receiver<ServerEvent>,
    }

    async fn peer(gw: &Gateway, name: &str) -> Peer {
        let id = UserId::new(name);
        let (conn, rx) = gw.connect().await;
        gw.bind_user(conn, &id).await.unwrap();
        Peer { id, conn, rx }
    }

    fn to(p: &Peer) -> Value {
        json!({"to": p.id, "sdp": {"type": "offer", "sdp": "v=0"}})
    }

    #[tokio::test]
    async fn test_offer_answer_hangup_lifecycle() {
        let gw = Gateway::new(16);
        let relay = SignalingRelay::new(gw.clone(), false);
        let a = peer(&gw, "alice").await;
        let mut b = peer(&gw, "bob").await;

        relay.handle(&a.id, a.conn, SignalKind::Offer, to(&b)).await.unwrap();
        let s = relay.session(&a.id, &b.id).await.unwrap();
        assert_eq!(s.state, CallState::Ringing);

        match b.rx.try_recv().unwrap() {
            ServerEvent::CallOffer(v) => {
                assert_eq!(v["from"], "alice");
                assert_eq!(v["sdp"]["sdp"], "v=0");
            }
            other => panic!("unexpected {other:?}"),
        }

        relay.handle(&b.id, b.conn, SignalKind::Answer, to(&a)).await.unwrap();
        let s = relay.session(&a.id, &b.id).await.unwrap();
        assert_eq!(s.state, CallState::Active);
        assert_eq!(s.callee_conn, Some(b.conn));

        relay.handle(&a.id, a.conn, SignalKind::Hangup, json!({"to": "bob"})).await.unwrap();
        assert_eq!(relay.session_count().await, 0);

        relay.handle(&a.id, a.conn, SignalKind::Offer, to(&b)).await.unwrap();
        let s = relay.session(&a.id, &b.id).await.unwrap();
        assert_eq!(s.state, CallState::Ringing);
    }

    #[tokio::test]
    async fn test_reject_clears_ringing_session() {
        let gw = Gateway::new(16);
        let relay = SignalingRelay::new(gw.clone(), false);
        let mut a = peer(&gw, "alice").await;
        let b = peer(&gw, "bob").await;

        relay.handle(&a.id, a.conn, SignalKind::Offer, to(&b)).await.unwrap();
        relay.handle(&b.id, b.conn, SignalKind::Reject, json!({"to": "alice"})).await.unwrap();
        assert_eq!(relay.session_count().await, 0);
        assert!(matches!(a.rx.try_recv().unwrap(), ServerEvent::CallReject(_)));
    }

    #[tokio::test]
    async fn test_missing_target_rejected() {
        let gw = Gateway::new(16);
        let relay = SignalingRelay::new(gw.clone(), false);
        let a = peer(&gw, "alice").await;

        for payload in [json!({"sdp": "x"}), json!({"to": ""}), json!({"to": 5}), json!("bob")] {
            let err = relay
                .handle(&a.id, a.conn, SignalKind::Offer, payload)
                .await
                .unwrap_err();
            assert!(matches!(err, ServerError::InvalidSignalingPayload(_)));
        }
        assert_eq!(relay.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_ghost_answer_relayed_unless_strict() {
        let gw = Gateway::new(16);
        let a = peer(&gw, "alice").await;
        let mut b = peer(&gw, "bob").await;

        let lenient = SignalingRelay::new(gw.clone(), false);
        assert_eq!(
            lenient.handle(&a.id, a.conn, SignalKind::Answer, to(&b)).await.unwrap(),
            1
        );
        assert!(matches!(b.rx.try_recv().unwrap(), ServerEvent::CallAnswer(_)));

        let strict = SignalingRelay::new(gw.clone(), true);
        assert!(strict.handle(&a.id, a.conn, SignalKind::Answer, to(&b)).await.is_err());
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_during_call_synthesizes_hangup() {
        let gw = Gateway::new(16);
        let relay = SignalingRelay::new(gw.clone(), false);
        let a = peer(&gw, "alice").await;
        let mut b = peer(&gw, "bob").await;

        relay.handle(&a.id, a.conn, SignalKind::Offer, to(&b)).await.unwrap();
        relay.handle(&b.id, b.conn, SignalKind::Answer, to(&a)).await.unwrap();
        while b.rx.try_recv().is_ok() {}

        gw.disconnect(a.conn).await;
        assert_eq!(relay.connection_closed(a.conn, &a.id, true).await, 1);
        assert_eq!(relay.session_count().await, 0);

        match b.rx.try_recv().unwrap() {
            ServerEvent::CallHangup(v) => {
                assert_eq!(v["from"], "alice");
                assert_eq!(v["to"], "bob");
                assert_eq!(v["reason"], "disconnected");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_callee_going_offline_ends_ringing_call() {
        let gw = Gateway::new(16);
        let relay = SignalingRelay::new(gw.clone(), false);
        let mut a = peer(&gw, "alice").await;
        let b = peer(&gw, "bob").await;

        relay.handle(&a.id, a.conn, SignalKind::Offer, to(&b)).await.unwrap();

        // Another of bob's tabs closing while bob is still online keeps it ringing.
        assert_eq!(relay.connection_closed(ConnectionId::new(), &b.id, false).await, 0);
        assert_eq!(relay.connection_closed(b.conn, &b.id, true).await, 1);

        match a.rx.try_recv().unwrap() {
            ServerEvent::CallHangup(v) => assert_eq!(v["from"], "bob"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
