//! Online presence derived from live connections.
//!
//! A user is online while at least one bound connection is open. Every
//! transition broadcasts the full online set, and the broadcast happens
//! while the presence lock is held so snapshots go out in the order the
//! transitions happened.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use murmur_shared::protocol::ServerEvent;
use murmur_shared::types::UserId;

use crate::gateway::{ConnectionId, Gateway};

#[derive(Clone)]
pub struct PresenceTracker {
    online: Arc<Mutex<HashMap<UserId, HashSet<ConnectionId>>>>,
    gateway: Gateway,
}

impl PresenceTracker {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            online: Arc::new(Mutex::new(HashMap::new())),
            gateway,
        }
    }

    /// Record a bound connection. Returns `true` if the user just came
    /// online (and the new set was broadcast).
    pub async fn mark_online(&self, user: &UserId, conn: ConnectionId) -> bool {
        let mut online = self.online.lock().await;
        let conns = online.entry(user.clone()).or_default();
        let came_online = conns.is_empty();
        conns.insert(conn);

        if came_online {
            info!(user = %user, online = online.len(), "User online");
            self.gateway
                .broadcast(ServerEvent::OnlineUsers(snapshot(&online)))
                .await;
        }
        came_online
    }

    /// Forget a connection. Returns `true` if it was the user's last one.
    pub async fn mark_offline(&self, user: &UserId, conn: ConnectionId) -> bool {
        let mut online = self.online.lock().await;
        let went_offline = match online.get_mut(user) {
            Some(conns) => {
                conns.remove(&conn);
                conns.is_empty()
            }
            None => false,
        };

        if went_offline {
            online.remove(user);
            info!(user = %user, online = online.len(), "User offline");
            self.gateway
                .broadcast(ServerEvent::OnlineUsers(snapshot(&online)))
                .await;
        }
        went_offline
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.online.lock().await.contains_key(user)
    }

    /// Sorted list of users with at least one open connection.
    pub async fn online_user_ids(&self) -> Vec<UserId> {
        snapshot(&*self.online.lock().await)
    }
}

#[cfg(test)]
impl PresenceTracker {
    async fn connection_count(&self, user: &UserId) -> usize {
        self.online.lock().await.get(user).map_or(0, HashSet::len)
    }
}

fn snapshot(online: &HashMap<UserId, HashSet<ConnectionId>>) -> Vec<UserId> {
    let mut ids: Vec<UserId> = online.keys().cloned().collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_online_until_last_connection_closes() {
        let gw = Gateway::new(16);
        let presence = PresenceTracker::new(gw.clone());
        let alice = UserId::new("alice");
        let (watcher, mut rx) = gw.connect().await;

        let conns = [ConnectionId::new(), ConnectionId::new(), ConnectionId::new()];
        let mut transitions = 0;
        for c in conns {
            if presence.mark_online(&alice, c).await {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert_eq!(presence.connection_count(&alice).await, 3);

        assert!(!presence.mark_offline(&alice, conns[0]).await);
        assert!(!presence.mark_offline(&alice, conns[1]).await);
        assert!(presence.is_online(&alice).await);
        assert!(presence.mark_offline(&alice, conns[2]).await);
        assert!(!presence.is_online(&alice).await);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                ServerEvent::OnlineUsers(vec![alice.clone()]),
                ServerEvent::OnlineUsers(vec![]),
            ]
        );
        gw.disconnect(watcher).await;
    }

    #[tokio::test]
    async fn test_online_ids_sorted() {
        let gw = Gateway::new(16);
        let presence = PresenceTracker::new(gw);
        for name in ["carol", "alice", "bob"] {
            presence.mark_online(&UserId::new(name), ConnectionId::new()).await;
        }
        let ids: Vec<String> = presence
            .online_user_ids()
            .await
            .into_iter()
            .map(|u| u.0)
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_unknown_offline_is_noop() {
        let presence = PresenceTracker::new(Gateway::new(4));
        assert!(!presence.mark_offline(&UserId::new("ghost"), ConnectionId::new()).await);
    }
}
