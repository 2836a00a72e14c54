//! Realtime gateway: connection registry and room fan-out.
//!
//! Every live WebSocket is registered here with a bounded outbound queue.
//! Connections subscribe to rooms: one personal room per user (joined on
//! `setup`) and one room per opened chat. Publishing enqueues the event on
//! each subscriber's queue without awaiting, so a slow consumer loses
//! events instead of stalling the publisher.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_shared::protocol::ServerEvent;
use murmur_shared::types::{ChatId, UserId};

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named set of subscribed connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Personal room: every connection of one user.
    User(UserId),
    /// Everyone who currently has the chat open.
    Chat(ChatId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{id}"),
            Room::Chat(id) => write!(f, "{}", id.to_topic()),
        }
    }
}

struct Subscriber {
    user: Option<UserId>,
    tx: mpsc::Sender<ServerEvent>,
    rooms: HashSet<Room>,
}

impl Subscriber {
    /// Enqueue without waiting. Returns whether the event was accepted.
    fn deliver(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    conn = %conn,
                    event = event.name(),
                    "Dropping event for slow connection"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %conn, "Connection queue closed");
                false
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Subscriber>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

impl Registry {
    fn subscribe(&mut self, conn: ConnectionId, room: Room) -> bool {
        let Some(sub) = self.connections.get_mut(&conn) else {
            return false;
        };
        if !sub.rooms.insert(room.clone()) {
            return false;
        }
        self.rooms.entry(room).or_default().insert(conn);
        true
    }

    fn unsubscribe(&mut self, conn: ConnectionId, room: &Room) {
        if let Some(sub) = self.connections.get_mut(&conn) {
            sub.rooms.remove(room);
        }
        let now_empty = match self.rooms.get_mut(room) {
            Some(members) => {
                members.remove(&conn);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove(room);
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    registry: Arc<RwLock<Registry>>,
    buffer: usize,
}

impl Gateway {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            buffer: buffer.max(1),
        }
    }

    /// Register a new, not yet identified connection.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let conn = ConnectionId::new();

        let mut reg = self.registry.write().await;
        reg.connections.insert(
            conn,
            Subscriber {
                user: None,
                tx,
                rooms: HashSet::new(),
            },
        );
        debug!(conn = %conn, connections = reg.connections.len(), "Connection registered");

        (conn, rx)
    }

    /// Bind an identity to a connection and subscribe it to the user's
    /// personal room. Rebinding to the same user is a no-op; a connection
    /// cannot switch identities.
    pub async fn bind_user(&self, conn: ConnectionId, user: &UserId) -> Result<(), ServerError> {
        let mut reg = self.registry.write().await;
        let sub = reg
            .connections
            .get_mut(&conn)
            .ok_or_else(|| ServerError::NotFound(format!("connection {conn}")))?;

        match &sub.user {
            Some(bound) if bound != user => {
                return Err(ServerError::Forbidden(format!(
                    "connection is already bound to {bound}"
                )));
            }
            Some(_) => {}
            None => sub.user = Some(user.clone()),
        }

        reg.subscribe(conn, Room::User(user.clone()));
        info!(conn = %conn, user = %user, "Connection identified");
        Ok(())
    }

    /// Subscribe a connection to a room. Returns `false` if it already was.
    pub async fn join(&self, conn: ConnectionId, room: Room) -> bool {
        let mut reg = self.registry.write().await;
        let joined = reg.subscribe(conn, room.clone());
        if joined {
            debug!(conn = %conn, room = %room, "Joined room");
        }
        joined
    }

    pub async fn is_subscribed(&self, conn: ConnectionId, room: &Room) -> bool {
        let reg = self.registry.read().await;
        reg.rooms.get(room).is_some_and(|m| m.contains(&conn))
    }

    /// Drop every connection of `user` from `room`. Used when a member is
    /// removed from a group so they stop receiving its typing events.
    pub async fn evict_user(&self, room: &Room, user: &UserId) -> usize {
        let mut reg = self.registry.write().await;
        let targets: Vec<ConnectionId> = match reg.rooms.get(room) {
            Some(members) => members
                .iter()
                .filter(|c| {
                    reg.connections
                        .get(*c)
                        .is_some_and(|s| s.user.as_ref() == Some(user))
                })
                .copied()
                .collect(),
            None => return 0,
        };
        for conn in &targets {
            reg.unsubscribe(*conn, room);
        }
        targets.len()
    }

    /// Remove a connection and all of its subscriptions. Returns the user
    /// it was bound to, if any.
    pub async fn disconnect(&self, conn: ConnectionId) -> Option<UserId> {
        let mut reg = self.registry.write().await;
        let sub = reg.connections.remove(&conn)?;
        for room in &sub.rooms {
            let now_empty = match reg.rooms.get_mut(room) {
                Some(members) => {
                    members.remove(&conn);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                reg.rooms.remove(room);
            }
        }
        debug!(
            conn = %conn,
            user = ?sub.user,
            connections = reg.connections.len(),
            "Connection removed"
        );
        sub.user
    }

    /// Deliver to every subscriber of `room` except `exclude`. Returns how
    /// many queues accepted the event.
    pub async fn publish(
        &self,
        room: &Room,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let reg = self.registry.read().await;
        let Some(members) = reg.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in members {
            if Some(*conn) == exclude {
                continue;
            }
            if let Some(sub) = reg.connections.get(conn) {
                if sub.deliver(*conn, event.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub async fn publish_to_user(&self, user: &UserId, event: ServerEvent) -> usize {
        self.publish(&Room::User(user.clone()), event, None).await
    }

    /// Deliver to one connection.
    pub async fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let reg = self.registry.read().await;
        reg.connections
            .get(&conn)
            .is_some_and(|sub| sub.deliver(conn, event))
    }

    /// Deliver to every registered connection.
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let reg = self.registry.read().await;
        reg.connections
            .iter()
            .filter(|(conn, sub)| sub.deliver(**conn, event.clone()))
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }
}

#[cfg(test)]
impl Gateway {
    async fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
        let reg = self.registry.read().await;
        reg.connections.get(&conn).and_then(|s| s.user.clone())
    }

    async fn room_size(&self, room: &Room) -> usize {
        let reg = self.registry.read().await;
        reg.rooms.get(room).map_or(0, HashSet::len)
    }
}
