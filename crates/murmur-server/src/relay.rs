//! Messaging relay: fans a stored message out to chat members.
//!
//! Fan-out targets every member's personal room, except the sender, using
//! the membership snapshot carried in the message. Message ids already
//! distributed inside a bounded window are dropped, so a message pushed
//! both by the REST send path and by a client `new message` event is
//! delivered once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use murmur_shared::constants::RECENT_MESSAGE_WINDOW;
use murmur_shared::protocol::{MessageView, ServerEvent};
use murmur_shared::types::{MessageId, UserId};

use crate::error::ServerError;
use crate::gateway::Gateway;

struct RecentIds {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if `id` is still inside the window.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct MessageRelay {
    gateway: Gateway,
    recent: Arc<Mutex<RecentIds>>,
}

impl MessageRelay {
    pub fn new(gateway: Gateway) -> Self {
        Self::with_window(gateway, RECENT_MESSAGE_WINDOW)
    }

    pub fn with_window(gateway: Gateway, window: usize) -> Self {
        Self {
            gateway,
            recent: Arc::new(Mutex::new(RecentIds::new(window))),
        }
    }

    /// Push `message` to each member other than its sender. Returns the
    /// number of members targeted; offline members are silently skipped.
    pub async fn distribute(&self, message: &MessageView) -> usize {
        if message.chat.users.is_empty() {
            warn!(message = %message.id, chat = %message.chat.id, "Chat has no users, not relaying");
            return 0;
        }

        let fresh = match self.recent.lock() {
            Ok(mut recent) => recent.insert(message.id),
            // A poisoned window only costs us dedup.
            Err(poisoned) => poisoned.into_inner().insert(message.id),
        };
        if !fresh {
            debug!(message = %message.id, "Already distributed, skipping");
            return 0;
        }

        let mut targeted = HashSet::new();
        for member in &message.chat.users {
            if member.id == message.sender.id || !targeted.insert(&member.id) {
                continue;
            }
            let delivered = self
                .gateway
                .publish_to_user(
                    &member.id,
                    ServerEvent::MessageReceived(Box::new(message.clone())),
                )
                .await;
            if delivered == 0 {
                let e = ServerError::DeliveryFailure(format!("{} has no open connection", member.id));
                debug!(message = %message.id, error = %e, "Recipient offline");
            }
        }
        targeted.len()
    }

    /// Handle a client-originated `new message` event.
    pub async fn handle_client_message(
        &self,
        sender: &UserId,
        raw: Value,
    ) -> Result<usize, ServerError> {
        let message: MessageView = serde_json::from_value(raw)
            .map_err(|e| ServerError::InvalidMessage(e.to_string()))?;

        if &message.sender.id != sender {
            return Err(ServerError::Forbidden(
                "message sender does not match connection identity".into(),
            ));
        }
        if !message.has_body() {
            return Err(ServerError::InvalidMessage(
                "message needs content or an attachment".into(),
            ));
        }

        Ok(self.distribute(&message).await)
    }
}
