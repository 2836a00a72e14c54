//! Dispatch of realtime client events.
//!
//! Each connection owns a [`ConnectionContext`] that is passed explicitly to
//! every handler. Events of one connection are handled one at a time in
//! arrival order; different connections run concurrently.

use tracing::{debug, info, warn};

use murmur_shared::protocol::{ClientEvent, ServerEvent};
use murmur_shared::types::{ChatId, UserId};

use crate::chats::ChatService;
use crate::error::ServerError;
use crate::gateway::{ConnectionId, Gateway, Room};
use crate::presence::PresenceTracker;
use crate::relay::MessageRelay;
use crate::signaling::SignalingRelay;

/// Per-connection state.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    /// Identity proven by a token at upgrade time, if any.
    pub verified: Option<UserId>,
    /// Identity bound by `setup`.
    pub user: Option<UserId>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, verified: Option<UserId>) -> Self {
        Self {
            id,
            verified,
            user: None,
        }
    }

    fn require_user(&self) -> Result<&UserId, ServerError> {
        self.user
            .as_ref()
            .ok_or_else(|| ServerError::Unauthenticated("send `setup` first".into()))
    }
}

#[derive(Clone)]
pub struct Realtime {
    gateway: Gateway,
    presence: PresenceTracker,
    relay: MessageRelay,
    signaling: SignalingRelay,
    chats: ChatService,
}

impl Realtime {
    pub fn new(
        gateway: Gateway,
        presence: PresenceTracker,
        relay: MessageRelay,
        signaling: SignalingRelay,
        chats: ChatService,
    ) -> Self {
        Self {
            gateway,
            presence,
            relay,
            signaling,
            chats,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub async fn dispatch(
        &self,
        ctx: &mut ConnectionContext,
        event: ClientEvent,
    ) -> Result<(), ServerError> {
        debug!(conn = %ctx.id, event = event.name(), "Client event");

        let event = match event.into_signal() {
            Ok((kind, payload)) => {
                let from = ctx.require_user()?;
                self.signaling.handle(from, ctx.id, kind, payload).await?;
                return Ok(());
            }
            Err(other) => other,
        };

        match event {
            ClientEvent::Setup(payload) => self.setup(ctx, payload.user_id().clone()).await,
            ClientEvent::JoinChat(room) => self.join_chat(ctx, &room).await,
            ClientEvent::Typing(room) => self.typing(ctx, &room, true).await,
            ClientEvent::StopTyping(room) => self.typing(ctx, &room, false).await,
            ClientEvent::NewMessage(raw) => {
                let sender = ctx.require_user()?;
                self.relay.handle_client_message(sender, raw).await?;
                Ok(())
            }
            // Signals were handled above.
            _ => Ok(()),
        }
    }

    async fn setup(&self, ctx: &mut ConnectionContext, user: UserId) -> Result<(), ServerError> {
        if user.is_empty() {
            return Err(ServerError::BadRequest("setup needs a user id".into()));
        }
        if let Some(verified) = &ctx.verified {
            if verified != &user {
                return Err(ServerError::Unauthenticated(
                    "setup identity does not match token".into(),
                ));
            }
        }

        self.gateway.bind_user(ctx.id, &user).await?;
        let first_setup = ctx.user.is_none();
        ctx.user = Some(user.clone());
        self.gateway.send_to(ctx.id, ServerEvent::Connected).await;

        if first_setup {
            let came_online = self.presence.mark_online(&user, ctx.id).await;
            if !came_online {
                // Nobody else's view changed, but this tab still needs the set.
                let online = self.presence.online_user_ids().await;
                self.gateway
                    .send_to(ctx.id, ServerEvent::OnlineUsers(online))
                    .await;
            }
        }
        Ok(())
    }

    async fn join_chat(&self, ctx: &ConnectionContext, room: &str) -> Result<(), ServerError> {
        let user = ctx.require_user()?;
        let Some(chat_id) = parse_room(room) else {
            warn!(conn = %ctx.id, room = %room, "Ignoring join for malformed room");
            return Ok(());
        };

        match self.chats.is_member(chat_id, user).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ServerError::Forbidden(
                    "you are not a member of this chat".into(),
                ))
            }
            Err(ServerError::NotFound(_)) => {
                warn!(conn = %ctx.id, chat = %chat_id, "Ignoring join for unknown chat");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if self.gateway.join(ctx.id, Room::Chat(chat_id)).await {
            info!(user = %user, chat = %chat_id, "User joined room");
        }
        Ok(())
    }

    async fn typing(
        &self,
        ctx: &ConnectionContext,
        room: &str,
        started: bool,
    ) -> Result<(), ServerError> {
        ctx.require_user()?;
        let Some(chat_id) = parse_room(room) else {
            warn!(conn = %ctx.id, room = %room, "Ignoring typing for malformed room");
            return Ok(());
        };
        let room = Room::Chat(chat_id);
        if !self.gateway.is_subscribed(ctx.id, &room).await {
            debug!(conn = %ctx.id, chat = %chat_id, "Typing outside a joined room");
            return Ok(());
        }

        let event = if started {
            ServerEvent::Typing(chat_id)
        } else {
            ServerEvent::StopTyping(chat_id)
        };
        self.gateway.publish(&room, event, Some(ctx.id)).await;
        Ok(())
    }

    /// Tear down a closed connection: rooms first, then presence, then any
    /// call the connection was part of.
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        let Some(user) = self.gateway.disconnect(ctx.id).await else {
            debug!(conn = %ctx.id, "Anonymous connection closed");
            return;
        };

        let went_offline = self.presence.mark_offline(&user, ctx.id).await;
        let ended = self
            .signaling
            .connection_closed(ctx.id, &user, went_offline)
            .await;

        info!(
            conn = %ctx.id,
            user = %user,
            offline = went_offline,
            calls_ended = ended,
            "Connection closed"
        );
    }
}

/// Room ids are chat ids, optionally in `chat:<id>` topic form.
fn parse_room(room: &str) -> Option<ChatId> {
    let id = room.strip_prefix("chat:").unwrap_or(room);
    ChatId::parse(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use murmur_shared::token::VerifiedIdentity;
    use murmur_store::SharedDatabase;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc::Receiver;

    use crate::attachments::AttachmentStore;

    struct Harness {
        realtime: Realtime,
        chats: ChatService,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::new(64);
        let presence = PresenceTracker::new(gateway.clone());
        let relay = MessageRelay::new(gateway.clone());
        let signaling = SignalingRelay::new(gateway.clone(), false);
        let attachments = AttachmentStore::new(
            dir.path().join("uploads"),
            dir.path().join("blobs"),
            "http://localhost:5000",
            1024,
        )
        .await
        .unwrap();
        let chats = ChatService::new(
            SharedDatabase::open_in_memory().unwrap(),
            gateway.clone(),
            presence.clone(),
            relay.clone(),
            Arc::new(attachments),
        );
        for id in ["u1", "u2", "u3"] {
            chats
                .register_identity(&VerifiedIdentity {
                    user_id: UserId::new(id),
                    name: id.into(),
                })
                .await
                .unwrap();
        }
        let realtime = Realtime::new(gateway, presence, relay, signaling, chats.clone());
        Harness {
            realtime,
            chats,
            _dir: dir,
        }
    }

    async fn open(h: &Harness, user: &str) -> (ConnectionContext, Receiver<ServerEvent>) {
        let (id, rx) = h.realtime.gateway().connect().await;
        let mut ctx = ConnectionContext::new(id, Some(UserId::new(user)));
        h.realtime
            .dispatch(&mut ctx, ClientEvent::Setup(serde_json::from_value(json!(user)).unwrap()))
            .await
            .unwrap();
        (ctx, rx)
    }

    fn drain(rx: &mut Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_setup_replies_connected_and_broadcasts_presence() {
        let h = harness().await;
        let (_a, mut rx_a) = open(&h, "u1").await;
        assert_eq!(
            drain(&mut rx_a),
            vec![
                ServerEvent::Connected,
                ServerEvent::OnlineUsers(vec![UserId::new("u1")]),
            ]
        );

        let (_b, mut rx_b) = open(&h, "u2").await;
        let both = ServerEvent::OnlineUsers(vec![UserId::new("u1"), UserId::new("u2")]);
        assert_eq!(drain(&mut rx_a), vec![both.clone()]);
        assert_eq!(drain(&mut rx_b), vec![ServerEvent::Connected, both]);
    }

    #[tokio::test]
    async fn test_setup_must_match_token() {
        let h = harness().await;
        let (id, _rx) = h.realtime.gateway().connect().await;
        let mut ctx = ConnectionContext::new(id, Some(UserId::new("u1")));
        let err = h
            .realtime
            .dispatch(&mut ctx, ClientEvent::Setup(serde_json::from_value(json!("u2")).unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Unauthenticated(_)));
        assert!(ctx.user.is_none());
    }

    #[tokio::test]
    async fn test_second_tab_keeps_user_online() {
        let h = harness().await;
        let (tab1, _r1) = open(&h, "u1").await;
        let (tab2, mut r2) = open(&h, "u1").await;

        // The second tab still learns who is online.
        assert!(drain(&mut r2).contains(&ServerEvent::OnlineUsers(vec![UserId::new("u1")])));

        h.realtime.disconnect(&tab1).await;
        assert_eq!(h.chats.online_users().await, vec![UserId::new("u1")]);
        h.realtime.disconnect(&tab2).await;
        assert!(h.chats.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_join_requires_membership_and_typing_stays_in_room() {
        let h = harness().await;
        let chat = h
            .chats
            .access_chat(&UserId::new("u1"), Some(UserId::new("u2")))
            .await
            .unwrap();

        let (mut a, mut rx_a) = open(&h, "u1").await;
        let (mut b, mut rx_b) = open(&h, "u2").await;
        let (mut c, mut rx_c) = open(&h, "u3").await;

        let room = chat.id.to_string();
        h.realtime.dispatch(&mut a, ClientEvent::JoinChat(room.clone())).await.unwrap();
        h.realtime.dispatch(&mut b, ClientEvent::JoinChat(room.clone())).await.unwrap();
        let err = h
            .realtime
            .dispatch(&mut c, ClientEvent::JoinChat(room.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));

        // Malformed rooms are ignored.
        h.realtime
            .dispatch(&mut a, ClientEvent::JoinChat("not-a-chat".into()))
            .await
            .unwrap();

        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        h.realtime.dispatch(&mut a, ClientEvent::Typing(room.clone())).await.unwrap();
        h.realtime.dispatch(&mut a, ClientEvent::StopTyping(room)).await.unwrap();

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::Typing(chat.id), ServerEvent::StopTyping(chat.id)]
        );
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_events_before_setup_rejected() {
        let h = harness().await;
        let (id, _rx) = h.realtime.gateway().connect().await;
        let mut ctx = ConnectionContext::new(id, None);
        let err = h
            .realtime
            .dispatch(&mut ctx, ClientEvent::CallOffer(json!({"to": "u2"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_client_new_message_not_duplicated_after_rest_send() {
        let h = harness().await;
        let chat = h
            .chats
            .access_chat(&UserId::new("u1"), Some(UserId::new("u2")))
            .await
            .unwrap();
        let (mut a, _rx_a) = open(&h, "u1").await;
        let (_b, mut rx_b) = open(&h, "u2").await;

        let sent = h
            .chats
            .send_message(&UserId::new("u1"), chat.id, Some("hi".into()), None)
            .await
            .unwrap();
        h.realtime
            .dispatch(
                &mut a,
                ClientEvent::NewMessage(serde_json::to_value(&sent).unwrap()),
            )
            .await
            .unwrap();

        let received: Vec<_> = drain(&mut rx_b)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageReceived(_)))
            .collect();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_call_notifies_peer() {
        let h = harness().await;
        let (mut a, _rx_a) = open(&h, "u1").await;
        let (mut b, mut rx_b) = open(&h, "u2").await;

        h.realtime
            .dispatch(&mut a, ClientEvent::CallOffer(json!({"to": "u2", "sdp": "o"})))
            .await
            .unwrap();
        h.realtime
            .dispatch(&mut b, ClientEvent::CallAnswer(json!({"to": "u1", "sdp": "a"})))
            .await
            .unwrap();
        drain(&mut rx_b);

        h.realtime.disconnect(&a).await;

        let events = drain(&mut rx_b);
        let hangup = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::CallHangup(v) => Some(v.clone()),
                _ => None,
            })
            .expect("synthesized hangup");
        assert_eq!(hangup["from"], "u1");
        assert_eq!(hangup["reason"], "disconnected");
        assert!(events.contains(&ServerEvent::OnlineUsers(vec![UserId::new("u2")])));
    }
}
