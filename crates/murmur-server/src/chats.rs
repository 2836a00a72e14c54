//! Chat lifecycle operations performed on behalf of a verified requester.
//!
//! Every write goes to the store first; live fan-out through the
//! [`MessageRelay`] happens only after the durable write succeeded, and
//! with the record as the store returned it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use murmur_shared::constants::MIN_GROUP_INVITEES;
use murmur_shared::protocol::{ChatView, MessageView, UserProfile};
use murmur_shared::token::VerifiedIdentity;
use murmur_shared::types::{CallInfo, ChatId, ForwardedFrom, MessageId, UserId};
use murmur_store::{Chat, Database, NewGroupChat, NewMessage, SharedDatabase, User};

use crate::attachments::AttachmentStore;
use crate::error::ServerError;
use crate::gateway::{Gateway, Room};
use crate::presence::PresenceTracker;
use crate::relay::MessageRelay;
use crate::views::{chat_view, message_view, referenced_users, Directory};

const USER_SEARCH_LIMIT: u32 = 20;

#[derive(Clone)]
pub struct ChatService {
    db: SharedDatabase,
    gateway: Gateway,
    presence: PresenceTracker,
    relay: MessageRelay,
    attachments: Arc<AttachmentStore>,
}

impl ChatService {
    pub fn new(
        db: SharedDatabase,
        gateway: Gateway,
        presence: PresenceTracker,
        relay: MessageRelay,
        attachments: Arc<AttachmentStore>,
    ) -> Self {
        Self {
            db,
            gateway,
            presence,
            relay,
            attachments,
        }
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Refresh the stored profile of a verified identity.
    pub async fn register_identity(&self, identity: &VerifiedIdentity) -> Result<(), ServerError> {
        let user = User::new(identity.user_id.clone(), identity.name.clone());
        self.db.call(move |db| db.upsert_user(&user)).await?;
        Ok(())
    }

    pub async fn search_users(
        &self,
        requester: &UserId,
        query: &str,
    ) -> Result<Vec<UserProfile>, ServerError> {
        let exclude = requester.clone();
        let query = query.to_string();
        let users = self
            .db
            .call(move |db| db.search_users(&query, &exclude, USER_SEARCH_LIMIT))
            .await?;
        let ids: Vec<UserId> = users.iter().map(|u| u.id.clone()).collect();
        let dir = self.directory(users).await;
        Ok(ids.iter().map(|id| dir.profile(id)).collect())
    }

    pub async fn user_profile(&self, id: &UserId) -> Result<UserProfile, ServerError> {
        let lookup = id.clone();
        let user = self
            .db
            .call(move |db| db.get_users(std::slice::from_ref(&lookup)))
            .await?
            .pop()
            .ok_or_else(|| ServerError::NotFound(format!("user {id}")))?;
        let online = self.presence.is_online(id).await;
        let dir = Directory::new(vec![user], online.then(|| id.clone()));
        Ok(dir.profile(id))
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.presence.online_user_ids().await
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    /// Find or create the one-to-one chat with `other`.
    pub async fn access_chat(
        &self,
        requester: &UserId,
        other: Option<UserId>,
    ) -> Result<ChatView, ServerError> {
        let other = other
            .filter(|o| !o.is_empty())
            .ok_or_else(|| ServerError::BadRequest("UserId param not sent with request".into()))?;
        if &other == requester {
            return Err(ServerError::BadRequest(
                "cannot open a chat with yourself".into(),
            ));
        }
        self.require_user(&other).await?;

        let (a, b) = (requester.clone(), other.clone());
        let (chat, outcome) = self
            .db
            .call(move |db| db.access_one_to_one_chat(&a, &b))
            .await?;
        debug!(chat = %chat.id, requester = %requester, other = %other, ?outcome, "Accessed chat");

        self.render_chat(chat, requester).await
    }

    /// Chats of `requester`, active or archived, most recent first.
    pub async fn fetch_chats(
        &self,
        requester: &UserId,
        archived: bool,
    ) -> Result<Vec<ChatView>, ServerError> {
        let viewer = requester.clone();
        let (rows, users) = self
            .db
            .call(move |db| {
                let chats = db.list_chats_for_user(&viewer, archived)?;
                let mut rows = Vec::with_capacity(chats.len());
                let mut ids = Vec::new();
                for chat in chats {
                    let latest = db.latest_visible_message(chat.id, &viewer)?;
                    ids.extend(referenced_users(&chat, &latest.iter().collect::<Vec<_>>()));
                    rows.push((chat, latest));
                }
                ids.sort();
                ids.dedup();
                Ok((rows, db.get_users(&ids)?))
            })
            .await?;

        let dir = self.directory(users).await;
        Ok(rows
            .iter()
            .map(|(chat, latest)| chat_view(chat, latest.as_ref(), requester, &dir))
            .collect())
    }

    pub async fn create_group(
        &self,
        requester: &UserId,
        name: &str,
        invitees: Vec<UserId>,
    ) -> Result<ChatView, ServerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServerError::BadRequest("Please fill all the fields".into()));
        }

        let mut unique: Vec<UserId> = Vec::with_capacity(invitees.len());
        for user in invitees {
            if !user.is_empty() && &user != requester && !unique.contains(&user) {
                unique.push(user);
            }
        }
        if unique.len() < MIN_GROUP_INVITEES {
            return Err(ServerError::InvalidMessage(
                "More than 2 users are required to form a group chat".into(),
            ));
        }

        let new = NewGroupChat {
            name: name.to_string(),
            admin: requester.clone(),
            invitees: unique,
        };
        let created = self
            .db
            .call(move |db| {
                if let Some(missing) = first_missing_user(db, &new.invitees)? {
                    return Ok(Err(missing));
                }
                db.create_group_chat(&new).map(Ok)
            })
            .await?;
        let chat = created.map_err(|missing| ServerError::NotFound(format!("user {missing}")))?;

        info!(chat = %chat.id, admin = %requester, members = chat.users.len(), "Group chat created");
        self.render_chat(chat, requester).await
    }

    pub async fn rename_group(
        &self,
        requester: &UserId,
        chat_id: ChatId,
        name: &str,
    ) -> Result<ChatView, ServerError> {
        self.group_chat(chat_id, requester).await?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ServerError::BadRequest("chat name is required".into()));
        }

        let chat = self.db.call(move |db| db.rename_chat(chat_id, &name)).await?;
        self.render_chat(chat, requester).await
    }

    pub async fn add_to_group(
        &self,
        requester: &UserId,
        chat_id: ChatId,
        user: UserId,
    ) -> Result<ChatView, ServerError> {
        let chat = self.group_chat(chat_id, requester).await?;
        if !chat.is_admin(requester) {
            return Err(ServerError::Forbidden("Only admins can add users".into()));
        }
        self.require_user(&user).await?;

        let chat = self
            .db
            .call(move |db| db.add_chat_member(chat_id, &user))
            .await?;
        self.render_chat(chat, requester).await
    }

    /// Remove `user`; the admin may remove anyone, a member only themselves.
    pub async fn remove_from_group(
        &self,
        requester: &UserId,
        chat_id: ChatId,
        user: UserId,
    ) -> Result<ChatView, ServerError> {
        let chat = self.group_chat(chat_id, requester).await?;
        if !chat.is_admin(requester) && &user != requester {
            return Err(ServerError::Forbidden("Only admins can remove users".into()));
        }

        let removed = user.clone();
        let chat = self
            .db
            .call(move |db| db.remove_chat_member(chat_id, &removed))
            .await?;

        let evicted = self.gateway.evict_user(&Room::Chat(chat_id), &user).await;
        debug!(chat = %chat_id, user = %user, evicted, "Member removed");

        self.render_chat(chat, requester).await
    }

    pub async fn set_archived(
        &self,
        requester: &UserId,
        chat_id: ChatId,
        archived: bool,
    ) -> Result<ChatView, ServerError> {
        self.member_chat(chat_id, requester).await?;
        let user = requester.clone();
        let chat = self
            .db
            .call(move |db| db.set_chat_archived(chat_id, &user, archived))
            .await?;
        self.render_chat(chat, requester).await
    }

    pub async fn delete_chat_for_me(
        &self,
        requester: &UserId,
        chat_id: ChatId,
    ) -> Result<(), ServerError> {
        self.member_chat(chat_id, requester).await?;
        let user = requester.clone();
        self.db
            .call(move |db| db.delete_chat_for_user(chat_id, &user))
            .await?;
        debug!(chat = %chat_id, user = %requester, "Chat deleted for user");
        Ok(())
    }

    /// Whether `user` currently belongs to the chat.
    pub async fn is_member(&self, chat_id: ChatId, user: &UserId) -> Result<bool, ServerError> {
        let chat = self.db.call(move |db| db.get_chat(chat_id)).await?;
        Ok(chat.is_member(user))
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Messages of a chat visible to `requester`, oldest first.
    pub async fn all_messages(
        &self,
        requester: &UserId,
        chat_id: ChatId,
    ) -> Result<Vec<MessageView>, ServerError> {
        let chat = self.member_chat(chat_id, requester).await?;
        let viewer = requester.clone();
        let snapshot = chat.clone();
        let (messages, users) = self
            .db
            .call(move |db| {
                let messages = db.list_messages(chat_id, &viewer)?;
                let ids = referenced_users(&snapshot, &messages.iter().collect::<Vec<_>>());
                Ok((messages, db.get_users(&ids)?))
            })
            .await?;

        let dir = self.directory(users).await;
        Ok(messages
            .iter()
            .map(|m| message_view(m, &chat, &dir))
            .collect())
    }

    pub async fn send_message(
        &self,
        requester: &UserId,
        chat_id: ChatId,
        content: Option<String>,
        attachment: Option<String>,
    ) -> Result<MessageView, ServerError> {
        self.member_chat(chat_id, requester).await?;
        let new = NewMessage {
            attachment: attachment.filter(|a| !a.trim().is_empty()),
            ..NewMessage::text(
                chat_id,
                requester.clone(),
                content.unwrap_or_default().trim(),
            )
        };
        self.create_and_distribute(new).await
    }

    /// Hide a message for the requester only.
    pub async fn delete_message(
        &self,
        requester: &UserId,
        message_id: MessageId,
    ) -> Result<(), ServerError> {
        let user = requester.clone();
        let outcome = self
            .db
            .call(move |db| {
                let message = db.get_message(message_id)?;
                let chat = db.get_chat(message.chat_id)?;
                if !chat.is_member(&user) {
                    return Ok(None);
                }
                db.mark_message_deleted_for_user(message_id, &user).map(Some)
            })
            .await?;

        match outcome {
            None => Err(ServerError::Forbidden(
                "You can only delete messages from chats you're a member of".into(),
            )),
            Some(changed) => {
                debug!(message = %message_id, user = %requester, changed, "Message deleted for user");
                Ok(())
            }
        }
    }

    /// Copy a visible message into another chat the requester belongs to.
    ///
    /// A local attachment is migrated to durable storage first; if that
    /// fails the forward still goes out with the original URI.
    pub async fn forward_message(
        &self,
        requester: &UserId,
        message_id: MessageId,
        target: ChatId,
    ) -> Result<MessageView, ServerError> {
        let (source, source_chat, original_sender) = self
            .db
            .call(move |db| {
                let message = db.get_message(message_id)?;
                let chat = db.get_chat(message.chat_id)?;
                let sender = db
                    .get_users(std::slice::from_ref(&message.sender))?
                    .pop();
                Ok((message, chat, sender))
            })
            .await?;
        if !source.is_visible_to(requester, &source_chat) {
            return Err(ServerError::NotFound(format!("message {message_id}")));
        }
        self.member_chat(target, requester).await?;

        let attachment = match source.attachment {
            Some(uri) if self.attachments.is_local(&uri) => {
                match self.attachments.migrate(&uri).await {
                    Ok(durable) => Some(durable),
                    Err(e) => {
                        warn!(message = %message_id, error = %e, "Forwarding with original attachment URI");
                        Some(uri)
                    }
                }
            }
            other => other,
        };

        let forwarded_from = ForwardedFrom {
            name: original_sender
                .map(|u| u.name)
                .unwrap_or_else(|| source.sender.to_string()),
            user_id: source.sender.clone(),
            original_chat: source.chat_id,
        };

        let new = NewMessage {
            chat_id: target,
            sender: requester.clone(),
            content: source.content,
            attachment,
            forwarded_from: Some(forwarded_from),
            call_info: None,
        };
        self.create_and_distribute(new).await
    }

    /// Append a call-log entry summarising a finished call.
    pub async fn log_call(
        &self,
        requester: &UserId,
        chat_id: ChatId,
        call_info: CallInfo,
    ) -> Result<MessageView, ServerError> {
        self.member_chat(chat_id, requester).await?;
        let new = NewMessage {
            call_info: Some(call_info.clone()),
            ..NewMessage::text(chat_id, requester.clone(), call_info.summary())
        };
        self.create_and_distribute(new).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn create_and_distribute(&self, new: NewMessage) -> Result<MessageView, ServerError> {
        if !new.has_body() {
            return Err(ServerError::InvalidMessage(
                "Invalid data passed into request".into(),
            ));
        }

        let (message, chat, users) = self
            .db
            .call(move |db| {
                let message = db.insert_message(&new)?;
                let chat = db.get_chat(message.chat_id)?;
                let users = db.get_users(&referenced_users(&chat, &[&message]))?;
                Ok((message, chat, users))
            })
            .await?;

        let dir = self.directory(users).await;
        let view = message_view(&message, &chat, &dir);
        let recipients = self.relay.distribute(&view).await;
        debug!(message = %view.id, chat = %chat.id, recipients, "Message sent");
        Ok(view)
    }

    async fn render_chat(&self, chat: Chat, viewer: &UserId) -> Result<ChatView, ServerError> {
        let owned_viewer = viewer.clone();
        let (chat, latest, users) = self
            .db
            .call(move |db| {
                let latest = db.latest_visible_message(chat.id, &owned_viewer)?;
                let ids = referenced_users(&chat, &latest.iter().collect::<Vec<_>>());
                let users = db.get_users(&ids)?;
                Ok((chat, latest, users))
            })
            .await?;

        let dir = self.directory(users).await;
        Ok(chat_view(&chat, latest.as_ref(), viewer, &dir))
    }

    async fn directory(&self, users: Vec<User>) -> Directory {
        Directory::new(users, self.presence.online_user_ids().await)
    }

    async fn member_chat(&self, chat_id: ChatId, user: &UserId) -> Result<Chat, ServerError> {
        let chat = self
            .db
            .call(move |db| db.get_chat(chat_id))
            .await
            .map_err(|e| match ServerError::from(e) {
                ServerError::NotFound(_) => ServerError::NotFound(format!("chat {chat_id}")),
                other => other,
            })?;
        if !chat.is_member(user) {
            return Err(ServerError::Forbidden(
                "you are not a member of this chat".into(),
            ));
        }
        Ok(chat)
    }

    async fn group_chat(&self, chat_id: ChatId, user: &UserId) -> Result<Chat, ServerError> {
        let chat = self.member_chat(chat_id, user).await?;
        if !chat.is_group_chat {
            return Err(ServerError::BadRequest("not a group chat".into()));
        }
        Ok(chat)
    }

    async fn require_user(&self, id: &UserId) -> Result<(), ServerError> {
        let lookup = id.clone();
        if self.db.call(move |db| db.user_exists(&lookup)).await? {
            Ok(())
        } else {
            Err(ServerError::NotFound(format!("user {id}")))
        }
    }
}

fn first_missing_user(db: &Database, ids: &[UserId]) -> murmur_store::Result<Option<UserId>> {
    for id in ids {
        if !db.user_exists(id)? {
            return Ok(Some(id.clone()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use murmur_shared::protocol::ServerEvent;
    use murmur_shared::types::{CallDirection, CallStatus, CallType};
    use tempfile::TempDir;
    use tokio::sync::mpsc::Receiver;

    struct Harness {
        chats: ChatService,
        gateway: Gateway,
        _dir: TempDir,
    }

    async fn harness(users: &[&str]) -> Harness {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::new(32);
        let presence = PresenceTracker::new(gateway.clone());
        let relay = MessageRelay::new(gateway.clone());
        let attachments = AttachmentStore::new(
            dir.path().join("uploads"),
            dir.path().join("blobs"),
            "http://localhost:5000",
            1024 * 1024,
        )
        .await
        .unwrap();
        let db = SharedDatabase::open_in_memory().unwrap();
        let chats = ChatService::new(db, gateway.clone(), presence, relay, Arc::new(attachments));

        for id in users {
            chats
                .register_identity(&VerifiedIdentity {
                    user_id: UserId::new(*id),
                    name: id.to_uppercase(),
                })
                .await
                .unwrap();
        }
        Harness {
            chats,
            gateway,
            _dir: dir,
        }
    }

    async fn listen(gw: &Gateway, user: &str) -> Receiver<ServerEvent> {
        let (conn, rx) = gw.connect().await;
        gw.bind_user(conn, &UserId::new(user)).await.unwrap();
        rx
    }

    fn uid(s: &str) -> UserId {
        UserId::new(s)
    }

    #[tokio::test]
    async fn test_send_delete_end_to_end() {
        let h = harness(&["u1", "u2"]).await;
        let mut b = listen(&h.gateway, "u2").await;

        let chat = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        assert!(!chat.is_group_chat);
        let members: Vec<UserId> = chat.users.iter().map(|u| u.id.clone()).collect();
        assert_eq!(members, vec![uid("u1"), uid("u2")]);

        let sent = h
            .chats
            .send_message(&uid("u1"), chat.id, Some("hi".into()), None)
            .await
            .unwrap();
        assert_eq!(sent.chat.latest_message, Some(sent.id));

        match b.try_recv().unwrap() {
            ServerEvent::MessageReceived(m) => {
                assert_eq!(m.content, "hi");
                assert_eq!(m.sender.id, uid("u1"));
                assert_eq!(m.chat.latest_message, Some(m.id));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(b.try_recv().is_err());

        h.chats.delete_message(&uid("u1"), sent.id).await.unwrap();
        h.chats.delete_message(&uid("u1"), sent.id).await.unwrap();
        assert!(h.chats.all_messages(&uid("u1"), chat.id).await.unwrap().is_empty());
        assert_eq!(h.chats.all_messages(&uid("u2"), chat.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_skips_non_members() {
        let h = harness(&["a", "b", "c", "d", "outsider"]).await;
        let mut outsider = listen(&h.gateway, "outsider").await;
        let mut d = listen(&h.gateway, "d").await;
        let mut b = listen(&h.gateway, "b").await;

        let group = h
            .chats
            .create_group(&uid("a"), "crew", vec![uid("b"), uid("c"), uid("d")])
            .await
            .unwrap();
        h.chats.remove_from_group(&uid("a"), group.id, uid("d")).await.unwrap();
        while d.try_recv().is_ok() {}
        while outsider.try_recv().is_ok() {}

        h.chats
            .send_message(&uid("a"), group.id, Some("members only".into()), None)
            .await
            .unwrap();

        assert!(matches!(b.try_recv(), Ok(ServerEvent::MessageReceived(_))));
        for rx in [&mut outsider, &mut d] {
            while let Ok(event) = rx.try_recv() {
                assert!(
                    !matches!(event, ServerEvent::MessageReceived(_)),
                    "non-member got {event:?}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_access_chat_validation() {
        let h = harness(&["u1"]).await;
        assert!(matches!(
            h.chats.access_chat(&uid("u1"), None).await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            h.chats.access_chat(&uid("u1"), Some(uid("u1"))).await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            h.chats.access_chat(&uid("u1"), Some(uid("nobody"))).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_group_needs_two_invitees() {
        let h = harness(&["a", "b", "c"]).await;

        let err = h
            .chats
            .create_group(&uid("a"), "crew", vec![uid("b"), uid("a"), uid("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidMessage(ref m) if m.contains("More than 2 users")));

        let group = h
            .chats
            .create_group(&uid("a"), "crew", vec![uid("b"), uid("c")])
            .await
            .unwrap();
        assert!(group.is_group_chat);
        assert_eq!(group.users.len(), 3);
        assert_eq!(group.group_admin.map(|p| p.id), Some(uid("a")));
    }

    #[tokio::test]
    async fn test_group_membership_rules() {
        let h = harness(&["a", "b", "c", "d"]).await;
        let group = h
            .chats
            .create_group(&uid("a"), "crew", vec![uid("b"), uid("c")])
            .await
            .unwrap();

        assert!(matches!(
            h.chats.add_to_group(&uid("b"), group.id, uid("d")).await,
            Err(ServerError::Forbidden(_))
        ));
        let view = h.chats.add_to_group(&uid("a"), group.id, uid("d")).await.unwrap();
        assert_eq!(view.users.len(), 4);
        let view = h.chats.add_to_group(&uid("a"), group.id, uid("d")).await.unwrap();
        assert_eq!(view.users.len(), 4);

        assert!(matches!(
            h.chats.remove_from_group(&uid("b"), group.id, uid("c")).await,
            Err(ServerError::Forbidden(_))
        ));
        // Leaving is always allowed.
        h.chats.remove_from_group(&uid("b"), group.id, uid("b")).await.unwrap();
        assert!(!h.chats.is_member(group.id, &uid("b")).await.unwrap());

        let renamed = h.chats.rename_group(&uid("c"), group.id, " ops ").await.unwrap();
        assert_eq!(renamed.chat_name.as_deref(), Some("ops"));
        assert!(matches!(
            h.chats.rename_group(&uid("b"), group.id, "nope").await,
            Err(ServerError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_removed_member_evicted_from_room() {
        let h = harness(&["a", "b", "c"]).await;
        let group = h
            .chats
            .create_group(&uid("a"), "crew", vec![uid("b"), uid("c")])
            .await
            .unwrap();
        let (conn, _rx) = h.gateway.connect().await;
        h.gateway.bind_user(conn, &uid("c")).await.unwrap();
        h.gateway.join(conn, Room::Chat(group.id)).await;

        h.chats.remove_from_group(&uid("a"), group.id, uid("c")).await.unwrap();
        assert!(!h.gateway.is_subscribed(conn, &Room::Chat(group.id)).await);
    }

    #[tokio::test]
    async fn test_reopened_chat_starts_empty_for_requester() {
        let h = harness(&["u1", "u2"]).await;
        let chat = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        for text in ["one", "two"] {
            h.chats
                .send_message(&uid("u2"), chat.id, Some(text.into()), None)
                .await
                .unwrap();
        }

        h.chats.delete_chat_for_me(&uid("u1"), chat.id).await.unwrap();
        h.chats.delete_chat_for_me(&uid("u1"), chat.id).await.unwrap();
        assert!(h.chats.fetch_chats(&uid("u1"), false).await.unwrap().is_empty());

        let reopened = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        assert_eq!(reopened.id, chat.id);
        assert!(reopened.latest_message.is_none());
        assert!(h.chats.all_messages(&uid("u1"), chat.id).await.unwrap().is_empty());
        assert_eq!(h.chats.all_messages(&uid("u2"), chat.id).await.unwrap().len(), 2);
        assert_eq!(h.chats.fetch_chats(&uid("u1"), false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_message_is_viewer_relative() {
        let h = harness(&["u1", "u2"]).await;
        let chat = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        h.chats
            .send_message(&uid("u1"), chat.id, Some("one".into()), None)
            .await
            .unwrap();
        let two = h
            .chats
            .send_message(&uid("u1"), chat.id, Some("two".into()), None)
            .await
            .unwrap();

        h.chats.delete_message(&uid("u2"), two.id).await.unwrap();

        let for_u2 = h.chats.fetch_chats(&uid("u2"), false).await.unwrap();
        assert_eq!(for_u2[0].latest_message.as_ref().unwrap().content, "one");
        let for_u1 = h.chats.fetch_chats(&uid("u1"), false).await.unwrap();
        assert_eq!(for_u1[0].latest_message.as_ref().unwrap().content, "two");
    }

    #[tokio::test]
    async fn test_archive_moves_between_lists() {
        let h = harness(&["u1", "u2"]).await;
        let chat = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();

        let view = h.chats.set_archived(&uid("u1"), chat.id, true).await.unwrap();
        assert!(view.archived);
        assert!(h.chats.fetch_chats(&uid("u1"), false).await.unwrap().is_empty());
        assert_eq!(h.chats.fetch_chats(&uid("u1"), true).await.unwrap().len(), 1);
        assert_eq!(h.chats.fetch_chats(&uid("u2"), false).await.unwrap().len(), 1);

        h.chats.set_archived(&uid("u1"), chat.id, false).await.unwrap();
        assert_eq!(h.chats.fetch_chats(&uid("u1"), false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_member_cannot_send_or_read() {
        let h = harness(&["u1", "u2", "u3"]).await;
        let chat = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        assert!(matches!(
            h.chats.send_message(&uid("u3"), chat.id, Some("hey".into()), None).await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            h.chats.all_messages(&uid("u3"), chat.id).await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            h.chats.send_message(&uid("u1"), chat.id, Some("   ".into()), None).await,
            Err(ServerError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_migrates_local_attachment() {
        let h = harness(&["u1", "u2", "u3"]).await;
        let first = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        let second = h.chats.access_chat(&uid("u2"), Some(uid("u3"))).await.unwrap();

        let uri = h.chats.attachments().save_upload("pic.png", b"png").await.unwrap();
        let original = h
            .chats
            .send_message(&uid("u1"), first.id, None, Some(uri.clone()))
            .await
            .unwrap();

        let forwarded = h
            .chats
            .forward_message(&uid("u2"), original.id, second.id)
            .await
            .unwrap();
        let attachment = forwarded.attachment.unwrap();
        assert!(attachment.starts_with("http://localhost:5000/blob/"));
        let from = forwarded.forwarded_from.unwrap();
        assert_eq!(from.user_id, uid("u1"));
        assert_eq!(from.name, "U1");
        assert_eq!(from.original_chat, first.id);

        // u3 cannot see the source message.
        assert!(matches!(
            h.chats.forward_message(&uid("u3"), original.id, second.id).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_falls_back_to_original_uri() {
        let h = harness(&["u1", "u2"]).await;
        let chat = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        let missing = "http://localhost:5000/uploads/123-gone.png".to_string();
        let original = h
            .chats
            .send_message(&uid("u1"), chat.id, Some("look".into()), Some(missing.clone()))
            .await
            .unwrap();

        let forwarded = h
            .chats
            .forward_message(&uid("u1"), original.id, chat.id)
            .await
            .unwrap();
        assert_eq!(forwarded.attachment, Some(missing));
        assert_eq!(forwarded.content, "look");
    }

    #[tokio::test]
    async fn test_call_log_summary() {
        let h = harness(&["u1", "u2"]).await;
        let chat = h.chats.access_chat(&uid("u1"), Some(uid("u2"))).await.unwrap();
        let logged = h
            .chats
            .log_call(
                &uid("u1"),
                chat.id,
                CallInfo {
                    call_type: CallType::Video,
                    direction: CallDirection::Outgoing,
                    status: CallStatus::Missed,
                    from: uid("u2"),
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(logged.content, "Missed video call");
        assert_eq!(logged.call_info.unwrap().status, CallStatus::Missed);
    }
}
