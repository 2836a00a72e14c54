//! Domain model structs persisted in SQLite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use murmur_shared::types::{CallInfo, ChatId, ForwardedFrom, MessageId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A known user. Profiles are upserted from verified identities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub pic: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            pic: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A one-to-one or group conversation with its per-user overlays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    /// Meaningful only for groups.
    pub chat_name: Option<String>,
    pub is_group_chat: bool,
    /// Members in join order.
    pub users: Vec<UserId>,
    pub group_admin: Option<UserId>,
    /// Most recent message regardless of any viewer's deletions.
    pub latest_message_id: Option<MessageId>,
    pub archived_by: Vec<UserId>,
    pub deleted_by: Vec<UserId>,
    pub pic: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn is_member(&self, user: &UserId) -> bool {
        self.users.contains(user)
    }

    pub fn is_archived_for(&self, user: &UserId) -> bool {
        self.archived_by.contains(user)
    }

    pub fn is_deleted_for(&self, user: &UserId) -> bool {
        self.deleted_by.contains(user)
    }

    pub fn is_admin(&self, user: &UserId) -> bool {
        self.group_admin.as_ref() == Some(user)
    }
}

/// Input for [`Database::create_group_chat`](crate::Database::create_group_chat).
#[derive(Debug, Clone)]
pub struct NewGroupChat {
    pub name: String,
    pub admin: UserId,
    /// Invitees; the admin is added automatically.
    pub invitees: Vec<UserId>,
}

/// What `access_one_to_one_chat` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    /// The chat existed and was visible to the requester.
    Existing,
    /// No chat existed for the pair.
    Created,
    /// The requester had deleted the chat; it is visible again with an
    /// empty history for them.
    Reactivated,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserId,
    pub content: String,
    pub attachment: Option<String>,
    pub forwarded_from: Option<ForwardedFrom>,
    pub call_info: Option<CallInfo>,
    pub deleted_by: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Visible iff the viewer has not hidden it and is still a member.
    pub fn is_visible_to(&self, viewer: &UserId, chat: &Chat) -> bool {
        !self.deleted_by.contains(viewer) && chat.is_member(viewer)
    }
}

/// Input for [`Database::insert_message`](crate::Database::insert_message).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender: UserId,
    pub content: String,
    pub attachment: Option<String>,
    pub forwarded_from: Option<ForwardedFrom>,
    pub call_info: Option<CallInfo>,
}

impl NewMessage {
    pub fn text(chat_id: ChatId, sender: UserId, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            sender,
            content: content.into(),
            attachment: None,
            forwarded_from: None,
            call_info: None,
        }
    }

    pub fn has_body(&self) -> bool {
        !self.content.trim().is_empty()
            || self.attachment.as_deref().is_some_and(|a| !a.trim().is_empty())
    }
}
