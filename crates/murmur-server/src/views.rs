//! Populated views built from store records plus live presence.

use std::collections::{HashMap, HashSet};

use murmur_shared::constants::DEFAULT_USER_PIC;
use murmur_shared::protocol::{
    ChatSnapshot, ChatView, LatestMessageView, MessageView, UserProfile,
};
use murmur_shared::types::UserId;
use murmur_store::{Chat, Message, User};

/// Known profiles and the online set at the time a view is built.
pub struct Directory {
    users: HashMap<UserId, User>,
    online: HashSet<UserId>,
}

impl Directory {
    pub fn new(users: impl IntoIterator<Item = User>, online: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
            online: online.into_iter().collect(),
        }
    }

    /// Users without a stored profile show their id as name.
    pub fn profile(&self, id: &UserId) -> UserProfile {
        let (name, pic) = match self.users.get(id) {
            Some(user) => (
                user.name.clone(),
                user.pic.clone().unwrap_or_else(|| DEFAULT_USER_PIC.to_string()),
            ),
            None => (id.to_string(), DEFAULT_USER_PIC.to_string()),
        };
        UserProfile {
            id: id.clone(),
            name,
            pic,
            online: self.online.contains(id),
        }
    }
}

/// Every user id a chat view or message view may need a profile for.
pub fn referenced_users(chat: &Chat, messages: &[&Message]) -> Vec<UserId> {
    let mut ids = chat.users.clone();
    ids.extend(chat.group_admin.iter().cloned());
    for m in messages {
        ids.push(m.sender.clone());
    }
    ids.sort();
    ids.dedup();
    ids
}

pub fn chat_snapshot(chat: &Chat, dir: &Directory) -> ChatSnapshot {
    ChatSnapshot {
        id: chat.id,
        chat_name: chat.chat_name.clone(),
        is_group_chat: chat.is_group_chat,
        users: chat.users.iter().map(|u| dir.profile(u)).collect(),
        group_admin: chat.group_admin.clone(),
        latest_message: chat.latest_message_id,
    }
}

pub fn message_view(message: &Message, chat: &Chat, dir: &Directory) -> MessageView {
    MessageView {
        id: message.id,
        sender: dir.profile(&message.sender),
        content: message.content.clone(),
        attachment: message.attachment.clone(),
        chat: chat_snapshot(chat, dir),
        forwarded_from: message.forwarded_from.clone(),
        call_info: message.call_info.clone(),
        created_at: message.created_at,
    }
}

/// A chat as seen by `viewer`, with `latest` already filtered for them.
pub fn chat_view(chat: &Chat, latest: Option<&Message>, viewer: &UserId, dir: &Directory) -> ChatView {
    ChatView {
        id: chat.id,
        chat_name: chat.chat_name.clone(),
        is_group_chat: chat.is_group_chat,
        users: chat.users.iter().map(|u| dir.profile(u)).collect(),
        group_admin: chat.group_admin.as_ref().map(|a| dir.profile(a)),
        latest_message: latest.map(|m| LatestMessageView {
            id: m.id,
            sender: dir.profile(&m.sender),
            content: m.content.clone(),
            attachment: m.attachment.clone(),
            created_at: m.created_at,
        }),
        pic: chat.pic.clone(),
        archived: chat.is_archived_for(viewer),
        created_at: chat.created_at,
        updated_at: chat.updated_at,
    }
}
