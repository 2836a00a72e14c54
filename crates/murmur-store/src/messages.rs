//! CRUD operations for [`Message`] records and the delete-for-me overlay.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use murmur_shared::types::{
    CallDirection, CallInfo, CallStatus, CallType, ChatId, ForwardedFrom, MessageId, UserId,
};

use crate::database::{parse_ts, parse_uuid, ts, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::{Message, NewMessage};

const MESSAGE_COLUMNS: &str = "m.id, m.chat_id, m.sender_id, m.content, m.attachment, \
                               m.fwd_name, m.fwd_user_id, m.fwd_chat_id, \
                               m.call_type, m.call_direction, m.call_status, m.call_from, \
                               m.call_timestamp, m.created_at";

impl Database {
    /// Insert a message and move the chat's shared latest pointer to it.
    ///
    /// Both writes happen in one transaction, so a concurrent reader never
    /// sees a pointer to a message that does not exist yet.
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        if !new.has_body() {
            return Err(StoreError::Constraint(
                "message needs content or an attachment".into(),
            ));
        }

        let message = Message {
            id: MessageId::new(),
            chat_id: new.chat_id,
            sender: new.sender.clone(),
            content: new.content.clone(),
            attachment: new.attachment.clone(),
            forwarded_from: new.forwarded_from.clone(),
            call_info: new.call_info.clone(),
            deleted_by: Vec::new(),
            created_at: Utc::now(),
        };

        let tx = self.conn().unchecked_transaction()?;
        let chat_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM chats WHERE id = ?1",
                params![message.chat_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if chat_exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let fwd = message.forwarded_from.as_ref();
        let call = message.call_info.as_ref();
        tx.execute(
            "INSERT INTO messages (id, chat_id, sender_id, content, attachment,
                                   fwd_name, fwd_user_id, fwd_chat_id,
                                   call_type, call_direction, call_status, call_from, call_timestamp,
                                   created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                message.id.to_string(),
                message.chat_id.to_string(),
                message.sender.as_str(),
                message.content,
                message.attachment,
                fwd.map(|f| f.name.clone()),
                fwd.map(|f| f.user_id.0.clone()),
                fwd.map(|f| f.original_chat.to_string()),
                call.map(|c| c.call_type.as_str()),
                call.map(|c| c.direction.as_str()),
                call.map(|c| c.status.as_str()),
                call.map(|c| c.from.0.clone()),
                call.map(|c| ts(&c.timestamp)),
                ts(&message.created_at),
            ],
        )?;
        tx.execute(
            "UPDATE chats SET latest_message_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                message.chat_id.to_string(),
                message.id.to_string(),
                ts(&message.created_at),
            ],
        )?;
        tx.commit()?;

        Ok(message)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let mut message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)?;
        message.deleted_by = self.message_deleted_by(id)?;
        Ok(message)
    }

    /// Messages of `chat_id` that `viewer` has not deleted, oldest first.
    ///
    /// Membership is the caller's concern; this only applies the overlay.
    pub fn list_messages(&self, chat_id: ChatId, viewer: &UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             WHERE m.chat_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM message_deleted d
                   WHERE d.message_id = m.id AND d.user_id = ?2
               )
             ORDER BY m.seq ASC"
        ))?;

        let rows = stmt.query_map(
            params![chat_id.to_string(), viewer.as_str()],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            message.deleted_by = self.message_deleted_by(message.id)?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Most recent message of `chat_id` that `viewer` has not deleted.
    pub fn latest_visible_message(
        &self,
        chat_id: ChatId,
        viewer: &UserId,
    ) -> Result<Option<Message>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS}
                     FROM messages m
                     WHERE m.chat_id = ?1
                       AND NOT EXISTS (
                           SELECT 1 FROM message_deleted d
                           WHERE d.message_id = m.id AND d.user_id = ?2
                       )
                     ORDER BY m.seq DESC
                     LIMIT 1"
                ),
                params![chat_id.to_string(), viewer.as_str()],
                row_to_message,
            )
            .optional()?;

        match found {
            Some(mut message) => {
                message.deleted_by = self.message_deleted_by(message.id)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Hide a message for `user`. Returns `false` when it was already hidden.
    pub fn mark_message_deleted_for_user(&self, id: MessageId, user: &UserId) -> Result<bool> {
        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO message_deleted (message_id, user_id) VALUES (?1, ?2)",
            params![id.to_string(), user.as_str()],
        )?;
        Ok(affected > 0)
    }

    fn message_deleted_by(&self, id: MessageId) -> Result<Vec<UserId>> {
        self.user_set(
            "SELECT user_id FROM message_deleted WHERE message_id = ?1 ORDER BY rowid",
            &id.to_string(),
        )
    }
}

fn conversion_error(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid {what}: {value}").into(),
    )
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let chat_str: String = row.get(1)?;
    let sender: String = row.get(2)?;

    let fwd_name: Option<String> = row.get(5)?;
    let fwd_user: Option<String> = row.get(6)?;
    let fwd_chat: Option<String> = row.get(7)?;
    let forwarded_from = match (fwd_user, fwd_chat) {
        (Some(user), Some(chat)) => Some(ForwardedFrom {
            name: fwd_name.unwrap_or_default(),
            user_id: UserId(user),
            original_chat: ChatId(parse_uuid(7, &chat)?),
        }),
        _ => None,
    };

    let call_type: Option<String> = row.get(8)?;
    let call_info = match call_type {
        Some(kind) => {
            let direction: String = row.get(9)?;
            let status: String = row.get(10)?;
            let from: String = row.get(11)?;
            let when: String = row.get(12)?;
            Some(CallInfo {
                call_type: CallType::from_str_opt(&kind)
                    .ok_or_else(|| conversion_error(8, "call type", &kind))?,
                direction: CallDirection::from_str_opt(&direction)
                    .ok_or_else(|| conversion_error(9, "call direction", &direction))?,
                status: CallStatus::from_str_opt(&status)
                    .ok_or_else(|| conversion_error(10, "call status", &status))?,
                from: UserId(from),
                timestamp: parse_ts(12, &when)?,
            })
        }
        None => None,
    };

    let created_str: String = row.get(13)?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        chat_id: ChatId(parse_uuid(1, &chat_str)?),
        sender: UserId(sender),
        content: row.get(3)?,
        attachment: row.get(4)?,
        forwarded_from,
        call_info,
        deleted_by: Vec::new(),
        created_at: parse_ts(13, &created_str)?,
    })
}
