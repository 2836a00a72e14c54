//! CRUD operations for [`Chat`] records and their per-user overlays.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use murmur_shared::types::{ChatId, MessageId, UserId};

use crate::database::{parse_ts, parse_uuid, ts, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::{AccessOutcome, Chat, NewGroupChat};

const CHAT_COLUMNS: &str = "c.id, c.chat_name, c.is_group_chat, c.group_admin, \
                            c.latest_message_id, c.pic, c.created_at, c.updated_at";

/// Key identifying a one-to-one chat by its unordered member pair.
fn pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}\u{1f}{}", lo, hi)
}

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a chat with its members and overlays.
    pub fn get_chat(&self, id: ChatId) -> Result<Chat> {
        let mut chat = self
            .conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats c WHERE c.id = ?1"),
                params![id.to_string()],
                row_to_chat,
            )
            .map_err(not_found)?;
        self.load_chat_sets(&mut chat)?;
        Ok(chat)
    }

    /// Find the one-to-one chat between two users, if any.
    pub fn find_one_to_one_chat(&self, a: &UserId, b: &UserId) -> Result<Option<Chat>> {
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats c WHERE c.pair_key = ?1"),
                params![pair_key(a, b)],
                row_to_chat,
            )
            .optional()?;

        match found {
            Some(mut chat) => {
                self.load_chat_sets(&mut chat)?;
                Ok(Some(chat))
            }
            None => Ok(None),
        }
    }

    /// Chats `user` belongs to and has not deleted, split by whether the user
    /// archived them. Most recently active first.
    pub fn list_chats_for_user(&self, user: &UserId, archived: bool) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS}
             FROM chats c
             JOIN chat_members m ON m.chat_id = c.id AND m.user_id = ?1
             WHERE NOT EXISTS (
                 SELECT 1 FROM chat_deleted d WHERE d.chat_id = c.id AND d.user_id = ?1
             )
             AND EXISTS (
                 SELECT 1 FROM chat_archived a WHERE a.chat_id = c.id AND a.user_id = ?1
             ) = ?2
             ORDER BY c.updated_at DESC, c.rowid DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str(), archived], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            let mut chat = row?;
            self.load_chat_sets(&mut chat)?;
            chats.push(chat);
        }
        Ok(chats)
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Find or create the one-to-one chat between `requester` and `other`.
    ///
    /// Runs as a single transaction so concurrent callers for the same pair
    /// converge on one chat. When the requester had deleted the chat it is
    /// restored for them and every existing message is marked deleted for
    /// them only.
    pub fn access_one_to_one_chat(
        &self,
        requester: &UserId,
        other: &UserId,
    ) -> Result<(Chat, AccessOutcome)> {
        if requester == other {
            return Err(StoreError::Constraint(
                "a one-to-one chat needs two distinct users".into(),
            ));
        }

        let key = pair_key(requester, other);
        let tx = self.conn().unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM chats WHERE pair_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let (chat_id, outcome) = match existing {
            Some(id_str) => {
                let restored = tx.execute(
                    "DELETE FROM chat_deleted WHERE chat_id = ?1 AND user_id = ?2",
                    params![id_str, requester.as_str()],
                )?;
                if restored > 0 {
                    tx.execute(
                        "INSERT OR IGNORE INTO message_deleted (message_id, user_id)
                         SELECT id, ?2 FROM messages WHERE chat_id = ?1",
                        params![id_str, requester.as_str()],
                    )?;
                }
                let id = ChatId(
                    uuid::Uuid::parse_str(&id_str)
                        .map_err(|e| StoreError::Constraint(format!("bad chat id: {e}")))?,
                );
                let outcome = if restored > 0 {
                    AccessOutcome::Reactivated
                } else {
                    AccessOutcome::Existing
                };
                (id, outcome)
            }
            None => {
                let id = ChatId::new();
                let now = ts(&Utc::now());
                tx.execute(
                    "INSERT INTO chats (id, chat_name, is_group_chat, pair_key, created_at, updated_at)
                     VALUES (?1, NULL, 0, ?2, ?3, ?3)",
                    params![id.to_string(), key, now],
                )?;
                for member in [requester, other] {
                    tx.execute(
                        "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
                        params![id.to_string(), member.as_str()],
                    )?;
                }
                (id, AccessOutcome::Created)
            }
        };

        tx.commit()?;

        tracing::debug!(chat = %chat_id, ?outcome, "accessed one-to-one chat");
        Ok((self.get_chat(chat_id)?, outcome))
    }

    /// Create a group chat administered by `new.admin`.
    pub fn create_group_chat(&self, new: &NewGroupChat) -> Result<Chat> {
        let mut members: Vec<&UserId> = vec![&new.admin];
        for invitee in &new.invitees {
            if !members.contains(&invitee) {
                members.push(invitee);
            }
        }
        if members.len() < 3 {
            return Err(StoreError::Constraint(
                "a group chat needs at least three members".into(),
            ));
        }

        let id = ChatId::new();
        let now = ts(&Utc::now());
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO chats (id, chat_name, is_group_chat, group_admin, pic, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?5)",
            params![
                id.to_string(),
                new.name,
                new.admin.as_str(),
                murmur_shared::constants::DEFAULT_GROUP_PIC,
                now,
            ],
        )?;
        for member in members {
            tx.execute(
                "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
                params![id.to_string(), member.as_str()],
            )?;
        }
        tx.commit()?;

        self.get_chat(id)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub fn rename_chat(&self, id: ChatId, name: &str) -> Result<Chat> {
        let affected = self.conn().execute(
            "UPDATE chats SET chat_name = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), name, ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_chat(id)
    }

    /// Add a member. Adding an existing member is a no-op.
    pub fn add_chat_member(&self, id: ChatId, user: &UserId) -> Result<Chat> {
        self.ensure_chat(id)?;
        self.conn().execute(
            "INSERT OR IGNORE INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
            params![id.to_string(), user.as_str()],
        )?;
        self.get_chat(id)
    }

    pub fn remove_chat_member(&self, id: ChatId, user: &UserId) -> Result<Chat> {
        self.ensure_chat(id)?;
        self.conn().execute(
            "DELETE FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
            params![id.to_string(), user.as_str()],
        )?;
        self.get_chat(id)
    }

    /// Add or remove `user` from the chat's archived set.
    pub fn set_chat_archived(&self, id: ChatId, user: &UserId, archived: bool) -> Result<Chat> {
        self.ensure_chat(id)?;
        let sql = if archived {
            "INSERT OR IGNORE INTO chat_archived (chat_id, user_id) VALUES (?1, ?2)"
        } else {
            "DELETE FROM chat_archived WHERE chat_id = ?1 AND user_id = ?2"
        };
        self.conn()
            .execute(sql, params![id.to_string(), user.as_str()])?;
        self.get_chat(id)
    }

    /// Hide the chat and all of its current messages for `user`.
    pub fn delete_chat_for_user(&self, id: ChatId, user: &UserId) -> Result<Chat> {
        self.ensure_chat(id)?;
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO chat_deleted (chat_id, user_id) VALUES (?1, ?2)",
            params![id.to_string(), user.as_str()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO message_deleted (message_id, user_id)
             SELECT id, ?2 FROM messages WHERE chat_id = ?1",
            params![id.to_string(), user.as_str()],
        )?;
        tx.commit()?;
        self.get_chat(id)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(crate) fn ensure_chat(&self, id: ChatId) -> Result<()> {
        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM chats WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        exists.map(|_| ()).ok_or(StoreError::NotFound)
    }

    fn load_chat_sets(&self, chat: &mut Chat) -> Result<()> {
        let id = chat.id.to_string();
        chat.users = self.user_set(
            "SELECT user_id FROM chat_members WHERE chat_id = ?1 ORDER BY rowid",
            &id,
        )?;
        chat.archived_by = self.user_set(
            "SELECT user_id FROM chat_archived WHERE chat_id = ?1 ORDER BY rowid",
            &id,
        )?;
        chat.deleted_by = self.user_set(
            "SELECT user_id FROM chat_deleted WHERE chat_id = ?1 ORDER BY rowid",
            &id,
        )?;
        Ok(())
    }

    pub(crate) fn user_set(&self, sql: &str, key: &str) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(UserId(row?));
        }
        Ok(users)
    }
}

/// Map a `rusqlite::Row` to a [`Chat`] without its member sets.
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id_str: String = row.get(0)?;
    let group_admin: Option<String> = row.get(3)?;
    let latest: Option<String> = row.get(4)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    let latest_message_id = latest
        .map(|s| parse_uuid(4, &s).map(MessageId))
        .transpose()?;

    Ok(Chat {
        id: ChatId(parse_uuid(0, &id_str)?),
        chat_name: row.get(1)?,
        is_group_chat: row.get(2)?,
        users: Vec::new(),
        group_admin: group_admin.map(UserId),
        latest_message_id,
        archived_by: Vec::new(),
        deleted_by: Vec::new(),
        pic: row.get(5)?,
        created_at: parse_ts(6, &created_str)?,
        updated_at: parse_ts(7, &updated_str)?,
    })
}
