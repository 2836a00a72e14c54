//! CRUD operations for [`User`] records.

use rusqlite::params;

use murmur_shared::types::UserId;

use crate::database::{parse_ts, ts, Database};
use crate::error::{not_found, Result};
use crate::models::User;

impl Database {
    /// Insert a user or refresh its display name. An existing avatar is kept
    /// when the new record carries none.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, name, pic, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 pic  = COALESCE(excluded.pic, users.pic)",
            params![user.id.as_str(), user.name, user.pic, ts(&user.created_at)],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, name, pic, created_at FROM users WHERE id = ?1",
                params![id.as_str()],
                row_to_user,
            )
            .map_err(not_found)
    }

    pub fn user_exists(&self, id: &UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM users WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch the users that exist among `ids`, in the order given.
    pub fn get_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT id, name, pic, created_at FROM users WHERE id = ?1")?;

        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            match stmt.query_row(params![id.as_str()], row_to_user) {
                Ok(user) => users.push(user),
                Err(rusqlite::Error::QueryReturnedNoRows) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(users)
    }

    /// Case-insensitive search over name and id, excluding `exclude`.
    pub fn search_users(&self, query: &str, exclude: &UserId, limit: u32) -> Result<Vec<User>> {
        let pattern = format!("%{}%", escape_like(&query.trim().to_lowercase()));
        let mut stmt = self.conn().prepare(
            "SELECT id, name, pic, created_at
             FROM users
             WHERE id != ?1
               AND (lower(name) LIKE ?2 ESCAPE '\\' OR lower(id) LIKE ?2 ESCAPE '\\')
             ORDER BY name ASC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![exclude.as_str(), pattern, limit], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let created_str: String = row.get(3)?;
    Ok(User {
        id: UserId(id),
        name: row.get(1)?,
        pic: row.get(2)?,
        created_at: parse_ts(3, &created_str)?,
    })
}

/// Make `%`, `_` and `\` match literally in a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
