//! # murmur-store
//!
//! Durable chat state for murmur, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` with typed helpers for users, chats and messages,
//! and a cloneable [`SharedDatabase`] that runs those helpers on the tokio
//! blocking pool so async callers never hold a connection across an await.
//!
//! Per-viewer visibility (archive, delete-for-me) is stored as membership
//! tables with set semantics, so every overlay write is idempotent.

pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod shared;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use shared::SharedDatabase;
