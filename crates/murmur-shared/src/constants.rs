/// Application name
pub const APP_NAME: &str = "murmur";

/// Default HTTP port (REST + WebSocket)
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Maximum attachment upload size in bytes (50 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 50 * 1024 * 1024;

/// Capacity of each connection's outbound event queue
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// How many recently distributed message IDs the relay remembers for dedup
pub const RECENT_MESSAGE_WINDOW: usize = 4096;

/// Minimum number of invitees (creator excluded) for a group chat
pub const MIN_GROUP_INVITEES: usize = 2;

/// Default avatar for group chats
pub const DEFAULT_GROUP_PIC: &str =
    "https://icon-library.com/images/group-icon-png/group-icon-png-12.jpg";

/// Default avatar for users without one
pub const DEFAULT_USER_PIC: &str =
    "https://icon-library.com/images/anonymous-avatar-icon/anonymous-avatar-icon-25.jpg";
