//! Realtime wire protocol and the populated views served over REST.
//!
//! Frames are JSON text of the form `{"event": "<name>", "data": <payload>}`.
//! Event names match the browser client (`"join chat"`, `"message received"`,
//! `"call-offer"`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CallInfo, ChatId, ForwardedFrom, MessageId, UserId};

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A user as shown inside chats and messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pic: String,
    #[serde(default)]
    pub online: bool,
}

/// Membership snapshot of a chat, embedded in every message payload.
///
/// The relay fans out to `users` as they were when the payload was built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    #[serde(alias = "_id")]
    pub id: ChatId,
    #[serde(default)]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub is_group_chat: bool,
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub group_admin: Option<UserId>,
    #[serde(default)]
    pub latest_message: Option<MessageId>,
}

/// A fully populated message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(alias = "_id")]
    pub id: MessageId,
    pub sender: UserProfile,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachment: Option<String>,
    pub chat: ChatSnapshot,
    #[serde(default)]
    pub forwarded_from: Option<ForwardedFrom>,
    #[serde(default)]
    pub call_info: Option<CallInfo>,
    pub created_at: DateTime<Utc>,
}

impl MessageView {
    /// Content may be empty only when an attachment is present.
    pub fn has_body(&self) -> bool {
        !self.content.trim().is_empty()
            || self.attachment.as_deref().is_some_and(|a| !a.trim().is_empty())
    }
}

/// Latest message preview shown in a chat list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessageView {
    pub id: MessageId,
    pub sender: UserProfile,
    pub content: String,
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A chat as listed for one viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub id: ChatId,
    pub chat_name: Option<String>,
    pub is_group_chat: bool,
    pub users: Vec<UserProfile>,
    pub group_admin: Option<UserProfile>,
    /// Latest message visible to the viewer (not the shared pointer).
    pub latest_message: Option<LatestMessageView>,
    pub pic: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Identity asserted by `setup`: either a bare id or a user object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SetupPayload {
    Id(UserId),
    Profile {
        #[serde(alias = "_id")]
        id: UserId,
    },
}

impl SetupPayload {
    pub fn user_id(&self) -> &UserId {
        match self {
            SetupPayload::Id(id) => id,
            SetupPayload::Profile { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "setup")]
    Setup(SetupPayload),

    /// Room id of the chat the client just opened.
    #[serde(rename = "join chat")]
    JoinChat(String),

    #[serde(rename = "typing")]
    Typing(String),

    #[serde(rename = "stop typing")]
    StopTyping(String),

    /// Kept raw so a malformed message maps to `InvalidMessage`, not a
    /// frame-level parse failure.
    #[serde(rename = "new message")]
    NewMessage(Value),

    #[serde(rename = "call-offer")]
    CallOffer(Value),

    #[serde(rename = "call-answer")]
    CallAnswer(Value),

    #[serde(rename = "ice-candidate")]
    IceCandidate(Value),

    #[serde(rename = "call-reject")]
    CallReject(Value),

    #[serde(rename = "call-hangup")]
    CallHangup(Value),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Setup(_) => "setup",
            ClientEvent::JoinChat(_) => "join chat",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::StopTyping(_) => "stop typing",
            ClientEvent::NewMessage(_) => "new message",
            ClientEvent::CallOffer(_) => SignalKind::Offer.event_name(),
            ClientEvent::CallAnswer(_) => SignalKind::Answer.event_name(),
            ClientEvent::IceCandidate(_) => SignalKind::IceCandidate.event_name(),
            ClientEvent::CallReject(_) => SignalKind::Reject.event_name(),
            ClientEvent::CallHangup(_) => SignalKind::Hangup.event_name(),
        }
    }

    /// Split a call-control event into its kind and opaque payload.
    pub fn into_signal(self) -> Result<(SignalKind, Value), ClientEvent> {
        match self {
            ClientEvent::CallOffer(v) => Ok((SignalKind::Offer, v)),
            ClientEvent::CallAnswer(v) => Ok((SignalKind::Answer, v)),
            ClientEvent::IceCandidate(v) => Ok((SignalKind::IceCandidate, v)),
            ClientEvent::CallReject(v) => Ok((SignalKind::Reject, v)),
            ClientEvent::CallHangup(v) => Ok((SignalKind::Hangup, v)),
            other => Err(other),
        }
    }
}

/// The five call-control steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Reject,
    Hangup,
}

impl SignalKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalKind::Offer => "call-offer",
            SignalKind::Answer => "call-answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Reject => "call-reject",
            SignalKind::Hangup => "call-hangup",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "typing")]
    Typing(ChatId),

    #[serde(rename = "stop typing")]
    StopTyping(ChatId),

    #[serde(rename = "message received")]
    MessageReceived(Box<MessageView>),

    #[serde(rename = "online-users")]
    OnlineUsers(Vec<UserId>),

    #[serde(rename = "call-offer")]
    CallOffer(Value),

    #[serde(rename = "call-answer")]
    CallAnswer(Value),

    #[serde(rename = "ice-candidate")]
    IceCandidate(Value),

    #[serde(rename = "call-reject")]
    CallReject(Value),

    #[serde(rename = "call-hangup")]
    CallHangup(Value),

    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn signal(kind: SignalKind, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => ServerEvent::CallOffer(payload),
            SignalKind::Answer => ServerEvent::CallAnswer(payload),
            SignalKind::IceCandidate => ServerEvent::IceCandidate(payload),
            SignalKind::Reject => ServerEvent::CallReject(payload),
            SignalKind::Hangup => ServerEvent::CallHangup(payload),
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            kind: kind.to_string(),
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected => "connected",
            ServerEvent::Typing(_) => "typing",
            ServerEvent::StopTyping(_) => "stop typing",
            ServerEvent::MessageReceived(_) => "message received",
            ServerEvent::OnlineUsers(_) => "online-users",
            ServerEvent::CallOffer(_) => SignalKind::Offer.event_name(),
            ServerEvent::CallAnswer(_) => SignalKind::Answer.event_name(),
            ServerEvent::IceCandidate(_) => SignalKind::IceCandidate.event_name(),
            ServerEvent::CallReject(_) => SignalKind::Reject.event_name(),
            ServerEvent::CallHangup(_) => SignalKind::Hangup.event_name(),
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_names_with_spaces() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"join chat","data":"abc"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::JoinChat(ref room) if room == "abc"));

        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"stop typing","data":"abc"}"#).unwrap();
        assert_eq!(ev.name(), "stop typing");
    }

    #[test]
    fn test_setup_accepts_id_or_user_object() {
        let ev: ClientEvent = serde_json::from_str(r#"{"event":"setup","data":"u1"}"#).unwrap();
        let ClientEvent::Setup(p) = ev else { panic!("expected setup") };
        assert_eq!(p.user_id(), &UserId::new("u1"));

        let ev: ClientEvent = serde_json::from_str(
            r#"{"event":"setup","data":{"_id":"u2","name":"Bob","email":"b@x"}}"#,
        )
        .unwrap();
        let ClientEvent::Setup(p) = ev else { panic!("expected setup") };
        assert_eq!(p.user_id(), &UserId::new("u2"));
    }

    #[test]
    fn test_signal_events_keep_payload_opaque() {
        let frame = json!({
            "event": "call-offer",
            "data": {"to": "u2", "sdp": {"type": "offer", "sdp": "v=0..."}, "extra": [1, 2]}
        });
        let ev: ClientEvent = serde_json::from_value(frame.clone()).unwrap();
        let (kind, payload) = ev.into_signal().unwrap();
        assert_eq!(kind, SignalKind::Offer);
        assert_eq!(payload, frame["data"]);

        let out = ServerEvent::signal(kind, payload);
        assert_eq!(serde_json::to_value(&out).unwrap(), frame);
    }

    #[test]
    fn test_unit_server_event_has_no_data() {
        let json = ServerEvent::Connected.to_json().unwrap();
        assert_eq!(json, r#"{"event":"connected"}"#);
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"explode","data":1}"#).is_err());
    }

    #[test]
    fn test_message_body_rule() {
        let mut view = MessageView {
            id: MessageId::new(),
            sender: UserProfile {
                id: UserId::new("u1"),
                name: "A".into(),
                pic: String::new(),
                online: false,
            },
            content: "   ".into(),
            attachment: None,
            chat: ChatSnapshot {
                id: ChatId::new(),
                chat_name: None,
                is_group_chat: false,
                users: vec![],
                group_admin: None,
                latest_message: None,
            },
            forwarded_from: None,
            call_info: None,
            created_at: Utc::now(),
        };
        assert!(!view.has_body());
        view.attachment = Some("http://localhost/uploads/a.png".into());
        assert!(view.has_body());
    }
}
