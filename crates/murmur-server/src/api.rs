use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, Method},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use murmur_shared::protocol::{ChatView, MessageView, UserProfile};
use murmur_shared::types::{CallInfo, ChatId, MessageId, UserId};
use murmur_store::SharedDatabase;

use crate::attachments::AttachmentStore;
use crate::auth::IdentityGate;
use crate::chats::ChatService;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gateway::Gateway;
use crate::presence::PresenceTracker;
use crate::realtime::Realtime;
use crate::relay::MessageRelay;
use crate::signaling::SignalingRelay;
use crate::ws::handle_websocket;

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<IdentityGate>,
    pub chats: ChatService,
    pub realtime: Realtime,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire every subsystem around one gateway.
    pub async fn build(config: ServerConfig, db: SharedDatabase) -> Result<Self, ServerError> {
        let attachments = Arc::new(
            AttachmentStore::new(
                config.upload_path.clone(),
                config.blob_storage_path.clone(),
                config.public_base_url.clone(),
                config.max_attachment_size,
            )
            .await?,
        );

        let gateway = Gateway::new(config.outbound_buffer);
        let presence = PresenceTracker::new(gateway.clone());
        let relay = MessageRelay::new(gateway.clone());
        let signaling = SignalingRelay::new(gateway.clone(), config.strict_signaling);
        let chats = ChatService::new(
            db,
            gateway.clone(),
            presence.clone(),
            relay.clone(),
            attachments,
        );
        let realtime = Realtime::new(gateway, presence, relay, signaling, chats.clone());

        Ok(Self {
            identity: Arc::new(IdentityGate::new(config.auth_server_pubkey)),
            chats,
            realtime,
            config: Arc::new(config),
        })
    }

    /// Verify the bearer token and refresh the caller's profile.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<UserId, ServerError> {
        let identity = self.identity.verify_headers(headers)?;
        self.chats.register_identity(&identity).await?;
        Ok(identity.user_id)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    // Multipart framing on top of the attachment itself.
    let body_limit = state.config.max_attachment_size + 64 * 1024;
    let uploads = ServeDir::new(state.chats.attachments().upload_dir());

    Router::new()
        .route("/health", get(health_check))
        .route("/api/user", get(search_users))
        .route("/api/user/:id", get(get_user))
        .route("/api/chat", post(access_chat).get(fetch_chats))
        .route("/api/chat/archived", get(fetch_archived_chats))
        .route("/api/chat/group", post(create_group_chat))
        .route("/api/chat/rename", put(rename_group))
        .route("/api/chat/groupadd", put(add_to_group))
        .route("/api/chat/groupremove", put(remove_from_group))
        .route("/api/chat/archive", put(archive_chat))
        .route("/api/chat/unarchive", put(unarchive_chat))
        .route("/api/chat/deleteforme", put(delete_chat_for_me))
        .route("/api/message", post(send_message))
        .route("/api/message/upload", post(upload_message))
        .route("/api/message/delete", put(delete_message))
        .route("/api/message/forward", post(forward_message))
        .route("/api/message/call-log", post(log_call))
        .route("/api/message/:chat_id", get(all_messages))
        .route("/api/online", get(online_users))
        .route("/blob/:id", get(blob_download))
        .route("/ws", get(handle_websocket))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
    online_users: usize,
}

#[derive(Serialize)]
struct StatusMessage {
    message: &'static str,
}

#[derive(Deserialize)]
struct SearchQuery {
    search: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessChatRequest {
    user_id: Option<UserId>,
}

/// Group invitees arrive either as a JSON array or as a JSON-encoded string.
#[derive(Deserialize)]
#[serde(untagged)]
enum GroupMembers {
    List(Vec<UserId>),
    Encoded(String),
}

impl GroupMembers {
    fn into_ids(self) -> Result<Vec<UserId>, ServerError> {
        match self {
            GroupMembers::List(ids) => Ok(ids),
            GroupMembers::Encoded(raw) => serde_json::from_str(&raw)
                .map_err(|e| ServerError::BadRequest(format!("invalid users list: {e}"))),
        }
    }
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: Option<String>,
    users: Option<GroupMembers>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    chat_id: ChatId,
    chat_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberRequest {
    chat_id: ChatId,
    user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    chat_id: ChatId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    chat_id: ChatId,
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteMessageRequest {
    message_id: MessageId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardRequest {
    message_id: MessageId,
    chat_id: ChatId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallLogRequest {
    chat_id: ChatId,
    call_info: CallInfo,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.realtime.gateway().connection_count().await,
        online_users: state.chats.online_users().await.len(),
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

async fn search_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserProfile>>, ServerError> {
    let me = state.authenticate(&headers).await?;
    let users = state
        .chats
        .search_users(&me, query.search.as_deref().unwrap_or(""))
        .await?;
    Ok(Json(users))
}

async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<UserProfile>, ServerError> {
    state.authenticate(&headers).await?;
    Ok(Json(state.chats.user_profile(&UserId::new(id)).await?))
}

async fn online_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserId>>, ServerError> {
    state.authenticate(&headers).await?;
    Ok(Json(state.chats.online_users().await))
}

// ---------------------------------------------------------------------------
// Chats
// ---------------------------------------------------------------------------

async fn access_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AccessChatRequest>,
) -> Result<Json<ChatView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(state.chats.access_chat(&me, req.user_id).await?))
}

async fn fetch_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatView>>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(state.chats.fetch_chats(&me, false).await?))
}

async fn fetch_archived_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatView>>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(state.chats.fetch_chats(&me, true).await?))
}

async fn create_group_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<ChatView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    let (Some(name), Some(users)) = (req.name, req.users) else {
        return Err(ServerError::BadRequest("Please fill all the fields".into()));
    };
    let chat = state
        .chats
        .create_group(&me, &name, users.into_ids()?)
        .await?;
    Ok(Json(chat))
}

async fn rename_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RenameRequest>,
) -> Result<Json<ChatView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(
        state
            .chats
            .rename_group(&me, req.chat_id, &req.chat_name)
            .await?,
    ))
}

async fn add_to_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MemberRequest>,
) -> Result<Json<ChatView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(
        state.chats.add_to_group(&me, req.chat_id, req.user_id).await?,
    ))
}

async fn remove_from_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MemberRequest>,
) -> Result<Json<ChatView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(
        state
            .chats
            .remove_from_group(&me, req.chat_id, req.user_id)
            .await?,
    ))
}

async fn archive_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(state.chats.set_archived(&me, req.chat_id, true).await?))
}

async fn unarchive_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(state.chats.set_archived(&me, req.chat_id, false).await?))
}

async fn delete_chat_for_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<StatusMessage>, ServerError> {
    let me = state.authenticate(&headers).await?;
    state.chats.delete_chat_for_me(&me, req.chat_id).await?;
    Ok(Json(StatusMessage {
        message: "Chat deleted for you",
    }))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn all_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<Vec<MessageView>>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(state.chats.all_messages(&me, chat_id).await?))
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessageView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(
        state
            .chats
            .send_message(&me, req.chat_id, req.content, None)
            .await?,
    ))
}

/// Multipart send: `file`, `chatId` and optional `content`.
async fn upload_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<MessageView>, ServerError> {
    let me = state.authenticate(&headers).await?;

    let mut chat_id: Option<ChatId> = None;
    let mut content: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("attachment").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {e}")))?;
                file = Some((file_name, data.to_vec()));
            }
            "chatId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {e}")))?;
                chat_id = Some(
                    ChatId::parse(&text)
                        .map_err(|e| ServerError::BadRequest(format!("invalid chatId: {e}")))?,
                );
            }
            "content" => {
                content = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let chat_id = chat_id.ok_or_else(|| ServerError::BadRequest("Missing 'chatId' field".into()))?;

    let attachment = match file {
        Some((file_name, data)) => {
            let uri = state.chats.attachments().save_upload(&file_name, &data).await?;
            info!(user = %me, chat = %chat_id, size = data.len(), "Attachment uploaded");
            Some(uri)
        }
        None => None,
    };

    Ok(Json(
        state
            .chats
            .send_message(&me, chat_id, content, attachment)
            .await?,
    ))
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeleteMessageRequest>,
) -> Result<Json<StatusMessage>, ServerError> {
    let me = state.authenticate(&headers).await?;
    state.chats.delete_message(&me, req.message_id).await?;
    Ok(Json(StatusMessage {
        message: "Message deleted successfully",
    }))
}

async fn forward_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ForwardRequest>,
) -> Result<Json<MessageView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(
        state
            .chats
            .forward_message(&me, req.message_id, req.chat_id)
            .await?,
    ))
}

async fn log_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CallLogRequest>,
) -> Result<Json<MessageView>, ServerError> {
    let me = state.authenticate(&headers).await?;
    Ok(Json(
        state.chats.log_call(&me, req.chat_id, req.call_info).await?,
    ))
}

async fn blob_download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Vec<u8>, ServerError> {
    state.chats.attachments().get_blob(id).await
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
