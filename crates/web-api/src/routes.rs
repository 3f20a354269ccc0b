use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use application::CreateChatRequest;
use domain::{Chat, ChatId, ChatType, Message, MessageId, ParticipantRole, UserId};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
struct CreateChatPayload {
    chat_type: ChatType,
    #[serde(default)]
    member_ids: Vec<UserId>,
    #[serde(default)]
    admins_only: bool,
}

#[derive(Debug, Deserialize)]
struct AddParticipantPayload {
    user_id: UserId,
    #[serde(default = "default_role")]
    role: ParticipantRole,
}

fn default_role() -> ParticipantRole {
    ParticipantRole::Member
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    before: Option<MessageId>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct StarResponse {
    starred: bool,
    /// 标记是否发生了变化，重复请求时为 false
    changed: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/chats", post(create_chat).get(list_chats))
        .route("/chats/{chat_id}", get(get_chat))
        .route("/chats/{chat_id}/participants", post(add_participant))
        .route(
            "/chats/{chat_id}/participants/{user_id}",
            delete(remove_participant),
        )
        .route("/chats/{chat_id}/leave", post(leave_chat))
        .route("/chats/{chat_id}/messages", get(get_history))
        .route("/messages/{message_id}", get(get_message))
        .route(
            "/messages/{message_id}/star",
            put(star_message).delete(unstar_message),
        )
}

async fn health() -> StatusCode {
    StatusCode::OK
}

fn current_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    state.jwt_service.extract_user_from_headers(headers)
}

/// 连接认证：优先使用 `?token=`，其次是 Bearer 头
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = match query.token.as_deref() {
        Some(token) => state.jwt_service.authenticate(token)?,
        None => current_user(&state, &headers)?,
    };

    Ok(ws.on_upgrade(move |socket| async move {
        WebSocketConnection::new(socket, state, user_id)
            .await
            .run()
            .await;
    }))
}

async fn create_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateChatPayload>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    let creator_id = current_user(&state, &headers)?;
    let chat = state
        .core
        .chats
        .create_chat(CreateChatRequest {
            creator_id,
            chat_type: payload.chat_type,
            member_ids: payload.member_ids,
            admins_only: payload.admins_only,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(chat)))
}

async fn list_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Chat>>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let chats = state.core.chats.list_chats(user_id).await?;
    Ok(Json(chats))
}

async fn get_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<Chat>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let chat = state.core.chats.get_chat(chat_id, user_id).await?;
    Ok(Json(chat))
}

async fn add_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
    Json(payload): Json<AddParticipantPayload>,
) -> Result<Json<Chat>, ApiError> {
    let operator_id = current_user(&state, &headers)?;
    let chat = state
        .core
        .chats
        .add_participant(chat_id, operator_id, payload.user_id, payload.role)
        .await?;
    Ok(Json(chat))
}

async fn remove_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((chat_id, user_id)): Path<(ChatId, UserId)>,
) -> Result<StatusCode, ApiError> {
    let operator_id = current_user(&state, &headers)?;
    state
        .core
        .chats
        .remove_participant(chat_id, operator_id, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
) -> Result<StatusCode, ApiError> {
    let user_id = current_user(&state, &headers)?;
    state.core.chats.leave(chat_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let viewer = current_user(&state, &headers)?;
    let items = state
        .core
        .messages
        .history(chat_id, viewer, query.limit, query.before)
        .await?;

    Ok(Json(items))
}

async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
) -> Result<Json<Message>, ApiError> {
    let viewer = current_user(&state, &headers)?;
    let message = state.core.messages.get(message_id, viewer).await?;
    Ok(Json(message))
}

async fn star_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
) -> Result<Json<StarResponse>, ApiError> {
    set_star(state, headers, message_id, true).await
}

async fn unstar_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<MessageId>,
) -> Result<Json<StarResponse>, ApiError> {
    set_star(state, headers, message_id, false).await
}

async fn set_star(
    state: AppState,
    headers: HeaderMap,
    message_id: MessageId,
    starred: bool,
) -> Result<Json<StarResponse>, ApiError> {
    let user_id = current_user(&state, &headers)?;
    let changed = state
        .core
        .messages
        .star(message_id, user_id, starred)
        .await?;
    Ok(Json(StarResponse { starred, changed }))
}
