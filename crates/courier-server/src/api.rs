use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    middleware,
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::types::{ConversationId, GroupId, MessageId, UserId};
use courier_shared::views::{
    FeedEntry, FeedPage, GroupLookup, MessageView, ParticipantView, SearchPage,
};
use courier_store::StorePool;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::fanout::{DomainEvent, EventFanout};
use crate::gateway::ws_handler;
use crate::identity::{AuthUser, SessionOrigin};
use crate::presence::PresenceRegistry;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub store: StorePool,
    pub registry: Arc<PresenceRegistry>,
    pub fanout: EventFanout,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the live-delivery side around an opened store. The returned
    /// handle is the fanout task.
    pub fn new(store: StorePool, config: ServerConfig) -> (Self, JoinHandle<()>) {
        let registry = Arc::new(PresenceRegistry::new(config.connection_buffer));
        let (fanout, task) =
            EventFanout::spawn(Arc::clone(&registry), config.fanout_queue_capacity);
        let rate_limiter =
            RateLimiter::per_window(config.message_rate_limit, config.message_rate_window);

        let state = Self {
            store,
            registry,
            fanout,
            rate_limiter,
            config: Arc::new(config),
        };
        (state, task)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Writes are throttled per user; reads and the socket are not.
    let writes = Router::new()
        .route("/message/send/:recipient_id", post(send_message))
        .route("/message/reply/:message_id", post(reply_to_message))
        .route("/message/edit/:message_id", patch(edit_message))
        .route("/message/read/:message_id", patch(read_message))
        .route("/message/delete/:recipient_id", delete(delete_messages))
        .route("/group/create", post(create_group))
        .route("/group/:group_id/join", post(join_group))
        .route("/group/:group_id/message", post(send_group_message))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/feed", get(get_feed))
        .route("/feed/search", get(search_feed))
        .route("/group/:group_id", get(get_group))
        .route("/ws", get(ws_handler))
        .merge(writes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Payloads ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
}

#[derive(Deserialize)]
struct TextBody {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyBody {
    recipient_id: UserId,
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadBody {
    recipient_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteQuery {
    /// Comma-separated message ids.
    message_ids: String,
}

#[derive(Deserialize)]
struct CreateGroupBody {
    name: String,
    login: String,
}

#[derive(Deserialize)]
struct FeedQuery {
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct SearchQuery {
    query: String,
    #[serde(default = "first_page")]
    page: u32,
}

fn first_page() -> u32 {
    1
}

#[derive(Deserialize)]
struct GroupQuery {
    invite: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    conversation_id: ConversationId,
    is_new_conversation: bool,
    message: MessageView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EditResponse {
    message: MessageView,
    is_last_message: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadResponse {
    conversation_id: ConversationId,
    message_id: MessageId,
    read_at: DateTime<Utc>,
    unread_count: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    conversation_id: ConversationId,
    message_ids: Vec<MessageId>,
    is_last_message: bool,
    last_message: Option<MessageView>,
    last_message_sent_at: DateTime<Utc>,
    unread_count: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    group_id: GroupId,
    newly_joined: bool,
    participant: ParticipantView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupMessageResponse {
    message: MessageView,
    sender_role: ParticipantView,
}

// ─── Handlers ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn send_message(
    AuthUser(user): AuthUser,
    SessionOrigin(origin): SessionOrigin,
    State(state): State<AppState>,
    Path(recipient): Path<UserId>,
    Json(body): Json<TextBody>,
) -> Result<Json<SendResponse>, ServerError> {
    let outcome = state
        .store
        .run(move |db| db.send_message(user, recipient, &body.text))
        .await?;

    if outcome.is_new_conversation {
        info!(conversation = %outcome.conversation_id, "Conversation started");
    }
    let response = SendResponse {
        conversation_id: outcome.conversation_id,
        is_new_conversation: outcome.is_new_conversation,
        message: outcome.message.clone(),
    };
    state
        .fanout
        .publish(DomainEvent::MessageSent {
            outcome: Box::new(outcome),
            origin,
        });
    Ok(Json(response))
}

async fn reply_to_message(
    AuthUser(user): AuthUser,
    SessionOrigin(origin): SessionOrigin,
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Json(body): Json<ReplyBody>,
) -> Result<Json<SendResponse>, ServerError> {
    let outcome = state
        .store
        .run(move |db| db.reply_to_message(user, body.recipient_id, message_id, &body.text))
        .await?;

    let response = SendResponse {
        conversation_id: outcome.conversation_id,
        is_new_conversation: outcome.is_new_conversation,
        message: outcome.message.clone(),
    };
    state
        .fanout
        .publish(DomainEvent::MessageSent {
            outcome: Box::new(outcome),
            origin,
        });
    Ok(Json(response))
}

async fn edit_message(
    AuthUser(user): AuthUser,
    SessionOrigin(origin): SessionOrigin,
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Json(body): Json<TextBody>,
) -> Result<Json<EditResponse>, ServerError> {
    let outcome = state
        .store
        .run(move |db| db.edit_message(user, message_id, &body.text))
        .await?;

    let response = EditResponse {
        message: outcome.message.clone(),
        is_last_message: outcome.is_last_message,
    };
    state
        .fanout
        .publish(DomainEvent::MessageEdited {
            outcome: Box::new(outcome),
            origin,
        });
    Ok(Json(response))
}

async fn read_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Json(body): Json<ReadBody>,
) -> Result<Json<ReadResponse>, ServerError> {
    let outcome = state
        .store
        .run(move |db| db.read_message(user, message_id, body.recipient_id))
        .await?;

    let response = ReadResponse {
        conversation_id: outcome.conversation_id,
        message_id: outcome.message_id,
        read_at: outcome.read_at,
        unread_count: outcome.unread_count,
    };
    state.fanout.publish(DomainEvent::MessageRead(outcome));
    Ok(Json(response))
}

async fn delete_messages(
    AuthUser(user): AuthUser,
    SessionOrigin(origin): SessionOrigin,
    State(state): State<AppState>,
    Path(recipient): Path<UserId>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteResponse>, ServerError> {
    let ids = parse_message_ids(&query.message_ids)?;
    let outcome = state
        .store
        .run(move |db| db.delete_messages(user, recipient, &ids))
        .await?;

    let response = DeleteResponse {
        conversation_id: outcome.conversation_id,
        message_ids: outcome.message_ids.clone(),
        is_last_message: outcome.is_last_message,
        last_message: outcome.last_message.clone(),
        last_message_sent_at: outcome.last_message_sent_at,
        unread_count: outcome.feed.unread_for(user).unwrap_or(0),
    };
    state
        .fanout
        .publish(DomainEvent::MessagesDeleted {
            outcome: Box::new(outcome),
            origin,
        });
    Ok(Json(response))
}

fn parse_message_ids(raw: &str) -> Result<Vec<MessageId>, ServerError> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| MessageId::parse(part).map_err(|e| ServerError::BadRequest(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    if ids.is_empty() {
        return Err(ServerError::BadRequest("messageIds is empty".into()));
    }
    Ok(ids)
}

async fn create_group(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateGroupBody>,
) -> Result<Json<FeedEntry>, ServerError> {
    let created = state
        .store
        .run(move |db| db.create_group(user, &body.name, &body.login))
        .await?;

    info!(group = %created.group.id, login = %created.group.login, "Group created");
    Ok(Json(created.entry))
}

async fn join_group(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> Result<Json<JoinResponse>, ServerError> {
    let joined = state
        .store
        .run(move |db| db.join_group(user, group_id))
        .await?;

    Ok(Json(JoinResponse {
        group_id,
        newly_joined: joined.newly_joined,
        participant: joined.participant.view(),
    }))
}

async fn send_group_message(
    AuthUser(user): AuthUser,
    SessionOrigin(origin): SessionOrigin,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    Json(body): Json<TextBody>,
) -> Result<Json<GroupMessageResponse>, ServerError> {
    let outcome = state
        .store
        .run(move |db| db.send_group_message(user, group_id, &body.text))
        .await?;

    let response = GroupMessageResponse {
        message: outcome.message.clone(),
        sender_role: outcome.sender_role.clone(),
    };
    state
        .fanout
        .publish(DomainEvent::GroupMessageSent {
            outcome: Box::new(outcome),
            origin,
        });
    Ok(Json(response))
}

async fn get_feed(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedPage>, ServerError> {
    let page = state
        .store
        .run(move |db| db.get_feed(user, query.cursor.as_deref()))
        .await?;
    Ok(Json(page))
}

async fn search_feed(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchPage>, ServerError> {
    let page = state
        .store
        .run(move |db| db.search_feed(user, &query.query, query.page))
        .await?;
    Ok(Json(page))
}

async fn get_group(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    Query(query): Query<GroupQuery>,
) -> Result<Json<GroupLookup>, ServerError> {
    let group = state
        .store
        .run(move |db| db.lookup_group(user, group_id, query.invite.as_deref()))
        .await?;
    Ok(Json(group))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use courier_store::User;
    use tempfile::TempDir;

    use super::*;

    pub fn test_state_with(config: ServerConfig) -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = StorePool::open(&dir.path().join("courier.db"), 2, Duration::from_secs(5))
            .unwrap();
        let (state, _task) = AppState::new(store, config);
        (state, dir)
    }

    pub fn test_state() -> (AppState, TempDir) {
        test_state_with(ServerConfig::default())
    }

    pub async fn seed_users(state: &AppState) -> [UserId; 2] {
        let a = User::new("Alice", "alice@example.com");
        let b = User::new("Bob", "bob@example.com");
        let ids = [a.id, b.id];
        state
            .store
            .run(move |db| {
                let uow = db.begin()?;
                uow.insert_user(&a)?;
                uow.insert_user(&b)?;
                uow.commit()
            })
            .await
            .unwrap();
        ids
    }
}
