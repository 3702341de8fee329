use crate::credits::{self, CHAT_MESSAGE_COST};
use crate::db::DBError;
use crate::models::chats::{Chat, ChatMessage, NewChat, NewChatMessage, ROLE_ASSISTANT, ROLE_USER};
use crate::models::users::User;
use crate::providers::{ChatTurn, Completion, CompletionRequest, ProviderKind};
use crate::rate_limit::rate_limit;
use crate::tokens::count_tokens;
use crate::web::JsonBody;
use crate::web::auth::require_user;
use crate::web::generate::DEFAULT_PROVIDER;
use crate::web::generations::{page, DeletedResponse};
use crate::{ApiError, AppState};
use axum::{
    extract::{Path, Query, State},
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChatRequest {
    pub chat_id: Option<Uuid>,
    #[validate(length(min = 1, max = 10000))]
    pub message: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    #[validate(length(max = 4000))]
    pub system: Option<String>,
    #[validate(range(min = 1, max = 8192))]
    pub max_tokens: Option<u32>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListChatsParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub chat: Chat,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
    pub provider: ProviderKind,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatWithMessages {
    #[serde(flatten)]
    pub chat: Chat,
    pub messages: Vec<ChatMessage>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route(
            "/api/chat",
            get(list_chats).merge(
                post(send_message)
                    .route_layer(from_fn_with_state(app_state.clone(), rate_limit)),
            ),
        )
        .route("/api/chat/:id", get(get_chat).delete(delete_chat))
        .route_layer(from_fn_with_state(app_state.clone(), require_user))
        .with_state(app_state)
}

fn chat_title(message: &str) -> String {
    let trimmed = message.trim();
    let title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        format!("{}...", title.trim_end())
    } else {
        title
    }
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    JsonBody(body): JsonBody<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    debug!("Entering send_message for user {}", user.id);
    body.validate()?;

    if !credits::has_credits(&user, CHAT_MESSAGE_COST) {
        return Err(ApiError::InsufficientCredits);
    }

    let existing = match body.chat_id {
        Some(chat_id) => Some(state.db.get_chat(chat_id, user.id)?),
        None => None,
    };

    let provider = match (body.provider.as_deref(), &existing) {
        (Some(p), _) if !p.trim().is_empty() => p.parse::<ProviderKind>()?,
        (_, Some(chat)) => chat.provider.parse::<ProviderKind>()?,
        _ => DEFAULT_PROVIDER,
    };
    let model = body
        .model
        .clone()
        .or_else(|| existing.as_ref().map(|c| c.model.clone()))
        .unwrap_or_else(|| state.provider_router.default_model(provider));

    let mut turns = Vec::new();
    if let Some(system) = body.system.as_deref().filter(|s| !s.trim().is_empty()) {
        turns.push(ChatTurn::new("system", system));
    }
    if let Some(chat) = &existing {
        for message in state.db.get_chat_messages(chat.id)? {
            turns.push(ChatTurn::new(&message.role, message.content));
        }
    }
    turns.push(ChatTurn::new(ROLE_USER, body.message.clone()));
    let request = CompletionRequest {
        messages: turns,
        model: Some(model),
        max_tokens: crate::providers::DEFAULT_MAX_TOKENS,
        temperature: crate::providers::DEFAULT_TEMPERATURE,
    }
    .with_limits(body.max_tokens, body.temperature);

    let api_key = credits::resolve_api_key(&state, user.id, provider)?;
    let charged = credits::charge_for(&user, CHAT_MESSAGE_COST);
    credits::deduct(&state, user.id, charged)?;

    let completion = match state
        .provider_router
        .complete(provider, api_key.as_deref(), &request)
        .await
    {
        Ok(completion) => completion,
        Err(e) => {
            warn!("Chat completion for user {} failed: {}", user.id, e);
            credits::refund(&state, user.id, charged);
            return Err(e.into());
        }
    };

    let (chat, created) = match existing {
        Some(chat) => (chat, false),
        None => match state.db.create_chat(NewChat {
            user_id: user.id,
            title: chat_title(&body.message),
            provider: provider.as_str().to_string(),
            model: completion.model.clone(),
        }) {
            Ok(chat) => (chat, true),
            Err(e) => {
                error!("Failed to create chat for user {}: {:?}", user.id, e);
                credits::refund(&state, user.id, charged);
                return Err(e.into());
            }
        },
    };

    let (user_message, assistant_message) =
        match store_exchange(&state, chat.id, &body.message, &completion) {
            Ok(messages) => messages,
            Err(e) => {
                error!("Failed to store reply in chat {}: {:?}", chat.id, e);
                credits::refund(&state, user.id, charged);
                if created {
                    if let Err(e) = state.db.delete_chat(chat.id, user.id) {
                        warn!("Failed to remove empty chat {}: {:?}", chat.id, e);
                    }
                }
                return Err(e.into());
            }
        };
    let chat = match state.db.get_chat(chat.id, user.id) {
        Ok(chat) => chat,
        Err(e) => {
            warn!("Failed to reload chat {} totals: {:?}", chat.id, e);
            chat
        }
    };

    info!(
        "Chat {} reply via {}: {} tokens",
        chat.id, provider, completion.tokens
    );
    Ok(Json(ChatReply {
        chat,
        user_message,
        assistant_message,
        provider,
        model: completion.model,
    }))
}

fn store_exchange(
    state: &AppState,
    chat_id: Uuid,
    message: &str,
    completion: &Completion,
) -> Result<(ChatMessage, ChatMessage), DBError> {
    let user_message = state.db.append_chat_message(NewChatMessage {
        chat_id,
        role: ROLE_USER.to_string(),
        content: message.to_string(),
        tokens: i32::try_from(count_tokens(message)).unwrap_or(i32::MAX),
        cost: 0.0,
    })?;
    let assistant_message = state.db.append_chat_message(NewChatMessage {
        chat_id,
        role: ROLE_ASSISTANT.to_string(),
        content: completion.content.clone(),
        tokens: completion.tokens,
        cost: completion.cost,
    })?;
    Ok((user_message, assistant_message))
}

async fn list_chats(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Query(params): Query<ListChatsParams>,
) -> Result<Json<Vec<Chat>>, ApiError> {
    let (limit, offset) = page(params.limit, params.offset);
    Ok(Json(state.db.list_chats(user.id, limit, offset)?))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChatWithMessages>, ApiError> {
    let chat = state.db.get_chat(id, user.id)?;
    let messages = state.db.get_chat_messages(chat.id)?;
    Ok(Json(ChatWithMessages { chat, messages }))
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state.db.delete_chat(id, user.id)?;
    info!("Deleted chat {} of user {}", id, user.id);
    Ok(Json(DeletedResponse {
        id: id.to_string(),
        deleted: true,
    }))
}
