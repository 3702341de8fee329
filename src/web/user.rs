use crate::masking::mask_api_key;
use crate::models::user_api_keys::{NewUserApiKey, UserApiKey};
use crate::models::users::User;
use crate::providers::ProviderKind;
use crate::web::JsonBody;
use crate::web::auth::require_user;
use crate::web::generations::DeletedResponse;
use crate::{ApiError, AppState};
use axum::{
    extract::{Path, State},
    middleware::from_fn_with_state,
    routing::{delete, get},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub credits: i32,
    pub is_admin: bool,
    pub has_unlimited_credits: bool,
    pub subscription_plan: Option<String>,
    pub has_active_subscription: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditBalance {
    pub credits: i32,
    pub has_unlimited_credits: bool,
    pub subscription_plan: Option<String>,
    pub has_active_subscription: bool,
    pub current_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SaveApiKeyRequest {
    pub provider: String,
    #[validate(length(min = 1, max = 512))]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyView {
    pub provider: String,
    pub masked_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/user", get(get_profile))
        .route("/api/user/credits", get(get_credits))
        .route("/api/user/api-keys", get(list_api_keys).post(save_api_key))
        .route("/api/user/api-keys/:provider", delete(delete_api_key))
        .route_layer(from_fn_with_state(app_state.clone(), require_user))
        .with_state(app_state)
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<UserProfile>, ApiError> {
    debug!("Getting profile for user {}", user.id);
    Ok(Json(UserProfile {
        id: user.id,
        is_admin: state.is_admin(&user),
        has_active_subscription: user.has_active_subscription(),
        email: user.email,
        credits: user.credits,
        has_unlimited_credits: user.has_unlimited_credits,
        subscription_plan: user.subscription_plan,
        current_period_end: user.stripe_current_period_end,
        created_at: user.created_at,
    }))
}

async fn get_credits(Extension(user): Extension<User>) -> Result<Json<CreditBalance>, ApiError> {
    Ok(Json(CreditBalance {
        has_active_subscription: user.has_active_subscription(),
        credits: user.credits,
        has_unlimited_credits: user.has_unlimited_credits,
        subscription_plan: user.subscription_plan,
        current_period_end: user.stripe_current_period_end,
    }))
}

pub(crate) fn key_view(state: &AppState, key: &UserApiKey) -> Result<ApiKeyView, ApiError> {
    let plaintext = state.key_cipher.decrypt_string(&key.key_enc)?;
    Ok(ApiKeyView {
        provider: key.provider.clone(),
        masked_key: mask_api_key(&plaintext),
        created_at: key.created_at,
        updated_at: key.updated_at,
    })
}

async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<ApiKeyView>>, ApiError> {
    let keys = state.db.list_user_api_keys(user.id)?;
    let views = keys
        .iter()
        .map(|key| key_view(&state, key))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(views))
}

async fn save_api_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    JsonBody(body): JsonBody<SaveApiKeyRequest>,
) -> Result<Json<ApiKeyView>, ApiError> {
    body.validate()?;
    let provider: ProviderKind = body.provider.parse()?;
    let api_key = body.api_key.trim();
    if api_key.is_empty() {
        return Err(ApiError::InvalidRequest("api_key must not be blank".to_string()));
    }

    let key_enc = state.key_cipher.encrypt_string(api_key)?;
    let stored = state.db.upsert_user_api_key(NewUserApiKey::new(
        user.id,
        provider.as_str().to_string(),
        key_enc,
    ))?;
    info!("Stored {} key for user {}", provider, user.id);
    Ok(Json(key_view(&state, &stored)?))
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(provider): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let provider: ProviderKind = provider.parse()?;
    state.db.delete_user_api_key(user.id, provider.as_str())?;
    info!("Deleted {} key for user {}", provider, user.id);
    Ok(Json(DeletedResponse {
        id: provider.as_str().to_string(),
        deleted: true,
    }))
}
