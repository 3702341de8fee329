use crate::db::AdminStats;
use crate::masking::mask_api_key;
use crate::models::provider_keys::{AiProviderKey, NewAiProviderKey};
use crate::models::users::{User, UserAdminUpdate};
use crate::providers::ProviderKind;
use crate::web::JsonBody;
use crate::web::auth::{require_admin, require_user};
use crate::web::generations::{page, DeletedResponse};
use crate::{ApiError, AppState};
use axum::{
    extract::{Path, Query, State},
    middleware::from_fn_with_state,
    routing::{delete, get, patch},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListUsersParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SaveProviderKeyRequest {
    pub provider: String,
    #[validate(length(min = 1, max = 512))]
    pub api_key: String,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderKeyView {
    pub provider: String,
    pub masked_key: String,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/admin/users", get(list_users))
        .route("/api/admin/users/:id", patch(update_user))
        .route("/api/admin/stats", get(stats))
        .route(
            "/api/admin/providers",
            get(list_provider_keys).post(save_provider_key),
        )
        .route("/api/admin/providers/:provider", delete(delete_provider_key))
        .route_layer(from_fn_with_state(app_state.clone(), require_admin))
        .route_layer(from_fn_with_state(app_state.clone(), require_user))
        .with_state(app_state)
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListUsersParams>,
) -> Result<Json<Vec<User>>, ApiError> {
    let (limit, offset) = page(params.limit, params.offset);
    Ok(Json(state.db.list_users(limit, offset)?))
}

async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<User>,
    Path(id): Path<Uuid>,
    JsonBody(changes): JsonBody<UserAdminUpdate>,
) -> Result<Json<User>, ApiError> {
    if changes.is_empty() {
        return Err(ApiError::InvalidRequest("No fields to update".to_string()));
    }
    if changes.credits.is_some_and(|c| c < 0) {
        return Err(ApiError::InvalidRequest(
            "credits must not be negative".to_string(),
        ));
    }

    let user = state.db.update_user_admin_fields(id, &changes)?;
    info!("Admin {} updated user {}: {:?}", admin.id, id, changes);
    Ok(Json(user))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<AdminStats>, ApiError> {
    Ok(Json(state.db.get_admin_stats()?))
}

fn provider_key_view(state: &AppState, key: &AiProviderKey) -> Result<ProviderKeyView, ApiError> {
    let plaintext = state.key_cipher.decrypt_string(&key.key_enc)?;
    Ok(ProviderKeyView {
        provider: key.provider.clone(),
        masked_key: mask_api_key(&plaintext),
        is_active: key.is_active,
        updated_at: key.updated_at,
    })
}

async fn list_provider_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProviderKeyView>>, ApiError> {
    let views = state
        .db
        .list_provider_keys()?
        .iter()
        .map(|key| provider_key_view(&state, key))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(views))
}

async fn save_provider_key(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<User>,
    JsonBody(body): JsonBody<SaveProviderKeyRequest>,
) -> Result<Json<ProviderKeyView>, ApiError> {
    body.validate()?;
    let provider: ProviderKind = body.provider.parse()?;
    let api_key = body.api_key.trim();
    if api_key.is_empty() {
        return Err(ApiError::InvalidRequest("api_key must not be blank".to_string()));
    }

    let stored = state.db.upsert_provider_key(NewAiProviderKey {
        provider: provider.as_str().to_string(),
        key_enc: state.key_cipher.encrypt_string(api_key)?,
        is_active: body.is_active.unwrap_or(true),
    })?;
    info!("Admin {} stored service key for {}", admin.id, provider);
    Ok(Json(provider_key_view(&state, &stored)?))
}

async fn delete_provider_key(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<User>,
    Path(provider): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let provider: ProviderKind = provider.parse()?;
    state.db.delete_provider_key(provider.as_str())?;
    info!("Admin {} removed service key for {}", admin.id, provider);
    Ok(Json(DeletedResponse {
        id: provider.as_str().to_string(),
        deleted: true,
    }))
}
