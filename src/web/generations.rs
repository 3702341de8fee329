use crate::models::generations::{Generation, GenerationFilter, GenerationType};
use crate::models::users::User;
use crate::web::auth::require_user;
use crate::{ApiError, AppState};
use axum::{
    extract::{Path, Query, State},
    middleware::from_fn_with_state,
    routing::get,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListGenerationsParams {
    #[serde(rename = "type")]
    pub generation_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationList {
    pub generations: Vec<Generation>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletedResponse {
    pub id: String,
    pub deleted: bool,
}

/// Clamps pagination input to sane bounds.
pub(crate) fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (
        limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        offset.unwrap_or(0).max(0),
    )
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/generations", get(list_generations))
        .route(
            "/api/generations/:id",
            get(get_generation).delete(delete_generation),
        )
        .route_layer(from_fn_with_state(app_state.clone(), require_user))
        .with_state(app_state)
}

async fn list_generations(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Query(params): Query<ListGenerationsParams>,
) -> Result<Json<GenerationList>, ApiError> {
    debug!("Listing generations for user {}", user.id);
    let generation_type = match params.generation_type.as_deref() {
        None | Some("") => None,
        Some(value) => Some(GenerationType::parse(value).ok_or_else(|| {
            ApiError::InvalidRequest(format!("Unknown generation type {}", value))
        })?),
    };
    let (limit, offset) = page(params.limit, params.offset);

    let generations = state.db.list_generations(
        user.id,
        GenerationFilter {
            generation_type,
            limit,
            offset,
        },
    )?;

    Ok(Json(GenerationList {
        generations,
        limit,
        offset,
    }))
}

async fn get_generation(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Generation>, ApiError> {
    debug!("Getting generation {} for user {}", id, user.id);
    Ok(Json(state.db.get_generation(id, user.id)?))
}

async fn delete_generation(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state.db.delete_generation(id, user.id)?;
    info!("Deleted generation {} of user {}", id, user.id);
    Ok(Json(DeletedResponse {
        id: id.to_string(),
        deleted: true,
    }))
}
