use crate::models::users::User;
use crate::providers::ProviderInfo;
use crate::web::auth::require_user;
use crate::{ApiError, AppState};
use axum::{
    extract::State, middleware::from_fn_with_state, routing::get, Extension, Json, Router,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderListing {
    #[serde(flatten)]
    pub info: ProviderInfo,
    /// A credential exists from the environment, an admin key or the
    /// caller's own key.
    pub available: bool,
    pub has_user_key: bool,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route_layer(from_fn_with_state(app_state.clone(), require_user))
        .with_state(app_state)
}

async fn list_providers(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<ProviderListing>>, ApiError> {
    let user_keys: HashSet<String> = state
        .db
        .list_user_api_keys(user.id)?
        .into_iter()
        .map(|k| k.provider)
        .collect();
    let admin_keys: HashSet<String> = state
        .db
        .list_provider_keys()?
        .into_iter()
        .filter(|k| k.is_active)
        .map(|k| k.provider)
        .collect();

    let listing = state
        .provider_router
        .list()
        .into_iter()
        .map(|info| {
            let id = info.id.as_str();
            let has_user_key = user_keys.contains(id);
            let available = info.configured || has_user_key || admin_keys.contains(id);
            ProviderListing {
                info,
                available,
                has_user_key,
            }
        })
        .collect();
    Ok(Json(listing))
}
