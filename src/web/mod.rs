use crate::{ApiError, AppState};
use axum::{extract::rejection::JsonRejection, extract::FromRequest, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub mod admin;
pub mod auth;
pub mod chat;
pub mod generate;
pub mod generations;
pub mod providers;
pub mod stripe_routes;
pub mod user;
pub mod webhooks;

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/health", get(health))
        .merge(generate::router(app_state.clone()))
        .merge(generations::router(app_state.clone()))
        .merge(chat::router(app_state.clone()))
        .merge(user::router(app_state.clone()))
        .merge(providers::router(app_state.clone()))
        .merge(admin::router(app_state.clone()))
        .merge(stripe_routes::router(app_state.clone()))
        .merge(webhooks::router(app_state))
}

/// JSON request body whose rejections render as `ApiError` (400) instead of
/// axum's plain-text 415/422.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!("Rejected request body: {}", rejection.body_text());
        ApiError::ValidationFailed(json!({ "body": rejection.body_text() }))
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bearer, test_config, test_state, MemoryDb};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_and_merged_routes() {
        let state = test_state(Arc::new(MemoryDb::default()), test_config(None));
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/user/credits")
                    .header("authorization", bearer("user_root"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/providers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
