use crate::models::purchases::{NewPurchase, PurchaseStatus};
use crate::models::users::User;
use crate::billing::{CheckoutItem, CreditPack, Plan};
use crate::web::JsonBody;
use crate::web::auth::require_user;
use crate::{ApiError, AppState};
use axum::{
    extract::State, middleware::from_fn_with_state, routing::post, Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub pack: Option<CreditPack>,
    pub plan: Option<Plan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/stripe/checkout", post(create_checkout))
        .route("/api/stripe/portal", post(create_portal))
        .route_layer(from_fn_with_state(app_state.clone(), require_user))
        .with_state(app_state)
}

async fn create_checkout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    JsonBody(body): JsonBody<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    debug!("Entering create_checkout for user {}", user.id);
    let billing = state.billing()?;

    let item = match (body.pack, body.plan) {
        (Some(pack), None) => CheckoutItem::Pack(pack),
        (None, Some(plan)) => CheckoutItem::Subscription(plan),
        _ => {
            return Err(ApiError::InvalidRequest(
                "Provide exactly one of pack or plan".to_string(),
            ))
        }
    };

    let session = billing
        .create_checkout(
            item,
            user.id,
            &user.email,
            user.stripe_customer_id.as_deref(),
            &state.config.app_url,
        )
        .await?;

    if let CheckoutItem::Pack(pack) = item {
        state.db.create_purchase(NewPurchase {
            user_id: user.id,
            stripe_session_id: session.id.clone(),
            amount: pack.amount_cents(),
            credits: pack.credits(),
            status: PurchaseStatus::Pending,
        })?;
    }

    info!("Checkout session {} created for user {}", session.id, user.id);
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

async fn create_portal(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<PortalResponse>, ApiError> {
    let billing = state.billing()?;
    let customer_id = user.stripe_customer_id.as_deref().ok_or_else(|| {
        ApiError::InvalidRequest("No billing account for this user".to_string())
    })?;

    let return_url = format!("{}/dashboard", state.config.app_url.trim_end_matches('/'));
    let session = billing
        .create_portal_session(customer_id, &return_url)
        .await?;
    Ok(Json(PortalResponse { url: session.url }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{FakeStripeClient, StripeCheckoutMode};
    use crate::db::DBConnection;
    use crate::models::users::SubscriptionUpdate;
    use crate::test_support::{bearer, billing_state, seed_user, test_config, test_state, MemoryDb};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn post(uri: &str, clerk_id: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", bearer(clerk_id))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_pack_checkout_records_pending_purchase() {
        let db = Arc::new(MemoryDb::default());
        let user = seed_user(&db, "user_buy", 10);
        let stripe_client = Arc::new(FakeStripeClient::new());
        let state = billing_state(db.clone(), stripe_client.clone());

        let response = router(state)
            .oneshot(post("/api/stripe/checkout", "user_buy", json!({"pack": "small"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["session_id"], "cs_test_1");
        assert_eq!(body["url"], "https://checkout.stripe.test/cs_test_1");

        let params = stripe_client.checkout_sessions.lock().unwrap()[0].clone();
        assert_eq!(params.mode, StripeCheckoutMode::Payment);
        assert_eq!(params.metadata["userId"], user.id.to_string());

        let purchases = db.purchases();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].user_id, user.id);
        assert_eq!(purchases[0].stripe_session_id, "cs_test_1");
        assert_eq!(purchases[0].amount, 999);
        assert_eq!(purchases[0].credits, 100);
        assert_eq!(purchases[0].status, PurchaseStatus::Pending);
    }

    #[tokio::test]
    async fn test_plan_checkout_records_no_purchase() {
        let db = Arc::new(MemoryDb::default());
        seed_user(&db, "user_buy", 10);
        let stripe_client = Arc::new(FakeStripeClient::new());
        let state = billing_state(db.clone(), stripe_client.clone());

        let response = router(state)
            .oneshot(post("/api/stripe/checkout", "user_buy", json!({"plan": "pro"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            stripe_client.checkout_sessions.lock().unwrap()[0].mode,
            StripeCheckoutMode::Subscription
        );
        assert!(db.purchases().is_empty());
    }

    #[tokio::test]
    async fn test_portal_uses_stored_customer() {
        let db = Arc::new(MemoryDb::default());
        let user = seed_user(&db, "user_portal", 10);
        db.update_user_subscription(
            user.id,
            &SubscriptionUpdate {
                stripe_customer_id: Some("cus_42".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        let stripe_client = Arc::new(FakeStripeClient::new());
        let state = billing_state(db, stripe_client.clone());

        let response = router(state)
            .oneshot(post("/api/stripe/portal", "user_portal", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["url"], "https://billing.stripe.test/cus_42");
        assert_eq!(
            stripe_client.portal_sessions.lock().unwrap()[0],
            (
                "cus_42".to_string(),
                "http://localhost:3000/dashboard".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_checkout_input_and_configuration_errors() {
        let db = Arc::new(MemoryDb::default());
        seed_user(&db, "user_buy", 10);

        let unconfigured = test_state(db.clone(), test_config(None));
        let response = router(unconfigured)
            .oneshot(post("/api/stripe/checkout", "user_buy", json!({"pack": "small"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let stripe_client = Arc::new(FakeStripeClient::new());
        let state = billing_state(db.clone(), stripe_client.clone());

        let response = router(state.clone())
            .oneshot(post(
                "/api/stripe/checkout",
                "user_buy",
                json!({"pack": "small", "plan": "pro"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(state.clone())
            .oneshot(post("/api/stripe/checkout", "user_buy", json!({"plan": "enterprise"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(state)
            .oneshot(post("/api/stripe/portal", "user_buy", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(db.purchases().is_empty());
        assert!(stripe_client.checkout_sessions.lock().unwrap().is_empty());
    }
}
