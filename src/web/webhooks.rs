use crate::billing::{
    Plan, StripeBilling, StripeCheckoutSession, StripeInvoice, StripeSubscription, WebhookEvent,
};
use crate::clerk::ClerkWebhookEvent;
use crate::db::{DBError, Fulfillment};
use crate::models::users::{NewUser, SubscriptionUpdate, User};
use crate::web::auth::is_admin_email;
use crate::{ApiError, AppState};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/webhook/clerk", post(clerk_webhook))
        .route("/api/webhook/stripe", post(stripe_webhook))
        .with_state(app_state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn received() -> Json<Value> {
    Json(json!({ "received": true }))
}

async fn clerk_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.clerk.verify_webhook(
        header(&headers, "svix-id"),
        header(&headers, "svix-timestamp"),
        header(&headers, "svix-signature"),
        &body,
        Utc::now().timestamp(),
    )?;

    let event: ClerkWebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!("Malformed Clerk webhook: {:?}", e);
        ApiError::BadRequest
    })?;
    debug!("Clerk webhook {}", event.event_type);

    match event.event_type.as_str() {
        "user.created" => {
            let clerk_id = event.data.id.clone().ok_or(ApiError::BadRequest)?;
            let email = event.data.primary_email().unwrap_or_default().to_string();
            let new_user = NewUser {
                is_admin: is_admin_email(&state, &email),
                ..NewUser::new(clerk_id, email, state.config.free_credits)
            };
            let user = state.db.create_user(new_user)?;
            info!("Created user {} from Clerk webhook", user.id);
        }
        "user.deleted" => {
            let clerk_id = event.data.id.as_deref().ok_or(ApiError::BadRequest)?;
            match state.db.delete_user_by_clerk_id(clerk_id) {
                Ok(()) => info!("Deleted user with clerk id {}", clerk_id),
                Err(DBError::UserNotFound) => {
                    debug!("User {} already gone", clerk_id)
                }
                Err(e) => return Err(e.into()),
            }
        }
        other => debug!("Ignoring Clerk event {}", other),
    }

    Ok(received())
}

async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let billing = state.billing()?;
    let event = billing.construct_event(
        &body,
        header(&headers, "stripe-signature"),
        Utc::now().timestamp(),
    )?;
    info!("Stripe event {}", event.id);

    handle_stripe_event(&state, billing, event.event).await?;
    Ok(received())
}

async fn handle_stripe_event(
    state: &AppState,
    billing: &StripeBilling,
    event: WebhookEvent,
) -> Result<(), ApiError> {
    match event {
        WebhookEvent::CheckoutCompleted(session) => {
            checkout_completed(state, billing, &session).await
        }
        WebhookEvent::CheckoutExpired(session) => match state.db.fail_purchase(&session.id) {
            Ok(()) | Err(DBError::PurchaseNotFound) => Ok(()),
            Err(e) => Err(e.into()),
        },
        WebhookEvent::InvoicePaid(invoice) => invoice_paid(state, billing, &invoice).await,
        WebhookEvent::SubscriptionDeleted(subscription) => {
            subscription_deleted(state, &subscription)
        }
        WebhookEvent::Ignored(kind) => {
            debug!("Ignoring Stripe event {}", kind);
            Ok(())
        }
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Resolves `metadata.userId` to an existing user; anything else is a 400
/// so nothing gets written for a session we cannot attribute.
fn session_user(state: &AppState, session: &StripeCheckoutSession) -> Result<User, ApiError> {
    let user_id = session.metadata_user_id().ok_or_else(|| {
        warn!("Checkout session {} has no usable userId", session.id);
        ApiError::InvalidRequest("Missing or invalid metadata.userId".to_string())
    })?;
    match state.db.get_user_by_id(user_id) {
        Ok(user) => Ok(user),
        Err(DBError::UserNotFound) => {
            warn!("Checkout session {} names unknown user {}", session.id, user_id);
            Err(ApiError::InvalidRequest("Unknown metadata.userId".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn checkout_completed(
    state: &AppState,
    billing: &StripeBilling,
    session: &StripeCheckoutSession,
) -> Result<(), ApiError> {
    let user = session_user(state, session)?;

    if session.is_subscription {
        return subscription_checkout(state, billing, session, &user).await;
    }

    let credits: i32 = session
        .metadata
        .get("credits")
        .and_then(|c| c.parse().ok())
        .filter(|c| *c > 0)
        .ok_or_else(|| ApiError::InvalidRequest("Missing metadata.credits".to_string()))?;
    let amount = session
        .amount_total
        .and_then(|a| i32::try_from(a).ok())
        .unwrap_or(0);

    match state
        .db
        .fulfill_credit_purchase(&session.id, user.id, amount, credits)?
    {
        Fulfillment::Granted { balance } => info!(
            "Granted {} credits to {} for {}, balance {}",
            credits, user.id, session.id, balance
        ),
        Fulfillment::AlreadyFulfilled => {
            info!("Checkout session {} was already fulfilled", session.id)
        }
    }

    if user.stripe_customer_id.is_none() {
        if let Some(customer) = session.customer.clone() {
            state.db.update_user_subscription(
                user.id,
                &SubscriptionUpdate {
                    stripe_customer_id: Some(customer),
                    stripe_subscription_id: user.stripe_subscription_id.clone(),
                    stripe_price_id: user.stripe_price_id.clone(),
                    stripe_current_period_end: user.stripe_current_period_end,
                    subscription_plan: user.subscription_plan.clone(),
                },
            )?;
        }
    }
    Ok(())
}

async fn subscription_checkout(
    state: &AppState,
    billing: &StripeBilling,
    session: &StripeCheckoutSession,
    user: &User,
) -> Result<(), ApiError> {
    let subscription_id = session.subscription.as_deref().ok_or_else(|| {
        ApiError::InvalidRequest("Subscription checkout without subscription".to_string())
    })?;
    if user.stripe_subscription_id.as_deref() == Some(subscription_id) {
        info!("Subscription {} already recorded for {}", subscription_id, user.id);
        return Ok(());
    }

    let subscription = billing.get_subscription(subscription_id).await?;
    let plan = session
        .metadata
        .get("plan")
        .and_then(|p| p.parse::<Plan>().ok())
        .or_else(|| {
            subscription
                .price_id
                .as_deref()
                .and_then(|p| Plan::from_price_id(billing.settings(), p))
        })
        .ok_or_else(|| ApiError::InvalidRequest("Unknown subscription plan".to_string()))?;

    state.db.update_user_subscription(
        user.id,
        &SubscriptionUpdate {
            stripe_customer_id: session
                .customer
                .clone()
                .or_else(|| Some(subscription.customer.clone())),
            stripe_subscription_id: Some(subscription.id.clone()),
            stripe_price_id: subscription.price_id.clone(),
            stripe_current_period_end: timestamp(subscription.current_period_end),
            subscription_plan: Some(plan.as_str().to_string()),
        },
    )?;
    let balance = state.db.add_credits(user.id, plan.monthly_credits())?;
    info!(
        "User {} subscribed to {}, granted {} credits, balance {}",
        user.id,
        plan,
        plan.monthly_credits(),
        balance
    );
    Ok(())
}

fn customer_user(state: &AppState, customer: &str) -> Result<User, ApiError> {
    state
        .db
        .get_user_by_stripe_customer_id(customer)?
        .ok_or_else(|| {
            warn!("Stripe customer {} matches no user", customer);
            ApiError::InvalidRequest("Unknown customer".to_string())
        })
}

/// Renewals are read back from the subscription so the stored period end
/// only moves forward and each period grants credits once.
async fn invoice_paid(
    state: &AppState,
    billing: &StripeBilling,
    invoice: &StripeInvoice,
) -> Result<(), ApiError> {
    if !invoice.is_renewal {
        debug!("Invoice is not a renewal");
        return Ok(());
    }
    let subscription_id = invoice.subscription.as_deref().ok_or_else(|| {
        ApiError::InvalidRequest("Renewal invoice without subscription".to_string())
    })?;
    let subscription = billing.get_subscription(subscription_id).await?;
    let user = customer_user(state, &subscription.customer)?;

    let period_end = timestamp(subscription.current_period_end);
    if let (Some(current), Some(new)) = (user.stripe_current_period_end, period_end) {
        if current >= new {
            info!("Period ending {} already applied to {}", new, user.id);
            return Ok(());
        }
    }

    let plan = subscription
        .price_id
        .as_deref()
        .and_then(|p| Plan::from_price_id(billing.settings(), p))
        .or_else(|| user.subscription_plan.as_deref().and_then(|p| p.parse().ok()))
        .ok_or_else(|| ApiError::InvalidRequest("Unknown subscription plan".to_string()))?;

    state.db.update_user_subscription(
        user.id,
        &SubscriptionUpdate {
            stripe_customer_id: user.stripe_customer_id.clone(),
            stripe_subscription_id: Some(subscription.id.clone()),
            stripe_price_id: subscription
                .price_id
                .clone()
                .or_else(|| user.stripe_price_id.clone()),
            stripe_current_period_end: period_end.or(user.stripe_current_period_end),
            subscription_plan: Some(plan.as_str().to_string()),
        },
    )?;
    let balance = state.db.add_credits(user.id, plan.monthly_credits())?;
    info!(
        "Renewed {} for {}, granted {} credits, balance {}",
        plan,
        user.id,
        plan.monthly_credits(),
        balance
    );
    Ok(())
}

fn subscription_deleted(
    state: &AppState,
    subscription: &StripeSubscription,
) -> Result<(), ApiError> {
    let user = customer_user(state, &subscription.customer)?;
    if user.stripe_subscription_id.as_deref() != Some(subscription.id.as_str()) {
        error!(
            "Subscription {} deleted but user {} has {:?}",
            subscription.id, user.id, user.stripe_subscription_id
        );
    }

    state.db.update_user_subscription(
        user.id,
        &SubscriptionUpdate {
            stripe_customer_id: user.stripe_customer_id.clone(),
            ..Default::default()
        },
    )?;
    info!("Cleared subscription of user {}", user.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::test_events::{checkout_session, event_payload, signature_header};
    use crate::billing::FakeStripeClient;
    use crate::clerk::test_keys::sign_webhook;
    use crate::db::DBConnection;
    use crate::models::purchases::{NewPurchase, PurchaseStatus};
    use crate::test_support::{billing_state, seed_user, test_config, test_state, MemoryDb};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn clerk_request(payload: &Value, signed: bool) -> Request<Body> {
        let body = payload.to_string();
        let now = Utc::now().timestamp();
        let signature = if signed {
            sign_webhook("msg_1", now, body.as_bytes())
        } else {
            "v1,Zm9yZ2Vk".to_string()
        };
        Request::builder()
            .method("POST")
            .uri("/api/webhook/clerk")
            .header("svix-id", "msg_1")
            .header("svix-timestamp", now.to_string())
            .header("svix-signature", signature)
            .body(Body::from(body))
            .unwrap()
    }

    fn stripe_request(payload: String, signature: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/webhook/stripe")
            .header("stripe-signature", signature)
            .body(Body::from(payload))
            .unwrap()
    }

    fn user_created(clerk_id: &str) -> Value {
        json!({
            "type": "user.created",
            "data": {
                "id": clerk_id,
                "primary_email_address_id": "idn_1",
                "email_addresses": [{"id": "idn_1", "email_address": "new@example.com"}]
            }
        })
    }

    fn session(
        id: &str,
        is_subscription: bool,
        subscription: Option<&str>,
        metadata: &[(&str, &str)],
    ) -> StripeCheckoutSession {
        StripeCheckoutSession {
            id: id.to_string(),
            is_subscription,
            customer: Some("cus_9".to_string()),
            subscription: subscription.map(ToOwned::to_owned),
            amount_total: Some(3999),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn subscription(period_end: i64) -> StripeSubscription {
        StripeSubscription {
            id: "sub_1".to_string(),
            customer: "cus_9".to_string(),
            current_period_end: period_end,
            price_id: Some("price_pro".to_string()),
        }
    }

    #[tokio::test]
    async fn test_clerk_user_created_and_duplicate_conflict() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(db.clone(), test_config(None));

        let response = router(state.clone())
            .oneshot(clerk_request(&user_created("user_hook"), true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let user = db.get_user_by_clerk_id("user_hook").unwrap().unwrap();
        assert_eq!(user.email, "new@example.com");
        assert_eq!(user.credits, 10);

        let response = router(state)
            .oneshot(clerk_request(&user_created("user_hook"), true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(db.user_count(), 1);
    }

    #[tokio::test]
    async fn test_clerk_bad_signature_and_deletion() {
        let db = Arc::new(MemoryDb::default());
        seed_user(&db, "user_gone", 10);
        let state = test_state(db.clone(), test_config(None));

        let response = router(state.clone())
            .oneshot(clerk_request(&user_created("user_forged"), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(db.user_count(), 1);

        let deleted = json!({"type": "user.deleted", "data": {"id": "user_gone", "deleted": true}});
        let response = router(state.clone())
            .oneshot(clerk_request(&deleted, true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(db.user_count(), 0);

        // Replays are harmless.
        let response = router(state)
            .oneshot(clerk_request(&deleted, true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_clerk_minimum_timestamp_is_rejected() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(db.clone(), test_config(None));

        let request = Request::builder()
            .method("POST")
            .uri("/api/webhook/clerk")
            .header("svix-id", "msg_1")
            .header("svix-timestamp", i64::MIN.to_string())
            .header("svix-signature", "v1,Zm9yZ2Vk")
            .body(Body::from(user_created("user_old").to_string()))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(db.user_count(), 0);
    }

    #[tokio::test]
    async fn test_pack_fulfillment_is_idempotent() {
        let db = Arc::new(MemoryDb::default());
        let user = seed_user(&db, "user_pay", 10);
        db.create_purchase(NewPurchase {
            user_id: user.id,
            stripe_session_id: "cs_test_1".to_string(),
            amount: 3999,
            credits: 500,
            status: PurchaseStatus::Pending,
        })
        .unwrap();
        let state = billing_state(db.clone(), Arc::new(FakeStripeClient::new()));
        let user_id = user.id.to_string();
        let payload = event_payload(
            "checkout.session.completed",
            "checkout.session",
            checkout_session(
                "cs_test_1",
                Some("cus_1"),
                Some(3999),
                &[("userId", &user_id), ("credits", "500"), ("kind", "credits")],
            ),
        );

        for _ in 0..2 {
            let signature = signature_header("whsec_test", Utc::now().timestamp(), &payload);
            let response = router(state.clone())
                .oneshot(stripe_request(payload.clone(), signature))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(db.credits_of(user.id), 510);
        let purchases = db.purchases();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].status, PurchaseStatus::Completed);
        let stored = db.get_user_by_id(user.id).unwrap();
        assert_eq!(stored.stripe_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn test_stripe_bad_signature_and_timestamps() {
        let db = Arc::new(MemoryDb::default());
        let user = seed_user(&db, "user_pay", 10);
        let state = billing_state(db.clone(), Arc::new(FakeStripeClient::new()));
        let user_id = user.id.to_string();
        let payload = event_payload(
            "checkout.session.completed",
            "checkout.session",
            checkout_session(
                "cs_test_1",
                None,
                Some(999),
                &[("userId", &user_id), ("credits", "100")],
            ),
        );

        let now = Utc::now().timestamp();
        for signature in [
            format!("t={},v1=deadbeef", now),
            signature_header("whsec_other", now, &payload),
            signature_header("whsec_test", now - 301, &payload),
            "t=-9223372036854775808,v1=deadbeef".to_string(),
        ] {
            let response = router(state.clone())
                .oneshot(stripe_request(payload.clone(), signature))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(db.credits_of(user.id), 10);
        assert!(db.purchases().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected_without_writes() {
        let db = Arc::new(MemoryDb::default());
        seed_user(&db, "user_pay", 10);
        let state = billing_state(db.clone(), Arc::new(FakeStripeClient::new()));
        let billing = state.billing().unwrap();
        let writes_before = db.writes();

        let unknown_id = uuid::Uuid::new_v4().to_string();
        let unknown = session("cs_2", false, None, &[("userId", &unknown_id), ("credits", "500")]);
        let err = handle_stripe_event(&state, billing, WebhookEvent::CheckoutCompleted(unknown))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));

        let missing = session("cs_3", false, None, &[("credits", "500")]);
        let err = handle_stripe_event(&state, billing, WebhookEvent::CheckoutCompleted(missing))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));

        assert_eq!(db.writes(), writes_before);
        assert!(db.purchases().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let db = Arc::new(MemoryDb::default());
        let user = seed_user(&db, "user_sub", 10);
        let stripe_client = Arc::new(FakeStripeClient::new());
        stripe_client.insert_subscription(subscription(1_900_000_000));
        let state = billing_state(db.clone(), stripe_client.clone());
        let billing = state.billing().unwrap();
        let user_id = user.id.to_string();

        let completed = session(
            "cs_sub",
            true,
            Some("sub_1"),
            &[("userId", &user_id), ("kind", "subscription"), ("plan", "pro")],
        );
        for _ in 0..2 {
            handle_stripe_event(&state, billing, WebhookEvent::CheckoutCompleted(completed.clone()))
                .await
                .unwrap();
        }
        let stored = db.get_user_by_id(user.id).unwrap();
        assert_eq!(stored.credits, 1010);
        assert_eq!(stored.subscription_plan.as_deref(), Some("pro"));
        assert_eq!(stored.stripe_price_id.as_deref(), Some("price_pro"));
        assert_eq!(stored.stripe_customer_id.as_deref(), Some("cus_9"));
        assert!(stored.has_active_subscription());

        let first_invoice = StripeInvoice {
            subscription: Some("sub_1".to_string()),
            is_renewal: false,
        };
        handle_stripe_event(&state, billing, WebhookEvent::InvoicePaid(first_invoice))
            .await
            .unwrap();
        assert_eq!(db.credits_of(user.id), 1010);

        stripe_client.insert_subscription(subscription(1_902_600_000));
        let renewal = StripeInvoice {
            subscription: Some("sub_1".to_string()),
            is_renewal: true,
        };
        for _ in 0..2 {
            handle_stripe_event(&state, billing, WebhookEvent::InvoicePaid(renewal.clone()))
                .await
                .unwrap();
        }
        assert_eq!(db.credits_of(user.id), 2010);
        let stored = db.get_user_by_id(user.id).unwrap();
        assert_eq!(
            stored.stripe_current_period_end.map(|end| end.timestamp()),
            Some(1_902_600_000)
        );

        handle_stripe_event(
            &state,
            billing,
            WebhookEvent::SubscriptionDeleted(subscription(1_902_600_000)),
        )
        .await
        .unwrap();
        let stored = db.get_user_by_id(user.id).unwrap();
        assert_eq!(stored.stripe_customer_id.as_deref(), Some("cus_9"));
        assert!(stored.stripe_subscription_id.is_none());
        assert!(stored.subscription_plan.is_none());
        assert!(!stored.has_active_subscription());
        assert_eq!(stored.credits, 2010);
    }

    #[tokio::test]
    async fn test_expired_checkout_fails_purchase() {
        let db = Arc::new(MemoryDb::default());
        let user = seed_user(&db, "user_pay", 10);
        db.create_purchase(NewPurchase {
            user_id: user.id,
            stripe_session_id: "cs_exp".to_string(),
            amount: 999,
            credits: 100,
            status: PurchaseStatus::Pending,
        })
        .unwrap();
        let state = billing_state(db.clone(), Arc::new(FakeStripeClient::new()));
        let billing = state.billing().unwrap();

        let expired = session("cs_exp", false, None, &[]);
        handle_stripe_event(&state, billing, WebhookEvent::CheckoutExpired(expired))
            .await
            .unwrap();
        assert_eq!(db.purchases()[0].status, PurchaseStatus::Failed);
        assert_eq!(db.credits_of(user.id), 10);

        // Sessions we never recorded are not an error.
        let stranger = session("cs_other", false, None, &[]);
        handle_stripe_event(&state, billing, WebhookEvent::CheckoutExpired(stranger))
            .await
            .unwrap();
        handle_stripe_event(&state, billing, WebhookEvent::Ignored("PlanCreated".to_string()))
            .await
            .unwrap();
    }
}
