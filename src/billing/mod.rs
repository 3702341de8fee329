#[cfg(test)]
mod fake_stripe_client;
mod real_stripe_client;

use crate::config::StripeSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
pub use fake_stripe_client::*;
pub use real_stripe_client::*;

pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

pub const KIND_CREDITS: &str = "credits";
pub const KIND_SUBSCRIPTION: &str = "subscription";

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Stripe request failed: {0}")]
    RequestFailed(String),
    #[error("Stripe error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid Stripe id: {0}")]
    InvalidId(String),
    #[error("Price for plan {0} is not configured")]
    PriceNotConfigured(Plan),
    #[error("Missing Stripe-Signature header")]
    MissingSignature,
    #[error("Webhook timestamp outside tolerance")]
    StaleTimestamp,
    #[error("Invalid webhook signature")]
    InvalidSignature,
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
}

/// One-off credit packs sold through payment-mode checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditPack {
    Small,
    Medium,
    Large,
}

impl CreditPack {
    pub fn credits(&self) -> i32 {
        match self {
            CreditPack::Small => 100,
            CreditPack::Medium => 500,
            CreditPack::Large => 1500,
        }
    }

    pub fn amount_cents(&self) -> i32 {
        match self {
            CreditPack::Small => 999,
            CreditPack::Medium => 3999,
            CreditPack::Large => 9999,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CreditPack::Small => "Small credit pack",
            CreditPack::Medium => "Medium credit pack",
            CreditPack::Large => "Large credit pack",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Basic,
    Pro,
    Enterprise,
}

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Basic, Plan::Pro, Plan::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Basic => "basic",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    pub fn monthly_credits(&self) -> i32 {
        match self {
            Plan::Basic => 200,
            Plan::Pro => 1000,
            Plan::Enterprise => 5000,
        }
    }

    pub fn price_id<'a>(&self, settings: &'a StripeSettings) -> Option<&'a str> {
        match self {
            Plan::Basic => settings.basic_price_id.as_deref(),
            Plan::Pro => settings.pro_price_id.as_deref(),
            Plan::Enterprise => settings.enterprise_price_id.as_deref(),
        }
    }

    pub fn from_price_id(settings: &StripeSettings, price_id: &str) -> Option<Plan> {
        Plan::ALL
            .into_iter()
            .find(|plan| plan.price_id(settings) == Some(price_id))
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Plan::Basic),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            _ => Err(()),
        }
    }
}

/// What a checkout session sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutItem {
    Pack(CreditPack),
    Subscription(Plan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeCheckoutMode {
    Payment,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripeLineItem {
    Price(String),
    Inline { name: String, unit_amount: i64 },
}

#[derive(Debug, Clone)]
pub struct StripeCheckoutParams {
    pub mode: StripeCheckoutMode,
    pub customer: Option<String>,
    pub customer_email: Option<String>,
    pub create_customer: bool,
    pub client_reference_id: String,
    pub line_item: StripeLineItem,
    pub metadata: HashMap<String, String>,
    pub subscription_metadata: Option<HashMap<String, String>>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionCreated {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PortalSession {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub current_period_end: i64,
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub is_subscription: bool,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub amount_total: Option<i64>,
    pub metadata: HashMap<String, String>,
}

impl StripeCheckoutSession {
    pub fn metadata_user_id(&self) -> Option<Uuid> {
        self.metadata
            .get("userId")
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeInvoice {
    pub subscription: Option<String>,
    /// Only `subscription_cycle` invoices renew; the first one is covered by checkout.
    pub is_renewal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    CheckoutCompleted(StripeCheckoutSession),
    CheckoutExpired(StripeCheckoutSession),
    InvoicePaid(StripeInvoice),
    SubscriptionDeleted(StripeSubscription),
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeWebhookEvent {
    pub id: String,
    pub event: WebhookEvent,
}

#[async_trait]
pub trait StripeClient: Send + Sync {
    async fn create_checkout_session(
        &self,
        params: StripeCheckoutParams,
    ) -> Result<CheckoutSessionCreated, BillingError>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, BillingError>;

    async fn get_subscription(&self, subscription_id: &str)
        -> Result<StripeSubscription, BillingError>;
}

#[derive(Clone)]
pub struct StripeBilling {
    settings: StripeSettings,
    client: Arc<dyn StripeClient>,
}

impl StripeBilling {
    pub fn new(settings: StripeSettings) -> Self {
        let client = stripe::Client::from_url(settings.api_base.as_str(), settings.secret_key.clone());
        Self {
            client: Arc::new(RealStripeClient::new(Arc::new(client))),
            settings,
        }
    }

    #[cfg(test)]
    pub fn test(settings: StripeSettings, client: Arc<FakeStripeClient>) -> Self {
        Self { settings, client }
    }

    pub fn settings(&self) -> &StripeSettings {
        &self.settings
    }

    pub async fn create_checkout(
        &self,
        item: CheckoutItem,
        user_id: Uuid,
        email: &str,
        customer_id: Option<&str>,
        app_url: &str,
    ) -> Result<CheckoutSessionCreated, BillingError> {
        let app_url = app_url.trim_end_matches('/');
        let mut metadata = HashMap::from([("userId".to_string(), user_id.to_string())]);

        let (mode, line_item, subscription_metadata) = match item {
            CheckoutItem::Pack(pack) => {
                metadata.insert("kind".into(), KIND_CREDITS.into());
                metadata.insert("credits".into(), pack.credits().to_string());
                let line_item = StripeLineItem::Inline {
                    name: format!("{} ({} credits)", pack.name(), pack.credits()),
                    unit_amount: i64::from(pack.amount_cents()),
                };
                (StripeCheckoutMode::Payment, line_item, None)
            }
            CheckoutItem::Subscription(plan) => {
                let price_id = plan
                    .price_id(&self.settings)
                    .ok_or(BillingError::PriceNotConfigured(plan))?;
                metadata.insert("kind".into(), KIND_SUBSCRIPTION.into());
                metadata.insert("plan".into(), plan.as_str().into());
                metadata.insert("credits".into(), plan.monthly_credits().to_string());
                let subscription_metadata = HashMap::from([
                    ("userId".to_string(), user_id.to_string()),
                    ("plan".to_string(), plan.as_str().to_string()),
                ]);
                (
                    StripeCheckoutMode::Subscription,
                    StripeLineItem::Price(price_id.to_string()),
                    Some(subscription_metadata),
                )
            }
        };

        let params = StripeCheckoutParams {
            mode,
            customer: customer_id.map(ToOwned::to_owned),
            customer_email: customer_id
                .is_none()
                .then(|| email.to_string())
                .filter(|email| !email.is_empty()),
            create_customer: mode == StripeCheckoutMode::Payment && customer_id.is_none(),
            client_reference_id: user_id.to_string(),
            line_item,
            metadata,
            subscription_metadata,
            success_url: format!("{}/dashboard?checkout=success", app_url),
            cancel_url: format!("{}/pricing?checkout=cancelled", app_url),
        };

        debug!("Creating checkout session for user {}", user_id);
        self.client.create_checkout_session(params).await
    }

    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, BillingError> {
        self.client
            .create_portal_session(customer_id, return_url)
            .await
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscription, BillingError> {
        self.client.get_subscription(subscription_id).await
    }

    /// Validates a `Stripe-Signature` header (`t=...,v1=...`) against the raw
    /// payload and returns the parsed event.
    pub fn construct_event(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now: i64,
    ) -> Result<StripeWebhookEvent, BillingError> {
        let header = signature_header.ok_or(BillingError::MissingSignature)?;
        let timestamp = signature_timestamp(header)?;
        if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
            return Err(BillingError::StaleTimestamp);
        }

        let payload = std::str::from_utf8(payload)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
        let event = stripe::Webhook::construct_event(payload, header, &self.settings.webhook_secret)
            .map_err(|err| match err {
                stripe::WebhookError::BadParse(e) => BillingError::InvalidPayload(e.to_string()),
                stripe::WebhookError::BadTimestamp(_) => BillingError::StaleTimestamp,
                _ => BillingError::InvalidSignature,
            })?;
        Ok(event.into())
    }
}

fn signature_timestamp(header: &str) -> Result<i64, BillingError> {
    header
        .split(',')
        .find_map(|part| part.trim().strip_prefix("t="))
        .and_then(|t| t.parse().ok())
        .ok_or(BillingError::InvalidSignature)
}

#[cfg(test)]
pub(crate) fn test_settings() -> StripeSettings {
    StripeSettings {
        secret_key: "sk_test_123".to_string(),
        webhook_secret: "whsec_test".to_string(),
        api_base: "http://stripe.test".to_string(),
        basic_price_id: Some("price_basic".to_string()),
        pro_price_id: Some("price_pro".to_string()),
        enterprise_price_id: None,
    }
}
