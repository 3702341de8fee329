use std::str::FromStr as _;
use std::sync::Arc;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionCustomerCreation, CheckoutSessionMode,
    CreateBillingPortalSession, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionSubscriptionData, Currency, CustomerId, Event, EventObject, EventType,
    Invoice, InvoiceBillingReason, Subscription, SubscriptionId,
};

use crate::billing::{
    BillingError, CheckoutSessionCreated, PortalSession, StripeCheckoutMode,
    StripeCheckoutParams, StripeCheckoutSession, StripeClient, StripeInvoice, StripeLineItem,
    StripeSubscription, StripeWebhookEvent, WebhookEvent, KIND_SUBSCRIPTION,
};

pub struct RealStripeClient {
    client: Arc<stripe::Client>,
}

impl RealStripeClient {
    pub fn new(client: Arc<stripe::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StripeClient for RealStripeClient {
    async fn create_checkout_session(
        &self,
        params: StripeCheckoutParams,
    ) -> Result<CheckoutSessionCreated, BillingError> {
        let customer = params.customer.as_deref().map(customer_id).transpose()?;

        let session = CheckoutSession::create(
            &self.client,
            CreateCheckoutSession {
                mode: Some(params.mode.into()),
                customer,
                customer_email: params.customer_email.as_deref(),
                customer_creation: params
                    .create_customer
                    .then_some(CheckoutSessionCustomerCreation::Always),
                client_reference_id: Some(params.client_reference_id.as_str()),
                line_items: Some(vec![params.line_item.clone().into()]),
                metadata: Some(params.metadata.clone()),
                subscription_data: params.subscription_metadata.clone().map(|metadata| {
                    CreateCheckoutSessionSubscriptionData {
                        metadata: Some(metadata),
                        ..Default::default()
                    }
                }),
                success_url: Some(params.success_url.as_str()),
                cancel_url: Some(params.cancel_url.as_str()),
                ..Default::default()
            },
        )
        .await?;

        Ok(CheckoutSessionCreated {
            id: session.id.as_str().to_string(),
            url: session.url,
        })
    }

    async fn create_portal_session(
        &self,
        customer: &str,
        return_url: &str,
    ) -> Result<PortalSession, BillingError> {
        let mut params = CreateBillingPortalSession::new(customer_id(customer)?);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(&self.client, params).await?;

        Ok(PortalSession { url: session.url })
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscription, BillingError> {
        let subscription_id = SubscriptionId::from_str(subscription_id)
            .map_err(|_| BillingError::InvalidId(subscription_id.to_string()))?;

        let subscription = Subscription::retrieve(&self.client, &subscription_id, &[]).await?;

        Ok(StripeSubscription::from(subscription))
    }
}

fn customer_id(value: &str) -> Result<CustomerId, BillingError> {
    CustomerId::from_str(value).map_err(|_| BillingError::InvalidId(value.to_string()))
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(error) => BillingError::Api {
                status: error.http_status,
                message: error.message.unwrap_or_default(),
            },
            other => BillingError::RequestFailed(other.to_string()),
        }
    }
}

impl From<StripeCheckoutMode> for CheckoutSessionMode {
    fn from(value: StripeCheckoutMode) -> Self {
        match value {
            StripeCheckoutMode::Payment => Self::Payment,
            StripeCheckoutMode::Subscription => Self::Subscription,
        }
    }
}

impl From<StripeLineItem> for CreateCheckoutSessionLineItems {
    fn from(value: StripeLineItem) -> Self {
        match value {
            StripeLineItem::Price(price) => Self {
                price: Some(price),
                quantity: Some(1),
                ..Default::default()
            },
            StripeLineItem::Inline { name, unit_amount } => Self {
                price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                    currency: Currency::USD,
                    unit_amount: Some(unit_amount),
                    product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                        name,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                quantity: Some(1),
                ..Default::default()
            },
        }
    }
}

impl From<Subscription> for StripeSubscription {
    fn from(value: Subscription) -> Self {
        Self {
            id: value.id.as_str().to_string(),
            customer: value.customer.id().as_str().to_string(),
            current_period_end: value.current_period_end,
            price_id: value
                .items
                .data
                .first()
                .and_then(|item| item.price.as_ref())
                .map(|price| price.id.as_str().to_string()),
        }
    }
}

impl From<CheckoutSession> for StripeCheckoutSession {
    fn from(value: CheckoutSession) -> Self {
        let metadata = value.metadata.unwrap_or_default();
        Self {
            id: value.id.as_str().to_string(),
            is_subscription: matches!(value.mode, CheckoutSessionMode::Subscription)
                || metadata.get("kind").map(String::as_str) == Some(KIND_SUBSCRIPTION),
            customer: value.customer.map(|c| c.id().as_str().to_string()),
            subscription: value.subscription.map(|s| s.id().as_str().to_string()),
            amount_total: value.amount_total,
            metadata,
        }
    }
}

impl From<Invoice> for StripeInvoice {
    fn from(value: Invoice) -> Self {
        Self {
            subscription: value.subscription.map(|s| s.id().as_str().to_string()),
            is_renewal: matches!(
                value.billing_reason,
                Some(InvoiceBillingReason::SubscriptionCycle)
            ),
        }
    }
}

impl From<Event> for StripeWebhookEvent {
    fn from(value: Event) -> Self {
        let id = value.id.as_str().to_string();
        let event = match (value.type_, value.data.object) {
            (EventType::CheckoutSessionCompleted, EventObject::CheckoutSession(session)) => {
                WebhookEvent::CheckoutCompleted(session.into())
            }
            (EventType::CheckoutSessionExpired, EventObject::CheckoutSession(session)) => {
                WebhookEvent::CheckoutExpired(session.into())
            }
            (EventType::InvoicePaymentSucceeded, EventObject::Invoice(invoice)) => {
                WebhookEvent::InvoicePaid(invoice.into())
            }
            (EventType::CustomerSubscriptionDeleted, EventObject::Subscription(subscription)) => {
                WebhookEvent::SubscriptionDeleted(subscription.into())
            }
            (event_type, _) => WebhookEvent::Ignored(format!("{:?}", event_type)),
        };
        Self { id, event }
    }
}
