use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::billing::{
    BillingError, CheckoutSessionCreated, PortalSession, StripeCheckoutParams, StripeClient,
    StripeSubscription,
};

#[derive(Default)]
pub struct FakeStripeClient {
    pub checkout_sessions: Mutex<Vec<StripeCheckoutParams>>,
    pub portal_sessions: Mutex<Vec<(String, String)>>,
    pub subscriptions: Mutex<HashMap<String, StripeSubscription>>,
}

impl FakeStripeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&self, subscription: StripeSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }
}

#[async_trait]
impl StripeClient for FakeStripeClient {
    async fn create_checkout_session(
        &self,
        params: StripeCheckoutParams,
    ) -> Result<CheckoutSessionCreated, BillingError> {
        let mut sessions = self.checkout_sessions.lock().unwrap();
        sessions.push(params);
        let id = format!("cs_test_{}", sessions.len());
        Ok(CheckoutSessionCreated {
            url: Some(format!("https://checkout.stripe.test/{}", id)),
            id,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, BillingError> {
        self.portal_sessions
            .lock()
            .unwrap()
            .push((customer_id.to_string(), return_url.to_string()));
        Ok(PortalSession {
            url: format!("https://billing.stripe.test/{}", customer_id),
        })
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<StripeSubscription, BillingError> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::Api {
                status: 404,
                message: format!("No such subscription: '{}'", subscription_id),
            })
    }
}
