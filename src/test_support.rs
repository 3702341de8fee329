//! In-memory `DBConnection` and state builders for handler tests.

use crate::billing::{test_settings, FakeStripeClient, StripeBilling};
use crate::clerk::test_keys;
use crate::config::AppConfig;
use crate::db::{AdminStats, DBConnection, DBError, Fulfillment};
use crate::models::chats::{Chat, ChatMessage, NewChat, NewChatMessage};
use crate::models::generations::{
    Generation, GenerationCounts, GenerationFilter, GenerationOutput, GenerationStatus,
    NewGeneration,
};
use crate::models::provider_keys::{AiProviderKey, NewAiProviderKey};
use crate::models::purchases::{NewPurchase, Purchase, PurchaseStatus};
use crate::models::user_api_keys::{NewUserApiKey, UserApiKey};
use crate::models::users::{NewUser, SubscriptionUpdate, User, UserAdminUpdate};
use crate::providers::{ProviderKind, ProviderSettings};
use crate::AppState;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const TEST_ENCRYPTION_KEY: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    generations: Vec<Generation>,
    chats: Vec<Chat>,
    messages: Vec<ChatMessage>,
    purchases: Vec<Purchase>,
    user_api_keys: Vec<UserApiKey>,
    provider_keys: Vec<AiProviderKey>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryDb {
    tables: Mutex<Tables>,
    writes: AtomicUsize,
    /// Operation to fail and how many of its calls to let through first.
    fail_on: Mutex<Option<(&'static str, usize)>>,
}

impl MemoryDb {
    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Makes the call to `op` after `skip` successful ones return a
    /// connection error.
    pub fn fail_on(&self, op: &'static str, skip: usize) {
        *self.fail_on.lock().unwrap() = Some((op, skip));
    }

    fn injected(&self, op: &'static str) -> Result<(), DBError> {
        let mut fail_on = self.fail_on.lock().unwrap();
        match *fail_on {
            Some((target, 0)) if target == op => {
                *fail_on = None;
                Err(DBError::ConnectionError)
            }
            Some((target, skip)) if target == op => {
                *fail_on = Some((target, skip - 1));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn chat_count(&self) -> usize {
        self.tables.lock().unwrap().chats.len()
    }

    /// Number of mutating calls made so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn credits_of(&self, user_id: Uuid) -> i32 {
        self.tables
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| u.credits)
            .unwrap()
    }

    pub fn user_count(&self) -> usize {
        self.tables.lock().unwrap().users.len()
    }

    pub fn generation_count(&self) -> usize {
        self.tables.lock().unwrap().generations.len()
    }

    pub fn purchases(&self) -> Vec<Purchase> {
        self.tables.lock().unwrap().purchases.clone()
    }

    pub fn set_user(&self, user: User) {
        let mut t = self.tables.lock().unwrap();
        if let Some(existing) = t.users.iter_mut().find(|u| u.id == user.id) {
            *existing = user;
        }
    }
}

impl DBConnection for MemoryDb {
    fn create_user(&self, new_user: NewUser) -> Result<User, DBError> {
        let mut t = self.tables.lock().unwrap();
        if t.users.iter().any(|u| u.clerk_id == new_user.clerk_id) {
            return Err(DBError::UserAlreadyExists);
        }
        self.write();
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            clerk_id: new_user.clerk_id,
            email: new_user.email,
            credits: new_user.credits,
            is_admin: new_user.is_admin,
            has_unlimited_credits: false,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_price_id: None,
            stripe_current_period_end: None,
            subscription_plan: None,
            created_at: now,
            updated_at: now,
        };
        t.users.push(user.clone());
        Ok(user)
    }

    fn get_user_by_id(&self, id: Uuid) -> Result<User, DBError> {
        let t = self.tables.lock().unwrap();
        t.users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or(DBError::UserNotFound)
    }

    fn get_user_by_clerk_id(&self, clerk_id: &str) -> Result<Option<User>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.users.iter().find(|u| u.clerk_id == clerk_id).cloned())
    }

    fn get_user_by_stripe_customer_id(&self, customer_id: &str) -> Result<Option<User>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t
            .users
            .iter()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.users
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn update_user_admin_fields(
        &self,
        id: Uuid,
        changes: &UserAdminUpdate,
    ) -> Result<User, DBError> {
        let mut t = self.tables.lock().unwrap();
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(DBError::UserNotFound)?;
        self.write();
        if let Some(credits) = changes.credits {
            user.credits = credits;
        }
        if let Some(is_admin) = changes.is_admin {
            user.is_admin = is_admin;
        }
        if let Some(unlimited) = changes.has_unlimited_credits {
            user.has_unlimited_credits = unlimited;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    fn update_user_subscription(
        &self,
        id: Uuid,
        changes: &SubscriptionUpdate,
    ) -> Result<User, DBError> {
        let mut t = self.tables.lock().unwrap();
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(DBError::UserNotFound)?;
        self.write();
        user.stripe_customer_id = changes.stripe_customer_id.clone();
        user.stripe_subscription_id = changes.stripe_subscription_id.clone();
        user.stripe_price_id = changes.stripe_price_id.clone();
        user.stripe_current_period_end = changes.stripe_current_period_end;
        user.subscription_plan = changes.subscription_plan.clone();
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    fn delete_user_by_clerk_id(&self, clerk_id: &str) -> Result<(), DBError> {
        let mut t = self.tables.lock().unwrap();
        let id = t
            .users
            .iter()
            .find(|u| u.clerk_id == clerk_id)
            .map(|u| u.id)
            .ok_or(DBError::UserNotFound)?;
        self.write();
        t.users.retain(|u| u.id != id);
        t.generations.retain(|g| g.user_id != id);
        let chat_ids: Vec<Uuid> = t
            .chats
            .iter()
            .filter(|c| c.user_id == id)
            .map(|c| c.id)
            .collect();
        t.chats.retain(|c| c.user_id != id);
        t.messages.retain(|m| !chat_ids.contains(&m.chat_id));
        t.user_api_keys.retain(|k| k.user_id != id);
        Ok(())
    }

    fn try_deduct_credits(&self, user_id: Uuid, amount: i32) -> Result<Option<i32>, DBError> {
        let mut t = self.tables.lock().unwrap();
        match t
            .users
            .iter_mut()
            .find(|u| u.id == user_id && u.credits >= amount)
        {
            Some(user) => {
                self.write();
                user.credits -= amount;
                Ok(Some(user.credits))
            }
            None => Ok(None),
        }
    }

    fn add_credits(&self, user_id: Uuid, amount: i32) -> Result<i32, DBError> {
        let mut t = self.tables.lock().unwrap();
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(DBError::UserNotFound)?;
        self.write();
        user.credits += amount;
        Ok(user.credits)
    }

    fn create_generation(&self, new_generation: NewGeneration) -> Result<Generation, DBError> {
        let mut t = self.tables.lock().unwrap();
        self.write();
        let now = Utc::now();
        let generation = Generation {
            id: Uuid::new_v4(),
            user_id: new_generation.user_id,
            generation_type: new_generation.generation_type,
            prompt: new_generation.prompt,
            content: None,
            image_url: None,
            status: new_generation.status,
            tokens: 0,
            cost: 0.0,
            credits_used: new_generation.credits_used,
            provider: new_generation.provider,
            model: new_generation.model,
            metadata: new_generation.metadata,
            error: None,
            created_at: now,
            updated_at: now,
        };
        t.generations.push(generation.clone());
        Ok(generation)
    }

    fn complete_generation(
        &self,
        id: Uuid,
        output: &GenerationOutput,
    ) -> Result<Generation, DBError> {
        self.injected("complete_generation")?;
        let mut t = self.tables.lock().unwrap();
        let generation = t
            .generations
            .iter_mut()
            .find(|g| g.id == id && g.status == GenerationStatus::Processing)
            .ok_or(DBError::GenerationAlreadyFinished)?;
        self.write();
        generation.status = GenerationStatus::Completed;
        generation.content = output.content.clone();
        generation.image_url = output.image_url.clone();
        generation.tokens = output.tokens;
        generation.cost = output.cost;
        generation.model = output.model.clone();
        generation.updated_at = Utc::now();
        Ok(generation.clone())
    }

    fn fail_generation(&self, id: Uuid, error: &str) -> Result<Generation, DBError> {
        let mut t = self.tables.lock().unwrap();
        let generation = t
            .generations
            .iter_mut()
            .find(|g| g.id == id && g.status == GenerationStatus::Processing)
            .ok_or(DBError::GenerationAlreadyFinished)?;
        self.write();
        generation.status = GenerationStatus::Failed;
        generation.error = Some(error.to_string());
        generation.updated_at = Utc::now();
        Ok(generation.clone())
    }

    fn get_generation(&self, id: Uuid, user_id: Uuid) -> Result<Generation, DBError> {
        let t = self.tables.lock().unwrap();
        t.generations
            .iter()
            .find(|g| g.id == id && g.user_id == user_id)
            .cloned()
            .ok_or(DBError::GenerationNotFound)
    }

    fn list_generations(
        &self,
        user_id: Uuid,
        filter: GenerationFilter,
    ) -> Result<Vec<Generation>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.generations
            .iter()
            .rev()
            .filter(|g| g.user_id == user_id)
            .filter(|g| {
                filter
                    .generation_type
                    .map_or(true, |kind| g.generation_type == kind)
            })
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect())
    }

    fn delete_generation(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError> {
        let mut t = self.tables.lock().unwrap();
        let before = t.generations.len();
        t.generations
            .retain(|g| !(g.id == id && g.user_id == user_id));
        if t.generations.len() == before {
            return Err(DBError::GenerationNotFound);
        }
        self.write();
        Ok(())
    }

    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError> {
        self.injected("create_chat")?;
        let mut t = self.tables.lock().unwrap();
        self.write();
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4(),
            user_id: new_chat.user_id,
            title: new_chat.title,
            provider: new_chat.provider,
            model: new_chat.model,
            total_tokens: 0,
            total_cost: 0.0,
            created_at: now,
            updated_at: now,
        };
        t.chats.push(chat.clone());
        Ok(chat)
    }

    fn get_chat(&self, id: Uuid, user_id: Uuid) -> Result<Chat, DBError> {
        let t = self.tables.lock().unwrap();
        t.chats
            .iter()
            .find(|c| c.id == id && c.user_id == user_id)
            .cloned()
            .ok_or(DBError::ChatNotFound)
    }

    fn list_chats(&self, user_id: Uuid, limit: i64, offset: i64) -> Result<Vec<Chat>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.chats
            .iter()
            .rev()
            .filter(|c| c.user_id == user_id)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn delete_chat(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError> {
        let mut t = self.tables.lock().unwrap();
        let before = t.chats.len();
        t.chats.retain(|c| !(c.id == id && c.user_id == user_id));
        if t.chats.len() == before {
            return Err(DBError::ChatNotFound);
        }
        self.write();
        t.messages.retain(|m| m.chat_id != id);
        Ok(())
    }

    fn get_chat_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    fn append_chat_message(&self, message: NewChatMessage) -> Result<ChatMessage, DBError> {
        self.injected("append_chat_message")?;
        let mut guard = self.tables.lock().unwrap();
        let t = &mut *guard;
        let chat = t
            .chats
            .iter_mut()
            .find(|c| c.id == message.chat_id)
            .ok_or(DBError::ChatNotFound)?;
        self.write();
        chat.total_tokens += message.tokens;
        chat.total_cost += message.cost;
        chat.updated_at = Utc::now();

        t.next_id += 1;
        let stored = ChatMessage {
            id: t.next_id,
            chat_id: message.chat_id,
            role: message.role,
            content: message.content,
            tokens: message.tokens,
            cost: message.cost,
            created_at: Utc::now(),
        };
        t.messages.push(stored.clone());
        Ok(stored)
    }

    fn create_purchase(&self, new_purchase: NewPurchase) -> Result<Purchase, DBError> {
        let mut t = self.tables.lock().unwrap();
        self.write();
        let now = Utc::now();
        let purchase = Purchase {
            id: Uuid::new_v4(),
            user_id: new_purchase.user_id,
            stripe_session_id: new_purchase.stripe_session_id,
            amount: new_purchase.amount,
            credits: new_purchase.credits,
            status: new_purchase.status,
            created_at: now,
            updated_at: now,
        };
        t.purchases.push(purchase.clone());
        Ok(purchase)
    }

    fn get_purchase_by_session_id(&self, session_id: &str) -> Result<Option<Purchase>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.purchases
            .iter()
            .find(|p| p.stripe_session_id == session_id)
            .cloned())
    }

    fn fulfill_credit_purchase(
        &self,
        session_id: &str,
        user_id: Uuid,
        amount: i32,
        credits: i32,
    ) -> Result<Fulfillment, DBError> {
        let mut guard = self.tables.lock().unwrap();
        let t = &mut *guard;
        if !t.users.iter().any(|u| u.id == user_id) {
            return Err(DBError::UserNotFound);
        }
        match t
            .purchases
            .iter_mut()
            .find(|p| p.stripe_session_id == session_id)
        {
            Some(p) if p.status == PurchaseStatus::Completed => {
                return Ok(Fulfillment::AlreadyFulfilled)
            }
            Some(p) => p.status = PurchaseStatus::Completed,
            None => {
                let now = Utc::now();
                t.purchases.push(Purchase {
                    id: Uuid::new_v4(),
                    user_id,
                    stripe_session_id: session_id.to_string(),
                    amount,
                    credits,
                    status: PurchaseStatus::Completed,
                    created_at: now,
                    updated_at: now,
                });
            }
        }
        self.write();
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(DBError::UserNotFound)?;
        user.credits += credits;
        Ok(Fulfillment::Granted {
            balance: user.credits,
        })
    }

    fn fail_purchase(&self, session_id: &str) -> Result<(), DBError> {
        let mut t = self.tables.lock().unwrap();
        let purchase = t
            .purchases
            .iter_mut()
            .find(|p| p.stripe_session_id == session_id)
            .ok_or(DBError::PurchaseNotFound)?;
        self.write();
        purchase.status = PurchaseStatus::Failed;
        Ok(())
    }

    fn upsert_user_api_key(&self, key: NewUserApiKey) -> Result<UserApiKey, DBError> {
        let mut t = self.tables.lock().unwrap();
        self.write();
        let now = Utc::now();
        if let Some(existing) = t
            .user_api_keys
            .iter_mut()
            .find(|k| k.user_id == key.user_id && k.provider == key.provider)
        {
            existing.key_enc = key.key_enc;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        t.next_id += 1;
        let stored = UserApiKey {
            id: t.next_id as i32,
            user_id: key.user_id,
            provider: key.provider,
            key_enc: key.key_enc,
            created_at: now,
            updated_at: now,
        };
        t.user_api_keys.push(stored.clone());
        Ok(stored)
    }

    fn get_user_api_key(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<UserApiKey>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.user_api_keys
            .iter()
            .find(|k| k.user_id == user_id && k.provider == provider)
            .cloned())
    }

    fn list_user_api_keys(&self, user_id: Uuid) -> Result<Vec<UserApiKey>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.user_api_keys
            .iter()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect())
    }

    fn delete_user_api_key(&self, user_id: Uuid, provider: &str) -> Result<(), DBError> {
        let mut t = self.tables.lock().unwrap();
        let before = t.user_api_keys.len();
        t.user_api_keys
            .retain(|k| !(k.user_id == user_id && k.provider == provider));
        if t.user_api_keys.len() == before {
            return Err(DBError::ApiKeyNotFound);
        }
        self.write();
        Ok(())
    }

    fn upsert_provider_key(&self, key: NewAiProviderKey) -> Result<AiProviderKey, DBError> {
        let mut t = self.tables.lock().unwrap();
        self.write();
        let now = Utc::now();
        if let Some(existing) = t
            .provider_keys
            .iter_mut()
            .find(|k| k.provider == key.provider)
        {
            existing.key_enc = key.key_enc;
            existing.is_active = key.is_active;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        t.next_id += 1;
        let stored = AiProviderKey {
            id: t.next_id as i32,
            provider: key.provider,
            key_enc: key.key_enc,
            is_active: key.is_active,
            created_at: now,
            updated_at: now,
        };
        t.provider_keys.push(stored.clone());
        Ok(stored)
    }

    fn get_active_provider_key(&self, provider: &str) -> Result<Option<AiProviderKey>, DBError> {
        let t = self.tables.lock().unwrap();
        Ok(t.provider_keys
            .iter()
            .find(|k| k.provider == provider && k.is_active)
            .cloned())
    }

    fn list_provider_keys(&self) -> Result<Vec<AiProviderKey>, DBError> {
        Ok(self.tables.lock().unwrap().provider_keys.clone())
    }

    fn delete_provider_key(&self, provider: &str) -> Result<(), DBError> {
        let mut t = self.tables.lock().unwrap();
        let before = t.provider_keys.len();
        t.provider_keys.retain(|k| k.provider != provider);
        if t.provider_keys.len() == before {
            return Err(DBError::ProviderKeyNotFound);
        }
        self.write();
        Ok(())
    }

    fn get_admin_stats(&self) -> Result<AdminStats, DBError> {
        let t = self.tables.lock().unwrap();
        let mut generations = GenerationCounts::default();
        for g in &t.generations {
            generations.total += 1;
            match g.status {
                GenerationStatus::Processing => generations.processing += 1,
                GenerationStatus::Completed => {
                    generations.completed += 1;
                    generations.total_cost += g.cost;
                }
                GenerationStatus::Failed => generations.failed += 1,
            }
        }
        Ok(AdminStats {
            total_users: t.users.len() as i64,
            total_credits: t.users.iter().map(|u| u.credits as i64).sum(),
            generations,
            revenue_cents: t
                .purchases
                .iter()
                .filter(|p| p.status == PurchaseStatus::Completed)
                .map(|p| p.amount as i64)
                .sum(),
        })
    }
}

pub fn seed_user(db: &MemoryDb, clerk_id: &str, credits: i32) -> User {
    db.create_user(NewUser::new(
        clerk_id.to_string(),
        format!("{}@example.com", clerk_id),
        credits,
    ))
    .unwrap()
}

/// Configuration for tests; `provider` points one provider at a mock server.
pub fn test_config(provider: Option<(ProviderKind, &str)>) -> AppConfig {
    let mut providers = ProviderSettings {
        retry_budget: Duration::ZERO,
        ..Default::default()
    };
    if let Some((kind, base_url)) = provider {
        providers.api_keys.insert(kind, "env-key".to_string());
        providers.base_urls.insert(kind, base_url.to_string());
    }

    AppConfig {
        database_url: "postgres://unused".to_string(),
        port: 3000,
        app_url: "http://localhost:3000".to_string(),
        encryption_key: TEST_ENCRYPTION_KEY.to_string(),
        clerk_jwt_key: test_keys::PUBLIC_PEM.to_string(),
        clerk_webhook_secret: Some(test_keys::WEBHOOK_SECRET.to_string()),
        clerk_authorized_parties: vec![],
        admin_emails: vec!["boss@example.com".to_string()],
        free_credits: 10,
        rate_limit: 20,
        rate_limit_window: Duration::from_secs(60),
        stripe: None,
        providers,
    }
}

pub fn test_state(db: Arc<MemoryDb>, config: AppConfig) -> Arc<AppState> {
    Arc::new(AppState::new(config, db).unwrap())
}

/// State whose billing talks to `stripe_client` instead of the Stripe API.
pub fn billing_state(db: Arc<MemoryDb>, stripe_client: Arc<FakeStripeClient>) -> Arc<AppState> {
    let mut state = AppState::new(test_config(None), db).unwrap();
    state.billing = Some(StripeBilling::test(test_settings(), stripe_client));
    Arc::new(state)
}

pub fn bearer(clerk_id: &str) -> String {
    format!(
        "Bearer {}",
        test_keys::session_for(clerk_id, Some(&format!("{}@example.com", clerk_id)))
    )
}
