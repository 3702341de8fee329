use crate::models::chats::{Chat, ChatError, ChatMessage, NewChat, NewChatMessage};
use crate::models::generations::{
    Generation, GenerationCounts, GenerationError, GenerationFilter, GenerationOutput,
    NewGeneration,
};
use crate::models::provider_keys::{AiProviderKey, NewAiProviderKey, ProviderKeyError};
use crate::models::purchases::{NewPurchase, Purchase, PurchaseError, PurchaseStatus};
use crate::models::user_api_keys::{NewUserApiKey, UserApiKey, UserApiKeyError};
use crate::models::users::{NewUser, SubscriptionUpdate, User, UserAdminUpdate, UserError};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DBError {
    #[error("Database connection error")]
    ConnectionError,
    #[error("Database query error: {0}")]
    QueryError(#[from] diesel::result::Error),
    #[error("User not found")]
    UserNotFound,
    #[error("User already exists")]
    UserAlreadyExists,
    #[error("User error: {0}")]
    UserError(UserError),
    #[error("Generation not found")]
    GenerationNotFound,
    #[error("Generation already finished")]
    GenerationAlreadyFinished,
    #[error("Generation error: {0}")]
    GenerationError(GenerationError),
    #[error("Chat not found")]
    ChatNotFound,
    #[error("Chat error: {0}")]
    ChatError(ChatError),
    #[error("Purchase not found")]
    PurchaseNotFound,
    #[error("Purchase error: {0}")]
    PurchaseError(PurchaseError),
    #[error("API key not found")]
    ApiKeyNotFound,
    #[error("API key error: {0}")]
    UserApiKeyError(UserApiKeyError),
    #[error("Provider key not found")]
    ProviderKeyNotFound,
    #[error("Provider key error: {0}")]
    ProviderKeyError(ProviderKeyError),
}

impl From<UserError> for DBError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound => DBError::UserNotFound,
            UserError::AlreadyExists => DBError::UserAlreadyExists,
            e => DBError::UserError(e),
        }
    }
}

impl From<GenerationError> for DBError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::NotFound => DBError::GenerationNotFound,
            GenerationError::AlreadyFinished => DBError::GenerationAlreadyFinished,
            e => DBError::GenerationError(e),
        }
    }
}

impl From<ChatError> for DBError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::NotFound => DBError::ChatNotFound,
            e => DBError::ChatError(e),
        }
    }
}

impl From<PurchaseError> for DBError {
    fn from(err: PurchaseError) -> Self {
        match err {
            PurchaseError::NotFound => DBError::PurchaseNotFound,
            e => DBError::PurchaseError(e),
        }
    }
}

impl From<UserApiKeyError> for DBError {
    fn from(err: UserApiKeyError) -> Self {
        match err {
            UserApiKeyError::NotFound => DBError::ApiKeyNotFound,
            e => DBError::UserApiKeyError(e),
        }
    }
}

impl From<ProviderKeyError> for DBError {
    fn from(err: ProviderKeyError) -> Self {
        match err {
            ProviderKeyError::NotFound => DBError::ProviderKeyNotFound,
            e => DBError::ProviderKeyError(e),
        }
    }
}

/// Aggregate numbers for the admin dashboard.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AdminStats {
    pub total_users: i64,
    pub total_credits: i64,
    pub generations: GenerationCounts,
    pub revenue_cents: i64,
}

/// Outcome of applying a paid credit pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fulfillment {
    Granted { balance: i32 },
    AlreadyFulfilled,
}

pub trait DBConnection {
    // Users
    fn create_user(&self, new_user: NewUser) -> Result<User, DBError>;
    fn get_user_by_id(&self, id: Uuid) -> Result<User, DBError>;
    fn get_user_by_clerk_id(&self, clerk_id: &str) -> Result<Option<User>, DBError>;
    fn get_user_by_stripe_customer_id(&self, customer_id: &str) -> Result<Option<User>, DBError>;
    fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, DBError>;
    fn update_user_admin_fields(
        &self,
        id: Uuid,
        changes: &UserAdminUpdate,
    ) -> Result<User, DBError>;
    fn update_user_subscription(
        &self,
        id: Uuid,
        changes: &SubscriptionUpdate,
    ) -> Result<User, DBError>;
    fn delete_user_by_clerk_id(&self, clerk_id: &str) -> Result<(), DBError>;

    // Credits
    fn try_deduct_credits(&self, user_id: Uuid, amount: i32) -> Result<Option<i32>, DBError>;
    fn add_credits(&self, user_id: Uuid, amount: i32) -> Result<i32, DBError>;

    // Generations
    fn create_generation(&self, new_generation: NewGeneration) -> Result<Generation, DBError>;
    fn complete_generation(
        &self,
        id: Uuid,
        output: &GenerationOutput,
    ) -> Result<Generation, DBError>;
    fn fail_generation(&self, id: Uuid, error: &str) -> Result<Generation, DBError>;
    fn get_generation(&self, id: Uuid, user_id: Uuid) -> Result<Generation, DBError>;
    fn list_generations(
        &self,
        user_id: Uuid,
        filter: GenerationFilter,
    ) -> Result<Vec<Generation>, DBError>;
    fn delete_generation(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError>;

    // Chats
    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError>;
    fn get_chat(&self, id: Uuid, user_id: Uuid) -> Result<Chat, DBError>;
    fn list_chats(&self, user_id: Uuid, limit: i64, offset: i64) -> Result<Vec<Chat>, DBError>;
    fn delete_chat(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError>;
    fn get_chat_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, DBError>;
    fn append_chat_message(&self, message: NewChatMessage) -> Result<ChatMessage, DBError>;

    // Purchases
    fn create_purchase(&self, new_purchase: NewPurchase) -> Result<Purchase, DBError>;
    fn get_purchase_by_session_id(&self, session_id: &str) -> Result<Option<Purchase>, DBError>;
    fn fulfill_credit_purchase(
        &self,
        session_id: &str,
        user_id: Uuid,
        amount: i32,
        credits: i32,
    ) -> Result<Fulfillment, DBError>;
    fn fail_purchase(&self, session_id: &str) -> Result<(), DBError>;

    // Provider credentials
    fn upsert_user_api_key(&self, key: NewUserApiKey) -> Result<UserApiKey, DBError>;
    fn get_user_api_key(&self, user_id: Uuid, provider: &str)
        -> Result<Option<UserApiKey>, DBError>;
    fn list_user_api_keys(&self, user_id: Uuid) -> Result<Vec<UserApiKey>, DBError>;
    fn delete_user_api_key(&self, user_id: Uuid, provider: &str) -> Result<(), DBError>;
    fn upsert_provider_key(&self, key: NewAiProviderKey) -> Result<AiProviderKey, DBError>;
    fn get_active_provider_key(&self, provider: &str) -> Result<Option<AiProviderKey>, DBError>;
    fn list_provider_keys(&self) -> Result<Vec<AiProviderKey>, DBError>;
    fn delete_provider_key(&self, provider: &str) -> Result<(), DBError>;

    // Admin
    fn get_admin_stats(&self) -> Result<AdminStats, DBError>;
}

pub struct PostgresConnection {
    db: Pool<ConnectionManager<PgConnection>>,
}

impl PostgresConnection {
    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, DBError> {
        self.db.get().map_err(|e| {
            error!("Failed to get a pooled connection: {:?}", e);
            DBError::ConnectionError
        })
    }
}

impl DBConnection for PostgresConnection {
    fn create_user(&self, new_user: NewUser) -> Result<User, DBError> {
        debug!("Creating user for clerk id {}", new_user.clerk_id);
        let conn = &mut self.conn()?;
        Ok(new_user.insert(conn)?)
    }

    fn get_user_by_id(&self, id: Uuid) -> Result<User, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::get_by_id(conn, id)?)
    }

    fn get_user_by_clerk_id(&self, clerk_id: &str) -> Result<Option<User>, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::get_by_clerk_id(conn, clerk_id)?)
    }

    fn get_user_by_stripe_customer_id(&self, customer_id: &str) -> Result<Option<User>, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::get_by_stripe_customer_id(conn, customer_id)?)
    }

    fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::list(conn, limit, offset)?)
    }

    fn update_user_admin_fields(
        &self,
        id: Uuid,
        changes: &UserAdminUpdate,
    ) -> Result<User, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::update_admin_fields(conn, id, changes)?)
    }

    fn update_user_subscription(
        &self,
        id: Uuid,
        changes: &SubscriptionUpdate,
    ) -> Result<User, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::update_subscription(conn, id, changes)?)
    }

    fn delete_user_by_clerk_id(&self, clerk_id: &str) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(User::delete_by_clerk_id(conn, clerk_id)?)
    }

    fn try_deduct_credits(&self, user_id: Uuid, amount: i32) -> Result<Option<i32>, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::try_deduct_credits(conn, user_id, amount)?)
    }

    fn add_credits(&self, user_id: Uuid, amount: i32) -> Result<i32, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::add_credits(conn, user_id, amount)?)
    }

    fn create_generation(&self, new_generation: NewGeneration) -> Result<Generation, DBError> {
        let conn = &mut self.conn()?;
        Ok(new_generation.insert(conn)?)
    }

    fn complete_generation(
        &self,
        id: Uuid,
        output: &GenerationOutput,
    ) -> Result<Generation, DBError> {
        let conn = &mut self.conn()?;
        Ok(Generation::mark_completed(conn, id, output)?)
    }

    fn fail_generation(&self, id: Uuid, error: &str) -> Result<Generation, DBError> {
        let conn = &mut self.conn()?;
        Ok(Generation::mark_failed(conn, id, error)?)
    }

    fn get_generation(&self, id: Uuid, user_id: Uuid) -> Result<Generation, DBError> {
        let conn = &mut self.conn()?;
        Ok(Generation::get_by_id_and_user(conn, id, user_id)?)
    }

    fn list_generations(
        &self,
        user_id: Uuid,
        filter: GenerationFilter,
    ) -> Result<Vec<Generation>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Generation::list_for_user(conn, user_id, filter)?)
    }

    fn delete_generation(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(Generation::delete_by_id_and_user(conn, id, user_id)?)
    }

    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError> {
        let conn = &mut self.conn()?;
        Ok(new_chat.insert(conn)?)
    }

    fn get_chat(&self, id: Uuid, user_id: Uuid) -> Result<Chat, DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::get_by_id_and_user(conn, id, user_id)?)
    }

    fn list_chats(&self, user_id: Uuid, limit: i64, offset: i64) -> Result<Vec<Chat>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::list_for_user(conn, user_id, limit, offset)?)
    }

    fn delete_chat(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::delete_by_id_and_user(conn, id, user_id)?)
    }

    fn get_chat_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::messages(conn, chat_id)?)
    }

    fn append_chat_message(&self, message: NewChatMessage) -> Result<ChatMessage, DBError> {
        let conn = &mut self.conn()?;
        Ok(message.append(conn)?)
    }

    fn create_purchase(&self, new_purchase: NewPurchase) -> Result<Purchase, DBError> {
        let conn = &mut self.conn()?;
        Ok(new_purchase.insert(conn)?)
    }

    fn get_purchase_by_session_id(&self, session_id: &str) -> Result<Option<Purchase>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Purchase::get_by_session_id(conn, session_id)?)
    }

    fn fulfill_credit_purchase(
        &self,
        session_id: &str,
        user_id: Uuid,
        amount: i32,
        credits: i32,
    ) -> Result<Fulfillment, DBError> {
        let conn = &mut self.conn()?;
        conn.transaction::<_, DBError, _>(|conn| {
            match Purchase::get_by_session_id(conn, session_id)? {
                Some(purchase) if purchase.status == PurchaseStatus::Completed => {
                    return Ok(Fulfillment::AlreadyFulfilled);
                }
                Some(_) => {
                    Purchase::set_status(conn, session_id, PurchaseStatus::Completed)?;
                }
                None => {
                    NewPurchase {
                        user_id,
                        stripe_session_id: session_id.to_string(),
                        amount,
                        credits,
                        status: PurchaseStatus::Completed,
                    }
                    .insert(conn)?;
                }
            }
            let balance = User::add_credits(conn, user_id, credits)?;
            Ok(Fulfillment::Granted { balance })
        })
    }

    fn fail_purchase(&self, session_id: &str) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Purchase::set_status(conn, session_id, PurchaseStatus::Failed)?;
        Ok(())
    }

    fn upsert_user_api_key(&self, key: NewUserApiKey) -> Result<UserApiKey, DBError> {
        let conn = &mut self.conn()?;
        Ok(key.upsert(conn)?)
    }

    fn get_user_api_key(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<UserApiKey>, DBError> {
        let conn = &mut self.conn()?;
        Ok(UserApiKey::get_for_provider(conn, user_id, provider)?)
    }

    fn list_user_api_keys(&self, user_id: Uuid) -> Result<Vec<UserApiKey>, DBError> {
        let conn = &mut self.conn()?;
        Ok(UserApiKey::get_all_for_user(conn, user_id)?)
    }

    fn delete_user_api_key(&self, user_id: Uuid, provider: &str) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(UserApiKey::delete_by_provider_and_user(conn, provider, user_id)?)
    }

    fn upsert_provider_key(&self, key: NewAiProviderKey) -> Result<AiProviderKey, DBError> {
        let conn = &mut self.conn()?;
        Ok(key.upsert(conn)?)
    }

    fn get_active_provider_key(&self, provider: &str) -> Result<Option<AiProviderKey>, DBError> {
        let conn = &mut self.conn()?;
        Ok(AiProviderKey::get_active(conn, provider)?)
    }

    fn list_provider_keys(&self) -> Result<Vec<AiProviderKey>, DBError> {
        let conn = &mut self.conn()?;
        Ok(AiProviderKey::get_all(conn)?)
    }

    fn delete_provider_key(&self, provider: &str) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(AiProviderKey::delete_by_provider(conn, provider)?)
    }

    fn get_admin_stats(&self) -> Result<AdminStats, DBError> {
        let conn = &mut self.conn()?;
        Ok(AdminStats {
            total_users: User::count(conn)?,
            total_credits: User::total_credits(conn)?,
            generations: Generation::counts(conn)?,
            revenue_cents: Purchase::completed_revenue(conn)?,
        })
    }
}

pub fn setup_db(url: &str) -> Result<Arc<dyn DBConnection + Send + Sync>, DBError> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder()
        .test_on_check_out(true)
        .build(manager)
        .map_err(|e| {
            error!("Could not build connection pool: {:?}", e);
            DBError::ConnectionError
        })?;
    info!("Database connection pool ready");
    Ok(Arc::new(PostgresConnection { db: pool }))
}
