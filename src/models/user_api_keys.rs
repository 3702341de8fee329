use crate::models::schema::user_api_keys;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UserApiKeyError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("API key not found")]
    NotFound,
}

#[derive(Queryable, Selectable, Serialize, Clone)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = user_api_keys)]
pub struct UserApiKey {
    pub id: i32,
    pub user_id: Uuid,
    pub provider: String,
    #[serde(skip_serializing)]
    pub key_enc: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for UserApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserApiKey")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("key_enc", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

#[derive(Insertable, Clone)]
#[diesel(table_name = user_api_keys)]
pub struct NewUserApiKey {
    pub user_id: Uuid,
    pub provider: String,
    pub key_enc: Vec<u8>,
}

impl std::fmt::Debug for NewUserApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewUserApiKey")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("key_enc", &"<redacted>")
            .finish()
    }
}

impl NewUserApiKey {
    pub fn new(user_id: Uuid, provider: String, key_enc: Vec<u8>) -> Self {
        Self {
            user_id,
            provider,
            key_enc,
        }
    }

    /// Stores the key, replacing any previous key for the same provider.
    pub fn upsert(&self, conn: &mut PgConnection) -> Result<UserApiKey, UserApiKeyError> {
        diesel::insert_into(user_api_keys::table)
            .values(self)
            .on_conflict((user_api_keys::user_id, user_api_keys::provider))
            .do_update()
            .set((
                user_api_keys::key_enc.eq(self.key_enc.clone()),
                user_api_keys::updated_at.eq(diesel::dsl::now),
            ))
            .get_result::<UserApiKey>(conn)
            .map_err(UserApiKeyError::DatabaseError)
    }
}

impl UserApiKey {
    pub fn get_for_provider(
        conn: &mut PgConnection,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<Self>, UserApiKeyError> {
        user_api_keys::table
            .filter(user_api_keys::user_id.eq(user_id))
            .filter(user_api_keys::provider.eq(provider))
            .first::<Self>(conn)
            .optional()
            .map_err(UserApiKeyError::DatabaseError)
    }

    pub fn get_all_for_user(
        conn: &mut PgConnection,
        user_id: Uuid,
    ) -> Result<Vec<Self>, UserApiKeyError> {
        user_api_keys::table
            .filter(user_api_keys::user_id.eq(user_id))
            .order(user_api_keys::provider.asc())
            .load::<Self>(conn)
            .map_err(UserApiKeyError::DatabaseError)
    }

    pub fn delete_by_provider_and_user(
        conn: &mut PgConnection,
        provider: &str,
        user_id: Uuid,
    ) -> Result<(), UserApiKeyError> {
        let rows_affected = diesel::delete(
            user_api_keys::table
                .filter(user_api_keys::provider.eq(provider))
                .filter(user_api_keys::user_id.eq(user_id)),
        )
        .execute(conn)
        .map_err(UserApiKeyError::DatabaseError)?;

        if rows_affected == 0 {
            Err(UserApiKeyError::NotFound)
        } else {
            Ok(())
        }
    }
}
