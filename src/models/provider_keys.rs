use crate::models::schema::ai_provider_keys;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderKeyError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Provider key not found")]
    NotFound,
}

/// Service-wide credential for one AI provider, managed by admins.
#[derive(Queryable, Selectable, Clone)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = ai_provider_keys)]
pub struct AiProviderKey {
    pub id: i32,
    pub provider: String,
    pub key_enc: Vec<u8>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for AiProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiProviderKey")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("key_enc", &"<redacted>")
            .field("is_active", &self.is_active)
            .finish()
    }
}

#[derive(Insertable, Clone)]
#[diesel(table_name = ai_provider_keys)]
pub struct NewAiProviderKey {
    pub provider: String,
    pub key_enc: Vec<u8>,
    pub is_active: bool,
}

impl NewAiProviderKey {
    pub fn upsert(&self, conn: &mut PgConnection) -> Result<AiProviderKey, ProviderKeyError> {
        diesel::insert_into(ai_provider_keys::table)
            .values(self)
            .on_conflict(ai_provider_keys::provider)
            .do_update()
            .set((
                ai_provider_keys::key_enc.eq(self.key_enc.clone()),
                ai_provider_keys::is_active.eq(self.is_active),
                ai_provider_keys::updated_at.eq(diesel::dsl::now),
            ))
            .get_result::<AiProviderKey>(conn)
            .map_err(ProviderKeyError::DatabaseError)
    }
}

impl AiProviderKey {
    pub fn get_active(
        conn: &mut PgConnection,
        provider: &str,
    ) -> Result<Option<Self>, ProviderKeyError> {
        ai_provider_keys::table
            .filter(ai_provider_keys::provider.eq(provider))
            .filter(ai_provider_keys::is_active.eq(true))
            .first::<Self>(conn)
            .optional()
            .map_err(ProviderKeyError::DatabaseError)
    }

    pub fn get_all(conn: &mut PgConnection) -> Result<Vec<Self>, ProviderKeyError> {
        ai_provider_keys::table
            .order(ai_provider_keys::provider.asc())
            .load::<Self>(conn)
            .map_err(ProviderKeyError::DatabaseError)
    }

    pub fn delete_by_provider(conn: &mut PgConnection, provider: &str) -> Result<(), ProviderKeyError> {
        let rows = diesel::delete(ai_provider_keys::table.filter(ai_provider_keys::provider.eq(provider)))
            .execute(conn)
            .map_err(ProviderKeyError::DatabaseError)?;

        if rows == 0 {
            Err(ProviderKeyError::NotFound)
        } else {
            Ok(())
        }
    }
}
