use crate::models::schema::{chat_messages, chats};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_SYSTEM: &str = "system";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Chat not found")]
    NotFound,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = chats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Chat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub provider: String,
    pub model: String,
    pub total_tokens: i32,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = chats)]
pub struct NewChat {
    pub user_id: Uuid,
    pub title: String,
    pub provider: String,
    pub model: String,
}

impl NewChat {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<Chat, ChatError> {
        diesel::insert_into(chats::table)
            .values(self)
            .get_result::<Chat>(conn)
            .map_err(ChatError::DatabaseError)
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = chat_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ChatMessage {
    pub id: i64,
    pub chat_id: Uuid,
    pub role: String,
    pub content: String,
    pub tokens: i32,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = chat_messages)]
pub struct NewChatMessage {
    pub chat_id: Uuid,
    pub role: String,
    pub content: String,
    pub tokens: i32,
    pub cost: f64,
}

impl NewChatMessage {
    /// Appends the message and bumps the chat's running totals atomically.
    pub fn append(&self, conn: &mut PgConnection) -> Result<ChatMessage, ChatError> {
        conn.transaction(|conn| {
            let message = diesel::insert_into(chat_messages::table)
                .values(self)
                .get_result::<ChatMessage>(conn)?;

            diesel::update(chats::table.filter(chats::id.eq(self.chat_id)))
                .set((
                    chats::total_tokens.eq(chats::total_tokens + self.tokens),
                    chats::total_cost.eq(chats::total_cost + self.cost),
                    chats::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;

            Ok(message)
        })
        .map_err(ChatError::DatabaseError)
    }
}

impl Chat {
    pub fn get_by_id_and_user(
        conn: &mut PgConnection,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Chat, ChatError> {
        chats::table
            .filter(chats::id.eq(id))
            .filter(chats::user_id.eq(user_id))
            .first::<Chat>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => ChatError::NotFound,
                _ => ChatError::DatabaseError(e),
            })
    }

    pub fn list_for_user(
        conn: &mut PgConnection,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Chat>, ChatError> {
        chats::table
            .filter(chats::user_id.eq(user_id))
            .order(chats::updated_at.desc())
            .limit(limit)
            .offset(offset)
            .load::<Chat>(conn)
            .map_err(ChatError::DatabaseError)
    }

    pub fn messages(conn: &mut PgConnection, chat_id: Uuid) -> Result<Vec<ChatMessage>, ChatError> {
        chat_messages::table
            .filter(chat_messages::chat_id.eq(chat_id))
            .order(chat_messages::id.asc())
            .load::<ChatMessage>(conn)
            .map_err(ChatError::DatabaseError)
    }

    pub fn delete_by_id_and_user(
        conn: &mut PgConnection,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<(), ChatError> {
        let rows = diesel::delete(
            chats::table
                .filter(chats::id.eq(id))
                .filter(chats::user_id.eq(user_id)),
        )
        .execute(conn)
        .map_err(ChatError::DatabaseError)?;

        if rows == 0 {
            Err(ChatError::NotFound)
        } else {
            Ok(())
        }
    }
}
