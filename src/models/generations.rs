use crate::models::schema::generations;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Generation not found")]
    NotFound,
    #[error("Generation already finished")]
    AlreadyFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::GenerationType"]
#[DbValueStyle = "SCREAMING_SNAKE_CASE"]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationType {
    Text,
    Image,
    Code,
    Website,
}

impl GenerationType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TEXT" => Some(Self::Text),
            "IMAGE" => Some(Self::Image),
            "CODE" => Some(Self::Code),
            "WEBSITE" => Some(Self::Website),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::GenerationStatus"]
#[DbValueStyle = "SCREAMING_SNAKE_CASE"]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = generations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Generation {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub generation_type: GenerationType,
    pub prompt: String,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub status: GenerationStatus,
    pub tokens: i32,
    pub cost: f64,
    pub credits_used: i32,
    pub provider: String,
    pub model: String,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = generations)]
pub struct NewGeneration {
    pub user_id: Uuid,
    pub generation_type: GenerationType,
    pub prompt: String,
    pub status: GenerationStatus,
    pub credits_used: i32,
    pub provider: String,
    pub model: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewGeneration {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<Generation, GenerationError> {
        diesel::insert_into(generations::table)
            .values(self)
            .get_result::<Generation>(conn)
            .map_err(GenerationError::DatabaseError)
    }
}

/// Output recorded when a generation completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub tokens: i32,
    pub cost: f64,
    pub model: String,
}

/// Listing filter for a user's generations.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationFilter {
    pub generation_type: Option<GenerationType>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GenerationCounts {
    pub total: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_cost: f64,
}

impl Generation {
    pub fn get_by_id_and_user(
        conn: &mut PgConnection,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Generation, GenerationError> {
        generations::table
            .filter(generations::id.eq(id))
            .filter(generations::user_id.eq(user_id))
            .first::<Generation>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => GenerationError::NotFound,
                _ => GenerationError::DatabaseError(e),
            })
    }

    pub fn list_for_user(
        conn: &mut PgConnection,
        user_id: Uuid,
        filter: GenerationFilter,
    ) -> Result<Vec<Generation>, GenerationError> {
        let mut query = generations::table
            .filter(generations::user_id.eq(user_id))
            .into_boxed();

        if let Some(generation_type) = filter.generation_type {
            query = query.filter(generations::generation_type.eq(generation_type));
        }

        query
            .order(generations::created_at.desc())
            .limit(filter.limit)
            .offset(filter.offset)
            .load::<Generation>(conn)
            .map_err(GenerationError::DatabaseError)
    }

    /// Moves a PROCESSING row to COMPLETED. Rows already finished are left alone.
    pub fn mark_completed(
        conn: &mut PgConnection,
        id: Uuid,
        output: &GenerationOutput,
    ) -> Result<Generation, GenerationError> {
        diesel::update(
            generations::table
                .filter(generations::id.eq(id))
                .filter(generations::status.eq(GenerationStatus::Processing)),
        )
        .set((
            generations::status.eq(GenerationStatus::Completed),
            generations::content.eq(output.content.clone()),
            generations::image_url.eq(output.image_url.clone()),
            generations::tokens.eq(output.tokens),
            generations::cost.eq(output.cost),
            generations::model.eq(output.model.clone()),
            generations::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<Generation>(conn)
        .map_err(|e| match e {
            diesel::result::Error::NotFound => GenerationError::AlreadyFinished,
            _ => GenerationError::DatabaseError(e),
        })
    }

    /// Moves a PROCESSING row to FAILED. Rows already finished are left alone.
    pub fn mark_failed(
        conn: &mut PgConnection,
        id: Uuid,
        error: &str,
    ) -> Result<Generation, GenerationError> {
        diesel::update(
            generations::table
                .filter(generations::id.eq(id))
                .filter(generations::status.eq(GenerationStatus::Processing)),
        )
        .set((
            generations::status.eq(GenerationStatus::Failed),
            generations::error.eq(Some(error)),
            generations::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<Generation>(conn)
        .map_err(|e| match e {
            diesel::result::Error::NotFound => GenerationError::AlreadyFinished,
            _ => GenerationError::DatabaseError(e),
        })
    }

    pub fn delete_by_id_and_user(
        conn: &mut PgConnection,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<(), GenerationError> {
        let rows = diesel::delete(
            generations::table
                .filter(generations::id.eq(id))
                .filter(generations::user_id.eq(user_id)),
        )
        .execute(conn)
        .map_err(GenerationError::DatabaseError)?;

        if rows == 0 {
            Err(GenerationError::NotFound)
        } else {
            Ok(())
        }
    }

    pub fn counts(conn: &mut PgConnection) -> Result<GenerationCounts, GenerationError> {
        let by_status = generations::table
            .group_by(generations::status)
            .select((generations::status, diesel::dsl::count_star()))
            .load::<(GenerationStatus, i64)>(conn)?;

        let total_cost = generations::table
            .filter(generations::status.eq(GenerationStatus::Completed))
            .select(diesel::dsl::sum(generations::cost))
            .first::<Option<f64>>(conn)?
            .unwrap_or(0.0);

        let mut counts = GenerationCounts {
            total_cost,
            ..Default::default()
        };
        for (status, count) in by_status {
            counts.total += count;
            match status {
                GenerationStatus::Processing => counts.processing = count,
                GenerationStatus::Completed => counts.completed = count,
                GenerationStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}
