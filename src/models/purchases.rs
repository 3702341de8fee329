use crate::models::schema::purchases;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PurchaseError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Purchase not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::PurchaseStatus"]
#[DbValueStyle = "SCREAMING_SNAKE_CASE"]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = purchases)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Purchase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_session_id: String,
    pub amount: i32,
    pub credits: i32,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = purchases)]
pub struct NewPurchase {
    pub user_id: Uuid,
    pub stripe_session_id: String,
    pub amount: i32,
    pub credits: i32,
    pub status: PurchaseStatus,
}

impl NewPurchase {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<Purchase, PurchaseError> {
        diesel::insert_into(purchases::table)
            .values(self)
            .get_result::<Purchase>(conn)
            .map_err(PurchaseError::DatabaseError)
    }
}

impl Purchase {
    pub fn get_by_session_id(
        conn: &mut PgConnection,
        session_id: &str,
    ) -> Result<Option<Purchase>, PurchaseError> {
        purchases::table
            .filter(purchases::stripe_session_id.eq(session_id))
            .first::<Purchase>(conn)
            .optional()
            .map_err(PurchaseError::DatabaseError)
    }

    pub fn set_status(
        conn: &mut PgConnection,
        session_id: &str,
        status: PurchaseStatus,
    ) -> Result<Purchase, PurchaseError> {
        diesel::update(purchases::table.filter(purchases::stripe_session_id.eq(session_id)))
            .set((
                purchases::status.eq(status),
                purchases::updated_at.eq(diesel::dsl::now),
            ))
            .get_result::<Purchase>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => PurchaseError::NotFound,
                _ => PurchaseError::DatabaseError(e),
            })
    }

    pub fn completed_revenue(conn: &mut PgConnection) -> Result<i64, PurchaseError> {
        purchases::table
            .filter(purchases::status.eq(PurchaseStatus::Completed))
            .select(diesel::dsl::sum(purchases::amount))
            .first::<Option<i64>>(conn)
            .map(|total| total.unwrap_or(0))
            .map_err(PurchaseError::DatabaseError)
    }
}
