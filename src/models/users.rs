use crate::models::schema::users;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UserError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("User not found")]
    NotFound,
    #[error("User with this Clerk id already exists")]
    AlreadyExists,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: Uuid,
    pub clerk_id: String,
    pub email: String,
    pub credits: i32,
    pub is_admin: bool,
    pub has_unlimited_credits: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_current_period_end: Option<DateTime<Utc>>,
    pub subscription_plan: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_active_subscription(&self) -> bool {
        match (&self.stripe_subscription_id, self.stripe_current_period_end) {
            (Some(_), Some(end)) => end > Utc::now(),
            _ => false,
        }
    }

    pub fn get_by_id(conn: &mut PgConnection, id: Uuid) -> Result<User, UserError> {
        users::table
            .filter(users::id.eq(id))
            .first::<User>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    pub fn get_by_clerk_id(
        conn: &mut PgConnection,
        clerk_id: &str,
    ) -> Result<Option<User>, UserError> {
        users::table
            .filter(users::clerk_id.eq(clerk_id))
            .first::<User>(conn)
            .optional()
            .map_err(UserError::DatabaseError)
    }

    pub fn get_by_stripe_customer_id(
        conn: &mut PgConnection,
        customer_id: &str,
    ) -> Result<Option<User>, UserError> {
        users::table
            .filter(users::stripe_customer_id.eq(customer_id))
            .first::<User>(conn)
            .optional()
            .map_err(UserError::DatabaseError)
    }

    pub fn list(conn: &mut PgConnection, limit: i64, offset: i64) -> Result<Vec<User>, UserError> {
        users::table
            .order(users::created_at.desc())
            .limit(limit)
            .offset(offset)
            .load::<User>(conn)
            .map_err(UserError::DatabaseError)
    }

    pub fn count(conn: &mut PgConnection) -> Result<i64, UserError> {
        users::table
            .count()
            .get_result(conn)
            .map_err(UserError::DatabaseError)
    }

    pub fn total_credits(conn: &mut PgConnection) -> Result<i64, UserError> {
        users::table
            .select(diesel::dsl::sum(users::credits))
            .first::<Option<i64>>(conn)
            .map(|total| total.unwrap_or(0))
            .map_err(UserError::DatabaseError)
    }

    /// Decrements the balance only when it covers `amount`.
    /// Returns the remaining balance, or `None` when the balance is too low.
    pub fn try_deduct_credits(
        conn: &mut PgConnection,
        id: Uuid,
        amount: i32,
    ) -> Result<Option<i32>, UserError> {
        diesel::update(
            users::table
                .filter(users::id.eq(id))
                .filter(users::credits.ge(amount)),
        )
        .set((
            users::credits.eq(users::credits - amount),
            users::updated_at.eq(diesel::dsl::now),
        ))
        .returning(users::credits)
        .get_result::<i32>(conn)
        .optional()
        .map_err(UserError::DatabaseError)
    }

    pub fn add_credits(conn: &mut PgConnection, id: Uuid, amount: i32) -> Result<i32, UserError> {
        diesel::update(users::table.filter(users::id.eq(id)))
            .set((
                users::credits.eq(users::credits + amount),
                users::updated_at.eq(diesel::dsl::now),
            ))
            .returning(users::credits)
            .get_result::<i32>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    pub fn update_admin_fields(
        conn: &mut PgConnection,
        id: Uuid,
        changes: &UserAdminUpdate,
    ) -> Result<User, UserError> {
        diesel::update(users::table.filter(users::id.eq(id)))
            .set((changes, users::updated_at.eq(diesel::dsl::now)))
            .get_result::<User>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    pub fn update_subscription(
        conn: &mut PgConnection,
        id: Uuid,
        changes: &SubscriptionUpdate,
    ) -> Result<User, UserError> {
        diesel::update(users::table.filter(users::id.eq(id)))
            .set((changes, users::updated_at.eq(diesel::dsl::now)))
            .get_result::<User>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    pub fn delete_by_clerk_id(conn: &mut PgConnection, clerk_id: &str) -> Result<(), UserError> {
        let rows = diesel::delete(users::table.filter(users::clerk_id.eq(clerk_id)))
            .execute(conn)
            .map_err(UserError::DatabaseError)?;

        if rows == 0 {
            Err(UserError::NotFound)
        } else {
            Ok(())
        }
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub clerk_id: String,
    pub email: String,
    pub credits: i32,
    pub is_admin: bool,
}

impl NewUser {
    pub fn new(clerk_id: String, email: String, credits: i32) -> Self {
        Self {
            clerk_id,
            email,
            credits,
            is_admin: false,
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> Result<User, UserError> {
        diesel::insert_into(users::table)
            .values(self)
            .get_result::<User>(conn)
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    ref info,
                ) if info.constraint_name() == Some("users_clerk_id_key") => {
                    UserError::AlreadyExists
                }
                _ => UserError::DatabaseError(e),
            })
    }
}

/// Fields an admin may edit. `None` leaves the column untouched.
#[derive(AsChangeset, Deserialize, Debug, Clone, Default)]
#[diesel(table_name = users)]
pub struct UserAdminUpdate {
    pub credits: Option<i32>,
    pub is_admin: Option<bool>,
    pub has_unlimited_credits: Option<bool>,
}

impl UserAdminUpdate {
    pub fn is_empty(&self) -> bool {
        self.credits.is_none() && self.is_admin.is_none() && self.has_unlimited_credits.is_none()
    }
}

#[derive(AsChangeset, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_null = true)]
pub struct SubscriptionUpdate {
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_current_period_end: Option<DateTime<Utc>>,
    pub subscription_plan: Option<String>,
}
