//! Fixed-window request limiter keyed by user id.

use crate::models::users::User;
use crate::{ApiError, AppState};
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};
use uuid::Uuid;

const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<Uuid, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, key: Uuid) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub(crate) fn check_at(&self, key: Uuid, now: Instant) -> RateDecision {
        if self.windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            self.windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        // The entry guard holds the shard lock, so the read-modify-write is atomic per user.
        let mut entry = self.windows.entry(key).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= self.limit {
            let elapsed = now.duration_since(entry.started);
            return RateDecision::Limited {
                retry_after: self.window.saturating_sub(elapsed),
            };
        }

        entry.count += 1;
        RateDecision::Allowed {
            remaining: self.limit - entry.count,
        }
    }
}

/// Applies the limiter to an authenticated route. Must run after the
/// Clerk middleware so the user is in the request extensions.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let user_id = match req.extensions().get::<User>() {
        Some(user) => user.id,
        None => {
            error!("Rate limiter ran without an authenticated user");
            return ApiError::Unauthorized.into_response();
        }
    };

    match state.rate_limiter.check(user_id) {
        RateDecision::Allowed { .. } => next.run(req).await,
        RateDecision::Limited { retry_after } => {
            warn!("Rate limit exceeded for user {}", user_id);
            ApiError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            }
            .into_response()
        }
    }
}
