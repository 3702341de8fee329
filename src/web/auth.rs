use crate::clerk::SessionClaims;
use crate::db::DBError;
use crate::models::users::{NewUser, User};
use crate::{ApiError, AppState};
use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Verifies the Clerk session token and puts the `User` into the request
/// extensions, creating the user on first sight.
pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
    {
        Some(token) => token.trim().to_string(),
        None => return ApiError::Unauthorized.into_response(),
    };

    let claims = match state.clerk.verify_session(&token) {
        Ok(claims) => claims,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let user = match load_or_create_user(&state, &claims) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };

    req.extensions_mut().insert(user);
    next.run(req).await
}

pub(crate) fn load_or_create_user(
    state: &AppState,
    claims: &SessionClaims,
) -> Result<User, ApiError> {
    if let Some(user) = state.db.get_user_by_clerk_id(&claims.sub)? {
        return Ok(user);
    }

    let email = claims.email.clone().unwrap_or_default();
    let new_user = NewUser {
        is_admin: is_admin_email(state, &email),
        ..NewUser::new(claims.sub.clone(), email, state.config.free_credits)
    };

    match state.db.create_user(new_user) {
        Ok(user) => {
            info!("Created user {} for clerk id {}", user.id, user.clerk_id);
            Ok(user)
        }
        // Lost a race with another request or the webhook.
        Err(DBError::UserAlreadyExists) => {
            debug!("User {} created concurrently", claims.sub);
            state
                .db
                .get_user_by_clerk_id(&claims.sub)?
                .ok_or(ApiError::UserNotFound)
        }
        Err(e) => {
            error!("Failed to create user {}: {:?}", claims.sub, e);
            Err(e.into())
        }
    }
}

pub(crate) fn is_admin_email(state: &AppState, email: &str) -> bool {
    !email.is_empty()
        && state
            .config
            .admin_emails
            .iter()
            .any(|admin| admin.eq_ignore_ascii_case(email))
}

/// Runs after `require_user`.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match req.extensions().get::<User>() {
        Some(user) if state.is_admin(user) => next.run(req).await,
        Some(user) => {
            info!("User {} denied admin access", user.id);
            ApiError::Forbidden.into_response()
        }
        None => ApiError::Unauthorized.into_response(),
    }
}
