use crate::billing::{BillingError, StripeBilling};
use crate::clerk::{ClerkError, ClerkVerifier};
use crate::config::{AppConfig, ConfigError};
use crate::db::{setup_db, DBConnection, DBError};
use crate::encrypt::{EncryptError, KeyCipher};
use crate::providers::{ProviderError, ProviderRouter};
use crate::rate_limit::RateLimiter;
use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    Json,
};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod billing;
mod clerk;
mod config;
mod credits;
mod db;
mod encrypt;
mod masking;
mod models;
mod providers;
mod rate_limit;
#[cfg(test)]
mod test_support;
mod tokens;
mod web;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid JWT")]
    InvalidJwt,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Internal server error")]
    InternalServerError,

    #[error("Bad Request")]
    BadRequest,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Validation failed")]
    ValidationFailed(Value),

    #[error("Encryption error")]
    EncryptionError,

    #[error("User not found")]
    UserNotFound,

    #[error("Resource not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("Insufficient credits")]
    InsufficientCredits,

    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    #[error("Billing is not configured")]
    BillingNotConfigured,

    #[error("{0}")]
    ProviderError(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    status: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::InvalidJwt => StatusCode::UNAUTHORIZED,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidWebhookSignature => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::EncryptionError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ProviderError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            ApiError::BillingNotConfigured => StatusCode::BAD_REQUEST,
            ApiError::UserNotFound => StatusCode::NOT_FOUND,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        let message = self.to_string();
        let retry_after = match self {
            ApiError::RateLimited { retry_after_secs } => Some(retry_after_secs),
            _ => None,
        };
        let details = match self {
            ApiError::ValidationFailed(details) => Some(details),
            _ => None,
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                status: status.as_u16(),
                message,
                details,
            }),
        )
            .into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<DBError> for ApiError {
    fn from(err: DBError) -> Self {
        match err {
            DBError::UserNotFound => ApiError::UserNotFound,
            DBError::UserAlreadyExists => ApiError::Conflict("User already exists".to_string()),
            DBError::GenerationAlreadyFinished => {
                ApiError::Conflict("Generation already finished".to_string())
            }
            DBError::GenerationNotFound
            | DBError::ChatNotFound
            | DBError::PurchaseNotFound
            | DBError::ApiKeyNotFound
            | DBError::ProviderKeyNotFound => ApiError::NotFound,
            e => {
                error!("Database error: {:?}", e);
                ApiError::InternalServerError
            }
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::UnknownProvider(_)
            | ProviderError::NotConfigured(_)
            | ProviderError::Unsupported { .. } => ApiError::InvalidRequest(err.to_string()),
            e => {
                error!("Provider error: {:?}", e);
                ApiError::ProviderError(e.to_string())
            }
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::PriceNotConfigured(_) => ApiError::InvalidRequest(err.to_string()),
            BillingError::MissingSignature
            | BillingError::StaleTimestamp
            | BillingError::InvalidSignature => {
                warn!("Rejected Stripe webhook: {}", err);
                ApiError::InvalidRequest("Invalid webhook signature".to_string())
            }
            BillingError::InvalidPayload(ref msg) => {
                warn!("Invalid Stripe payload: {}", msg);
                ApiError::BadRequest
            }
            e => {
                error!("Stripe error: {:?}", e);
                ApiError::InternalServerError
            }
        }
    }
}

impl From<ClerkError> for ApiError {
    fn from(err: ClerkError) -> Self {
        match err {
            ClerkError::InvalidToken | ClerkError::UnauthorizedParty(_) => ApiError::InvalidJwt,
            ClerkError::MissingHeader(_)
            | ClerkError::StaleTimestamp
            | ClerkError::InvalidSignature => ApiError::InvalidWebhookSignature,
            e => {
                error!("Clerk error: {:?}", e);
                ApiError::InternalServerError
            }
        }
    }
}

impl From<EncryptError> for ApiError {
    fn from(err: EncryptError) -> Self {
        error!("Encryption error: {:?}", err);
        ApiError::EncryptionError
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::ValidationFailed(serde_json::to_value(&errors).unwrap_or(Value::Null))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] DBError),
    #[error("Provider setup error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Clerk setup error: {0}")]
    Clerk(#[from] ClerkError),
    #[error("Encryption setup error: {0}")]
    Encryption(#[from] EncryptError),
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<dyn DBConnection + Send + Sync>,
    pub provider_router: ProviderRouter,
    pub clerk: ClerkVerifier,
    pub billing: Option<StripeBilling>,
    pub rate_limiter: RateLimiter,
    pub key_cipher: KeyCipher,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Arc<dyn DBConnection + Send + Sync>,
    ) -> Result<Self, Error> {
        let provider_router = ProviderRouter::from_config(&config.providers)?;
        let clerk = ClerkVerifier::new(
            &config.clerk_jwt_key,
            config.clerk_authorized_parties.clone(),
            config.clerk_webhook_secret.as_deref(),
        )?;
        let billing = config.stripe.clone().map(StripeBilling::new);
        if billing.is_none() {
            warn!("STRIPE_SECRET_KEY not set, billing routes are disabled");
        }
        let rate_limiter = RateLimiter::new(config.rate_limit, config.rate_limit_window);
        let key_cipher = KeyCipher::from_hex(&config.encryption_key)?;

        Ok(Self {
            config,
            db,
            provider_router,
            clerk,
            billing,
            rate_limiter,
            key_cipher,
        })
    }

    pub fn billing(&self) -> Result<&StripeBilling, ApiError> {
        self.billing.as_ref().ok_or(ApiError::BillingNotConfigured)
    }

    /// Admins are flagged in the database or listed in `ADMIN_EMAILS`.
    pub fn is_admin(&self, user: &models::users::User) -> bool {
        user.is_admin
            || self
                .config
                .admin_emails
                .iter()
                .any(|email| email.eq_ignore_ascii_case(&user.email))
    }
}

fn cors_layer(app_url: &str) -> CorsLayer {
    let origin = match HeaderValue::from_str(app_url.trim_end_matches('/')) {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(_) => {
            warn!("APP_URL is not a valid origin, allowing any origin");
            AllowOrigin::any()
        }
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!("Starting AxIom API with {:?}", config);

    let db = setup_db(&config.database_url)?;
    let port = config.port;
    let cors = cors_layer(&config.app_url);
    let app_state = Arc::new(AppState::new(config, db)?);

    let app = web::router(app_state).layer(cors);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await?;

    Ok(())
}
