use crate::providers::{ProviderKind, ProviderSettings};
use std::time::Duration;
use url::Url;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_FREE_CREDITS: i32 = 10;
const DEFAULT_RETRY_BUDGET_SECS: u64 = 10;
const DEFAULT_RATE_LIMIT: u32 = 20;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const STRIPE_API_BASE: &str = "https://api.stripe.com";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub basic_price_id: Option<String>,
    pub pro_price_id: Option<String>,
    pub enterprise_price_id: Option<String>,
}

impl std::fmt::Debug for StripeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeSettings")
            .field("secret_key", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("basic_price_id", &self.basic_price_id)
            .field("pro_price_id", &self.pro_price_id)
            .field("enterprise_price_id", &self.enterprise_price_id)
            .finish()
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub app_url: String,
    pub encryption_key: String,
    pub clerk_jwt_key: String,
    pub clerk_webhook_secret: Option<String>,
    pub clerk_authorized_parties: Vec<String>,
    pub admin_emails: Vec<String>,
    pub free_credits: i32,
    pub rate_limit: u32,
    pub rate_limit_window: Duration,
    pub stripe: Option<StripeSettings>,
    pub providers: ProviderSettings,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field("app_url", &self.app_url)
            .field("clerk_authorized_parties", &self.clerk_authorized_parties)
            .field("admin_emails", &self.admin_emails)
            .field("free_credits", &self.free_credits)
            .field("rate_limit", &self.rate_limit)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("stripe", &self.stripe)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source; blank values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let database_url = require("DATABASE_URL")?;
        let encryption_key = require("ENCRYPTION_KEY")?;
        if hex::decode(encryption_key.trim()).map(|k| k.len()) != Ok(32) {
            return Err(ConfigError::Invalid {
                name: "ENCRYPTION_KEY",
                reason: "expected 64 hex characters".to_string(),
            });
        }
        let clerk_jwt_key = require("CLERK_JWT_KEY")?.replace("\\n", "\n");

        let port = parse_or("PORT", get("PORT"), DEFAULT_PORT)?;
        let free_credits = parse_or("FREE_CREDITS", get("FREE_CREDITS"), DEFAULT_FREE_CREDITS)?;
        let rate_limit = parse_or("RATE_LIMIT_REQUESTS", get("RATE_LIMIT_REQUESTS"), DEFAULT_RATE_LIMIT)?;
        let rate_limit_window = Duration::from_secs(parse_or(
            "RATE_LIMIT_WINDOW_SECS",
            get("RATE_LIMIT_WINDOW_SECS"),
            DEFAULT_RATE_LIMIT_WINDOW_SECS,
        )?);
        let retry_budget = Duration::from_secs(parse_or(
            "PROVIDER_RETRY_BUDGET_SECS",
            get("PROVIDER_RETRY_BUDGET_SECS"),
            DEFAULT_RETRY_BUDGET_SECS,
        )?);

        let stripe = match get("STRIPE_SECRET_KEY") {
            Some(secret_key) => Some(StripeSettings {
                secret_key,
                webhook_secret: require("STRIPE_WEBHOOK_SECRET")?,
                api_base: match get("STRIPE_API_BASE") {
                    Some(base) => http_url("STRIPE_API_BASE", &base)?,
                    None => STRIPE_API_BASE.to_string(),
                },
                basic_price_id: get("STRIPE_BASIC_PRICE_ID"),
                pro_price_id: get("STRIPE_PRO_PRICE_ID"),
                enterprise_price_id: get("STRIPE_ENTERPRISE_PRICE_ID"),
            }),
            None => None,
        };

        let mut providers = ProviderSettings {
            retry_budget,
            ..Default::default()
        };
        for kind in ProviderKind::ALL {
            if let Some(key) = get(kind.api_key_env()) {
                providers.api_keys.insert(kind, key);
            }
            if let Some(base_url) = get(kind.base_url_env()) {
                providers
                    .base_urls
                    .insert(kind, http_url(kind.base_url_env(), &base_url)?);
            }
            if let Some(model) = get(kind.model_env()) {
                providers.models.insert(kind, model.trim().to_string());
            }
            if let Some(model) = kind.image_model_env().and_then(&get) {
                providers.image_models.insert(kind, model.trim().to_string());
            }
        }

        let app_url = match get("APP_URL") {
            Some(url) => http_url("APP_URL", &url)?,
            None => format!("http://localhost:{}", port),
        };

        Ok(Self {
            database_url,
            port,
            app_url,
            encryption_key,
            clerk_jwt_key,
            clerk_webhook_secret: get("CLERK_WEBHOOK_SECRET"),
            clerk_authorized_parties: split_list(get("CLERK_AUTHORIZED_PARTIES")),
            admin_emails: split_list(get("ADMIN_EMAILS"))
                .into_iter()
                .map(|e| e.to_lowercase())
                .collect(),
            free_credits,
            rate_limit,
            rate_limit_window,
            stripe,
            providers,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("could not parse '{}'", v),
        }),
        None => Ok(default),
    }
}

/// Accepts only absolute http(s) URLs and drops any trailing slash.
fn http_url(name: &'static str, value: &str) -> Result<String, ConfigError> {
    let parsed = Url::parse(value.trim()).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || !parsed.has_host() {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("'{}' is not an http(s) URL", value),
        });
    }
    Ok(value.trim().trim_end_matches('/').to_string())
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
