//! Multi-provider AI facade.
//!
//! Every provider is reached through one of four wire dialects. The router
//! resolves credentials and models, retries transient failures and
//! normalizes the result to a [`Completion`] or [`ImageOutput`].

pub mod cohere;
pub mod gemini;
pub mod huggingface;
pub mod openai_compat;

use crate::tokens::{count_tokens, estimate_cost, image_cost};
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const HUGGINGFACE_TIMEOUT: Duration = Duration::from_secs(30);
const GITHUB_MODELS_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Groq,
    Gemini,
    Cohere,
    HuggingFace,
    Grok,
    DeepSeek,
    GitHub,
}

/// Request/response shape spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAiCompatible,
    Gemini,
    Cohere,
    HuggingFace,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::OpenAi,
        ProviderKind::Groq,
        ProviderKind::Gemini,
        ProviderKind::Cohere,
        ProviderKind::HuggingFace,
        ProviderKind::Grok,
        ProviderKind::DeepSeek,
        ProviderKind::GitHub,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Groq => "groq",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Cohere => "cohere",
            ProviderKind::HuggingFace => "huggingface",
            ProviderKind::Grok => "grok",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::GitHub => "github",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Groq => "Groq",
            ProviderKind::Gemini => "Google Gemini",
            ProviderKind::Cohere => "Cohere",
            ProviderKind::HuggingFace => "HuggingFace",
            ProviderKind::Grok => "xAI Grok",
            ProviderKind::DeepSeek => "DeepSeek",
            ProviderKind::GitHub => "GitHub Models",
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            ProviderKind::Gemini => Dialect::Gemini,
            ProviderKind::Cohere => Dialect::Cohere,
            ProviderKind::HuggingFace => Dialect::HuggingFace,
            _ => Dialect::OpenAiCompatible,
        }
    }

    /// Environment variable holding the service-wide credential.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Groq => "GROQ_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Cohere => "COHERE_API_KEY",
            ProviderKind::HuggingFace => "HUGGINGFACE_API_KEY",
            ProviderKind::Grok => "GROK_API_KEY",
            ProviderKind::DeepSeek => "DEEPSEEK_API_KEY",
            ProviderKind::GitHub => "GITHUB_TOKEN",
        }
    }

    pub fn base_url_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_BASE_URL",
            ProviderKind::Groq => "GROQ_BASE_URL",
            ProviderKind::Gemini => "GEMINI_BASE_URL",
            ProviderKind::Cohere => "COHERE_BASE_URL",
            ProviderKind::HuggingFace => "HUGGINGFACE_BASE_URL",
            ProviderKind::Grok => "GROK_BASE_URL",
            ProviderKind::DeepSeek => "DEEPSEEK_BASE_URL",
            ProviderKind::GitHub => "GITHUB_MODELS_BASE_URL",
        }
    }

    pub fn model_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_MODEL",
            ProviderKind::Groq => "GROQ_MODEL",
            ProviderKind::Gemini => "GEMINI_MODEL",
            ProviderKind::Cohere => "COHERE_MODEL",
            ProviderKind::HuggingFace => "HUGGINGFACE_MODEL",
            ProviderKind::Grok => "GROK_MODEL",
            ProviderKind::DeepSeek => "DEEPSEEK_MODEL",
            ProviderKind::GitHub => "GITHUB_MODEL",
        }
    }

    /// Only providers that can generate images take an image model override.
    pub fn image_model_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_IMAGE_MODEL"),
            ProviderKind::HuggingFace => Some("HUGGINGFACE_IMAGE_MODEL"),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Cohere => "https://api.cohere.ai/v1",
            ProviderKind::HuggingFace => "https://api-inference.huggingface.co",
            ProviderKind::Grok => "https://api.x.ai/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::GitHub => "https://models.inference.ai.azure.com",
        }
    }

    pub fn models(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::OpenAi => &["gpt-4o-mini", "gpt-4o", "gpt-4-turbo", "gpt-3.5-turbo"],
            ProviderKind::Groq => &[
                "llama-3.3-70b-versatile",
                "llama-3.1-8b-instant",
                "mixtral-8x7b-32768",
            ],
            ProviderKind::Gemini => &["gemini-1.5-flash", "gemini-1.5-pro"],
            ProviderKind::Cohere => &["command-r", "command-r-plus"],
            ProviderKind::HuggingFace => &[
                "mistralai/Mistral-7B-Instruct-v0.2",
                "meta-llama/Meta-Llama-3-8B-Instruct",
            ],
            ProviderKind::Grok => &["grok-beta", "grok-2-latest"],
            ProviderKind::DeepSeek => &["deepseek-chat", "deepseek-coder"],
            ProviderKind::GitHub => &["gpt-4o-mini", "gpt-4o", "Meta-Llama-3.1-70B-Instruct"],
        }
    }

    pub fn default_model(&self) -> &'static str {
        self.models()[0]
    }

    pub fn image_models(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::OpenAi => &["dall-e-3", "dall-e-2"],
            ProviderKind::HuggingFace => &["stabilityai/stable-diffusion-xl-base-1.0"],
            _ => &[],
        }
    }

    pub fn supports_images(&self) -> bool {
        !self.image_models().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        match self {
            ProviderKind::HuggingFace => HUGGINGFACE_TIMEOUT,
            ProviderKind::GitHub => GITHUB_MODELS_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "groq" => Ok(ProviderKind::Groq),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "cohere" => Ok(ProviderKind::Cohere),
            "huggingface" | "hf" => Ok(ProviderKind::HuggingFace),
            "grok" | "xai" => Ok(ProviderKind::Grok),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "github" | "github-models" => Ok(ProviderKind::GitHub),
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider {0} is not configured")]
    NotConfigured(ProviderKind),

    #[error("Provider {provider} does not support {capability}")]
    Unsupported {
        provider: ProviderKind,
        capability: &'static str,
    },

    #[error("Request to provider timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("{status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(err)
        }
    }
}

impl ProviderError {
    /// Failures worth another attempt: timeouts, connection problems,
    /// rate limiting and upstream 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout => true,
            ProviderError::Http(e) => e.is_connect() || e.is_request(),
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// One message of a conversation sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatTurn>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

impl CompletionRequest {
    pub fn from_prompt(prompt: &str, system: Option<&str>) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatTurn::new("system", system));
        }
        messages.push(ChatTurn::new("user", prompt));
        Self {
            messages,
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_limits(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        if let Some(max_tokens) = max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(temperature) = temperature {
            self.temperature = temperature;
        }
        self
    }

    pub(crate) fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    pub(crate) fn conversation(&self) -> impl Iterator<Item = &ChatTurn> {
        self.messages.iter().filter(|m| m.role != "system")
    }

    fn input_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Normalized text result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub content: String,
    pub tokens: i32,
    pub cost: f64,
    pub model: String,
    pub provider: ProviderKind,
}

/// What a dialect hands back before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCompletion {
    pub content: String,
    pub total_tokens: Option<i32>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub size: String,
}

pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageOutput {
    pub url: String,
    pub model: String,
    pub provider: ProviderKind,
    pub cost: f64,
}

#[derive(Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub default_model: String,
    pub default_image_model: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .field("default_model", &self.default_model)
            .field("default_image_model", &self.default_image_model)
            .finish()
    }
}

impl ProviderConfig {
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Per-provider settings read from the environment.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    pub api_keys: HashMap<ProviderKind, String>,
    pub base_urls: HashMap<ProviderKind, String>,
    /// Overrides of the built-in default text model.
    pub models: HashMap<ProviderKind, String>,
    pub image_models: HashMap<ProviderKind, String>,
    pub retry_budget: Duration,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let configured: Vec<&str> = self.api_keys.keys().map(|k| k.as_str()).collect();
        f.debug_struct("ProviderSettings")
            .field("configured", &configured)
            .field("base_urls", &self.base_urls)
            .field("models", &self.models)
            .field("image_models", &self.image_models)
            .field("retry_budget", &self.retry_budget)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: ProviderKind,
    pub name: &'static str,
    pub configured: bool,
    pub default_model: String,
    pub models: &'static [&'static str],
    pub image_models: &'static [&'static str],
}

/// Routing table of provider kind → configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct ProviderRouter {
    client: reqwest::Client,
    providers: HashMap<ProviderKind, ProviderConfig>,
    retry_budget: Duration,
}

impl ProviderRouter {
    pub fn from_config(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(20)
            .user_agent("axiom/provider-client")
            .build()?;

        let providers = ProviderKind::ALL
            .iter()
            .map(|kind| {
                let config = ProviderConfig {
                    kind: *kind,
                    base_url: settings
                        .base_urls
                        .get(kind)
                        .cloned()
                        .unwrap_or_else(|| kind.default_base_url().to_string()),
                    api_key: settings.api_keys.get(kind).cloned(),
                    timeout: kind.timeout(),
                    default_model: settings
                        .models
                        .get(kind)
                        .cloned()
                        .unwrap_or_else(|| kind.default_model().to_string()),
                    default_image_model: settings
                        .image_models
                        .get(kind)
                        .cloned()
                        .or_else(|| kind.image_models().first().map(|m| m.to_string())),
                };
                (*kind, config)
            })
            .collect::<HashMap<_, _>>();

        for config in providers.values() {
            if config.api_key.is_some() {
                info!("Provider {} configured at {}", config.kind, config.base_url);
            }
        }

        Ok(Self {
            client,
            providers,
            retry_budget: settings.retry_budget,
        })
    }

    pub fn config(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.get(&kind)
    }

    /// Text model used when a request names none.
    pub fn default_model(&self, kind: ProviderKind) -> String {
        self.config(kind)
            .map(|c| c.default_model.clone())
            .unwrap_or_else(|| kind.default_model().to_string())
    }

    pub fn default_image_model(&self, kind: ProviderKind) -> Option<String> {
        self.config(kind).and_then(|c| c.default_image_model.clone())
    }

    /// Whether a service-wide credential came from the environment.
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.config(kind).is_some_and(|c| c.api_key.is_some())
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        ProviderKind::ALL
            .iter()
            .map(|kind| ProviderInfo {
                id: *kind,
                name: kind.display_name(),
                configured: self.is_configured(*kind),
                default_model: self.default_model(*kind),
                models: kind.models(),
                image_models: kind.image_models(),
            })
            .collect()
    }

    fn resolve<'a>(
        &'a self,
        kind: ProviderKind,
        api_key: Option<&'a str>,
    ) -> Result<(&'a ProviderConfig, &'a str), ProviderError> {
        let config = self
            .config(kind)
            .ok_or(ProviderError::NotConfigured(kind))?;
        let key = api_key
            .or(config.api_key.as_deref())
            .ok_or(ProviderError::NotConfigured(kind))?;
        Ok((config, key))
    }

    /// Sends a text completion to `kind`. `api_key` overrides the
    /// environment credential when the caller holds a stored key.
    pub async fn complete(
        &self,
        kind: ProviderKind,
        api_key: Option<&str>,
        request: &CompletionRequest,
    ) -> Result<Completion, ProviderError> {
        let (config, key) = self.resolve(kind, api_key)?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| config.default_model.clone());
        debug!("Completion via {} with model {}", kind, model);

        let client = &self.client;
        let model_ref = model.as_str();
        let raw = self
            .with_retry(kind, move || {
                dispatch_completion(client, config, key, model_ref, request)
            })
            .await?;

        let tokens = raw.total_tokens.unwrap_or_else(|| {
            let estimated = count_tokens(&request.input_text()) + count_tokens(&raw.content);
            i32::try_from(estimated).unwrap_or(i32::MAX)
        });
        let model = if raw.model.is_empty() { model } else { raw.model };
        let cost = estimate_cost(&model, tokens);

        Ok(Completion {
            content: raw.content,
            tokens,
            cost,
            model,
            provider: kind,
        })
    }

    pub async fn generate_image(
        &self,
        kind: ProviderKind,
        api_key: Option<&str>,
        request: &ImageRequest,
    ) -> Result<ImageOutput, ProviderError> {
        if !kind.supports_images() {
            return Err(ProviderError::Unsupported {
                provider: kind,
                capability: "image generation",
            });
        }
        let (config, key) = self.resolve(kind, api_key)?;
        let model = request
            .model
            .clone()
            .or_else(|| config.default_image_model.clone())
            .ok_or(ProviderError::Unsupported {
                provider: kind,
                capability: "image generation",
            })?;
        debug!("Image generation via {} with model {}", kind, model);

        let client = &self.client;
        let model_ref = model.as_str();
        let url = self
            .with_retry(kind, move || async move {
                match config.kind.dialect() {
                    Dialect::HuggingFace => {
                        huggingface::generate_image(client, config, key, model_ref, request).await
                    }
                    _ => openai_compat::generate_image(client, config, key, model_ref, request).await,
                }
            })
            .await?;

        let cost = image_cost(&model);
        Ok(ImageOutput {
            url,
            model,
            provider: kind,
            cost,
        })
    }

    async fn with_retry<T, F, Fut>(&self, kind: ProviderKind, op: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(RETRY_INITIAL_INTERVAL)
            .with_max_elapsed_time(Some(self.retry_budget))
            .build();

        let op = &op;
        backoff::future::retry(policy, move || async move {
            op().await.map_err(|e| {
                if e.is_transient() {
                    warn!("Transient error from {}: {}", kind, e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }
}

async fn dispatch_completion(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    model: &str,
    request: &CompletionRequest,
) -> Result<RawCompletion, ProviderError> {
    match config.kind.dialect() {
        Dialect::OpenAiCompatible => {
            openai_compat::complete(client, config, api_key, model, request).await
        }
        Dialect::Gemini => gemini::complete(client, config, api_key, model, request).await,
        Dialect::Cohere => cohere::complete(client, config, api_key, model, request).await,
        Dialect::HuggingFace => {
            huggingface::complete(client, config, api_key, model, request).await
        }
    }
}

/// Reads a JSON body, turning non-2xx statuses into `ProviderError::Api`
/// with the provider's own message when it sent one.
pub(crate) async fn read_json(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<Value>().await?);
    }

    let text = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: extract_error_message(&text),
    })
}

pub(crate) fn extract_error_message(body: &str) -> String {
    let parsed = match serde_json::from_str::<Value>(body) {
        Ok(v) => v,
        Err(_) => return body.trim().to_string(),
    };

    let candidates = [
        parsed.pointer("/error/message"),
        parsed.get("error"),
        parsed.get("message"),
        parsed.get("detail"),
    ];
    let message = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(ToOwned::to_owned))
        .unwrap_or_else(|| body.trim().to_string());
    message
}
