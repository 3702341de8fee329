use crate::credits::{run_generation, GenerationJob, GenerationWork};
use crate::models::generations::{Generation, GenerationType};
use crate::models::users::User;
use crate::providers::{
    CompletionRequest, ImageRequest, ProviderKind, DEFAULT_IMAGE_SIZE,
};
use crate::rate_limit::rate_limit;
use crate::web::JsonBody;
use crate::web::auth::require_user;
use crate::{ApiError, AppState};
use axum::{
    extract::State, middleware::from_fn_with_state, routing::post, Extension, Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

pub const DEFAULT_PROVIDER: ProviderKind = ProviderKind::OpenAi;
const DEFAULT_LANGUAGE: &str = "javascript";
const IMAGE_SIZES: [&str; 5] = ["256x256", "512x512", "1024x1024", "1792x1024", "1024x1792"];

const WEBSITE_SYSTEM_PROMPT: &str = "You are an expert web developer. Produce one complete, \
self-contained HTML document with inline CSS and JavaScript that fulfils the request. \
Respond with the HTML document only.";

lazy_static! {
    static ref FENCED_HTML: Regex =
        Regex::new(r"(?s)```(?:html|HTML)?[ \t]*\r?\n(.*?)```").expect("valid regex");
    static ref HTML_DOCUMENT: Regex =
        Regex::new(r"(?is)(<!DOCTYPE html.*</html>|<html.*</html>)").expect("valid regex");
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GenerateRequest {
    #[validate(length(min = 1, max = 10000))]
    pub prompt: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    #[validate(range(min = 1, max = 8192))]
    pub max_tokens: Option<u32>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    /// Code generation only.
    #[validate(length(min = 1, max = 50))]
    pub language: Option<String>,
    /// Image generation only.
    pub size: Option<String>,
}

impl GenerateRequest {
    fn provider(&self) -> Result<ProviderKind, ApiError> {
        match self.provider.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(p) => Ok(p.parse::<ProviderKind>()?),
            None => Ok(DEFAULT_PROVIDER),
        }
    }

    fn completion(&self, system: Option<&str>) -> CompletionRequest {
        CompletionRequest::from_prompt(&self.prompt, system)
            .with_model(self.model.clone())
            .with_limits(self.max_tokens, self.temperature)
    }
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/api/generate/text", post(generate_text))
        .route("/api/generate/code", post(generate_code))
        .route("/api/generate/image", post(generate_image))
        .route("/api/generate/website", post(generate_website))
        .route_layer(from_fn_with_state(app_state.clone(), rate_limit))
        .route_layer(from_fn_with_state(app_state.clone(), require_user))
        .with_state(app_state)
}

async fn generate_text(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    JsonBody(body): JsonBody<GenerateRequest>,
) -> Result<Json<Generation>, ApiError> {
    debug!("Entering generate_text for user {}", user.id);
    body.validate()?;

    let job = GenerationJob {
        generation_type: GenerationType::Text,
        prompt: body.prompt.clone(),
        provider: body.provider()?,
        work: GenerationWork::Completion(body.completion(None)),
        metadata: None,
        postprocess: None,
    };
    let generation = run_generation(&state, &user, job).await?;
    debug!("Exiting generate_text");
    Ok(Json(generation))
}

async fn generate_code(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    JsonBody(body): JsonBody<GenerateRequest>,
) -> Result<Json<Generation>, ApiError> {
    debug!("Entering generate_code for user {}", user.id);
    body.validate()?;

    let language = body.language.as_deref().unwrap_or(DEFAULT_LANGUAGE);
    let system = code_system_prompt(language);
    let job = GenerationJob {
        generation_type: GenerationType::Code,
        prompt: body.prompt.clone(),
        provider: body.provider()?,
        work: GenerationWork::Completion(body.completion(Some(&system))),
        metadata: Some(json!({ "language": language })),
        postprocess: None,
    };
    let generation = run_generation(&state, &user, job).await?;
    debug!("Exiting generate_code");
    Ok(Json(generation))
}

async fn generate_image(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    JsonBody(body): JsonBody<GenerateRequest>,
) -> Result<Json<Generation>, ApiError> {
    debug!("Entering generate_image for user {}", user.id);
    body.validate()?;

    let size = body.size.as_deref().unwrap_or(DEFAULT_IMAGE_SIZE);
    if !IMAGE_SIZES.contains(&size) {
        return Err(ApiError::InvalidRequest(format!(
            "Unsupported image size {}, expected one of {}",
            size,
            IMAGE_SIZES.join(", ")
        )));
    }

    let job = GenerationJob {
        generation_type: GenerationType::Image,
        prompt: body.prompt.clone(),
        provider: body.provider()?,
        work: GenerationWork::Image(ImageRequest {
            prompt: body.prompt.clone(),
            model: body.model.clone(),
            size: size.to_string(),
        }),
        metadata: Some(json!({ "size": size })),
        postprocess: None,
    };
    let generation = run_generation(&state, &user, job).await?;
    debug!("Exiting generate_image");
    Ok(Json(generation))
}

async fn generate_website(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    JsonBody(body): JsonBody<GenerateRequest>,
) -> Result<Json<Generation>, ApiError> {
    debug!("Entering generate_website for user {}", user.id);
    body.validate()?;

    let job = GenerationJob {
        generation_type: GenerationType::Website,
        prompt: body.prompt.clone(),
        provider: body.provider()?,
        work: GenerationWork::Completion(body.completion(Some(WEBSITE_SYSTEM_PROMPT))),
        metadata: None,
        postprocess: Some(extract_html),
    };
    let generation = run_generation(&state, &user, job).await?;
    debug!("Exiting generate_website");
    Ok(Json(generation))
}

fn code_system_prompt(language: &str) -> String {
    format!(
        "You are an expert {} developer. Answer with well structured, commented code \
         in a single fenced code block, followed by a short explanation.",
        language
    )
}

/// Pulls the HTML document out of a model reply that may wrap it in a
/// markdown fence or surround it with prose.
pub(crate) fn extract_html(content: &str) -> String {
    if let Some(fenced) = FENCED_HTML.captures(content).and_then(|c| c.get(1)) {
        return fenced.as_str().trim().to_string();
    }
    if let Some(document) = HTML_DOCUMENT.find(content) {
        return document.as_str().trim().to_string();
    }
    content.trim().to_string()
}
