//! Credit ledger and generation lifecycle.
//!
//! Credits are taken with a conditional UPDATE before any row is written,
//! so a balance can never go negative. Every failure after the deduction
//! gives the credits back.

use crate::models::generations::{
    Generation, GenerationOutput, GenerationStatus, GenerationType, NewGeneration,
};
use crate::models::users::User;
use crate::providers::{CompletionRequest, ImageRequest, ProviderKind, ProviderRouter};
use crate::{ApiError, AppState};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CHAT_MESSAGE_COST: i32 = 1;

pub fn credit_cost(generation_type: GenerationType) -> i32 {
    match generation_type {
        GenerationType::Text => 1,
        GenerationType::Code => 2,
        GenerationType::Website => 3,
        GenerationType::Image => 5,
    }
}

pub fn has_credits(user: &User, cost: i32) -> bool {
    user.has_unlimited_credits || user.credits >= cost
}

/// What unlimited users are charged: nothing.
pub fn charge_for(user: &User, cost: i32) -> i32 {
    if user.has_unlimited_credits {
        0
    } else {
        cost
    }
}

/// Takes `amount` credits or fails with 402. Returns the remaining balance,
/// `None` when nothing was charged.
pub fn deduct(state: &AppState, user_id: Uuid, amount: i32) -> Result<Option<i32>, ApiError> {
    if amount <= 0 {
        return Ok(None);
    }
    match state.db.try_deduct_credits(user_id, amount)? {
        Some(balance) => {
            debug!("Charged {} credits to {}, balance {}", amount, user_id, balance);
            Ok(Some(balance))
        }
        None => {
            info!("User {} has insufficient credits for {}", user_id, amount);
            Err(ApiError::InsufficientCredits)
        }
    }
}

pub fn refund(state: &AppState, user_id: Uuid, amount: i32) {
    if amount <= 0 {
        return;
    }
    match state.db.add_credits(user_id, amount) {
        Ok(balance) => info!("Refunded {} credits to {}, balance {}", amount, user_id, balance),
        Err(e) => error!("Failed to refund {} credits to {}: {:?}", amount, user_id, e),
    }
}

/// Picks the credential for a provider call: the user's own key, then the
/// active admin key. `None` lets the router fall back to the environment.
pub fn resolve_api_key(
    state: &AppState,
    user_id: Uuid,
    kind: ProviderKind,
) -> Result<Option<String>, ApiError> {
    if let Some(key) = state.db.get_user_api_key(user_id, kind.as_str())? {
        debug!("Using stored {} key of user {}", kind, user_id);
        return Ok(Some(state.key_cipher.decrypt_string(&key.key_enc)?));
    }
    if let Some(key) = state.db.get_active_provider_key(kind.as_str())? {
        debug!("Using admin {} key", kind);
        return Ok(Some(state.key_cipher.decrypt_string(&key.key_enc)?));
    }
    Ok(None)
}

#[derive(Debug, Clone)]
pub enum GenerationWork {
    Completion(CompletionRequest),
    Image(ImageRequest),
}

#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub generation_type: GenerationType,
    pub prompt: String,
    pub provider: ProviderKind,
    pub work: GenerationWork,
    pub metadata: Option<Value>,
    /// Applied to completion text before it is stored.
    pub postprocess: Option<fn(&str) -> String>,
}

impl GenerationJob {
    fn model(&self, router: &ProviderRouter) -> String {
        match &self.work {
            GenerationWork::Completion(req) => req
                .model
                .clone()
                .unwrap_or_else(|| router.default_model(self.provider)),
            GenerationWork::Image(req) => req
                .model
                .clone()
                .or_else(|| router.default_image_model(self.provider))
                .unwrap_or_else(|| router.default_model(self.provider)),
        }
    }
}

/// Deducts credits, records a PROCESSING generation, calls the provider and
/// finishes the record as COMPLETED or FAILED. Failures refund the charge.
pub async fn run_generation(
    state: &AppState,
    user: &User,
    job: GenerationJob,
) -> Result<Generation, ApiError> {
    let cost = credit_cost(job.generation_type);
    if !has_credits(user, cost) {
        return Err(ApiError::InsufficientCredits);
    }

    if let GenerationWork::Image(_) = job.work {
        if !job.provider.supports_images() {
            return Err(ApiError::InvalidRequest(format!(
                "{} does not support image generation",
                job.provider
            )));
        }
    }

    let api_key = resolve_api_key(state, user.id, job.provider)?;
    if api_key.is_none() && !state.provider_router.is_configured(job.provider) {
        return Err(ApiError::InvalidRequest(format!(
            "Provider {} is not configured",
            job.provider
        )));
    }

    let charged = charge_for(user, cost);
    deduct(state, user.id, charged)?;

    let new_generation = NewGeneration {
        user_id: user.id,
        generation_type: job.generation_type,
        prompt: job.prompt.clone(),
        status: GenerationStatus::Processing,
        credits_used: charged,
        provider: job.provider.as_str().to_string(),
        model: job.model(&state.provider_router),
        metadata: job.metadata.clone(),
    };
    let generation = match state.db.create_generation(new_generation) {
        Ok(generation) => generation,
        Err(e) => {
            error!("Failed to record generation for {}: {:?}", user.id, e);
            refund(state, user.id, charged);
            return Err(e.into());
        }
    };
    info!(
        "Generation {} ({:?}) started via {} for user {}",
        generation.id, job.generation_type, job.provider, user.id
    );

    let outcome = match &job.work {
        GenerationWork::Completion(request) => state
            .provider_router
            .complete(job.provider, api_key.as_deref(), request)
            .await
            .map(|completion| GenerationOutput {
                content: Some(match job.postprocess {
                    Some(f) => f(&completion.content),
                    None => completion.content,
                }),
                image_url: None,
                tokens: completion.tokens,
                cost: completion.cost,
                model: completion.model,
            }),
        GenerationWork::Image(request) => state
            .provider_router
            .generate_image(job.provider, api_key.as_deref(), request)
            .await
            .map(|image| GenerationOutput {
                content: None,
                image_url: Some(image.url),
                tokens: 0,
                cost: image.cost,
                model: image.model,
            }),
    };

    let output = match outcome {
        Ok(output) => output,
        Err(e) => {
            warn!("Generation {} failed: {}", generation.id, e);
            abandon(state, &generation, &e.to_string(), charged);
            return Err(e.into());
        }
    };

    match state.db.complete_generation(generation.id, &output) {
        Ok(generation) => {
            info!(
                "Generation {} completed: {} tokens, ${:.6}",
                generation.id, generation.tokens, generation.cost
            );
            Ok(generation)
        }
        Err(e) => {
            error!("Failed to store output of generation {}: {:?}", generation.id, e);
            abandon(state, &generation, "Failed to store generation output", charged);
            Err(e.into())
        }
    }
}

/// Marks a PROCESSING generation as FAILED and gives back what was charged.
fn abandon(state: &AppState, generation: &Generation, reason: &str, charged: i32) {
    if let Err(db_err) = state.db.fail_generation(generation.id, reason) {
        error!(
            "Failed to mark generation {} as failed: {:?}",
            generation.id, db_err
        );
    }
    refund(state, generation.user_id, charged);
}
