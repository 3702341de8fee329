//! HuggingFace serverless inference for text and image models.

use super::{
    extract_error_message, read_json, CompletionRequest, ImageRequest, ProviderConfig,
    ProviderError, RawCompletion,
};
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

// The inference API rejects a temperature of exactly zero.
const MIN_TEMPERATURE: f32 = 0.01;

pub async fn complete(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    model: &str,
    request: &CompletionRequest,
) -> Result<RawCompletion, ProviderError> {
    let body = json!({
        "inputs": render_prompt(request),
        "parameters": {
            "max_new_tokens": request.max_tokens,
            "temperature": request.temperature.max(MIN_TEMPERATURE),
            "return_full_text": false,
        }
    });

    let response = client
        .post(config.endpoint(&format!("models/{}", model)))
        .bearer_auth(api_key)
        .timeout(config.timeout)
        .json(&body)
        .send()
        .await?;

    let json = read_json(response).await?;
    let content = generated_text(&json)
        .ok_or_else(|| ProviderError::InvalidResponse("missing generated_text".into()))?;

    Ok(RawCompletion {
        content: content.trim().to_string(),
        total_tokens: None,
        model: model.to_string(),
    })
}

/// Text-to-image models answer with raw image bytes, returned as a data URL.
pub async fn generate_image(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    model: &str,
    request: &ImageRequest,
) -> Result<String, ProviderError> {
    let response = client
        .post(config.endpoint(&format!("models/{}", model)))
        .bearer_auth(api_key)
        .timeout(config.timeout)
        .json(&json!({"inputs": request.prompt}))
        .send()
        .await?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::Api {
            status: status.as_u16(),
            message: extract_error_message(&text),
        });
    }
    if !content_type.starts_with("image/") {
        let text = response.text().await.unwrap_or_default();
        return Err(ProviderError::InvalidResponse(extract_error_message(&text)));
    }

    let bytes = response.bytes().await?;
    Ok(format!(
        "data:{};base64,{}",
        content_type,
        general_purpose::STANDARD.encode(&bytes)
    ))
}

fn render_prompt(request: &CompletionRequest) -> String {
    let turns: Vec<_> = request.conversation().collect();
    let system = request.system_prompt();
    if system.is_none() && turns.len() == 1 {
        return turns[0].content.clone();
    }

    let mut prompt = String::new();
    if let Some(system) = system {
        prompt.push_str(&system);
        prompt.push_str("\n\n");
    }
    for turn in turns {
        let speaker = if turn.role == "assistant" { "Assistant" } else { "User" };
        prompt.push_str(&format!("{}: {}\n", speaker, turn.content));
    }
    prompt.push_str("Assistant:");
    prompt
}

fn generated_text(json: &Value) -> Option<String> {
    json.pointer("/0/generated_text")
        .or_else(|| json.get("generated_text"))
        .and_then(|t| t.as_str())
        .map(ToOwned::to_owned)
}
