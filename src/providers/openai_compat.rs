//! OpenAI-compatible chat completions, shared by OpenAI, Groq, xAI Grok,
//! DeepSeek and GitHub Models. Also hosts the OpenAI images endpoint.

use super::{read_json, CompletionRequest, ProviderConfig, ProviderError, RawCompletion};
use serde_json::{json, Value};

pub async fn complete(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    model: &str,
    request: &CompletionRequest,
) -> Result<RawCompletion, ProviderError> {
    let body = json!({
        "model": model,
        "messages": request.messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });

    let response = client
        .post(config.endpoint("chat/completions"))
        .bearer_auth(api_key)
        .timeout(config.timeout)
        .json(&body)
        .send()
        .await?;

    parse_completion(&read_json(response).await?)
}

pub(crate) fn parse_completion(json: &Value) -> Result<RawCompletion, ProviderError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?
        .to_string();

    let total_tokens = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_i64())
        .and_then(|t| i32::try_from(t).ok());

    let model = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(RawCompletion {
        content,
        total_tokens,
        model,
    })
}

/// Returns a URL for the generated image; `b64_json` payloads become data URLs.
pub async fn generate_image(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    model: &str,
    request: &super::ImageRequest,
) -> Result<String, ProviderError> {
    let body = json!({
        "model": model,
        "prompt": request.prompt,
        "n": 1,
        "size": request.size,
    });

    let response = client
        .post(config.endpoint("images/generations"))
        .bearer_auth(api_key)
        .timeout(config.timeout)
        .json(&body)
        .send()
        .await?;

    let json = read_json(response).await?;
    if let Some(url) = json.pointer("/data/0/url").and_then(|u| u.as_str()) {
        return Ok(url.to_string());
    }
    json.pointer("/data/0/b64_json")
        .and_then(|b| b.as_str())
        .map(|b64| format!("data:image/png;base64,{}", b64))
        .ok_or_else(|| ProviderError::InvalidResponse("missing data[0].url".into()))
}
