//! Google Gemini `generateContent`.

use super::{read_json, CompletionRequest, ProviderConfig, ProviderError, RawCompletion};
use serde_json::{json, Value};

pub async fn complete(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    model: &str,
    request: &CompletionRequest,
) -> Result<RawCompletion, ProviderError> {
    let response = client
        .post(config.endpoint(&format!("models/{}:generateContent", model)))
        .query(&[("key", api_key)])
        .timeout(config.timeout)
        .json(&request_body(request))
        .send()
        .await?;

    let mut raw = parse_response(&read_json(response).await?)?;
    if raw.model.is_empty() {
        raw.model = model.to_string();
    }
    Ok(raw)
}

fn request_body(request: &CompletionRequest) -> Value {
    // Gemini names the assistant role "model".
    let contents: Vec<Value> = request
        .conversation()
        .map(|turn| {
            let role = if turn.role == "assistant" { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": turn.content}]})
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
            "temperature": request.temperature,
        }
    });
    if let Some(system) = request.system_prompt() {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    body
}

fn parse_response(json: &Value) -> Result<RawCompletion, ProviderError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            let reason = json
                .pointer("/promptFeedback/blockReason")
                .and_then(|r| r.as_str())
                .unwrap_or("missing candidates[0].content");
            ProviderError::InvalidResponse(reason.to_string())
        })?;

    let content = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<String>();

    let total_tokens = json
        .pointer("/usageMetadata/totalTokenCount")
        .and_then(|t| t.as_i64())
        .and_then(|t| i32::try_from(t).ok());

    let model = json
        .get("modelVersion")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(RawCompletion {
        content,
        total_tokens,
        model,
    })
}
