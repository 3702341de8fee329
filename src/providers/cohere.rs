//! Cohere chat (v1).

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
        .post(config.endpoint("chat"))
        .bearer_auth(api_key)
        .timeout(config.timeout)
        .json(&request_body(model, request))
        .send()
        .await?;

    let json = read_json(response).await?;
    let content = json
        .get("text")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProviderError::InvalidResponse("missing text".into()))?
        .to_string();

    let billed = json.pointer("/meta/billed_units");
    let total_tokens = billed.map(|units| {
        let input = units.get("input_tokens").and_then(|t| t.as_i64()).unwrap_or(0);
        let output = units.get("output_tokens").and_then(|t| t.as_i64()).unwrap_or(0);
        i32::try_from(input + output).unwrap_or(i32::MAX)
    });

    Ok(RawCompletion {
        content,
        total_tokens,
        model: model.to_string(),
    })
}

/// The last turn is sent as `message`, earlier turns as `chat_history`.
fn request_body(model: &str, request: &CompletionRequest) -> Value {
    let turns: Vec<_> = request.conversation().collect();
    let (last, history) = match turns.split_last() {
        Some((last, history)) => (last.content.as_str(), history),
        None => ("", &[][..]),
    };

    let chat_history: Vec<Value> = history
        .iter()
        .map(|turn| {
            let role = if turn.role == "assistant" { "CHATBOT" } else { "USER" };
            json!({"role": role, "message": turn.content})
        })
        .collect();

    let mut body = json!({
        "model": model,
        "message": last,
        "chat_history": chat_history,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });
    if let Some(preamble) = request.system_prompt() {
        body["preamble"] = json!(preamble);
    }
    body
}
