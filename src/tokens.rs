//! Token counting and the static per-model price table used for cost accounting.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use tiktoken_rs::cl100k_base;

/// Cached encoder – created once per process.
static ENCODER: Lazy<Mutex<tiktoken_rs::CoreBPE>> =
    Lazy::new(|| Mutex::new(cl100k_base().expect("init cl100k encoder")));

/// Count tokens for a piece of UTF‑8 text.
pub fn count_tokens(text: &str) -> usize {
    ENCODER
        .lock()
        .expect("encoder lock")
        .encode_with_special_tokens(text)
        .len()
}

/// USD price per 1000 tokens, blended over input and output.
/// Matched by prefix in order, so longer prefixes must come first.
/// Unknown models fall back to `DEFAULT_PRICE_PER_1K`.
const PRICES_PER_1K: &[(&str, f64)] = &[
    // OpenAI / GitHub Models
    ("gpt-4o-mini", 0.0006),
    ("gpt-4o", 0.01),
    ("gpt-4-turbo", 0.03),
    ("gpt-4", 0.06),
    ("gpt-3.5-turbo", 0.002),
    // Groq
    ("llama-3.3-70b", 0.00079),
    ("llama-3.1-8b", 0.00008),
    ("mixtral-8x7b", 0.00024),
    // Gemini
    ("gemini-1.5-pro", 0.0035),
    ("gemini-1.5-flash", 0.00035),
    // Cohere
    ("command-r-plus", 0.015),
    ("command-r", 0.0015),
    // xAI
    ("grok", 0.005),
    // DeepSeek
    ("deepseek-chat", 0.00028),
    ("deepseek-coder", 0.00028),
    // HuggingFace serverless inference
    ("mistralai/", 0.0002),
    ("meta-llama/", 0.0002),
];

pub const DEFAULT_PRICE_PER_1K: f64 = 0.002;

/// Flat USD price per generated image.
const IMAGE_PRICES: &[(&str, f64)] = &[
    ("dall-e-3", 0.04),
    ("dall-e-2", 0.02),
    ("stabilityai/", 0.0),
];

pub const DEFAULT_IMAGE_PRICE: f64 = 0.04;

pub fn price_per_1k(model: &str) -> f64 {
    PRICES_PER_1K
        .iter()
        .find(|(prefix, _)| model.starts_with(*prefix))
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_PRICE_PER_1K)
}

pub fn estimate_cost(model: &str, tokens: i32) -> f64 {
    f64::from(tokens.max(0)) / 1000.0 * price_per_1k(model)
}

pub fn image_cost(model: &str) -> f64 {
    IMAGE_PRICES
        .iter()
        .find(|(prefix, _)| model.starts_with(*prefix))
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_IMAGE_PRICE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens_basic() {
        // "Hello", ",", " world", "!"
        assert_eq!(count_tokens("Hello, world!"), 4);
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("Hello"), 1);
    }

    #[test]
    fn test_count_tokens_consistency() {
        let text = "The quick brown fox jumps over the lazy dog";
        assert_eq!(count_tokens(text), count_tokens(text));
    }

    #[test]
    fn test_price_prefix_order() {
        // gpt-4o-mini must not be priced as gpt-4o
        assert_eq!(price_per_1k("gpt-4o-mini"), 0.0006);
        assert_eq!(price_per_1k("gpt-4o-2024-08-06"), 0.01);
        assert_eq!(price_per_1k("command-r-plus"), 0.015);
        assert_eq!(price_per_1k("command-r"), 0.0015);
        assert_eq!(price_per_1k("llama-3.3-70b-versatile"), 0.00079);
    }

    #[test]
    fn test_unknown_model_uses_default_price() {
        assert_eq!(price_per_1k("some-new-model"), DEFAULT_PRICE_PER_1K);
        assert_eq!(price_per_1k(""), DEFAULT_PRICE_PER_1K);
    }

    #[test]
    fn test_estimate_cost() {
        assert!((estimate_cost("gpt-4o", 2000) - 0.02).abs() < 1e-12);
        assert_eq!(estimate_cost("gpt-4o", 0), 0.0);
        assert_eq!(estimate_cost("gpt-4o", -5), 0.0);
    }

    #[test]
    fn test_image_cost() {
        assert_eq!(image_cost("dall-e-3"), 0.04);
        assert_eq!(image_cost("dall-e-2"), 0.02);
        assert_eq!(image_cost("stabilityai/stable-diffusion-xl-base-1.0"), 0.0);
        assert_eq!(image_cost("unknown"), DEFAULT_IMAGE_PRICE);
    }
}
