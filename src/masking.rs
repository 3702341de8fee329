const MASKED: &str = "***masked***";
const VISIBLE_PREFIX: usize = 8;
const VISIBLE_SUFFIX: usize = 4;

/// Keeps the first 8 and last 4 characters of a key longer than 12
/// characters; shorter keys are hidden entirely.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= VISIBLE_PREFIX + VISIBLE_SUFFIX {
        return MASKED.to_string();
    }
    let prefix: String = chars[..VISIBLE_PREFIX].iter().collect();
    let suffix: String = chars[chars.len() - VISIBLE_SUFFIX..].iter().collect();
    format!("{}...{}", prefix, suffix)
}
