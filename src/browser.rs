//! User-Agent to browser label lookup

/// Label returned when no known token appears in the User-Agent
pub const UNKNOWN_BROWSER: &str = "Unknown";

/// Known browser tokens, checked in order. The first one found wins, so a
/// Chrome UA (which also advertises Safari) is labelled Chrome.
const BROWSER_TOKENS: [&str; 7] = [
    "Chrome", "Firefox", "Safari", "Opera", "Edge", "MSIE", "Trident",
];

/// Classify a User-Agent header value into a browser label
pub fn classify(user_agent: &str) -> &'static str {
    BROWSER_TOKENS
        .iter()
        .copied()
        .find(|token| user_agent.contains(token))
        .unwrap_or(UNKNOWN_BROWSER)
}
