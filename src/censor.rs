/// Phrases that mark a reply as a refusal.  Matched case-insensitively.
const REFUSAL_PHRASES: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i cannot assist",
    "i can't assist",
    "i am unable to fulfill",
    "i'm unable to fulfill",
    "i cannot comply",
    "i can't comply",
    "i'm not able to",
    "i am not able to",
    "i cannot help with",
    "i can't help with",
];

/// Heuristic check for a backend refusing to answer.
pub fn is_censored(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let normalized = text.replace(['\u{2019}', '\u{2018}'], "'").to_lowercase();
    REFUSAL_PHRASES.iter().any(|p| normalized.contains(p))
}
