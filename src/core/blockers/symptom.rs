use regex::{Captures, Regex};
use std::sync::LazyLock;

const MAX_SYMPTOM_CHARS: usize = 200;

/// Why a tool step failed. Ordering of `classify` rules matters: the first
/// matching family wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerType {
    AccessDenied,
    MissingPermission,
    MissingSecret,
    MissingCapability,
    ExternalGate,
    EnvironmentMismatch,
    BadPlan,
}

impl BlockerType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockerType::AccessDenied => "access_denied",
            BlockerType::MissingPermission => "missing_permission",
            BlockerType::MissingSecret => "missing_secret",
            BlockerType::MissingCapability => "missing_capability",
            BlockerType::ExternalGate => "external_gate",
            BlockerType::EnvironmentMismatch => "environment_mismatch",
            BlockerType::BadPlan => "bad_plan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        RULES
            .iter()
            .map(|(t, _)| *t)
            .chain(std::iter::once(BlockerType::BadPlan))
            .find(|t| t.as_str() == value)
    }
}

static RULES: &[(BlockerType, &[&str])] = &[
    (
        BlockerType::AccessDenied,
        &["403", "forbidden", "access denied", "captcha", "cloudflare", "bot detection"],
    ),
    (
        BlockerType::MissingPermission,
        &["permission denied", "eacces", "operation not permitted", "read-only file system"],
    ),
    (
        BlockerType::MissingSecret,
        &["401", "unauthorized", "api key", "token", "credential", "authentication"],
    ),
    (
        BlockerType::MissingCapability,
        &["command not found", "not installed", "not supported", "unknown tool", "no such tool"],
    ),
    (
        BlockerType::ExternalGate,
        &["429", "rate limit", "quota", "timed out", "timeout", "503", "service unavailable"],
    ),
    (
        BlockerType::EnvironmentMismatch,
        &["no such file", "not found", "version", "mismatch", "enoent"],
    ),
];

pub fn classify(error: &str) -> BlockerType {
    let lower = error.to_lowercase();
    RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(t, _)| *t)
        .unwrap_or(BlockerType::BadPlan)
}

static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(?:https?|wss?|ftp)://\S+").unwrap());
static TS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:z|[+-]\d{2}:?\d{2})?").unwrap()
});
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
});
static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(?:0x)?[0-9a-f]{8,}\b").unwrap());
static NUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{5,}\b").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalized lookup key for a failure: `tool:` followed by the error with
/// variable content replaced by placeholders.
pub fn normalize_symptom(tool: &str, error: &str) -> String {
    let lower = error.to_lowercase();
    let s = URL_RE.replace_all(&lower, "<url>");
    let s = TS_RE.replace_all(&s, "<ts>");
    let s = UUID_RE.replace_all(&s, "<id>");
    // Pure digit runs are numbers, not ids.
    let s = HEX_RE.replace_all(&s, |caps: &Captures<'_>| {
        let m = &caps[0];
        if m.chars().all(|c| c.is_ascii_digit()) {
            m.to_string()
        } else {
            "<id>".to_string()
        }
    });
    let s = NUM_RE.replace_all(&s, "<n>");
    let s = WS_RE.replace_all(s.trim(), " ");
    let body: String = s.chars().take(MAX_SYMPTOM_CHARS).collect();
    format!("{}:{}", tool, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_follows_rule_order() {
        assert_eq!(classify("HTTP 403 Forbidden"), BlockerType::AccessDenied);
        assert_eq!(classify("EACCES: permission denied"), BlockerType::MissingPermission);
        assert_eq!(classify("401 Unauthorized: missing API key"), BlockerType::MissingSecret);
        assert_eq!(classify("sh: chromium: command not found"), BlockerType::MissingCapability);
        assert_eq!(classify("429 Too Many Requests (rate limit)"), BlockerType::ExternalGate);
        assert_eq!(classify("No such file or directory"), BlockerType::EnvironmentMismatch);
        assert_eq!(classify("the model asked for nonsense"), BlockerType::BadPlan);
    }

    #[test]
    fn symptom_strips_variable_content() {
        let a = normalize_symptom(
            "web_fetch",
            "GET https://example.com/a?x=1 failed at 2025-01-02T03:04:05Z req 9f86d081884c7d65 (status 403)",
        );
        let b = normalize_symptom(
            "web_fetch",
            "GET https://other.org/b failed at 2026-11-12 13:14 req deadbeefcafe0001 (status 403)",
        );
        assert_eq!(a, b);
        assert_eq!(a, "web_fetch:get <url> failed at <ts> req <id> (status 403)");
    }

    #[test]
    fn long_numbers_and_uuids_collapse() {
        let s = normalize_symptom(
            "shell",
            "job 1234567 for 550e8400-e29b-41d4-a716-446655440000   exited   1",
        );
        assert_eq!(s, "shell:job <n> for <id> exited 1");
    }

    #[test]
    fn symptom_is_truncated() {
        let s = normalize_symptom("t", &"x ".repeat(500));
        assert_eq!(s.chars().count(), "t:".len() + MAX_SYMPTOM_CHARS);
    }

    #[test]
    fn blocker_type_parse_round_trips_names() {
        assert_eq!(BlockerType::parse("bad_plan"), Some(BlockerType::BadPlan));
        assert_eq!(BlockerType::parse("external_gate"), Some(BlockerType::ExternalGate));
        assert_eq!(BlockerType::parse("nope"), None);
    }
}
