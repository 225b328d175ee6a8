use once_cell::sync::Lazy;
use regex::Regex;

// Match key-value like: bearer_token: value, api_key=value, Authorization: secret
static RE_KV_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer[_-]?token|api[_-]?key|authorization|x-api-key)\b\s*[:=]\s*[^\s]+")
        .expect("valid regex")
});

// Match Authorization: Bearer TOKEN
static RE_AUTH_BEARER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bAuthorization\s*:\s*Bearer\s+[A-Za-z0-9._\-]+").expect("valid regex")
});

// Match URL query tokens: ?api_key=... or &token=...
static RE_URL_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([?&](?:api_key|token|key)=)[^&\s]+").expect("valid regex"));

/// Redact common secret patterns from arbitrary text before it is logged or
/// surfaced in an error message.
pub fn redact_secrets_in_text(input: &str) -> String {
    let step1 = RE_KV_SECRET.replace_all(input, |caps: &regex::Captures| {
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or("secret");
        format!("{}: ***REDACTED***", key)
    });
    let step2 = RE_AUTH_BEARER
        .replace_all(&step1, |_: &regex::Captures| {
            "Authorization: Bearer ***REDACTED***".to_string()
        });
    let step3 = RE_URL_QUERY.replace_all(&step2, |caps: &regex::Captures| {
        format!("{}REDACTED", &caps[1])
    });
    step3.into_owned()
}

/// Mask a secret for logging: keep a short prefix/suffix, blank the middle.
pub fn mask_secret(value: &str) -> String {
    if value.len() <= 8 {
        "***".to_string()
    } else {
        format!("{}...{}", &value[..4], &value[value.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_key_value_pairs() {
        let out = redact_secrets_in_text("api_key=sk-abcdef123456");
        assert!(out.contains("REDACTED"));
        assert!(!out.contains("sk-abcdef123456"));
    }

    #[test]
    fn redacts_bearer_header() {
        let out = redact_secrets_in_text("Authorization: Bearer sk-abcdef123456");
        assert_eq!(out, "Authorization: Bearer ***REDACTED***");
    }

    #[test]
    fn redacts_url_query_token() {
        let out = redact_secrets_in_text("https://api.example.com/v1?api_key=secretvalue&x=1");
        assert!(out.contains("api_key=REDACTED"));
        assert!(!out.contains("secretvalue"));
    }

    #[test]
    fn mask_short_secret_fully() {
        assert_eq!(mask_secret("short"), "***");
    }

    #[test]
    fn mask_long_secret_keeps_prefix_suffix() {
        assert_eq!(mask_secret("sk-abcdefgh12345678"), "sk-a...5678");
    }
}
