use loom_core::ProviderKind;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// How a provider expects its credential to be presented on the wire.
/// Each concrete adapter picks the scheme that matches its backend, mirroring
/// the per-provider constructors this is grounded on.
#[derive(Debug, Clone)]
pub enum AuthScheme {
    Bearer,
    Header(&'static str),
}

impl AuthScheme {
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi | ProviderKind::Azure | ProviderKind::DeepSeek => {
                AuthScheme::Bearer
            }
            ProviderKind::Anthropic => AuthScheme::Header("x-api-key"),
            ProviderKind::Google => AuthScheme::Header("x-goog-api-key"),
            ProviderKind::Local => AuthScheme::Bearer,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("api key is empty")]
    EmptyKey,
    #[error("api key contains characters invalid in an HTTP header value")]
    InvalidHeaderValue,
}

/// Builds the auth header(s) for a request against `kind`, given a plaintext
/// API key resolved from a `loom_core::keys::KeyStore`.
pub fn build_auth_headers(kind: ProviderKind, api_key: &str) -> Result<HeaderMap, AuthError> {
    if api_key.trim().is_empty() {
        return Err(AuthError::EmptyKey);
    }

    let mut headers = HeaderMap::new();
    match AuthScheme::for_provider(kind) {
        AuthScheme::Bearer => {
            let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| AuthError::InvalidHeaderValue)?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        AuthScheme::Header(name) => {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|_| AuthError::InvalidHeaderValue)?;
            let value =
                HeaderValue::from_str(api_key).map_err(|_| AuthError::InvalidHeaderValue)?;
            headers.insert(header_name, value);
        }
    }
    Ok(headers)
}

/// Rejects keys that are obviously placeholders before they ever reach the
/// wire, matching the sanity checks BYOK flows run on a freshly entered key.
pub fn looks_like_placeholder(api_key: &str) -> bool {
    let lowered = api_key.to_lowercase();
    ["your-api-key", "changeme", "placeholder", "example", "xxx"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_uses_bearer_scheme() {
        let headers = build_auth_headers(ProviderKind::OpenAi, "sk-test").unwrap();
        let value = headers.get(reqwest::header::AUTHORIZATION).unwrap();
        assert_eq!(value, "Bearer sk-test");
    }

    #[test]
    fn anthropic_uses_x_api_key_header() {
        let headers = build_auth_headers(ProviderKind::Anthropic, "sk-ant-test").unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-test");
    }

    #[test]
    fn google_uses_x_goog_api_key_header() {
        let headers = build_auth_headers(ProviderKind::Google, "goog-test").unwrap();
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "goog-test");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(build_auth_headers(ProviderKind::OpenAi, "").is_err());
    }

    #[test]
    fn placeholder_detection_is_case_insensitive() {
        assert!(looks_like_placeholder("YOUR-API-KEY"));
        assert!(!looks_like_placeholder("sk-live-abc123"));
    }
}
