use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity assigned to a classified error, used by the breaker to decide
/// whether consecutive failures should trip the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The classification of a dispatch failure, independent of which provider
/// produced it. Every adapter maps its transport/protocol errors into one of
/// these before handing control back to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    Network,
    RateLimit { retry_after: Option<u64> },
    ServerError { status: u16 },
    Auth,
    InvalidRequest,
    QuotaExceeded,
    ModelUnavailable,
    Unknown,
}

impl ErrorKind {
    /// Whether the gateway may retry against the *same* provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::RateLimit { .. }
                | ErrorKind::ServerError { .. }
                | ErrorKind::Unknown
        )
    }

    /// Whether a failure of this kind should trigger a fallback to the next
    /// provider even when not itself retryable within the current one.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, ErrorKind::ModelUnavailable) || !self.is_retryable()
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Timeout => Severity::Medium,
            ErrorKind::Network => Severity::Medium,
            ErrorKind::RateLimit { .. } => Severity::Medium,
            ErrorKind::ServerError { .. } => Severity::High,
            ErrorKind::Auth => Severity::High,
            ErrorKind::InvalidRequest => Severity::High,
            ErrorKind::QuotaExceeded => Severity::High,
            ErrorKind::ModelUnavailable => Severity::Medium,
            ErrorKind::Unknown => Severity::Medium,
        }
    }

    /// Classify an HTTP status code returned by a provider.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::Auth,
            400 => ErrorKind::InvalidRequest,
            404 => ErrorKind::ModelUnavailable,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit { retry_after: None },
            402 => ErrorKind::QuotaExceeded,
            s if (500..=599).contains(&s) => ErrorKind::ServerError { status: s },
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::RateLimit { retry_after } => {
                write!(f, "rate_limit")?;
                if let Some(secs) = retry_after {
                    write!(f, " (retry after {}s)", secs)?;
                }
                Ok(())
            }
            ErrorKind::ServerError { status } => write!(f, "server_error ({})", status),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::InvalidRequest => write!(f, "invalid_request"),
            ErrorKind::QuotaExceeded => write!(f, "quota_exceeded"),
            ErrorKind::ModelUnavailable => write!(f, "model_unavailable"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A fully classified dispatch failure, carrying enough context for the
/// gateway, the health registry, and the caller-facing error mapping.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub provider: String,
    pub message: String,
    pub correlation_id: Uuid,
}

impl ClassifiedError {
    pub fn new(provider: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn from_status(provider: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::from_status(status), body)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.correlation_id, self.provider, self.kind, self.message
        )
    }
}

impl std::error::Error for ClassifiedError {}

impl From<&reqwest::Error> for ErrorKind {
    fn from(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Network
        } else if let Some(status) = err.status() {
            ErrorKind::from_status(status.as_u16())
        } else {
            ErrorKind::Unknown
        }
    }
}

/// Errors visible to callers of the gateway. Every other internal failure is
/// collapsed into `Internal` at the orchestration boundary (see DESIGN.md,
/// "caller plane").
#[derive(Debug, Clone)]
pub enum GatewayError {
    BudgetExceeded { reason: String },
    NoHealthyProvider,
    Cancelled,
    InvalidRequest { message: String },
    Internal { message: String },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::BudgetExceeded { reason } => {
                write!(f, "budget exceeded: {}", reason)
            }
            GatewayError::NoHealthyProvider => write!(f, "no healthy provider available"),
            GatewayError::Cancelled => write!(f, "request cancelled"),
            GatewayError::InvalidRequest { message } => write!(f, "invalid request: {}", message),
            GatewayError::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ClassifiedError> for GatewayError {
    fn from(err: ClassifiedError) -> Self {
        match err.kind {
            ErrorKind::InvalidRequest => GatewayError::InvalidRequest {
                message: err.message,
            },
            _ => GatewayError::Internal {
                message: err.to_string(),
            },
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
pub type ClassifiedResult<T> = Result<T, ClassifiedError>;

/// Per-provider retry policy: exponential backoff with optional jitter,
/// applied only to retryable classifications while the breaker permits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt - 1)`, clamped to `max_delay`, with optional
    /// multiplicative jitter in `[0.5, 1.5]`. `attempt` is 1-indexed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32 - 1);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let factor = if self.jitter {
            0.5 + rand::random::<f64>()
        } else {
            1.0
        };
        Duration::from_millis((capped * factor).max(0.0) as u64)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_not_retryable() {
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(ErrorKind::Auth.triggers_fallback());
    }

    #[test]
    fn server_error_is_retryable_and_high_severity() {
        let kind = ErrorKind::from_status(503);
        assert!(kind.is_retryable());
        assert_eq!(kind.severity(), Severity::High);
    }

    #[test]
    fn model_unavailable_triggers_fallback_without_retry() {
        assert!(!ErrorKind::ModelUnavailable.is_retryable());
        assert!(ErrorKind::ModelUnavailable.triggers_fallback());
    }

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_respects_max_delay() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: false,
        };
        assert_eq!(policy.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn classified_error_maps_unknown_kinds_to_internal() {
        let err = ClassifiedError::new("openai", ErrorKind::ServerError { status: 503 }, "boom");
        let gw: GatewayError = err.into();
        matches!(gw, GatewayError::Internal { .. });
    }

    #[test]
    fn invalid_request_maps_through() {
        let err = ClassifiedError::new("openai", ErrorKind::InvalidRequest, "bad prompt");
        let gw: GatewayError = err.into();
        match gw {
            GatewayError::InvalidRequest { message } => assert_eq!(message, "bad prompt"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
