//! Provider Retry
//!
//! Error classification and backoff-with-jitter for provider calls. The swarm
//! coordinator uses `ErrorClass::is_retryable` to decide whether a failed
//! subtask goes back to the queue, and `RetryPolicy::delay_for_attempt` for how
//! long it waits before becoming eligible again.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classification of provider errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Temporary failure, retry likely to succeed
    Transient,
    /// Rate limiting, need backoff
    RateLimited,
    /// Dependency unavailable, may recover
    ResourceUnavailable,
    /// Invalid input, retry won't help
    ValidationError,
    /// Authorization failed, needs intervention
    AuthError,
    /// Provider-side fault
    SystemError,
    Unknown,
}

/// Error-type markers that provider APIs put in failure bodies, checked in order
const PROVIDER_MARKERS: &[(&str, ErrorClass)] = &[
    ("insufficient_quota", ErrorClass::AuthError),
    ("rate_limit", ErrorClass::RateLimited),
    ("rate limit", ErrorClass::RateLimited),
    ("too many requests", ErrorClass::RateLimited),
    ("authentication_error", ErrorClass::AuthError),
    ("permission_error", ErrorClass::AuthError),
    ("invalid_api_key", ErrorClass::AuthError),
    ("overloaded", ErrorClass::ResourceUnavailable),
    ("model_not_ready", ErrorClass::ResourceUnavailable),
    ("context_length_exceeded", ErrorClass::ValidationError),
    ("invalid_request_error", ErrorClass::ValidationError),
    ("content_filter", ErrorClass::ValidationError),
    ("api_error", ErrorClass::SystemError),
    ("server_error", ErrorClass::SystemError),
    ("timed out", ErrorClass::Transient),
    ("connection reset", ErrorClass::Transient),
    ("broken pipe", ErrorClass::Transient),
    ("stream closed", ErrorClass::Transient),
];

impl ErrorClass {
    /// Classify a provider HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            408 | 504 => Self::Transient,
            // 529 is the overloaded status some providers send
            502 | 503 | 529 => Self::ResourceUnavailable,
            401 | 402 | 403 => Self::AuthError,
            400 | 404 | 413 | 422 => Self::ValidationError,
            500..=599 => Self::SystemError,
            _ => Self::Unknown,
        }
    }

    /// Classify a provider failure body or transport error message
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        PROVIDER_MARKERS
            .iter()
            .find(|(marker, _)| lower.contains(marker))
            .map(|(_, class)| *class)
            .unwrap_or(Self::Unknown)
    }

    /// Whether another attempt, possibly on another slot, can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient | Self::RateLimited | Self::ResourceUnavailable => true,
            // Unclassified failures get the bounded retry budget
            Self::Unknown => true,
            Self::ValidationError | Self::AuthError | Self::SystemError => false,
        }
    }

    /// Whether the failure says something about the credential slot's health
    pub fn counts_against_slot(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ResourceUnavailable | Self::AuthError | Self::SystemError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::ValidationError => "validation_error",
            Self::AuthError => "auth_error",
            Self::SystemError => "system_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Failure reported by a capability handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Build from a raw message, classifying it
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: ErrorClass::from_message(&message),
            message,
        }
    }

    /// Build from a provider HTTP response; a recognised body marker wins
    /// over the status
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        let class = match ErrorClass::from_message(&message) {
            ErrorClass::Unknown => ErrorClass::from_status(status),
            class => class,
        };
        Self {
            class,
            message: format!("HTTP {}: {}", status, message),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ValidationError, message)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.class.as_str())
    }
}

impl std::error::Error for ProviderError {}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Initial delay between retries
    #[serde(with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0), applied symmetrically around the base delay
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Many fast retries
    pub fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            jitter_factor: 0.1,
        }
    }

    /// Few slow retries
    pub fn conservative() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 3.0,
            jitter_factor: 0.3,
        }
    }

    /// No delay at all (tests)
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter_factor > 0.0 && capped > 0.0 {
            let spread = rand::thread_rng().gen_range(-1.0..=1.0);
            (capped + capped * self.jitter_factor * spread).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorClass::from_status(429), ErrorClass::RateLimited);
        assert_eq!(ErrorClass::from_status(529), ErrorClass::ResourceUnavailable);
        assert_eq!(ErrorClass::from_status(504), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_status(401), ErrorClass::AuthError);
        assert_eq!(ErrorClass::from_status(422), ErrorClass::ValidationError);
        assert_eq!(ErrorClass::from_status(500), ErrorClass::SystemError);
        assert_eq!(ErrorClass::from_status(418), ErrorClass::Unknown);
    }

    #[test]
    fn test_provider_body_markers() {
        let overloaded = r#"{"type":"error","error":{"type":"overloaded_error"}}"#;
        assert_eq!(ErrorClass::from_message(overloaded), ErrorClass::ResourceUnavailable);
        assert_eq!(ErrorClass::from_message("insufficient_quota"), ErrorClass::AuthError);
        assert_eq!(
            ErrorClass::from_message("context_length_exceeded: 9000 tokens"),
            ErrorClass::ValidationError
        );
        assert_eq!(ErrorClass::from_message("Connection reset by peer"), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_message("something odd"), ErrorClass::Unknown);
    }

    #[test]
    fn test_body_marker_overrides_status() {
        // Quota exhaustion arrives as a 429 but needs intervention
        let err = ProviderError::from_response(429, r#"{"error":{"code":"insufficient_quota"}}"#);
        assert_eq!(err.class, ErrorClass::AuthError);
        assert!(!err.class.is_retryable());
        assert!(err.class.counts_against_slot());

        let err = ProviderError::from_response(503, "upstream gone");
        assert_eq!(err.class, ErrorClass::ResourceUnavailable);
        assert!(err.message.starts_with("HTTP 503"));
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(!ErrorClass::ValidationError.is_retryable());
        assert!(!ErrorClass::AuthError.is_retryable());
        assert!(!ErrorClass::SystemError.is_retryable());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.delay_for_attempt(1).as_secs_f64();
            assert!((0.16 - 1e-9..=0.24 + 1e-9).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(RetryPolicy::immediate().delay_for_attempt(5), Duration::ZERO);
    }
}
