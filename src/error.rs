//! Error taxonomy
//!
//! One error type shared by the router, key pool and coordinator so callers can
//! match on the failure class without unwrapping nested errors.

use thiserror::Error;

use crate::tiers::Tier;

/// Core errors
#[derive(Error, Debug)]
pub enum CoreError {
    /// Every tier in the chain failed or was circuit-open
    #[error("Tier unavailable: {0}")]
    TierUnavailable(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    /// Hints could not be resolved to a single tier
    #[error("Routing ambiguous: {0}")]
    RoutingAmbiguous(String),
    #[error("No credential slot available for provider {provider} within {waited_ms}ms")]
    KeyExhausted { provider: String, waited_ms: u64 },
    /// Every slot of the provider is behind an open breaker
    #[error("Provider circuit open: {0}")]
    ProviderCircuitOpen(String),
    #[error("Task timed out: {0}")]
    TaskTimeout(String),
    #[error("Aggregation quorum failed: {succeeded}/{total} subtasks succeeded")]
    AggregationQuorumFailed { succeeded: usize, total: usize },
    #[error("No agent declares capability: {0}")]
    AgentCapabilityMismatch(String),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Unknown run: {0}")]
    UnknownRun(String),
    #[error("Provider call failed: {0}")]
    Provider(String),
    /// Request rejected by a tier before any storage was touched
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid task: {0}")]
    InvalidTask(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("{tier} tier error: {message}")]
    Storage { tier: Tier, message: String },
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

impl CoreError {
    pub fn storage(tier: Tier, message: impl Into<String>) -> Self {
        Self::Storage {
            tier,
            message: message.into(),
        }
    }

    /// Errors caused by the request rather than the backend; these never
    /// count against a breaker
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    /// Short machine-readable code, used in persisted subtask failures
    pub fn code(&self) -> &'static str {
        match self {
            Self::TierUnavailable(_) => "tier_unavailable",
            Self::NotFound(_) => "not_found",
            Self::RoutingAmbiguous(_) => "routing_ambiguous",
            Self::KeyExhausted { .. } => "key_exhausted",
            Self::ProviderCircuitOpen(_) => "provider_circuit_open",
            Self::TaskTimeout(_) => "task_timeout",
            Self::AggregationQuorumFailed { .. } => "aggregation_quorum_failed",
            Self::AgentCapabilityMismatch(_) => "agent_capability_mismatch",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::UnknownRun(_) => "unknown_run",
            Self::Provider(_) => "provider_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidTask(_) => "invalid_task",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Storage { .. } => "storage",
            Self::Sqlite(_) => "sqlite",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
