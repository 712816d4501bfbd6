//! Swarm Router
//!
//! Shared memory and task coordination for a swarm of LLM agents.
//!
//! # Features
//!
//! - **Tiered Memory**: Cache (Moka), Vector, Structured (SQLite), Archival (files)
//! - **Fallback Routing**: per-tier circuit breakers, write fallbacks, read promotion
//! - **Swarm Runs**: capability-matched dispatch with quorum aggregation
//! - **Virtual Keys**: bounded credential slots per provider with slot breakers
//! - **Recovery**: runs and subtasks persisted, resumed after restart
//!
//! # Architecture
//!
//! ```text
//! submit ──► SwarmCoordinator ──► AgentPool ──► CapabilityHandler ──► provider
//!                 │                                  │
//!                 │                                  └── VirtualKeyPool (slots)
//!                 └── MemoryRouter
//!                       ├── Cache      (Moka)
//!                       ├── Vector     (cosine, in memory)
//!                       ├── Structured (SQLite)
//!                       └── Archival   (JSON files)
//! ```

pub mod agent_pool;
pub mod circuit;
pub mod config;
pub mod context;
pub mod error;
pub mod key_pool;
pub mod policy;
pub mod retry;
pub mod router;
pub mod swarm;
pub mod tiers;

pub use agent_pool::{AgentPool, AgentPoolConfig, CapabilityHandler, CapabilityRegistry, TaskOutput, TaskRequest};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats};
pub use config::{AgentSpec, Config, ProviderCredential};
pub use context::SwarmContext;
pub use error::{CoreError, CoreResult};
pub use key_pool::{PoolStats, SlotHandle, VirtualKeyPool};
pub use policy::{SizeClass, TierHint};
pub use retry::{ErrorClass, ProviderError, RetryPolicy};
pub use router::{MemoryRouter, MemoryValue, RankedResult, RouterConfig, SemanticQuery, TierBackends};
pub use swarm::{
    AggregationRule, CoordinatorConfig, RunState, RunStatus, SubTaskResult, SubTaskStatus, SwarmCoordinator,
    TaskPriority, TaskSpec,
};
pub use tiers::{FieldCondition, MemoryEntry, Payload, StructuredFilter, Tier, TierBackend};
