//! Process context
//!
//! Built once at startup and handed to whoever needs a component. Nothing in
//! the crate reaches for a global.
//!
//! Init order:
//! 1. Breaker registries (tier scopes, provider slot scopes)
//! 2. Tier backends, then the `MemoryRouter`
//! 3. `VirtualKeyPool` from the credential list
//! 4. `AgentPool` from the roster, handlers resolved from the registry
//! 5. `SwarmCoordinator`, `recover()`, then the dispatch loop
//!
//! Teardown runs the other way: coordinator, key leases, then storage.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent_pool::{AgentPool, CapabilityRegistry};
use crate::circuit::CircuitBreakerRegistry;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::key_pool::VirtualKeyPool;
use crate::router::{MemoryRouter, TierBackends};
use crate::swarm::SwarmCoordinator;
use crate::tiers::{ArchivalTier, CacheTier, StructuredTier, VectorTier};

/// Everything a running swarm needs
pub struct SwarmContext {
    pub config: Config,
    pub tier_breakers: Arc<CircuitBreakerRegistry>,
    pub provider_breakers: Arc<CircuitBreakerRegistry>,
    pub router: Arc<MemoryRouter>,
    pub keys: Arc<VirtualKeyPool>,
    pub agents: Arc<AgentPool>,
    pub coordinator: Arc<SwarmCoordinator>,
    dispatcher: Option<JoinHandle<()>>,
}

impl SwarmContext {
    /// Build every component and resume persisted runs
    ///
    /// Fails when a registered capability's provider has no credentials, when
    /// a registered capability has no agent in the roster, or when the roster
    /// names a capability nothing is registered for.
    pub async fn start(config: Config, registry: CapabilityRegistry) -> CoreResult<Self> {
        validate(&config, &registry)?;

        let tier_breakers = Arc::new(CircuitBreakerRegistry::new(config.tier_breaker.clone()));
        let provider_breakers = Arc::new(CircuitBreakerRegistry::new(config.provider_breaker.clone()));

        let router = Arc::new(open_router(&config, Arc::clone(&tier_breakers)).await?);
        let keys = Arc::new(VirtualKeyPool::new(&config.providers, Arc::clone(&provider_breakers)));

        let agents = Arc::new(AgentPool::new(config.agents.clone()));
        for spec in &config.roster {
            let caps: Vec<&str> = spec.capabilities.iter().map(String::as_str).collect();
            for _ in 0..spec.count {
                agents.spawn_agent(&caps, &registry)?;
            }
        }

        let coordinator = SwarmCoordinator::new(
            config.coordinator.clone(),
            Arc::clone(&router),
            Arc::clone(&agents),
            Arc::clone(&keys),
        );
        let resumed = coordinator.recover().await?;
        let dispatcher = coordinator.start();

        info!(
            "Swarm context ready: {} agents, {} providers, {} runs resumed",
            agents.stats().total_agents,
            keys.providers().len(),
            resumed
        );

        Ok(Self {
            config,
            tier_breakers,
            provider_breakers,
            router,
            keys,
            agents,
            coordinator,
            dispatcher: Some(dispatcher),
        })
    }

    /// Stop dispatching, suspend live runs and drop outstanding leases
    pub async fn shutdown(&mut self) {
        info!("Shutting down swarm context");
        self.coordinator.shutdown().await;

        if let Some(handle) = self.dispatcher.take() {
            if let Err(e) = handle.await {
                warn!("Dispatcher ended abnormally: {}", e);
            }
        }

        let leaked = self.keys.release_all();
        if leaked > 0 {
            warn!("{} key leases were still held at shutdown", leaked);
        }
        self.agents.reset_claims();
        info!("Swarm context stopped");
    }
}

/// Startup checks that must fail before anything is opened
fn validate(config: &Config, registry: &CapabilityRegistry) -> CoreResult<()> {
    for provider in registry.providers() {
        if config.provider(&provider).is_none() {
            return Err(CoreError::Config(format!(
                "provider {} is required by a registered capability but has no credentials",
                provider
            )));
        }
    }

    for spec in &config.roster {
        if let Some(missing) = spec.capabilities.iter().find(|c| registry.get(c).is_none()) {
            return Err(CoreError::Config(format!(
                "agent roster declares capability {} but no handler is registered for it",
                missing
            )));
        }
    }

    for capability in registry.capabilities() {
        let staffed = config
            .roster
            .iter()
            .any(|spec| spec.capabilities.iter().any(|c| *c == capability));
        if !staffed {
            return Err(CoreError::Config(format!(
                "capability {} is registered but no agent declares it",
                capability
            )));
        }
    }
    Ok(())
}

async fn open_router(config: &Config, breakers: Arc<CircuitBreakerRegistry>) -> CoreResult<MemoryRouter> {
    let backends = TierBackends {
        cache: Arc::new(CacheTier::new(config.router.cache_capacity, config.router.cache_ttl)),
        vector: Arc::new(VectorTier::new()),
        structured: Arc::new(StructuredTier::open(&config.db_path)?),
        archival: Arc::new(ArchivalTier::open(&config.archive_dir).await?),
    };
    Ok(MemoryRouter::new(&config.router, backends, breakers))
}
