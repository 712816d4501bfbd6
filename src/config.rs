//! Configuration management
//!
//! Every knob can come from the environment (`Config::from_env`) or a TOML file
//! (`Config::from_toml_file`). Provider credentials are consumed here as plain
//! `(provider, slot_count, max_concurrent_per_slot)` entries; loading the
//! secrets behind them is someone else's job.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::agent_pool::AgentPoolConfig;
use crate::circuit::CircuitBreakerConfig;
use crate::router::RouterConfig;
use crate::swarm::CoordinatorConfig;

/// One credential entry: how many virtual key slots a provider gets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub provider: String,
    pub slot_count: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_slot: usize,
}

fn default_max_concurrent() -> usize {
    1
}

impl FromStr for ProviderCredential {
    type Err = anyhow::Error;

    /// Parse `provider:slots[:max_concurrent]`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > 3 || parts[0].is_empty() {
            bail!("Invalid provider entry '{}', expected provider:slots[:max_concurrent]", s);
        }

        let slot_count: usize = parts[1]
            .parse()
            .with_context(|| format!("Invalid slot count in '{}'", s))?;
        let max_concurrent_per_slot: usize = match parts.get(2) {
            Some(v) => v
                .parse()
                .with_context(|| format!("Invalid max concurrent holders in '{}'", s))?,
            None => default_max_concurrent(),
        };

        if slot_count == 0 || max_concurrent_per_slot == 0 {
            bail!("Provider '{}' must have at least one slot and one holder", parts[0]);
        }

        Ok(Self {
            provider: parts[0].to_string(),
            slot_count,
            max_concurrent_per_slot,
        })
    }
}

/// Parse a comma separated list of provider entries
pub fn parse_providers(spec: &str) -> Result<Vec<ProviderCredential>> {
    spec.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(ProviderCredential::from_str)
        .collect()
}

/// A group of identical agents: which capabilities they declare and how many to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub capabilities: Vec<String>,
    #[serde(default = "default_agent_count")]
    pub count: usize,
}

fn default_agent_count() -> usize {
    1
}

impl FromStr for AgentSpec {
    type Err = anyhow::Error;

    /// Parse `cap1+cap2[:count]`
    fn from_str(s: &str) -> Result<Self> {
        let (caps, count) = match s.trim().split_once(':') {
            Some((caps, count)) => (
                caps,
                count
                    .parse::<usize>()
                    .with_context(|| format!("Invalid agent count in '{}'", s))?,
            ),
            None => (s.trim(), default_agent_count()),
        };

        let capabilities: Vec<String> = caps
            .split('+')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        if capabilities.is_empty() || count == 0 {
            bail!("Invalid agent entry '{}', expected cap1+cap2[:count]", s);
        }

        Ok(Self { capabilities, count })
    }
}

/// Parse a comma separated list of agent entries
pub fn parse_agents(spec: &str) -> Result<Vec<AgentSpec>> {
    spec.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(AgentSpec::from_str)
        .collect()
}

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database for the structured tier
    pub db_path: PathBuf,

    /// Directory for the archival tier
    pub archive_dir: PathBuf,

    pub router: RouterConfig,

    /// Breaker settings shared by the four tier scopes
    pub tier_breaker: CircuitBreakerConfig,

    /// Breaker settings for provider slot scopes
    pub provider_breaker: CircuitBreakerConfig,

    pub agents: AgentPoolConfig,

    pub coordinator: CoordinatorConfig,

    pub providers: Vec<ProviderCredential>,

    /// Agents started at boot
    pub roster: Vec<AgentSpec>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("swarm-router");

        Self {
            db_path: data_dir.join("structured.db"),
            archive_dir: data_dir.join("archive"),
            router: RouterConfig::default(),
            tier_breaker: CircuitBreakerConfig::default(),
            provider_breaker: CircuitBreakerConfig::default(),
            agents: AgentPoolConfig::default(),
            coordinator: CoordinatorConfig::default(),
            providers: Vec::new(),
            roster: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SWARM_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("SWARM_ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(dir);
        }

        config.router.cache_capacity = env_or("SWARM_CACHE_CAPACITY", config.router.cache_capacity);
        config.router.cache_ttl =
            Duration::from_secs(env_or("SWARM_CACHE_TTL_SECS", config.router.cache_ttl.as_secs()));
        config.router.short_ttl =
            Duration::from_secs(env_or("SWARM_SHORT_TTL_SECS", config.router.short_ttl.as_secs()));
        config.router.archival_threshold_bytes = env_or(
            "SWARM_ARCHIVE_THRESHOLD_BYTES",
            config.router.archival_threshold_bytes,
        );

        config.tier_breaker.failure_threshold = env_or(
            "SWARM_TIER_FAILURE_THRESHOLD",
            config.tier_breaker.failure_threshold,
        );
        config.tier_breaker.cooldown = Duration::from_millis(env_or(
            "SWARM_TIER_COOLDOWN_MS",
            config.tier_breaker.cooldown.as_millis() as u64,
        ));
        config.provider_breaker.failure_threshold = env_or(
            "SWARM_PROVIDER_FAILURE_THRESHOLD",
            config.provider_breaker.failure_threshold,
        );
        config.provider_breaker.cooldown = Duration::from_millis(env_or(
            "SWARM_PROVIDER_COOLDOWN_MS",
            config.provider_breaker.cooldown.as_millis() as u64,
        ));

        config.coordinator.key_acquire_timeout = Duration::from_millis(env_or(
            "SWARM_KEY_TIMEOUT_MS",
            config.coordinator.key_acquire_timeout.as_millis() as u64,
        ));
        config.coordinator.max_attempts = env_or("SWARM_MAX_ATTEMPTS", config.coordinator.max_attempts);
        config.coordinator.default_deadline = Duration::from_secs(env_or(
            "SWARM_DEFAULT_DEADLINE_SECS",
            config.coordinator.default_deadline.as_secs(),
        ));

        if let Ok(spec) = std::env::var("SWARM_PROVIDERS") {
            config.providers = parse_providers(&spec).context("Failed to parse SWARM_PROVIDERS")?;
        }
        if let Ok(spec) = std::env::var("SWARM_AGENTS") {
            config.roster = parse_agents(&spec).context("Failed to parse SWARM_AGENTS")?;
        }

        Ok(config)
    }

    /// Load configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Credential entry for a provider, if configured
    pub fn provider(&self, name: &str) -> Option<&ProviderCredential> {
        self.providers.iter().find(|p| p.provider == name)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Serde helper: durations as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Serde helper: optional durations as integer milliseconds
pub mod optional_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
