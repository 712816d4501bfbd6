//! Agent Pool
//!
//! Agents are flat records keyed by id. Each agent declares a capability set;
//! the concrete handler for every capability is looked up in the
//! `CapabilityRegistry` once, when the agent is added, and never re-resolved.
//!
//! The pool is the only place agent status changes:
//! - `claim` picks the best available agent for a capability and marks it Working
//! - `finish` records the outcome and frees the agent (idempotent per task)
//! - agents that fail `error_threshold` times in a row sit in Error until
//!   `error_cooldown` has passed

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::key_pool::SlotHandle;
use crate::retry::ProviderError;

/// Work handed to a capability handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub run_id: String,
    pub task_id: String,
    pub capability: String,
    pub payload: serde_json::Value,
    /// 1 on the first try
    pub attempt: u32,
}

/// Successful handler result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: serde_json::Value,
    /// Self-reported confidence in [0, 1], used by HighestConfidence aggregation
    pub confidence: f32,
}

impl TaskOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value, confidence: 1.0 }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Concrete implementation of one capability
///
/// The call to the external provider happens inside `execute`, using the
/// leased slot's credential.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Provider whose key slots this capability consumes
    fn provider(&self) -> &str;

    async fn execute(&self, request: &TaskRequest, slot: &SlotHandle) -> Result<TaskOutput, ProviderError>;
}

/// Capability tag -> handler
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: &str, handler: Arc<dyn CapabilityHandler>) {
        debug!("Registered capability {} -> {}", capability, handler.provider());
        self.handlers.insert(capability.to_string(), handler);
    }

    pub fn with(mut self, capability: &str, handler: Arc<dyn CapabilityHandler>) -> Self {
        self.register(capability, handler);
        self
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(capability).cloned()
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.handlers.keys().cloned().collect();
        caps.sort();
        caps
    }

    /// Every provider some registered capability depends on
    pub fn providers(&self) -> BTreeSet<String> {
        self.handlers.values().map(|h| h.provider().to_string()).collect()
    }
}

/// Agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Idle,
    Working,
    Error,
}

/// How a claimed task ended, from the agent's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    /// Cancelled, timed out by the run, or handed back before the provider call
    Aborted,
}

/// Agent pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPoolConfig {
    /// Outcomes remembered per capability for the success rate
    pub history_window: usize,
    /// Tasks one agent may hold at once
    pub max_tasks_per_agent: usize,
    /// Consecutive failures before an agent is parked in Error
    pub error_threshold: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub error_cooldown: Duration,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            max_tasks_per_agent: 1,
            error_threshold: 3,
            error_cooldown: Duration::from_secs(30),
        }
    }
}

/// Rolling per-capability success history
#[derive(Debug, Clone, Default)]
struct SuccessHistory {
    outcomes: VecDeque<bool>,
}

impl SuccessHistory {
    fn push(&mut self, success: bool, window: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > window.max(1) {
            self.outcomes.pop_front();
        }
    }

    /// Laplace-smoothed, so an untried agent scores 0.5
    fn rate(&self) -> f64 {
        let successes = self.outcomes.iter().filter(|s| **s).count();
        (successes as f64 + 1.0) / (self.outcomes.len() as f64 + 2.0)
    }
}

/// A single agent
pub struct Agent {
    pub id: String,
    pub status: AgentStatus,
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
    current_tasks: HashSet<String>,
    history: HashMap<String, SuccessHistory>,
    consecutive_failures: u32,
    error_since: Option<Instant>,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
}

impl Agent {
    fn new(id: &str, handlers: HashMap<String, Arc<dyn CapabilityHandler>>) -> Self {
        Self {
            id: id.to_string(),
            status: AgentStatus::Idle,
            handlers,
            current_tasks: HashSet::new(),
            history: HashMap::new(),
            consecutive_failures: 0,
            error_since: None,
            tasks_succeeded: 0,
            tasks_failed: 0,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.handlers.contains_key(capability)
    }

    pub fn load(&self) -> usize {
        self.current_tasks.len()
    }

    pub fn success_rate(&self, capability: &str) -> f64 {
        self.history.get(capability).map(|h| h.rate()).unwrap_or(0.5)
    }

    fn info(&self) -> AgentInfo {
        let mut capabilities: Vec<String> = self.handlers.keys().cloned().collect();
        capabilities.sort();
        let mut current_tasks: Vec<String> = self.current_tasks.iter().cloned().collect();
        current_tasks.sort();

        AgentInfo {
            id: self.id.clone(),
            status: self.status,
            capabilities,
            current_tasks,
            tasks_succeeded: self.tasks_succeeded,
            tasks_failed: self.tasks_failed,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Agent info for reporting
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub current_tasks: Vec<String>,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub consecutive_failures: u32,
}

/// An agent claimed for one task
#[derive(Clone)]
pub struct AgentLease {
    pub agent_id: String,
    pub handler: Arc<dyn CapabilityHandler>,
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentPoolStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub working_agents: usize,
    pub error_agents: usize,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
}

impl AgentPoolStats {
    pub fn utilization(&self) -> f64 {
        if self.total_agents == 0 {
            return 0.0;
        }
        self.working_agents as f64 / self.total_agents as f64
    }
}

/// All agents, keyed by id
pub struct AgentPool {
    config: AgentPoolConfig,
    agents: Mutex<HashMap<String, Agent>>,
    /// Signalled whenever an agent may have become available
    available: Arc<Notify>,
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig) -> Self {
        Self {
            config,
            agents: Mutex::new(HashMap::new()),
            available: Arc::new(Notify::new()),
        }
    }

    /// Notified when an agent frees up or joins
    pub fn available(&self) -> Arc<Notify> {
        Arc::clone(&self.available)
    }

    /// Add an agent with an explicit id, resolving its handlers now
    pub fn add_agent(&self, id: &str, capabilities: &[&str], registry: &CapabilityRegistry) -> CoreResult<()> {
        let mut handlers = HashMap::new();
        for &capability in capabilities {
            let handler = registry
                .get(capability)
                .ok_or_else(|| CoreError::AgentCapabilityMismatch(capability.to_string()))?;
            handlers.insert(capability.to_string(), handler);
        }

        let mut agents = self.agents.lock();
        if agents.contains_key(id) {
            return Err(CoreError::Config(format!("duplicate agent id {}", id)));
        }
        agents.insert(id.to_string(), Agent::new(id, handlers));
        drop(agents);

        info!("Added agent {} [{}]", id, capabilities.join(", "));
        self.available.notify_one();
        Ok(())
    }

    /// Add an agent with a generated id
    pub fn spawn_agent(&self, capabilities: &[&str], registry: &CapabilityRegistry) -> CoreResult<String> {
        let id = format!("agent-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.add_agent(&id, capabilities, registry)?;
        Ok(id)
    }

    pub fn remove_agent(&self, id: &str) -> bool {
        let removed = self.agents.lock().remove(id).is_some();
        if removed {
            info!("Removed agent {}", id);
        }
        removed
    }

    /// Whether any agent declares `capability`, whatever its status
    pub fn declares(&self, capability: &str) -> bool {
        self.agents.lock().values().any(|a| a.has_capability(capability))
    }

    /// Capabilities declared by at least one agent
    pub fn declared_capabilities(&self) -> BTreeSet<String> {
        self.agents
            .lock()
            .values()
            .flat_map(|a| a.handlers.keys().cloned())
            .collect()
    }

    /// Claim the best available agent for `capability`
    ///
    /// Among agents that declare the capability, are not in Error and have
    /// spare task capacity: lowest load, then highest success rate for the
    /// capability, then agent id.
    pub fn claim(&self, capability: &str, task_id: &str) -> Option<AgentLease> {
        let mut agents = self.agents.lock();
        self.recover_cooled_down(&mut agents);

        let max_tasks = self.config.max_tasks_per_agent.max(1);
        let best = agents
            .values()
            .filter(|a| a.status != AgentStatus::Error && a.load() < max_tasks && a.has_capability(capability))
            .min_by(|a, b| {
                a.load()
                    .cmp(&b.load())
                    .then_with(|| {
                        b.success_rate(capability)
                            .partial_cmp(&a.success_rate(capability))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|a| a.id.clone())?;

        let agent = agents.get_mut(&best)?;
        let handler = agent.handlers.get(capability).cloned()?;
        agent.current_tasks.insert(task_id.to_string());
        agent.status = AgentStatus::Working;

        debug!("Agent {} claimed for {} ({})", best, task_id, capability);
        Some(AgentLease {
            agent_id: best,
            handler,
        })
    }

    /// Record the end of a claimed task. Returns false if the agent was not
    /// holding the task (already finished).
    pub fn finish(&self, agent_id: &str, task_id: &str, capability: &str, outcome: TaskOutcome) -> bool {
        let mut agents = self.agents.lock();
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };
        if !agent.current_tasks.remove(task_id) {
            return false;
        }

        match outcome {
            TaskOutcome::Succeeded => {
                agent.tasks_succeeded += 1;
                agent.consecutive_failures = 0;
                agent
                    .history
                    .entry(capability.to_string())
                    .or_default()
                    .push(true, self.config.history_window);
            }
            TaskOutcome::Failed => {
                agent.tasks_failed += 1;
                agent.consecutive_failures += 1;
                agent
                    .history
                    .entry(capability.to_string())
                    .or_default()
                    .push(false, self.config.history_window);
            }
            TaskOutcome::Aborted => {}
        }

        if agent.consecutive_failures >= self.config.error_threshold && agent.status != AgentStatus::Error {
            warn!(
                "Agent {} parked after {} consecutive failures",
                agent.id, agent.consecutive_failures
            );
            agent.status = AgentStatus::Error;
            agent.error_since = Some(Instant::now());
        } else if agent.status != AgentStatus::Error && agent.current_tasks.is_empty() {
            agent.status = AgentStatus::Idle;
        }
        drop(agents);

        self.available.notify_one();
        true
    }

    /// When the next parked agent becomes eligible again
    pub fn next_recovery_at(&self) -> Option<Instant> {
        let agents = self.agents.lock();
        agents
            .values()
            .filter(|a| a.status == AgentStatus::Error)
            .filter_map(|a| a.error_since.map(|since| since + self.config.error_cooldown))
            .min()
    }

    /// Drop every claim (restart, shutdown). Returns how many tasks were held.
    pub fn reset_claims(&self) -> usize {
        let mut agents = self.agents.lock();
        let mut count = 0;
        for agent in agents.values_mut() {
            count += agent.current_tasks.len();
            agent.current_tasks.clear();
            if agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
        }
        count
    }

    pub fn get(&self, id: &str) -> Option<AgentInfo> {
        self.agents.lock().get(id).map(|a| a.info())
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let agents = self.agents.lock();
        let mut infos: Vec<AgentInfo> = agents.values().map(|a| a.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn stats(&self) -> AgentPoolStats {
        let agents = self.agents.lock();
        let mut stats = AgentPoolStats {
            total_agents: agents.len(),
            ..Default::default()
        };

        for agent in agents.values() {
            match agent.status {
                AgentStatus::Idle => stats.idle_agents += 1,
                AgentStatus::Working => stats.working_agents += 1,
                AgentStatus::Error => stats.error_agents += 1,
            }
            stats.tasks_succeeded += agent.tasks_succeeded;
            stats.tasks_failed += agent.tasks_failed;
        }

        stats
    }

    fn recover_cooled_down(&self, agents: &mut HashMap<String, Agent>) {
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Error {
                continue;
            }
            let cooled = agent
                .error_since
                .map(|since| since.elapsed() >= self.config.error_cooldown)
                .unwrap_or(true);
            if cooled {
                info!("Agent {} back from error cooldown", agent.id);
                agent.consecutive_failures = 0;
                agent.error_since = None;
                agent.status = if agent.current_tasks.is_empty() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Working
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler(&'static str);

    #[async_trait]
    impl CapabilityHandler for EchoHandler {
        fn provider(&self) -> &str {
            self.0
        }

        async fn execute(&self, request: &TaskRequest, _slot: &SlotHandle) -> Result<TaskOutput, ProviderError> {
            Ok(TaskOutput::new(request.payload.clone()))
        }
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new()
            .with("summarize", Arc::new(EchoHandler("openai")))
            .with("translate", Arc::new(EchoHandler("anthropic")))
    }

    fn pool() -> AgentPool {
        AgentPool::new(AgentPoolConfig {
            error_threshold: 2,
            error_cooldown: Duration::from_millis(30),
            ..Default::default()
        })
    }

    #[test]
    fn test_add_agent_rejects_unregistered_capability() {
        let pool = pool();
        let err = pool.add_agent("a", &["summarize", "classify"], &registry()).unwrap_err();
        assert!(matches!(err, CoreError::AgentCapabilityMismatch(c) if c == "classify"));
        assert!(!pool.declares("summarize"));
    }

    #[test]
    fn test_registry_providers() {
        let providers: Vec<String> = registry().providers().into_iter().collect();
        assert_eq!(providers, vec!["anthropic".to_string(), "openai".to_string()]);
    }

    #[test]
    fn test_claim_respects_capability_and_capacity() {
        let pool = pool();
        let reg = registry();
        pool.add_agent("a", &["summarize"], &reg).unwrap();
        pool.add_agent("b", &["translate"], &reg).unwrap();

        let lease = pool.claim("translate", "t1").unwrap();
        assert_eq!(lease.agent_id, "b");
        assert_eq!(lease.handler.provider(), "anthropic");
        assert!(pool.claim("translate", "t2").is_none());
        assert_eq!(pool.get("b").unwrap().status, AgentStatus::Working);

        assert!(pool.finish("b", "t1", "translate", TaskOutcome::Succeeded));
        assert!(!pool.finish("b", "t1", "translate", TaskOutcome::Succeeded));
        assert_eq!(pool.get("b").unwrap().status, AgentStatus::Idle);
        assert_eq!(pool.get("b").unwrap().tasks_succeeded, 1);
    }

    #[test]
    fn test_tie_break_by_success_rate_then_id() {
        let pool = pool();
        let reg = registry();
        pool.add_agent("a", &["summarize"], &reg).unwrap();
        pool.add_agent("b", &["summarize"], &reg).unwrap();

        // Equal history: lowest id wins
        assert_eq!(pool.claim("summarize", "t1").unwrap().agent_id, "a");
        pool.finish("a", "t1", "summarize", TaskOutcome::Failed);

        // a now has a worse record than untried b
        assert_eq!(pool.claim("summarize", "t2").unwrap().agent_id, "b");
        pool.finish("b", "t2", "summarize", TaskOutcome::Succeeded);
        assert_eq!(pool.claim("summarize", "t3").unwrap().agent_id, "b");
    }

    #[test]
    fn test_lowest_load_preferred() {
        let pool = AgentPool::new(AgentPoolConfig {
            max_tasks_per_agent: 2,
            ..Default::default()
        });
        let reg = registry();
        pool.add_agent("a", &["summarize"], &reg).unwrap();
        pool.add_agent("b", &["summarize"], &reg).unwrap();

        assert_eq!(pool.claim("summarize", "t1").unwrap().agent_id, "a");
        assert_eq!(pool.claim("summarize", "t2").unwrap().agent_id, "b");
        assert_eq!(pool.claim("summarize", "t3").unwrap().agent_id, "a");
    }

    #[test]
    fn test_error_quarantine_and_cooldown() {
        let pool = pool();
        pool.add_agent("a", &["summarize"], &registry()).unwrap();

        for task in ["t1", "t2"] {
            pool.claim("summarize", task).unwrap();
            pool.finish("a", task, "summarize", TaskOutcome::Failed);
        }
        assert_eq!(pool.get("a").unwrap().status, AgentStatus::Error);
        assert!(pool.claim("summarize", "t3").is_none());
        assert!(pool.next_recovery_at().is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(pool.claim("summarize", "t3").is_some());
        assert_eq!(pool.stats().working_agents, 1);
    }

    #[test]
    fn test_aborted_does_not_touch_history() {
        let pool = pool();
        pool.add_agent("a", &["summarize"], &registry()).unwrap();

        pool.claim("summarize", "t1").unwrap();
        pool.finish("a", "t1", "summarize", TaskOutcome::Aborted);
        let info = pool.get("a").unwrap();
        assert_eq!(info.tasks_failed + info.tasks_succeeded, 0);
        assert_eq!(info.status, AgentStatus::Idle);
    }
}
