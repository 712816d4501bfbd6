//! Integration tests for swarm runs over real storage

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarm_router::{
    AgentSpec, AggregationRule, CapabilityHandler, CapabilityRegistry, Config, ProviderCredential, ProviderError,
    RetryPolicy, RunState, SlotHandle, SubTaskStatus, SwarmContext, TaskOutput, TaskRequest, TaskSpec,
};
use tempfile::TempDir;

/// Sleeps, then echoes; counts concurrent provider calls and holds no slot twice
#[derive(Default)]
struct Meter {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    held: parking_lot::Mutex<HashMap<usize, usize>>,
    sleep_ms: u64,
}

impl Meter {
    fn new(sleep_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            sleep_ms,
            ..Default::default()
        })
    }
}

#[async_trait]
impl CapabilityHandler for Meter {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn execute(&self, request: &TaskRequest, slot: &SlotHandle) -> Result<TaskOutput, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut held = self.held.lock();
            let holders = held.entry(slot.slot_id).or_insert(0);
            *holders += 1;
            assert_eq!(*holders, 1, "slot {} held twice", slot.slot_id);
        }

        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;

        *self.held.lock().entry(slot.slot_id).or_insert(1) -= 1;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if request.payload.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(ProviderError::fatal("invalid request"));
        }
        Ok(TaskOutput::new(request.payload.clone()))
    }
}

/// Fails every first attempt with a transient error
struct FlakyOnce;

#[async_trait]
impl CapabilityHandler for FlakyOnce {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn execute(&self, request: &TaskRequest, _slot: &SlotHandle) -> Result<TaskOutput, ProviderError> {
        if request.attempt == 1 {
            return Err(ProviderError::transient("connection reset"));
        }
        Ok(TaskOutput::new(json!({"attempt": request.attempt})))
    }
}

fn config(dir: &TempDir, capability: &str, agents: usize, slots: usize) -> Config {
    let mut config = Config {
        db_path: dir.path().join("structured.db"),
        archive_dir: dir.path().join("archive"),
        providers: vec![ProviderCredential {
            provider: "openai".to_string(),
            slot_count: slots,
            max_concurrent_per_slot: 1,
        }],
        roster: vec![AgentSpec {
            capabilities: vec![capability.to_string()],
            count: agents,
        }],
        ..Default::default()
    };
    config.coordinator.retry = RetryPolicy::immediate();
    config
}

#[tokio::test]
async fn test_backpressure_without_deadlock() {
    let dir = TempDir::new().unwrap();
    let meter = Meter::new(30);
    let registry = CapabilityRegistry::new().with("summarize", meter.clone());
    let mut ctx = SwarmContext::start(config(&dir, "summarize", 3, 2), registry)
        .await
        .unwrap();

    let mut spec = TaskSpec::new("fanout", AggregationRule::RequireAll);
    for i in 0..5 {
        spec = spec.subtask("summarize", json!({ "chunk": i }));
    }
    let run_id = ctx.coordinator.submit(spec).await.unwrap();

    let status = ctx.coordinator.wait(&run_id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.successes(), 5);
    assert!(meter.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(ctx.keys.stats()[0].held, 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_aggregation_with_one_failing_subtask() {
    let dir = TempDir::new().unwrap();
    let registry = CapabilityRegistry::new().with("summarize", Meter::new(5));
    let mut ctx = SwarmContext::start(config(&dir, "summarize", 3, 3), registry)
        .await
        .unwrap();

    let spec = |rule| {
        TaskSpec::new("three", rule)
            .subtask("summarize", json!({"n": 1}))
            .subtask("summarize", json!({"n": 2, "fail": true}))
            .subtask("summarize", json!({"n": 3}))
    };

    let strict = ctx.coordinator.submit(spec(AggregationRule::RequireAll)).await.unwrap();
    let lenient = ctx
        .coordinator
        .submit(spec(AggregationRule::BestEffortMajority))
        .await
        .unwrap();

    let strict = ctx.coordinator.wait(&strict, Duration::from_secs(10)).await.unwrap();
    assert_eq!(strict.state, RunState::Failed);

    let lenient = ctx.coordinator.wait(&lenient, Duration::from_secs(10)).await.unwrap();
    assert_eq!(lenient.state, RunState::Partial);
    assert_eq!(lenient.successes(), 2);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let registry = CapabilityRegistry::new().with("summarize", Arc::new(FlakyOnce));
    let mut ctx = SwarmContext::start(config(&dir, "summarize", 1, 1), registry)
        .await
        .unwrap();

    let spec = TaskSpec::new("retry", AggregationRule::RequireAll).subtask("summarize", json!({}));
    let run_id = ctx.coordinator.submit(spec).await.unwrap();

    let status = ctx.coordinator.wait(&run_id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.subtasks[0].attempt_count, 2);
    assert_eq!(status.subtasks[0].status, SubTaskStatus::Succeeded);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_run_resumes_after_restart() {
    let dir = TempDir::new().unwrap();

    let run_id = {
        let registry = CapabilityRegistry::new().with("summarize", Meter::new(2_000));
        let mut ctx = SwarmContext::start(config(&dir, "summarize", 1, 1), registry)
            .await
            .unwrap();
        let spec = TaskSpec::new("long", AggregationRule::RequireAll).subtask("summarize", json!({"doc": 1}));
        let run_id = ctx.coordinator.submit(spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.shutdown().await;
        run_id
    };

    let registry = CapabilityRegistry::new().with("summarize", Meter::new(5));
    let mut ctx = SwarmContext::start(config(&dir, "summarize", 1, 1), registry)
        .await
        .unwrap();

    let status = ctx.coordinator.wait(&run_id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.name, "long");
    assert_eq!(ctx.coordinator.list_runs().await.len(), 1);

    ctx.shutdown().await;
}
