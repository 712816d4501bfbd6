//! Swarm Coordinator
//!
//! Turns a `TaskSpec` into a `SwarmRun`, hands its subtasks to agents and
//! folds the results with the run's aggregation rule.
//!
//! Run lifecycle:
//! `Pending -> Dispatching -> Running -> Aggregating -> {Completed | Partial | Failed}`
//!
//! Subtask lifecycle:
//! `Pending -> Dispatching -> Running -> {Succeeded | Failed | Cancelled}`,
//! with `Dispatching/Running -> Pending` when a retryable failure sends it back
//! to the queue.
//!
//! A dispatched subtask suspends at exactly two points: key acquisition
//! (bounded by `key_acquire_timeout`) and the provider call (bounded by the
//! subtask deadline). Both race against the run's cancel signal.
//!
//! Every state change is written to the structured tier through the memory
//! router before the coordinator acts on it. Each run has its own lock; there
//! is no lock shared by unrelated runs.

pub mod queue;
pub mod run;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent_pool::{AgentLease, AgentPool, TaskOutcome, TaskOutput, TaskRequest};
use crate::error::{CoreError, CoreResult};
use crate::key_pool::{SlotHandle, VirtualKeyPool};
use crate::policy::TierHint;
use crate::retry::{ErrorClass, RetryPolicy};
use crate::router::{MemoryRouter, MemoryValue};
use crate::tiers::StructuredFilter;

pub use queue::{DispatchQueue, QueueItem};
pub use run::{
    aggregate, AggregationRule, RunState, SubTask, SubTaskResult, SubTaskSpec, SubTaskStatus, SwarmRun,
    TaskPriority, TaskSpec,
};
use run::{run_key, task_key, task_prefix, RUN_DOMAIN, TASK_DOMAIN};

/// Timer horizon for run deadlines (roughly 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Longest an agent waits for a key slot per attempt
    #[serde(with = "crate::config::duration_ms")]
    pub key_acquire_timeout: Duration,
    /// Dispatch attempts per subtask, including the first
    pub max_attempts: u32,
    /// Run deadline when the submission sets none
    #[serde(with = "crate::config::duration_ms")]
    pub default_deadline: Duration,
    /// Backoff between attempts
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_acquire_timeout: Duration::from_secs(5),
            max_attempts: 3,
            default_deadline: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Caller view of one subtask
#[derive(Debug, Clone, Serialize)]
pub struct SubTaskView {
    pub task_id: String,
    pub capability: String,
    pub status: SubTaskStatus,
    pub attempt_count: u32,
    pub assigned_agent: Option<String>,
}

/// Caller view of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: String,
    pub name: String,
    pub state: RunState,
    pub subtasks: Vec<SubTaskView>,
    pub partial_results: BTreeMap<String, SubTaskResult>,
    /// Subtask chosen under HighestConfidence
    pub selected: Option<String>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl RunStatus {
    /// The chosen result under HighestConfidence
    pub fn selected_result(&self) -> Option<&SubTaskResult> {
        self.selected.as_ref().and_then(|id| self.partial_results.get(id))
    }

    pub fn successes(&self) -> usize {
        self.partial_results.values().filter(|r| r.is_success()).count()
    }
}

/// One line of `list_runs`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub name: String,
    pub state: RunState,
    pub subtasks: usize,
    pub succeeded: usize,
    pub created_at: DateTime<Utc>,
}

struct RunRecord {
    run: SwarmRun,
    tasks: HashMap<String, SubTask>,
    /// Slots held by running subtasks, released on cancel/expiry
    slots: HashMap<String, SlotHandle>,
    state_tx: watch::Sender<RunState>,
    cancel_tx: watch::Sender<bool>,
}

impl RunRecord {
    fn new(run: SwarmRun, tasks: HashMap<String, SubTask>) -> Self {
        let (state_tx, _) = watch::channel(run.state);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            run,
            tasks,
            slots: HashMap::new(),
            state_tx,
            cancel_tx,
        }
    }

    fn all_terminal(&self) -> bool {
        self.run
            .subtasks
            .iter()
            .all(|id| self.tasks.get(id).map(|t| t.status.is_terminal()).unwrap_or(true))
    }

    fn status(&self) -> RunStatus {
        let subtasks = self
            .run
            .subtasks
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|t| SubTaskView {
                task_id: t.task_id.clone(),
                capability: t.required_capability.clone(),
                status: t.status,
                attempt_count: t.attempt_count,
                assigned_agent: t.assigned_agent.clone(),
            })
            .collect();

        RunStatus {
            run_id: self.run.run_id.clone(),
            name: self.run.name.clone(),
            state: self.run.state,
            subtasks,
            partial_results: self.run.partial_results.clone(),
            selected: self.run.selected.clone(),
            error: self.run.error.clone(),
            cancelled: self.run.cancelled,
        }
    }
}

type RunCell = Arc<Mutex<RunRecord>>;

/// Swarm coordinator
pub struct SwarmCoordinator {
    config: CoordinatorConfig,
    router: Arc<MemoryRouter>,
    agents: Arc<AgentPool>,
    keys: Arc<VirtualKeyPool>,
    runs: parking_lot::RwLock<HashMap<String, RunCell>>,
    queue: DispatchQueue,
    wake: Notify,
    seq: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl SwarmCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        router: Arc<MemoryRouter>,
        agents: Arc<AgentPool>,
        keys: Arc<VirtualKeyPool>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            router,
            agents,
            keys,
            runs: parking_lot::RwLock::new(HashMap::new()),
            queue: DispatchQueue::new(),
            wake: Notify::new(),
            seq: AtomicU64::new(0),
            shutdown_tx,
        })
    }

    /// Start the dispatch loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_loop().await })
    }

    // ============ Public API ============

    /// Submit a task, returning the run id
    ///
    /// Fails with `AgentCapabilityMismatch` if any subtask needs a capability
    /// no agent declares.
    pub async fn submit(self: &Arc<Self>, spec: TaskSpec) -> CoreResult<String> {
        if *self.shutdown_tx.borrow() {
            return Err(CoreError::ShuttingDown);
        }
        if spec.subtasks.is_empty() {
            return Err(CoreError::InvalidTask(format!("{} has no subtasks", spec.name)));
        }
        for sub in &spec.subtasks {
            if !self.agents.declares(&sub.capability) {
                return Err(CoreError::AgentCapabilityMismatch(sub.capability.clone()));
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let deadline_in = spec.deadline.unwrap_or(self.config.default_deadline);
        let deadline = chrono::Duration::from_std(deadline_in)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| CoreError::InvalidTask(format!("deadline out of range: {:?}", deadline_in)))?;

        let mut tasks = HashMap::with_capacity(spec.subtasks.len());
        let mut order = Vec::with_capacity(spec.subtasks.len());
        for sub in spec.subtasks {
            let task_id = Uuid::new_v4().to_string();
            order.push(task_id.clone());
            tasks.insert(
                task_id.clone(),
                SubTask {
                    task_id,
                    parent_run_id: run_id.clone(),
                    required_capability: sub.capability,
                    payload: sub.payload,
                    priority: sub.priority.unwrap_or(spec.priority),
                    status: SubTaskStatus::Pending,
                    attempt_count: 0,
                    deadline,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                    assigned_agent: None,
                    result: None,
                    updated_at: now,
                },
            );
        }

        let mut run = SwarmRun {
            run_id: run_id.clone(),
            name: spec.name,
            subtasks: order,
            aggregation_rule: spec.aggregation_rule,
            priority: spec.priority,
            state: RunState::Pending,
            partial_results: BTreeMap::new(),
            deadline,
            created_at: now,
            updated_at: now,
            selected: None,
            error: None,
            cancelled: false,
        };

        self.persist_run(&run).await?;
        for id in &run.subtasks {
            if let Some(task) = tasks.get(id) {
                self.persist_task(task).await?;
            }
        }

        run.state = RunState::Dispatching;
        run.updated_at = Utc::now();
        self.persist_run(&run).await?;

        let cell: RunCell = Arc::new(Mutex::new(RunRecord::new(run, tasks)));
        {
            let mut rec = cell.lock().await;
            self.runs.write().insert(run_id.clone(), Arc::clone(&cell));

            for id in rec.run.subtasks.clone() {
                if let Some(task) = rec.tasks.get(&id) {
                    self.enqueue(task, None);
                }
            }

            self.transition(&mut rec, RunState::Running).await;
            info!(
                "Run {} ({}) submitted: {} subtasks, {:?}",
                run_id,
                rec.run.name,
                rec.run.subtasks.len(),
                rec.run.aggregation_rule
            );
        }

        self.spawn_deadline(&cell, &run_id, deadline).await;
        self.wake.notify_one();
        Ok(run_id)
    }

    /// Current state and partial results of a run
    pub async fn status(&self, run_id: &str) -> CoreResult<RunStatus> {
        if let Some(cell) = self.run_cell(run_id) {
            return Ok(cell.lock().await.status());
        }

        // Not live in this process: fall back to the persisted record
        let (run, tasks) = self
            .load_run(run_id)
            .await?
            .ok_or_else(|| CoreError::UnknownRun(run_id.to_string()))?;
        Ok(RunRecord::new(run, tasks).status())
    }

    /// Wait until a run reaches a terminal state
    pub async fn wait(&self, run_id: &str, timeout: Duration) -> CoreResult<RunStatus> {
        let cell = self
            .run_cell(run_id)
            .ok_or_else(|| CoreError::UnknownRun(run_id.to_string()))?;
        let mut rx = cell.lock().await.state_tx.subscribe();

        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| state.is_terminal()).await.map(|_| ())
        })
        .await;

        match reached {
            Ok(_) => self.status(run_id).await,
            Err(_) => Err(CoreError::TaskTimeout(format!(
                "run {} not finished after {:?}",
                run_id, timeout
            ))),
        }
    }

    /// Cancel a run. Returns false when the run was already terminal.
    pub async fn cancel(&self, run_id: &str) -> CoreResult<bool> {
        let cell = self
            .run_cell(run_id)
            .ok_or_else(|| CoreError::UnknownRun(run_id.to_string()))?;
        let mut rec = cell.lock().await;

        if rec.run.state.is_terminal() {
            debug!("Cancel of terminal run {} ignored", run_id);
            return Ok(false);
        }

        rec.run.cancelled = true;
        let open: Vec<String> = rec
            .run
            .subtasks
            .iter()
            .filter(|id| rec.tasks.get(*id).map(|t| !t.status.is_terminal()).unwrap_or(false))
            .cloned()
            .collect();
        for task_id in open {
            let err = CoreError::Cancelled(format!("subtask {}", task_id));
            self.settle(&mut rec, &task_id, SubTaskStatus::Cancelled, SubTaskResult::error(&err))
                .await;
        }

        self.stop_in_flight(&mut rec, run_id);
        self.finalize(&mut rec).await;
        info!("Run {} cancelled", run_id);
        Ok(true)
    }

    /// Summaries of every run known to this process
    pub async fn list_runs(&self) -> Vec<RunSummary> {
        let cells: Vec<RunCell> = self.runs.read().values().cloned().collect();
        let mut summaries = Vec::with_capacity(cells.len());
        for cell in cells {
            let rec = cell.lock().await;
            summaries.push(RunSummary {
                run_id: rec.run.run_id.clone(),
                name: rec.run.name.clone(),
                state: rec.run.state,
                subtasks: rec.run.subtasks.len(),
                succeeded: rec.run.partial_results.values().filter(|r| r.is_success()).count(),
                created_at: rec.run.created_at,
            });
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        summaries
    }

    /// Subtasks waiting in the dispatch queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Reload persisted runs after a restart
    ///
    /// Subtasks left Dispatching or Running go back to Pending: no slot or
    /// agent claim survives a restart. Returns how many live runs were resumed.
    pub async fn recover(self: &Arc<Self>) -> CoreResult<usize> {
        let entries = self.router.scan(&StructuredFilter::domain(RUN_DOMAIN)).await?;
        let mut resumed = 0;

        for entry in entries {
            let run: SwarmRun = match entry.payload.as_json().map(|v| serde_json::from_value(v.clone())) {
                Some(Ok(run)) => run,
                Some(Err(e)) => {
                    warn!("Skipping unreadable run record {}: {}", entry.key, e);
                    continue;
                }
                None => continue,
            };
            if self.runs.read().contains_key(&run.run_id) {
                continue;
            }

            let run_id = run.run_id.clone();
            let tasks = self.load_tasks(&run_id).await?;
            if let Some(max_seq) = tasks.values().map(|t| t.seq).max() {
                self.seq.fetch_max(max_seq + 1, Ordering::Relaxed);
            }

            let terminal = run.state.is_terminal();
            let deadline = run.deadline;
            let cell: RunCell = Arc::new(Mutex::new(RunRecord::new(run, tasks)));
            self.runs.write().insert(run_id.clone(), Arc::clone(&cell));
            if terminal {
                continue;
            }

            {
                let mut rec = cell.lock().await;
                let missing = rec.run.subtasks.iter().filter(|id| !rec.tasks.contains_key(*id)).count();
                if missing > 0 {
                    warn!("Run {} is missing {} subtask records", run_id, missing);
                }

                for id in rec.run.subtasks.clone() {
                    let Some(task) = rec.tasks.get_mut(&id) else {
                        continue;
                    };
                    if matches!(task.status, SubTaskStatus::Dispatching | SubTaskStatus::Running) {
                        task.status = SubTaskStatus::Pending;
                        task.assigned_agent = None;
                        task.updated_at = Utc::now();
                        let snapshot = task.clone();
                        self.save_task(&snapshot).await;
                    }
                    if let Some(task) = rec.tasks.get(&id) {
                        if task.status == SubTaskStatus::Pending {
                            self.enqueue(task, None);
                        }
                    }
                }

                if rec.run.state != RunState::Running {
                    self.transition(&mut rec, RunState::Running).await;
                }
                if rec.all_terminal() {
                    self.finalize(&mut rec).await;
                }
            }

            self.spawn_deadline(&cell, &run_id, deadline).await;
            info!("Recovered run {}", run_id);
            resumed += 1;
        }

        self.wake.notify_one();
        Ok(resumed)
    }

    /// Stop dispatching and suspend live runs
    ///
    /// In-flight subtasks are stopped, their slots released and their records
    /// put back to Pending, so `recover` in the next process resumes them.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let cells: Vec<RunCell> = self.runs.read().values().cloned().collect();
        let mut suspended = 0;
        for cell in cells {
            let mut rec = cell.lock().await;
            if rec.run.state.is_terminal() {
                continue;
            }
            let run_id = rec.run.run_id.clone();
            self.stop_in_flight(&mut rec, &run_id);

            for id in rec.run.subtasks.clone() {
                let Some(task) = rec.tasks.get_mut(&id) else {
                    continue;
                };
                if matches!(task.status, SubTaskStatus::Dispatching | SubTaskStatus::Running) {
                    task.status = SubTaskStatus::Pending;
                    task.assigned_agent = None;
                    task.updated_at = Utc::now();
                    let snapshot = task.clone();
                    self.save_task(&snapshot).await;
                }
            }
            suspended += 1;
        }

        self.queue.clear();
        self.wake.notify_one();
        info!("Swarm coordinator stopped ({} live runs suspended)", suspended);
    }

    // ============ Dispatch ============

    async fn dispatch_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let available = self.agents.available();
        info!("Swarm dispatcher started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.dispatch_ready().await;

            let next_wake = [self.queue.next_ready_at(), self.agents.next_recovery_at()]
                .into_iter()
                .flatten()
                .min();
            let sleep = async move {
                match next_wake {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = available.notified() => {}
                _ = sleep => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("Swarm dispatcher stopped");
    }

    /// Hand every ready subtask to an agent, or leave it queued
    async fn dispatch_ready(self: &Arc<Self>) {
        let items = self.queue.drain_ready(Instant::now());
        if items.is_empty() {
            return;
        }

        // Capabilities with no free agent in this pass
        let mut starved: HashSet<String> = HashSet::new();

        for item in items {
            if starved.contains(&item.capability) {
                self.queue.push(item);
                continue;
            }
            let Some(cell) = self.run_cell(&item.run_id) else {
                continue;
            };
            let mut rec = cell.lock().await;
            if rec.run.state.is_terminal() {
                continue;
            }

            let (status, deadline) = match rec.tasks.get(&item.task_id) {
                Some(task) => (task.status, task.deadline),
                None => continue,
            };
            if status != SubTaskStatus::Pending {
                continue;
            }

            if Utc::now() >= deadline {
                let err = CoreError::TaskTimeout(format!("subtask {} never dispatched", item.task_id));
                self.settle(&mut rec, &item.task_id, SubTaskStatus::Failed, SubTaskResult::error(&err))
                    .await;
                if rec.all_terminal() {
                    self.finalize(&mut rec).await;
                }
                continue;
            }

            let Some(lease) = self.agents.claim(&item.capability, &item.task_id) else {
                debug!("No free agent for {}, {} stays queued", item.capability, item.task_id);
                starved.insert(item.capability.clone());
                self.queue.push(item);
                continue;
            };

            let Some(task) = rec.tasks.get_mut(&item.task_id) else {
                continue;
            };
            task.status = SubTaskStatus::Dispatching;
            task.attempt_count += 1;
            task.assigned_agent = Some(lease.agent_id.clone());
            task.updated_at = Utc::now();
            let snapshot = task.clone();
            self.save_task(&snapshot).await;

            let request = TaskRequest {
                run_id: item.run_id.clone(),
                task_id: item.task_id.clone(),
                capability: item.capability.clone(),
                payload: snapshot.payload.clone(),
                attempt: snapshot.attempt_count,
            };
            let cancel_rx = rec.cancel_tx.subscribe();
            drop(rec);

            debug!(
                "Dispatched {} to {} (attempt {})",
                request.task_id, lease.agent_id, request.attempt
            );
            let this = Arc::clone(self);
            tokio::spawn(async move { this.execute_subtask(lease, request, deadline, cancel_rx).await });
        }
    }

    /// Run one dispatched subtask to an outcome
    async fn execute_subtask(
        self: Arc<Self>,
        lease: AgentLease,
        request: TaskRequest,
        deadline: DateTime<Utc>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let provider = lease.handler.provider().to_string();
        let deadline_at = instant_for(deadline);
        let acquire_timeout = self
            .config
            .key_acquire_timeout
            .min(deadline_at.saturating_duration_since(tokio::time::Instant::now()));

        let acquired = tokio::select! {
            result = self.keys.acquire(&provider, &lease.agent_id, acquire_timeout) => result,
            _ = cancelled(&mut cancel_rx) => {
                self.abandon(&lease, &request);
                return;
            }
        };

        let slot = match acquired {
            Ok(slot) => slot,
            Err(e) => {
                debug!("Key acquisition for {} failed: {}", request.task_id, e);
                self.fail_attempt(&lease, &request, e, None).await;
                return;
            }
        };

        if !self.mark_running(&request, &slot).await {
            self.keys.release(&slot);
            self.abandon(&lease, &request);
            return;
        }

        let called = tokio::select! {
            result = tokio::time::timeout_at(deadline_at, lease.handler.execute(&request, &slot)) => Some(result),
            _ = cancelled(&mut cancel_rx) => None,
        };

        match called {
            None => {
                self.release_slot(&request, &slot).await;
                self.abandon(&lease, &request);
            }
            Some(Ok(Ok(output))) => {
                self.keys.report(&slot, true);
                self.release_slot(&request, &slot).await;
                self.complete(&lease, &request, output).await;
            }
            Some(Ok(Err(provider_err))) => {
                if provider_err.class.counts_against_slot() {
                    self.keys.report(&slot, false);
                }
                self.release_slot(&request, &slot).await;
                let class = provider_err.class;
                self.fail_attempt(&lease, &request, CoreError::Provider(provider_err.to_string()), Some(class))
                    .await;
            }
            Some(Err(_)) => {
                self.release_slot(&request, &slot).await;
                let err = CoreError::TaskTimeout(format!("subtask {} exceeded its deadline", request.task_id));
                self.fail_attempt(&lease, &request, err, None).await;
            }
        }
    }

    async fn mark_running(&self, request: &TaskRequest, slot: &SlotHandle) -> bool {
        let Some(cell) = self.run_cell(&request.run_id) else {
            return false;
        };
        let mut rec = cell.lock().await;
        if rec.run.state.is_terminal() {
            return false;
        }
        let Some(task) = rec.tasks.get_mut(&request.task_id) else {
            return false;
        };
        if task.status != SubTaskStatus::Dispatching {
            return false;
        }

        task.status = SubTaskStatus::Running;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        rec.slots.insert(request.task_id.clone(), slot.clone());
        self.save_task(&snapshot).await;
        true
    }

    async fn complete(&self, lease: &AgentLease, request: &TaskRequest, output: TaskOutput) {
        let applied = match self.run_cell(&request.run_id) {
            Some(cell) => {
                let mut rec = cell.lock().await;
                let running = !rec.run.state.is_terminal()
                    && rec
                        .tasks
                        .get(&request.task_id)
                        .map(|t| t.status == SubTaskStatus::Running)
                        .unwrap_or(false);
                if running {
                    let result = SubTaskResult::Success {
                        value: output.value,
                        confidence: output.confidence,
                    };
                    self.settle(&mut rec, &request.task_id, SubTaskStatus::Succeeded, result)
                        .await;
                    if rec.all_terminal() {
                        self.finalize(&mut rec).await;
                    }
                }
                running
            }
            None => false,
        };

        let outcome = if applied {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Aborted
        };
        self.agents
            .finish(&lease.agent_id, &request.task_id, &request.capability, outcome);
    }

    /// Requeue a failed attempt when allowed, otherwise fail the subtask
    async fn fail_attempt(&self, lease: &AgentLease, request: &TaskRequest, err: CoreError, class: Option<ErrorClass>) {
        let (retryable, mut outcome) = match &err {
            CoreError::KeyExhausted { .. } | CoreError::ProviderCircuitOpen(_) => (true, TaskOutcome::Aborted),
            CoreError::Provider(_) => (
                class.map(|c| c.is_retryable()).unwrap_or(false),
                TaskOutcome::Failed,
            ),
            _ => (false, TaskOutcome::Failed),
        };

        if let Some(cell) = self.run_cell(&request.run_id) {
            let mut rec = cell.lock().await;
            let live = !rec.run.state.is_terminal()
                && rec
                    .tasks
                    .get(&request.task_id)
                    .map(|t| matches!(t.status, SubTaskStatus::Dispatching | SubTaskStatus::Running))
                    .unwrap_or(false);

            if !live {
                outcome = TaskOutcome::Aborted;
            } else {
                self.retry_or_fail(&mut rec, &request.task_id, err, retryable).await;
            }
        }

        self.agents
            .finish(&lease.agent_id, &request.task_id, &request.capability, outcome);
    }

    async fn retry_or_fail(&self, rec: &mut RunRecord, task_id: &str, err: CoreError, retryable: bool) {
        let Some(task) = rec.tasks.get_mut(task_id) else {
            return;
        };
        let now = Utc::now();
        let expired = now >= task.deadline;

        if retryable && !expired && task.attempt_count < self.config.max_attempts {
            let delay = self.config.retry.delay_for_attempt(task.attempt_count.saturating_sub(1));
            task.status = SubTaskStatus::Pending;
            task.assigned_agent = None;
            task.updated_at = now;
            let snapshot = task.clone();
            self.save_task(&snapshot).await;
            self.enqueue(&snapshot, Some(Instant::now() + delay));

            info!(
                "Subtask {} requeued after attempt {} ({}), retry in {:?}",
                task_id, snapshot.attempt_count, err, delay
            );
            self.wake.notify_one();
            return;
        }

        let err = if expired {
            CoreError::TaskTimeout(format!("subtask {} deadline elapsed", task_id))
        } else {
            err
        };
        warn!("Subtask {} failed: {}", task_id, err);
        self.settle(rec, task_id, SubTaskStatus::Failed, SubTaskResult::error(&err))
            .await;
        if rec.all_terminal() {
            self.finalize(rec).await;
        }
    }

    fn abandon(&self, lease: &AgentLease, request: &TaskRequest) {
        debug!("Subtask {} abandoned by {}", request.task_id, lease.agent_id);
        self.agents
            .finish(&lease.agent_id, &request.task_id, &request.capability, TaskOutcome::Aborted);
    }

    async fn release_slot(&self, request: &TaskRequest, slot: &SlotHandle) {
        if let Some(cell) = self.run_cell(&request.run_id) {
            cell.lock().await.slots.remove(&request.task_id);
        }
        self.keys.release(slot);
    }

    // ============ Run state ============

    /// Signal in-flight subtasks to stop and release their slots
    fn stop_in_flight(&self, rec: &mut RunRecord, run_id: &str) {
        rec.cancel_tx.send_replace(true);
        for (_, slot) in rec.slots.drain() {
            self.keys.release(&slot);
        }
        let dropped = self.queue.remove_run(run_id);
        if dropped > 0 {
            debug!("Dropped {} queued subtasks of {}", dropped, run_id);
        }
    }

    /// Give a subtask its terminal status and result
    async fn settle(&self, rec: &mut RunRecord, task_id: &str, status: SubTaskStatus, result: SubTaskResult) {
        let Some(task) = rec.tasks.get_mut(task_id) else {
            return;
        };
        task.status = status;
        task.result = Some(result.clone());
        task.updated_at = Utc::now();
        let snapshot = task.clone();

        rec.run.partial_results.insert(task_id.to_string(), result);
        rec.run.updated_at = Utc::now();
        self.save_task(&snapshot).await;
        self.save_run(&rec.run).await;
    }

    async fn transition(&self, rec: &mut RunRecord, state: RunState) {
        debug!("Run {}: {:?} -> {:?}", rec.run.run_id, rec.run.state, state);
        rec.run.state = state;
        rec.run.updated_at = Utc::now();
        self.save_run(&rec.run).await;
        rec.state_tx.send_replace(state);
    }

    /// Aggregating -> terminal
    async fn finalize(&self, rec: &mut RunRecord) {
        if rec.run.state.is_terminal() {
            return;
        }
        self.transition(rec, RunState::Aggregating).await;

        let results: Vec<(String, Option<&SubTaskResult>)> = rec
            .run
            .subtasks
            .iter()
            .map(|id| (id.clone(), rec.run.partial_results.get(id)))
            .collect();
        let verdict = aggregate(rec.run.aggregation_rule, &results);

        rec.run.selected = verdict.selected;
        rec.run.error = verdict.error;
        let run_id = rec.run.run_id.clone();
        self.queue.remove_run(&run_id);
        rec.cancel_tx.send_replace(true);
        self.transition(rec, verdict.state).await;

        info!(
            "Run {} finished {:?} ({}/{} succeeded)",
            run_id,
            verdict.state,
            rec.run.partial_results.values().filter(|r| r.is_success()).count(),
            rec.run.subtasks.len()
        );
    }

    async fn expire_run(&self, run_id: &str) {
        let Some(cell) = self.run_cell(run_id) else {
            return;
        };
        let mut rec = cell.lock().await;
        if rec.run.state.is_terminal() {
            return;
        }

        warn!("Run {} deadline elapsed", run_id);
        let open: Vec<String> = rec
            .run
            .subtasks
            .iter()
            .filter(|id| rec.tasks.get(*id).map(|t| !t.status.is_terminal()).unwrap_or(false))
            .cloned()
            .collect();
        for task_id in open {
            let err = CoreError::TaskTimeout(format!("subtask {} run deadline elapsed", task_id));
            self.settle(&mut rec, &task_id, SubTaskStatus::Failed, SubTaskResult::error(&err))
                .await;
        }

        self.stop_in_flight(&mut rec, run_id);
        self.finalize(&mut rec).await;
    }

    async fn spawn_deadline(self: &Arc<Self>, cell: &RunCell, run_id: &str, deadline: DateTime<Utc>) {
        let mut state_rx = cell.lock().await.state_tx.subscribe();
        let deadline_at = instant_for(deadline);
        let weak = Arc::downgrade(self);
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            let finished = async {
                let _ = state_rx.wait_for(|state| state.is_terminal()).await;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline_at) => {}
                _ = finished => return,
            }
            if let Some(this) = weak.upgrade() {
                this.expire_run(&run_id).await;
            }
        });
    }

    fn enqueue(&self, task: &SubTask, not_before: Option<Instant>) {
        self.queue.push(QueueItem {
            run_id: task.parent_run_id.clone(),
            task_id: task.task_id.clone(),
            capability: task.required_capability.clone(),
            priority: task.priority,
            seq: task.seq,
            not_before,
        });
    }

    fn run_cell(&self, run_id: &str) -> Option<RunCell> {
        self.runs.read().get(run_id).cloned()
    }

    // ============ Persistence ============

    async fn persist_run(&self, run: &SwarmRun) -> CoreResult<()> {
        let value = MemoryValue::json(serde_json::to_value(run)?, RUN_DOMAIN).with_entity(&run.run_id);
        self.router
            .put(&run_key(&run.run_id), value, &TierHint::durable())
            .await?;
        Ok(())
    }

    async fn persist_task(&self, task: &SubTask) -> CoreResult<()> {
        let value = MemoryValue::json(serde_json::to_value(task)?, TASK_DOMAIN).with_entity(&task.parent_run_id);
        self.router
            .put(&task_key(&task.parent_run_id, &task.task_id), value, &TierHint::durable())
            .await?;
        Ok(())
    }

    async fn save_run(&self, run: &SwarmRun) {
        if let Err(e) = self.persist_run(run).await {
            warn!("Failed to persist run {}: {}", run.run_id, e);
        }
    }

    async fn save_task(&self, task: &SubTask) {
        if let Err(e) = self.persist_task(task).await {
            warn!("Failed to persist subtask {}: {}", task.task_id, e);
        }
    }

    async fn load_run(&self, run_id: &str) -> CoreResult<Option<(SwarmRun, HashMap<String, SubTask>)>> {
        let entry = match self.router.get(&run_key(run_id), &TierHint::default().without_promotion()).await {
            Ok((entry, _)) => entry,
            Err(CoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(value) = entry.payload.as_json() else {
            return Ok(None);
        };
        let run: SwarmRun = serde_json::from_value(value.clone())?;
        let tasks = self.load_tasks(run_id).await?;
        Ok(Some((run, tasks)))
    }

    async fn load_tasks(&self, run_id: &str) -> CoreResult<HashMap<String, SubTask>> {
        let filter = StructuredFilter::domain(TASK_DOMAIN).with_prefix(&task_prefix(run_id));
        let mut tasks = HashMap::new();
        for entry in self.router.scan(&filter).await? {
            let Some(value) = entry.payload.as_json() else {
                continue;
            };
            match serde_json::from_value::<SubTask>(value.clone()) {
                Ok(task) => {
                    tasks.insert(task.task_id.clone(), task);
                }
                Err(e) => warn!("Skipping unreadable subtask record {}: {}", entry.key, e),
            }
        }
        Ok(tasks)
    }
}

/// Saturates at `FAR_FUTURE` for deadlines the monotonic clock cannot represent
fn instant_for(deadline: DateTime<Utc>) -> tokio::time::Instant {
    let remaining = deadline
        .signed_duration_since(Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(FAR_FUTURE);
    let now = tokio::time::Instant::now();
    now.checked_add(remaining).unwrap_or(now)
}

/// Resolves once the run's cancel flag is raised
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|c| *c).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_pool::{AgentPoolConfig, CapabilityHandler, CapabilityRegistry};
    use crate::circuit::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use crate::config::ProviderCredential;
    use crate::retry::ProviderError;
    use crate::router::{RouterConfig, TierBackends};
    use crate::tiers::{CacheTier, StructuredTier, VectorTier};
    use async_trait::async_trait;
    use serde_json::json;

    /// Fails when the payload says so, otherwise echoes it
    struct ScriptedHandler;

    #[async_trait]
    impl CapabilityHandler for ScriptedHandler {
        fn provider(&self) -> &str {
            "openai"
        }

        async fn execute(&self, request: &TaskRequest, _slot: &SlotHandle) -> Result<TaskOutput, ProviderError> {
            if let Some(ms) = request.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if request.payload.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
                return Err(ProviderError::fatal("invalid request"));
            }
            let confidence = request
                .payload
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0) as f32;
            Ok(TaskOutput::new(request.payload.clone()).with_confidence(confidence))
        }
    }

    fn router() -> Arc<MemoryRouter> {
        let backends = TierBackends {
            cache: Arc::new(CacheTier::new(1000, Duration::from_secs(60))),
            vector: Arc::new(VectorTier::new()),
            structured: Arc::new(StructuredTier::open_in_memory().unwrap()),
            archival: Arc::new(StructuredTier::open_in_memory().unwrap()),
        };
        Arc::new(MemoryRouter::new(
            &RouterConfig::default(),
            backends,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        ))
    }

    fn coordinator(router: Arc<MemoryRouter>, agents: usize, slots: usize) -> Arc<SwarmCoordinator> {
        let registry = CapabilityRegistry::new().with("analyze", Arc::new(ScriptedHandler));
        let pool = Arc::new(AgentPool::new(AgentPoolConfig::default()));
        for i in 0..agents {
            pool.add_agent(&format!("agent-{}", i), &["analyze"], &registry).unwrap();
        }
        let keys = Arc::new(VirtualKeyPool::new(
            &[ProviderCredential {
                provider: "openai".to_string(),
                slot_count: slots,
                max_concurrent_per_slot: 1,
            }],
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        ));
        let config = CoordinatorConfig {
            key_acquire_timeout: Duration::from_secs(2),
            retry: RetryPolicy::immediate(),
            ..Default::default()
        };
        SwarmCoordinator::new(config, router, pool, keys)
    }

    fn three_with_one_failing(rule: AggregationRule) -> TaskSpec {
        TaskSpec::new("analysis", rule)
            .subtask("analyze", json!({"n": 1}))
            .subtask("analyze", json!({"n": 2, "fail": true}))
            .subtask("analyze", json!({"n": 3}))
    }

    #[tokio::test]
    async fn test_require_all_fails_on_one_failure() {
        let coord = coordinator(router(), 3, 3);
        coord.start();

        let run_id = coord.submit(three_with_one_failing(AggregationRule::RequireAll)).await.unwrap();
        let status = coord.wait(&run_id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.successes(), 2);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_majority_is_partial_with_two_results() {
        let coord = coordinator(router(), 3, 3);
        coord.start();

        let run_id = coord
            .submit(three_with_one_failing(AggregationRule::BestEffortMajority))
            .await
            .unwrap();
        let status = coord.wait(&run_id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(status.state, RunState::Partial);
        assert_eq!(status.successes(), 2);
        assert_eq!(status.partial_results.len(), 3);
    }

    #[tokio::test]
    async fn test_highest_confidence_selects_result() {
        let coord = coordinator(router(), 2, 2);
        coord.start();

        let spec = TaskSpec::new("vote", AggregationRule::HighestConfidence)
            .subtask("analyze", json!({"answer": "a", "confidence": 0.3}))
            .subtask("analyze", json!({"answer": "b", "confidence": 0.8}));
        let run_id = coord.submit(spec).await.unwrap();
        let status = coord.wait(&run_id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(status.state, RunState::Completed);
        match status.selected_result() {
            Some(SubTaskResult::Success { value, .. }) => assert_eq!(value["answer"], "b"),
            other => panic!("unexpected selection: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_capability_rejected_at_submit() {
        let coord = coordinator(router(), 1, 1);
        let spec = TaskSpec::new("x", AggregationRule::RequireAll).subtask("translate", json!({}));
        assert!(matches!(
            coord.submit(spec).await,
            Err(CoreError::AgentCapabilityMismatch(c)) if c == "translate"
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_rejected_at_submit() {
        let coord = coordinator(router(), 1, 1);
        let spec = TaskSpec::new("forever", AggregationRule::RequireAll)
            .subtask("analyze", json!({}))
            .with_deadline(Duration::from_secs(1 << 43));
        assert!(matches!(coord.submit(spec).await, Err(CoreError::InvalidTask(_))));
        assert!(coord.list_runs().await.is_empty());
    }

    #[test]
    fn test_instant_for_saturates_distant_deadlines() {
        let far = Utc::now() + chrono::Duration::days(365 * 1000);
        let at = instant_for(far);
        assert!(at.saturating_duration_since(tokio::time::Instant::now()) <= FAR_FUTURE);

        let past = Utc::now() - chrono::Duration::seconds(5);
        assert!(instant_for(past) <= tokio::time::Instant::now());
    }

    #[tokio::test]
    async fn test_deadline_fails_running_subtasks() {
        let coord = coordinator(router(), 1, 1);
        coord.start();

        let spec = TaskSpec::new("slow", AggregationRule::RequireAll)
            .subtask("analyze", json!({"sleep_ms": 5_000}))
            .with_deadline(Duration::from_millis(100));
        let run_id = coord.submit(spec).await.unwrap();
        let status = coord.wait(&run_id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(status.state, RunState::Failed);
        let result = status.partial_results.values().next().unwrap();
        assert!(matches!(result, SubTaskResult::Error { code, .. } if code == "task_timeout"));

        // The slot was released
        assert_eq!(coord.keys.stats()[0].held, 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let coord = coordinator(router(), 1, 1);
        coord.start();

        let spec = TaskSpec::new("slow", AggregationRule::RequireAll)
            .subtask("analyze", json!({"sleep_ms": 5_000}))
            .subtask("analyze", json!({"sleep_ms": 5_000}));
        let run_id = coord.submit(spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coord.cancel(&run_id).await.unwrap());
        assert!(!coord.cancel(&run_id).await.unwrap());

        let status = coord.status(&run_id).await.unwrap();
        assert!(status.cancelled);
        assert!(status.state.is_terminal());
        assert!(status
            .subtasks
            .iter()
            .all(|t| t.status == SubTaskStatus::Cancelled));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.keys.stats()[0].held, 0);
        assert!(matches!(coord.cancel("missing").await, Err(CoreError::UnknownRun(_))));
    }

    #[tokio::test]
    async fn test_recover_requeues_in_flight_subtasks() {
        let router = router();

        let first = coordinator(Arc::clone(&router), 1, 1);
        first.start();
        let spec = TaskSpec::new("resumable", AggregationRule::RequireAll)
            .subtask("analyze", json!({"sleep_ms": 200}));
        let run_id = first.submit(spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.shutdown().await;

        let persisted = first.status(&run_id).await.unwrap();
        assert_eq!(persisted.subtasks[0].status, SubTaskStatus::Pending);

        // A fresh coordinator over the same storage picks the run up
        let second = coordinator(router, 1, 1);
        second.start();
        assert_eq!(second.recover().await.unwrap(), 1);

        let status = second.wait(&run_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.subtasks[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_refused() {
        let coord = coordinator(router(), 1, 1);
        coord.shutdown().await;
        let spec = TaskSpec::new("late", AggregationRule::RequireAll).subtask("analyze", json!({}));
        assert!(matches!(coord.submit(spec).await, Err(CoreError::ShuttingDown)));
    }
}
