//! Run and subtask records
//!
//! These are the persisted shapes. A `SwarmRun` lives under
//! `swarm_run/{run_id}` and each `SubTask` under `swarm_task/{run_id}/{task_id}`,
//! both in the structured tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;

pub const RUN_DOMAIN: &str = "swarm_run";
pub const TASK_DOMAIN: &str = "swarm_task";

pub fn run_key(run_id: &str) -> String {
    format!("{}/{}", RUN_DOMAIN, run_id)
}

pub fn task_key(run_id: &str, task_id: &str) -> String {
    format!("{}/{}/{}", TASK_DOMAIN, run_id, task_id)
}

pub fn task_prefix(run_id: &str) -> String {
    format!("{}/{}/", TASK_DOMAIN, run_id)
}

/// Task priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// How subtask results combine into a run outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AggregationRule {
    #[default]
    RequireAll,
    BestEffortMajority,
    HighestConfidence,
}

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Dispatching,
    Running,
    Aggregating,
    Completed,
    Partial,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Partial | RunState::Failed)
    }
}

/// Subtask lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubTaskStatus {
    Pending,
    Dispatching,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SubTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubTaskStatus::Succeeded | SubTaskStatus::Failed | SubTaskStatus::Cancelled
        )
    }
}

/// Result or error of one subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubTaskResult {
    Success { value: serde_json::Value, confidence: f32 },
    Error { code: String, message: String },
}

impl SubTaskResult {
    pub fn error(err: &CoreError) -> Self {
        SubTaskResult::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SubTaskResult::Success { .. })
    }
}

/// One unit of work inside a task submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    pub capability: String,
    pub payload: serde_json::Value,
    /// Defaults to the run priority
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

impl SubTaskSpec {
    pub fn new(capability: &str, payload: serde_json::Value) -> Self {
        Self {
            capability: capability.to_string(),
            payload,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A task submission, already split into subtasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub subtasks: Vec<SubTaskSpec>,
    #[serde(default)]
    pub aggregation_rule: AggregationRule,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Run deadline; the coordinator default applies when unset
    #[serde(default, with = "crate::config::optional_duration_ms")]
    pub deadline: Option<std::time::Duration>,
}

impl TaskSpec {
    pub fn new(name: &str, rule: AggregationRule) -> Self {
        Self {
            name: name.to_string(),
            subtasks: Vec::new(),
            aggregation_rule: rule,
            priority: TaskPriority::Normal,
            deadline: None,
        }
    }

    pub fn subtask(mut self, capability: &str, payload: serde_json::Value) -> Self {
        self.subtasks.push(SubTaskSpec::new(capability, payload));
        self
    }

    pub fn with_subtask(mut self, spec: SubTaskSpec) -> Self {
        self.subtasks.push(spec);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Persisted subtask record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub task_id: String,
    pub parent_run_id: String,
    pub required_capability: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub status: SubTaskStatus,
    pub attempt_count: u32,
    pub deadline: DateTime<Utc>,
    /// Submission order within the coordinator
    pub seq: u64,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub result: Option<SubTaskResult>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmRun {
    pub run_id: String,
    pub name: String,
    pub subtasks: Vec<String>,
    pub aggregation_rule: AggregationRule,
    pub priority: TaskPriority,
    pub state: RunState,
    pub partial_results: BTreeMap<String, SubTaskResult>,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Subtask whose result was chosen under HighestConfidence
    #[serde(default)]
    pub selected: Option<String>,
    /// Why the run did not complete cleanly
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

/// Aggregation verdict
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub state: RunState,
    pub selected: Option<String>,
    pub error: Option<String>,
}

/// Apply an aggregation rule to the subtask results of a run
///
/// `results` is in subtask order; missing results count as failures.
pub fn aggregate(rule: AggregationRule, results: &[(String, Option<&SubTaskResult>)]) -> Aggregation {
    let total = results.len();
    let successes: Vec<(&String, f32)> = results
        .iter()
        .filter_map(|(id, r)| match r {
            Some(SubTaskResult::Success { confidence, .. }) => Some((id, *confidence)),
            _ => None,
        })
        .collect();
    let succeeded = successes.len();

    let failed = |reason: String| Aggregation {
        state: RunState::Failed,
        selected: None,
        error: Some(reason),
    };

    if succeeded == 0 {
        return failed(CoreError::AggregationQuorumFailed { succeeded, total }.to_string());
    }

    match rule {
        AggregationRule::RequireAll => {
            if succeeded == total {
                Aggregation {
                    state: RunState::Completed,
                    selected: None,
                    error: None,
                }
            } else {
                failed(CoreError::AggregationQuorumFailed { succeeded, total }.to_string())
            }
        }
        AggregationRule::BestEffortMajority => {
            if succeeded == total {
                Aggregation {
                    state: RunState::Completed,
                    selected: None,
                    error: None,
                }
            } else if succeeded * 2 > total {
                Aggregation {
                    state: RunState::Partial,
                    selected: None,
                    error: None,
                }
            } else {
                failed(CoreError::AggregationQuorumFailed { succeeded, total }.to_string())
            }
        }
        AggregationRule::HighestConfidence => {
            // First in subtask order wins ties
            let mut best = successes[0];
            for candidate in &successes[1..] {
                if candidate.1 > best.1 {
                    best = *candidate;
                }
            }
            Aggregation {
                state: if succeeded == total {
                    RunState::Completed
                } else {
                    RunState::Partial
                },
                selected: Some(best.0.clone()),
                error: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(confidence: f32) -> SubTaskResult {
        SubTaskResult::Success {
            value: json!(confidence),
            confidence,
        }
    }

    fn err() -> SubTaskResult {
        SubTaskResult::Error {
            code: "provider".to_string(),
            message: "boom".to_string(),
        }
    }

    fn run(rule: AggregationRule, results: &[SubTaskResult]) -> Aggregation {
        let items: Vec<(String, Option<&SubTaskResult>)> = results
            .iter()
            .enumerate()
            .map(|(i, r)| (format!("t{}", i), Some(r)))
            .collect();
        aggregate(rule, &items)
    }

    #[test]
    fn test_require_all() {
        assert_eq!(run(AggregationRule::RequireAll, &[ok(1.0), ok(1.0)]).state, RunState::Completed);
        assert_eq!(
            run(AggregationRule::RequireAll, &[ok(1.0), ok(1.0), err()]).state,
            RunState::Failed
        );
    }

    #[test]
    fn test_best_effort_majority() {
        let r = AggregationRule::BestEffortMajority;
        assert_eq!(run(r, &[ok(1.0), ok(1.0), ok(1.0)]).state, RunState::Completed);
        assert_eq!(run(r, &[ok(1.0), ok(1.0), err()]).state, RunState::Partial);
        assert_eq!(run(r, &[ok(1.0), err(), err()]).state, RunState::Failed);
        assert_eq!(run(r, &[ok(1.0), err()]).state, RunState::Failed);
        assert_eq!(run(r, &[err(), err()]).state, RunState::Failed);
    }

    #[test]
    fn test_highest_confidence_selects_best() {
        let r = AggregationRule::HighestConfidence;
        let agg = run(r, &[ok(0.4), err(), ok(0.9)]);
        assert_eq!(agg.state, RunState::Partial);
        assert_eq!(agg.selected.as_deref(), Some("t2"));

        let agg = run(r, &[ok(0.7), ok(0.7)]);
        assert_eq!(agg.state, RunState::Completed);
        assert_eq!(agg.selected.as_deref(), Some("t0"));

        assert_eq!(run(r, &[err()]).state, RunState::Failed);
    }

    #[test]
    fn test_missing_results_count_as_failures() {
        let good = ok(1.0);
        let items = vec![("a".to_string(), Some(&good)), ("b".to_string(), None)];
        assert_eq!(aggregate(AggregationRule::RequireAll, &items).state, RunState::Failed);
    }

    #[test]
    fn test_keys() {
        assert_eq!(run_key("r1"), "swarm_run/r1");
        assert_eq!(task_key("r1", "t1"), "swarm_task/r1/t1");
        assert!(task_key("r1", "t1").starts_with(&task_prefix("r1")));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Low < TaskPriority::Normal);
    }
}
