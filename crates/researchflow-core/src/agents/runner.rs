//! Retrying wrapper around a [`ResearchAgent`] plus the agent registry.
//!
//! Only transient error kinds are retried, with backoff
//! `base_delay * 2^retry_count`, at most `max_retries` times. The caller
//! escalates whatever comes back as an [`AgentFailure`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{AgentError, AgentResult, ResearchAgent, TaskContext};

const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Working,
    /// Last result is waiting on a human approval.
    Waiting,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count + 1`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry_count.min(16)))
    }
}

/// One finished invocation, kept in the runner's in-memory history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task: String,
    pub success: bool,
    pub retry_count: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AgentRun {
    pub result: AgentResult,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub error: AgentError,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    /// The error was transient but retries ran out.
    pub retries_exhausted: bool,
}

pub struct AgentRunner {
    agent: Arc<dyn ResearchAgent>,
    policy: RetryPolicy,
    state: Mutex<AgentState>,
    history: Mutex<VecDeque<TaskRecord>>,
}

impl AgentRunner {
    pub fn new(agent: Arc<dyn ResearchAgent>, policy: RetryPolicy) -> Self {
        Self {
            agent,
            policy,
            state: Mutex::new(AgentState::Idle),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> &str {
        self.agent.id()
    }

    pub fn handles(&self, task: &str) -> bool {
        self.agent.tasks().contains(&task)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> AgentState {
        self.state.lock().map(|s| *s).unwrap_or(AgentState::Failed)
    }

    pub fn history(&self) -> Vec<TaskRecord> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_state(&self, state: AgentState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    fn record(&self, record: TaskRecord) {
        if let Ok(mut h) = self.history.lock() {
            if h.len() == HISTORY_LIMIT {
                h.pop_front();
            }
            h.push_back(record);
        }
    }

    pub async fn run(&self, task: &str, context: &TaskContext) -> Result<AgentRun, AgentFailure> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut retry_count = 0u32;
        self.set_state(AgentState::Working);

        loop {
            match self.agent.execute_task(task, context).await {
                Ok(result) => {
                    let duration_ms = clock.elapsed().as_millis() as u64;
                    self.set_state(if result.requires_approval() {
                        AgentState::Waiting
                    } else {
                        AgentState::Idle
                    });
                    self.record(TaskRecord {
                        task: task.to_string(),
                        success: true,
                        retry_count,
                        duration_ms,
                        error: None,
                        started_at,
                    });
                    return Ok(AgentRun {
                        result,
                        retry_count,
                        duration_ms,
                        started_at,
                    });
                }
                Err(error) if error.is_transient() && retry_count < self.policy.max_retries => {
                    let delay = self.policy.backoff(retry_count);
                    retry_count += 1;
                    tracing::warn!(
                        "[AgentRunner] {}/{} failed with {} (retry {}/{} in {:?})",
                        self.id(),
                        task,
                        error.kind,
                        retry_count,
                        self.policy.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    let duration_ms = clock.elapsed().as_millis() as u64;
                    let retries_exhausted = error.is_transient();
                    tracing::error!(
                        "[AgentRunner] {}/{} failed after {} retries: {}",
                        self.id(),
                        task,
                        retry_count,
                        error
                    );
                    self.set_state(AgentState::Failed);
                    self.record(TaskRecord {
                        task: task.to_string(),
                        success: false,
                        retry_count,
                        duration_ms,
                        error: Some(error.to_string()),
                        started_at,
                    });
                    return Err(AgentFailure {
                        error,
                        retry_count,
                        duration_ms,
                        started_at,
                        retries_exhausted,
                    });
                }
            }
        }
    }
}

/// Agents by id, each behind its own runner.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    runners: HashMap<String, Arc<AgentRunner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn ResearchAgent>, policy: RetryPolicy) {
        let id = agent.id().to_string();
        self.runners.insert(id, Arc::new(AgentRunner::new(agent, policy)));
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentRunner>> {
        self.runners.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runners.keys().cloned().collect();
        ids.sort();
        ids
    }
}
