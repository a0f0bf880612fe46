use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

/// Orchestrator cycle bounds (`[orchestrator]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pending recommendations fetched per cycle.
    pub batch_size: usize,
    pub max_cards_per_run: u32,
    /// Executes already-approved cards before creating new ones.
    pub execute_approved_first: bool,
    /// An open run older than this no longer blocks a new one.
    pub stale_run_seconds: u64,
    pub created_by: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_cards_per_run: 25,
            execute_approved_first: false,
            stale_run_seconds: 900,
            created_by: "agent".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn stale_after(&self) -> ChronoDuration {
        ChronoDuration::seconds(i64::try_from(self.stale_run_seconds).unwrap_or(i64::MAX))
    }
}

/// Action executor limits (`[executor]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub handler_timeout_ms: u64,
    /// Cards executed per `execute_approved` call.
    pub batch_limit: usize,
    /// An `executing` card untouched for this long is moved to `blocked`
    /// by the next sweep. Never shorter than the handler timeout.
    pub stale_executing_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 30_000,
            batch_limit: 25,
            stale_executing_seconds: 300,
        }
    }
}

impl ExecutorConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms.max(1))
    }

    pub fn stale_executing_after(&self) -> ChronoDuration {
        let configured =
            ChronoDuration::seconds(i64::try_from(self.stale_executing_seconds).unwrap_or(i64::MAX));
        let timeout = ChronoDuration::milliseconds(
            i64::try_from(self.handler_timeout().as_millis()).unwrap_or(i64::MAX),
        );
        configured.max(timeout)
    }
}
