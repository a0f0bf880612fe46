use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    #[default]
    Review,
    Auto,
}

string_enum!(AgentMode, "agent_mode", {
    Review => "review",
    Auto => "auto",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

string_enum!(AgentRunStatus, "agent_run_status", {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

/// One orchestrator work block for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: String,
    pub tenant_id: String,
    pub mode: AgentMode,
    pub status: AgentRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recommendations_seen: u32,
    pub cards_created: u32,
    pub cards_auto_approved: u32,
    pub cards_executed: u32,
    pub errors: Vec<String>,
    pub outcome_summary: String,
}

impl AgentRun {
    pub fn start(run_id: String, tenant_id: String, mode: AgentMode, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            tenant_id,
            mode,
            status: AgentRunStatus::Running,
            started_at: now,
            completed_at: None,
            recommendations_seen: 0,
            cards_created: 0,
            cards_auto_approved: 0,
            cards_executed: 0,
            errors: Vec::new(),
            outcome_summary: String::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Final tallies written once when a run completes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentRunCompletion {
    pub status: AgentRunStatus,
    pub recommendations_seen: u32,
    pub cards_created: u32,
    pub cards_auto_approved: u32,
    pub cards_executed: u32,
    pub errors: Vec<String>,
    pub outcome_summary: String,
}

impl AgentRunCompletion {
    pub fn apply(&self, run: &mut AgentRun, completed_at: DateTime<Utc>) {
        run.status = self.status;
        run.recommendations_seen = self.recommendations_seen;
        run.cards_created = self.cards_created;
        run.cards_auto_approved = self.cards_auto_approved;
        run.cards_executed = self.cards_executed;
        run.errors = self.errors.clone();
        run.outcome_summary = self.outcome_summary.clone();
        run.completed_at = Some(completed_at);
    }
}
