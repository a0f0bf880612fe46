use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Insight job cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Hourly,
    Daily,
    Weekly,
}

string_enum!(Cadence, "cadence", {
    Hourly => "hourly",
    Daily => "daily",
    Weekly => "weekly",
});

impl Cadence {
    /// Look-back used when no checkpoint exists yet.
    pub fn window_length(self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
        }
    }

    /// Default six-field cron expression (seconds first).
    pub fn default_cron(self) -> &'static str {
        match self {
            Self::Hourly => "0 0 * * * *",
            Self::Daily => "0 0 2 * * *",
            Self::Weekly => "0 0 6 * * Mon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Partial,
    Failed,
}

string_enum!(JobOutcome, "job_outcome", {
    Success => "success",
    Partial => "partial",
    Failed => "failed",
});

/// Record of one insight job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: String,
    pub tenant_id: String,
    pub cadence: Cadence,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
    pub events_processed: u64,
    pub patterns_detected: u64,
    pub recommendations_created: u64,
    pub error: Option<String>,
}
