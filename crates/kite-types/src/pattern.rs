use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conditions the pattern detector can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    VolumeSpike,
    VolumeDrop,
    ContactGap,
    SentimentShift,
    SlaBreachRisk,
    LowReplyRate,
    BounceSpike,
    ExecutionFailureSpike,
}

string_enum!(PatternType, "pattern_type", {
    VolumeSpike => "volume_spike",
    VolumeDrop => "volume_drop",
    ContactGap => "contact_gap",
    SentimentShift => "sentiment_shift",
    SlaBreachRisk => "sla_breach_risk",
    LowReplyRate => "low_reply_rate",
    BounceSpike => "bounce_spike",
    ExecutionFailureSpike => "execution_failure_spike",
});

impl PatternType {
    pub fn describe(self) -> &'static str {
        match self {
            Self::VolumeSpike => "activity volume spiked above its trailing baseline",
            Self::VolumeDrop => "activity volume dropped below its trailing baseline",
            Self::ContactGap => "no contact activity within the expected interval",
            Self::SentimentShift => "response sentiment shifted",
            Self::SlaBreachRisk => "an open SLA is close to or past its deadline",
            Self::LowReplyRate => "email reply rate is low",
            Self::BounceSpike => "email bounce rate is elevated",
            Self::ExecutionFailureSpike => "card executions are failing frequently",
        }
    }
}

/// Scored observation produced by one detector for one subject and window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern_id: String,
    pub tenant_id: String,
    pub pattern_type: PatternType,
    pub subject_id: String,
    pub subject_email: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub actionable: bool,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub detected_at: DateTime<Utc>,
    /// Set once the recommender has evaluated the pattern.
    pub mapped_at: Option<DateTime<Utc>>,
}
