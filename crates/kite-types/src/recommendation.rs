use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CardAction, CardType, StateTransitionError};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

string_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl Priority {
    /// Buckets a confidence score: `>=0.9` critical, `>=0.7` high, `>=0.5` medium.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.9 {
            Self::Critical
        } else if confidence >= 0.7 {
            Self::High
        } else if confidence >= 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    #[default]
    Pending,
    Applied,
    Dismissed,
}

string_enum!(RecommendationStatus, "recommendation_status", {
    Pending => "pending",
    Applied => "applied",
    Dismissed => "dismissed",
});

impl RecommendationStatus {
    /// `applied -> pending` releases a claim whose card could not be written.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Applied)
                | (Self::Pending, Self::Dismissed)
                | (Self::Applied, Self::Pending)
        )
    }

    pub fn ensure_transition(self, next: Self) -> Result<(), StateTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StateTransitionError::Invalid {
            kind: "recommendation_status",
            from: self.to_string(),
            to: next.to_string(),
        })
    }
}

/// `(tenant, action_type, subject)` triple that throttles duplicate proposals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub tenant_id: String,
    pub action_type: CardType,
    pub subject_id: String,
}

impl fmt::Display for CooldownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.tenant_id, self.action_type, self.subject_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub recommendation_id: String,
    pub pattern_id: String,
    pub tenant_id: String,
    pub action_type: CardType,
    pub subject_id: String,
    pub priority: Priority,
    pub confidence: f64,
    pub title: String,
    pub rationale: String,
    pub action: CardAction,
    pub status: RecommendationStatus,
    pub cooldown_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
