//! Shared data types for the kite action pipeline.
//!
//! Every persisted entity is scoped to exactly one tenant. Polymorphic
//! families (event types, pattern types, card actions) are closed enums so
//! dispatch over them is checked exhaustively.

use thiserror::Error;

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::ValidationError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw.trim() {
                    $($text => Ok($ty::$variant),)+
                    other => Err($crate::ValidationError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

mod agent;
mod card;
mod event;
mod outbound;
mod pattern;
mod recommendation;
mod schedule;
mod tenant;

pub use agent::{AgentMode, AgentRun, AgentRunCompletion, AgentRunStatus};
pub use card::{
    strip_error_trailer, with_error_trailer, CallAction, Card, CardAction, CardPatch, CardState,
    CardTransition, CardType, EmailAction, FollowUpAction, NewCard, ResearchAction, TaskAction,
    ERROR_TRAILER_MARKER, MAX_ERROR_TRAILER_CHARS,
};
pub use event::{
    AppendOutcome, Event, EventCursor, EventPage, EventQuery, EventType, NewEvent, TENANT_SUBJECT,
};
pub use outbound::{
    email_domain, is_plausible_email, normalize_email, AuditLogEntry, AuditResult,
    OutboundChannel, RolloutMode, Suppression, SuppressionReason,
};
pub use pattern::{DetectedPattern, PatternType};
pub use recommendation::{CooldownKey, Priority, Recommendation, RecommendationStatus};
pub use schedule::{Cadence, JobOutcome, JobRun};
pub use tenant::{RateLimitSettings, TenantRegistry, TenantSettings};

/// Error returned when a lifecycle transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    #[error("invalid {kind} transition: {from} -> {to}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Error returned when input at a boundary is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Validates a tenant identifier: 1..=128 chars of `[A-Za-z0-9._-]`.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), ValidationError> {
    if tenant_id.trim().is_empty() {
        return Err(ValidationError::Missing { field: "tenant" });
    }
    if tenant_id.len() > 128 {
        return Err(ValidationError::invalid("tenant", "must be at most 128 characters"));
    }
    if !tenant_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
    {
        return Err(ValidationError::invalid(
            "tenant",
            "may only contain letters, digits, '.', '_' and '-'",
        ));
    }
    Ok(())
}
