use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-tenant rollout stage for outbound sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutMode {
    #[default]
    DryRun,
    InternalOnly,
    LimitedLive,
    Live,
}

string_enum!(RolloutMode, "rollout_mode", {
    DryRun => "dry_run",
    InternalOnly => "internal_only",
    LimitedLive => "limited_live",
    Live => "live",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboundChannel {
    #[default]
    Email,
}

string_enum!(OutboundChannel, "channel", {
    Email => "email",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Sent,
    Simulated,
    Blocked,
    Failed,
}

string_enum!(AuditResult, "audit_result", {
    Sent => "sent",
    Simulated => "simulated",
    Blocked => "blocked",
    Failed => "failed",
});

/// Append-only record of one outbound gate decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub entry_id: String,
    pub tenant_id: String,
    pub card_id: Option<String>,
    pub channel: OutboundChannel,
    pub recipient: String,
    pub subject: String,
    pub mode_at_send: RolloutMode,
    pub result: AuditResult,
    pub reason_code: Option<String>,
    pub error: Option<String>,
    pub message_id: Option<String>,
    pub retry_after_seconds: Option<u64>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    HardBounce,
    Unsubscribed,
    Complaint,
    Manual,
}

string_enum!(SuppressionReason, "suppression_reason", {
    HardBounce => "hard_bounce",
    Unsubscribed => "unsubscribed",
    Complaint => "complaint",
    Manual => "manual",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suppression {
    pub tenant_id: String,
    /// Normalized with [`normalize_email`].
    pub email: String,
    pub reason: SuppressionReason,
    pub created_at: DateTime<Utc>,
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Returns the lowercased domain part of an address.
pub fn email_domain(raw: &str) -> Option<String> {
    let (_, domain) = raw.trim().rsplit_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// Cheap structural check: one `@`, non-empty local part, dotted domain, no spaces.
pub fn is_plausible_email(raw: &str) -> bool {
    let value = raw.trim();
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
