use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{validate_tenant_id, ValidationError};

/// Subject key used for events that do not name a subject entity.
pub const TENANT_SUBJECT: &str = "tenant";

/// Closed catalog of operational event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OrderCreated,
    OrderCompleted,
    DealCreated,
    DealWon,
    DealLost,
    QuoteSent,
    QuoteAccepted,
    QuoteRejected,
    EmailSent,
    EmailOpened,
    EmailClicked,
    EmailReplied,
    EmailBounced,
    ContactActivity,
    MeetingHeld,
    FeedbackReceived,
    SlaStarted,
    SlaResolved,
    CardCreated,
    CardExecuted,
    CardFailed,
    CardBlocked,
    AgentRunCompleted,
}

string_enum!(EventType, "event_type", {
    OrderCreated => "order_created",
    OrderCompleted => "order_completed",
    DealCreated => "deal_created",
    DealWon => "deal_won",
    DealLost => "deal_lost",
    QuoteSent => "quote_sent",
    QuoteAccepted => "quote_accepted",
    QuoteRejected => "quote_rejected",
    EmailSent => "email_sent",
    EmailOpened => "email_opened",
    EmailClicked => "email_clicked",
    EmailReplied => "email_replied",
    EmailBounced => "email_bounced",
    ContactActivity => "contact_activity",
    MeetingHeld => "meeting_held",
    FeedbackReceived => "feedback_received",
    SlaStarted => "sla_started",
    SlaResolved => "sla_resolved",
    CardCreated => "card_created",
    CardExecuted => "card_executed",
    CardFailed => "card_failed",
    CardBlocked => "card_blocked",
    AgentRunCompleted => "agent_run_completed",
});

impl EventType {
    /// Events that represent a touchpoint with the subject.
    pub fn is_contact(self) -> bool {
        matches!(
            self,
            Self::EmailSent | Self::EmailReplied | Self::ContactActivity | Self::MeetingHeld
        )
    }

    /// Events emitted by the pipeline itself rather than by the business.
    pub fn is_pipeline_feedback(self) -> bool {
        matches!(
            self,
            Self::CardCreated
                | Self::CardExecuted
                | Self::CardFailed
                | Self::CardBlocked
                | Self::AgentRunCompleted
        )
    }
}

/// Immutable operational event. Only `processed_at` is ever set after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub tenant_id: String,
    pub event_type: EventType,
    pub subject_id: Option<String>,
    pub natural_key: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn subject_key(&self) -> &str {
        self.subject_id.as_deref().unwrap_or(TENANT_SUBJECT)
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    pub fn payload_f64(&self, field: &str) -> Option<f64> {
        self.payload.get(field).and_then(Value::as_f64)
    }

    pub fn payload_bool(&self, field: &str) -> Option<bool> {
        self.payload.get(field).and_then(Value::as_bool)
    }

    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            occurred_at: self.occurred_at,
            event_id: self.event_id.clone(),
        }
    }
}

/// Event submitted for append; the warehouse assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub tenant_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub subject_id: Option<String>,
    pub natural_key: String,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: EventType,
        natural_key: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_type,
            subject_id: None,
            natural_key: natural_key.into(),
            payload: Value::Object(Default::default()),
            occurred_at,
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_tenant_id(&self.tenant_id)?;
        if self.natural_key.trim().is_empty() {
            return Err(ValidationError::Missing {
                field: "natural_key",
            });
        }
        if matches!(self.subject_id.as_deref(), Some(subject) if subject.trim().is_empty()) {
            return Err(ValidationError::invalid("subject_id", "must not be blank"));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(ValidationError::invalid("payload", "must be a JSON object"));
        }
        Ok(())
    }

    pub fn dedup_key(&self) -> String {
        kite_core::dedup_key(&self.tenant_id, self.event_type.as_str(), &self.natural_key)
    }
}

/// Result of an idempotent append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub event_id: String,
    pub inserted: bool,
}

/// Restart position inside an ordered window scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub occurred_at: DateTime<Utc>,
    pub event_id: String,
}

impl EventCursor {
    /// Returns true when `event` sorts strictly after this cursor.
    pub fn precedes(&self, event: &Event) -> bool {
        (event.occurred_at, event.event_id.as_str()) > (self.occurred_at, self.event_id.as_str())
    }
}

/// Half-open window query `[from, to)` over one tenant's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub tenant_id: String,
    pub event_type: Option<EventType>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub unprocessed_only: bool,
    pub after: Option<EventCursor>,
    pub limit: usize,
}

impl EventQuery {
    pub const DEFAULT_PAGE_SIZE: usize = 500;

    pub fn window(tenant_id: impl Into<String>, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            event_type: None,
            from,
            to,
            unprocessed_only: false,
            after: None,
            limit: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn unprocessed(mut self) -> Self {
        self.unprocessed_only = true;
        self
    }

    pub fn page_size(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn resume_after(mut self, cursor: EventCursor) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        event.tenant_id == self.tenant_id
            && event.occurred_at >= self.from
            && event.occurred_at < self.to
            && self.event_type.map_or(true, |kind| kind == event.event_type)
            && (!self.unprocessed_only || event.processed_at.is_none())
            && self.after.as_ref().map_or(true, |cursor| cursor.precedes(event))
    }
}

/// One page of a window scan; `next_cursor` is set when more events may follow.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub next_cursor: Option<EventCursor>,
}
