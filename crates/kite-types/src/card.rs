use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{is_plausible_email, Priority, StateTransitionError, ValidationError};

/// Separator that starts the execution error block inside a card description.
pub const ERROR_TRAILER_MARKER: &str = "\n\n[execution error] ";
/// Upper bound on the error text kept in a description trailer.
pub const MAX_ERROR_TRAILER_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    SendEmail,
    CreateTask,
    FollowUp,
    Research,
    ScheduleCall,
}

string_enum!(CardType, "card_type", {
    SendEmail => "send_email",
    CreateTask => "create_task",
    FollowUp => "follow_up",
    Research => "research",
    ScheduleCall => "schedule_call",
});

impl CardType {
    /// Card types whose execution leaves the system; never auto-approved.
    pub fn requires_human_approval(self) -> bool {
        matches!(self, Self::SendEmail)
    }
}

/// Approval lifecycle of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CardState {
    #[default]
    Suggested,
    InReview,
    Approved,
    Executing,
    Done,
    Blocked,
    Rejected,
}

string_enum!(CardState, "card_state", {
    Suggested => "suggested",
    InReview => "in_review",
    Approved => "approved",
    Executing => "executing",
    Done => "done",
    Blocked => "blocked",
    Rejected => "rejected",
});

impl CardState {
    /// Returns true when this state can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Suggested, Self::InReview)
                | (Self::Suggested, Self::Approved)
                | (Self::Suggested, Self::Rejected)
                | (Self::InReview, Self::Approved)
                | (Self::InReview, Self::Rejected)
                | (Self::Approved, Self::Executing)
                | (Self::Executing, Self::Done)
                | (Self::Executing, Self::Blocked)
                | (Self::Blocked, Self::Approved)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StateTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StateTransitionError::Invalid {
            kind: "card_state",
            from: self.to_string(),
            to: next.to_string(),
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }

    /// States in which a human may still edit the card's content.
    pub fn is_editable(self) -> bool {
        matches!(self, Self::Suggested | Self::InReview | Self::Blocked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAction {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAction {
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpAction {
    pub subject_id: String,
    pub note: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchAction {
    pub subject_id: String,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAction {
    pub subject_id: String,
    pub purpose: String,
    #[serde(default = "default_call_minutes")]
    pub duration_minutes: u32,
}

fn default_call_minutes() -> u32 {
    30
}

/// Action payload, discriminated by card type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CardAction {
    SendEmail(EmailAction),
    CreateTask(TaskAction),
    FollowUp(FollowUpAction),
    Research(ResearchAction),
    ScheduleCall(CallAction),
}

impl CardAction {
    pub fn card_type(&self) -> CardType {
        match self {
            Self::SendEmail(_) => CardType::SendEmail,
            Self::CreateTask(_) => CardType::CreateTask,
            Self::FollowUp(_) => CardType::FollowUp,
            Self::Research(_) => CardType::Research,
            Self::ScheduleCall(_) => CardType::ScheduleCall,
        }
    }

    pub fn subject_id(&self) -> Option<&str> {
        match self {
            Self::SendEmail(email) => email.contact_id.as_deref(),
            Self::CreateTask(_) => None,
            Self::FollowUp(action) => Some(action.subject_id.as_str()),
            Self::Research(action) => Some(action.subject_id.as_str()),
            Self::ScheduleCall(action) => Some(action.subject_id.as_str()),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::SendEmail(email) => {
                if !is_plausible_email(&email.to) {
                    return Err(ValidationError::invalid(
                        "payload.to",
                        format!("'{}' is not an email address", email.to),
                    ));
                }
                require_text("payload.subject", &email.subject)?;
                let has_body = [&email.html, &email.text]
                    .into_iter()
                    .flatten()
                    .any(|body| !body.trim().is_empty());
                if !has_body {
                    return Err(ValidationError::Missing {
                        field: "payload.html or payload.text",
                    });
                }
            }
            Self::CreateTask(task) => require_text("payload.title", &task.title)?,
            Self::FollowUp(action) => {
                require_text("payload.subject_id", &action.subject_id)?;
                require_text("payload.note", &action.note)?;
            }
            Self::Research(action) => {
                require_text("payload.subject_id", &action.subject_id)?;
                require_text("payload.topic", &action.topic)?;
            }
            Self::ScheduleCall(action) => {
                require_text("payload.subject_id", &action.subject_id)?;
                require_text("payload.purpose", &action.purpose)?;
                if action.duration_minutes == 0 || action.duration_minutes > 480 {
                    return Err(ValidationError::invalid(
                        "payload.duration_minutes",
                        "must be between 1 and 480",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Missing { field });
    }
    Ok(())
}

/// Human-reviewable action proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub card_id: String,
    pub tenant_id: String,
    pub card_type: CardType,
    pub title: String,
    pub rationale: String,
    pub priority: Priority,
    pub state: CardState,
    pub action: CardAction,
    pub created_by: String,
    pub source_recommendation_id: Option<String>,
    pub description: String,
    /// Number of times the card entered `executing`.
    pub attempt: u32,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a card; validated before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCard {
    pub tenant_id: String,
    pub title: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub priority: Priority,
    pub action: CardAction,
    pub created_by: String,
    #[serde(default)]
    pub source_recommendation_id: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl NewCard {
    pub fn into_card(self, card_id: String, now: DateTime<Utc>) -> Result<Card, ValidationError> {
        crate::validate_tenant_id(&self.tenant_id)?;
        require_text("title", &self.title)?;
        require_text("created_by", &self.created_by)?;
        self.action.validate()?;
        Ok(Card {
            card_id,
            tenant_id: self.tenant_id,
            card_type: self.action.card_type(),
            title: self.title.trim().to_string(),
            rationale: self.rationale,
            priority: self.priority,
            state: CardState::Suggested,
            action: self.action,
            created_by: self.created_by,
            source_recommendation_id: self.source_recommendation_id,
            description: self.description,
            attempt: 0,
            executed_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Content edit applied by a human while the card is still editable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CardPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub action: Option<CardAction>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CardPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.rationale.is_none()
            && self.priority.is_none()
            && self.action.is_none()
            && self.description.is_none()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(title) = &self.title {
            require_text("title", title)?;
        }
        if let Some(action) = &self.action {
            action.validate()?;
        }
        Ok(())
    }

    pub fn apply(&self, card: &mut Card) {
        if let Some(title) = &self.title {
            card.title = title.trim().to_string();
        }
        if let Some(rationale) = &self.rationale {
            card.rationale = rationale.clone();
        }
        if let Some(priority) = self.priority {
            card.priority = priority;
        }
        if let Some(action) = &self.action {
            card.card_type = action.card_type();
            card.action = action.clone();
        }
        if let Some(description) = &self.description {
            card.description = description.clone();
        }
    }
}

/// Conditional state change: applied only while the stored state equals `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardTransition {
    pub from: CardState,
    pub to: CardState,
    pub description: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl CardTransition {
    pub fn new(from: CardState, to: CardState) -> Self {
        Self {
            from,
            to,
            description: None,
            executed_at: None,
        }
    }

    pub fn with_description(mut self, description: String) -> Self {
        self.description = Some(description);
        self
    }

    pub fn with_executed_at(mut self, executed_at: DateTime<Utc>) -> Self {
        self.executed_at = Some(executed_at);
        self
    }

    /// Entering `executing` counts as a new attempt.
    pub fn starts_attempt(&self) -> bool {
        self.to == CardState::Executing
    }

    pub fn apply(&self, card: &mut Card, now: DateTime<Utc>) {
        card.state = self.to;
        if self.starts_attempt() {
            card.attempt = card.attempt.saturating_add(1);
        }
        if let Some(description) = &self.description {
            card.description = description.clone();
        }
        if let Some(executed_at) = self.executed_at {
            card.executed_at = Some(executed_at);
        }
        card.updated_at = now;
    }
}

/// Returns `description` without any execution error block.
pub fn strip_error_trailer(description: &str) -> &str {
    match description.find(ERROR_TRAILER_MARKER) {
        Some(index) => &description[..index],
        None => description,
    }
}

/// Replaces any previous error block with one holding `error`.
pub fn with_error_trailer(description: &str, error: &str) -> String {
    let error = kite_core::truncate_chars(error.trim(), MAX_ERROR_TRAILER_CHARS);
    format!(
        "{}{}{}",
        strip_error_trailer(description),
        ERROR_TRAILER_MARKER,
        error
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn research_card() -> NewCard {
        NewCard {
            tenant_id: "acme".to_string(),
            title: "Look into account".to_string(),
            rationale: "volume dropped".to_string(),
            priority: Priority::High,
            action: CardAction::Research(ResearchAction {
                subject_id: "client-1".to_string(),
                topic: "order slowdown".to_string(),
            }),
            created_by: "agent".to_string(),
            source_recommendation_id: None,
            description: String::new(),
        }
    }

    #[test]
    fn unit_card_state_transitions_follow_lifecycle() {
        use CardState::*;
        assert!(Suggested.can_transition_to(InReview));
        assert!(Suggested.can_transition_to(Approved));
        assert!(InReview.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(Approved));

        assert!(!Approved.can_transition_to(Done));
        assert!(!Suggested.can_transition_to(Executing));
        assert!(!Suggested.can_transition_to(Suggested));
        for next in CardState::ALL {
            assert!(!Done.can_transition_to(*next));
            assert!(!Rejected.can_transition_to(*next));
        }
        let error = Done.ensure_transition(Approved).expect_err("terminal");
        assert_eq!(error.to_string(), "invalid card_state transition: done -> approved");
    }

    #[test]
    fn unit_card_action_serializes_as_tagged_payload() {
        let action = CardAction::FollowUp(FollowUpAction {
            subject_id: "client-1".to_string(),
            note: "check in".to_string(),
            channel: None,
            due_at: None,
        });
        let encoded = serde_json::to_value(&action).expect("encode");
        assert_eq!(encoded["type"], "follow_up");
        assert_eq!(encoded["payload"]["subject_id"], "client-1");

        let decoded: CardAction = serde_json::from_value(json!({
            "type": "send_email",
            "payload": {"to": "ops@acme.io", "subject": "Hi", "text": "Hello"}
        }))
        .expect("decode");
        assert_eq!(decoded.card_type(), CardType::SendEmail);
    }

    #[test]
    fn unit_send_email_action_requires_address_subject_and_body() {
        let mut email = EmailAction {
            to: "ops@acme.io".to_string(),
            subject: "Checking in".to_string(),
            html: None,
            text: Some("Hello".to_string()),
            contact_id: None,
        };
        assert!(CardAction::SendEmail(email.clone()).validate().is_ok());
        email.text = Some("  ".to_string());
        assert!(CardAction::SendEmail(email.clone()).validate().is_err());
        email.text = Some("Hello".to_string());
        email.to = "not-an-address".to_string();
        assert!(CardAction::SendEmail(email).validate().is_err());
    }

    #[test]
    fn functional_new_card_validates_and_starts_suggested() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        let card = research_card()
            .into_card("card_1".to_string(), now)
            .expect("valid card");
        assert_eq!(card.state, CardState::Suggested);
        assert_eq!(card.card_type, CardType::Research);
        assert_eq!(card.attempt, 0);

        let mut bad = research_card();
        bad.title = " ".to_string();
        assert!(bad.into_card("card_2".to_string(), now).is_err());
    }

    #[test]
    fn unit_transition_apply_counts_attempts_and_sets_fields() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        let mut card = research_card()
            .into_card("card_1".to_string(), now)
            .expect("valid card");
        card.state = CardState::Approved;
        CardTransition::new(CardState::Approved, CardState::Executing).apply(&mut card, now);
        assert_eq!(card.attempt, 1);
        CardTransition::new(CardState::Executing, CardState::Done)
            .with_executed_at(now)
            .with_description("ok".to_string())
            .apply(&mut card, now);
        assert_eq!(card.attempt, 1);
        assert_eq!(card.executed_at, Some(now));
        assert_eq!(card.description, "ok");
    }

    #[test]
    fn regression_error_trailer_is_replaced_not_appended() {
        let first = with_error_trailer("Reach out to client", "smtp timeout");
        let second = with_error_trailer(&first, "rate limited");
        assert_eq!(
            second,
            format!("Reach out to client{ERROR_TRAILER_MARKER}rate limited")
        );
        assert_eq!(strip_error_trailer(&second), "Reach out to client");
        assert!(!second.contains("smtp timeout"));
    }

    proptest! {
        #[test]
        fn property_error_trailer_length_is_bounded(base in ".{0,64}", errors in proptest::collection::vec(".{0,900}", 1..8)) {
            let mut description = base.clone();
            for error in &errors {
                description = with_error_trailer(&description, error);
            }
            let bound = strip_error_trailer(&base).chars().count()
                + ERROR_TRAILER_MARKER.chars().count()
                + MAX_ERROR_TRAILER_CHARS;
            prop_assert!(description.chars().count() <= bound);
        }
    }
}
