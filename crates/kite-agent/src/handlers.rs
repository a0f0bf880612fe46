//! Per-action handlers invoked by the executor once a card is `executing`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kite_core::new_id;
use kite_outbound::{OutboundEmail, OutboundGate, SendResult};
use kite_store::StoreError;
use kite_types::{Card, CardAction, CardType};
use serde::Serialize;
use thiserror::Error;

/// Handler-level failure; the card moves to `blocked` with this text in its description.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("email blocked by outbound gate ({reason}): {detail}")]
    Blocked { reason: String, detail: String },
    #[error("email send failed: {0}")]
    SendFailed(String),
    #[error("handler for {card_type} does not accept this payload")]
    PayloadMismatch { card_type: CardType },
    #[error("handler timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("handler aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutionError {
    /// True when the gate refused the send rather than the send failing.
    pub fn is_gate_block(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerReceipt {
    /// Provider message id, audit id, or local record id.
    pub reference: String,
    pub summary: String,
    pub simulated: bool,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, card: &Card) -> Result<HandlerReceipt, ExecutionError>;
}

/// Sends `send_email` cards through the outbound gate.
pub struct EmailHandler {
    gate: Arc<OutboundGate>,
}

impl EmailHandler {
    pub fn new(gate: Arc<OutboundGate>) -> Self {
        Self { gate }
    }
}

fn receipt_from_send(result: SendResult) -> Result<HandlerReceipt, ExecutionError> {
    if result.success {
        let summary = if result.simulated {
            format!(
                "email simulated ({})",
                result.reason_code.as_deref().unwrap_or("simulated")
            )
        } else {
            "email sent".to_string()
        };
        return Ok(HandlerReceipt {
            reference: result.message_id.unwrap_or(result.audit_id),
            summary,
            simulated: result.simulated,
        });
    }
    let detail = result.error.unwrap_or_default();
    if result.blocked {
        return Err(ExecutionError::Blocked {
            reason: result.reason_code.unwrap_or_default(),
            detail,
        });
    }
    Err(ExecutionError::SendFailed(detail))
}

#[async_trait]
impl ActionHandler for EmailHandler {
    async fn handle(&self, card: &Card) -> Result<HandlerReceipt, ExecutionError> {
        let CardAction::SendEmail(action) = &card.action else {
            return Err(ExecutionError::PayloadMismatch {
                card_type: card.card_type,
            });
        };
        let mut email = OutboundEmail::new(&card.tenant_id, &action.to, &action.subject)
            .for_card(&card.card_id, card.attempt);
        email.html = action.html.clone();
        email.text = action.text.clone();
        receipt_from_send(self.gate.send(email).await)
    }
}

/// Records task, follow-up, research and call cards without any external effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRecordHandler;

#[async_trait]
impl ActionHandler for LocalRecordHandler {
    async fn handle(&self, card: &Card) -> Result<HandlerReceipt, ExecutionError> {
        let (prefix, summary) = match &card.action {
            CardAction::CreateTask(task) => ("task", format!("task recorded: {}", task.title)),
            CardAction::FollowUp(action) => (
                "followup",
                format!("follow-up recorded for {}", action.subject_id),
            ),
            CardAction::Research(action) => (
                "research",
                format!("research note opened on {}: {}", action.subject_id, action.topic),
            ),
            CardAction::ScheduleCall(action) => (
                "call",
                format!(
                    "{}-minute call planned with {}",
                    action.duration_minutes, action.subject_id
                ),
            ),
            CardAction::SendEmail(_) => {
                return Err(ExecutionError::PayloadMismatch {
                    card_type: card.card_type,
                })
            }
        };
        Ok(HandlerReceipt {
            reference: new_id(prefix),
            summary,
            simulated: false,
        })
    }
}

/// One handler per action kind.
#[derive(Clone)]
pub struct HandlerRegistry {
    pub send_email: Arc<dyn ActionHandler>,
    pub create_task: Arc<dyn ActionHandler>,
    pub follow_up: Arc<dyn ActionHandler>,
    pub research: Arc<dyn ActionHandler>,
    pub schedule_call: Arc<dyn ActionHandler>,
}

impl HandlerRegistry {
    /// Email goes through `gate`; every other action is recorded locally.
    pub fn with_gate(gate: Arc<OutboundGate>) -> Self {
        let local: Arc<dyn ActionHandler> = Arc::new(LocalRecordHandler);
        Self {
            send_email: Arc::new(EmailHandler::new(gate)),
            create_task: local.clone(),
            follow_up: local.clone(),
            research: local.clone(),
            schedule_call: local,
        }
    }

    pub fn handler_for(&self, action: &CardAction) -> Arc<dyn ActionHandler> {
        match action {
            CardAction::SendEmail(_) => self.send_email.clone(),
            CardAction::CreateTask(_) => self.create_task.clone(),
            CardAction::FollowUp(_) => self.follow_up.clone(),
            CardAction::Research(_) => self.research.clone(),
            CardAction::ScheduleCall(_) => self.schedule_call.clone(),
        }
    }
}
