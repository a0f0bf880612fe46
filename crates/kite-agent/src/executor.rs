//! Runs approved cards exactly once per successful completion.
//!
//! The `approved -> executing` compare-and-swap happens before any handler
//! work, so concurrent callers racing on one card see a single winner.

use std::sync::Arc;
use std::time::Duration;

use kite_core::{Clock, SystemClock};
use kite_store::{CardStore, CasOutcome, EventWarehouse, StoreError};
use kite_types::{
    strip_error_trailer, with_error_trailer, Card, CardState, CardTransition, EventType, NewEvent,
};
use serde::Serialize;
use serde_json::json;

use crate::config::ExecutorConfig;
use crate::handlers::{ExecutionError, HandlerReceipt, HandlerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Done,
    Blocked,
    /// The card was not `approved`; nothing ran.
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub card_id: String,
    pub status: ExecutionStatus,
    /// State observed or left behind by this call.
    pub state: CardState,
    pub attempt: u32,
    pub receipt: Option<HandlerReceipt>,
    pub error: Option<String>,
}

impl ExecutionReport {
    fn no_op(card_id: &str, actual: CardState) -> Self {
        Self {
            card_id: card_id.to_string(),
            status: ExecutionStatus::NoOp,
            state: actual,
            attempt: 0,
            receipt: None,
            error: None,
        }
    }
}

/// Tallies from one `execute_approved` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchExecution {
    pub reports: Vec<ExecutionReport>,
    /// Stranded `executing` cards moved to `blocked` before the sweep.
    pub recovered: Vec<ExecutionReport>,
    pub errors: Vec<String>,
}

impl BatchExecution {
    pub fn done(&self) -> usize {
        self.count(ExecutionStatus::Done)
    }

    pub fn blocked(&self) -> usize {
        self.count(ExecutionStatus::Blocked)
    }

    fn count(&self, status: ExecutionStatus) -> usize {
        self.reports
            .iter()
            .filter(|report| report.status == status)
            .count()
    }
}

pub struct ActionExecutor {
    cards: Arc<dyn CardStore>,
    events: Arc<dyn EventWarehouse>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    handler_timeout: Duration,
    stale_executing: chrono::Duration,
    batch_limit: usize,
}

impl ActionExecutor {
    pub fn new(
        cards: Arc<dyn CardStore>,
        events: Arc<dyn EventWarehouse>,
        handlers: HandlerRegistry,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            cards,
            events,
            handlers,
            clock: Arc::new(SystemClock),
            handler_timeout: config.handler_timeout(),
            stale_executing: config.stale_executing_after(),
            batch_limit: config.batch_limit.max(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Claims and runs one card.
    ///
    /// Losing the claim is not an error: the report comes back as
    /// [`ExecutionStatus::NoOp`] with the state the card was found in. Store
    /// errors are returned only when the claim itself could not be attempted
    /// or the final state could not be written.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn execute(&self, tenant_id: &str, card_id: &str) -> Result<ExecutionReport, StoreError> {
        let claim = CardTransition::new(CardState::Approved, CardState::Executing);
        let card = match self.cards.transition_card(tenant_id, card_id, claim).await? {
            CasOutcome::Applied(card) => card,
            CasOutcome::Conflict { actual } => {
                tracing::debug!(tenant_id, card_id, state = %actual, "card not approved; skipping");
                return Ok(ExecutionReport::no_op(card_id, actual));
            }
        };
        tracing::info!(
            tenant_id,
            card_id,
            card_type = %card.card_type,
            attempt = card.attempt,
            "executing card"
        );

        match self.run_handler(&card).await {
            Ok(receipt) => self.finish_done(card, receipt).await,
            Err(error) => self.finish_blocked(card, error).await,
        }
    }

    /// Executes up to the configured batch of approved cards, oldest first.
    pub async fn execute_approved(&self, tenant_id: &str) -> Result<BatchExecution, StoreError> {
        self.execute_approved_limit(tenant_id, self.batch_limit).await
    }

    pub async fn execute_approved_limit(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<BatchExecution, StoreError> {
        let mut batch = BatchExecution {
            recovered: self.recover_stranded(tenant_id).await?,
            ..BatchExecution::default()
        };
        let approved = self
            .cards
            .list_cards(tenant_id, Some(CardState::Approved), limit)
            .await?;
        for card in approved {
            match self.execute(tenant_id, &card.card_id).await {
                Ok(report) => batch.reports.push(report),
                Err(error) => {
                    tracing::warn!(tenant_id, card_id = %card.card_id, "card execution failed: {error}");
                    batch.errors.push(format!("card {}: {error}", card.card_id));
                }
            }
        }
        Ok(batch)
    }

    /// Moves `executing` cards older than the stale threshold to `blocked`.
    ///
    /// A card lands here when its final state could not be written after the
    /// handler ran, so the trailer asks a human to check the audit log first.
    pub async fn recover_stranded(&self, tenant_id: &str) -> Result<Vec<ExecutionReport>, StoreError> {
        let now = self.clock.now();
        let executing = self
            .cards
            .list_cards(tenant_id, Some(CardState::Executing), self.batch_limit)
            .await?;
        let mut recovered = Vec::new();
        for card in executing {
            if now - card.updated_at < self.stale_executing {
                continue;
            }
            let message = format!(
                "execution outcome of attempt {} was not recorded; check the email audit log before re-approving",
                card.attempt
            );
            let transition = CardTransition::new(CardState::Executing, CardState::Blocked)
                .with_description(with_error_trailer(&card.description, &message));
            let updated = match self
                .cards
                .transition_card(tenant_id, &card.card_id, transition)
                .await?
            {
                CasOutcome::Applied(updated) => updated,
                CasOutcome::Conflict { .. } => continue,
            };
            self.record_completion(
                &card,
                EventType::CardFailed,
                json!({
                    "card_id": card.card_id,
                    "card_type": card.card_type,
                    "attempt": card.attempt,
                    "error": message,
                    "outcome_unrecorded": true,
                }),
            )
            .await;
            tracing::warn!(tenant_id, card_id = %card.card_id, attempt = card.attempt, "stranded executing card blocked");
            recovered.push(ExecutionReport {
                card_id: card.card_id,
                status: ExecutionStatus::Blocked,
                state: updated.state,
                attempt: card.attempt,
                receipt: None,
                error: Some(message),
            });
        }
        Ok(recovered)
    }

    async fn run_handler(&self, card: &Card) -> Result<HandlerReceipt, ExecutionError> {
        let handler = self.handlers.handler_for(&card.action);
        let owned = card.clone();
        // Detached so an in-flight send still reaches the gate's audit step after a timeout.
        let task = tokio::spawn(async move { handler.handle(&owned).await });
        match tokio::time::timeout(self.handler_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExecutionError::Aborted(join_error.to_string())),
            Err(_) => Err(ExecutionError::Timeout(self.handler_timeout)),
        }
    }

    async fn finish_done(
        &self,
        card: Card,
        receipt: HandlerReceipt,
    ) -> Result<ExecutionReport, StoreError> {
        let now = self.clock.now();
        let transition = CardTransition::new(CardState::Executing, CardState::Done)
            .with_description(strip_error_trailer(&card.description).to_string())
            .with_executed_at(now);
        let state = self.settle(&card, transition).await?;
        self.record_completion(
            &card,
            EventType::CardExecuted,
            json!({
                "card_id": card.card_id,
                "card_type": card.card_type,
                "attempt": card.attempt,
                "reference": receipt.reference,
                "simulated": receipt.simulated,
            }),
        )
        .await;
        tracing::info!(
            tenant_id = %card.tenant_id,
            card_id = %card.card_id,
            simulated = receipt.simulated,
            "card executed"
        );
        Ok(ExecutionReport {
            card_id: card.card_id,
            status: ExecutionStatus::Done,
            state,
            attempt: card.attempt,
            receipt: Some(receipt),
            error: None,
        })
    }

    async fn finish_blocked(
        &self,
        card: Card,
        error: ExecutionError,
    ) -> Result<ExecutionReport, StoreError> {
        let message = error.to_string();
        let transition = CardTransition::new(CardState::Executing, CardState::Blocked)
            .with_description(with_error_trailer(&card.description, &message));
        let state = self.settle(&card, transition).await?;
        let event_type = if error.is_gate_block() {
            EventType::CardBlocked
        } else {
            EventType::CardFailed
        };
        self.record_completion(
            &card,
            event_type,
            json!({
                "card_id": card.card_id,
                "card_type": card.card_type,
                "attempt": card.attempt,
                "error": message,
            }),
        )
        .await;
        tracing::warn!(
            tenant_id = %card.tenant_id,
            card_id = %card.card_id,
            error = %message,
            "card blocked"
        );
        Ok(ExecutionReport {
            card_id: card.card_id,
            status: ExecutionStatus::Blocked,
            state,
            attempt: card.attempt,
            receipt: None,
            error: Some(message),
        })
    }

    /// Writes the final state, retrying once on a transient store error.
    async fn settle(&self, card: &Card, transition: CardTransition) -> Result<CardState, StoreError> {
        let target = transition.to;
        let mut outcome = self
            .cards
            .transition_card(&card.tenant_id, &card.card_id, transition.clone())
            .await;
        if let Some(error) = outcome.as_ref().err().filter(|error| error.is_transient()) {
            tracing::warn!(
                tenant_id = %card.tenant_id,
                card_id = %card.card_id,
                "failed to record {target}, retrying: {error}"
            );
            outcome = self
                .cards
                .transition_card(&card.tenant_id, &card.card_id, transition)
                .await;
        }
        match outcome {
            Ok(CasOutcome::Applied(updated)) => Ok(updated.state),
            Ok(CasOutcome::Conflict { actual }) => {
                tracing::warn!(
                    tenant_id = %card.tenant_id,
                    card_id = %card.card_id,
                    expected = %CardState::Executing,
                    actual = %actual,
                    "card left executing before {target} could be recorded"
                );
                Ok(actual)
            }
            Err(error) => {
                tracing::error!(
                    tenant_id = %card.tenant_id,
                    card_id = %card.card_id,
                    "failed to record {target} for executing card; left for the stale sweep: {error}"
                );
                Err(error)
            }
        }
    }

    async fn record_completion(&self, card: &Card, event_type: EventType, payload: serde_json::Value) {
        let natural_key = format!("card:{}:attempt:{}", card.card_id, card.attempt);
        let mut event = NewEvent::new(&card.tenant_id, event_type, natural_key, self.clock.now())
            .with_payload(payload);
        if let Some(subject_id) = card.action.subject_id() {
            event = event.with_subject(subject_id);
        }
        if let Err(error) = self.events.append(event).await {
            tracing::warn!(
                tenant_id = %card.tenant_id,
                card_id = %card.card_id,
                event_type = %event_type,
                "completion event not recorded: {error}"
            );
        }
    }
}
