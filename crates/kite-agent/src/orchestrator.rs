//! Turns pending recommendations into reviewable cards, one work block per tenant.

use std::sync::Arc;

use kite_core::{new_id, Clock, SystemClock};
use kite_store::{AgentRunStart, CardStore, CasOutcome, EventWarehouse, InsightStore, StoreError};
use kite_types::{
    validate_tenant_id, AgentMode, AgentRun, AgentRunCompletion, AgentRunStatus, Card, CardState,
    CardTransition, EventType, NewCard, NewEvent, Recommendation, RecommendationStatus,
    TenantSettings, ValidationError,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::config::OrchestratorConfig;
use crate::executor::ActionExecutor;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("agents are halted by the global kill switch")]
    Halted,
    #[error("agent is disabled for tenant '{tenant_id}'")]
    Disabled { tenant_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of asking for a work block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "run", rename_all = "snake_case")]
pub enum WorkBlock {
    Completed(AgentRun),
    /// Another block for the tenant is still open; nothing was done.
    AlreadyRunning(AgentRun),
}

impl WorkBlock {
    pub fn run(&self) -> &AgentRun {
        match self {
            Self::Completed(run) | Self::AlreadyRunning(run) => run,
        }
    }

    pub fn into_run(self) -> AgentRun {
        match self {
            Self::Completed(run) | Self::AlreadyRunning(run) => run,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    recommendations_seen: u32,
    cards_created: u32,
    cards_auto_approved: u32,
    cards_executed: u32,
    errors: Vec<String>,
}

impl Tally {
    fn completion(self, status: AgentRunStatus) -> AgentRunCompletion {
        let outcome_summary = format!(
            "{} recommendations seen, {} cards created ({} auto-approved), {} executed, {} errors",
            self.recommendations_seen,
            self.cards_created,
            self.cards_auto_approved,
            self.cards_executed,
            self.errors.len()
        );
        AgentRunCompletion {
            status,
            recommendations_seen: self.recommendations_seen,
            cards_created: self.cards_created,
            cards_auto_approved: self.cards_auto_approved,
            cards_executed: self.cards_executed,
            errors: self.errors,
            outcome_summary,
        }
    }
}

pub struct AgentOrchestrator {
    insights: Arc<dyn InsightStore>,
    cards: Arc<dyn CardStore>,
    events: Arc<dyn EventWarehouse>,
    tenants: Arc<kite_types::TenantRegistry>,
    executor: Arc<ActionExecutor>,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
}

impl AgentOrchestrator {
    pub fn new(
        insights: Arc<dyn InsightStore>,
        cards: Arc<dyn CardStore>,
        events: Arc<dyn EventWarehouse>,
        tenants: Arc<kite_types::TenantRegistry>,
        executor: Arc<ActionExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            insights,
            cards,
            events,
            tenants,
            executor,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Runs one orchestrator cycle for `tenant_id`.
    ///
    /// Per-recommendation failures are collected on the run and never abort the
    /// batch. A store failure while listing recommendations completes the run
    /// as failed; only kill-switch and validation problems return an error.
    #[tracing::instrument(level = "debug", skip(self), fields(mode = %mode))]
    pub async fn run_work_block(
        &self,
        tenant_id: &str,
        mode: AgentMode,
    ) -> Result<WorkBlock, OrchestratorError> {
        validate_tenant_id(tenant_id)?;
        if self.tenants.agents_halted() {
            return Err(OrchestratorError::Halted);
        }
        if !self.tenants.agent_enabled(tenant_id) {
            return Err(OrchestratorError::Disabled {
                tenant_id: tenant_id.to_string(),
            });
        }
        let settings = self.tenants.settings_for(tenant_id);

        let run = AgentRun::start(
            new_id("run"),
            tenant_id.to_string(),
            mode,
            self.clock.now(),
        );
        let run = match self
            .cards
            .begin_agent_run(run, self.config.stale_after())
            .await?
        {
            AgentRunStart::Started(run) => run,
            AgentRunStart::AlreadyRunning(open) => {
                tracing::info!(tenant_id, run_id = %open.run_id, "agent run already in progress");
                return Ok(WorkBlock::AlreadyRunning(open));
            }
        };

        let mut tally = Tally::default();
        let status = match self.work(tenant_id, mode, &settings, &mut tally).await {
            Ok(()) => AgentRunStatus::Completed,
            Err(error) => {
                tracing::warn!(tenant_id, run_id = %run.run_id, "agent run failed: {error}");
                tally.errors.push(error.to_string());
                AgentRunStatus::Failed
            }
        };

        let completed = self
            .cards
            .complete_agent_run(tenant_id, &run.run_id, tally.completion(status))
            .await?;
        self.append_event(
            NewEvent::new(
                tenant_id,
                EventType::AgentRunCompleted,
                format!("run:{}", completed.run_id),
                self.clock.now(),
            )
            .with_payload(json!({
                "run_id": completed.run_id,
                "mode": completed.mode,
                "status": completed.status,
                "cards_created": completed.cards_created,
                "cards_auto_approved": completed.cards_auto_approved,
                "cards_executed": completed.cards_executed,
                "errors": completed.errors.len(),
            })),
        )
        .await;
        tracing::info!(
            tenant_id,
            run_id = %completed.run_id,
            status = %completed.status,
            cards_created = completed.cards_created,
            cards_auto_approved = completed.cards_auto_approved,
            errors = completed.errors.len(),
            "agent run finished"
        );
        Ok(WorkBlock::Completed(completed))
    }

    async fn work(
        &self,
        tenant_id: &str,
        mode: AgentMode,
        settings: &TenantSettings,
        tally: &mut Tally,
    ) -> Result<(), StoreError> {
        if self.config.execute_approved_first {
            match self.executor.execute_approved(tenant_id).await {
                Ok(batch) => {
                    tally.cards_executed = u32::try_from(batch.done()).unwrap_or(u32::MAX);
                    tally.errors.extend(batch.errors);
                }
                Err(error) => tally.errors.push(format!("execute approved: {error}")),
            }
        }

        let pending = self
            .insights
            .pending_recommendations(tenant_id, self.config.batch_size.max(1))
            .await?;
        for recommendation in pending {
            if tally.cards_created >= self.config.max_cards_per_run {
                break;
            }
            tally.recommendations_seen += 1;
            let recommendation_id = recommendation.recommendation_id.clone();
            match self.apply_recommendation(recommendation, mode, settings).await {
                Ok(Applied::Created { auto_approved }) => {
                    tally.cards_created += 1;
                    if auto_approved {
                        tally.cards_auto_approved += 1;
                    }
                }
                Ok(Applied::Skipped) => {}
                Err(error) => {
                    tracing::warn!(tenant_id, recommendation_id = %recommendation_id, "recommendation not applied: {error}");
                    tally
                        .errors
                        .push(format!("recommendation {recommendation_id}: {error}"));
                }
            }
        }
        Ok(())
    }

    async fn apply_recommendation(
        &self,
        recommendation: Recommendation,
        mode: AgentMode,
        settings: &TenantSettings,
    ) -> Result<Applied, ApplyError> {
        let tenant_id = recommendation.tenant_id.clone();
        let recommendation_id = recommendation.recommendation_id.clone();
        let card = match self.card_for(&recommendation) {
            Ok(card) => card,
            Err(error) => {
                // An unbuildable proposal would fail every cycle; take it out of the queue.
                self.insights
                    .transition_recommendation(
                        &tenant_id,
                        &recommendation_id,
                        RecommendationStatus::Pending,
                        RecommendationStatus::Dismissed,
                    )
                    .await?;
                return Err(ApplyError::Invalid(error));
            }
        };

        match self
            .insights
            .transition_recommendation(
                &tenant_id,
                &recommendation_id,
                RecommendationStatus::Pending,
                RecommendationStatus::Applied,
            )
            .await?
        {
            CasOutcome::Applied(_) => {}
            CasOutcome::Conflict { actual } => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    recommendation_id = %recommendation_id,
                    status = %actual,
                    "recommendation claimed elsewhere"
                );
                return Ok(Applied::Skipped);
            }
        }

        let card = match self.cards.insert_card(card).await {
            Ok(card) => card,
            Err(error) => {
                self.release_claim(&tenant_id, &recommendation_id).await;
                return Err(error.into());
            }
        };
        self.append_event(
            NewEvent::new(
                &tenant_id,
                EventType::CardCreated,
                format!("card:{}", card.card_id),
                card.created_at,
            )
            .with_payload(json!({
                "card_id": card.card_id,
                "card_type": card.card_type,
                "recommendation_id": recommendation_id,
            })),
        )
        .await;

        let auto_approved = mode == AgentMode::Auto
            && settings.allows_auto_approve(card.card_type)
            && self.auto_approve(&card).await?;
        Ok(Applied::Created { auto_approved })
    }

    fn card_for(&self, recommendation: &Recommendation) -> Result<Card, ValidationError> {
        NewCard {
            tenant_id: recommendation.tenant_id.clone(),
            title: recommendation.title.clone(),
            rationale: recommendation.rationale.clone(),
            priority: recommendation.priority,
            action: recommendation.action.clone(),
            created_by: self.config.created_by.clone(),
            source_recommendation_id: Some(recommendation.recommendation_id.clone()),
            description: String::new(),
        }
        .into_card(new_id("card"), self.clock.now())
    }

    async fn auto_approve(&self, card: &Card) -> Result<bool, StoreError> {
        let transition = CardTransition::new(CardState::Suggested, CardState::Approved);
        match self
            .cards
            .transition_card(&card.tenant_id, &card.card_id, transition)
            .await?
        {
            CasOutcome::Applied(_) => Ok(true),
            CasOutcome::Conflict { actual } => {
                tracing::debug!(card_id = %card.card_id, state = %actual, "card moved before auto-approval");
                Ok(false)
            }
        }
    }

    async fn release_claim(&self, tenant_id: &str, recommendation_id: &str) {
        let released = self
            .insights
            .transition_recommendation(
                tenant_id,
                recommendation_id,
                RecommendationStatus::Applied,
                RecommendationStatus::Pending,
            )
            .await;
        if let Err(error) = released {
            tracing::error!(tenant_id, recommendation_id, "failed to release recommendation claim: {error}");
        }
    }

    async fn append_event(&self, event: NewEvent) {
        let tenant_id = event.tenant_id.clone();
        let event_type = event.event_type;
        if let Err(error) = self.events.append(event).await {
            tracing::warn!(tenant_id = %tenant_id, event_type = %event_type, "event not recorded: {error}");
        }
    }
}

enum Applied {
    Created { auto_approved: bool },
    Skipped,
}

#[derive(Debug, Error)]
enum ApplyError {
    #[error("invalid card payload: {0}")]
    Invalid(ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use kite_core::ManualClock;
    use kite_outbound::{OutboundGate, RecordingEmailProvider, SlidingWindowRateLimiter};
    use kite_store::{InMemoryPipelineStore, RecommendationInsert, StoreResult};
    use kite_types::{
        CardAction, CardType, EmailAction, FollowUpAction, Priority, ResearchAction, TaskAction,
        TenantRegistry, TenantSettings,
    };

    use crate::config::ExecutorConfig;
    use crate::handlers::HandlerRegistry;

    const TENANT: &str = "acme";

    struct Harness {
        orchestrator: AgentOrchestrator,
        store: Arc<InMemoryPipelineStore>,
        tenants: Arc<TenantRegistry>,
        clock: ManualClock,
    }

    fn harness_on(
        config: OrchestratorConfig,
        store: Arc<InMemoryPipelineStore>,
        cards: Arc<dyn CardStore>,
    ) -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap());
        let tenants = Arc::new(TenantRegistry::new(TenantSettings::default(), BTreeMap::new()));
        let gate = Arc::new(OutboundGate::new(
            tenants.clone(),
            store.clone(),
            Arc::new(SlidingWindowRateLimiter::new(Arc::new(clock.clone()))),
            Arc::new(RecordingEmailProvider::new()),
        ));
        let executor = Arc::new(
            ActionExecutor::new(
                cards.clone(),
                store.clone(),
                HandlerRegistry::with_gate(gate),
                &ExecutorConfig::default(),
            )
            .with_clock(Arc::new(clock.clone())),
        );
        let orchestrator = AgentOrchestrator::new(
            store.clone(),
            cards,
            store.clone(),
            tenants.clone(),
            executor,
            config,
        )
        .with_clock(Arc::new(clock.clone()));
        Harness {
            orchestrator,
            store,
            tenants,
            clock,
        }
    }

    fn harness_with(config: OrchestratorConfig) -> Harness {
        let store = Arc::new(InMemoryPipelineStore::new());
        harness_on(config, store.clone(), store)
    }

    fn harness() -> Harness {
        harness_with(OrchestratorConfig::default())
    }

    fn recommendation(
        id: &str,
        action: CardAction,
        priority: Priority,
        created_at: DateTime<Utc>,
    ) -> Recommendation {
        let subject = action.subject_id().unwrap_or("tenant").to_string();
        Recommendation {
            recommendation_id: id.to_string(),
            tenant_id: TENANT.to_string(),
            pattern_id: format!("pat_{id}"),
            action_type: action.card_type(),
            subject_id: subject.clone(),
            priority,
            confidence: 0.8,
            title: format!("Proposal {id}"),
            rationale: "pattern detected".to_string(),
            action: action.clone(),
            status: RecommendationStatus::Pending,
            cooldown_key: format!("{TENANT}|{}|{subject}", action.card_type()),
            created_at,
            updated_at: created_at,
        }
    }

    fn research(subject: &str) -> CardAction {
        CardAction::Research(ResearchAction {
            subject_id: subject.to_string(),
            topic: "order slowdown".to_string(),
        })
    }

    fn email(to: &str) -> CardAction {
        CardAction::SendEmail(EmailAction {
            to: to.to_string(),
            subject: "Checking in".to_string(),
            html: None,
            text: Some("Hi".to_string()),
            contact_id: Some("contact-1".to_string()),
        })
    }

    async fn seed(harness: &Harness, recommendation: Recommendation) {
        let inserted = harness
            .store
            .insert_recommendation_unless_cooling(recommendation, harness.clock.now() - chrono::Duration::days(7))
            .await
            .expect("insert");
        assert!(matches!(inserted, RecommendationInsert::Inserted(_)));
    }

    #[tokio::test]
    async fn functional_review_mode_creates_suggested_cards_and_applies_recommendations() {
        let harness = harness();
        let now = harness.clock.now();
        seed(&harness, recommendation("rec_1", research("client-1"), Priority::High, now)).await;
        seed(&harness, recommendation("rec_2", email("dana@client.test"), Priority::Critical, now)).await;

        let block = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect("run");

        let WorkBlock::Completed(run) = block else {
            panic!("expected a completed run");
        };
        assert_eq!(run.status, AgentRunStatus::Completed);
        assert_eq!(run.recommendations_seen, 2);
        assert_eq!(run.cards_created, 2);
        assert_eq!(run.cards_auto_approved, 0);
        let cards = harness.store.list_cards(TENANT, None, 10).await.expect("cards");
        assert_eq!(cards.len(), 2);
        assert!(cards.iter().all(|card| card.state == CardState::Suggested));
        let email_card = cards
            .iter()
            .find(|card| card.card_type == CardType::SendEmail)
            .expect("email card");
        assert_eq!(email_card.priority, Priority::Critical);
        assert_eq!(email_card.source_recommendation_id.as_deref(), Some("rec_2"));
        assert_eq!(email_card.rationale, "pattern detected");
        for id in ["rec_1", "rec_2"] {
            let stored = harness
                .store
                .get_recommendation(TENANT, id)
                .await
                .expect("get")
                .expect("rec");
            assert_eq!(stored.status, RecommendationStatus::Applied);
        }
        let runs = harness.store.list_agent_runs(TENANT, 5).await.expect("runs");
        assert_eq!(runs[0].run_id, run.run_id);
        assert!(!runs[0].is_open());
    }

    #[tokio::test]
    async fn functional_auto_mode_approves_only_allow_listed_types() {
        let harness = harness();
        let now = harness.clock.now();
        seed(&harness, recommendation("rec_1", research("client-1"), Priority::High, now)).await;
        seed(&harness, recommendation("rec_2", email("dana@client.test"), Priority::High, now)).await;
        seed(
            &harness,
            recommendation(
                "rec_3",
                CardAction::CreateTask(TaskAction {
                    title: "Escalate".to_string(),
                    notes: None,
                    due_at: None,
                }),
                Priority::Medium,
                now,
            ),
        )
        .await;

        let run = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Auto)
            .await
            .expect("run")
            .into_run();

        assert_eq!(run.cards_created, 3);
        assert_eq!(run.cards_auto_approved, 1);
        let cards = harness.store.list_cards(TENANT, None, 10).await.expect("cards");
        for card in cards {
            let expected = if card.card_type == CardType::Research {
                CardState::Approved
            } else {
                CardState::Suggested
            };
            assert_eq!(card.state, expected, "{}", card.card_type);
        }
    }

    #[tokio::test]
    async fn functional_tenant_allow_list_can_include_create_task_but_never_send_email() {
        let harness = harness();
        harness.tenants.upsert(
            TENANT,
            TenantSettings {
                auto_approve: vec![CardType::CreateTask, CardType::SendEmail],
                ..TenantSettings::default()
            },
        );
        let now = harness.clock.now();
        seed(&harness, recommendation("rec_1", research("client-1"), Priority::High, now)).await;
        seed(&harness, recommendation("rec_2", email("dana@client.test"), Priority::High, now)).await;

        let run = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Auto)
            .await
            .expect("run")
            .into_run();

        assert_eq!(run.cards_auto_approved, 0);
    }

    #[tokio::test]
    async fn unit_kill_switch_and_tenant_toggle_refuse_runs() {
        let harness = harness();
        harness.tenants.upsert(
            TENANT,
            TenantSettings {
                agent_enabled: false,
                ..TenantSettings::default()
            },
        );
        let disabled = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect_err("disabled");
        assert!(matches!(disabled, OrchestratorError::Disabled { .. }));

        harness.tenants.set_agents_halted(true);
        let halted = harness
            .orchestrator
            .run_work_block("globex", AgentMode::Review)
            .await
            .expect_err("halted");
        assert!(matches!(halted, OrchestratorError::Halted));

        let invalid = harness
            .orchestrator
            .run_work_block("  ", AgentMode::Review)
            .await
            .expect_err("invalid");
        assert!(matches!(invalid, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn functional_open_run_blocks_second_work_block() {
        let harness = harness();
        let open = AgentRun::start(
            "run_open".to_string(),
            TENANT.to_string(),
            AgentMode::Review,
            harness.clock.now(),
        );
        harness
            .store
            .begin_agent_run(open, chrono::Duration::minutes(15))
            .await
            .expect("begin");

        let block = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect("run");

        assert!(matches!(block, WorkBlock::AlreadyRunning(ref run) if run.run_id == "run_open"));

        harness.clock.advance(chrono::Duration::minutes(16));
        let stale_taken_over = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect("run");
        assert!(matches!(stale_taken_over, WorkBlock::Completed(_)));
    }

    #[tokio::test]
    async fn functional_max_cards_per_run_leaves_rest_pending_in_priority_order() {
        let harness = harness_with(OrchestratorConfig {
            max_cards_per_run: 2,
            ..OrchestratorConfig::default()
        });
        let now = harness.clock.now();
        seed(&harness, recommendation("rec_low", research("c-1"), Priority::Low, now)).await;
        seed(&harness, recommendation("rec_crit", research("c-2"), Priority::Critical, now)).await;
        seed(&harness, recommendation("rec_high", research("c-3"), Priority::High, now)).await;

        let run = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect("run")
            .into_run();

        assert_eq!(run.cards_created, 2);
        let pending = harness
            .store
            .pending_recommendations(TENANT, 10)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].recommendation_id, "rec_low");
    }

    #[tokio::test]
    async fn regression_invalid_recommendation_is_dismissed_and_batch_continues() {
        let harness = harness();
        let now = harness.clock.now();
        seed(
            &harness,
            recommendation(
                "rec_bad",
                CardAction::FollowUp(FollowUpAction {
                    subject_id: "client-1".to_string(),
                    note: "  ".to_string(),
                    channel: None,
                    due_at: None,
                }),
                Priority::Critical,
                now,
            ),
        )
        .await;
        seed(&harness, recommendation("rec_ok", research("client-2"), Priority::Low, now)).await;

        let run = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect("run")
            .into_run();

        assert_eq!(run.status, AgentRunStatus::Completed);
        assert_eq!(run.cards_created, 1);
        assert_eq!(run.errors.len(), 1);
        assert!(run.errors[0].contains("rec_bad"));
        let bad = harness
            .store
            .get_recommendation(TENANT, "rec_bad")
            .await
            .expect("get")
            .expect("rec");
        assert_eq!(bad.status, RecommendationStatus::Dismissed);
    }

    /// Card store whose inserts fail until switched back on.
    struct RefusingCards {
        inner: Arc<InMemoryPipelineStore>,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl CardStore for RefusingCards {
        async fn insert_card(&self, card: Card) -> StoreResult<Card> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("cards table locked".to_string()));
            }
            self.inner.insert_card(card).await
        }
        async fn get_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<Option<Card>> {
            self.inner.get_card(tenant_id, card_id).await
        }
        async fn list_cards(
            &self,
            tenant_id: &str,
            state: Option<CardState>,
            limit: usize,
        ) -> StoreResult<Vec<Card>> {
            self.inner.list_cards(tenant_id, state, limit).await
        }
        async fn transition_card(
            &self,
            tenant_id: &str,
            card_id: &str,
            transition: CardTransition,
        ) -> StoreResult<CasOutcome<Card, CardState>> {
            self.inner.transition_card(tenant_id, card_id, transition).await
        }
        async fn update_card(
            &self,
            tenant_id: &str,
            card_id: &str,
            patch: kite_types::CardPatch,
        ) -> StoreResult<Card> {
            self.inner.update_card(tenant_id, card_id, patch).await
        }
        async fn delete_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<bool> {
            self.inner.delete_card(tenant_id, card_id).await
        }
        async fn begin_agent_run(
            &self,
            run: AgentRun,
            stale_after: chrono::Duration,
        ) -> StoreResult<AgentRunStart> {
            self.inner.begin_agent_run(run, stale_after).await
        }
        async fn complete_agent_run(
            &self,
            tenant_id: &str,
            run_id: &str,
            completion: AgentRunCompletion,
        ) -> StoreResult<AgentRun> {
            self.inner.complete_agent_run(tenant_id, run_id, completion).await
        }
        async fn get_agent_run(&self, tenant_id: &str, run_id: &str) -> StoreResult<Option<AgentRun>> {
            self.inner.get_agent_run(tenant_id, run_id).await
        }
        async fn list_agent_runs(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AgentRun>> {
            self.inner.list_agent_runs(tenant_id, limit).await
        }
    }

    #[tokio::test]
    async fn regression_failed_card_insert_releases_recommendation_claim() {
        let shared = Arc::new(InMemoryPipelineStore::new());
        let refusing = Arc::new(RefusingCards {
            inner: shared.clone(),
            refuse: AtomicBool::new(true),
        });
        let harness = harness_on(OrchestratorConfig::default(), shared.clone(), refusing.clone());
        let now = harness.clock.now();
        seed(&harness, recommendation("rec_1", research("client-1"), Priority::High, now)).await;

        let run = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect("run")
            .into_run();

        assert_eq!(run.cards_created, 0);
        assert_eq!(run.errors.len(), 1);
        let rec = shared.get_recommendation(TENANT, "rec_1").await.expect("get").expect("rec");
        assert_eq!(rec.status, RecommendationStatus::Pending);

        refusing.refuse.store(false, Ordering::SeqCst);
        let retry = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Review)
            .await
            .expect("run")
            .into_run();
        assert_eq!(retry.cards_created, 1);
    }

    #[tokio::test]
    async fn functional_execute_approved_first_runs_before_new_cards() {
        let harness = harness_with(OrchestratorConfig {
            execute_approved_first: true,
            ..OrchestratorConfig::default()
        });
        let now = harness.clock.now();
        seed(&harness, recommendation("rec_1", research("client-1"), Priority::High, now)).await;
        let first = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Auto)
            .await
            .expect("first")
            .into_run();
        assert_eq!(first.cards_auto_approved, 1);
        assert_eq!(first.cards_executed, 0);

        let second = harness
            .orchestrator
            .run_work_block(TENANT, AgentMode::Auto)
            .await
            .expect("second")
            .into_run();

        assert_eq!(second.cards_executed, 1);
        let done = harness
            .store
            .list_cards(TENANT, Some(CardState::Done), 10)
            .await
            .expect("done");
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn unit_tally_summary_mentions_every_count() {
        let tally = Tally {
            recommendations_seen: 4,
            cards_created: 3,
            cards_auto_approved: 1,
            cards_executed: 2,
            errors: vec!["x".to_string()],
        };
        let completion = tally.completion(AgentRunStatus::Completed);
        assert_eq!(
            completion.outcome_summary,
            "4 recommendations seen, 3 cards created (1 auto-approved), 2 executed, 1 errors"
        );
    }
}
