use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use kite_agent::{
    ActionExecutor, AgentOrchestrator, ExecutionStatus, ExecutorConfig, HandlerRegistry,
    OrchestratorConfig, WorkBlock,
};
use kite_core::{Clock, ManualClock};
use kite_insights::{
    DetectorCatalog, DetectorsConfig, InsightJobRunner, RecommenderConfig, StrategyRecommender,
};
use kite_outbound::{OutboundGate, RecordingEmailProvider, SlidingWindowRateLimiter};
use kite_store::{
    CardStore, CasOutcome, EventWarehouse, InMemoryPipelineStore, InsightStore, OutboundStore,
};
use kite_types::{
    AgentMode, AuditResult, Cadence, CardAction, CardPatch, CardState, CardTransition, CardType,
    EmailAction, EventQuery, EventType, JobOutcome, NewCard, NewEvent, Priority, Recommendation,
    RecommendationStatus, ResearchAction, RolloutMode, TenantRegistry, TenantSettings,
    ERROR_TRAILER_MARKER,
};
use serde_json::json;

const TENANT: &str = "acme";

struct Pipeline {
    store: Arc<InMemoryPipelineStore>,
    clock: ManualClock,
    provider: Arc<RecordingEmailProvider>,
    executor: Arc<ActionExecutor>,
    orchestrator: AgentOrchestrator,
    jobs: InsightJobRunner,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid start")
}

fn pipeline(settings: TenantSettings) -> Pipeline {
    let store = Arc::new(InMemoryPipelineStore::new());
    let clock = ManualClock::new(start());
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let tenants = Arc::new(TenantRegistry::new(
        TenantSettings::default(),
        BTreeMap::from([(TENANT.to_string(), settings)]),
    ));
    let provider = Arc::new(RecordingEmailProvider::new());
    let gate = Arc::new(
        OutboundGate::new(
            tenants.clone(),
            store.clone(),
            Arc::new(SlidingWindowRateLimiter::new(shared_clock.clone())),
            provider.clone(),
        )
        .with_clock(shared_clock.clone()),
    );
    let executor = Arc::new(
        ActionExecutor::new(
            store.clone(),
            store.clone(),
            HandlerRegistry::with_gate(gate),
            &ExecutorConfig::default(),
        )
        .with_clock(shared_clock.clone()),
    );
    let orchestrator = AgentOrchestrator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        tenants,
        executor.clone(),
        OrchestratorConfig::default(),
    )
    .with_clock(shared_clock.clone());
    let jobs = InsightJobRunner::new(
        store.clone(),
        store.clone(),
        DetectorCatalog::from_config(DetectorsConfig::default()),
        StrategyRecommender::new(RecommenderConfig::default()),
    )
    .with_clock(shared_clock);
    Pipeline {
        store,
        clock,
        provider,
        executor,
        orchestrator,
        jobs,
    }
}

#[tokio::test]
async fn integration_sla_risk_flows_from_event_to_executed_card_and_back_into_the_warehouse() {
    let pipeline = pipeline(TenantSettings::default());
    let t0 = start();

    pipeline
        .store
        .append(
            NewEvent::new(TENANT, EventType::SlaStarted, "sla-77", t0 - Duration::minutes(30))
                .with_subject("account-9")
                .with_payload(json!({
                    "sla_id": "sla-77",
                    "due_at": (t0 + Duration::hours(2)).to_rfc3339(),
                })),
        )
        .await
        .expect("append sla event");

    let first = pipeline
        .jobs
        .run_job(TENANT, Cadence::Hourly, t0)
        .await
        .expect("first job");
    assert_eq!(first.outcome, JobOutcome::Success);
    assert_eq!(first.events_processed, 1);
    assert!(first.patterns_detected >= 1);
    assert!(first.recommendations_created >= 1);

    let pending = pipeline
        .store
        .pending_recommendations(TENANT, 50)
        .await
        .expect("pending recommendations");
    let task = pending
        .iter()
        .find(|recommendation| recommendation.action_type == CardType::CreateTask)
        .expect("task recommendation for the sla risk");
    assert_eq!(task.priority, Priority::Critical);
    assert_eq!(task.subject_id, "account-9");

    pipeline.clock.advance(Duration::minutes(5));
    let block = pipeline
        .orchestrator
        .run_work_block(TENANT, AgentMode::Review)
        .await
        .expect("work block");
    let run = match block {
        WorkBlock::Completed(run) => run,
        WorkBlock::AlreadyRunning(run) => panic!("unexpected open run {run:?}"),
    };
    assert_eq!(run.cards_created as usize, pending.len());
    assert_eq!(run.cards_auto_approved, 0);

    let applied = pipeline
        .store
        .get_recommendation(TENANT, &task.recommendation_id)
        .await
        .expect("load recommendation")
        .expect("recommendation exists");
    assert_eq!(applied.status, RecommendationStatus::Applied);

    let suggested = pipeline
        .store
        .list_cards(TENANT, Some(CardState::Suggested), 50)
        .await
        .expect("suggested cards");
    let card = suggested
        .iter()
        .find(|card| {
            card.source_recommendation_id.as_deref() == Some(task.recommendation_id.as_str())
        })
        .expect("card for the task recommendation");
    assert_eq!(card.card_type, CardType::CreateTask);
    assert_eq!(card.priority, Priority::Critical);

    let approved = pipeline
        .store
        .transition_card(
            TENANT,
            &card.card_id,
            CardTransition::new(CardState::Suggested, CardState::Approved),
        )
        .await
        .expect("approve");
    assert!(approved.is_applied());

    let report = pipeline
        .executor
        .execute(TENANT, &card.card_id)
        .await
        .expect("execute");
    assert_eq!(report.status, ExecutionStatus::Done);
    let done = pipeline
        .store
        .get_card(TENANT, &card.card_id)
        .await
        .expect("load card")
        .expect("card exists");
    assert_eq!(done.state, CardState::Done);
    assert_eq!(done.executed_at, Some(t0 + Duration::minutes(5)));

    let next_tick = t0 + Duration::hours(1);
    pipeline.clock.set(next_tick);
    let second = pipeline
        .jobs
        .run_job(TENANT, Cadence::Hourly, next_tick)
        .await
        .expect("second job");
    assert_eq!(second.outcome, JobOutcome::Success);
    assert_eq!(second.window_start, t0);

    let feedback = pipeline
        .store
        .query_window(EventQuery::window(TENANT, t0, next_tick).of_type(EventType::CardExecuted))
        .await
        .expect("feedback events");
    assert_eq!(feedback.events.len(), 1);
    assert!(feedback.events[0].processed_at.is_some());
    assert!(second.events_processed >= 2);
}

#[tokio::test]
async fn integration_blocked_email_card_is_fixed_by_a_human_and_retried_cleanly() {
    let pipeline = pipeline(TenantSettings {
        send_mode: RolloutMode::InternalOnly,
        internal_domains: vec!["acme.test".to_string()],
        ..TenantSettings::default()
    });

    let card = NewCard {
        tenant_id: TENANT.to_string(),
        title: "Send the renewal quote".to_string(),
        rationale: "renewal due".to_string(),
        priority: Priority::High,
        action: CardAction::SendEmail(EmailAction {
            to: "buyer@customer.test".to_string(),
            subject: "Renewal".to_string(),
            html: None,
            text: Some("Quote attached".to_string()),
            contact_id: None,
        }),
        created_by: "human".to_string(),
        source_recommendation_id: None,
        description: "Quarterly renewal".to_string(),
    }
    .into_card("card_renewal".to_string(), start())
    .expect("valid card");
    pipeline.store.insert_card(card).await.expect("insert card");

    let approve = |from: CardState| {
        let store = pipeline.store.clone();
        async move {
            store
                .transition_card(
                    TENANT,
                    "card_renewal",
                    CardTransition::new(from, CardState::Approved),
                )
                .await
                .expect("approve")
        }
    };

    assert!(approve(CardState::Suggested).await.is_applied());
    let blocked = pipeline
        .executor
        .execute(TENANT, "card_renewal")
        .await
        .expect("first attempt");
    assert_eq!(blocked.status, ExecutionStatus::Blocked);
    let card = pipeline
        .store
        .get_card(TENANT, "card_renewal")
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(card.state, CardState::Blocked);
    assert!(card.description.contains(ERROR_TRAILER_MARKER));
    assert_eq!(pipeline.provider.sent_count(), 0);

    pipeline
        .store
        .update_card(
            TENANT,
            "card_renewal",
            CardPatch {
                action: Some(CardAction::SendEmail(EmailAction {
                    to: "sales@acme.test".to_string(),
                    subject: "Renewal".to_string(),
                    html: None,
                    text: Some("Quote attached".to_string()),
                    contact_id: None,
                })),
                ..CardPatch::default()
            },
        )
        .await
        .expect("fix recipient while blocked");

    pipeline.clock.advance(Duration::minutes(1));
    assert!(approve(CardState::Blocked).await.is_applied());
    let done = pipeline
        .executor
        .execute(TENANT, "card_renewal")
        .await
        .expect("second attempt");
    assert_eq!(done.status, ExecutionStatus::Done);
    assert_eq!(done.attempt, 2);

    let card = pipeline
        .store
        .get_card(TENANT, "card_renewal")
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(card.state, CardState::Done);
    assert_eq!(card.description, "Quarterly renewal");

    let sent = pipeline.provider.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].idempotency_key.as_deref(), Some("card_renewal:2"));

    let audit = pipeline
        .store
        .list_audit(TENANT, Some("card_renewal"), 10)
        .await
        .expect("audit rows");
    let results = audit.iter().map(|entry| entry.result).collect::<Vec<_>>();
    assert_eq!(results, vec![AuditResult::Sent, AuditResult::Blocked]);

    let events = pipeline
        .store
        .query_window(EventQuery::window(
            TENANT,
            start() - Duration::days(1),
            start() + Duration::days(1),
        ))
        .await
        .expect("events");
    let kinds = events
        .events
        .iter()
        .map(|event| event.event_type)
        .collect::<Vec<_>>();
    assert!(kinds.contains(&EventType::CardBlocked));
    assert!(kinds.contains(&EventType::CardExecuted));
}

fn recommendation(id: &str, action: CardAction, created_at: DateTime<Utc>) -> Recommendation {
    let action_type = action.card_type();
    let subject_id = action.subject_id().unwrap_or("tenant").to_string();
    Recommendation {
        recommendation_id: id.to_string(),
        pattern_id: format!("pat_{id}"),
        tenant_id: TENANT.to_string(),
        action_type,
        subject_id: subject_id.clone(),
        priority: Priority::High,
        confidence: 0.8,
        title: format!("Proposal {id}"),
        rationale: "contact went quiet".to_string(),
        action,
        status: RecommendationStatus::Pending,
        cooldown_key: format!("{TENANT}|{action_type}|{subject_id}"),
        created_at,
        updated_at: created_at,
    }
}

#[tokio::test]
async fn integration_auto_mode_never_sends_email_without_a_human() {
    let pipeline = pipeline(TenantSettings {
        send_mode: RolloutMode::Live,
        ..TenantSettings::default()
    });
    let t0 = start();
    let seeded = [
        recommendation(
            "rec_email",
            CardAction::SendEmail(EmailAction {
                to: "buyer@customer.test".to_string(),
                subject: "Checking in".to_string(),
                html: None,
                text: Some("Anything we can help with?".to_string()),
                contact_id: Some("contact-1".to_string()),
            }),
            t0,
        ),
        recommendation(
            "rec_research",
            CardAction::Research(ResearchAction {
                subject_id: "contact-1".to_string(),
                topic: "quiet account".to_string(),
            }),
            t0,
        ),
    ];
    for seed in seeded {
        pipeline
            .store
            .insert_recommendation_unless_cooling(seed, t0 - Duration::days(7))
            .await
            .expect("seed recommendation");
    }

    let run = pipeline
        .orchestrator
        .run_work_block(TENANT, AgentMode::Auto)
        .await
        .expect("auto block")
        .into_run();
    assert_eq!(run.cards_created, 2);
    assert_eq!(run.cards_auto_approved, 1);

    let cards = pipeline
        .store
        .list_cards(TENANT, None, 100)
        .await
        .expect("cards");
    let email = cards
        .iter()
        .find(|card| card.card_type == CardType::SendEmail)
        .expect("email card");
    assert_eq!(email.state, CardState::Suggested);
    let research = cards
        .iter()
        .find(|card| card.card_type == CardType::Research)
        .expect("research card");
    assert_eq!(research.state, CardState::Approved);

    let batch = pipeline
        .executor
        .execute_approved(TENANT)
        .await
        .expect("sweep");
    assert!(batch.errors.is_empty());
    assert_eq!(batch.done(), 1);
    assert_eq!(pipeline.provider.sent_count(), 0);

    let stale = pipeline
        .store
        .transition_card(
            TENANT,
            &email.card_id,
            CardTransition::new(CardState::Approved, CardState::Executing),
        )
        .await
        .expect("stale transition");
    assert!(matches!(
        stale,
        CasOutcome::Conflict {
            actual: CardState::Suggested
        }
    ));
    let report = pipeline
        .executor
        .execute(TENANT, &email.card_id)
        .await
        .expect("execute unapproved email");
    assert_eq!(report.status, ExecutionStatus::NoOp);
    assert_eq!(pipeline.provider.sent_count(), 0);
}
