//! Persistence contracts for the action pipeline and their backends.
//!
//! The event warehouse and the card store are the two coordination points of
//! the pipeline: `mark_processed` is an idempotent set-update and every card
//! transition is a compare-and-swap on the stored state. Both backends honor
//! the same contracts, so callers never need a distributed lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use kite_types::{
    AgentRun, AgentRunCompletion, AgentRunStatus, AppendOutcome, AuditLogEntry, Cadence, Card,
    CardPatch, CardState, CardTransition, DetectedPattern, Event, EventPage, EventQuery, JobRun,
    NewEvent, Recommendation, RecommendationStatus, StateTransitionError, Suppression,
    ValidationError,
};
pub use sqlite::SqlitePipelineStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error(transparent)]
    InvalidTransition(#[from] StateTransitionError),
    #[error("card '{card_id}' is {state} and can no longer be edited")]
    NotEditable { card_id: String, state: CardState },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True when retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(error, _)) => matches!(
                error.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

/// Outcome of a conditional update against an expected current value.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T, S> {
    Applied(T),
    /// The stored value no longer matched; someone else got there first.
    Conflict { actual: S },
}

impl<T, S> CasOutcome<T, S> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Conflict { .. } => None,
        }
    }
}

/// Outcome of the atomic cooldown check-and-insert.
#[derive(Debug, Clone, PartialEq)]
pub enum RecommendationInsert {
    Inserted(Recommendation),
    Suppressed { existing_id: String },
}

/// Outcome of opening an orchestrator run under the per-tenant single-flight rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRunStart {
    Started(AgentRun),
    AlreadyRunning(AgentRun),
}

/// Append-only store of operational events.
#[async_trait]
pub trait EventWarehouse: Send + Sync {
    /// Idempotent on `(tenant, type, natural_key)`; returns the existing id on collision.
    async fn append(&self, event: NewEvent) -> StoreResult<AppendOutcome>;
    /// One page of `[from, to)` ordered by `(occurred_at, event_id)`.
    async fn query_window(&self, query: EventQuery) -> StoreResult<EventPage>;
    /// Sets `processed_at` on exactly the given unprocessed ids; returns how many changed.
    async fn mark_processed(&self, tenant_id: &str, event_ids: &[String]) -> StoreResult<usize>;
}

/// Drains every page of a window query.
pub async fn collect_window(
    warehouse: &dyn EventWarehouse,
    mut query: EventQuery,
) -> StoreResult<Vec<Event>> {
    let mut events = Vec::new();
    loop {
        let page = warehouse.query_window(query.clone()).await?;
        events.extend(page.events);
        match page.next_cursor {
            Some(cursor) => query.after = Some(cursor),
            None => return Ok(events),
        }
    }
}

/// Patterns, recommendations and the insight job bookkeeping.
#[async_trait]
pub trait InsightStore: Send + Sync {
    async fn insert_patterns(&self, patterns: Vec<DetectedPattern>) -> StoreResult<()>;
    async fn list_patterns(&self, tenant_id: &str, limit: usize)
        -> StoreResult<Vec<DetectedPattern>>;
    /// Actionable patterns the recommender has not evaluated yet, oldest first.
    async fn unmapped_actionable_patterns(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<DetectedPattern>>;
    async fn mark_patterns_mapped(
        &self,
        tenant_id: &str,
        pattern_ids: &[String],
    ) -> StoreResult<usize>;

    /// Inserts unless a pending, or an applied one created at or after
    /// `cooldown_since`, shares the cooldown key.
    async fn insert_recommendation_unless_cooling(
        &self,
        recommendation: Recommendation,
        cooldown_since: DateTime<Utc>,
    ) -> StoreResult<RecommendationInsert>;
    async fn get_recommendation(
        &self,
        tenant_id: &str,
        recommendation_id: &str,
    ) -> StoreResult<Option<Recommendation>>;
    /// Pending recommendations, highest priority first then oldest first.
    async fn pending_recommendations(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Recommendation>>;
    async fn transition_recommendation(
        &self,
        tenant_id: &str,
        recommendation_id: &str,
        from: RecommendationStatus,
        to: RecommendationStatus,
    ) -> StoreResult<CasOutcome<Recommendation, RecommendationStatus>>;

    async fn checkpoint(&self, tenant_id: &str, cadence: Cadence)
        -> StoreResult<Option<DateTime<Utc>>>;
    /// Moves the checkpoint to `next` only while it still equals `expected`.
    async fn advance_checkpoint(
        &self,
        tenant_id: &str,
        cadence: Cadence,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn record_job_run(&self, run: JobRun) -> StoreResult<()>;
    async fn list_job_runs(
        &self,
        tenant_id: &str,
        cadence: Option<Cadence>,
        limit: usize,
    ) -> StoreResult<Vec<JobRun>>;
}

/// Cards with their approval state machine, plus orchestrator run records.
#[async_trait]
pub trait CardStore: Send + Sync {
    async fn insert_card(&self, card: Card) -> StoreResult<Card>;
    async fn get_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<Option<Card>>;
    /// Oldest first.
    async fn list_cards(
        &self,
        tenant_id: &str,
        state: Option<CardState>,
        limit: usize,
    ) -> StoreResult<Vec<Card>>;
    /// Compare-and-swap on the card state; invalid transitions are rejected before any read.
    async fn transition_card(
        &self,
        tenant_id: &str,
        card_id: &str,
        transition: CardTransition,
    ) -> StoreResult<CasOutcome<Card, CardState>>;
    async fn update_card(&self, tenant_id: &str, card_id: &str, patch: CardPatch)
        -> StoreResult<Card>;
    async fn delete_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<bool>;

    /// Opens a run unless the tenant already has one younger than `stale_after`.
    async fn begin_agent_run(&self, run: AgentRun, stale_after: Duration)
        -> StoreResult<AgentRunStart>;
    /// Writes final tallies once; an already completed run is returned untouched.
    async fn complete_agent_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        completion: AgentRunCompletion,
    ) -> StoreResult<AgentRun>;
    async fn get_agent_run(&self, tenant_id: &str, run_id: &str) -> StoreResult<Option<AgentRun>>;
    /// Newest first.
    async fn list_agent_runs(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AgentRun>>;
}

/// Audit log and suppression list used by the outbound gate.
#[async_trait]
pub trait OutboundStore: Send + Sync {
    async fn append_audit(&self, entry: AuditLogEntry) -> StoreResult<()>;
    /// Newest first.
    async fn list_audit(
        &self,
        tenant_id: &str,
        card_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<AuditLogEntry>>;
    /// Returns false when the address was already suppressed.
    async fn add_suppression(&self, suppression: Suppression) -> StoreResult<bool>;
    async fn find_suppression(&self, tenant_id: &str, email: &str)
        -> StoreResult<Option<Suppression>>;
    async fn remove_suppression(&self, tenant_id: &str, email: &str) -> StoreResult<bool>;
}

/// Trait-object handles over one backend, one per pipeline seam.
#[derive(Clone)]
pub struct StoreHandles {
    pub events: Arc<dyn EventWarehouse>,
    pub insights: Arc<dyn InsightStore>,
    pub cards: Arc<dyn CardStore>,
    pub outbound: Arc<dyn OutboundStore>,
}

impl StoreHandles {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: EventWarehouse + InsightStore + CardStore + OutboundStore + 'static,
    {
        Self {
            events: store.clone(),
            insights: store.clone(),
            cards: store.clone(),
            outbound: store,
        }
    }
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Keyed by `(tenant, occurred_at, event_id)` so window scans are range reads.
    events: BTreeMap<(String, DateTime<Utc>, String), Event>,
    event_locations: HashMap<String, (String, DateTime<Utc>)>,
    dedup: HashMap<String, String>,
    patterns: Vec<DetectedPattern>,
    recommendations: Vec<Recommendation>,
    cards: HashMap<String, Card>,
    agent_runs: Vec<AgentRun>,
    checkpoints: HashMap<(String, Cadence), DateTime<Utc>>,
    job_runs: Vec<JobRun>,
    audit: Vec<AuditLogEntry>,
    suppressions: HashMap<(String, String), Suppression>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventWarehouse for InMemoryPipelineStore {
    async fn append(&self, event: NewEvent) -> StoreResult<AppendOutcome> {
        event.validate()?;
        let dedup_key = event.dedup_key();
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.dedup.get(&dedup_key) {
            return Ok(AppendOutcome {
                event_id: existing.clone(),
                inserted: false,
            });
        }

        let event_id = kite_core::new_id("evt");
        let stored = Event {
            event_id: event_id.clone(),
            tenant_id: event.tenant_id,
            event_type: event.event_type,
            subject_id: event.subject_id,
            natural_key: event.natural_key,
            payload: event.payload,
            occurred_at: event.occurred_at,
            created_at: Utc::now(),
            processed_at: None,
        };
        let key = (
            stored.tenant_id.clone(),
            stored.occurred_at,
            event_id.clone(),
        );
        inner.dedup.insert(dedup_key, event_id.clone());
        inner.event_locations.insert(
            event_id.clone(),
            (stored.tenant_id.clone(), stored.occurred_at),
        );
        inner.events.insert(key, stored);
        Ok(AppendOutcome {
            event_id,
            inserted: true,
        })
    }

    async fn query_window(&self, query: EventQuery) -> StoreResult<EventPage> {
        let inner = self.inner.read().await;
        let lower = (query.tenant_id.clone(), query.from, String::new());
        let mut events = inner
            .events
            .range(lower..)
            .take_while(|((tenant, occurred_at, _), _)| {
                *tenant == query.tenant_id && *occurred_at < query.to
            })
            .map(|(_, event)| event)
            .filter(|event| query.matches(event))
            .take(query.limit.saturating_add(1))
            .cloned()
            .collect::<Vec<_>>();

        let next_cursor = if events.len() > query.limit {
            events.truncate(query.limit);
            events.last().map(Event::cursor)
        } else {
            None
        };
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn mark_processed(&self, tenant_id: &str, event_ids: &[String]) -> StoreResult<usize> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for event_id in event_ids {
            let Some((tenant, occurred_at)) = inner.event_locations.get(event_id).cloned() else {
                continue;
            };
            if tenant != tenant_id {
                continue;
            }
            if let Some(event) = inner.events.get_mut(&(tenant, occurred_at, event_id.clone())) {
                if event.processed_at.is_none() {
                    event.processed_at = Some(now);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl InsightStore for InMemoryPipelineStore {
    async fn insert_patterns(&self, patterns: Vec<DetectedPattern>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for pattern in &patterns {
            if inner
                .patterns
                .iter()
                .any(|existing| existing.pattern_id == pattern.pattern_id)
            {
                return Err(StoreError::AlreadyExists {
                    kind: "pattern",
                    id: pattern.pattern_id.clone(),
                });
            }
        }
        inner.patterns.extend(patterns);
        Ok(())
    }

    async fn list_patterns(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<DetectedPattern>> {
        let inner = self.inner.read().await;
        let mut patterns = inner
            .patterns
            .iter()
            .filter(|pattern| pattern.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        patterns.sort_by(|left, right| right.detected_at.cmp(&left.detected_at));
        patterns.truncate(limit);
        Ok(patterns)
    }

    async fn unmapped_actionable_patterns(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<DetectedPattern>> {
        let inner = self.inner.read().await;
        let mut patterns = inner
            .patterns
            .iter()
            .filter(|pattern| {
                pattern.tenant_id == tenant_id && pattern.actionable && pattern.mapped_at.is_none()
            })
            .cloned()
            .collect::<Vec<_>>();
        patterns.sort_by(|left, right| {
            left.detected_at
                .cmp(&right.detected_at)
                .then_with(|| left.pattern_id.cmp(&right.pattern_id))
        });
        patterns.truncate(limit);
        Ok(patterns)
    }

    async fn mark_patterns_mapped(
        &self,
        tenant_id: &str,
        pattern_ids: &[String],
    ) -> StoreResult<usize> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for pattern in inner.patterns.iter_mut().filter(|pattern| {
            pattern.tenant_id == tenant_id
                && pattern.mapped_at.is_none()
                && pattern_ids.contains(&pattern.pattern_id)
        }) {
            pattern.mapped_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn insert_recommendation_unless_cooling(
        &self,
        recommendation: Recommendation,
        cooldown_since: DateTime<Utc>,
    ) -> StoreResult<RecommendationInsert> {
        let mut inner = self.inner.write().await;
        let blocking = inner.recommendations.iter().find(|existing| {
            existing.tenant_id == recommendation.tenant_id
                && existing.cooldown_key == recommendation.cooldown_key
                && match existing.status {
                    RecommendationStatus::Pending => true,
                    RecommendationStatus::Applied => existing.created_at >= cooldown_since,
                    RecommendationStatus::Dismissed => false,
                }
        });
        if let Some(existing) = blocking {
            return Ok(RecommendationInsert::Suppressed {
                existing_id: existing.recommendation_id.clone(),
            });
        }
        if inner
            .recommendations
            .iter()
            .any(|existing| existing.recommendation_id == recommendation.recommendation_id)
        {
            return Err(StoreError::AlreadyExists {
                kind: "recommendation",
                id: recommendation.recommendation_id,
            });
        }
        inner.recommendations.push(recommendation.clone());
        Ok(RecommendationInsert::Inserted(recommendation))
    }

    async fn get_recommendation(
        &self,
        tenant_id: &str,
        recommendation_id: &str,
    ) -> StoreResult<Option<Recommendation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .recommendations
            .iter()
            .find(|item| item.tenant_id == tenant_id && item.recommendation_id == recommendation_id)
            .cloned())
    }

    async fn pending_recommendations(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Recommendation>> {
        let inner = self.inner.read().await;
        let mut pending = inner
            .recommendations
            .iter()
            .filter(|item| {
                item.tenant_id == tenant_id && item.status == RecommendationStatus::Pending
            })
            .cloned()
            .collect::<Vec<_>>();
        pending.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.created_at.cmp(&right.created_at))
                .then_with(|| left.recommendation_id.cmp(&right.recommendation_id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn transition_recommendation(
        &self,
        tenant_id: &str,
        recommendation_id: &str,
        from: RecommendationStatus,
        to: RecommendationStatus,
    ) -> StoreResult<CasOutcome<Recommendation, RecommendationStatus>> {
        from.ensure_transition(to)?;
        let mut inner = self.inner.write().await;
        let Some(item) = inner
            .recommendations
            .iter_mut()
            .find(|item| item.tenant_id == tenant_id && item.recommendation_id == recommendation_id)
        else {
            return Err(StoreError::not_found("recommendation", recommendation_id));
        };
        if item.status != from {
            return Ok(CasOutcome::Conflict {
                actual: item.status,
            });
        }
        item.status = to;
        item.updated_at = Utc::now();
        Ok(CasOutcome::Applied(item.clone()))
    }

    async fn checkpoint(
        &self,
        tenant_id: &str,
        cadence: Cadence,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(&(tenant_id.to_string(), cadence))
            .copied())
    }

    async fn advance_checkpoint(
        &self,
        tenant_id: &str,
        cadence: Cadence,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let key = (tenant_id.to_string(), cadence);
        if inner.checkpoints.get(&key).copied() != expected {
            return Ok(false);
        }
        inner.checkpoints.insert(key, next);
        Ok(true)
    }

    async fn record_job_run(&self, run: JobRun) -> StoreResult<()> {
        self.inner.write().await.job_runs.push(run);
        Ok(())
    }

    async fn list_job_runs(
        &self,
        tenant_id: &str,
        cadence: Option<Cadence>,
        limit: usize,
    ) -> StoreResult<Vec<JobRun>> {
        let inner = self.inner.read().await;
        let mut runs = inner
            .job_runs
            .iter()
            .filter(|run| {
                run.tenant_id == tenant_id && cadence.map_or(true, |value| value == run.cadence)
            })
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|left, right| right.started_at.cmp(&left.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[async_trait]
impl CardStore for InMemoryPipelineStore {
    async fn insert_card(&self, card: Card) -> StoreResult<Card> {
        card.action.validate()?;
        let mut inner = self.inner.write().await;
        if inner.cards.contains_key(&card.card_id) {
            return Err(StoreError::AlreadyExists {
                kind: "card",
                id: card.card_id,
            });
        }
        inner.cards.insert(card.card_id.clone(), card.clone());
        Ok(card)
    }

    async fn get_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<Option<Card>> {
        let inner = self.inner.read().await;
        Ok(inner
            .cards
            .get(card_id)
            .filter(|card| card.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_cards(
        &self,
        tenant_id: &str,
        state: Option<CardState>,
        limit: usize,
    ) -> StoreResult<Vec<Card>> {
        let inner = self.inner.read().await;
        let mut cards = inner
            .cards
            .values()
            .filter(|card| {
                card.tenant_id == tenant_id && state.map_or(true, |value| value == card.state)
            })
            .cloned()
            .collect::<Vec<_>>();
        cards.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.card_id.cmp(&right.card_id))
        });
        cards.truncate(limit);
        Ok(cards)
    }

    async fn transition_card(
        &self,
        tenant_id: &str,
        card_id: &str,
        transition: CardTransition,
    ) -> StoreResult<CasOutcome<Card, CardState>> {
        transition.from.ensure_transition(transition.to)?;
        let mut inner = self.inner.write().await;
        let Some(card) = inner
            .cards
            .get_mut(card_id)
            .filter(|card| card.tenant_id == tenant_id)
        else {
            return Err(StoreError::not_found("card", card_id));
        };
        if card.state != transition.from {
            return Ok(CasOutcome::Conflict { actual: card.state });
        }
        transition.apply(card, Utc::now());
        Ok(CasOutcome::Applied(card.clone()))
    }

    async fn update_card(
        &self,
        tenant_id: &str,
        card_id: &str,
        patch: CardPatch,
    ) -> StoreResult<Card> {
        patch.validate()?;
        let mut inner = self.inner.write().await;
        let Some(card) = inner
            .cards
            .get_mut(card_id)
            .filter(|card| card.tenant_id == tenant_id)
        else {
            return Err(StoreError::not_found("card", card_id));
        };
        if !card.state.is_editable() {
            return Err(StoreError::NotEditable {
                card_id: card_id.to_string(),
                state: card.state,
            });
        }
        patch.apply(card);
        card.updated_at = Utc::now();
        Ok(card.clone())
    }

    async fn delete_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let owned = inner
            .cards
            .get(card_id)
            .is_some_and(|card| card.tenant_id == tenant_id);
        if owned {
            inner.cards.remove(card_id);
        }
        Ok(owned)
    }

    async fn begin_agent_run(
        &self,
        run: AgentRun,
        stale_after: Duration,
    ) -> StoreResult<AgentRunStart> {
        let mut inner = self.inner.write().await;
        let stale_before = run.started_at - stale_after;
        for existing in inner
            .agent_runs
            .iter_mut()
            .filter(|existing| existing.tenant_id == run.tenant_id && existing.is_open())
        {
            if existing.started_at > stale_before {
                return Ok(AgentRunStart::AlreadyRunning(existing.clone()));
            }
            abandon_stale_run(existing, run.started_at);
        }
        inner.agent_runs.push(run.clone());
        Ok(AgentRunStart::Started(run))
    }

    async fn complete_agent_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        completion: AgentRunCompletion,
    ) -> StoreResult<AgentRun> {
        let mut inner = self.inner.write().await;
        let Some(run) = inner
            .agent_runs
            .iter_mut()
            .find(|run| run.tenant_id == tenant_id && run.run_id == run_id)
        else {
            return Err(StoreError::not_found("agent_run", run_id));
        };
        if run.is_open() {
            completion.apply(run, Utc::now());
        }
        Ok(run.clone())
    }

    async fn get_agent_run(&self, tenant_id: &str, run_id: &str) -> StoreResult<Option<AgentRun>> {
        let inner = self.inner.read().await;
        Ok(inner
            .agent_runs
            .iter()
            .find(|run| run.tenant_id == tenant_id && run.run_id == run_id)
            .cloned())
    }

    async fn list_agent_runs(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AgentRun>> {
        let inner = self.inner.read().await;
        let mut runs = inner
            .agent_runs
            .iter()
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|left, right| right.started_at.cmp(&left.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[async_trait]
impl OutboundStore for InMemoryPipelineStore {
    async fn append_audit(&self, entry: AuditLogEntry) -> StoreResult<()> {
        self.inner.write().await.audit.push(entry);
        Ok(())
    }

    async fn list_audit(
        &self,
        tenant_id: &str,
        card_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit
            .iter()
            .rev()
            .filter(|entry| {
                entry.tenant_id == tenant_id
                    && card_id.map_or(true, |id| entry.card_id.as_deref() == Some(id))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn add_suppression(&self, suppression: Suppression) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let key = (
            suppression.tenant_id.clone(),
            kite_types::normalize_email(&suppression.email),
        );
        if inner.suppressions.contains_key(&key) {
            return Ok(false);
        }
        let email = key.1.clone();
        inner.suppressions.insert(
            key,
            Suppression {
                email,
                ..suppression
            },
        );
        Ok(true)
    }

    async fn find_suppression(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> StoreResult<Option<Suppression>> {
        let inner = self.inner.read().await;
        Ok(inner
            .suppressions
            .get(&(tenant_id.to_string(), kite_types::normalize_email(email)))
            .cloned())
    }

    async fn remove_suppression(&self, tenant_id: &str, email: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .suppressions
            .remove(&(tenant_id.to_string(), kite_types::normalize_email(email)))
            .is_some())
    }
}

pub(crate) const STALE_RUN_SUMMARY: &str = "abandoned: superseded after stale lock timeout";

pub(crate) fn abandon_stale_run(run: &mut AgentRun, at: DateTime<Utc>) {
    tracing::warn!(
        tenant_id = %run.tenant_id,
        run_id = %run.run_id,
        "closing stale agent run"
    );
    run.status = AgentRunStatus::Failed;
    run.outcome_summary = STALE_RUN_SUMMARY.to_string();
    run.completed_at = Some(at);
}
