//! SQLite-backed pipeline store with durable persistence.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{
    AgentRun, AgentRunCompletion, AgentRunStart, AgentRunStatus, AppendOutcome, AuditLogEntry,
    Cadence, Card, CardPatch, CardState, CardStore, CardTransition, CasOutcome, DetectedPattern,
    Event, EventPage, EventQuery, EventWarehouse, InsightStore, JobRun, NewEvent, OutboundStore,
    Recommendation, RecommendationInsert, RecommendationStatus, StoreError, StoreResult,
    Suppression, STALE_RUN_SUMMARY,
};

const EVENT_COLUMNS: &str = "event_id, tenant_id, event_type, subject_id, natural_key, \
     payload_json, occurred_at, created_at, processed_at";
const PATTERN_COLUMNS: &str = "pattern_id, tenant_id, pattern_type, subject_id, subject_email, \
     window_start, window_end, confidence, evidence_json, actionable, metrics_json, created_at, \
     mapped_at";
const RECOMMENDATION_COLUMNS: &str = "recommendation_id, pattern_id, tenant_id, action_type, \
     subject_id, priority, confidence, title, rationale, action_json, status, cooldown_key, \
     created_at, updated_at";
const CARD_COLUMNS: &str = "card_id, tenant_id, card_type, title, rationale, priority, state, \
     action_json, created_by, source_recommendation_id, description, attempt, executed_at, \
     created_at, updated_at";
const AGENT_RUN_COLUMNS: &str = "run_id, tenant_id, mode, status, started_at, completed_at, \
     recommendations_seen, cards_created, cards_auto_approved, cards_executed, errors_json, \
     outcome_summary";
const JOB_RUN_COLUMNS: &str = "run_id, tenant_id, cadence, window_start, window_end, started_at, \
     finished_at, outcome, events_processed, patterns_detected, recommendations_created, error";
const AUDIT_COLUMNS: &str = "entry_id, tenant_id, card_id, channel, recipient, subject, \
     mode_at_send, result, reason_code, error, message_id, retry_after_seconds, duration_ms, \
     created_at";

/// Persistent SQLite store backend for the pipeline.
#[derive(Debug)]
pub struct SqlitePipelineStore {
    db_path: PathBuf,
}

impl SqlitePipelineStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(StdDuration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                subject_id TEXT NULL,
                natural_key TEXT NOT NULL,
                dedup_key TEXT NOT NULL UNIQUE,
                payload_json TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                processed_at TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_tenant_created ON events (tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_events_tenant_occurred
                ON events (tenant_id, occurred_at, event_id);

            CREATE TABLE IF NOT EXISTS patterns (
                pattern_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                subject_email TEXT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                confidence REAL NOT NULL,
                evidence_json TEXT NOT NULL,
                actionable INTEGER NOT NULL,
                metrics_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                mapped_at TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_patterns_tenant_created
                ON patterns (tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_patterns_unmapped
                ON patterns (tenant_id, actionable, mapped_at);

            CREATE TABLE IF NOT EXISTS recommendations (
                recommendation_id TEXT PRIMARY KEY,
                pattern_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                priority TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                confidence REAL NOT NULL,
                title TEXT NOT NULL,
                rationale TEXT NOT NULL,
                action_json TEXT NOT NULL,
                status TEXT NOT NULL,
                cooldown_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_recommendations_tenant_created
                ON recommendations (tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_recommendations_cooldown
                ON recommendations (tenant_id, cooldown_key, status);
            CREATE INDEX IF NOT EXISTS idx_recommendations_pending
                ON recommendations (tenant_id, status, priority_rank);

            CREATE TABLE IF NOT EXISTS cards (
                card_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                card_type TEXT NOT NULL,
                title TEXT NOT NULL,
                rationale TEXT NOT NULL,
                priority TEXT NOT NULL,
                state TEXT NOT NULL,
                action_json TEXT NOT NULL,
                created_by TEXT NOT NULL,
                source_recommendation_id TEXT NULL,
                description TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                executed_at TEXT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cards_tenant_created ON cards (tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_cards_tenant_state ON cards (tenant_id, state);

            CREATE TABLE IF NOT EXISTS agent_runs (
                run_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NULL,
                recommendations_seen INTEGER NOT NULL,
                cards_created INTEGER NOT NULL,
                cards_auto_approved INTEGER NOT NULL,
                cards_executed INTEGER NOT NULL,
                errors_json TEXT NOT NULL,
                outcome_summary TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_agent_runs_tenant_created
                ON agent_runs (tenant_id, created_at);

            CREATE TABLE IF NOT EXISTS audit_log (
                entry_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                card_id TEXT NULL,
                channel TEXT NOT NULL,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                mode_at_send TEXT NOT NULL,
                result TEXT NOT NULL,
                reason_code TEXT NULL,
                error TEXT NULL,
                message_id TEXT NULL,
                retry_after_seconds INTEGER NULL,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_log_tenant_created
                ON audit_log (tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_log_tenant_card ON audit_log (tenant_id, card_id);

            CREATE TABLE IF NOT EXISTS job_checkpoints (
                tenant_id TEXT NOT NULL,
                cadence TEXT NOT NULL,
                last_run_end TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, cadence)
            );

            CREATE TABLE IF NOT EXISTS job_runs (
                run_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                cadence TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                events_processed INTEGER NOT NULL,
                patterns_detected INTEGER NOT NULL,
                recommendations_created INTEGER NOT NULL,
                error TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_runs_tenant_started
                ON job_runs (tenant_id, started_at);

            CREATE TABLE IF NOT EXISTS suppressions (
                tenant_id TEXT NOT NULL,
                email TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, email)
            );
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl EventWarehouse for SqlitePipelineStore {
    async fn append(&self, event: NewEvent) -> StoreResult<AppendOutcome> {
        event.validate()?;
        let dedup_key = event.dedup_key();
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = transaction
            .query_row(
                "SELECT event_id FROM events WHERE dedup_key = ?1",
                params![dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(event_id) = existing {
            transaction.commit()?;
            return Ok(AppendOutcome {
                event_id,
                inserted: false,
            });
        }

        let event_id = kite_core::new_id("evt");
        transaction.execute(
            r#"
            INSERT INTO events (
                event_id, tenant_id, event_type, subject_id, natural_key, dedup_key,
                payload_json, occurred_at, created_at, processed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)
            "#,
            params![
                event_id,
                event.tenant_id,
                event.event_type.as_str(),
                event.subject_id,
                event.natural_key,
                dedup_key,
                serialize_json(&event.payload)?,
                timestamp_to_db(event.occurred_at),
                timestamp_to_db(Utc::now()),
            ],
        )?;
        transaction.commit()?;
        Ok(AppendOutcome {
            event_id,
            inserted: true,
        })
    }

    async fn query_window(&self, query: EventQuery) -> StoreResult<EventPage> {
        let connection = self.open_connection()?;
        let (after_at, after_id) = match &query.after {
            Some(cursor) => (
                Some(timestamp_to_db(cursor.occurred_at)),
                Some(cursor.event_id.clone()),
            ),
            None => (None, None),
        };
        let fetch = i64::try_from(query.limit.saturating_add(1)).unwrap_or(i64::MAX);
        let mut statement = connection.prepare(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE tenant_id = ?1
              AND occurred_at >= ?2
              AND occurred_at < ?3
              AND (?4 IS NULL OR event_type = ?4)
              AND (?5 = 0 OR processed_at IS NULL)
              AND (?6 IS NULL OR occurred_at > ?6 OR (occurred_at = ?6 AND event_id > ?7))
            ORDER BY occurred_at ASC, event_id ASC
            LIMIT ?8
            "#
        ))?;
        let rows = statement.query_map(
            params![
                query.tenant_id,
                timestamp_to_db(query.from),
                timestamp_to_db(query.to),
                query.event_type.map(|kind| kind.as_str()),
                query.unprocessed_only,
                after_at,
                after_id,
                fetch,
            ],
            read_event_row,
        )?;
        let mut events = rows
            .map(|row| row.map_err(StoreError::from).and_then(EventRow::into_event))
            .collect::<StoreResult<Vec<_>>>()?;

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
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = timestamp_to_db(Utc::now());
        let mut changed = 0;
        {
            let mut statement = transaction.prepare(
                r#"
                UPDATE events SET processed_at = ?1
                WHERE tenant_id = ?2 AND event_id = ?3 AND processed_at IS NULL
                "#,
            )?;
            for event_id in event_ids {
                changed += statement.execute(params![now, tenant_id, event_id])?;
            }
        }
        transaction.commit()?;
        Ok(changed)
    }
}

#[async_trait]
impl InsightStore for SqlitePipelineStore {
    async fn insert_patterns(&self, patterns: Vec<DetectedPattern>) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut statement = transaction.prepare(&format!(
                "INSERT INTO patterns ({PATTERN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ))?;
            for pattern in &patterns {
                statement.execute(params![
                    pattern.pattern_id,
                    pattern.tenant_id,
                    pattern.pattern_type.as_str(),
                    pattern.subject_id,
                    pattern.subject_email,
                    timestamp_to_db(pattern.window_start),
                    timestamp_to_db(pattern.window_end),
                    pattern.confidence,
                    serialize_json(&pattern.evidence)?,
                    pattern.actionable,
                    serialize_json(&pattern.metrics)?,
                    timestamp_to_db(pattern.detected_at),
                    option_timestamp_to_db(pattern.mapped_at),
                ])?;
            }
        }
        transaction.commit()?;
        Ok(())
    }

    async fn list_patterns(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<DetectedPattern>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns WHERE tenant_id = ?1 \
             ORDER BY created_at DESC, pattern_id ASC LIMIT ?2"
        ))?;
        let rows = statement.query_map(params![tenant_id, limit_to_db(limit)], read_pattern_row)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(PatternRow::into_pattern))
            .collect()
    }

    async fn unmapped_actionable_patterns(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<DetectedPattern>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM patterns \
             WHERE tenant_id = ?1 AND actionable = 1 AND mapped_at IS NULL \
             ORDER BY created_at ASC, pattern_id ASC LIMIT ?2"
        ))?;
        let rows = statement.query_map(params![tenant_id, limit_to_db(limit)], read_pattern_row)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(PatternRow::into_pattern))
            .collect()
    }

    async fn mark_patterns_mapped(
        &self,
        tenant_id: &str,
        pattern_ids: &[String],
    ) -> StoreResult<usize> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = timestamp_to_db(Utc::now());
        let mut changed = 0;
        {
            let mut statement = transaction.prepare(
                "UPDATE patterns SET mapped_at = ?1 \
                 WHERE tenant_id = ?2 AND pattern_id = ?3 AND mapped_at IS NULL",
            )?;
            for pattern_id in pattern_ids {
                changed += statement.execute(params![now, tenant_id, pattern_id])?;
            }
        }
        transaction.commit()?;
        Ok(changed)
    }

    async fn insert_recommendation_unless_cooling(
        &self,
        recommendation: Recommendation,
        cooldown_since: DateTime<Utc>,
    ) -> StoreResult<RecommendationInsert> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = transaction
            .query_row(
                r#"
                SELECT recommendation_id FROM recommendations
                WHERE tenant_id = ?1
                  AND cooldown_key = ?2
                  AND (status = 'pending' OR (status = 'applied' AND created_at >= ?3))
                ORDER BY created_at ASC
                LIMIT 1
                "#,
                params![
                    recommendation.tenant_id,
                    recommendation.cooldown_key,
                    timestamp_to_db(cooldown_since),
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_id) = existing {
            transaction.commit()?;
            return Ok(RecommendationInsert::Suppressed { existing_id });
        }

        transaction.execute(
            &format!(
                "INSERT INTO recommendations ({RECOMMENDATION_COLUMNS}, priority_rank) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                recommendation.recommendation_id,
                recommendation.pattern_id,
                recommendation.tenant_id,
                recommendation.action_type.as_str(),
                recommendation.subject_id,
                recommendation.priority.as_str(),
                recommendation.confidence,
                recommendation.title,
                recommendation.rationale,
                serialize_json(&recommendation.action)?,
                recommendation.status.as_str(),
                recommendation.cooldown_key,
                timestamp_to_db(recommendation.created_at),
                timestamp_to_db(recommendation.updated_at),
                i64::from(recommendation.priority.rank()),
            ],
        )?;
        transaction.commit()?;
        Ok(RecommendationInsert::Inserted(recommendation))
    }

    async fn get_recommendation(
        &self,
        tenant_id: &str,
        recommendation_id: &str,
    ) -> StoreResult<Option<Recommendation>> {
        let connection = self.open_connection()?;
        load_recommendation(&connection, tenant_id, recommendation_id)
    }

    async fn pending_recommendations(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Recommendation>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
             WHERE tenant_id = ?1 AND status = 'pending' \
             ORDER BY priority_rank DESC, created_at ASC, recommendation_id ASC LIMIT ?2"
        ))?;
        let rows = statement.query_map(
            params![tenant_id, limit_to_db(limit)],
            read_recommendation_row,
        )?;
        rows.map(|row| {
            row.map_err(StoreError::from)
                .and_then(RecommendationRow::into_recommendation)
        })
        .collect()
    }

    async fn transition_recommendation(
        &self,
        tenant_id: &str,
        recommendation_id: &str,
        from: RecommendationStatus,
        to: RecommendationStatus,
    ) -> StoreResult<CasOutcome<Recommendation, RecommendationStatus>> {
        from.ensure_transition(to)?;
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut recommendation) =
            load_recommendation(&transaction, tenant_id, recommendation_id)?
        else {
            return Err(StoreError::not_found("recommendation", recommendation_id));
        };
        if recommendation.status != from {
            transaction.commit()?;
            return Ok(CasOutcome::Conflict {
                actual: recommendation.status,
            });
        }

        recommendation.status = to;
        recommendation.updated_at = Utc::now();
        transaction.execute(
            r#"
            UPDATE recommendations SET status = ?1, updated_at = ?2
            WHERE tenant_id = ?3 AND recommendation_id = ?4 AND status = ?5
            "#,
            params![
                to.as_str(),
                timestamp_to_db(recommendation.updated_at),
                tenant_id,
                recommendation_id,
                from.as_str(),
            ],
        )?;
        transaction.commit()?;
        Ok(CasOutcome::Applied(recommendation))
    }

    async fn checkpoint(
        &self,
        tenant_id: &str,
        cadence: Cadence,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let connection = self.open_connection()?;
        let value: Option<String> = connection
            .query_row(
                "SELECT last_run_end FROM job_checkpoints WHERE tenant_id = ?1 AND cadence = ?2",
                params![tenant_id, cadence.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        option_timestamp_from_db(value)
    }

    async fn advance_checkpoint(
        &self,
        tenant_id: &str,
        cadence: Cadence,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = transaction
            .query_row(
                "SELECT last_run_end FROM job_checkpoints WHERE tenant_id = ?1 AND cadence = ?2",
                params![tenant_id, cadence.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if current != option_timestamp_to_db(expected) {
            transaction.commit()?;
            return Ok(false);
        }
        transaction.execute(
            r#"
            INSERT INTO job_checkpoints (tenant_id, cadence, last_run_end, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id, cadence)
            DO UPDATE SET last_run_end = excluded.last_run_end, updated_at = excluded.updated_at
            "#,
            params![
                tenant_id,
                cadence.as_str(),
                timestamp_to_db(next),
                timestamp_to_db(Utc::now()),
            ],
        )?;
        transaction.commit()?;
        Ok(true)
    }

    async fn record_job_run(&self, run: JobRun) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            &format!(
                "INSERT INTO job_runs ({JOB_RUN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                run.run_id,
                run.tenant_id,
                run.cadence.as_str(),
                timestamp_to_db(run.window_start),
                timestamp_to_db(run.window_end),
                timestamp_to_db(run.started_at),
                timestamp_to_db(run.finished_at),
                run.outcome.as_str(),
                u64_to_db(run.events_processed),
                u64_to_db(run.patterns_detected),
                u64_to_db(run.recommendations_created),
                run.error,
            ],
        )?;
        Ok(())
    }

    async fn list_job_runs(
        &self,
        tenant_id: &str,
        cadence: Option<Cadence>,
        limit: usize,
    ) -> StoreResult<Vec<JobRun>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {JOB_RUN_COLUMNS} FROM job_runs \
             WHERE tenant_id = ?1 AND (?2 IS NULL OR cadence = ?2) \
             ORDER BY started_at DESC, run_id ASC LIMIT ?3"
        ))?;
        let rows = statement.query_map(
            params![
                tenant_id,
                cadence.map(|value| value.as_str()),
                limit_to_db(limit)
            ],
            |row| {
                Ok(JobRunRow {
                    run_id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    cadence: row.get(2)?,
                    window_start: row.get(3)?,
                    window_end: row.get(4)?,
                    started_at: row.get(5)?,
                    finished_at: row.get(6)?,
                    outcome: row.get(7)?,
                    events_processed: row.get(8)?,
                    patterns_detected: row.get(9)?,
                    recommendations_created: row.get(10)?,
                    error: row.get(11)?,
                })
            },
        )?;
        rows.map(|row| row.map_err(StoreError::from).and_then(JobRunRow::into_job_run))
            .collect()
    }
}

#[async_trait]
impl CardStore for SqlitePipelineStore {
    async fn insert_card(&self, card: Card) -> StoreResult<Card> {
        card.action.validate()?;
        let connection = self.open_connection()?;
        let exists = connection
            .query_row(
                "SELECT 1 FROM cards WHERE card_id = ?1",
                params![card.card_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::AlreadyExists {
                kind: "card",
                id: card.card_id,
            });
        }
        connection.execute(
            &format!(
                "INSERT INTO cards ({CARD_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                card.card_id,
                card.tenant_id,
                card.card_type.as_str(),
                card.title,
                card.rationale,
                card.priority.as_str(),
                card.state.as_str(),
                serialize_json(&card.action)?,
                card.created_by,
                card.source_recommendation_id,
                card.description,
                i64::from(card.attempt),
                option_timestamp_to_db(card.executed_at),
                timestamp_to_db(card.created_at),
                timestamp_to_db(card.updated_at),
            ],
        )?;
        Ok(card)
    }

    async fn get_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<Option<Card>> {
        let connection = self.open_connection()?;
        load_card(&connection, tenant_id, card_id)
    }

    async fn list_cards(
        &self,
        tenant_id: &str,
        state: Option<CardState>,
        limit: usize,
    ) -> StoreResult<Vec<Card>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {CARD_COLUMNS} FROM cards \
             WHERE tenant_id = ?1 AND (?2 IS NULL OR state = ?2) \
             ORDER BY created_at ASC, card_id ASC LIMIT ?3"
        ))?;
        let rows = statement.query_map(
            params![
                tenant_id,
                state.map(|value| value.as_str()),
                limit_to_db(limit)
            ],
            read_card_row,
        )?;
        rows.map(|row| row.map_err(StoreError::from).and_then(CardRow::into_card))
            .collect()
    }

    async fn transition_card(
        &self,
        tenant_id: &str,
        card_id: &str,
        transition: CardTransition,
    ) -> StoreResult<CasOutcome<Card, CardState>> {
        transition.from.ensure_transition(transition.to)?;
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut card) = load_card(&transaction, tenant_id, card_id)? else {
            return Err(StoreError::not_found("card", card_id));
        };
        if card.state != transition.from {
            transaction.commit()?;
            return Ok(CasOutcome::Conflict { actual: card.state });
        }

        transition.apply(&mut card, Utc::now());
        transaction.execute(
            r#"
            UPDATE cards
            SET state = ?1, attempt = ?2, description = ?3, executed_at = ?4, updated_at = ?5
            WHERE tenant_id = ?6 AND card_id = ?7 AND state = ?8
            "#,
            params![
                card.state.as_str(),
                i64::from(card.attempt),
                card.description,
                option_timestamp_to_db(card.executed_at),
                timestamp_to_db(card.updated_at),
                tenant_id,
                card_id,
                transition.from.as_str(),
            ],
        )?;
        transaction.commit()?;
        Ok(CasOutcome::Applied(card))
    }

    async fn update_card(
        &self,
        tenant_id: &str,
        card_id: &str,
        patch: CardPatch,
    ) -> StoreResult<Card> {
        patch.validate()?;
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut card) = load_card(&transaction, tenant_id, card_id)? else {
            return Err(StoreError::not_found("card", card_id));
        };
        if !card.state.is_editable() {
            return Err(StoreError::NotEditable {
                card_id: card_id.to_string(),
                state: card.state,
            });
        }

        patch.apply(&mut card);
        card.updated_at = Utc::now();
        transaction.execute(
            r#"
            UPDATE cards
            SET card_type = ?1, title = ?2, rationale = ?3, priority = ?4, action_json = ?5,
                description = ?6, updated_at = ?7
            WHERE tenant_id = ?8 AND card_id = ?9
            "#,
            params![
                card.card_type.as_str(),
                card.title,
                card.rationale,
                card.priority.as_str(),
                serialize_json(&card.action)?,
                card.description,
                timestamp_to_db(card.updated_at),
                tenant_id,
                card_id,
            ],
        )?;
        transaction.commit()?;
        Ok(card)
    }

    async fn delete_card(&self, tenant_id: &str, card_id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let deleted = connection.execute(
            "DELETE FROM cards WHERE tenant_id = ?1 AND card_id = ?2",
            params![tenant_id, card_id],
        )?;
        Ok(deleted > 0)
    }

    async fn begin_agent_run(
        &self,
        run: AgentRun,
        stale_after: Duration,
    ) -> StoreResult<AgentRunStart> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let open_runs = {
            let mut statement = transaction.prepare(&format!(
                "SELECT {AGENT_RUN_COLUMNS} FROM agent_runs \
                 WHERE tenant_id = ?1 AND completed_at IS NULL ORDER BY started_at DESC"
            ))?;
            let rows = statement.query_map(params![run.tenant_id], read_agent_run_row)?;
            rows.map(|row| row.map_err(StoreError::from).and_then(AgentRunRow::into_agent_run))
                .collect::<StoreResult<Vec<_>>>()?
        };

        let stale_before = run.started_at - stale_after;
        if let Some(active) = open_runs.iter().find(|open| open.started_at > stale_before) {
            transaction.commit()?;
            return Ok(AgentRunStart::AlreadyRunning(active.clone()));
        }
        for mut stale in open_runs {
            crate::abandon_stale_run(&mut stale, run.started_at);
            transaction.execute(
                "UPDATE agent_runs SET status = ?1, outcome_summary = ?2, completed_at = ?3 \
                 WHERE run_id = ?4 AND completed_at IS NULL",
                params![
                    stale.status.as_str(),
                    STALE_RUN_SUMMARY,
                    option_timestamp_to_db(stale.completed_at),
                    stale.run_id,
                ],
            )?;
        }

        transaction.execute(
            &format!(
                "INSERT INTO agent_runs ({AGENT_RUN_COLUMNS}, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                run.run_id,
                run.tenant_id,
                run.mode.as_str(),
                run.status.as_str(),
                timestamp_to_db(run.started_at),
                option_timestamp_to_db(run.completed_at),
                i64::from(run.recommendations_seen),
                i64::from(run.cards_created),
                i64::from(run.cards_auto_approved),
                i64::from(run.cards_executed),
                serialize_json(&run.errors)?,
                run.outcome_summary,
                timestamp_to_db(run.started_at),
            ],
        )?;
        transaction.commit()?;
        Ok(AgentRunStart::Started(run))
    }

    async fn complete_agent_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        completion: AgentRunCompletion,
    ) -> StoreResult<AgentRun> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut run) = load_agent_run(&transaction, tenant_id, run_id)? else {
            return Err(StoreError::not_found("agent_run", run_id));
        };
        if !run.is_open() {
            transaction.commit()?;
            return Ok(run);
        }

        completion.apply(&mut run, Utc::now());
        transaction.execute(
            r#"
            UPDATE agent_runs
            SET status = ?1, completed_at = ?2, recommendations_seen = ?3, cards_created = ?4,
                cards_auto_approved = ?5, cards_executed = ?6, errors_json = ?7,
                outcome_summary = ?8
            WHERE tenant_id = ?9 AND run_id = ?10 AND completed_at IS NULL
            "#,
            params![
                run.status.as_str(),
                option_timestamp_to_db(run.completed_at),
                i64::from(run.recommendations_seen),
                i64::from(run.cards_created),
                i64::from(run.cards_auto_approved),
                i64::from(run.cards_executed),
                serialize_json(&run.errors)?,
                run.outcome_summary,
                tenant_id,
                run_id,
            ],
        )?;
        transaction.commit()?;
        Ok(run)
    }

    async fn get_agent_run(&self, tenant_id: &str, run_id: &str) -> StoreResult<Option<AgentRun>> {
        let connection = self.open_connection()?;
        load_agent_run(&connection, tenant_id, run_id)
    }

    async fn list_agent_runs(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AgentRun>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {AGENT_RUN_COLUMNS} FROM agent_runs WHERE tenant_id = ?1 \
             ORDER BY started_at DESC, run_id ASC LIMIT ?2"
        ))?;
        let rows =
            statement.query_map(params![tenant_id, limit_to_db(limit)], read_agent_run_row)?;
        rows.map(|row| row.map_err(StoreError::from).and_then(AgentRunRow::into_agent_run))
            .collect()
    }
}

#[async_trait]
impl OutboundStore for SqlitePipelineStore {
    async fn append_audit(&self, entry: AuditLogEntry) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            &format!(
                "INSERT INTO audit_log ({AUDIT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                entry.entry_id,
                entry.tenant_id,
                entry.card_id,
                entry.channel.as_str(),
                entry.recipient,
                entry.subject,
                entry.mode_at_send.as_str(),
                entry.result.as_str(),
                entry.reason_code,
                entry.error,
                entry.message_id,
                entry.retry_after_seconds.map(u64_to_db),
                u64_to_db(entry.duration_ms),
                timestamp_to_db(entry.created_at),
            ],
        )?;
        Ok(())
    }

    async fn list_audit(
        &self,
        tenant_id: &str,
        card_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log \
             WHERE tenant_id = ?1 AND (?2 IS NULL OR card_id = ?2) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?3"
        ))?;
        let rows = statement.query_map(
            params![tenant_id, card_id, limit_to_db(limit)],
            |row| {
                Ok(AuditRow {
                    entry_id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    card_id: row.get(2)?,
                    channel: row.get(3)?,
                    recipient: row.get(4)?,
                    subject: row.get(5)?,
                    mode_at_send: row.get(6)?,
                    result: row.get(7)?,
                    reason_code: row.get(8)?,
                    error: row.get(9)?,
                    message_id: row.get(10)?,
                    retry_after_seconds: row.get(11)?,
                    duration_ms: row.get(12)?,
                    created_at: row.get(13)?,
                })
            },
        )?;
        rows.map(|row| row.map_err(StoreError::from).and_then(AuditRow::into_entry))
            .collect()
    }

    async fn add_suppression(&self, suppression: Suppression) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT INTO suppressions (tenant_id, email, reason, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id, email) DO NOTHING
            "#,
            params![
                suppression.tenant_id,
                kite_types::normalize_email(&suppression.email),
                suppression.reason.as_str(),
                timestamp_to_db(suppression.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn find_suppression(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> StoreResult<Option<Suppression>> {
        let connection = self.open_connection()?;
        let row: Option<(String, String, String, String)> = connection
            .query_row(
                "SELECT tenant_id, email, reason, created_at FROM suppressions \
                 WHERE tenant_id = ?1 AND email = ?2",
                params![tenant_id, kite_types::normalize_email(email)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(|(tenant_id, email, reason, created_at)| {
            Ok(Suppression {
                tenant_id,
                email,
                reason: enum_from_db("suppression_reason", &reason)?,
                created_at: timestamp_from_db(&created_at)?,
            })
        })
        .transpose()
    }

    async fn remove_suppression(&self, tenant_id: &str, email: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM suppressions WHERE tenant_id = ?1 AND email = ?2",
            params![tenant_id, kite_types::normalize_email(email)],
        )?;
        Ok(removed > 0)
    }
}

struct EventRow {
    event_id: String,
    tenant_id: String,
    event_type: String,
    subject_id: Option<String>,
    natural_key: String,
    payload_json: String,
    occurred_at: String,
    created_at: String,
    processed_at: Option<String>,
}

fn read_event_row(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_id: row.get(0)?,
        tenant_id: row.get(1)?,
        event_type: row.get(2)?,
        subject_id: row.get(3)?,
        natural_key: row.get(4)?,
        payload_json: row.get(5)?,
        occurred_at: row.get(6)?,
        created_at: row.get(7)?,
        processed_at: row.get(8)?,
    })
}

impl EventRow {
    fn into_event(self) -> StoreResult<Event> {
        Ok(Event {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            event_type: enum_from_db("event_type", &self.event_type)?,
            subject_id: self.subject_id,
            natural_key: self.natural_key,
            payload: deserialize_json(&self.payload_json)?,
            occurred_at: timestamp_from_db(&self.occurred_at)?,
            created_at: timestamp_from_db(&self.created_at)?,
            processed_at: option_timestamp_from_db(self.processed_at)?,
        })
    }
}

struct PatternRow {
    pattern_id: String,
    tenant_id: String,
    pattern_type: String,
    subject_id: String,
    subject_email: Option<String>,
    window_start: String,
    window_end: String,
    confidence: f64,
    evidence_json: String,
    actionable: bool,
    metrics_json: String,
    created_at: String,
    mapped_at: Option<String>,
}

fn read_pattern_row(row: &Row<'_>) -> rusqlite::Result<PatternRow> {
    Ok(PatternRow {
        pattern_id: row.get(0)?,
        tenant_id: row.get(1)?,
        pattern_type: row.get(2)?,
        subject_id: row.get(3)?,
        subject_email: row.get(4)?,
        window_start: row.get(5)?,
        window_end: row.get(6)?,
        confidence: row.get(7)?,
        evidence_json: row.get(8)?,
        actionable: row.get(9)?,
        metrics_json: row.get(10)?,
        created_at: row.get(11)?,
        mapped_at: row.get(12)?,
    })
}

impl PatternRow {
    fn into_pattern(self) -> StoreResult<DetectedPattern> {
        Ok(DetectedPattern {
            pattern_id: self.pattern_id,
            tenant_id: self.tenant_id,
            pattern_type: enum_from_db("pattern_type", &self.pattern_type)?,
            subject_id: self.subject_id,
            subject_email: self.subject_email,
            window_start: timestamp_from_db(&self.window_start)?,
            window_end: timestamp_from_db(&self.window_end)?,
            confidence: self.confidence,
            evidence: deserialize_json(&self.evidence_json)?,
            actionable: self.actionable,
            metrics: deserialize_json(&self.metrics_json)?,
            detected_at: timestamp_from_db(&self.created_at)?,
            mapped_at: option_timestamp_from_db(self.mapped_at)?,
        })
    }
}

struct RecommendationRow {
    recommendation_id: String,
    pattern_id: String,
    tenant_id: String,
    action_type: String,
    subject_id: String,
    priority: String,
    confidence: f64,
    title: String,
    rationale: String,
    action_json: String,
    status: String,
    cooldown_key: String,
    created_at: String,
    updated_at: String,
}

fn read_recommendation_row(row: &Row<'_>) -> rusqlite::Result<RecommendationRow> {
    Ok(RecommendationRow {
        recommendation_id: row.get(0)?,
        pattern_id: row.get(1)?,
        tenant_id: row.get(2)?,
        action_type: row.get(3)?,
        subject_id: row.get(4)?,
        priority: row.get(5)?,
        confidence: row.get(6)?,
        title: row.get(7)?,
        rationale: row.get(8)?,
        action_json: row.get(9)?,
        status: row.get(10)?,
        cooldown_key: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl RecommendationRow {
    fn into_recommendation(self) -> StoreResult<Recommendation> {
        Ok(Recommendation {
            recommendation_id: self.recommendation_id,
            pattern_id: self.pattern_id,
            tenant_id: self.tenant_id,
            action_type: enum_from_db("action_type", &self.action_type)?,
            subject_id: self.subject_id,
            priority: enum_from_db("priority", &self.priority)?,
            confidence: self.confidence,
            title: self.title,
            rationale: self.rationale,
            action: deserialize_json(&self.action_json)?,
            status: enum_from_db("recommendation_status", &self.status)?,
            cooldown_key: self.cooldown_key,
            created_at: timestamp_from_db(&self.created_at)?,
            updated_at: timestamp_from_db(&self.updated_at)?,
        })
    }
}

fn load_recommendation(
    connection: &Connection,
    tenant_id: &str,
    recommendation_id: &str,
) -> StoreResult<Option<Recommendation>> {
    connection
        .query_row(
            &format!(
                "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
                 WHERE tenant_id = ?1 AND recommendation_id = ?2"
            ),
            params![tenant_id, recommendation_id],
            read_recommendation_row,
        )
        .optional()?
        .map(RecommendationRow::into_recommendation)
        .transpose()
}

struct CardRow {
    card_id: String,
    tenant_id: String,
    card_type: String,
    title: String,
    rationale: String,
    priority: String,
    state: String,
    action_json: String,
    created_by: String,
    source_recommendation_id: Option<String>,
    description: String,
    attempt: i64,
    executed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_card_row(row: &Row<'_>) -> rusqlite::Result<CardRow> {
    Ok(CardRow {
        card_id: row.get(0)?,
        tenant_id: row.get(1)?,
        card_type: row.get(2)?,
        title: row.get(3)?,
        rationale: row.get(4)?,
        priority: row.get(5)?,
        state: row.get(6)?,
        action_json: row.get(7)?,
        created_by: row.get(8)?,
        source_recommendation_id: row.get(9)?,
        description: row.get(10)?,
        attempt: row.get(11)?,
        executed_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl CardRow {
    fn into_card(self) -> StoreResult<Card> {
        Ok(Card {
            card_id: self.card_id,
            tenant_id: self.tenant_id,
            card_type: enum_from_db("card_type", &self.card_type)?,
            title: self.title,
            rationale: self.rationale,
            priority: enum_from_db("priority", &self.priority)?,
            state: enum_from_db("card_state", &self.state)?,
            action: deserialize_json(&self.action_json)?,
            created_by: self.created_by,
            source_recommendation_id: self.source_recommendation_id,
            description: self.description,
            attempt: i64_to_u32("attempt", self.attempt)?,
            executed_at: option_timestamp_from_db(self.executed_at)?,
            created_at: timestamp_from_db(&self.created_at)?,
            updated_at: timestamp_from_db(&self.updated_at)?,
        })
    }
}

fn load_card(connection: &Connection, tenant_id: &str, card_id: &str) -> StoreResult<Option<Card>> {
    connection
        .query_row(
            &format!("SELECT {CARD_COLUMNS} FROM cards WHERE tenant_id = ?1 AND card_id = ?2"),
            params![tenant_id, card_id],
            read_card_row,
        )
        .optional()?
        .map(CardRow::into_card)
        .transpose()
}

struct AgentRunRow {
    run_id: String,
    tenant_id: String,
    mode: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    recommendations_seen: i64,
    cards_created: i64,
    cards_auto_approved: i64,
    cards_executed: i64,
    errors_json: String,
    outcome_summary: String,
}

fn read_agent_run_row(row: &Row<'_>) -> rusqlite::Result<AgentRunRow> {
    Ok(AgentRunRow {
        run_id: row.get(0)?,
        tenant_id: row.get(1)?,
        mode: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        recommendations_seen: row.get(6)?,
        cards_created: row.get(7)?,
        cards_auto_approved: row.get(8)?,
        cards_executed: row.get(9)?,
        errors_json: row.get(10)?,
        outcome_summary: row.get(11)?,
    })
}

impl AgentRunRow {
    fn into_agent_run(self) -> StoreResult<AgentRun> {
        Ok(AgentRun {
            run_id: self.run_id,
            tenant_id: self.tenant_id,
            mode: enum_from_db("agent_mode", &self.mode)?,
            status: enum_from_db::<AgentRunStatus>("agent_run_status", &self.status)?,
            started_at: timestamp_from_db(&self.started_at)?,
            completed_at: option_timestamp_from_db(self.completed_at)?,
            recommendations_seen: i64_to_u32("recommendations_seen", self.recommendations_seen)?,
            cards_created: i64_to_u32("cards_created", self.cards_created)?,
            cards_auto_approved: i64_to_u32("cards_auto_approved", self.cards_auto_approved)?,
            cards_executed: i64_to_u32("cards_executed", self.cards_executed)?,
            errors: deserialize_json(&self.errors_json)?,
            outcome_summary: self.outcome_summary,
        })
    }
}

fn load_agent_run(
    connection: &Connection,
    tenant_id: &str,
    run_id: &str,
) -> StoreResult<Option<AgentRun>> {
    connection
        .query_row(
            &format!(
                "SELECT {AGENT_RUN_COLUMNS} FROM agent_runs WHERE tenant_id = ?1 AND run_id = ?2"
            ),
            params![tenant_id, run_id],
            read_agent_run_row,
        )
        .optional()?
        .map(AgentRunRow::into_agent_run)
        .transpose()
}

struct JobRunRow {
    run_id: String,
    tenant_id: String,
    cadence: String,
    window_start: String,
    window_end: String,
    started_at: String,
    finished_at: String,
    outcome: String,
    events_processed: i64,
    patterns_detected: i64,
    recommendations_created: i64,
    error: Option<String>,
}

impl JobRunRow {
    fn into_job_run(self) -> StoreResult<JobRun> {
        Ok(JobRun {
            run_id: self.run_id,
            tenant_id: self.tenant_id,
            cadence: enum_from_db("cadence", &self.cadence)?,
            window_start: timestamp_from_db(&self.window_start)?,
            window_end: timestamp_from_db(&self.window_end)?,
            started_at: timestamp_from_db(&self.started_at)?,
            finished_at: timestamp_from_db(&self.finished_at)?,
            outcome: enum_from_db("job_outcome", &self.outcome)?,
            events_processed: i64_to_u64("events_processed", self.events_processed)?,
            patterns_detected: i64_to_u64("patterns_detected", self.patterns_detected)?,
            recommendations_created: i64_to_u64(
                "recommendations_created",
                self.recommendations_created,
            )?,
            error: self.error,
        })
    }
}

struct AuditRow {
    entry_id: String,
    tenant_id: String,
    card_id: Option<String>,
    channel: String,
    recipient: String,
    subject: String,
    mode_at_send: String,
    result: String,
    reason_code: Option<String>,
    error: Option<String>,
    message_id: Option<String>,
    retry_after_seconds: Option<i64>,
    duration_ms: i64,
    created_at: String,
}

impl AuditRow {
    fn into_entry(self) -> StoreResult<AuditLogEntry> {
        Ok(AuditLogEntry {
            entry_id: self.entry_id,
            tenant_id: self.tenant_id,
            card_id: self.card_id,
            channel: enum_from_db("channel", &self.channel)?,
            recipient: self.recipient,
            subject: self.subject,
            mode_at_send: enum_from_db("mode_at_send", &self.mode_at_send)?,
            result: enum_from_db("audit_result", &self.result)?,
            reason_code: self.reason_code,
            error: self.error,
            message_id: self.message_id,
            retry_after_seconds: self
                .retry_after_seconds
                .map(|value| i64_to_u64("retry_after_seconds", value))
                .transpose()?,
            duration_ms: i64_to_u64("duration_ms", self.duration_ms)?,
            created_at: timestamp_from_db(&self.created_at)?,
        })
    }
}

fn serialize_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(StoreError::from)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> StoreResult<T> {
    serde_json::from_str(value).map_err(StoreError::from)
}

/// Fixed-width so lexical order in SQL matches chronological order.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn enum_from_db<T: FromStr>(field: &'static str, value: &str) -> StoreResult<T> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidPersistedValue {
            field,
            value: value.to_string(),
        })
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn u64_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u32(field: &'static str, value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn i64_to_u64(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
