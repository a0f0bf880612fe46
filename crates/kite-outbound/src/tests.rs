use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use kite_core::{Clock, ManualClock};
use kite_store::{InMemoryPipelineStore, OutboundStore, StoreError, StoreResult};
use kite_types::{
    AuditLogEntry, AuditResult, EventType, NewEvent, RateLimitSettings, RolloutMode,
    Suppression, SuppressionReason, TenantRegistry, TenantSettings,
};
use serde_json::json;

use super::*;

const TENANT: &str = "acme";

struct Harness {
    gate: OutboundGate,
    store: Arc<InMemoryPipelineStore>,
    provider: Arc<RecordingEmailProvider>,
    clock: ManualClock,
}

fn harness(settings: TenantSettings) -> Harness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap());
    let store = Arc::new(InMemoryPipelineStore::new());
    let provider = Arc::new(RecordingEmailProvider::new());
    let mut tenants = BTreeMap::new();
    tenants.insert(TENANT.to_string(), settings);
    let gate = OutboundGate::new(
        Arc::new(TenantRegistry::new(TenantSettings::default(), tenants)),
        store.clone(),
        Arc::new(SlidingWindowRateLimiter::new(Arc::new(clock.clone()))),
        provider.clone(),
    )
    .with_clock(Arc::new(clock.clone()));
    Harness {
        gate,
        store,
        provider,
        clock,
    }
}

fn settings(mode: RolloutMode) -> TenantSettings {
    TenantSettings {
        send_mode: mode,
        internal_domains: vec!["acme.test".to_string()],
        ..TenantSettings::default()
    }
}

fn email(to: &str) -> OutboundEmail {
    OutboundEmail::new(TENANT, to, "Quarterly check-in").with_text("Hi there")
}

async fn audit_rows(store: &InMemoryPipelineStore) -> Vec<AuditLogEntry> {
    store.list_audit(TENANT, None, 100).await.expect("audit")
}

#[tokio::test]
async fn functional_dry_run_simulates_without_calling_provider() {
    let harness = harness(settings(RolloutMode::DryRun));

    let result = harness.gate.send(email("dana@client.test")).await;

    assert!(result.success);
    assert!(result.simulated);
    assert_eq!(result.reason_code.as_deref(), Some(REASON_DRY_RUN));
    assert_eq!(result.http_status(), 200);
    assert_eq!(harness.provider.sent_count(), 0);
    let rows = audit_rows(&harness.store).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].result, AuditResult::Simulated);
    assert_eq!(rows[0].mode_at_send, RolloutMode::DryRun);
    assert_eq!(rows[0].entry_id, result.audit_id);
}

#[tokio::test]
async fn functional_rate_limit_blocks_sixth_send_with_bounded_retry_after() {
    let harness = harness(TenantSettings {
        rate_limit: RateLimitSettings {
            max_sends: 5,
            limited_live_max_sends: 5,
            window_seconds: 60,
        },
        ..settings(RolloutMode::Live)
    });

    for index in 0..5 {
        let result = harness
            .gate
            .send(email(&format!("contact{index}@client.test")))
            .await;
        assert_eq!(result.result(), AuditResult::Sent, "send {index}");
        harness.clock.advance(chrono::Duration::seconds(2));
    }
    let blocked = harness.gate.send(email("late@client.test")).await;

    assert!(blocked.blocked);
    assert_eq!(blocked.reason_code.as_deref(), Some(REASON_RATE_LIMITED));
    assert_eq!(blocked.http_status(), 429);
    let retry_after = blocked.retry_after_seconds.expect("retry after");
    assert!(retry_after <= 60);
    assert_eq!(retry_after, 50);
    assert_eq!(harness.provider.sent_count(), 5);
    let rows = audit_rows(&harness.store).await;
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[0].result, AuditResult::Blocked);
    assert_eq!(rows[0].retry_after_seconds, Some(50));
}

#[tokio::test]
async fn functional_internal_only_blocks_external_recipients() {
    let harness = harness(settings(RolloutMode::InternalOnly));

    let external = harness.gate.send(email("dana@client.test")).await;
    let internal = harness.gate.send(email("Ops@ACME.test")).await;

    assert_eq!(external.reason_code.as_deref(), Some(REASON_INTERNAL_ONLY));
    assert_eq!(external.http_status(), 403);
    assert_eq!(internal.result(), AuditResult::Sent);
    assert_eq!(harness.provider.sent_count(), 1);
}

#[tokio::test]
async fn functional_suppressed_recipient_is_blocked_even_in_dry_run() {
    for mode in [RolloutMode::DryRun, RolloutMode::Live] {
        let harness = harness(settings(mode));
        harness
            .store
            .add_suppression(Suppression {
                tenant_id: TENANT.to_string(),
                email: "dana@client.test".to_string(),
                reason: SuppressionReason::HardBounce,
                created_at: harness.clock.now(),
            })
            .await
            .expect("suppress");

        let result = harness.gate.send(email(" Dana@Client.test ")).await;

        assert!(result.blocked, "{mode}");
        assert_eq!(result.reason_code.as_deref(), Some(REASON_SUPPRESSED));
        assert_eq!(harness.provider.sent_count(), 0);
    }
}

#[tokio::test]
async fn unit_invalid_payload_is_blocked_and_audited() {
    let harness = harness(settings(RolloutMode::Live));
    let mut missing_body = email("dana@client.test");
    missing_body.text = None;

    for request in [
        email("not-an-address"),
        OutboundEmail::new(TENANT, "dana@client.test", " ").with_text("body"),
        missing_body,
    ] {
        let result = harness.gate.send(request).await;
        assert_eq!(result.reason_code.as_deref(), Some(REASON_INVALID_PAYLOAD));
        assert_eq!(result.http_status(), 400);
    }
    assert_eq!(audit_rows(&harness.store).await.len(), 3);
    assert_eq!(harness.provider.sent_count(), 0);
}

#[tokio::test]
async fn functional_provider_failure_is_reported_and_audited() {
    let harness = harness(settings(RolloutMode::LimitedLive));
    harness
        .provider
        .fail_next(ProviderError::transient("upstream unavailable"));

    let result = harness
        .gate
        .send(email("dana@client.test").for_card("card_7", 2))
        .await;

    assert_eq!(result.result(), AuditResult::Failed);
    assert_eq!(result.reason_code.as_deref(), Some(REASON_PROVIDER_ERROR));
    assert_eq!(result.error.as_deref(), Some("upstream unavailable"));
    assert_eq!(result.http_status(), 500);
    let rows = harness.store.list_audit(TENANT, Some("card_7"), 10).await.expect("audit");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].result, AuditResult::Failed);
}

#[tokio::test]
async fn functional_sent_email_carries_card_idempotency_key_and_tenant_sender() {
    let harness = harness(TenantSettings {
        from_address: Some("success@acme.test".to_string()),
        ..settings(RolloutMode::Live)
    });

    let result = harness
        .gate
        .send(email("dana@client.test").for_card("card_9", 3))
        .await;

    assert_eq!(result.message_id.as_deref(), Some("msg_1"));
    let sent = harness.provider.sent();
    assert_eq!(sent[0].idempotency_key.as_deref(), Some("card_9:3"));
    assert_eq!(sent[0].from, "success@acme.test");
}

#[tokio::test]
async fn functional_disabled_provider_simulates_live_sends() {
    let store = Arc::new(InMemoryPipelineStore::new());
    let mut tenants = BTreeMap::new();
    tenants.insert(TENANT.to_string(), settings(RolloutMode::Live));
    let gate = OutboundGate::new(
        Arc::new(TenantRegistry::new(TenantSettings::default(), tenants)),
        store.clone(),
        Arc::new(SlidingWindowRateLimiter::default()),
        Arc::new(DisabledEmailProvider),
    );

    let result = gate.send(email("dana@client.test")).await;

    assert!(result.simulated);
    assert_eq!(
        result.reason_code.as_deref(),
        Some(REASON_PROVIDER_NOT_CONFIGURED)
    );
    assert_eq!(audit_rows(&store).await[0].result, AuditResult::Simulated);
}

#[tokio::test]
async fn property_every_gate_call_writes_exactly_one_audit_row() {
    let harness = harness(TenantSettings {
        rate_limit: RateLimitSettings {
            max_sends: 2,
            limited_live_max_sends: 2,
            window_seconds: 60,
        },
        ..settings(RolloutMode::Live)
    });
    harness.provider.fail_next(ProviderError::permanent("rejected"));
    let requests = vec![
        email("a@client.test"),
        email("b@client.test"),
        email("c@client.test"),
        email("d@client.test"),
        email("broken"),
    ];
    let total = requests.len();

    let mut results = Vec::new();
    for request in requests {
        results.push(harness.gate.send(request).await);
    }

    let rows = audit_rows(&harness.store).await;
    assert_eq!(rows.len(), total);
    for result in &results {
        let row = rows
            .iter()
            .find(|row| row.entry_id == result.audit_id)
            .expect("audit row");
        assert_eq!(row.result, result.result());
    }
}

struct FlakyAuditStore {
    inner: InMemoryPipelineStore,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

#[async_trait]
impl OutboundStore for FlakyAuditStore {
    async fn append_audit(&self, entry: AuditLogEntry) -> StoreResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("audit table locked".to_string()));
        }
        self.inner.append_audit(entry).await
    }

    async fn list_audit(
        &self,
        tenant_id: &str,
        card_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        self.inner.list_audit(tenant_id, card_id, limit).await
    }

    async fn add_suppression(&self, suppression: Suppression) -> StoreResult<bool> {
        self.inner.add_suppression(suppression).await
    }

    async fn find_suppression(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> StoreResult<Option<Suppression>> {
        self.inner.find_suppression(tenant_id, email).await
    }

    async fn remove_suppression(&self, tenant_id: &str, email: &str) -> StoreResult<bool> {
        self.inner.remove_suppression(tenant_id, email).await
    }
}

#[tokio::test]
async fn regression_audit_write_is_retried_once_and_send_result_survives() {
    for (failures, expected_rows, expected_attempts) in [(1, 1, 2), (2, 0, 2)] {
        let store = Arc::new(FlakyAuditStore {
            inner: InMemoryPipelineStore::new(),
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        });
        let gate = OutboundGate::new(
            Arc::new(TenantRegistry::new(TenantSettings::default(), BTreeMap::new())),
            store.clone(),
            Arc::new(SlidingWindowRateLimiter::default()),
            Arc::new(RecordingEmailProvider::new()),
        );

        let result = gate.send(email("dana@client.test")).await;

        assert!(result.simulated);
        assert_eq!(store.attempts.load(Ordering::SeqCst), expected_attempts);
        assert_eq!(
            store.list_audit(TENANT, None, 10).await.expect("audit").len(),
            expected_rows
        );
    }
}

#[tokio::test]
async fn functional_hard_bounce_event_adds_suppression_once() {
    let harness = harness(settings(RolloutMode::Live));
    let bounce = NewEvent::new(
        TENANT,
        EventType::EmailBounced,
        "bounce-1",
        harness.clock.now(),
    )
    .with_payload(json!({"email": "Dana@Client.test", "hard": true}));
    let soft = NewEvent::new(TENANT, EventType::EmailBounced, "bounce-2", harness.clock.now())
        .with_payload(json!({"email": "eli@client.test", "hard": false}));

    assert!(harness.gate.suppress_from_event(&bounce).await.expect("first"));
    assert!(!harness.gate.suppress_from_event(&bounce).await.expect("second"));
    assert!(!harness.gate.suppress_from_event(&soft).await.expect("soft"));

    let stored = harness
        .store
        .find_suppression(TENANT, "dana@client.test")
        .await
        .expect("lookup");
    assert_eq!(stored.map(|s| s.reason), Some(SuppressionReason::HardBounce));
    let blocked = harness.gate.send(email("dana@client.test")).await;
    assert_eq!(blocked.reason_code.as_deref(), Some(REASON_SUPPRESSED));
}
