//! Single guarded path for every outbound email.
//!
//! Checks run in a fixed order: payload, rollout mode, suppression, rate limit.
//! Only a request that passes all four reaches the provider, and every call
//! ends with an audit row whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kite_core::{new_id, Clock, SystemClock};
use kite_store::{OutboundStore, StoreError};
use kite_types::{
    is_plausible_email, normalize_email, validate_tenant_id, AuditLogEntry, AuditResult,
    EventType, NewEvent, OutboundChannel, RolloutMode, Suppression, SuppressionReason,
    TenantRegistry,
};
use serde::{Deserialize, Serialize};

use crate::provider::{EmailMessage, EmailProvider};
use crate::rate_limit::{RateDecision, RateLimiter};

pub const REASON_INVALID_PAYLOAD: &str = "invalid_payload";
pub const REASON_INTERNAL_ONLY: &str = "internal_only_recipient";
pub const REASON_SUPPRESSED: &str = "suppressed";
pub const REASON_SUPPRESSION_CHECK_FAILED: &str = "suppression_check_failed";
pub const REASON_RATE_LIMITED: &str = "rate_limited";
pub const REASON_DRY_RUN: &str = "dry_run";
pub const REASON_PROVIDER_NOT_CONFIGURED: &str = "provider_not_configured";
pub const REASON_PROVIDER_ERROR: &str = "provider_error";

/// One email handed to the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub tenant_id: String,
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub card_id: Option<String>,
    /// Execution attempt of `card_id`; paired with it to form the idempotency key.
    #[serde(default)]
    pub attempt: Option<u32>,
}

impl OutboundEmail {
    pub fn new(
        tenant_id: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            to: to.into(),
            subject: subject.into(),
            html: None,
            text: None,
            from: None,
            card_id: None,
            attempt: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn for_card(mut self, card_id: impl Into<String>, attempt: u32) -> Self {
        self.card_id = Some(card_id.into());
        self.attempt = Some(attempt);
        self
    }

    pub fn idempotency_key(&self) -> Option<String> {
        let card_id = self.card_id.as_deref()?;
        Some(format!("{card_id}:{}", self.attempt.unwrap_or(1)))
    }

    fn validation_error(&self) -> Option<String> {
        if let Err(error) = validate_tenant_id(&self.tenant_id) {
            return Some(error.to_string());
        }
        if !is_plausible_email(&self.to) {
            return Some(format!("recipient '{}' is not a valid email address", self.to));
        }
        if self.subject.trim().is_empty() {
            return Some("subject must not be empty".to_string());
        }
        let has_body = [&self.html, &self.text]
            .into_iter()
            .any(|body| body.as_deref().is_some_and(|body| !body.trim().is_empty()));
        if !has_body {
            return Some("one of html or text is required".to_string());
        }
        None
    }
}

/// Outcome reported back to the caller and mirrored into the audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub success: bool,
    pub simulated: bool,
    pub blocked: bool,
    pub mode: RolloutMode,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub reason_code: Option<String>,
    pub retry_after_seconds: Option<u64>,
    pub audit_id: String,
}

impl SendResult {
    pub fn result(&self) -> AuditResult {
        match (self.success, self.simulated, self.blocked) {
            (true, true, _) => AuditResult::Simulated,
            (true, false, _) => AuditResult::Sent,
            (false, _, true) => AuditResult::Blocked,
            (false, _, false) => AuditResult::Failed,
        }
    }

    /// HTTP status the gateway answers with for this outcome.
    pub fn http_status(&self) -> u16 {
        match self.result() {
            AuditResult::Sent | AuditResult::Simulated => 200,
            AuditResult::Blocked => match self.reason_code.as_deref() {
                Some(REASON_INVALID_PAYLOAD) => 400,
                Some(REASON_RATE_LIMITED) => 429,
                _ => 403,
            },
            AuditResult::Failed => match self.reason_code.as_deref() {
                Some(REASON_SUPPRESSION_CHECK_FAILED) => 503,
                _ => 500,
            },
        }
    }
}

struct Decision {
    result: AuditResult,
    reason_code: Option<&'static str>,
    error: Option<String>,
    message_id: Option<String>,
    retry_after_seconds: Option<u64>,
}

impl Decision {
    fn blocked(reason: &'static str, error: impl Into<String>) -> Self {
        Self {
            result: AuditResult::Blocked,
            reason_code: Some(reason),
            error: Some(error.into()),
            message_id: None,
            retry_after_seconds: None,
        }
    }

    fn simulated(reason: &'static str) -> Self {
        Self {
            result: AuditResult::Simulated,
            reason_code: Some(reason),
            error: None,
            message_id: None,
            retry_after_seconds: None,
        }
    }

    fn failed(reason: &'static str, error: impl Into<String>) -> Self {
        Self {
            result: AuditResult::Failed,
            reason_code: Some(reason),
            error: Some(error.into()),
            message_id: None,
            retry_after_seconds: None,
        }
    }
}

pub struct OutboundGate {
    tenants: Arc<TenantRegistry>,
    store: Arc<dyn OutboundStore>,
    limiter: Arc<dyn RateLimiter>,
    provider: Arc<dyn EmailProvider>,
    clock: Arc<dyn Clock>,
}

impl OutboundGate {
    pub fn new(
        tenants: Arc<TenantRegistry>,
        store: Arc<dyn OutboundStore>,
        limiter: Arc<dyn RateLimiter>,
        provider: Arc<dyn EmailProvider>,
    ) -> Self {
        Self {
            tenants,
            store,
            limiter,
            provider,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tenants(&self) -> &Arc<TenantRegistry> {
        &self.tenants
    }

    pub fn store(&self) -> &Arc<dyn OutboundStore> {
        &self.store
    }

    pub fn provider_enabled(&self) -> bool {
        self.provider.is_enabled()
    }

    pub async fn send(&self, email: OutboundEmail) -> SendResult {
        let started = Instant::now();
        let mode = self.tenants.settings_for(&email.tenant_id).send_mode;
        let decision = self.decide(&email, mode).await;

        let entry = AuditLogEntry {
            entry_id: new_id("aud"),
            tenant_id: email.tenant_id.clone(),
            card_id: email.card_id.clone(),
            channel: OutboundChannel::Email,
            recipient: normalize_email(&email.to),
            subject: email.subject.clone(),
            mode_at_send: mode,
            result: decision.result,
            reason_code: decision.reason_code.map(str::to_string),
            error: decision.error.clone(),
            message_id: decision.message_id.clone(),
            retry_after_seconds: decision.retry_after_seconds,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            created_at: self.clock.now(),
        };
        tracing::info!(
            tenant_id = %entry.tenant_id,
            card_id = ?entry.card_id,
            mode = %mode,
            result = %entry.result,
            reason = ?entry.reason_code,
            "outbound email decision"
        );
        let audit_id = entry.entry_id.clone();
        self.write_audit(entry).await;

        SendResult {
            success: matches!(decision.result, AuditResult::Sent | AuditResult::Simulated),
            simulated: decision.result == AuditResult::Simulated,
            blocked: decision.result == AuditResult::Blocked,
            mode,
            message_id: decision.message_id,
            error: decision.error,
            reason_code: decision.reason_code.map(str::to_string),
            retry_after_seconds: decision.retry_after_seconds,
            audit_id,
        }
    }

    async fn decide(&self, email: &OutboundEmail, mode: RolloutMode) -> Decision {
        if let Some(error) = email.validation_error() {
            return Decision::blocked(REASON_INVALID_PAYLOAD, error);
        }
        let settings = self.tenants.settings_for(&email.tenant_id);

        if mode == RolloutMode::InternalOnly && !settings.is_internal_recipient(&email.to) {
            return Decision::blocked(
                REASON_INTERNAL_ONLY,
                format!("recipient '{}' is outside the internal allow-list", email.to),
            );
        }

        match self
            .store
            .find_suppression(&email.tenant_id, &normalize_email(&email.to))
            .await
        {
            Ok(Some(suppression)) => {
                return Decision::blocked(
                    REASON_SUPPRESSED,
                    format!("recipient is suppressed ({})", suppression.reason),
                );
            }
            Ok(None) => {}
            Err(error) => {
                return Decision::failed(
                    REASON_SUPPRESSION_CHECK_FAILED,
                    format!("suppression lookup failed: {error}"),
                );
            }
        }

        if mode == RolloutMode::DryRun {
            return Decision::simulated(REASON_DRY_RUN);
        }

        let key = format!("email:{}", email.tenant_id);
        let limit = settings.rate_limit.limit_for(mode);
        let window = settings.rate_limit.window();
        if let RateDecision::Denied { retry_after } =
            self.limiter.check_and_increment(&key, limit, window).await
        {
            let mut decision = Decision::blocked(
                REASON_RATE_LIMITED,
                format!("rate limit of {limit} sends per {}s reached", window.as_secs()),
            );
            decision.retry_after_seconds = Some(retry_after_seconds(retry_after, window));
            return decision;
        }

        if !self.provider.is_enabled() {
            return Decision::simulated(REASON_PROVIDER_NOT_CONFIGURED);
        }

        let message = EmailMessage {
            from: email
                .from
                .clone()
                .or(settings.from_address)
                .unwrap_or_else(|| self.provider.default_from().to_string()),
            to: email.to.trim().to_string(),
            subject: email.subject.clone(),
            html: email.html.clone(),
            text: email.text.clone(),
            idempotency_key: email.idempotency_key(),
        };
        match self.provider.send(&message).await {
            Ok(receipt) => Decision {
                result: AuditResult::Sent,
                reason_code: None,
                error: None,
                message_id: receipt.message_id,
                retry_after_seconds: None,
            },
            Err(error) => {
                tracing::warn!(
                    tenant_id = %email.tenant_id,
                    provider = self.provider.name(),
                    retryable = error.retryable,
                    "email provider send failed: {error}"
                );
                Decision::failed(REASON_PROVIDER_ERROR, error.message)
            }
        }
    }

    async fn write_audit(&self, entry: AuditLogEntry) {
        let first = match self.store.append_audit(entry.clone()).await {
            Ok(()) => return,
            Err(error) => error,
        };
        tracing::warn!(entry_id = %entry.entry_id, "audit write failed, retrying: {first}");
        if let Err(error) = self.store.append_audit(entry.clone()).await {
            let payload = serde_json::to_string(&entry).unwrap_or_default();
            tracing::error!(
                entry_id = %entry.entry_id,
                payload = %payload,
                "audit write failed after retry: {error}"
            );
        }
    }

    /// Records suppressions carried by delivery feedback events.
    ///
    /// Handles `email_bounced` with `hard: true` and an `email` payload field.
    /// Returns true when a new suppression was stored.
    pub async fn suppress_from_event(&self, event: &NewEvent) -> Result<bool, StoreError> {
        if event.event_type != EventType::EmailBounced {
            return Ok(false);
        }
        let hard = event
            .payload
            .get("hard")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let Some(email) = event
            .payload
            .get("email")
            .and_then(serde_json::Value::as_str)
            .filter(|email| is_plausible_email(email))
        else {
            return Ok(false);
        };
        if !hard {
            return Ok(false);
        }
        let added = self
            .store
            .add_suppression(Suppression {
                tenant_id: event.tenant_id.clone(),
                email: normalize_email(email),
                reason: SuppressionReason::HardBounce,
                created_at: self.clock.now(),
            })
            .await?;
        if added {
            tracing::info!(tenant_id = %event.tenant_id, "recipient suppressed after hard bounce");
        }
        Ok(added)
    }
}

fn retry_after_seconds(retry_after: Duration, window: Duration) -> u64 {
    let millis = retry_after.min(window).as_millis();
    u64::try_from(millis.div_ceil(1_000)).unwrap_or(window.as_secs())
}
