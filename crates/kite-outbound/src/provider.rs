//! Email delivery providers behind the outbound gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_PROVIDER_API_BASE: &str = "https://api.resend.com";
pub const DEFAULT_FROM_ADDRESS: &str = "kite@localhost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    /// Sent as `Idempotency-Key`; retries only happen when it is set.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    pub retryable: bool,
}

impl ProviderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: true,
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Disabled providers are never called; the gate records a simulated send instead.
    fn is_enabled(&self) -> bool {
        true
    }

    fn default_from(&self) -> &str {
        DEFAULT_FROM_ADDRESS
    }

    async fn send(&self, message: &EmailMessage) -> std::result::Result<ProviderReceipt, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub api_base: String,
    /// Empty or missing disables real delivery.
    pub api_key: Option<String>,
    pub from_address: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_PROVIDER_API_BASE.to_string(),
            api_key: None,
            from_address: DEFAULT_FROM_ADDRESS.to_string(),
            request_timeout_ms: 10_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

/// Returns the HTTP provider when an API key is configured, otherwise the disabled one.
pub fn build_email_provider(config: &ProviderConfig) -> Result<Arc<dyn EmailProvider>> {
    match config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        Some(_) => Ok(Arc::new(HttpEmailProvider::new(config)?)),
        None => {
            tracing::warn!("email provider api key not configured; sends will be simulated");
            Ok(Arc::new(DisabledEmailProvider))
        }
    }
}

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 409 || status == 425 || status == 429 || status >= 500
}

pub fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();
    raw.parse::<u64>()
        .ok()
        .map(|seconds| seconds.saturating_mul(1_000))
}

fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after_ms: Option<u64>) -> Duration {
    let backoff = base_delay_ms.saturating_mul(1_u64 << attempt.min(6));
    Duration::from_millis(retry_after_ms.map_or(backoff, |hint| hint.max(backoff)))
}

fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn truncate_for_error(body: &str) -> String {
    kite_core::truncate_chars(body.trim(), 240)
}

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: Option<String>,
}

/// Resend-compatible `POST {api_base}/emails` client.
#[derive(Clone)]
pub struct HttpEmailProvider {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    from_address: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl HttpEmailProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("kite-outbound"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create email provider client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default().trim().to_string(),
            from_address: config.from_address.trim().to_string(),
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms,
        })
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn default_from(&self) -> &str {
        &self.from_address
    }

    async fn send(&self, message: &EmailMessage) -> std::result::Result<ProviderReceipt, ProviderError> {
        let url = format!("{}/emails", self.api_base);
        let body = json!({
            "from": message.from,
            "to": [message.to],
            "subject": message.subject,
            "html": message.html,
            "text": message.text,
        });
        // Without an idempotency key a retry could deliver twice.
        let max_attempts = if message.idempotency_key.is_some() {
            self.retry_max_attempts
        } else {
            1
        };

        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let mut request = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body);
            if let Some(key) = &message.idempotency_key {
                request = request.header("Idempotency-Key", key);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    let retryable = is_retryable_transport_error(&error);
                    if retryable && attempt < max_attempts {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None)).await;
                        continue;
                    }
                    return Err(ProviderError {
                        message: format!("email provider request failed: {error}"),
                        status: None,
                        retryable,
                    });
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed = response
                    .json::<SendEmailResponse>()
                    .await
                    .map_err(|error| ProviderError::permanent(format!(
                        "failed to decode email provider response: {error}"
                    )))?;
                return Ok(ProviderReceipt {
                    message_id: parsed.id,
                });
            }

            let retryable = should_retry_status(status.as_u16());
            let retry_after_ms = parse_retry_after_ms(response.headers());
            if retryable && attempt < max_attempts {
                tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, retry_after_ms))
                    .await;
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError {
                message: format!(
                    "email provider returned status {}: {}",
                    status.as_u16(),
                    truncate_for_error(&body)
                ),
                status: Some(status.as_u16()),
                retryable,
            });
        }
    }
}

/// Stand-in used when no provider credentials are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledEmailProvider;

#[async_trait]
impl EmailProvider for DisabledEmailProvider {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn send(&self, _message: &EmailMessage) -> std::result::Result<ProviderReceipt, ProviderError> {
        Err(ProviderError::permanent("email provider is not configured"))
    }
}

/// In-process provider that keeps every accepted message.
#[derive(Debug, Default)]
pub struct RecordingEmailProvider {
    sent: Mutex<Vec<EmailMessage>>,
    failures: Mutex<Vec<ProviderError>>,
    counter: AtomicU64,
}

impl RecordingEmailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error returned by the next `send` call.
    pub fn fail_next(&self, error: ProviderError) {
        lock(&self.failures).push(error);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl EmailProvider for RecordingEmailProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &EmailMessage) -> std::result::Result<ProviderReceipt, ProviderError> {
        let queued = {
            let mut failures = lock(&self.failures);
            (!failures.is_empty()).then(|| failures.remove(0))
        };
        if let Some(error) = queued {
            return Err(error);
        }
        lock(&self.sent).push(message.clone());
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(ProviderReceipt {
            message_id: Some(format!("msg_{sequence}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn message(idempotency_key: Option<&str>) -> EmailMessage {
        EmailMessage {
            from: "ops@acme.test".to_string(),
            to: "dana@client.test".to_string(),
            subject: "Checking in".to_string(),
            html: None,
            text: Some("Hi Dana".to_string()),
            idempotency_key: idempotency_key.map(str::to_string),
        }
    }

    fn provider_for(server: &MockServer, attempts: usize) -> HttpEmailProvider {
        HttpEmailProvider::new(&ProviderConfig {
            api_base: server.base_url(),
            api_key: Some("re_test_key".to_string()),
            request_timeout_ms: 2_000,
            retry_max_attempts: attempts,
            retry_base_delay_ms: 1,
            ..ProviderConfig::default()
        })
        .expect("provider")
    }

    #[test]
    fn unit_should_retry_status_covers_throttling_and_server_errors() {
        assert!(should_retry_status(429));
        assert!(should_retry_status(503));
        assert!(should_retry_status(408));
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(422));
    }

    #[test]
    fn unit_build_email_provider_without_key_is_disabled() {
        let provider = build_email_provider(&ProviderConfig::default()).expect("provider");
        assert!(!provider.is_enabled());
        let keyed = build_email_provider(&ProviderConfig {
            api_key: Some("re_key".to_string()),
            ..ProviderConfig::default()
        })
        .expect("provider");
        assert!(keyed.is_enabled());
        assert_eq!(keyed.name(), "http");
    }

    #[tokio::test]
    async fn functional_http_provider_posts_with_auth_and_idempotency_key() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/emails")
                .header("authorization", "Bearer re_test_key")
                .header("idempotency-key", "card_1:1")
                .json_body(json!({
                    "from": "ops@acme.test",
                    "to": ["dana@client.test"],
                    "subject": "Checking in",
                    "html": null,
                    "text": "Hi Dana",
                }));
            then.status(200).json_body(json!({"id": "email_123"}));
        });

        let receipt = provider_for(&server, 3)
            .send(&message(Some("card_1:1")))
            .await
            .expect("send");
        assert_eq!(receipt.message_id.as_deref(), Some("email_123"));
        mock.assert();
    }

    #[tokio::test]
    async fn functional_http_provider_retries_server_errors_when_idempotent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/emails");
            then.status(503).body("unavailable");
        });

        let error = provider_for(&server, 3)
            .send(&message(Some("card_1:1")))
            .await
            .expect_err("should fail");
        assert!(error.retryable);
        assert_eq!(error.status, Some(503));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn regression_http_provider_never_retries_without_idempotency_key() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/emails");
            then.status(500);
        });

        let error = provider_for(&server, 3)
            .send(&message(None))
            .await
            .expect_err("should fail");
        assert!(error.retryable);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn functional_http_provider_reports_client_errors_as_permanent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/emails");
            then.status(422)
                .json_body(json!({"message": "invalid `to` field"}));
        });

        let error = provider_for(&server, 3)
            .send(&message(Some("card_1:1")))
            .await
            .expect_err("should fail");
        assert!(!error.retryable);
        assert!(error.message.contains("422"));
        assert!(error.message.contains("invalid `to` field"));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn unit_recording_provider_replays_queued_failures_first() {
        let provider = RecordingEmailProvider::new();
        provider.fail_next(ProviderError::transient("boom"));
        assert!(provider.send(&message(None)).await.is_err());
        let receipt = provider.send(&message(None)).await.expect("send");
        assert_eq!(receipt.message_id.as_deref(), Some("msg_1"));
        assert_eq!(provider.sent_count(), 1);
    }
}
