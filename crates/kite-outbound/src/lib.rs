//! Outbound gate for tenant email.
//!
//! Every email leaves through [`OutboundGate::send`], which applies rollout
//! mode, suppression, and rate limits before the [`EmailProvider`] sees it.

pub mod gate;
pub mod provider;
pub mod rate_limit;

pub use gate::{
    OutboundEmail, OutboundGate, SendResult, REASON_DRY_RUN, REASON_INTERNAL_ONLY,
    REASON_INVALID_PAYLOAD, REASON_PROVIDER_ERROR, REASON_PROVIDER_NOT_CONFIGURED,
    REASON_RATE_LIMITED, REASON_SUPPRESSED, REASON_SUPPRESSION_CHECK_FAILED,
};
pub use provider::{
    build_email_provider, should_retry_status, DisabledEmailProvider, EmailMessage,
    EmailProvider, HttpEmailProvider, ProviderConfig, ProviderError, ProviderReceipt,
    RecordingEmailProvider,
};
pub use rate_limit::{RateDecision, RateLimiter, SlidingWindowRateLimiter};

#[cfg(test)]
mod tests;
