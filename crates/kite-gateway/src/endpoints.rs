//! Route paths served by the gateway.

pub(crate) const HEALTH_ENDPOINT: &str = "/health";
pub(crate) const EVENTS_ENDPOINT: &str = "/events";
pub(crate) const PATTERNS_ENDPOINT: &str = "/patterns";
pub(crate) const RECOMMENDATIONS_ENDPOINT: &str = "/recommendations";
pub(crate) const RECOMMENDATION_DISMISS_ENDPOINT: &str = "/recommendations/dismiss";
pub(crate) const AGENT_RUN_ENDPOINT: &str = "/agent/run";
pub(crate) const AGENT_RUNS_ENDPOINT: &str = "/agent/runs";
pub(crate) const AGENT_JOBS_ENDPOINT: &str = "/agent/jobs";
pub(crate) const AGENT_JOB_RUN_ENDPOINT: &str = "/agent/jobs/{cadence}/run";
pub(crate) const CARDS_ENDPOINT: &str = "/cards";
pub(crate) const CARD_ACTION_ENDPOINT: &str = "/cards/{action}";
pub(crate) const EMAIL_SEND_ENDPOINT: &str = "/email/send";
pub(crate) const EMAIL_AUDIT_ENDPOINT: &str = "/audit/email";
pub(crate) const TENANT_MODE_ENDPOINT: &str = "/tenants/{tenant}/mode";

pub(crate) const DEFAULT_LIST_LIMIT: usize = 50;
pub(crate) const MAX_LIST_LIMIT: usize = 500;
