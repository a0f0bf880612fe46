use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::{email_domain, normalize_email, CardType, RolloutMode};

/// Sliding-window send budget for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Budget in `live` mode.
    pub max_sends: u32,
    /// Budget in `limited_live` and `internal_only` mode.
    pub limited_live_max_sends: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_sends: 50,
            limited_live_max_sends: 10,
            window_seconds: 3_600,
        }
    }
}

impl RateLimitSettings {
    pub fn limit_for(&self, mode: RolloutMode) -> u32 {
        match mode {
            RolloutMode::Live => self.max_sends,
            RolloutMode::DryRun | RolloutMode::InternalOnly | RolloutMode::LimitedLive => {
                self.limited_live_max_sends
            }
        }
    }

    pub fn window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_seconds.max(1))
    }
}

/// Externally configured behavior of the pipeline for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub agent_enabled: bool,
    pub send_mode: RolloutMode,
    pub internal_domains: Vec<String>,
    pub internal_emails: Vec<String>,
    pub rate_limit: RateLimitSettings,
    /// Card types the orchestrator may approve on its own in auto mode.
    pub auto_approve: Vec<CardType>,
    pub from_address: Option<String>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            agent_enabled: true,
            send_mode: RolloutMode::DryRun,
            internal_domains: Vec::new(),
            internal_emails: Vec::new(),
            rate_limit: RateLimitSettings::default(),
            auto_approve: vec![CardType::Research, CardType::FollowUp],
            from_address: None,
        }
    }
}

impl TenantSettings {
    pub fn is_internal_recipient(&self, recipient: &str) -> bool {
        let normalized = normalize_email(recipient);
        if self
            .internal_emails
            .iter()
            .any(|allowed| normalize_email(allowed) == normalized)
        {
            return true;
        }
        let Some(domain) = email_domain(&normalized) else {
            return false;
        };
        self.internal_domains.iter().any(|allowed| {
            let allowed = allowed.trim().trim_start_matches('@').to_ascii_lowercase();
            !allowed.is_empty() && domain == allowed
        })
    }

    /// High-risk types are never auto-approved, whatever the allow-list says.
    pub fn allows_auto_approve(&self, card_type: CardType) -> bool {
        !card_type.requires_human_approval() && self.auto_approve.contains(&card_type)
    }
}

/// Hot-swappable view of every tenant's settings.
#[derive(Debug)]
pub struct TenantRegistry {
    defaults: TenantSettings,
    tenants: ArcSwap<BTreeMap<String, TenantSettings>>,
    agents_halted: AtomicBool,
}

impl TenantRegistry {
    pub fn new(defaults: TenantSettings, tenants: BTreeMap<String, TenantSettings>) -> Self {
        Self {
            defaults,
            tenants: ArcSwap::from_pointee(tenants),
            agents_halted: AtomicBool::new(false),
        }
    }

    pub fn settings_for(&self, tenant_id: &str) -> TenantSettings {
        self.tenants
            .load()
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Tenants with explicit configuration, in id order.
    pub fn configured_tenants(&self) -> Vec<String> {
        self.tenants.load().keys().cloned().collect()
    }

    pub fn upsert(&self, tenant_id: &str, settings: TenantSettings) {
        self.tenants.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(tenant_id.to_string(), settings.clone());
            Arc::new(next)
        });
    }

    pub fn set_send_mode(&self, tenant_id: &str, mode: RolloutMode) -> TenantSettings {
        let defaults = self.defaults.clone();
        let previous = self.tenants.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.entry(tenant_id.to_string())
                .or_insert_with(|| defaults.clone())
                .send_mode = mode;
            Arc::new(next)
        });
        let mut updated = previous
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        updated.send_mode = mode;
        updated
    }

    /// Global kill switch for every tenant's agent.
    pub fn set_agents_halted(&self, halted: bool) {
        self.agents_halted.store(halted, Ordering::SeqCst);
    }

    pub fn agents_halted(&self) -> bool {
        self.agents_halted.load(Ordering::SeqCst)
    }

    pub fn agent_enabled(&self, tenant_id: &str) -> bool {
        !self.agents_halted() && self.settings_for(tenant_id).agent_enabled
    }
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new(TenantSettings::default(), BTreeMap::new())
    }
}
