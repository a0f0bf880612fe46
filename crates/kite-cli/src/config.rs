//! `kite.toml` loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kite_agent::{ExecutorConfig, OrchestratorConfig};
use kite_gateway::GatewayConfig;
use kite_insights::{DetectorsConfig, RecommenderConfig, SchedulerConfig};
use kite_outbound::ProviderConfig;
use kite_types::{validate_tenant_id, TenantSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// `[store]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct StoreConfig {
    pub(crate) backend: StoreBackend,
    pub(crate) path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from(".kite/kite.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct KiteConfig {
    pub(crate) store: StoreConfig,
    pub(crate) gateway: GatewayConfig,
    pub(crate) scheduler: SchedulerConfig,
    pub(crate) detectors: DetectorsConfig,
    pub(crate) recommender: RecommenderConfig,
    pub(crate) orchestrator: OrchestratorConfig,
    pub(crate) executor: ExecutorConfig,
    pub(crate) provider: ProviderConfig,
    /// Settings for any tenant without its own `[tenants.<id>]` table.
    pub(crate) defaults: TenantSettings,
    pub(crate) tenants: BTreeMap<String, TenantSettings>,
}

impl KiteConfig {
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse kite config")?;
        for tenant_id in config.tenants.keys() {
            validate_tenant_id(tenant_id)
                .with_context(|| format!("invalid tenant table [tenants.{tenant_id}]"))?;
        }
        Ok(config)
    }
}

/// Reads `path` when given; a missing path means built-in defaults.
pub(crate) fn load_config(path: Option<&Path>) -> Result<KiteConfig> {
    let Some(path) = path else {
        return Ok(KiteConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    KiteConfig::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
}
