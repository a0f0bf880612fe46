//! Wires configured components together and runs one CLI command.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kite_agent::{ActionExecutor, AgentOrchestrator, HandlerRegistry, WorkBlock};
use kite_core::{Clock, SystemClock};
use kite_gateway::{run_gateway_server, GatewayState};
use kite_insights::{
    start_insight_scheduler, DetectorCatalog, InsightJobRunner, StrategyRecommender,
};
use kite_outbound::{
    build_email_provider, EmailProvider, OutboundGate, SlidingWindowRateLimiter,
};
use kite_store::{InMemoryPipelineStore, SqlitePipelineStore, StoreHandles};
use kite_types::{AgentMode, Cadence, TenantRegistry};
use serde::Serialize;

use crate::cli_args::{Cli, Command};
use crate::config::{load_config, KiteConfig, StoreBackend};

/// Every long-lived component, built once per process.
pub(crate) struct Pipeline {
    pub(crate) config: KiteConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) tenants: Arc<TenantRegistry>,
    pub(crate) stores: StoreHandles,
    pub(crate) gate: Arc<OutboundGate>,
    pub(crate) executor: Arc<ActionExecutor>,
    pub(crate) orchestrator: Arc<AgentOrchestrator>,
    pub(crate) jobs: Arc<InsightJobRunner>,
}

fn open_stores(config: &KiteConfig) -> Result<StoreHandles> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; nothing survives a restart");
            Ok(StoreHandles::from_store(Arc::new(InMemoryPipelineStore::new())))
        }
        StoreBackend::Sqlite => {
            let store = SqlitePipelineStore::new(&config.store.path).with_context(|| {
                format!("failed to open store {}", config.store.path.display())
            })?;
            Ok(StoreHandles::from_store(Arc::new(store)))
        }
    }
}

impl Pipeline {
    pub(crate) fn assemble(config: KiteConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = open_stores(&config)?;
        let tenants = Arc::new(TenantRegistry::new(
            config.defaults.clone(),
            config.tenants.clone(),
        ));
        let provider = build_email_provider(&config.provider)?;
        if !provider.is_enabled() {
            tracing::warn!("no email provider api key configured; live sends will be simulated");
        }
        let gate = Arc::new(
            OutboundGate::new(
                tenants.clone(),
                stores.outbound.clone(),
                Arc::new(SlidingWindowRateLimiter::new(clock.clone())),
                provider,
            )
            .with_clock(clock.clone()),
        );
        let executor = Arc::new(
            ActionExecutor::new(
                stores.cards.clone(),
                stores.events.clone(),
                HandlerRegistry::with_gate(gate.clone()),
                &config.executor,
            )
            .with_clock(clock.clone()),
        );
        let orchestrator = Arc::new(
            AgentOrchestrator::new(
                stores.insights.clone(),
                stores.cards.clone(),
                stores.events.clone(),
                tenants.clone(),
                executor.clone(),
                config.orchestrator.clone(),
            )
            .with_clock(clock.clone()),
        );
        let jobs = Arc::new(
            InsightJobRunner::new(
                stores.events.clone(),
                stores.insights.clone(),
                DetectorCatalog::from_config(config.detectors.clone()),
                StrategyRecommender::new(config.recommender.clone()),
            )
            .with_clock(clock.clone())
            .with_job_timeout(config.scheduler.job_timeout()),
        );
        Ok(Self {
            config,
            clock,
            tenants,
            stores,
            gate,
            executor,
            orchestrator,
            jobs,
        })
    }

    fn into_gateway_state(self) -> Arc<GatewayState> {
        Arc::new(GatewayState {
            config: self.config.gateway,
            tenants: self.tenants,
            stores: self.stores,
            gate: self.gate,
            orchestrator: self.orchestrator,
            jobs: self.jobs,
            clock: self.clock,
        })
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.store.path = db;
    }
    if let Command::Serve {
        bind,
        auth_token,
        scheduler_tick_seconds,
        no_scheduler,
    } = &cli.command
    {
        if let Some(bind) = bind {
            config.gateway.bind = bind.clone();
        }
        if auth_token.is_some() {
            config.gateway.auth_token = auth_token.clone();
        }
        if let Some(tick) = scheduler_tick_seconds {
            config.scheduler.tick_seconds = *tick;
        }
        if *no_scheduler {
            config.scheduler.enabled = false;
        }
    }

    let pipeline = Pipeline::assemble(config)?;
    match cli.command {
        Command::Serve { .. } => serve(pipeline).await,
        Command::RunJob { tenant, cadence } => {
            print_json(&run_job(&pipeline, &tenant, cadence).await?)
        }
        Command::RunAgent { tenant, mode } => {
            print_json(&run_agent(&pipeline, &tenant, mode).await?)
        }
        Command::Execute {
            tenant,
            card_id,
            all_approved,
        } => match (card_id, all_approved) {
            (Some(card_id), _) => {
                let report = pipeline.executor.execute(&tenant, &card_id).await?;
                print_json(&report)
            }
            (None, true) => {
                let batch = pipeline.executor.execute_approved(&tenant).await?;
                print_json(&batch)
            }
            (None, false) => bail!("execute requires --card-id or --all-approved"),
        },
    }
}

async fn serve(pipeline: Pipeline) -> Result<()> {
    let mut scheduler = if pipeline.config.scheduler.enabled {
        Some(start_insight_scheduler(
            pipeline.jobs.clone(),
            pipeline.tenants.clone(),
            &pipeline.config.scheduler,
        )?)
    } else {
        tracing::info!("insight scheduler disabled");
        None
    };
    let result = run_gateway_server(pipeline.into_gateway_state()).await;
    if let Some(handle) = scheduler.as_mut() {
        handle.shutdown().await;
    }
    result
}

pub(crate) async fn run_job(
    pipeline: &Pipeline,
    tenant_id: &str,
    cadence: Cadence,
) -> Result<kite_types::JobRun> {
    let now = pipeline.clock.now();
    let run = pipeline
        .jobs
        .run_job(tenant_id, cadence, now)
        .await
        .with_context(|| format!("{cadence} job for tenant '{tenant_id}' failed"))?;
    Ok(run)
}

pub(crate) async fn run_agent(
    pipeline: &Pipeline,
    tenant_id: &str,
    mode: AgentMode,
) -> Result<WorkBlock> {
    pipeline
        .orchestrator
        .run_work_block(tenant_id, mode)
        .await
        .with_context(|| format!("agent work block for tenant '{tenant_id}' failed"))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use kite_store::EventWarehouse;
    use kite_types::{EventType, JobOutcome, NewEvent};
    use tempfile::tempdir;

    use super::*;
    use crate::config::StoreConfig;

    fn memory_config() -> KiteConfig {
        KiteConfig {
            store: StoreConfig {
                backend: StoreBackend::Memory,
                ..StoreConfig::default()
            },
            ..KiteConfig::default()
        }
    }

    #[tokio::test]
    async fn functional_run_job_and_agent_on_an_empty_tenant() {
        let pipeline = Pipeline::assemble(memory_config()).expect("assemble");
        let run = run_job(&pipeline, "acme", Cadence::Hourly)
            .await
            .expect("job run");
        assert_eq!(run.outcome, JobOutcome::Success);
        assert_eq!(run.events_processed, 0);

        let block = run_agent(&pipeline, "acme", AgentMode::Review)
            .await
            .expect("agent run");
        assert!(matches!(block, WorkBlock::Completed(_)));
        assert_eq!(block.run().cards_created, 0);
    }

    #[tokio::test]
    async fn integration_sqlite_pipeline_persists_across_assemblies() {
        let temp = tempdir().expect("tempdir");
        let config = KiteConfig {
            store: StoreConfig {
                backend: StoreBackend::Sqlite,
                path: temp.path().join("kite.db"),
            },
            ..KiteConfig::default()
        };

        let first = Pipeline::assemble(config.clone()).expect("assemble first");
        let now = Utc::now();
        first
            .stores
            .events
            .append(NewEvent::new("acme", EventType::OrderCreated, "order-1", now))
            .await
            .expect("append");
        drop(first);

        let second = Pipeline::assemble(config).expect("assemble second");
        let outcome = second
            .stores
            .events
            .append(NewEvent::new("acme", EventType::OrderCreated, "order-1", now))
            .await
            .expect("append again");
        assert!(!outcome.inserted);
    }

    #[tokio::test]
    async fn regression_invalid_tenant_surfaces_as_error() {
        let pipeline = Pipeline::assemble(memory_config()).expect("assemble");
        assert!(run_agent(&pipeline, "bad tenant", AgentMode::Review)
            .await
            .is_err());
        assert!(run_job(&pipeline, "", Cadence::Daily).await.is_err());
    }
}
