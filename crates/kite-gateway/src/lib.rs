//! HTTP surface for the action pipeline.
//!
//! Thin axum handlers over the stores, the insight job runner, the agent
//! orchestrator, the action executor and the outbound gate. Every error leaves
//! as `{"error":{"type","code","message"}}`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::header::{AUTHORIZATION, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use kite_agent::{AgentOrchestrator, OrchestratorError, WorkBlock};
use kite_core::{new_id, Clock};
use kite_insights::{InsightJobRunner, SchedulerJobError};
use kite_outbound::{OutboundEmail, OutboundGate};
use kite_store::{
    CardStore, CasOutcome, EventWarehouse, InsightStore, OutboundStore, StoreError, StoreHandles,
};
use kite_types::{
    validate_tenant_id, AgentMode, Cadence, CardAction, CardPatch, CardState, CardTransition,
    NewCard, NewEvent, Priority, RecommendationStatus, RolloutMode, TenantRegistry,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;

mod agent_runtime;
mod auth_runtime;
mod cards_runtime;
mod email_runtime;
mod endpoints;
mod events_runtime;
mod server_bootstrap;
mod types;


use agent_runtime::*;
use auth_runtime::authorize_request;
use cards_runtime::*;
use email_runtime::*;
use endpoints::*;
use events_runtime::*;
use types::*;

pub use server_bootstrap::{build_gateway_router, run_gateway_server};
pub use types::ApiError;

/// Listener and auth settings (`[gateway]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    /// When set, every route except `/health` requires `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            auth_token: None,
        }
    }
}

/// Shared handles every request works against.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub tenants: Arc<TenantRegistry>,
    pub stores: StoreHandles,
    pub gate: Arc<OutboundGate>,
    pub orchestrator: Arc<AgentOrchestrator>,
    pub jobs: Arc<InsightJobRunner>,
    pub clock: Arc<dyn Clock>,
}
