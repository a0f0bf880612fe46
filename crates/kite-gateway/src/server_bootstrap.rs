use super::*;

/// Binds `config.bind` and serves until ctrl-c.
pub async fn run_gateway_server(state: Arc<GatewayState>) -> Result<()> {
    let bind_addr = state
        .config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind address '{}'", state.config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway server on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(
        addr = %local_addr,
        auth = state.config.auth_token.is_some(),
        "gateway listening"
    );

    let app = build_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server exited unexpectedly")?;
    tracing::info!("gateway stopped");
    Ok(())
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(HEALTH_ENDPOINT, get(handle_health))
        .route(EVENTS_ENDPOINT, post(handle_event_ingest))
        .route(PATTERNS_ENDPOINT, get(handle_patterns_list))
        .route(RECOMMENDATIONS_ENDPOINT, get(handle_recommendations_list))
        .route(
            RECOMMENDATION_DISMISS_ENDPOINT,
            post(handle_recommendation_dismiss),
        )
        .route(AGENT_RUN_ENDPOINT, post(handle_agent_run))
        .route(AGENT_RUNS_ENDPOINT, get(handle_agent_runs_list))
        .route(AGENT_JOBS_ENDPOINT, get(handle_job_runs_list))
        .route(AGENT_JOB_RUN_ENDPOINT, post(handle_job_run))
        .route(CARDS_ENDPOINT, get(handle_cards_list))
        .route(CARD_ACTION_ENDPOINT, post(handle_card_action))
        .route(EMAIL_SEND_ENDPOINT, post(handle_email_send))
        .route(EMAIL_AUDIT_ENDPOINT, get(handle_email_audit_list))
        .route(TENANT_MODE_ENDPOINT, put(handle_tenant_mode_update))
        .with_state(state)
}
