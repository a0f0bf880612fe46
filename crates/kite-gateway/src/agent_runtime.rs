//! Orchestrator and insight-job triggers.

use super::*;

#[derive(Debug, Deserialize)]
pub(crate) struct AgentRunRequest {
    tenant: String,
    #[serde(default)]
    mode: AgentMode,
}

pub(crate) async fn handle_agent_run(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<AgentRunRequest>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&request.tenant)?;
    let block = state
        .orchestrator
        .run_work_block(&tenant_id, request.mode)
        .await?;
    let already_running = matches!(block, WorkBlock::AlreadyRunning(_));
    Ok((
        StatusCode::OK,
        Json(json!({
            "already_running": already_running,
            "run": block.into_run(),
        })),
    )
        .into_response())
}

pub(crate) async fn handle_agent_runs_list(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<TenantListQuery>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&query.tenant)?;
    let runs = state
        .stores
        .cards
        .list_agent_runs(&tenant_id, list_limit(query.limit))
        .await?;
    Ok(Json(json!({ "tenant": tenant_id, "runs": runs })).into_response())
}

pub(crate) async fn handle_job_run(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(cadence): AxumPath<String>,
    Json(request): Json<TenantBody>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let cadence = cadence.parse::<Cadence>()?;
    let tenant_id = resolve_tenant(&request.tenant)?;
    let now = state.jobs.clock().now();
    let run = state.jobs.run_job(&tenant_id, cadence, now).await?;
    Ok((StatusCode::OK, Json(run)).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobRunsQuery {
    tenant: String,
    #[serde(default)]
    cadence: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) async fn handle_job_runs_list(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<JobRunsQuery>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&query.tenant)?;
    let cadence = query
        .cadence
        .as_deref()
        .map(str::parse::<Cadence>)
        .transpose()?;
    let runs = state
        .stores
        .insights
        .list_job_runs(&tenant_id, cadence, list_limit(query.limit))
        .await?;
    Ok(Json(json!({ "tenant": tenant_id, "runs": runs })).into_response())
}
