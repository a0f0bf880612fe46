//! Event ingestion and insight read endpoints.

use super::*;

pub(crate) async fn handle_health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

pub(crate) async fn handle_event_ingest(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(event): Json<NewEvent>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    event.validate()?;
    let suppressed = state.gate.suppress_from_event(&event).await?;
    let outcome = state.stores.events.append(event).await?;
    let status = if outcome.inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({
            "event_id": outcome.event_id,
            "inserted": outcome.inserted,
            "suppression_added": suppressed,
        })),
    )
        .into_response())
}

pub(crate) async fn handle_patterns_list(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<TenantListQuery>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&query.tenant)?;
    let patterns = state
        .stores
        .insights
        .list_patterns(&tenant_id, list_limit(query.limit))
        .await?;
    Ok(Json(json!({ "tenant": tenant_id, "patterns": patterns })).into_response())
}

pub(crate) async fn handle_recommendations_list(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<TenantListQuery>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&query.tenant)?;
    let recommendations = state
        .stores
        .insights
        .pending_recommendations(&tenant_id, list_limit(query.limit))
        .await?;
    Ok(Json(json!({ "tenant": tenant_id, "recommendations": recommendations })).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct DismissRecommendationRequest {
    tenant: String,
    recommendation_id: String,
}

pub(crate) async fn handle_recommendation_dismiss(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<DismissRecommendationRequest>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&request.tenant)?;
    let outcome = state
        .stores
        .insights
        .transition_recommendation(
            &tenant_id,
            request.recommendation_id.trim(),
            RecommendationStatus::Pending,
            RecommendationStatus::Dismissed,
        )
        .await?;
    match outcome {
        CasOutcome::Applied(recommendation) => Ok(Json(recommendation).into_response()),
        CasOutcome::Conflict { actual } => Err(ApiError::conflict(
            "conflict",
            format!("recommendation is {actual}, not pending"),
        )),
    }
}
