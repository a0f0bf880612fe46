//! Outbound email wrapper, audit listing and rollout-mode control.

use super::*;

#[derive(Debug, Deserialize)]
pub(crate) struct EmailSendRequest {
    tenant: String,
    to: String,
    subject: String,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    from: Option<String>,
}

/// Hands the payload to the gate and answers with its result verbatim.
pub(crate) async fn handle_email_send(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<EmailSendRequest>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&request.tenant)?;
    let email = OutboundEmail {
        tenant_id,
        to: request.to,
        subject: request.subject,
        html: request.html,
        text: request.text,
        from: request.from,
        card_id: None,
        attempt: None,
    };
    let result = state.gate.send(email).await;
    let status =
        StatusCode::from_u16(result.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(&result)).into_response();
    if status == StatusCode::TOO_MANY_REQUESTS {
        if let Some(seconds) = result.retry_after_seconds {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuditQuery {
    tenant: String,
    #[serde(default)]
    card_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) async fn handle_email_audit_list(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&query.tenant)?;
    let entries = state
        .stores
        .outbound
        .list_audit(&tenant_id, query.card_id.as_deref(), list_limit(query.limit))
        .await?;
    Ok(Json(json!({ "tenant": tenant_id, "entries": entries })).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct TenantModeRequest {
    mode: RolloutMode,
}

pub(crate) async fn handle_tenant_mode_update(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(tenant): AxumPath<String>,
    Json(request): Json<TenantModeRequest>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&tenant)?;
    let settings = state.tenants.set_send_mode(&tenant_id, request.mode);
    tracing::info!(tenant_id = %tenant_id, mode = %request.mode, "tenant rollout mode updated");
    Ok(Json(json!({ "tenant": tenant_id, "settings": settings })).into_response())
}
