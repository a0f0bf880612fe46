//! Unified card management: `POST /cards/{action}` and `GET /cards`.

use super::*;

const HUMAN_CREATOR: &str = "human";

#[derive(Debug, Deserialize)]
pub(crate) struct CardsQuery {
    tenant: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) async fn handle_cards_list(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<CardsQuery>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&query.tenant)?;
    let card_state = query
        .state
        .as_deref()
        .map(str::parse::<CardState>)
        .transpose()?;
    let cards = state
        .stores
        .cards
        .list_cards(&tenant_id, card_state, list_limit(query.limit))
        .await?;
    Ok(Json(json!({ "tenant": tenant_id, "cards": cards })).into_response())
}

/// Body shared by every card action; each action reads the fields it needs.
#[derive(Debug, Deserialize)]
pub(crate) struct CardActionRequest {
    tenant: String,
    #[serde(default, alias = "cardId")]
    card_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    action: Option<CardAction>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
}

impl CardActionRequest {
    fn card_id(&self) -> Result<&str, ApiError> {
        self.card_id
            .as_deref()
            .map(str::trim)
            .filter(|card_id| !card_id.is_empty())
            .ok_or_else(|| ValidationError::Missing { field: "card_id" }.into())
    }

    fn into_patch(self) -> CardPatch {
        CardPatch {
            title: self.title,
            rationale: self.rationale,
            priority: self.priority,
            action: self.action,
            description: self.description,
        }
    }
}

pub(crate) async fn handle_card_action(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(action): AxumPath<String>,
    Json(request): Json<CardActionRequest>,
) -> Result<Response, ApiError> {
    authorize_request(&state, &headers)?;
    let tenant_id = resolve_tenant(&request.tenant)?;
    match action.as_str() {
        "create" => create_card(&state, tenant_id, request).await,
        "update" => update_card(&state, &tenant_id, request).await,
        "delete" => delete_card(&state, &tenant_id, &request).await,
        "review" => transition_by_human(&state, &tenant_id, &request, CardState::InReview).await,
        "approve" => transition_by_human(&state, &tenant_id, &request, CardState::Approved).await,
        "reject" => transition_by_human(&state, &tenant_id, &request, CardState::Rejected).await,
        "execute" => execute_card(&state, &tenant_id, &request).await,
        other => Err(ApiError::not_found(
            "unknown_card_action",
            format!("unknown card action '{other}'"),
        )),
    }
}

async fn create_card(
    state: &GatewayState,
    tenant_id: String,
    request: CardActionRequest,
) -> Result<Response, ApiError> {
    let action = request
        .action
        .ok_or(ValidationError::Missing { field: "action" })?;
    let new_card = NewCard {
        tenant_id,
        title: request.title.unwrap_or_default(),
        rationale: request.rationale.unwrap_or_default(),
        priority: request.priority.unwrap_or_default(),
        action,
        created_by: request
            .created_by
            .unwrap_or_else(|| HUMAN_CREATOR.to_string()),
        source_recommendation_id: None,
        description: request.description.unwrap_or_default(),
    };
    let card = new_card.into_card(new_id("card"), state.clock.now())?;
    let card = state.stores.cards.insert_card(card).await?;
    tracing::info!(
        tenant_id = %card.tenant_id,
        card_id = %card.card_id,
        card_type = %card.card_type,
        "card created by hand"
    );
    Ok((StatusCode::CREATED, Json(card)).into_response())
}

async fn update_card(
    state: &GatewayState,
    tenant_id: &str,
    request: CardActionRequest,
) -> Result<Response, ApiError> {
    let card_id = request.card_id()?.to_string();
    let patch = request.into_patch();
    if patch.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_request",
            "update requires at least one field to change",
        ));
    }
    patch.validate()?;
    let card = state
        .stores
        .cards
        .update_card(tenant_id, &card_id, patch)
        .await?;
    Ok(Json(card).into_response())
}

async fn delete_card(
    state: &GatewayState,
    tenant_id: &str,
    request: &CardActionRequest,
) -> Result<Response, ApiError> {
    let card_id = request.card_id()?;
    if !state.stores.cards.delete_card(tenant_id, card_id).await? {
        return Err(StoreError::not_found("card", card_id).into());
    }
    Ok(Json(json!({ "card_id": card_id, "deleted": true })).into_response())
}

/// Moves a card from whatever state it is in now to `target`, as a compare-and-swap.
async fn transition_by_human(
    state: &GatewayState,
    tenant_id: &str,
    request: &CardActionRequest,
    target: CardState,
) -> Result<Response, ApiError> {
    let card_id = request.card_id()?;
    let card = state
        .stores
        .cards
        .get_card(tenant_id, card_id)
        .await?
        .ok_or_else(|| StoreError::not_found("card", card_id))?;
    card.state
        .ensure_transition(target)
        .map_err(StoreError::from)?;
    let outcome = state
        .stores
        .cards
        .transition_card(tenant_id, card_id, CardTransition::new(card.state, target))
        .await?;
    match outcome {
        CasOutcome::Applied(card) => {
            tracing::info!(
                tenant_id = %tenant_id,
                card_id = %card_id,
                state = %card.state,
                "card transitioned by hand"
            );
            Ok(Json(card).into_response())
        }
        CasOutcome::Conflict { actual } => Err(ApiError::conflict(
            "conflict",
            format!("card '{card_id}' changed concurrently and is now {actual}"),
        )),
    }
}

async fn execute_card(
    state: &GatewayState,
    tenant_id: &str,
    request: &CardActionRequest,
) -> Result<Response, ApiError> {
    let card_id = request.card_id()?;
    let report = state
        .orchestrator
        .executor()
        .execute(tenant_id, card_id)
        .await?;
    Ok(Json(report).into_response())
}
