//! Error envelope and request bodies for the gateway.

use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        )
    }

    pub(crate) fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub(crate) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub(crate) fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_type = if self.status.is_client_error() {
            "invalid_request_error"
        } else {
            "server_error"
        };
        (
            self.status,
            Json(json!({
                "error": {
                    "type": error_type,
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        Self::bad_request("invalid_request", error.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::NotFound { .. } => Self::not_found("not_found", error.to_string()),
            StoreError::AlreadyExists { .. } => {
                Self::conflict("already_exists", error.to_string())
            }
            StoreError::InvalidTransition(_) => {
                Self::conflict("invalid_transition", error.to_string())
            }
            StoreError::NotEditable { .. } => Self::conflict("not_editable", error.to_string()),
            StoreError::Validation(_) => Self::bad_request("invalid_request", error.to_string()),
            _ if error.is_transient() => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                error.to_string(),
            ),
            _ => {
                tracing::error!(error = %error, "store failure");
                Self::internal(error.to_string())
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        match error {
            OrchestratorError::Validation(error) => error.into(),
            OrchestratorError::Halted | OrchestratorError::Disabled { .. } => {
                Self::forbidden("agent_disabled", error.to_string())
            }
            OrchestratorError::Store(error) => error.into(),
        }
    }
}

impl From<SchedulerJobError> for ApiError {
    fn from(error: SchedulerJobError) -> Self {
        match error {
            SchedulerJobError::Validation(error) => error.into(),
            SchedulerJobError::Record { source, .. } => source.into(),
        }
    }
}

/// Validates and trims a tenant id taken from a body, path or query.
pub(crate) fn resolve_tenant(raw: &str) -> Result<String, ApiError> {
    validate_tenant_id(raw)?;
    Ok(raw.trim().to_string())
}

pub(crate) fn list_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT)
}

/// `?tenant=&limit=` for list endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct TenantListQuery {
    pub(crate) tenant: String,
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TenantBody {
    pub(crate) tenant: String,
}
