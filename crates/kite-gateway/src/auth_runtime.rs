//! Bearer-token check applied to every non-health route.

use super::*;

fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Passes every request when no token is configured (localhost development).
pub(crate) fn authorize_request(state: &GatewayState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state
        .config
        .auth_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
    else {
        return Ok(());
    };
    match bearer_token_from_headers(headers) {
        Some(observed) if observed == expected => Ok(()),
        _ => {
            tracing::debug!("rejected request with missing or invalid bearer token");
            Err(ApiError::unauthorized())
        }
    }
}
