use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Who triggered the request, from the optional `X-Actor-Id` header.
///
/// Only carried into job logs; it grants nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Actor(pub Option<Uuid>);

/// Middleware that validates `Authorization: Bearer <key>` against the
/// configured `CONTROL_PLANE_API_KEY` and extracts `X-Actor-Id`.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    match validate_request(&state, &req) {
        Ok(actor) => {
            req.extensions_mut().insert(actor);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

fn validate_request(state: &AppState, req: &Request) -> Result<Actor, ApiError> {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if token != state.config.control_plane_api_key {
        return Err(ApiError::Unauthorized);
    }

    match req.headers().get("x-actor-id") {
        None => Ok(Actor(None)),
        Some(raw) => raw
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(|id| Actor(Some(id)))
            .ok_or(ApiError::BadRequest("invalid X-Actor-Id header".into())),
    }
}
