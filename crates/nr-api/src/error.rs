use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] nr_db::Error),

    #[error(transparent)]
    Engine(#[from] nr_engine::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<nr_infra::Error> for ApiError {
    fn from(e: nr_infra::Error) -> Self {
        Self::Engine(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Store(e) => store_status(e),
            ApiError::Engine(e) => match e {
                nr_engine::Error::Store(e) => store_status(e),
                nr_engine::Error::Precondition(_) => StatusCode::CONFLICT,
                nr_engine::Error::Infra(_)
                | nr_engine::Error::Deploy(_)
                | nr_engine::Error::Bootstrap(_)
                | nr_engine::Error::Container(_)
                | nr_engine::Error::Timeout(_)
                | nr_engine::Error::AttemptTimeout(_) => StatusCode::BAD_GATEWAY,
                nr_engine::Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn store_status(e: &nr_db::Error) -> StatusCode {
    match e {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        nr_db::Error::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn maps_errors_to_statuses() {
        let missing = nr_db::Error::NotFound {
            entity: "instance",
            id: Uuid::nil(),
        };
        assert_eq!(ApiError::from(missing).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(nr_db::Error::Conflict("taken".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(nr_engine::Error::Precondition("busy".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(nr_infra::Error::Remote {
                host: "203.0.113.1".into(),
                message: "refused".into(),
            })
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
