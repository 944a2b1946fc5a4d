use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Missing or invalid identity")]
    Unauthenticated,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::Store(err) => match err {
                StoreError::Restricted | StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::Conflict(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_statuses() {
        let cases = [
            (StoreError::Restricted, StatusCode::BAD_REQUEST),
            (StoreError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (StoreError::Forbidden("x"), StatusCode::FORBIDDEN),
            (StoreError::NotFound("User"), StatusCode::NOT_FOUND),
            (StoreError::Conflict("Conversation"), StatusCode::CONFLICT),
            (StoreError::Pool("closed".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ServerError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_edge_errors() {
        assert_eq!(
            ServerError::Unauthenticated.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServerError::RateLimited.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
