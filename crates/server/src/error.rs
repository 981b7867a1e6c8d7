use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use veil_common::QueryError;

/// Response wrapper mapping the engine's error taxonomy onto HTTP status
/// codes. Internal messages are logged server-side and replaced with a
/// generic body.
pub struct ApiError(pub QueryError);

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.0 {
            err @ QueryError::InvalidQuery { .. } => (StatusCode::BAD_REQUEST, err),
            err @ QueryError::ExternalLib { .. } => (StatusCode::UNPROCESSABLE_ENTITY, err),
            err @ QueryError::Unauthorized { .. } => (StatusCode::FORBIDDEN, err),
            err @ QueryError::Busy { .. } => (StatusCode::TOO_MANY_REQUESTS, err),
            QueryError::Internal { message } => {
                tracing::error!(error = %message, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    QueryError::internal("internal server error"),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use veil_common::Library;

    fn status_of(err: QueryError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_statuses() {
        assert_eq!(status_of(QueryError::invalid("x")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(QueryError::external(Library::Opendp, "x")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(QueryError::unauthorized("x")),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_of(QueryError::busy("x")), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_of(QueryError::internal("secret detail")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
