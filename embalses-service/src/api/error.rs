use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use embalses_client::QueryError;
use serde_json::json;

/// A query failure rendered as `{"error": "..."}` with the matching status.
#[derive(Debug)]
pub struct ApiError(pub QueryError);

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            QueryError::NotFound(_) => StatusCode::NOT_FOUND,
            QueryError::Validation(_) => StatusCode::BAD_REQUEST,
            QueryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            QueryError::Database(e) => {
                tracing::error!(error = %e, "query failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        metrics::counter!("api_errors_total", "status" => status.as_u16().to_string()).increment(1);
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_query_errors_to_statuses() {
        assert_eq!(ApiError(QueryError::NotFound("x".into())).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError(QueryError::Validation("x".into())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError(QueryError::Unavailable("x".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(QueryError::Database(sqlx::Error::PoolTimedOut)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn database_detail_stays_out_of_the_body() {
        let resp = ApiError(QueryError::Database(sqlx::Error::PoolTimedOut)).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "internal error");
    }
}
