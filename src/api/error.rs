//! Single JSON error envelope for every HTTP error:
//! `{"error": {code, message, request_id, remediation?}, "request_id"}`
//! with the request id echoed in `X-Request-ID`. Stack traces never reach
//! clients.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::db;

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub remediation: Option<String>,
    pub request_id: String,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
        request_id: &str,
    ) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            remediation: None,
            request_id: request_id.to_string(),
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn bad_request(code: &str, message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message, request_id)
    }

    pub fn unauthorized(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message, request_id)
    }

    pub fn forbidden(code: &str, message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message, request_id)
    }

    pub fn not_found(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message, request_id)
    }

    pub fn conflict(code: &str, message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::CONFLICT, code, message, request_id)
    }

    pub fn internal(request_id: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "An internal error occurred",
            request_id,
        )
    }

    /// Map an internal error to the envelope: lock exhaustion becomes 503
    /// DB_BUSY, schema drift 503 DB_SCHEMA_OUT_OF_DATE, other storage
    /// failures 503 DB_ERROR, everything else a generic 500.
    pub fn from_internal(err: anyhow::Error, request_id: &str) -> Self {
        if db::is_busy_error(&err) {
            Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "DB_BUSY",
                "Database busy, please retry",
                request_id,
            )
        } else if db::is_schema_error(&err) {
            Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "DB_SCHEMA_OUT_OF_DATE",
                "Database schema is out of date. Restart the backend to apply migrations.",
                request_id,
            )
            .with_remediation("Restart the backend so pending migrations are applied.")
        } else if err.downcast_ref::<rusqlite::Error>().is_some() {
            Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "DB_ERROR",
                "Database error, please retry",
                request_id,
            )
        } else {
            tracing::error!(error = %err, request_id, "internal error");
            Self::internal(request_id)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "request_id": self.request_id.clone(),
                "remediation": self.remediation,
            },
            "request_id": self.request_id.clone(),
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            response.headers_mut().insert("X-Request-ID", value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_error_maps_to_503() {
        let err = anyhow::anyhow!("database is locked");
        let api = ApiError::from_internal(err, "req_x");
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.code, "DB_BUSY");
    }

    #[test]
    fn test_schema_error_maps_to_503() {
        let err = anyhow::anyhow!("no such column: runs.news_enabled");
        let api = ApiError::from_internal(err, "req_x");
        assert_eq!(api.code, "DB_SCHEMA_OUT_OF_DATE");
        assert!(api.remediation.is_some());
    }

    #[test]
    fn test_generic_error_hides_details() {
        let err = anyhow::anyhow!("secret internal detail");
        let api = ApiError::from_internal(err, "req_x");
        assert_eq!(api.code, "INTERNAL_ERROR");
        assert!(!api.message.contains("secret"));
    }
}
