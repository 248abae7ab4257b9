use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use tracing::error;

use crate::error::SentinelError;

/// Handlers return `ApiResult`; the envelope shape is uniform across
/// every endpoint.
pub type ApiResult = std::result::Result<Json<Value>, ApiError>;

pub fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

pub fn ok_message(message: &str) -> Json<Value> {
    Json(json!({ "success": true, "message": message }))
}

#[derive(Debug)]
pub struct ApiError(pub SentinelError);

impl From<SentinelError> for ApiError {
    fn from(err: SentinelError) -> Self {
        ApiError(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError(SentinelError::Json(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            SentinelError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            SentinelError::NotFound(_) => StatusCode::NOT_FOUND,
            SentinelError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SentinelError::Conflict(_) => StatusCode::CONFLICT,
            SentinelError::Upstream { error_type, .. } if error_type == "rate_limit" => {
                StatusCode::TOO_MANY_REQUESTS
            }
            SentinelError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(err = %err, "request failed");
        }

        let body = match &err {
            SentinelError::Upstream { error_type, message, wait_seconds } => {
                let human = match (error_type.as_str(), wait_seconds) {
                    ("rate_limit", Some(n)) => format!("请求被限速，请等待 {n} 秒后重试"),
                    _ => message.clone(),
                };
                json!({
                    "success": false,
                    "message": human,
                    "error_type": error_type,
                    "wait_seconds": wait_seconds,
                    "error": {
                        "code": err.code(),
                        "message": message,
                        "detail": err.to_string(),
                    },
                })
            }
            _ => json!({
                "success": false,
                "message": err.to_string(),
                "error": {
                    "code": err.code(),
                    "message": err.to_string(),
                    "detail": "",
                },
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_shape() {
        let body = ok(json!({"n": 1})).0;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["n"], 1);
    }

    #[test]
    fn status_mapping() {
        let cases = [
            (SentinelError::InvalidParam("x".into()), StatusCode::BAD_REQUEST),
            (SentinelError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (SentinelError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (SentinelError::Conflict("x".into()), StatusCode::CONFLICT),
            (SentinelError::Cache("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (SentinelError::Timeout(10), StatusCode::INTERNAL_SERVER_ERROR),
            (
                SentinelError::Upstream {
                    error_type: "rate_limit".into(),
                    message: "slow".into(),
                    wait_seconds: Some(30),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                SentinelError::Upstream {
                    error_type: "network".into(),
                    message: "down".into(),
                    wait_seconds: None,
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            let resp = ApiError(err).into_response();
            assert_eq!(resp.status(), expected);
        }
    }
}
