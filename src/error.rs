use std::fmt::{Display, Formatter};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::service::TaskError;

/// Response envelope shared by every endpoint: `code` 0 means success,
/// anything else matches the HTTP status class.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub fn success<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: 0,
        message: "Success".to_string(),
        data: Some(data),
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum ApiError {
    InvalidParam,
    Unauthorized,
    Forbidden,
    NotFound,
    LimitExceeded,
    Internal(String),
}

impl ApiError {
    fn code(&self) -> u16 {
        match self {
            ApiError::InvalidParam => 400,
            ApiError::Unauthorized => 401,
            ApiError::Forbidden => 403,
            ApiError::NotFound => 404,
            ApiError::LimitExceeded => 429,
            ApiError::Internal(_) => 500,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            ApiError::InvalidParam => "InvalidParam",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::Forbidden => "Forbidden",
            ApiError::NotFound => "NotFound",
            ApiError::LimitExceeded => "LimitExceeded",
            ApiError::Internal(_) => "InternalServerError",
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Internal(msg) => write!(f, "{}: {msg}", self.message()),
            other => f.write_str(other.message()),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "internal server error");
        }
        let status = StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // Internal detail stays in the logs, not the response body.
        let body = Json(Envelope::<()> {
            code: self.code(),
            message: self.message().to_string(),
            data: None,
        });
        (status, body).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(value: TaskError) -> Self {
        match value {
            TaskError::UnsupportedLanguage => ApiError::InvalidParam,
            TaskError::TaskLimitReached | TaskError::WorkerSaturated => ApiError::LimitExceeded,
            // Task lookups treat an unknown id as a bad request.
            TaskError::NotFound => ApiError::InvalidParam,
            TaskError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_codes_follow_the_error_table() {
        assert_eq!(ApiError::InvalidParam.code(), 400);
        assert_eq!(ApiError::Unauthorized.code(), 401);
        assert_eq!(ApiError::Forbidden.code(), 403);
        assert_eq!(ApiError::NotFound.code(), 404);
        assert_eq!(ApiError::LimitExceeded.code(), 429);
        assert_eq!(ApiError::Internal("x".into()).code(), 500);
    }

    #[test]
    fn domain_errors_map_to_user_visible_classes() {
        assert_eq!(
            ApiError::from(TaskError::UnsupportedLanguage),
            ApiError::InvalidParam
        );
        assert_eq!(
            ApiError::from(TaskError::TaskLimitReached),
            ApiError::LimitExceeded
        );
        assert_eq!(ApiError::from(TaskError::NotFound), ApiError::InvalidParam);
    }

    #[test]
    fn success_envelope_serializes_data() {
        let json = serde_json::to_value(&success(serde_json::json!({"task_id": "t"})).0).unwrap();
        assert_eq!(json["code"], 0);
        assert_eq!(json["message"], "Success");
        assert_eq!(json["data"]["task_id"], "t");
    }
}
