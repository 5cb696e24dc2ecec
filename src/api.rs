use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use tracing::info;
use uuid::Uuid;

use crate::error::{success, ApiError, Envelope};
use crate::metrics::MetricsRegistry;
use crate::models::{SubmitTaskRequest, SubmitTaskResponse, TaskResultResponse};
use crate::sandbox::language::Language;
use crate::service::TaskService;

const MAX_CODE_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    api_keys: Arc<HashMap<String, u64>>,
    service: Arc<TaskService>,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(
    api_keys: HashMap<String, u64>,
    service: Arc<TaskService>,
    metrics: Arc<MetricsRegistry>,
) -> Router {
    let state = AppState {
        api_keys: Arc::new(api_keys),
        service,
        metrics,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_text))
        .route("/v1/task/{id}", get(get_task_result).post(submit_task))
        .fallback(unknown_route)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics_text(State(state): State<AppState>) -> String {
    state.metrics.render_prometheus()
}

async fn unknown_route() -> ApiError {
    ApiError::NotFound
}

async fn submit_task(
    State(state): State<AppState>,
    Path(submit_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<Json<Envelope<SubmitTaskResponse>>, ApiError> {
    let app_id = authenticate(&state.api_keys, &headers)?;
    validate_submit(&submit_id, &request)?;

    let language = Language::from_tag(&request.language).ok_or(ApiError::InvalidParam)?;

    let task_id = state
        .service
        .submit_deduped(&submit_id, app_id, language, request.code)
        .await?;

    info!(%task_id, app_id, %submit_id, %language, "submission accepted");
    Ok(success(SubmitTaskResponse { task_id }))
}

async fn get_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Envelope<TaskResultResponse>>, ApiError> {
    let app_id = authenticate(&state.api_keys, &headers)?;
    let task_id = Uuid::parse_str(&task_id).map_err(|_| ApiError::InvalidParam)?;

    if !state.service.task_belongs_to_app(task_id, app_id).await? {
        return Err(ApiError::Forbidden);
    }

    let row = state.service.get_result(task_id).await?;

    let language = state
        .service
        .submissions_by_task_id(task_id)
        .await
        .first()
        .map(|submission| submission.language.tag().to_string())
        .unwrap_or_default();

    Ok(success(TaskResultResponse {
        task_id,
        language,
        status: row.status().as_str(),
        stdout: row.output.unwrap_or_default(),
        stderr: row.err_output.unwrap_or_default(),
    }))
}

fn authenticate(api_keys: &HashMap<String, u64>, headers: &HeaderMap) -> Result<u64, ApiError> {
    let key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    for (candidate, app_id) in api_keys {
        if constant_time_eq(key.as_bytes(), candidate.as_bytes()) {
            return Ok(*app_id);
        }
    }
    Err(ApiError::Unauthorized)
}

fn validate_submit(submit_id: &str, request: &SubmitTaskRequest) -> Result<(), ApiError> {
    if submit_id.trim().is_empty() {
        return Err(ApiError::InvalidParam);
    }
    if request.language.trim().is_empty() || request.code.trim().is_empty() {
        return Err(ApiError::InvalidParam);
    }
    if request.code.len() > MAX_CODE_BYTES {
        return Err(ApiError::InvalidParam);
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (l, r) in a.iter().zip(b.iter()) {
        out |= l ^ r;
    }
    out == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> HashMap<String, u64> {
        HashMap::from([("alpha".to_string(), 42u64)])
    }

    fn header_with(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", key.parse().unwrap());
        headers
    }

    #[test]
    fn auth_resolves_app_id_from_key() {
        assert_eq!(authenticate(&keys(), &header_with("alpha")), Ok(42));
    }

    #[test]
    fn auth_rejects_unknown_or_missing_key() {
        assert_eq!(
            authenticate(&keys(), &header_with("beta")),
            Err(ApiError::Unauthorized)
        );
        assert_eq!(
            authenticate(&keys(), &HeaderMap::new()),
            Err(ApiError::Unauthorized)
        );
    }

    #[test]
    fn validation_rejects_empty_fields() {
        let request = SubmitTaskRequest {
            language: "PYTHON".into(),
            code: String::new(),
        };
        assert_eq!(
            validate_submit("s1", &request),
            Err(ApiError::InvalidParam)
        );
        let request = SubmitTaskRequest {
            language: "PYTHON".into(),
            code: "print(1)".into(),
        };
        assert_eq!(validate_submit(" ", &request), Err(ApiError::InvalidParam));
        assert_eq!(validate_submit("s1", &request), Ok(()));
    }

    #[test]
    fn oversized_code_is_rejected() {
        let request = SubmitTaskRequest {
            language: "PYTHON".into(),
            code: "a".repeat(MAX_CODE_BYTES + 1),
        };
        assert_eq!(
            validate_submit("s1", &request),
            Err(ApiError::InvalidParam)
        );
    }
}
