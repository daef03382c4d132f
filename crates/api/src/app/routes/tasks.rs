use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

/// Submit one task. `POST` and `GET` behave the same: the JSON body
/// `{"task": "..."}` is authoritative, and `?task=` is a fallback for bodiless requests.
pub async fn submit_task(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::SubmitTaskQuery>,
    body: Bytes,
) -> axum::response::Response {
    let body = match (body.is_empty(), query.task) {
        (true, Some(task)) => Bytes::from(serde_json::json!({ "task": task }).to_string()),
        _ => body,
    };

    match services.submission().handle(&body).await {
        Ok(receipt) => (
            StatusCode::CREATED,
            Json(dto::SubmitTaskResponse::from(receipt)),
        )
            .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}
