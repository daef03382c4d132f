use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use taskrelay_infra::SubmitError;

/// Storage details stay in the server log; clients get a fixed message.
pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Client(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
        SubmitError::Exhausted { attempts, last } => {
            error!(attempts, error = %last, "responding 503: storage unavailable");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                format!("Database connection failed after {attempts} attempts"),
            )
        }
        SubmitError::Storage { attempts, source } => {
            error!(attempts, error = %source, "responding 500: storage error");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "Task could not be stored",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
