use axum::{Router, routing::get};

pub mod system;
pub mod tasks;

/// Router for the task endpoints (nested under `/api`).
pub fn router() -> Router {
    Router::new().route("/tasks", get(tasks::submit_task).post(tasks::submit_task))
}
