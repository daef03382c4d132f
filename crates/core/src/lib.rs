//! `taskrelay-core` — domain building blocks for task records.
//!
//! This crate contains **pure domain** types (no storage or transport concerns).

pub mod error;
pub mod id;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::TaskId;
pub use task::{NewTask, TaskPayload, TaskRecord};
