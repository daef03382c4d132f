//! Task storage boundary.
//!
//! One port (`TaskStore`) with an in-memory implementation for tests/dev and
//! a Postgres implementation for production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use r#trait::{StoreError, SubmissionKey, TaskStore};
