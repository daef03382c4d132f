//! Background tasks.

pub mod observer_task;

pub use observer_task::{ObserverHandle, ObserverStats, spawn_observer};
