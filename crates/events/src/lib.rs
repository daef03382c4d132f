//! Change notifications for the task table and the feed that carries them.

pub mod change;
pub mod feed;

pub use change::{ChangeBatch, ChangeOperation, DecodeError, TaskChange, TaskRow, decode_batch};
pub use feed::{ChangePublisher, ChangeStream, Delivery, FeedError, FeedSeq, change_feed};
