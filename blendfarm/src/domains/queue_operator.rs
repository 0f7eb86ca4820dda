use crate::models::error::FarmError;
use crate::services::queue::QueueItem;

/// Whoever runs the queue. Asked what to do when an item fails.
#[async_trait::async_trait]
pub trait QueueOperator: Send + Sync {
    /// Return false to halt the queue after `item` failed.
    async fn continue_after_error(&self, item: &QueueItem, error: &FarmError) -> bool;
}
