use crate::models::{
    computer_spec::ComputerSpec,
    error::FarmError,
    message::{ChunkRequest, SyncPayload},
};
use std::sync::Arc;
use uuid::Uuid;

/// Remote call surface of a render node. Every call resolves to a definite success or failure.
/// Dropping a pending call abandons it; the node learns about it through `cancel`.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    /// Handshake. Returns what the node reported about itself.
    async fn connect(&self) -> Result<ComputerSpec, FarmError>;
    async fn disconnect(&self) -> Result<(), FarmError>;
    async fn sync(&self, payload: SyncPayload) -> Result<(), FarmError>;
    /// Renders one region and returns the encoded image bytes.
    async fn render_chunk(&self, request: ChunkRequest) -> Result<Vec<u8>, FarmError>;
    async fn cancel(&self, job_id: Uuid) -> Result<(), FarmError>;
}

/// Builds the client for a newly added node.
pub trait NodeConnector: Send + Sync {
    fn client_for(&self, name: &str, address: &str) -> Arc<dyn NodeClient>;
}
