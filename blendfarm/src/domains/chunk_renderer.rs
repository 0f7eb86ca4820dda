use crate::models::{error::FarmError, message::ChunkRequest};
use std::path::Path;

/// Node side of the render call. The node server owns the file bookkeeping and cancellation;
/// the renderer only turns a blend file and a region into image bytes.
#[async_trait::async_trait]
pub trait ChunkRenderer: Send + Sync {
    async fn render(
        &self,
        blend_file: &Path,
        request: &ChunkRequest,
        output_dir: &Path,
    ) -> Result<Vec<u8>, FarmError>;
}
