use super::{chunk::Region, computer_spec::ComputerSpec, render_setting::RenderManagerSettings};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/*
    Developer blog:
    - Dropped message-io for a plain tokio TcpStream framed with a length prefix. Every frame carries
    one bincode encoded message. Request and response alternate on a connection, so there is no need
    for correlation ids.
    - Cancel goes out on its own short connection, the render connection is busy waiting for the chunk.
*/

/// How the blend file reaches the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncSource {
    /// File content pushed over the wire. `compressed` means gzip.
    Bytes { data: Vec<u8>, compressed: bool },
    /// Path the node can open directly, already translated for the node's OS.
    NetworkPath(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub session_id: Uuid,
    pub file_version: String,
    pub file_name: String,
    pub source: SyncSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub job_id: Uuid,
    pub session_id: Uuid,
    /// Node refuses to render if this is not the version it has on disk.
    pub file_version: String,
    pub frame: i32,
    pub region: Region,
    pub settings: RenderManagerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRequest {
    Hello,
    Sync(SyncPayload),
    RenderChunk(ChunkRequest),
    Cancel { job_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeResponse {
    Hello(ComputerSpec),
    Synced,
    /// Encoded image of exactly the requested region.
    Chunk(Vec<u8>),
    Cancelled,
    Error(String),
}
