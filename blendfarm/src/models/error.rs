use thiserror::Error;

/// Everything that can go wrong between the host and its render nodes.
///
/// Per node and per chunk failures (`Connection`, `Sync`, `RenderBackend`) are normally absorbed by
/// the task and show up as reduced capacity. Whatever reaches the caller of `RenderTask::render` is
/// fatal to that task.
#[derive(Debug, Error)]
pub enum FarmError {
    #[error("Unable to reach node `{node}`: {reason}")]
    Connection { node: String, reason: String },
    #[error("Fail to sync node `{node}`: {reason}")]
    Sync { node: String, reason: String },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Node `{node}` failed to render: {reason}")]
    RenderBackend { node: String, reason: String },
    #[error("Frame {frame} failed: {reason}")]
    FrameFailed { frame: i32, reason: String },
    #[error("Render was cancelled")]
    Cancelled,
    #[error("Node `{0}` already exists")]
    NodeExists(String),
    #[error("Node `{0}` not found")]
    NodeNotFound(String),
    #[error("Unexpected message: {0}")]
    Protocol(String),
    #[error("Image error: {0}")]
    Image(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue still has {0} unfinished items")]
    NotEmpty(usize),
    #[error("No queue item with id {0}")]
    ItemNotFound(uuid::Uuid),
    #[error(transparent)]
    Farm(#[from] FarmError),
}

impl FarmError {
    pub fn connection(node: impl Into<String>, reason: impl ToString) -> Self {
        FarmError::Connection {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    pub fn sync(node: impl Into<String>, reason: impl ToString) -> Self {
        FarmError::Sync {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    pub fn backend(node: impl Into<String>, reason: impl ToString) -> Self {
        FarmError::RenderBackend {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    /// Losing the connection takes the node out of the job; a backend failure only costs the chunk.
    pub fn is_connection(&self) -> bool {
        matches!(self, FarmError::Connection { .. } | FarmError::Io(_))
    }
}

impl serde::Serialize for FarmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<image::ImageError> for FarmError {
    fn from(err: image::ImageError) -> Self {
        FarmError::Image(err.to_string())
    }
}

impl From<bincode::Error> for FarmError {
    fn from(err: bincode::Error) -> Self {
        FarmError::Protocol(err.to_string())
    }
}
