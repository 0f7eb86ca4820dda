pub mod chunk_renderer;
pub mod node_client;
pub mod performance_policy;
pub mod queue_operator;
