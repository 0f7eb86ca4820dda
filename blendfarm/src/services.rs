pub mod cli_app;

// host side
pub mod blend_farm_manager;
pub mod file_sync;
pub mod live_render;
pub mod progress;
pub mod queue;
pub mod render_task;
pub mod scheduler;

// talking to nodes
pub mod node_client;
pub mod wire;

// node side
pub mod blender_renderer;
pub mod node_server;
