pub mod chunk;
pub mod computer_spec;
pub mod error;
pub mod message;
pub mod project_file;
pub mod render_node;
pub mod render_setting;
pub mod server_setting;
