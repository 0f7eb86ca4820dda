// container for blender installation and the process invocation
pub mod blender;

// argument, engine, format and border models handed to blender
pub mod models;

pub use blender::{Blender, BlenderError};
