pub mod args;
pub mod device;
pub mod engine;
pub mod format;
pub mod mode;
pub mod status;
pub mod window;
