use serde::{Deserialize, Serialize};

// context for serde: https://serde.rs/enum-representations.html
#[derive(Debug, Clone, PartialEq, Hash, Serialize, Deserialize)]
pub enum Mode {
    // JSON: "Frame": "i32",
    Frame(i32),

    // JSON: "Animation": {"start":"i32", "end":"i32"}
    Animation { start: i32, end: i32 },
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Frame(1)
    }
}
