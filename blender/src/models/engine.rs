use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Copy, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Engine {
    #[default]
    Cycles,
    Eevee,
    Workbench,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Engine::Cycles => "CYCLES",
            // 4.2+ renamed the internal identifier, older builds still accept BLENDER_EEVEE.
            Engine::Eevee => "BLENDER_EEVEE_NEXT",
            Engine::Workbench => "BLENDER_WORKBENCH",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CYCLES" => Ok(Engine::Cycles),
            "EEVEE" | "BLENDER_EEVEE" | "BLENDER_EEVEE_NEXT" => Ok(Engine::Eevee),
            "WORKBENCH" | "BLENDER_WORKBENCH" => Ok(Engine::Workbench),
            _ => Err(format!("Unknown render engine `{s}`")),
        }
    }
}
