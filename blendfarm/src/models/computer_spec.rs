use serde::{Deserialize, Serialize};
use std::env::consts;

/// Operating system family of a node. Picks which network path the node gets for a shared project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeOs {
    Windows,
    Linux,
    MacOS,
    Other,
}

impl NodeOs {
    pub fn current() -> Self {
        Self::from_name(consts::OS)
    }

    pub fn from_name(os: &str) -> Self {
        match os {
            "windows" => NodeOs::Windows,
            "linux" => NodeOs::Linux,
            "macos" => NodeOs::MacOS,
            _ => NodeOs::Other,
        }
    }
}

/// What a node tells the host about itself when it connects.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ComputerSpec {
    pub host: String,
    pub os: NodeOs,
    pub arch: String,
    pub cores: usize,
    /// Blender version the node renders with, if it found one.
    pub blender: Option<semver::Version>,
}

impl Default for ComputerSpec {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_owned());
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            host,
            os: NodeOs::current(),
            arch: consts::ARCH.to_owned(),
            cores,
            blender: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_names_map_to_family() {
        assert_eq!(NodeOs::from_name("windows"), NodeOs::Windows);
        assert_eq!(NodeOs::from_name("macos"), NodeOs::MacOS);
        assert_eq!(NodeOs::from_name("freebsd"), NodeOs::Other);
    }
}
