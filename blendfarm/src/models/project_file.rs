use super::computer_spec::NodeOs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Shared location of the blend file as seen from each OS family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPaths {
    pub windows: Option<String>,
    pub linux: Option<String>,
    pub macos: Option<String>,
}

impl NetworkPaths {
    /// Path for a node of the given OS. `Other` tries the unix style paths.
    pub fn for_os(&self, os: NodeOs) -> Option<&str> {
        let path = match os {
            NodeOs::Windows => self.windows.as_ref(),
            NodeOs::Linux => self.linux.as_ref(),
            NodeOs::MacOS => self.macos.as_ref(),
            NodeOs::Other => self.linux.as_ref().or(self.macos.as_ref()),
        };
        path.map(String::as_str).filter(|p| !p.is_empty())
    }
}

/// How the blend file of a project gets to the nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectOptions {
    /// Nodes open the file from a shared path instead of receiving a copy.
    pub use_networked_path: bool,
    pub network_paths: NetworkPaths,
    /// Gzip the file before it goes on the wire.
    pub use_sync_compression: bool,
}

/// One open project. The session id scopes the per node sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    pub session_id: Uuid,
    pub blend_file: PathBuf,
    pub options: ProjectOptions,
    /// Version of the file last computed. None until the first update.
    pub file_version: Option<String>,
}

impl ProjectFile {
    pub fn new(blend_file: impl AsRef<Path>, options: ProjectOptions) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            blend_file: blend_file.as_ref().to_path_buf(),
            options,
            file_version: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.blend_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project.blend".to_owned())
    }
}
