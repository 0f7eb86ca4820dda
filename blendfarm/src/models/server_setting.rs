use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/*
    Developer blog
    - Initially this held the list of blender installations as well. Blender is its own crate now,
    so all we keep here is where the node stores incoming blend files and where it renders to.
    - Moved away from expect() everywhere. A render node that cannot write its config should still
    come up with defaults and say so in the logs.
*/

// path to config file name.
const SETTINGS_PATH: &str = "BlendFarm/";
const SETTINGS_FILE_NAME: &str = "ServerSettings.json";
const RENDER_DIR: &str = "RenderData/";
const BLEND_DIR: &str = "BlendFiles/";
pub const DEFAULT_PORT: u16 = 15000;

/// Settings for a machine running as a render node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSetting {
    /// Port the node listens on for the host.
    pub port: u16,
    /// Public directory to store all finished render image.
    pub render_dir: PathBuf,
    /// Public directory of blender working copy of files.
    pub blend_dir: PathBuf,
    /// Blender executable to render with. Falls back to `blender` on PATH.
    pub blender: Option<PathBuf>,
}

impl Default for ServerSetting {
    fn default() -> Self {
        // Temp directory on purpose. Once the chunk is back on the host we have no use for it.
        let tmp = std::env::temp_dir();
        Self {
            port: DEFAULT_PORT,
            render_dir: tmp.join(RENDER_DIR),
            blend_dir: tmp.join(BLEND_DIR),
            blender: None,
        }
    }
}

impl ServerSetting {
    fn get_config_path() -> io::Result<PathBuf> {
        let path = dirs::config_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "No config directory"))?
            .join(SETTINGS_PATH);
        fs::create_dir_all(&path)?;
        Ok(path.join(SETTINGS_FILE_NAME))
    }

    /// Make sure the working directories exist.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.render_dir)?;
        fs::create_dir_all(&self.blend_dir)
    }

    /// Save the configurations to the user's config directory.
    pub fn save(&self) -> io::Result<()> {
        self.save_to(Self::get_config_path()?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let data = serde_json::to_string_pretty(&self)?;
        fs::write(path, data)
    }

    /// Load user configurations from the user's config directory
    pub fn load() -> ServerSetting {
        match Self::get_config_path() {
            Ok(path) => Self::load_from(path),
            Err(e) => {
                tracing::warn!("Unable to locate config directory, using defaults: {e}");
                ServerSetting::default()
            }
        }
    }

    /// Load from a specific file. Missing or unreadable files are replaced with defaults.
    pub fn load_from(path: impl AsRef<Path>) -> ServerSetting {
        let path = path.as_ref();
        let settings = fs::read_to_string(path)
            .ok()
            .and_then(|data| match serde_json::from_str::<ServerSetting>(&data) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    tracing::warn!("Unable to parse {path:?}, using defaults: {e}");
                    None
                }
            });

        match settings {
            Some(settings) => settings,
            None => {
                let data = ServerSetting::default();
                if let Err(e) = data.save_to(path) {
                    tracing::warn!("Unable to write {path:?}: {e}");
                }
                data
            }
        }
    }
}
