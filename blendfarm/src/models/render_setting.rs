use crate::models::error::FarmError;
use blender::models::{engine::Engine, format::Format};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a frame gets cut into chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderStrategy {
    /// One horizontal band per node, sized by the node's share.
    SplitHorizontal,
    /// One vertical band per node, sized by the node's share.
    SplitVertical,
    /// Fixed grid by chunk ratio, nodes pull chunks as they free up.
    #[default]
    Chunked,
    /// Bands per node, each band cut again into the chunk grid.
    SplitChunked,
}

/// In what sequence chunks are handed out. Only affects how the image fills in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOrder {
    /// Row major, top left first.
    #[default]
    Default,
    /// Closest to the center of the frame first.
    Center,
}

impl FromStr for RenderStrategy {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "splithorizontal" | "horizontal" => Ok(RenderStrategy::SplitHorizontal),
            "splitvertical" | "vertical" => Ok(RenderStrategy::SplitVertical),
            "chunked" => Ok(RenderStrategy::Chunked),
            "splitchunked" => Ok(RenderStrategy::SplitChunked),
            _ => Err(FarmError::InvalidState(format!("unknown render strategy `{s}`"))),
        }
    }
}

impl FromStr for TaskOrder {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(TaskOrder::Default),
            "center" | "centre" => Ok(TaskOrder::Center),
            _ => Err(FarmError::InvalidState(format!("unknown chunk order `{s}`"))),
        }
    }
}

/// Settings for one render task. Treated as immutable once handed to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderManagerSettings {
    pub output_width: u32,
    pub output_height: u32,
    /// Chunk size as a fraction of the output width, in (0, 1].
    pub chunk_width: f64,
    /// Chunk size as a fraction of the output height, in (0, 1].
    pub chunk_height: f64,
    /// Frame for single images, first frame for animations.
    pub frame: i32,
    /// Last frame (inclusive) for animations.
    pub frame_end: Option<i32>,
    /// Empty uses the scene saved in the file.
    pub scene: String,
    pub samples: u32,
    pub engine: Engine,
    /// Empty inherits the node default.
    pub denoiser: String,
    pub strategy: RenderStrategy,
    pub order: TaskOrder,
    pub render_format: Format,
    /// 0 uses the frame rate of the blend file.
    pub fps: u32,
    pub blender_update_workaround: bool,
    pub use_auto_performance: bool,
}

impl Default for RenderManagerSettings {
    fn default() -> Self {
        Self {
            output_width: 1920,
            output_height: 1080,
            chunk_width: 0.25,
            chunk_height: 0.25,
            frame: 1,
            frame_end: None,
            scene: String::new(),
            samples: 128,
            engine: Engine::Cycles,
            denoiser: String::new(),
            strategy: RenderStrategy::default(),
            order: TaskOrder::default(),
            render_format: Format::PNG,
            fps: 0,
            blender_update_workaround: false,
            use_auto_performance: true,
        }
    }
}

impl RenderManagerSettings {
    /// Chunk ratios derived from a square chunk size in pixels, like the render window does.
    pub fn with_chunk_size(mut self, pixels: u32) -> Self {
        self.chunk_width = (pixels as f64 / self.output_width.max(1) as f64).min(1.0);
        self.chunk_height = (pixels as f64 / self.output_height.max(1) as f64).min(1.0);
        self
    }

    pub fn validate(&self) -> Result<(), FarmError> {
        if self.output_width == 0 || self.output_height == 0 {
            return Err(FarmError::InvalidState(format!(
                "output size {}x{} is empty",
                self.output_width, self.output_height
            )));
        }

        let in_range = |ratio: f64| ratio > 0.0 && ratio <= 1.0;
        if !in_range(self.chunk_width) || !in_range(self.chunk_height) {
            return Err(FarmError::InvalidState(format!(
                "chunk ratio {}x{} must be within (0, 1]",
                self.chunk_width, self.chunk_height
            )));
        }

        if let Some(end) = self.frame_end {
            if end < self.frame {
                return Err(FarmError::InvalidState(format!(
                    "frame range {}..{} ends before it starts",
                    self.frame, end
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert!(RenderManagerSettings::default().validate().is_ok());
    }

    #[test]
    fn chunk_ratio_outside_range_is_rejected() {
        let mut settings = RenderManagerSettings::default();
        settings.chunk_width = 0.0;
        assert!(settings.validate().is_err());

        settings.chunk_width = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn reversed_frame_range_is_rejected() {
        let settings = RenderManagerSettings {
            frame: 10,
            frame_end: Some(3),
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(FarmError::InvalidState(_))));
    }

    #[test]
    fn chunk_size_is_resolution_independent() {
        let settings = RenderManagerSettings {
            output_width: 1000,
            output_height: 500,
            ..Default::default()
        }
        .with_chunk_size(250);
        assert_eq!(settings.chunk_width, 0.25);
        assert_eq!(settings.chunk_height, 0.5);
    }

    #[test]
    fn strategy_names_parse_loosely() {
        assert_eq!("split-chunked".parse::<RenderStrategy>().unwrap(), RenderStrategy::SplitChunked);
        assert_eq!("Horizontal".parse::<RenderStrategy>().unwrap(), RenderStrategy::SplitHorizontal);
        assert_eq!("center".parse::<TaskOrder>().unwrap(), TaskOrder::Center);
        assert!("spiral".parse::<TaskOrder>().is_err());
    }
}
