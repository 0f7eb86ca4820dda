use crate::{
    domains::chunk_renderer::ChunkRenderer,
    models::{error::FarmError, message::ChunkRequest},
};
use blender::{
    models::{args::Args, format::Format, mode::Mode, window::Window},
    Blender,
};
use std::path::{Path, PathBuf};

/// Renders chunks with the blender installation of this machine.
pub struct BlenderRenderer {
    blender: Blender,
}

impl BlenderRenderer {
    pub fn new(blender: Blender) -> Self {
        Self { blender }
    }

    pub fn blender(&self) -> &Blender {
        &self.blender
    }

    /// Arguments for one chunk. Chunks always come back as PNG, the host encodes the final format.
    pub fn chunk_args(blend_file: &Path, request: &ChunkRequest, output_dir: &Path) -> Args {
        let settings = &request.settings;
        let region = &request.region;
        let output: PathBuf = output_dir.join(format!(
            "{}_{}_{}x{}_####",
            request.frame, request.job_id, region.x, region.y
        ));

        let mut args = Args::new(blend_file, output, Mode::Frame(request.frame));
        args.engine = Some(settings.engine);
        args.format = Some(Format::PNG);
        args.scene = Some(settings.scene.clone()).filter(|s| !s.is_empty());
        args.window = Some(Window::from_pixels(
            region.x,
            region.y,
            region.width,
            region.height,
            settings.output_width,
            settings.output_height,
        ));
        args.resolution = Some((settings.output_width, settings.output_height));
        args.samples = Some(settings.samples);
        args.denoiser = Some(settings.denoiser.clone());
        args.fps = Some(settings.fps);
        args.force_update = settings.blender_update_workaround;
        args
    }
}

#[async_trait::async_trait]
impl ChunkRenderer for BlenderRenderer {
    async fn render(&self, blend_file: &Path, request: &ChunkRequest, output_dir: &Path) -> Result<Vec<u8>, FarmError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let args = Self::chunk_args(blend_file, request, output_dir);
        let saved = self
            .blender
            .render(&args)
            .await
            .map_err(|e| FarmError::backend("local", e))?;

        let data = tokio::fs::read(&saved).await?;
        if let Err(e) = tokio::fs::remove_file(&saved).await {
            tracing::debug!("Unable to clean up {saved:?}: {e}");
        }
        Ok(data)
    }
}
