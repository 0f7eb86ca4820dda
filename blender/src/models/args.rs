use super::{device::Device, engine::Engine, format::Format, mode::Mode, window::Window};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ref: https://docs.blender.org/manual/en/latest/advanced/command_line/render.html
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    file: PathBuf,              // required
    output: PathBuf,            // required
    mode: Mode,                 // required
    pub engine: Option<Engine>, // optional
    pub device: Option<Device>, // optional
    pub format: Option<Format>, // optional - default to Png
    pub scene: Option<String>,
    /// Border to render, blender crops the output image to it.
    pub window: Option<Window>,
    /// Override the resolution stored in the blend file.
    pub resolution: Option<(u32, u32)>,
    pub samples: Option<u32>,
    /// Empty string or None keeps whatever the blend file has.
    pub denoiser: Option<String>,
    pub fps: Option<u32>,
    /// Force a view layer update before rendering. Some versions render stale geometry without it.
    pub force_update: bool,
}

impl Args {
    pub fn new(file: impl AsRef<Path>, output: impl AsRef<Path>, mode: Mode) -> Self {
        Args {
            file: file.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            mode,
            ..Default::default()
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Python executed before the render starts. None if the file settings are used as is.
    pub fn python_expr(&self) -> Option<String> {
        let mut lines: Vec<String> = Vec::new();

        if let Some((width, height)) = self.resolution {
            lines.push(format!("r.resolution_x = {width}"));
            lines.push(format!("r.resolution_y = {height}"));
            lines.push("r.resolution_percentage = 100".to_owned());
        }

        if let Some(window) = self.window.as_ref().filter(|w| !w.is_full()) {
            lines.push("r.use_border = True".to_owned());
            lines.push("r.use_crop_to_border = True".to_owned());
            lines.push(format!("r.border_min_x = {}", window.x.start));
            lines.push(format!("r.border_max_x = {}", window.x.end));
            lines.push(format!("r.border_min_y = {}", window.y.start));
            lines.push(format!("r.border_max_y = {}", window.y.end));
        }

        if let Some(samples) = self.samples.filter(|s| *s > 0) {
            match self.engine {
                Some(Engine::Eevee) => lines.push(format!("scn.eevee.taa_render_samples = {samples}")),
                _ => lines.push(format!("scn.cycles.samples = {samples}")),
            }
        }

        if let Some(denoiser) = self.denoiser.as_ref().filter(|d| !d.is_empty()) {
            if denoiser.eq_ignore_ascii_case("none") {
                lines.push("scn.cycles.use_denoising = False".to_owned());
            } else {
                lines.push("scn.cycles.use_denoising = True".to_owned());
                lines.push(format!("scn.cycles.denoiser = '{}'", denoiser.to_uppercase()));
            }
        }

        if let Some(fps) = self.fps.filter(|f| *f > 0) {
            lines.push(format!("r.fps = {fps}"));
        }

        if self.force_update {
            lines.push("bpy.context.view_layer.update()".to_owned());
        }

        if lines.is_empty() {
            return None;
        }

        let mut expr = vec![
            "import bpy".to_owned(),
            "scn = bpy.context.scene".to_owned(),
            "r = scn.render".to_owned(),
        ];
        expr.append(&mut lines);
        Some(expr.join("\n"))
    }

    pub fn create_arg_list(&self) -> Vec<String> {
        // More context: https://docs.blender.org/manual/en/latest/advanced/command_line/arguments.html#argument-order
        // # is substitute to 0 pad, none will add to suffix four pounds (####)
        let mut col = vec!["-b".to_owned(), self.file.to_string_lossy().to_string()];

        if let Some(scene) = &self.scene {
            col.push("-S".to_owned());
            col.push(scene.to_owned());
        }

        if let Some(engine) = &self.engine {
            col.push("-E".to_owned());
            col.push(engine.to_string());
        }

        // must come after the engine switch, otherwise -E resets what we set here.
        if let Some(expr) = self.python_expr() {
            col.push("--python-expr".to_owned());
            col.push(expr);
        }

        col.push("-o".to_owned());
        col.push(self.output.to_string_lossy().to_string());

        if let Some(format) = &self.format {
            col.push("-F".to_owned());
            col.push(format.to_string());
            col.push("-x".to_owned()); // explicitly use extension
            col.push("1".to_owned());
        }

        // this argument must be set at the very end
        let mut additional_args = match self.mode {
            Mode::Frame(frame) => vec!["-f".to_owned(), frame.to_string()],
            // Render the whole animation using all the settings saved in the blend-file.
            Mode::Animation { start, end } => vec![
                "-s".to_owned(),
                start.to_string(),
                "-e".to_owned(),
                end.to_string(),
                "-a".to_owned(),
            ],
        };
        col.append(&mut additional_args);

        // Cycles add-on options must be specified following a double dash.
        if Some(Engine::Cycles) == self.engine {
            if let Some(device) = &self.device {
                col.push("--".to_owned());
                col.push("--cycles-device".to_owned());
                col.push(device.to_string());
            }
        }

        col
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_frame_has_no_python() {
        let args = Args::new("scene.blend", "/tmp/out/frame_####", Mode::Frame(12));
        let list = args.create_arg_list();
        assert_eq!(
            list,
            vec!["-b", "scene.blend", "-o", "/tmp/out/frame_####", "-f", "12"]
        );
    }

    #[test]
    fn chunk_window_goes_before_frame() {
        let mut args = Args::new("scene.blend", "/tmp/out/chunk_####", Mode::Frame(3));
        args.engine = Some(Engine::Cycles);
        args.format = Some(Format::PNG);
        args.window = Some(Window::from_pixels(0, 0, 50, 50, 100, 100));
        args.samples = Some(64);
        args.device = Some(Device::CUDA);

        let list = args.create_arg_list();
        let expr_at = list.iter().position(|a| a == "--python-expr").unwrap();
        let frame_at = list.iter().position(|a| a == "-f").unwrap();
        assert!(expr_at < frame_at);

        let expr = &list[expr_at + 1];
        assert!(expr.contains("r.use_crop_to_border = True"));
        assert!(expr.contains("r.border_min_y = 0.5"));
        assert!(expr.contains("scn.cycles.samples = 64"));
        assert_eq!(&list[list.len() - 3..], ["--", "--cycles-device", "CUDA"]);
    }

    #[test]
    fn none_denoiser_disables_denoising() {
        let mut args = Args::new("a.blend", "out", Mode::Frame(1));
        args.denoiser = Some("None".to_owned());
        assert!(args
            .python_expr()
            .unwrap()
            .contains("scn.cycles.use_denoising = False"));
    }

    #[test]
    fn inherit_denoiser_is_untouched() {
        let mut args = Args::new("a.blend", "out", Mode::Frame(1));
        args.denoiser = Some(String::new());
        assert_eq!(args.python_expr(), None);
    }
}
