use crate::models::{args::Args, mode::Mode, status::Status};
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

#[derive(Debug, Error)]
pub enum BlenderError {
    #[error("Executable not found at {0:?}")]
    ExecutableNotFound(PathBuf),
    #[error("Unable to read blender version from output: {0}")]
    UnknownVersion(String),
    #[error("Blender exited with {code:?}: {stderr}")]
    ProcessFailed { code: Option<i32>, stderr: String },
    #[error("Blender finished without saving an image")]
    NoOutput,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blender structure to hold path to executable and version of blender installed.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Blender {
    /// Path to blender executable on the system.
    pub executable: PathBuf,
    /// Version of blender installed on the system.
    pub version: Version,
}

impl Blender {
    /// Create a new blender struct with provided path and version. Note this is not checked and enforced!
    pub fn new(executable: PathBuf, version: Version) -> Self {
        Blender {
            executable,
            version,
        }
    }

    /// Create a new blender struct from executable path. This function will fetch the version of blender by invoking -v command.
    /// Otherwise, if Blender is not install, or a version is not found, an error will be thrown
    pub async fn from_executable(executable: impl AsRef<Path>) -> Result<Self, BlenderError> {
        let executable = executable.as_ref().to_path_buf();
        if !executable.exists() {
            return Err(BlenderError::ExecutableNotFound(executable));
        }

        let output = Command::new(&executable).arg("-v").output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = Self::parse_version(&stdout)?;

        Ok(Blender {
            executable,
            version,
        })
    }

    /// Use the configured executable, or the first `blender` found on PATH.
    pub async fn locate(configured: Option<&Path>) -> Result<Self, BlenderError> {
        if let Some(path) = configured {
            return Self::from_executable(path).await;
        }

        let name = if cfg!(windows) { "blender.exe" } else { "blender" };
        let found = std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).map(|dir| dir.join(name)).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .find(|candidate| candidate.is_file());
        match found {
            Some(path) => Self::from_executable(path).await,
            None => Err(BlenderError::ExecutableNotFound(PathBuf::from(name))),
        }
    }

    fn parse_version(stdout: &str) -> Result<Version, BlenderError> {
        // "Blender 4.1.0" or "Blender 3.6.5 LTS"
        let re = Regex::new(r"Blender (\d+)\.(\d+)(?:\.(\d+))?")
            .map_err(|e| BlenderError::UnknownVersion(e.to_string()))?;
        let caps = re
            .captures(stdout)
            .ok_or_else(|| BlenderError::UnknownVersion(stdout.lines().next().unwrap_or_default().to_owned()))?;
        let part = |i: usize| -> u64 {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Ok(Version::new(part(1), part(2), part(3)))
    }

    /// Run blender with the provided arguments and wait for it to save the image.
    /// Returns the path blender reported in its `Saved:` line.
    ///
    /// The child process is killed if the returned future is dropped, so callers cancel a render by
    /// dropping it (e.g. losing a `select!`).
    pub async fn render(&self, args: &Args) -> Result<PathBuf, BlenderError> {
        let col = args.create_arg_list();
        let frame = match args.mode() {
            Mode::Frame(frame) => *frame,
            Mode::Animation { start, .. } => *start,
        };

        tracing::debug!("Invoking {:?} {:?}", &self.executable, &col);
        let mut child = Command::new(&self.executable)
            .args(col)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or(BlenderError::NoOutput)?;
        let mut lines = BufReader::new(stdout).lines();
        let mut output: Option<PathBuf> = None;

        // parse stdout for human to read
        while let Some(line) = lines.next_line().await? {
            match Status::parse_line(&line, frame) {
                Some(Status::Warning { message }) => tracing::warn!("{message}"),
                Some(Status::Rendering { current, total }) => {
                    let percentage = current as f32 / total.max(1) as f32 * 100.0;
                    tracing::trace!("Frame {frame} {:.2}%", percentage);
                }
                Some(Status::Running { status }) => tracing::trace!("{status}"),
                Some(Status::Completed { result, .. }) => output = Some(result),
                None => {}
            }
        }

        let result = child.wait_with_output().await?;
        if !result.status.success() {
            return Err(BlenderError::ProcessFailed {
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).to_string(),
            });
        }

        output.ok_or(BlenderError::NoOutput)
    }
}

impl PartialEq for Blender {
    fn eq(&self, other: &Self) -> bool {
        self.version.eq(&other.version)
    }
}
