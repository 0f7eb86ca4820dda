use std::path::PathBuf;

/// Progress reported while a blender process runs, parsed from its stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Running { status: String },
    Rendering { current: u32, total: u32 },
    Warning { message: String },
    Completed { frame: i32, result: PathBuf },
}

impl Status {
    /// Parse one stdout line. Returns None for lines we don't care about.
    pub fn parse_line(line: &str, frame: i32) -> Option<Self> {
        if line.contains("Warning:") {
            return Some(Status::Warning {
                message: line.trim().to_owned(),
            });
        }

        if line.contains("Saved:") {
            // Saved: '/tmp/render/frame_0001.png'
            let location = line.split('\'').collect::<Vec<&str>>();
            let path = location.get(1)?.trim();
            return Some(Status::Completed {
                frame,
                result: PathBuf::from(path),
            });
        }

        if line.contains("Fra:") {
            let last = line.split('|').last()?.trim();
            let slice = last.split(' ').collect::<Vec<&str>>();
            // "Rendering 12 / 64 samples" or "Sample 12/64"
            if slice.first() == Some(&"Rendering") && slice.len() >= 4 {
                if let (Ok(current), Ok(total)) = (slice[1].parse(), slice[3].parse()) {
                    return Some(Status::Rendering { current, total });
                }
            }
            return Some(Status::Running {
                status: last.to_owned(),
            });
        }

        None
    }
}
