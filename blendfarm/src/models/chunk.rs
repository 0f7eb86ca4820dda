use serde::{Deserialize, Serialize};

/// Pixel rectangle of the output image. Origin is the top left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Pending,
    InFlight,
    Done,
    Failed(String),
}

/// A unit of work: one region of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: usize,
    pub frame: i32,
    pub region: Region,
    /// Node this chunk is bound to. Set before dispatch, may change on reassignment.
    pub node: Option<String>,
    pub state: ChunkState,
    /// Nodes whose renderer failed this chunk. A retry goes elsewhere.
    pub failed_on: Vec<String>,
}

impl Chunk {
    pub fn new(id: usize, frame: i32, region: Region) -> Self {
        Self {
            id,
            frame,
            region,
            node: None,
            state: ChunkState::Pending,
            failed_on: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }
}
