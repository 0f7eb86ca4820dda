use serde::{Deserialize, Serialize};
use std::ops::Range;

// In the python expression, this Window values gets assigned to border of scn.render.border_*
// Here - I'm calling it as window instead.
// Blender measures the border from the bottom left corner, in fractions of the output resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub x: Range<f32>,
    pub y: Range<f32>,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            x: Range {
                start: 0.0,
                end: 1.0,
            },
            y: Range {
                start: 0.0,
                end: 1.0,
            },
        }
    }
}

impl Window {
    /// Convert a pixel rectangle measured from the top left corner of the image
    /// into a blender border window.
    pub fn from_pixels(x: u32, y: u32, width: u32, height: u32, out_w: u32, out_h: u32) -> Self {
        let out_w = out_w.max(1) as f32;
        let out_h = out_h.max(1) as f32;
        let top = y as f32;
        let bottom = (y + height) as f32;
        Self {
            x: Range {
                start: x as f32 / out_w,
                end: (x + width) as f32 / out_w,
            },
            // flip the y axis, blender origin sits at the bottom.
            y: Range {
                start: (out_h - bottom) / out_h,
                end: (out_h - top) / out_h,
            },
        }
    }

    pub fn is_full(&self) -> bool {
        self == &Self::default()
    }
}
