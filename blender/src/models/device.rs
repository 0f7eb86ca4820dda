use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub enum Device {
    #[default]
    CPU,
    CUDA,
    OPTIX,
    HIP,
    ONEAPI,
    METAL,
}

// Append +CPU to a GPU device to render on both CPU and GPU.
impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Device::CPU => "CPU",
            Device::CUDA => "CUDA",
            Device::OPTIX => "OPTIX",
            Device::HIP => "HIP",
            Device::ONEAPI => "ONEAPI",
            Device::METAL => "METAL",
        };
        write!(f, "{name}")
    }
}
