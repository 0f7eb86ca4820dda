use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Unknown output format `{0}`")]
    InvalidInput(String),
}

// More context: https://docs.blender.org/manual/en/latest/advanced/command_line/arguments.html#format-options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    TGA,
    RAWTGA,
    JPEG,
    IRIS,
    AVIRAW,
    AVIJPEG,
    #[default]
    PNG,
    BMP,
    HDR,
    TIFF,
    EXR,
}

impl Format {
    /// File extension blender appends when `-x 1` is in effect.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::TGA | Format::RAWTGA => "tga",
            Format::JPEG => "jpg",
            Format::IRIS => "rgb",
            Format::AVIRAW | Format::AVIJPEG => "avi",
            Format::PNG => "png",
            Format::BMP => "bmp",
            Format::HDR => "hdr",
            Format::TIFF => "tif",
            Format::EXR => "exr",
        }
    }
}

impl Serialize for Format {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for Format {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TGA" | "TARGA" => Ok(Format::TGA),
            "RAWTGA" | "RAWTARGA" => Ok(Format::RAWTGA),
            "JPEG" | "JPG" => Ok(Format::JPEG),
            "IRIS" => Ok(Format::IRIS),
            "AVIRAW" => Ok(Format::AVIRAW),
            "AVIJPEG" => Ok(Format::AVIJPEG),
            "PNG" => Ok(Format::PNG),
            "BMP" => Ok(Format::BMP),
            "HDR" => Ok(Format::HDR),
            "TIFF" | "TIF" => Ok(Format::TIFF),
            "EXR" | "OPEN_EXR" => Ok(Format::EXR),
            _ => Err(FormatError::InvalidInput(s.to_owned())),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::TGA => "TARGA",
            Format::RAWTGA => "RAWTARGA",
            Format::JPEG => "JPEG",
            Format::IRIS => "IRIS",
            Format::AVIRAW => "AVIRAW",
            Format::AVIJPEG => "AVIJPEG",
            Format::PNG => "PNG",
            Format::BMP => "BMP",
            Format::HDR => "HDR",
            Format::TIFF => "TIFF",
            Format::EXR => "OPEN_EXR",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_name() {
        for format in [Format::TGA, Format::JPEG, Format::PNG, Format::EXR] {
            let parsed: Format = format.to_string().parse().ok().unwrap();
            assert_eq!(parsed, format);
        }
    }

    #[test]
    fn rejects_unknown_format() {
        assert!("webm".parse::<Format>().is_err());
    }
}
