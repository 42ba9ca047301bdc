use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use crate::error::CodecError;

/// Every container the codec knows about.
///
/// The four mesh formats can be both read and written. `Nifti` (volumetric imaging) is
/// accepted as an input only; it is decoded into a scalar field and meshed before export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Binary glTF 2.0 scene.
    Glb,
    /// Wavefront text geometry.
    Obj,
    /// Binary stereolithography triangle soup.
    Stl,
    /// Stanford polygon file.
    Ply,
    /// NIfTI-1 volumetric image, optionally gzip-compressed.
    Nifti,
}

impl Format {
    pub const MESH_FORMATS: [Format; 4] = [Format::Glb, Format::Obj, Format::Stl, Format::Ply];

    /// Looks up a format by name or extension, with or without the leading dot.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().trim_start_matches('.').to_ascii_lowercase();
        match name.as_str() {
            "glb" => Some(Format::Glb),
            "obj" => Some(Format::Obj),
            "stl" => Some(Format::Stl),
            "ply" => Some(Format::Ply),
            "nii" | "nii.gz" => Some(Format::Nifti),
            _ => None,
        }
    }

    /// Determines the format from a file name, honouring the `.nii.gz` double extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.to_ascii_lowercase().ends_with(".nii.gz") {
            return Some(Format::Nifti);
        }
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Format::from_name)
    }

    /// Resolves a requested output format, rejecting anything that is not a mesh container.
    pub fn parse_output(name: &str) -> Result<Self, CodecError> {
        match Format::from_name(name) {
            Some(f) if f.is_mesh() => Ok(f),
            _ => Err(CodecError::UnsupportedFormat(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::Glb => "glb",
            Format::Obj => "obj",
            Format::Stl => "stl",
            Format::Ply => "ply",
            Format::Nifti => "nii.gz",
        }
    }

    pub fn extension(&self) -> String {
        format!(".{}", self.name())
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Format::Glb => "model/gltf-binary",
            Format::Obj => "model/obj",
            Format::Stl => "model/stl",
            Format::Ply => "application/x-ply",
            Format::Nifti => "application/octet-stream",
        }
    }

    pub fn is_mesh(&self) -> bool {
        !matches!(self, Format::Nifti)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::from_name(s).ok_or_else(|| CodecError::UnsupportedFormat(s.to_string()))
    }
}

/// True when `filename` names a file the conversion path can read.
pub fn validate_input_format(filename: &str) -> bool {
    Format::from_filename(filename).is_some()
}

/// True when `name` is a mesh container the codec can write.
pub fn validate_output_format(name: &str) -> bool {
    Format::from_name(name).map_or(false, |f| f.is_mesh())
}
