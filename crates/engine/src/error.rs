use std::fmt;

use kiln_codec::{CodecError, Format};
use kiln_surface::SurfaceError;
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::PipelineId;

#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("memory fraction {0} is outside (0, 1]")]
    InvalidFraction(f32),
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("failed to load pipeline {identity}: {reason}")]
    PipelineLoadFailed { identity: PipelineId, reason: String },

    #[error("no loader registered for pipeline {0}")]
    UnknownPipeline(PipelineId),
}

/// Where in a request an [`EngineError`] happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    RequestValidation,
    InputDecoding,
    DeviceAcquisition,
    PipelineLoad,
    PipelineExecution,
    SurfaceExtraction,
    MeshExport,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::RequestValidation => "request validation",
            Stage::InputDecoding => "input decoding",
            Stage::DeviceAcquisition => "device acquisition",
            Stage::PipelineLoad => "pipeline load",
            Stage::PipelineExecution => "pipeline execution",
            Stage::SurfaceExtraction => "surface extraction",
            Stage::MeshExport => "mesh export",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported format `{0}`")]
    UnsupportedFormat(String),

    #[error("could not decode {format} input: {source}")]
    Decode {
        format: Format,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("pipeline {identity} failed: {reason}")]
    GenerationFailed { identity: PipelineId, reason: String },

    #[error("surface extraction failed: {0}")]
    Surface(#[source] SurfaceError),

    #[error("could not export {format}: {source}")]
    Export {
        format: Format,
        #[source]
        source: CodecError,
    },
}

impl EngineError {
    pub fn stage(&self) -> Stage {
        match self {
            EngineError::InvalidRequest(_) | EngineError::UnsupportedFormat(_) => {
                Stage::RequestValidation
            }
            EngineError::Decode { .. } => Stage::InputDecoding,
            EngineError::Device(_) => Stage::DeviceAcquisition,
            EngineError::Registry(_) => Stage::PipelineLoad,
            EngineError::GenerationFailed { .. } => Stage::PipelineExecution,
            EngineError::Surface(_) => Stage::SurfaceExtraction,
            EngineError::Export { .. } => Stage::MeshExport,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidRequest(reason.into())
    }

    pub(crate) fn decode(
        format: Format,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        EngineError::Decode {
            format,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
