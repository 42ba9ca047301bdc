use kiln_mesh::MeshError;
use thiserror::Error;

use crate::Format;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported format `{0}`")]
    UnsupportedFormat(String),

    #[error("malformed {format} data: {reason}")]
    Malformed { format: Format, reason: String },

    #[error(transparent)]
    InvalidMesh(#[from] MeshError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("glTF JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    pub(crate) fn malformed(format: Format, reason: impl Into<String>) -> Self {
        CodecError::Malformed {
            format,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
