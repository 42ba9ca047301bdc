use thiserror::Error;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("field has a constant value of {0}; nothing to normalize")]
    DegenerateField(f32),

    #[error("no isosurface at threshold {threshold}")]
    EmptyIsosurface { threshold: f32 },

    #[error("invalid scalar field: {0}")]
    InvalidField(String),

    #[error("invalid NIfTI image: {0}")]
    InvalidNifti(String),

    #[error(transparent)]
    InvalidMesh(#[from] kiln_mesh::MeshError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SurfaceError>;
