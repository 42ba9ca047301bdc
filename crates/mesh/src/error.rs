use thiserror::Error;

/// A mesh failed one of its structural invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("face {face} references vertex {index} but the mesh has {vertex_count} vertices")]
    IndexOutOfRange {
        face: usize,
        index: u32,
        vertex_count: usize,
    },

    #[error("{attribute} has {actual} entries, expected {expected}")]
    AttributeCount {
        attribute: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("mesh has {0} vertices, more than a u32 index can address")]
    TooManyVertices(usize),
}

pub type Result<T> = std::result::Result<T, MeshError>;
