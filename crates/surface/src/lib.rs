//! Turning volumetric intensity data into triangle meshes.

mod error;
mod extract;
mod field;
pub mod nifti;

pub use error::*;
pub use extract::extract;
pub use field::{choose_threshold, normalize, ScalarField};

use kiln_mesh::Mesh;

/// Normalizes `field`, picks the isosurface level and extracts it at the field's own
/// voxel spacing.
pub fn field_to_mesh(field: &ScalarField) -> Result<Mesh> {
    let normalized = normalize(field)?;
    let threshold = choose_threshold(&normalized);
    log::debug!("isosurface threshold {threshold:.4}");
    extract(&normalized, threshold, field.spacing())
}
