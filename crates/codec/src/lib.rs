//! Reading and writing triangle meshes in the interchange formats kiln speaks.

mod error;
mod format;
mod glb;
mod obj;
mod ply;
mod stl;

pub use error::*;
pub use format::*;
pub use glb::{parse_glb, write_glb};
pub use kiln_mesh::{describe, MeshInfo};
pub use obj::{parse_obj, write_obj};
pub use ply::{parse_ply, write_ply};
pub use stl::{parse_stl, write_stl};

use kiln_mesh::Mesh;

/// Serializes `mesh` into `format`.
///
/// Fails with [`CodecError::UnsupportedFormat`] for containers that do not hold meshes.
pub fn export(mesh: &Mesh, format: Format) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match format {
        Format::Glb => write_glb(&mut out, mesh)?,
        Format::Obj => write_obj(&mut out, mesh)?,
        Format::Stl => write_stl(&mut out, mesh)?,
        Format::Ply => write_ply(&mut out, mesh)?,
        Format::Nifti => return Err(CodecError::UnsupportedFormat(format.name().to_string())),
    }
    log::debug!(
        "exported {} vertices / {} faces as {} ({} bytes)",
        mesh.vertex_count(),
        mesh.face_count(),
        format,
        out.len()
    );
    Ok(out)
}

/// Like [`export`], with the target given by name (`"glb"`, `".stl"`, ...).
pub fn export_named(mesh: &Mesh, format: &str) -> Result<Vec<u8>> {
    export(mesh, Format::parse_output(format)?)
}

/// Parses `data` as a mesh stored in `format`.
///
/// Volumetric inputs are not meshes; they go through `kiln_surface` instead.
pub fn import(data: &[u8], format: Format) -> Result<Mesh> {
    let mesh = match format {
        Format::Glb => parse_glb(data)?,
        Format::Obj => parse_obj(data)?,
        Format::Stl => parse_stl(data)?,
        Format::Ply => parse_ply(data)?,
        Format::Nifti => return Err(CodecError::UnsupportedFormat(format.name().to_string())),
    };
    log::debug!(
        "imported {} vertices / {} faces from {}",
        mesh.vertex_count(),
        mesh.face_count(),
        format
    );
    Ok(mesh)
}
