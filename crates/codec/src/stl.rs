use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use kiln_mesh::{vec3, Mesh, Triangle, TriangleMesh, Vector3};
use std::io::{Read, Seek, Write};

use crate::error::{CodecError, Result};
use crate::Format;

const HEADER_LEN: usize = 80;
const TRIANGLE_RECORD_LEN: usize = 50;

fn read_vector<T: Read>(f: &mut T) -> std::io::Result<Vector3> {
    Ok(vec3(
        f.read_f32::<LittleEndian>()?,
        f.read_f32::<LittleEndian>()?,
        f.read_f32::<LittleEndian>()?,
    ))
}

fn read_binary<M: TriangleMesh, T: Read + Seek>(f: &mut T) -> std::io::Result<M> {
    // Binary files start with an 80 byte header. There is no defined structure for this
    // header but some implementations will stash some metadata in this header. For now
    // we'll just skip the header and load the geometry.
    f.seek(std::io::SeekFrom::Start(HEADER_LEN as u64))?;

    // Immediately following the header is an unsigned 32-bit integer that indicates the
    // number of triangles that follow.
    let n_triangles = f.read_u32::<LittleEndian>()? as usize;

    let mut data = Vec::<Triangle>::with_capacity(n_triangles);
    for _ in 0..n_triangles {
        // Each triangle is specified by a normal vector followed by 3 vertices of the
        // triangle. The normal is redundant with counter-clockwise vertex order and is
        // frequently written as (0, 0, 0), so it is ignored.
        let _normal = read_vector(f)?;
        data.push(Triangle {
            p0: read_vector(f)?,
            p1: read_vector(f)?,
            p2: read_vector(f)?,
        });
        // After the triangle geometry there is a 2-byte unsigned integer called the
        // "attribute byte count". There is no standard structure of this field, but
        // some applications use this for color data.
        let _attribute_byte_count = f.read_u16::<LittleEndian>()?;
    }
    Ok(M::from_triangles(data))
}

fn read_ascii<M: TriangleMesh>(text: &str) -> Result<M> {
    let mut tokens = text.split_ascii_whitespace();
    let mut corners = Vec::new();
    while let Some(token) = tokens.next() {
        if !token.eq_ignore_ascii_case("vertex") {
            continue;
        }
        let mut coord = || -> Result<f32> {
            tokens
                .next()
                .and_then(|t| t.parse::<f32>().ok())
                .ok_or_else(|| CodecError::malformed(Format::Stl, "vertex needs 3 coordinates"))
        };
        corners.push(vec3(coord()?, coord()?, coord()?));
    }
    if corners.len() % 3 != 0 {
        return Err(CodecError::malformed(
            Format::Stl,
            format!("{} vertices do not form whole facets", corners.len()),
        ));
    }
    let triangles = corners
        .chunks_exact(3)
        .map(|c| Triangle::new(c[0], c[1], c[2]))
        .collect();
    Ok(M::from_triangles(triangles))
}

// Size in bytes of a binary file holding `n` triangles, if it fits in memory at all.
fn binary_len(n: u32) -> Option<usize> {
    (n as usize)
        .checked_mul(TRIANGLE_RECORD_LEN)?
        .checked_add(HEADER_LEN + 4)
}

fn triangle_count(data: &[u8]) -> Option<u32> {
    let mut count = data.get(HEADER_LEN..HEADER_LEN + 4)?;
    count.read_u32::<LittleEndian>().ok()
}

// Binary files may also begin with "solid", so the record count has to agree with the
// file size before we trust the binary layout.
fn is_binary(data: &[u8]) -> bool {
    triangle_count(data).and_then(binary_len) == Some(data.len())
}

/// Parses a binary or ASCII STL file.
pub fn parse_stl<M: TriangleMesh>(data: &[u8]) -> Result<M> {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let looks_ascii = data[start..].starts_with(b"solid");
    if looks_ascii && !is_binary(data) {
        let text = std::str::from_utf8(data)
            .map_err(|e| CodecError::malformed(Format::Stl, e.to_string()))?;
        return read_ascii(text);
    }

    // The header's count is checked against the payload before anything is allocated.
    let n = triangle_count(data).ok_or_else(|| {
        CodecError::malformed(Format::Stl, format!("{} bytes is too short", data.len()))
    })?;
    match binary_len(n) {
        Some(len) if len <= data.len() => {}
        _ => {
            return Err(CodecError::malformed(
                Format::Stl,
                format!("{n} triangles do not fit in {} bytes", data.len()),
            ));
        }
    }
    let mut c = std::io::Cursor::new(data);
    Ok(read_binary(&mut c)?)
}

/// Writes a binary STL file.
///
/// STL has no shared vertices: every triangle is written with its own three corners and a
/// per-face normal.
pub fn write_stl<W: Write>(w: &mut W, mesh: &Mesh) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    let tag = b"binary STL written by kiln";
    header[..tag.len()].copy_from_slice(tag);
    w.write_all(&header)?;
    w.write_u32::<LittleEndian>(mesh.face_count() as u32)?;
    for t in mesh.triangles() {
        for v in [t.normal(), t.p0, t.p1, t.p2] {
            w.write_f32::<LittleEndian>(v.x)?;
            w.write_f32::<LittleEndian>(v.y)?;
            w.write_f32::<LittleEndian>(v.z)?;
        }
        w.write_u16::<LittleEndian>(0)?;
    }
    Ok(())
}
