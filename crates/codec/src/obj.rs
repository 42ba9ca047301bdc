use std::io::Write;

use kiln_mesh::{vec3, Colors, Face, Mesh, Rgba, Vector3};

use crate::error::{CodecError, Result};
use crate::Format;

fn malformed(line: usize, reason: impl std::fmt::Display) -> CodecError {
    CodecError::malformed(Format::Obj, format!("line {line}: {reason}"))
}

fn parse_floats(line: usize, words: &[&str]) -> Result<Vec<f32>> {
    words
        .iter()
        .map(|w| w.parse::<f32>().map_err(|_| malformed(line, format!("bad number `{w}`"))))
        .collect()
}

// OBJ indices are 1-based; negative values count back from the most recent element.
fn resolve(line: usize, raw: &str, len: usize) -> Result<usize> {
    let i: i64 = raw
        .parse()
        .map_err(|_| malformed(line, format!("bad index `{raw}`")))?;
    let resolved = match i {
        0 => None,
        i if i > 0 => Some(i as usize - 1),
        i => (len as i64 + i).try_into().ok(),
    };
    match resolved {
        Some(r) if r < len => Ok(r),
        _ => Err(malformed(line, format!("index {i} out of range"))),
    }
}

/// Reads Wavefront geometry: `v`, `vn` and `f` records. Texture coordinates, groups and
/// material references are skipped.
pub fn parse_obj(data: &[u8]) -> Result<Mesh> {
    let text = std::str::from_utf8(data).map_err(|e| malformed(0, e))?;

    let mut positions: Vec<Vector3> = Vec::new();
    let mut colors: Vec<Rgba> = Vec::new();
    let mut normal_pool: Vec<Vector3> = Vec::new();
    let mut corner_normals: Vec<(usize, usize)> = Vec::new();
    let mut faces: Vec<Face> = Vec::new();

    for (n, raw_line) in text.lines().enumerate() {
        let line = n + 1;
        let content = raw_line.split('#').next().unwrap_or("").trim();
        let mut words = content.split_whitespace();
        let Some(keyword) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        match keyword {
            "v" => {
                let v = parse_floats(line, &args)?;
                if v.len() < 3 {
                    return Err(malformed(line, "vertex needs 3 coordinates"));
                }
                positions.push(vec3(v[0], v[1], v[2]));
                // A common extension appends an RGB triple in 0..1 to each vertex.
                if v.len() >= 6 {
                    colors.push([
                        (v[3] * 255.0).round().clamp(0.0, 255.0) as u8,
                        (v[4] * 255.0).round().clamp(0.0, 255.0) as u8,
                        (v[5] * 255.0).round().clamp(0.0, 255.0) as u8,
                        255,
                    ]);
                }
            }
            "vn" => {
                let v = parse_floats(line, &args)?;
                if v.len() < 3 {
                    return Err(malformed(line, "normal needs 3 components"));
                }
                normal_pool.push(vec3(v[0], v[1], v[2]));
            }
            "f" => {
                if args.len() < 3 {
                    return Err(malformed(line, "face needs at least 3 vertices"));
                }
                let mut polygon = Vec::with_capacity(args.len());
                for corner in &args {
                    let mut refs = corner.split('/');
                    let v = resolve(line, refs.next().unwrap_or(""), positions.len())?;
                    let _texcoord = refs.next();
                    if let Some(vn) = refs.next().filter(|s| !s.is_empty()) {
                        corner_normals.push((v, resolve(line, vn, normal_pool.len())?));
                    }
                    polygon.push(v as u32);
                }
                for i in 1..polygon.len() - 1 {
                    faces.push(Face::new(polygon[0], polygon[i], polygon[i + 1]));
                }
            }
            _ => {}
        }
    }

    // OBJ indexes normals independently of positions. They are kept only when every
    // position received one; the first normal referenced for a position wins.
    let mut normals: Vec<Option<Vector3>> = vec![None; positions.len()];
    for (v, vn) in corner_normals {
        normals[v].get_or_insert(normal_pool[vn]);
    }
    let normals: Option<Vec<Vector3>> = normals.into_iter().collect();

    let vertex_count = positions.len();
    let mut mesh = Mesh::new(positions, faces)?;
    if let Some(normals) = normals.filter(|n| !n.is_empty()) {
        mesh = mesh.with_normals(normals)?;
    }
    if !colors.is_empty() && colors.len() == vertex_count {
        mesh = mesh.with_colors(Colors::Vertex(colors))?;
    }
    Ok(mesh)
}

/// Writes Wavefront geometry. Colors and materials are not exported.
pub fn write_obj<W: Write>(w: &mut W, mesh: &Mesh) -> Result<()> {
    writeln!(w, "# written by kiln")?;
    writeln!(w, "# {} vertices, {} faces", mesh.vertex_count(), mesh.face_count())?;
    for p in mesh.positions() {
        writeln!(w, "v {} {} {}", p.x, p.y, p.z)?;
    }
    let normals = mesh.normals();
    if let Some(normals) = normals {
        for n in normals {
            writeln!(w, "vn {} {} {}", n.x, n.y, n.z)?;
        }
    }
    for face in mesh.faces() {
        let [a, b, c] = face.indices().map(|i| i + 1);
        if normals.is_some() {
            writeln!(w, "f {a}//{a} {b}//{b} {c}//{c}")?;
        } else {
            writeln!(w, "f {a} {b} {c}")?;
        }
    }
    Ok(())
}
