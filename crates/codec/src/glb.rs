//! Binary glTF 2.0.
//!
//! A GLB file is a 12 byte header followed by a JSON chunk describing the scene and a BIN
//! chunk holding the vertex and index buffers. Both chunks are padded to 4 bytes.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use kiln_mesh::{bounding_box, vec3, Colors, Face, Material, Mesh, Rgba, Vector3};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{CodecError, Result};
use crate::Format;

const MAGIC: u32 = 0x4654_6C67; // "glTF"
const VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const MODE_TRIANGLES: u32 = 4;

const BYTE: u32 = 5120;
const UNSIGNED_BYTE: u32 = 5121;
const SHORT: u32 = 5122;
const UNSIGNED_SHORT: u32 = 5123;
const UNSIGNED_INT: u32 = 5125;
const FLOAT: u32 = 5126;

// Largest accessor we zero-fill when it has no buffer view behind it.
const MAX_ZERO_FILLED: usize = 1 << 20;

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::malformed(Format::Glb, reason)
}

struct BinBuilder {
    bin: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
}

impl BinBuilder {
    fn new() -> Self {
        Self {
            bin: Vec::new(),
            views: Vec::new(),
            accessors: Vec::new(),
        }
    }

    /// Appends `bytes` as a new buffer view plus an accessor over it and returns the
    /// accessor index.
    fn push(&mut self, bytes: Vec<u8>, target: u32, mut accessor: Value) -> usize {
        let offset = self.bin.len();
        self.bin.extend_from_slice(&bytes);
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        self.views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": bytes.len(),
            "target": target,
        }));
        accessor["bufferView"] = json!(self.views.len() - 1);
        self.accessors.push(accessor);
        self.accessors.len() - 1
    }
}

fn vec3_bytes(points: &[Vector3]) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * 12);
    for p in points {
        for f in [p.x, p.y, p.z] {
            out.extend_from_slice(&f.to_le_bytes());
        }
    }
    out
}

fn build_json(mesh: &Mesh, builder: &mut BinBuilder) -> Value {
    let mut document = json!({
        "asset": { "version": "2.0", "generator": "kiln" },
        "scene": 0,
        "scenes": [ { "nodes": [] } ],
    });
    if mesh.is_empty() {
        return document;
    }

    let mut attributes = Map::new();
    let (min, max) = bounding_box(mesh).map_or(([0.0; 3], [0.0; 3]), |b| (b.min, b.max));
    let position = builder.push(
        vec3_bytes(mesh.positions()),
        ARRAY_BUFFER,
        json!({
            "componentType": FLOAT,
            "count": mesh.vertex_count(),
            "type": "VEC3",
            "min": min,
            "max": max,
        }),
    );
    attributes.insert("POSITION".into(), json!(position));

    if let Some(normals) = mesh.normals() {
        let normal = builder.push(
            vec3_bytes(normals),
            ARRAY_BUFFER,
            json!({ "componentType": FLOAT, "count": normals.len(), "type": "VEC3" }),
        );
        attributes.insert("NORMAL".into(), json!(normal));
    }

    if let Some(Colors::Vertex(colors)) = mesh.colors() {
        let color = builder.push(
            colors.concat(),
            ARRAY_BUFFER,
            json!({
                "componentType": UNSIGNED_BYTE,
                "normalized": true,
                "count": colors.len(),
                "type": "VEC4",
            }),
        );
        attributes.insert("COLOR_0".into(), json!(color));
    }

    let mut index_bytes = Vec::with_capacity(mesh.face_count() * 12);
    for index in mesh.faces().iter().flat_map(Face::indices) {
        index_bytes.extend_from_slice(&index.to_le_bytes());
    }
    let indices = builder.push(
        index_bytes,
        ELEMENT_ARRAY_BUFFER,
        json!({ "componentType": UNSIGNED_INT, "count": mesh.face_count() * 3, "type": "SCALAR" }),
    );

    let mut primitive = json!({
        "attributes": attributes,
        "indices": indices,
        "mode": MODE_TRIANGLES,
    });
    if let Some(material) = mesh.material() {
        primitive["material"] = json!(0);
        document["materials"] = json!([{
            "name": material.name,
            "pbrMetallicRoughness": {
                "baseColorFactor": material.base_color,
                "metallicFactor": 0.0,
                "roughnessFactor": 1.0,
            },
        }]);
    }

    document["scenes"][0]["nodes"] = json!([0]);
    document["nodes"] = json!([{ "mesh": 0 }]);
    document["meshes"] = json!([{ "primitives": [primitive] }]);
    document["accessors"] = Value::Array(std::mem::take(&mut builder.accessors));
    document["bufferViews"] = Value::Array(std::mem::take(&mut builder.views));
    document["buffers"] = json!([{ "byteLength": builder.bin.len() }]);
    document
}

fn write_chunk<W: Write>(w: &mut W, kind: u32, data: &[u8], pad: u8) -> Result<()> {
    let padded = (data.len() + 3) & !3;
    w.write_u32::<LittleEndian>(padded as u32)?;
    w.write_u32::<LittleEndian>(kind)?;
    w.write_all(data)?;
    for _ in data.len()..padded {
        w.write_u8(pad)?;
    }
    Ok(())
}

/// Writes a self-contained GLB with geometry, normals, vertex colors and material.
pub fn write_glb<W: Write>(w: &mut W, mesh: &Mesh) -> Result<()> {
    // glTF only colors vertices, so face colors need one vertex per face corner.
    let mesh = match mesh.colors() {
        Some(Colors::Face(_)) => Cow::Owned(mesh.unshared()),
        _ => Cow::Borrowed(mesh),
    };

    let mut builder = BinBuilder::new();
    let document = build_json(&mesh, &mut builder);
    let json_bytes = serde_json::to_vec(&document)?;

    let chunk_len = |n: usize| 8 + ((n + 3) & !3);
    let bin_len = if builder.bin.is_empty() {
        0
    } else {
        chunk_len(builder.bin.len())
    };
    let total = 12 + chunk_len(json_bytes.len()) + bin_len;

    w.write_u32::<LittleEndian>(MAGIC)?;
    w.write_u32::<LittleEndian>(VERSION)?;
    w.write_u32::<LittleEndian>(total as u32)?;
    write_chunk(w, CHUNK_JSON, &json_bytes, b' ')?;
    if !builder.bin.is_empty() {
        write_chunk(w, CHUNK_BIN, &builder.bin, 0)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    #[serde(default)]
    accessors: Vec<Accessor>,
    #[serde(default)]
    buffer_views: Vec<BufferView>,
    #[serde(default)]
    meshes: Vec<GltfMesh>,
    #[serde(default)]
    materials: Vec<GltfMaterial>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
    buffer_view: Option<usize>,
    #[serde(default)]
    byte_offset: usize,
    component_type: u32,
    count: usize,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    normalized: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    #[serde(default)]
    buffer: usize,
    #[serde(default)]
    byte_offset: usize,
    byte_length: usize,
    byte_stride: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct GltfMesh {
    primitives: Vec<Primitive>,
}

fn default_mode() -> u32 {
    MODE_TRIANGLES
}

#[derive(Debug, Deserialize)]
struct Primitive {
    attributes: HashMap<String, usize>,
    indices: Option<usize>,
    #[serde(default = "default_mode")]
    mode: u32,
    material: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GltfMaterial {
    name: Option<String>,
    pbr_metallic_roughness: Option<Pbr>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pbr {
    base_color_factor: Option<[f32; 4]>,
}

fn components(kind: &str) -> Result<usize> {
    Ok(match kind {
        "SCALAR" => 1,
        "VEC2" => 2,
        "VEC3" => 3,
        "VEC4" => 4,
        other => return Err(malformed(format!("unsupported accessor type `{other}`"))),
    })
}

fn component_size(component_type: u32) -> Result<usize> {
    Ok(match component_type {
        BYTE | UNSIGNED_BYTE => 1,
        SHORT | UNSIGNED_SHORT => 2,
        UNSIGNED_INT | FLOAT => 4,
        other => return Err(malformed(format!("unsupported component type {other}"))),
    })
}

/// Reads an accessor into rows of `f64` components, applying normalization.
fn read_accessor(doc: &Document, bin: &[u8], index: usize) -> Result<Vec<Vec<f64>>> {
    let accessor = doc
        .accessors
        .get(index)
        .ok_or_else(|| malformed(format!("accessor {index} does not exist")))?;
    let n = components(&accessor.kind)?;
    let size = component_size(accessor.component_type)?;
    let row_len = n * size;
    let Some(view_index) = accessor.buffer_view else {
        // Accessors without a view are defined to be all zeros.
        if accessor.count > MAX_ZERO_FILLED {
            return Err(malformed(format!(
                "accessor {index} has no buffer view but {} elements",
                accessor.count
            )));
        }
        return Ok(vec![vec![0.0; n]; accessor.count]);
    };
    let view = doc
        .buffer_views
        .get(view_index)
        .ok_or_else(|| malformed(format!("buffer view {view_index} does not exist")))?;
    if view.buffer != 0 {
        return Err(malformed("only the embedded BIN buffer is supported"));
    }
    let stride = view.byte_stride.unwrap_or(row_len);
    if stride < row_len {
        return Err(malformed(format!(
            "buffer view {view_index} stride {stride} is shorter than an element"
        )));
    }
    let view_end = view
        .byte_offset
        .checked_add(view.byte_length)
        .filter(|&end| end <= bin.len())
        .ok_or_else(|| malformed(format!("buffer view {view_index} exceeds the BIN chunk")))?;

    // The last element must end inside the view before any row is allocated.
    let overrun = || malformed(format!("accessor {index} overruns its buffer view"));
    if accessor.count > 0 {
        let last_end = (accessor.count - 1)
            .checked_mul(stride)
            .and_then(|v| v.checked_add(accessor.byte_offset))
            .and_then(|v| v.checked_add(row_len))
            .ok_or_else(overrun)?;
        if last_end > view.byte_length {
            return Err(overrun());
        }
    }

    let mut rows = Vec::with_capacity(accessor.count);
    for i in 0..accessor.count {
        let start = view.byte_offset + accessor.byte_offset + i * stride;
        let mut c = Cursor::new(&bin[start..start + row_len]);
        let mut row = Vec::with_capacity(n);
        for _ in 0..n {
            let v = match accessor.component_type {
                BYTE => {
                    let v = f64::from(c.read_i8()?);
                    if accessor.normalized {
                        (v / 127.0).max(-1.0)
                    } else {
                        v
                    }
                }
                UNSIGNED_BYTE => {
                    let v = f64::from(c.read_u8()?);
                    if accessor.normalized {
                        v / 255.0
                    } else {
                        v
                    }
                }
                SHORT => {
                    let v = f64::from(c.read_i16::<LittleEndian>()?);
                    if accessor.normalized {
                        (v / 32767.0).max(-1.0)
                    } else {
                        v
                    }
                }
                UNSIGNED_SHORT => {
                    let v = f64::from(c.read_u16::<LittleEndian>()?);
                    if accessor.normalized {
                        v / 65535.0
                    } else {
                        v
                    }
                }
                UNSIGNED_INT => f64::from(c.read_u32::<LittleEndian>()?),
                _ => f64::from(c.read_f32::<LittleEndian>()?),
            };
            row.push(v);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn to_vectors(rows: Vec<Vec<f64>>) -> Vec<Vector3> {
    rows.into_iter()
        .map(|r| vec3(r[0] as f32, r[1] as f32, r[2] as f32))
        .collect()
}

fn to_colors(rows: Vec<Vec<f64>>) -> Vec<Rgba> {
    let channel = |v: f64| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    rows.into_iter()
        .map(|r| {
            let alpha = r.get(3).copied().map_or(255, channel);
            [channel(r[0]), channel(r[1]), channel(r[2]), alpha]
        })
        .collect()
}

struct Chunks<'a> {
    json: &'a [u8],
    bin: &'a [u8],
}

fn split_chunks(data: &[u8]) -> Result<Chunks<'_>> {
    let mut c = Cursor::new(data);
    if c.read_u32::<LittleEndian>()? != MAGIC {
        return Err(malformed("missing glTF magic"));
    }
    let version = c.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(malformed(format!("unsupported glTF version {version}")));
    }
    let total = (c.read_u32::<LittleEndian>()? as usize).min(data.len());

    let mut json = None;
    let mut bin: &[u8] = &[];
    let mut offset = 12;
    while offset + 8 <= total {
        let mut header = Cursor::new(&data[offset..offset + 8]);
        let len = header.read_u32::<LittleEndian>()? as usize;
        let kind = header.read_u32::<LittleEndian>()?;
        let start = offset + 8;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= total)
            .ok_or_else(|| malformed("chunk extends past end of file"))?;
        match kind {
            CHUNK_JSON => json = Some(&data[start..end]),
            CHUNK_BIN => bin = &data[start..end],
            _ => {}
        }
        offset = end;
    }
    Ok(Chunks {
        json: json.ok_or_else(|| malformed("missing JSON chunk"))?,
        bin,
    })
}

/// Reads every triangle primitive of every mesh into a single mesh.
///
/// Node transforms are not applied. Normals and colors are kept only when every primitive
/// provides them.
pub fn parse_glb(data: &[u8]) -> Result<Mesh> {
    let chunks = split_chunks(data)?;
    let doc: Document = serde_json::from_slice(chunks.json)?;

    let mut positions: Vec<Vector3> = Vec::new();
    let mut normals: Option<Vec<Vector3>> = Some(Vec::new());
    let mut colors: Option<Vec<Rgba>> = Some(Vec::new());
    let mut faces: Vec<Face> = Vec::new();
    let mut material: Option<Material> = None;

    for primitive in doc.meshes.iter().flat_map(|m| &m.primitives) {
        if primitive.mode != MODE_TRIANGLES {
            log::warn!("skipping glTF primitive with mode {}", primitive.mode);
            continue;
        }
        let position = *primitive
            .attributes
            .get("POSITION")
            .ok_or_else(|| malformed("primitive without POSITION"))?;
        let points = to_vectors(read_accessor(&doc, chunks.bin, position)?);
        let base = u32::try_from(positions.len())
            .map_err(|_| malformed("too many vertices for 32-bit indices"))?;
        let count = points.len();
        positions.extend(points);

        normals = match (normals, primitive.attributes.get("NORMAL")) {
            (Some(mut acc), Some(&i)) => {
                acc.extend(to_vectors(read_accessor(&doc, chunks.bin, i)?));
                Some(acc)
            }
            _ => None,
        };
        colors = match (colors, primitive.attributes.get("COLOR_0")) {
            (Some(mut acc), Some(&i)) => {
                acc.extend(to_colors(read_accessor(&doc, chunks.bin, i)?));
                Some(acc)
            }
            _ => None,
        };

        let indices: Vec<u32> = match primitive.indices {
            Some(i) => read_accessor(&doc, chunks.bin, i)?
                .into_iter()
                .map(|r| r[0] as u32)
                .collect(),
            None => (0..count as u32).collect(),
        };
        if indices.len() % 3 != 0 {
            return Err(malformed(format!("{} indices do not form triangles", indices.len())));
        }
        let offset = |i: u32| {
            base.checked_add(i)
                .ok_or_else(|| malformed(format!("index {i} is out of range")))
        };
        for t in indices.chunks_exact(3) {
            faces.push(Face::new(offset(t[0])?, offset(t[1])?, offset(t[2])?));
        }

        if material.is_none() {
            if let Some(m) = primitive.material.and_then(|i| doc.materials.get(i)) {
                material = Some(Material {
                    name: m.name.clone().unwrap_or_else(|| "material".to_string()),
                    base_color: m
                        .pbr_metallic_roughness
                        .as_ref()
                        .and_then(|p| p.base_color_factor)
                        .unwrap_or([1.0; 4]),
                });
            }
        }
    }

    let mut mesh = Mesh::new(positions, faces)?;
    if let Some(n) = normals.filter(|n| !n.is_empty()) {
        mesh = mesh.with_normals(n)?;
    }
    if let Some(c) = colors.filter(|c| !c.is_empty()) {
        mesh = mesh.with_colors(Colors::Vertex(c))?;
    }
    if let Some(m) = material {
        mesh = mesh.with_material(m);
    }
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Mesh {
        Mesh::new(
            vec![vec3(0.0, 0.0, 0.0), vec3(1.0, 0.0, 0.0), vec3(0.0, 1.0, 0.0)],
            vec![Face::new(0, 1, 2)],
        )
        .unwrap()
    }

    #[test]
    fn header_and_alignment() {
        let mut out = Vec::new();
        write_glb(&mut out, &triangle()).unwrap();
        assert_eq!(&out[0..4], b"glTF");
        let total = u32::from_le_bytes([out[8], out[9], out[10], out[11]]) as usize;
        assert_eq!(total, out.len());
        assert_eq!(out.len() % 4, 0);

        let json_len = u32::from_le_bytes([out[12], out[13], out[14], out[15]]) as usize;
        let doc: Value = serde_json::from_slice(&out[20..20 + json_len]).unwrap();
        assert_eq!(doc["asset"]["version"], "2.0");
        assert_eq!(doc["accessors"][0]["max"], json!([1.0, 1.0, 0.0]));
    }

    #[test]
    fn round_trip_with_material_and_colors() {
        let mesh = triangle()
            .with_colors(Colors::Vertex(vec![[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 128]]))
            .unwrap()
            .with_material(Material {
                name: "clay".into(),
                base_color: [0.8, 0.5, 0.3, 1.0],
            });
        let mut out = Vec::new();
        write_glb(&mut out, &mesh).unwrap();
        let back = parse_glb(&out).unwrap();
        assert_eq!(back.positions(), mesh.positions());
        assert_eq!(back.faces(), mesh.faces());
        assert_eq!(back.colors(), mesh.colors());
        assert_eq!(back.material(), mesh.material());
    }

    #[test]
    fn face_colors_are_unshared() {
        let mesh = triangle()
            .with_colors(Colors::Face(vec![[10, 20, 30, 255]]))
            .unwrap();
        let mut out = Vec::new();
        write_glb(&mut out, &mesh).unwrap();
        let back = parse_glb(&out).unwrap();
        assert_eq!(back.colors(), Some(&Colors::Vertex(vec![[10, 20, 30, 255]; 3])));
    }

    #[test]
    fn empty_mesh_has_no_bin_chunk() {
        let mut out = Vec::new();
        write_glb(&mut out, &Mesh::default()).unwrap();
        let back = parse_glb(&out).unwrap();
        assert!(back.is_empty());
    }

    // A GLB around a hand written document and BIN chunk.
    fn raw_glb(doc: Value, bin: &[u8]) -> Vec<u8> {
        let mut chunks = Vec::new();
        write_chunk(&mut chunks, CHUNK_JSON, &serde_json::to_vec(&doc).unwrap(), b' ').unwrap();
        if !bin.is_empty() {
            write_chunk(&mut chunks, CHUNK_BIN, bin, 0).unwrap();
        }
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MAGIC).unwrap();
        out.write_u32::<LittleEndian>(VERSION).unwrap();
        out.write_u32::<LittleEndian>(12 + chunks.len() as u32).unwrap();
        out.extend(chunks);
        out
    }

    fn single_accessor(accessor: Value, views: Value) -> Value {
        json!({
            "asset": { "version": "2.0" },
            "accessors": [accessor],
            "bufferViews": views,
            "meshes": [ { "primitives": [ { "attributes": { "POSITION": 0 } } ] } ],
        })
    }

    fn assert_malformed(data: &[u8]) {
        assert!(matches!(
            parse_glb(data),
            Err(CodecError::Malformed { format: Format::Glb, .. })
        ));
    }

    #[test]
    fn huge_accessor_without_view_is_rejected() {
        let doc = single_accessor(
            json!({ "componentType": FLOAT, "count": 1_000_000_000_000_000u64, "type": "VEC3" }),
            json!([]),
        );
        assert_malformed(&raw_glb(doc, &[]));
    }

    #[test]
    fn accessor_count_must_fit_its_view() {
        let doc = single_accessor(
            json!({ "bufferView": 0, "componentType": FLOAT, "count": u64::MAX, "type": "VEC3" }),
            json!([ { "buffer": 0, "byteLength": 36 } ]),
        );
        assert_malformed(&raw_glb(doc, &[0u8; 36]));
    }

    #[test]
    fn view_offset_overflow_is_rejected() {
        let doc = single_accessor(
            json!({ "bufferView": 0, "componentType": FLOAT, "count": 3, "type": "VEC3" }),
            json!([ { "buffer": 0, "byteOffset": u64::MAX, "byteLength": 36 } ]),
        );
        assert_malformed(&raw_glb(doc, &[0u8; 36]));
    }

    #[test]
    fn zero_stride_is_rejected() {
        let doc = single_accessor(
            json!({ "bufferView": 0, "componentType": FLOAT, "count": 1_000_000, "type": "VEC3" }),
            json!([ { "buffer": 0, "byteLength": 12, "byteStride": 0 } ]),
        );
        assert_malformed(&raw_glb(doc, &[0u8; 12]));
    }

    #[test]
    fn hand_written_document_parses() {
        let mut bin = Vec::new();
        for p in [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] {
            for f in p {
                bin.extend_from_slice(&f.to_le_bytes());
            }
        }
        let doc = single_accessor(
            json!({ "bufferView": 0, "componentType": FLOAT, "count": 3, "type": "VEC3" }),
            json!([ { "buffer": 0, "byteLength": 36 } ]),
        );
        let mesh = parse_glb(&raw_glb(doc, &bin)).unwrap();
        assert_eq!(mesh.positions(), triangle().positions());
        assert_eq!(mesh.faces(), triangle().faces());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_glb(b"not a glb file at all"),
            Err(CodecError::Malformed { format: Format::Glb, .. })
        ));
    }
}
