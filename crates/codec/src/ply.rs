//! Stanford PLY.
//!
//! Files are written as `binary_little_endian 1.0`. Reading accepts the ASCII and both binary
//! encodings, any element order, and polygons of any size (fan-triangulated).

use std::io::{Cursor, Write};
use std::marker::PhantomData;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use kiln_mesh::{vec3, Colors, Face, Mesh, Rgba, Vector3};

use crate::error::{CodecError, Result};
use crate::Format;

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::malformed(Format::Ply, reason)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Encoding {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "char" | "int8" => Scalar::I8,
            "uchar" | "uint8" => Scalar::U8,
            "short" | "int16" => Scalar::I16,
            "ushort" | "uint16" => Scalar::U16,
            "int" | "int32" => Scalar::I32,
            "uint" | "uint32" => Scalar::U32,
            "float" | "float32" => Scalar::F32,
            "double" | "float64" => Scalar::F64,
            other => return Err(malformed(format!("unknown property type `{other}`"))),
        })
    }

    fn is_float(self) -> bool {
        matches!(self, Scalar::F32 | Scalar::F64)
    }
}

#[derive(Debug)]
enum Property {
    Scalar { name: String, kind: Scalar },
    List { name: String, count: Scalar, item: Scalar },
}

#[derive(Debug)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
}

struct Header {
    encoding: Encoding,
    elements: Vec<Element>,
    body_offset: usize,
}

fn parse_header(data: &[u8]) -> Result<Header> {
    const END: &[u8] = b"end_header";
    let end = data
        .windows(END.len())
        .position(|w| w == END)
        .ok_or_else(|| malformed("missing end_header"))?;
    // The body starts after the newline that terminates `end_header` (LF or CRLF).
    let mut body_offset = end + END.len();
    if data.get(body_offset) == Some(&b'\r') {
        body_offset += 1;
    }
    if data.get(body_offset) == Some(&b'\n') {
        body_offset += 1;
    }

    let text = std::str::from_utf8(&data[..end]).map_err(|e| malformed(e.to_string()))?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("ply") {
        return Err(malformed("missing `ply` magic"));
    }

    let mut encoding = None;
    let mut elements: Vec<Element> = Vec::new();
    for line in lines {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["format", enc, _version] => {
                encoding = Some(match *enc {
                    "ascii" => Encoding::Ascii,
                    "binary_little_endian" => Encoding::BinaryLittleEndian,
                    "binary_big_endian" => Encoding::BinaryBigEndian,
                    other => return Err(malformed(format!("unknown encoding `{other}`"))),
                })
            }
            ["comment", ..] | ["obj_info", ..] => {}
            ["element", name, count] => elements.push(Element {
                name: name.to_string(),
                count: count
                    .parse()
                    .map_err(|_| malformed(format!("bad element count `{count}`")))?,
                properties: Vec::new(),
            }),
            ["property", "list", count, item, name] => elements
                .last_mut()
                .ok_or_else(|| malformed("property before element"))?
                .properties
                .push(Property::List {
                    name: name.to_string(),
                    count: Scalar::parse(count)?,
                    item: Scalar::parse(item)?,
                }),
            ["property", kind, name] => elements
                .last_mut()
                .ok_or_else(|| malformed("property before element"))?
                .properties
                .push(Property::Scalar {
                    name: name.to_string(),
                    kind: Scalar::parse(kind)?,
                }),
            _ => return Err(malformed(format!("unexpected header line `{line}`"))),
        }
    }

    // Every record has to consume part of the body, or a huge count would never run out.
    if let Some(e) = elements.iter().find(|e| e.count > 0 && e.properties.is_empty()) {
        return Err(malformed(format!(
            "element `{}` has {} records but no properties",
            e.name, e.count
        )));
    }

    Ok(Header {
        encoding: encoding.ok_or_else(|| malformed("missing format line"))?,
        elements,
        body_offset,
    })
}

trait ValueReader {
    fn read(&mut self, kind: Scalar) -> Result<f64>;
}

struct AsciiValues<'a> {
    tokens: std::str::SplitAsciiWhitespace<'a>,
}

impl ValueReader for AsciiValues<'_> {
    fn read(&mut self, _kind: Scalar) -> Result<f64> {
        let token = self
            .tokens
            .next()
            .ok_or_else(|| malformed("unexpected end of ascii body"))?;
        token
            .parse()
            .map_err(|_| malformed(format!("bad number `{token}`")))
    }
}

struct BinaryValues<'a, E> {
    cursor: Cursor<&'a [u8]>,
    _order: PhantomData<E>,
}

impl<E: ByteOrder> ValueReader for BinaryValues<'_, E> {
    fn read(&mut self, kind: Scalar) -> Result<f64> {
        let c = &mut self.cursor;
        let value = match kind {
            Scalar::I8 => c.read_i8().map(f64::from),
            Scalar::U8 => c.read_u8().map(f64::from),
            Scalar::I16 => c.read_i16::<E>().map(f64::from),
            Scalar::U16 => c.read_u16::<E>().map(f64::from),
            Scalar::I32 => c.read_i32::<E>().map(f64::from),
            Scalar::U32 => c.read_u32::<E>().map(f64::from),
            Scalar::F32 => c.read_f32::<E>().map(f64::from),
            Scalar::F64 => c.read_f64::<E>(),
        };
        value.map_err(|_| malformed("unexpected end of binary body"))
    }
}

fn color_channel(value: f64, kind: Scalar) -> u8 {
    if kind.is_float() {
        (value * 255.0).round().clamp(0.0, 255.0) as u8
    } else {
        value.clamp(0.0, 255.0) as u8
    }
}

const CHANNELS: [&str; 4] = ["red", "green", "blue", "alpha"];

#[derive(Default)]
struct Body {
    positions: Vec<Vector3>,
    normals: Vec<Vector3>,
    vertex_colors: Vec<Rgba>,
    faces: Vec<Face>,
    face_colors: Vec<Rgba>,
}

fn read_body<R: ValueReader>(header: &Header, values: &mut R) -> Result<Body> {
    let mut body = Body::default();
    for element in &header.elements {
        let has = |name: &str| {
            element
                .properties
                .iter()
                .any(|p| matches!(p, Property::Scalar { name: n, .. } if n == name))
        };
        let has_normals = has("nx") && has("ny") && has("nz");
        let has_colors = has("red") && has("green") && has("blue");

        for _ in 0..element.count {
            let mut xyz = [0.0f32; 3];
            let mut normal = [0.0f32; 3];
            let mut color: Rgba = [0, 0, 0, 255];
            let mut polygon: Vec<u32> = Vec::new();

            for property in &element.properties {
                match property {
                    Property::Scalar { name, kind } => {
                        let v = values.read(*kind)?;
                        match name.as_str() {
                            "x" => xyz[0] = v as f32,
                            "y" => xyz[1] = v as f32,
                            "z" => xyz[2] = v as f32,
                            "nx" => normal[0] = v as f32,
                            "ny" => normal[1] = v as f32,
                            "nz" => normal[2] = v as f32,
                            n => {
                                if let Some(channel) = CHANNELS.iter().position(|c| *c == n) {
                                    color[channel] = color_channel(v, *kind);
                                }
                            }
                        }
                    }
                    Property::List { name, count, item } => {
                        let len = values.read(*count)? as usize;
                        let keep = name == "vertex_indices" || name == "vertex_index";
                        for _ in 0..len {
                            let index = values.read(*item)?;
                            if keep {
                                if index < 0.0 {
                                    return Err(malformed(format!("negative vertex index {index}")));
                                }
                                polygon.push(index as u32);
                            }
                        }
                    }
                }
            }

            match element.name.as_str() {
                "vertex" => {
                    body.positions.push(vec3(xyz[0], xyz[1], xyz[2]));
                    if has_normals {
                        body.normals.push(vec3(normal[0], normal[1], normal[2]));
                    }
                    if has_colors {
                        body.vertex_colors.push(color);
                    }
                }
                "face" => {
                    if polygon.len() < 3 {
                        return Err(malformed(format!("face with {} vertices", polygon.len())));
                    }
                    for i in 1..polygon.len() - 1 {
                        body.faces.push(Face::new(polygon[0], polygon[i], polygon[i + 1]));
                        if has_colors {
                            body.face_colors.push(color);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(body)
}

pub fn parse_ply(data: &[u8]) -> Result<Mesh> {
    let header = parse_header(data)?;
    let payload = &data[header.body_offset..];
    let body = match header.encoding {
        Encoding::Ascii => {
            let text = std::str::from_utf8(payload).map_err(|e| malformed(e.to_string()))?;
            read_body(
                &header,
                &mut AsciiValues {
                    tokens: text.split_ascii_whitespace(),
                },
            )?
        }
        Encoding::BinaryLittleEndian => read_body(
            &header,
            &mut BinaryValues::<LittleEndian> {
                cursor: Cursor::new(payload),
                _order: PhantomData,
            },
        )?,
        Encoding::BinaryBigEndian => read_body(
            &header,
            &mut BinaryValues::<BigEndian> {
                cursor: Cursor::new(payload),
                _order: PhantomData,
            },
        )?,
    };

    let mut mesh = Mesh::new(body.positions, body.faces)?;
    if !body.normals.is_empty() {
        mesh = mesh.with_normals(body.normals)?;
    }
    if !body.vertex_colors.is_empty() {
        mesh = mesh.with_colors(Colors::Vertex(body.vertex_colors))?;
    } else if !body.face_colors.is_empty() {
        mesh = mesh.with_colors(Colors::Face(body.face_colors))?;
    }
    Ok(mesh)
}

/// Writes a `binary_little_endian` PLY file, keeping normals and colors when present.
pub fn write_ply<W: Write>(w: &mut W, mesh: &Mesh) -> Result<()> {
    let normals = mesh.normals();
    let (vertex_colors, face_colors) = match mesh.colors() {
        Some(Colors::Vertex(c)) => (Some(c.as_slice()), None),
        Some(Colors::Face(c)) => (None, Some(c.as_slice())),
        None => (None, None),
    };

    writeln!(w, "ply")?;
    writeln!(w, "format binary_little_endian 1.0")?;
    writeln!(w, "comment written by kiln")?;
    writeln!(w, "element vertex {}", mesh.vertex_count())?;
    for axis in ["x", "y", "z"] {
        writeln!(w, "property float {axis}")?;
    }
    if normals.is_some() {
        for axis in ["nx", "ny", "nz"] {
            writeln!(w, "property float {axis}")?;
        }
    }
    if vertex_colors.is_some() {
        for channel in CHANNELS {
            writeln!(w, "property uchar {channel}")?;
        }
    }
    writeln!(w, "element face {}", mesh.face_count())?;
    writeln!(w, "property list uchar int vertex_indices")?;
    if face_colors.is_some() {
        for channel in CHANNELS {
            writeln!(w, "property uchar {channel}")?;
        }
    }
    writeln!(w, "end_header")?;

    for (i, p) in mesh.positions().iter().enumerate() {
        let mut floats = vec![p.x, p.y, p.z];
        if let Some(n) = normals {
            floats.extend_from_slice(&[n[i].x, n[i].y, n[i].z]);
        }
        for f in floats {
            w.write_f32::<LittleEndian>(f)?;
        }
        if let Some(c) = vertex_colors {
            w.write_all(&c[i])?;
        }
    }
    for (i, face) in mesh.faces().iter().enumerate() {
        w.write_u8(3)?;
        for index in face.indices() {
            w.write_i32::<LittleEndian>(index as i32)?;
        }
        if let Some(c) = face_colors {
            w.write_all(&c[i])?;
        }
    }
    Ok(())
}
