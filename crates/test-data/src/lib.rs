//! Fixtures shared by the kiln test suites.
//!
//! Models and volumes are generated rather than checked in so every crate can build the
//! exact input a test needs.

use std::io::Write;

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_mesh::{vec3, Face, Mesh};

pub struct TestModel {
    pub mesh: Mesh,
    pub model_height: f32,
}

// Corner `n` of the unit cube sits at (n & 1, (n >> 1) & 1, (n >> 2) & 1). Each face is
// listed counter-clockwise as seen from outside.
const CUBE_QUADS: [[u32; 4]; 6] = [
    [0, 4, 6, 2],
    [1, 3, 7, 5],
    [0, 1, 5, 4],
    [2, 6, 7, 3],
    [0, 2, 3, 1],
    [4, 5, 7, 6],
];

/// Axis aligned cube from 0 to `size` with outward facing counter-clockwise faces.
pub fn cube(size: f32) -> TestModel {
    let positions = (0..8u32)
        .map(|n| {
            vec3(
                (n & 1) as f32 * size,
                ((n >> 1) & 1) as f32 * size,
                ((n >> 2) & 1) as f32 * size,
            )
        })
        .collect();
    let faces = CUBE_QUADS
        .iter()
        .flat_map(|&[a, b, c, d]| [Face::new(a, b, c), Face::new(a, c, d)])
        .collect();
    TestModel {
        mesh: Mesh::new(positions, faces).expect("cube indices are in range"),
        model_height: size,
    }
}

/// A 20mm cube, the same shape as the calibration prints.
pub fn calibration_cube() -> TestModel {
    cube(20.0)
}

/// Dense scalar volume in x-fastest order, matching the layout of `kiln_surface::ScalarField`.
pub struct Volume {
    pub dims: [usize; 3],
    pub spacing: [f32; 3],
    pub values: Vec<f32>,
}

impl Volume {
    pub fn from_fn(
        dims: [usize; 3],
        spacing: [f32; 3],
        f: impl Fn(usize, usize, usize) -> f32,
    ) -> Self {
        let mut values = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    values.push(f(i, j, k));
                }
            }
        }
        Self {
            dims,
            spacing,
            values,
        }
    }
}

/// A cube of `n` samples per side whose intensity falls linearly from 1 at the centre to
/// 0 at the corners.
///
/// Values are already normalized, and the isosurface at threshold `t` is a sphere of
/// radius [`sphere_radius`]`(n, spacing, t)`. `n` should be odd so the centre is a sample.
pub fn sphere(n: usize, spacing: f32) -> Volume {
    let c = (n - 1) as f32 / 2.0;
    let max_distance = (3.0f32).sqrt() * c * spacing;
    Volume::from_fn([n; 3], [spacing; 3], |i, j, k| {
        let d = vec3(i as f32 - c, j as f32 - c, k as f32 - c) * spacing;
        1.0 - (d.x * d.x + d.y * d.y + d.z * d.z).sqrt() / max_distance
    })
}

pub fn sphere_radius(n: usize, spacing: f32, threshold: f32) -> f32 {
    let c = (n - 1) as f32 / 2.0;
    (1.0 - threshold) * (3.0f32).sqrt() * c * spacing
}

/// Storage types understood by the NIfTI-1 writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NiftiType {
    U8,
    I16,
    F32,
    F64,
}

impl NiftiType {
    fn code(self) -> i16 {
        match self {
            NiftiType::U8 => 2,
            NiftiType::I16 => 4,
            NiftiType::F32 => 16,
            NiftiType::F64 => 64,
        }
    }

    fn bits(self) -> i16 {
        match self {
            NiftiType::U8 => 8,
            NiftiType::I16 => 16,
            NiftiType::F32 => 32,
            NiftiType::F64 => 64,
        }
    }
}

/// Builds single-file NIfTI-1 images (`n+1`).
#[derive(Debug, Clone)]
pub struct NiftiBuilder {
    pub datatype: NiftiType,
    pub big_endian: bool,
    pub scl_slope: f32,
    pub scl_inter: f32,
    /// Number of volumes along the fourth dimension; every volume repeats the data.
    pub volumes: usize,
}

impl Default for NiftiBuilder {
    fn default() -> Self {
        Self {
            datatype: NiftiType::F32,
            big_endian: false,
            scl_slope: 0.0,
            scl_inter: 0.0,
            volumes: 1,
        }
    }
}

impl NiftiBuilder {
    pub fn build(&self, volume: &Volume) -> Vec<u8> {
        if self.big_endian {
            self.write::<BigEndian>(volume)
        } else {
            self.write::<LittleEndian>(volume)
        }
    }

    pub fn build_gz(&self, volume: &Volume) -> Vec<u8> {
        gzip(&self.build(volume))
    }

    fn write<E: ByteOrder>(&self, volume: &Volume) -> Vec<u8> {
        let mut header = vec![0u8; 348];
        E::write_i32(&mut header[0..4], 348);

        let ndim: i16 = if self.volumes > 1 { 4 } else { 3 };
        let mut dim = [1i16; 8];
        dim[0] = ndim;
        for axis in 0..3 {
            dim[axis + 1] = volume.dims[axis] as i16;
        }
        dim[4] = self.volumes as i16;
        for (n, d) in dim.iter().enumerate() {
            E::write_i16(&mut header[40 + 2 * n..42 + 2 * n], *d);
        }
        E::write_i16(&mut header[70..72], self.datatype.code());
        E::write_i16(&mut header[72..74], self.datatype.bits());

        let mut pixdim = [1.0f32; 8];
        pixdim[1..4].copy_from_slice(&volume.spacing);
        for (n, p) in pixdim.iter().enumerate() {
            E::write_f32(&mut header[76 + 4 * n..80 + 4 * n], *p);
        }
        E::write_f32(&mut header[108..112], 352.0);
        E::write_f32(&mut header[112..116], self.scl_slope);
        E::write_f32(&mut header[116..120], self.scl_inter);
        header[344..348].copy_from_slice(b"n+1\0");

        let mut out = header;
        // Empty extension block.
        out.extend_from_slice(&[0; 4]);
        for _ in 0..self.volumes {
            for &v in &volume.values {
                let written = match self.datatype {
                    NiftiType::U8 => out.write_u8(v.round() as u8),
                    NiftiType::I16 => out.write_i16::<E>(v.round() as i16),
                    NiftiType::F32 => out.write_f32::<E>(v),
                    NiftiType::F64 => out.write_f64::<E>(f64::from(v)),
                };
                written.expect("writing to a Vec cannot fail");
            }
        }
        out
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("writing to a Vec cannot fail");
    encoder.finish().expect("writing to a Vec cannot fail")
}
