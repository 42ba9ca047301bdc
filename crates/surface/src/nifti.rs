//! NIfTI-1 single file images (`.nii`, `.nii.gz`).

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use flate2::read::GzDecoder;

use crate::error::{Result, SurfaceError};
use crate::field::ScalarField;

const HEADER_LEN: usize = 348;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn invalid(reason: impl Into<String>) -> SurfaceError {
    SurfaceError::InvalidNifti(reason.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Datatype {
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Datatype {
    fn from_code(code: i16) -> Result<Self> {
        Ok(match code {
            2 => Datatype::U8,
            4 => Datatype::I16,
            8 => Datatype::I32,
            16 => Datatype::F32,
            64 => Datatype::F64,
            256 => Datatype::I8,
            512 => Datatype::U16,
            768 => Datatype::U32,
            other => return Err(invalid(format!("unsupported datatype {other}"))),
        })
    }

    fn size(self) -> usize {
        match self {
            Datatype::U8 | Datatype::I8 => 1,
            Datatype::I16 | Datatype::U16 => 2,
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::F64 => 8,
        }
    }
}

/// The parts of the header needed to read the voxels.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub dims: [usize; 3],
    pub volumes: usize,
    pub spacing: [f32; 3],
    pub vox_offset: usize,
    pub scl_slope: f32,
    pub scl_inter: f32,
    datatype: Datatype,
}

fn parse_header<E: ByteOrder>(h: &[u8]) -> Result<NiftiHeader> {
    let dim: Vec<i16> = (0..8).map(|n| E::read_i16(&h[40 + 2 * n..])).collect();
    let ndim = dim[0];
    if !(1..=7).contains(&ndim) {
        return Err(invalid(format!("dim[0] = {ndim} is out of range")));
    }
    // Axes beyond ndim are singleton.
    let extent = |axis: usize| -> Result<usize> {
        if axis > ndim as usize {
            return Ok(1);
        }
        match dim[axis] {
            d if d > 0 => Ok(d as usize),
            d => Err(invalid(format!("dim[{axis}] = {d}"))),
        }
    };
    let dims = [extent(1)?, extent(2)?, extent(3)?];
    let volumes = (4..=7).map(extent).product::<Result<usize>>()?;

    let datatype = Datatype::from_code(E::read_i16(&h[70..]))?;
    let pixdim = |axis: usize| {
        let p = E::read_f32(&h[76 + 4 * axis..]).abs();
        if p.is_finite() && p > 0.0 {
            p
        } else {
            1.0
        }
    };
    let vox_offset = E::read_f32(&h[108..]);
    if !(vox_offset.is_finite() && vox_offset >= 0.0) {
        return Err(invalid(format!("vox_offset {vox_offset}")));
    }

    match &h[344..348] {
        b"n+1\0" => {}
        b"ni1\0" => return Err(invalid("two-file (.hdr/.img) images are not supported")),
        magic => log::warn!("unexpected NIfTI magic {magic:?}, reading anyway"),
    }

    Ok(NiftiHeader {
        dims,
        volumes,
        spacing: [pixdim(1), pixdim(2), pixdim(3)],
        // Single file images never place voxels inside the header.
        vox_offset: (vox_offset as usize).max(HEADER_LEN),
        scl_slope: E::read_f32(&h[112..]),
        scl_inter: E::read_f32(&h[116..]),
        datatype,
    })
}

fn read_voxels<E: ByteOrder>(header: &NiftiHeader, data: &[u8]) -> Result<Vec<f32>> {
    let count = header.dims.iter().product::<usize>();
    let needed = count * header.datatype.size();
    let body = data
        .get(header.vox_offset..header.vox_offset + needed)
        .ok_or_else(|| {
            invalid(format!(
                "expected {needed} bytes of voxel data after offset {}, file has {}",
                header.vox_offset,
                data.len()
            ))
        })?;

    let mut c = Cursor::new(body);
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match header.datatype {
            Datatype::U8 => f64::from(c.read_u8()?),
            Datatype::I8 => f64::from(c.read_i8()?),
            Datatype::I16 => f64::from(c.read_i16::<E>()?),
            Datatype::U16 => f64::from(c.read_u16::<E>()?),
            Datatype::I32 => f64::from(c.read_i32::<E>()?),
            Datatype::U32 => f64::from(c.read_u32::<E>()?),
            Datatype::F32 => f64::from(c.read_f32::<E>()?),
            Datatype::F64 => c.read_f64::<E>()?,
        };
        values.push(v);
    }

    let slope = f64::from(header.scl_slope);
    if slope != 0.0 && slope.is_finite() {
        let inter = f64::from(header.scl_inter);
        let inter = if inter.is_finite() { inter } else { 0.0 };
        for v in &mut values {
            *v = *v * slope + inter;
        }
    }
    Ok(values.into_iter().map(|v| v as f32).collect())
}

/// Inflates gzip input; anything else is returned as is.
fn decompress(data: &[u8]) -> Result<std::borrow::Cow<'_, [u8]>> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data.into());
    }
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| invalid(format!("gzip: {e}")))?;
    Ok(out.into())
}

/// Reads the header of a raw or gzip compressed image.
pub fn read_header(data: &[u8]) -> Result<NiftiHeader> {
    let data = decompress(data)?;
    let (header, _) = header_and_order(&data)?;
    Ok(header)
}

fn header_and_order(data: &[u8]) -> Result<(NiftiHeader, bool)> {
    if data.len() < HEADER_LEN {
        return Err(invalid(format!("{} bytes is shorter than the header", data.len())));
    }
    let h = &data[..HEADER_LEN];
    if LittleEndian::read_i32(h) == HEADER_LEN as i32 {
        Ok((parse_header::<LittleEndian>(h)?, false))
    } else if BigEndian::read_i32(h) == HEADER_LEN as i32 {
        Ok((parse_header::<BigEndian>(h)?, true))
    } else {
        Err(invalid("sizeof_hdr is not 348"))
    }
}

/// Decodes a `.nii` or `.nii.gz` image into a scalar field.
///
/// Scaling (`scl_slope`, `scl_inter`) is applied when the slope is non-zero. Only the first
/// volume of a 4-D series is kept.
pub fn decode(data: &[u8]) -> Result<ScalarField> {
    let data = decompress(data)?;
    let (header, big_endian) = header_and_order(&data)?;
    if header.volumes > 1 {
        log::debug!("NIfTI image has {} volumes, using the first", header.volumes);
    }
    let values = if big_endian {
        read_voxels::<BigEndian>(&header, &data)?
    } else {
        read_voxels::<LittleEndian>(&header, &data)?
    };
    log::debug!(
        "decoded NIfTI {:?} grid with spacing {:?}",
        header.dims,
        header.spacing
    );
    ScalarField::new(header.dims, header.spacing, values)
        .map_err(|e| invalid(e.to_string()))
}
