use std::collections::HashMap;

use cgmath::InnerSpace;
use serde::Serialize;

use crate::mesh::{Colors, Mesh};

/// Axis-aligned bounds of a mesh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub size: [f32; 3],
}

/// Descriptive statistics for a mesh, as reported alongside exported payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshInfo {
    pub vertices: usize,
    pub faces: usize,
    /// Unique undirected edges.
    pub edges: usize,
    pub is_watertight: bool,
    pub is_winding_consistent: bool,
    pub is_empty: bool,
    pub bounding_box: Option<BoundingBox>,
    pub surface_area: f64,
    /// Signed enclosed volume; only defined for watertight meshes.
    pub volume: Option<f64>,
    pub center_mass: Option<[f64; 3]>,
    pub has_vertex_normals: bool,
    pub has_vertex_colors: bool,
    pub has_face_colors: bool,
    pub has_material: bool,
}

#[derive(Default)]
struct EdgeUse {
    // Uses in the low -> high index direction and the reverse.
    forward: u32,
    backward: u32,
}

impl EdgeUse {
    fn count(&self) -> u32 {
        self.forward + self.backward
    }
}

pub fn describe(mesh: &Mesh) -> MeshInfo {
    let mut edges: HashMap<(u32, u32), EdgeUse> = HashMap::new();
    for face in mesh.faces() {
        for (a, b) in face.edges() {
            let entry = edges.entry((a.min(b), a.max(b))).or_default();
            if a < b {
                entry.forward += 1;
            } else {
                entry.backward += 1;
            }
        }
    }

    // Every edge with two users must be walked once in each direction; an edge with more than
    // two users cannot be consistently wound at all.
    let is_winding_consistent = edges.values().all(|e| match e.count() {
        1 => true,
        2 => e.forward == 1 && e.backward == 1,
        _ => false,
    });
    let is_watertight =
        !mesh.is_empty() && is_winding_consistent && edges.values().all(|e| e.count() == 2);

    let surface_area = mesh.triangles().map(|t| f64::from(t.area())).sum();

    let (volume, center_mass) = if is_watertight {
        enclosed_volume(mesh)
    } else {
        (None, None)
    };

    let (has_vertex_colors, has_face_colors) = match mesh.colors() {
        Some(Colors::Vertex(_)) => (true, false),
        Some(Colors::Face(_)) => (false, true),
        None => (false, false),
    };

    MeshInfo {
        vertices: mesh.vertex_count(),
        faces: mesh.face_count(),
        edges: edges.len(),
        is_watertight,
        is_winding_consistent,
        is_empty: mesh.is_empty(),
        bounding_box: bounding_box(mesh),
        surface_area,
        volume,
        center_mass,
        has_vertex_normals: mesh.normals().is_some(),
        has_vertex_colors,
        has_face_colors,
        has_material: mesh.material().is_some(),
    }
}

pub fn bounding_box(mesh: &Mesh) -> Option<BoundingBox> {
    let mut points = mesh.positions().iter();
    let first = points.next()?;
    let mut min = [first.x, first.y, first.z];
    let mut max = min;
    for p in points {
        for (axis, v) in [p.x, p.y, p.z].into_iter().enumerate() {
            min[axis] = min[axis].min(v);
            max[axis] = max[axis].max(v);
        }
    }
    Some(BoundingBox {
        min,
        max,
        size: [max[0] - min[0], max[1] - min[1], max[2] - min[2]],
    })
}

// Sums signed tetrahedra spanned by the origin and each face (divergence theorem).
fn enclosed_volume(mesh: &Mesh) -> (Option<f64>, Option<[f64; 3]>) {
    let mut volume = 0.0f64;
    let mut moment = [0.0f64; 3];
    for t in mesh.triangles() {
        let v = f64::from(t.p0.dot(t.p1.cross(t.p2))) / 6.0;
        volume += v;
        let c = (t.p0 + t.p1 + t.p2) / 4.0;
        moment[0] += v * f64::from(c.x);
        moment[1] += v * f64::from(c.y);
        moment[2] += v * f64::from(c.z);
    }
    let center = if volume.abs() > f64::EPSILON {
        Some([moment[0] / volume, moment[1] / volume, moment[2] / volume])
    } else {
        None
    };
    (Some(volume), center)
}
