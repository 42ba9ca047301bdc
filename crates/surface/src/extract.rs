//! Marching cubes.
//!
//! Rather than carrying the classic 256 entry triangle table, the table is derived once from
//! the cube's topology. On every cube face the crossing edges are paired up so that each
//! inside corner is cut off on its own, and the resulting segments are chained into closed
//! loops. Two cells sharing a face always pair that face identically, so the loops of
//! neighbouring cells meet edge to edge.
//!
//! A loop that crosses the same cube face twice is fanned from an extra vertex at its
//! centre. Fanning it from one of its own corners would put a triangle flat in that face,
//! where the neighbouring cell emits the same triangle.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use cgmath::{InnerSpace, Zero};
use kiln_mesh::{vec3, Face, Mesh, Vector3};

use crate::error::{Result, SurfaceError};
use crate::field::ScalarField;

/// Corner `n` of a cell sits at offset `(n & 1, (n >> 1) & 1, (n >> 2) & 1)`.
fn corner_offset(n: usize) -> [usize; 3] {
    [n & 1, (n >> 1) & 1, (n >> 2) & 1]
}

/// Cell edges as `(lower corner, upper corner, axis)`.
const EDGES: [(usize, usize, usize); 12] = [
    (0, 1, 0),
    (2, 3, 0),
    (4, 5, 0),
    (6, 7, 0),
    (0, 2, 1),
    (1, 3, 1),
    (4, 6, 1),
    (5, 7, 1),
    (0, 4, 2),
    (1, 5, 2),
    (2, 6, 2),
    (3, 7, 2),
];

/// Corners of each cell face, counter-clockwise as seen from outside the cell.
const FACES: [[usize; 4]; 6] = [
    [0, 4, 6, 2],
    [1, 3, 7, 5],
    [0, 1, 5, 4],
    [2, 6, 7, 3],
    [0, 2, 3, 1],
    [4, 5, 7, 6],
];

fn edge_between(a: usize, b: usize) -> usize {
    EDGES
        .iter()
        .position(|&(lo, hi, _)| (lo, hi) == (a, b) || (lo, hi) == (b, a))
        .unwrap_or_else(|| unreachable!("corners {a} and {b} are not adjacent"))
}

/// Stands for the centre vertex of a [`Patch`] in its triangles.
const CENTER: usize = 12;

/// One closed loop of crossing edges and the triangles covering it.
#[derive(Debug)]
struct Patch {
    /// Cell edges in boundary order.
    ring: Vec<usize>,
    /// Triples of cell edges, or [`CENTER`].
    triangles: Vec<[usize; 3]>,
}

impl Patch {
    fn new(ring: Vec<usize>) -> Self {
        let on_face = |face: &[usize; 4], edge: usize| {
            let (a, b, _) = EDGES[edge];
            face.contains(&a) && face.contains(&b)
        };
        let crosses_a_face_twice = FACES
            .iter()
            .any(|face| ring.iter().filter(|&&e| on_face(face, e)).count() > 2);

        // The boundary runs clockwise around the high side, so fans are reversed to face
        // from high to low.
        let triangles = if crosses_a_face_twice {
            (0..ring.len())
                .map(|n| [CENTER, ring[(n + 1) % ring.len()], ring[n]])
                .collect()
        } else {
            (1..ring.len().saturating_sub(1))
                .map(|n| [ring[0], ring[n + 1], ring[n]])
                .collect()
        };
        Self { ring, triangles }
    }

    fn has_center(&self) -> bool {
        self.triangles.iter().flatten().any(|&e| e == CENTER)
    }
}

/// The surface patches for one inside/outside corner configuration.
fn triangulate_case(case: usize) -> Vec<Patch> {
    let inside = |corner: usize| case & (1 << corner) != 0;

    // next[e] is the edge that follows `e` when walking the boundary of the surface patch.
    let mut next: [Option<usize>; 12] = [None; 12];
    for face in FACES {
        // (edge, entering) for every crossing, in counter-clockwise order.
        let crossings: Vec<(usize, bool)> = (0..4)
            .filter_map(|n| {
                let (a, b) = (face[n], face[(n + 1) % 4]);
                (inside(a) != inside(b)).then(|| (edge_between(a, b), inside(b)))
            })
            .collect();
        for (n, &(edge, entering)) in crossings.iter().enumerate() {
            if entering {
                let (exit, _) = crossings[(n + 1) % crossings.len()];
                next[exit] = Some(edge);
            }
        }
    }

    let mut visited = [false; 12];
    let mut patches = Vec::new();
    for start in 0..12 {
        if visited[start] || next[start].is_none() {
            continue;
        }
        let mut ring = Vec::new();
        let mut edge = start;
        while !visited[edge] {
            visited[edge] = true;
            ring.push(edge);
            match next[edge] {
                Some(e) => edge = e,
                None => break,
            }
        }
        patches.push(Patch::new(ring));
    }
    patches
}

fn case_table() -> &'static [Vec<Patch>] {
    static TABLE: OnceLock<Vec<Vec<Patch>>> = OnceLock::new();
    TABLE.get_or_init(|| (0..256).map(triangulate_case).collect())
}

fn check_spacing(spacing: [f32; 3]) -> Result<()> {
    match spacing.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
        Some(s) => Err(SurfaceError::InvalidField(format!("spacing {s} is not positive"))),
        None => Ok(()),
    }
}

struct Extractor<'a> {
    field: &'a ScalarField,
    threshold: f32,
    spacing: [f32; 3],
    positions: Vec<Vector3>,
    normals: Vec<Vector3>,
    vertex_ids: HashMap<[usize; 4], u32>,
}

impl<'a> Extractor<'a> {
    // Derivative along `axis` at a grid point: central difference inside the grid, one
    // sided at the border.
    fn derivative(&self, p: [usize; 3], axis: usize) -> f32 {
        let n = self.field.dims()[axis];
        if n < 2 {
            return 0.0;
        }
        let mut lo = p;
        let mut hi = p;
        lo[axis] = p[axis].saturating_sub(1);
        hi[axis] = (p[axis] + 1).min(n - 1);
        let dv = self.field.value(hi[0], hi[1], hi[2]) - self.field.value(lo[0], lo[1], lo[2]);
        dv / ((hi[axis] - lo[axis]) as f32 * self.spacing[axis])
    }

    // Negated gradient: points from high to low intensity.
    fn normal_at(&self, p: [usize; 3]) -> Vector3 {
        -vec3(
            self.derivative(p, 0),
            self.derivative(p, 1),
            self.derivative(p, 2),
        )
    }

    fn vertex(&mut self, cell: [usize; 3], edge: usize) -> u32 {
        let (lo, hi, axis) = EDGES[edge];
        let offset = corner_offset(lo);
        let a = [cell[0] + offset[0], cell[1] + offset[1], cell[2] + offset[2]];
        let key = [a[0], a[1], a[2], axis];
        if let Some(&id) = self.vertex_ids.get(&key) {
            return id;
        }

        let mut b = a;
        b[axis] += 1;
        debug_assert_eq!(corner_offset(hi)[axis], 1);
        let va = self.field.value(a[0], a[1], a[2]);
        let vb = self.field.value(b[0], b[1], b[2]);
        let t = ((self.threshold - va) / (vb - va)).clamp(0.0, 1.0);

        let mut grid = [a[0] as f32, a[1] as f32, a[2] as f32];
        grid[axis] += t;
        self.positions.push(vec3(
            grid[0] * self.spacing[0],
            grid[1] * self.spacing[1],
            grid[2] * self.spacing[2],
        ));

        let na = self.normal_at(a);
        let nb = self.normal_at(b);
        let n = na + (nb - na) * t;
        self.normals.push(if n.is_zero() { n } else { n.normalize() });

        let id = self.positions.len() as u32 - 1;
        self.vertex_ids.insert(key, id);
        id
    }

    // Averages the ring's vertices. Centres belong to a single cell and are never shared.
    fn center(&mut self, ring: &[u32]) -> u32 {
        let mut position = Vector3::zero();
        let mut normal = Vector3::zero();
        for &id in ring {
            position += self.positions[id as usize];
            normal += self.normals[id as usize];
        }
        self.positions.push(position / ring.len() as f32);
        self.normals.push(if normal.is_zero() {
            normal
        } else {
            normal.normalize()
        });
        self.positions.len() as u32 - 1
    }
}

/// Extracts the isosurface at `threshold` from a normalized field.
///
/// Samples strictly above `threshold` are inside. Vertices are shared between neighbouring
/// cells and numbered in the order a sweep over cells (x fastest) first reaches them; loop
/// centres are numbered right after the loop they close. Faces wind counter-clockwise
/// around normals that point from high to low intensity.
pub fn extract(field: &ScalarField, threshold: f32, spacing: [f32; 3]) -> Result<Mesh> {
    check_spacing(spacing)?;
    if !threshold.is_finite() {
        return Err(SurfaceError::InvalidField(format!(
            "threshold {threshold} is not finite"
        )));
    }

    let started = Instant::now();
    let table = case_table();
    let [nx, ny, nz] = field.dims();
    let mut extractor = Extractor {
        field,
        threshold,
        spacing,
        positions: Vec::new(),
        normals: Vec::new(),
        vertex_ids: HashMap::new(),
    };
    let mut faces = Vec::new();

    for k in 0..nz.saturating_sub(1) {
        for j in 0..ny.saturating_sub(1) {
            for i in 0..nx.saturating_sub(1) {
                let mut case = 0;
                for corner in 0..8 {
                    let [dx, dy, dz] = corner_offset(corner);
                    if field.value(i + dx, j + dy, k + dz) > threshold {
                        case |= 1 << corner;
                    }
                }
                for patch in &table[case] {
                    let mut ids = [0u32; 13];
                    for &edge in &patch.ring {
                        ids[edge] = extractor.vertex([i, j, k], edge);
                    }
                    if patch.has_center() {
                        let ring: Vec<u32> = patch.ring.iter().map(|&e| ids[e]).collect();
                        ids[CENTER] = extractor.center(&ring);
                    }
                    for &[a, b, c] in &patch.triangles {
                        faces.push(Face::new(ids[a], ids[b], ids[c]));
                    }
                }
            }
        }
    }

    if faces.is_empty() {
        return Err(SurfaceError::EmptyIsosurface { threshold });
    }
    log::debug!(
        "extracted {} vertices / {} faces at threshold {:.4} in {:?}",
        extractor.positions.len(),
        faces.len(),
        threshold,
        started.elapsed()
    );
    let Extractor {
        positions, normals, ..
    } = extractor;
    Ok(Mesh::new(positions, faces)?.with_normals(normals)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangles(case: usize) -> Vec<[usize; 3]> {
        case_table()[case]
            .iter()
            .flat_map(|p| p.triangles.iter().copied())
            .collect()
    }

    #[test]
    fn trivial_cases_are_empty() {
        assert!(case_table()[0].is_empty());
        assert!(case_table()[255].is_empty());
    }

    #[test]
    fn single_corner_is_one_triangle() {
        for corner in 0..8 {
            assert_eq!(triangles(1 << corner).len(), 1);
            assert_eq!(triangles(255 ^ (1 << corner)).len(), 1);
        }
    }

    #[test]
    fn half_cube_is_a_quad() {
        // Corners 0..4 are the z = 0 face.
        assert_eq!(triangles(0x0f).len(), 2);
    }

    #[test]
    fn opposite_corners_stay_separate() {
        // Corners 0 and 3 share the z = 0 face but no edge.
        assert_eq!(case_table()[0b1001].len(), 2);
        assert_eq!(triangles(0b1001).len(), 2);
        // Corners 0 and 7 share nothing.
        assert_eq!(case_table()[0b1000_0001].len(), 2);
        assert_eq!(triangles(0b1000_0001).len(), 2);
    }

    #[test]
    fn loop_through_a_split_face_is_fanned_from_its_centre() {
        // Everything but corners 1 and 2: the z = 0 face is split and a single six edge
        // loop runs through both of its segments.
        let patches = &case_table()[0b1111_1001];
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].ring.len(), 6);
        assert!(patches[0].has_center());
        assert_eq!(patches[0].triangles.len(), 6);
    }

    #[test]
    fn no_triangle_lies_in_a_cell_face() {
        for (case, patches) in case_table().iter().enumerate() {
            for t in patches.iter().flat_map(|p| &p.triangles) {
                for face in FACES {
                    let flat = t.iter().all(|&e| {
                        e != CENTER && {
                            let (a, b, _) = EDGES[e];
                            face.contains(&a) && face.contains(&b)
                        }
                    });
                    assert!(!flat, "case {case:#010b} lays {t:?} in face {face:?}");
                }
            }
        }
    }

    #[test]
    fn every_edge_is_used_by_at_most_two_triangles() {
        for case in 0..256 {
            let mut uses: HashMap<(usize, usize), usize> = HashMap::new();
            for t in triangles(case) {
                for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
                    *uses.entry((a, b)).or_default() += 1;
                }
            }
            assert!(
                uses.values().all(|&n| n == 1),
                "case {case:#010b} repeats a directed edge"
            );
        }
    }

    #[test]
    fn normal_points_away_from_bright_corner() {
        let mut values = vec![0.0; 8];
        values[0] = 1.0;
        let field = ScalarField::new([2, 2, 2], [1.0; 3], values).unwrap();
        let mesh = extract(&field, 0.5, [1.0; 3]).unwrap();
        assert_eq!(mesh.face_count(), 1);
        let n = mesh.face_normals()[0];
        assert!(n.x > 0.0 && n.y > 0.0 && n.z > 0.0);
        assert!(mesh.positions().contains(&vec3(0.5, 0.0, 0.0)));
    }

    #[test]
    fn spacing_scales_positions() {
        let mut values = vec![0.0; 8];
        values[0] = 1.0;
        let field = ScalarField::new([2, 2, 2], [1.0; 3], values).unwrap();
        let mesh = extract(&field, 0.5, [2.0, 3.0, 4.0]).unwrap();
        assert!(mesh.positions().contains(&vec3(1.0, 0.0, 0.0)));
        assert!(mesh.positions().contains(&vec3(0.0, 1.5, 0.0)));
        assert!(mesh.positions().contains(&vec3(0.0, 0.0, 2.0)));
    }

    #[test]
    fn nothing_above_threshold() {
        let field = ScalarField::new([3, 3, 3], [1.0; 3], vec![0.2; 27]).unwrap();
        assert!(matches!(
            extract(&field, 0.5, [1.0; 3]),
            Err(SurfaceError::EmptyIsosurface { .. })
        ));
    }

    #[test]
    fn rejects_bad_spacing() {
        let field = ScalarField::new([2, 2, 2], [1.0; 3], vec![0.0; 8]).unwrap();
        assert!(matches!(
            extract(&field, 0.5, [1.0, -1.0, 1.0]),
            Err(SurfaceError::InvalidField(_))
        ));
    }
}
