use std::collections::HashMap;

use ordered_float::OrderedFloat;

use crate::error::{MeshError, Result};
use crate::geometry::{Triangle, Vector3};
use crate::TriangleMesh;

/// An RGBA color with 8 bits per channel.
pub type Rgba = [u8; 4];

/// Geometry for a single facet.
///
/// The points here are only indices into the vertex list of the owning [`Mesh`]. Storing
/// indices instead of positions lets neighbouring facets share a vertex, which is what makes
/// edge-based statistics (watertightness, winding) meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Face {
    pub p0: u32,
    pub p1: u32,
    pub p2: u32,
}

impl Face {
    pub fn new(p0: u32, p1: u32, p2: u32) -> Self {
        Self { p0, p1, p2 }
    }

    pub fn indices(&self) -> [u32; 3] {
        [self.p0, self.p1, self.p2]
    }

    /// The three directed edges of the face, in winding order.
    pub fn edges(&self) -> [(u32, u32); 3] {
        [(self.p0, self.p1), (self.p1, self.p2), (self.p2, self.p0)]
    }
}

impl From<[u32; 3]> for Face {
    fn from(i: [u32; 3]) -> Self {
        Self::new(i[0], i[1], i[2])
    }
}

/// Color attributes attached either to vertices or to faces.
#[derive(Debug, Clone, PartialEq)]
pub enum Colors {
    Vertex(Vec<Rgba>),
    Face(Vec<Rgba>),
}

/// A flat PBR material; only the base color survives format conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub base_color: [f32; 4],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "material".to_string(),
            base_color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// An indexed triangle mesh with optional per-vertex normals, colors and a material.
///
/// Every constructor and attribute setter validates the mesh, so a `Mesh` value always has
/// in-range face indices and attribute arrays whose lengths match what they annotate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    positions: Vec<Vector3>,
    faces: Vec<Face>,
    normals: Option<Vec<Vector3>>,
    colors: Option<Colors>,
    material: Option<Material>,
}

impl Mesh {
    pub fn new(positions: Vec<Vector3>, faces: Vec<Face>) -> Result<Self> {
        if positions.len() > u32::MAX as usize {
            return Err(MeshError::TooManyVertices(positions.len()));
        }
        let mesh = Self {
            positions,
            faces,
            normals: None,
            colors: None,
            material: None,
        };
        mesh.check_faces()?;
        Ok(mesh)
    }

    pub fn with_normals(mut self, normals: Vec<Vector3>) -> Result<Self> {
        check_count("normals", self.positions.len(), normals.len())?;
        self.normals = Some(normals);
        Ok(self)
    }

    pub fn with_colors(mut self, colors: Colors) -> Result<Self> {
        match &colors {
            Colors::Vertex(c) => check_count("vertex colors", self.positions.len(), c.len())?,
            Colors::Face(c) => check_count("face colors", self.faces.len(), c.len())?,
        }
        self.colors = Some(colors);
        Ok(self)
    }

    pub fn with_material(mut self, material: Material) -> Self {
        self.material = Some(material);
        self
    }

    pub fn positions(&self) -> &[Vector3] {
        &self.positions
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    pub fn normals(&self) -> Option<&[Vector3]> {
        self.normals.as_deref()
    }

    pub fn colors(&self) -> Option<&Colors> {
        self.colors.as_ref()
    }

    pub fn material(&self) -> Option<&Material> {
        self.material.as_ref()
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// A mesh with no faces (or no vertices) has no surface to export or measure.
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty() || self.positions.is_empty()
    }

    pub fn triangle(&self, face: &Face) -> Triangle {
        Triangle {
            p0: self.positions[face.p0 as usize],
            p1: self.positions[face.p1 as usize],
            p2: self.positions[face.p2 as usize],
        }
    }

    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.faces.iter().map(|f| self.triangle(f))
    }

    /// Unit normal per face (zero for degenerate faces).
    pub fn face_normals(&self) -> Vec<Vector3> {
        self.triangles().map(|t| t.normal()).collect()
    }

    /// Re-checks every invariant. Meshes built through the public API always pass.
    pub fn validate(&self) -> Result<()> {
        self.check_faces()?;
        if let Some(n) = &self.normals {
            check_count("normals", self.positions.len(), n.len())?;
        }
        match &self.colors {
            Some(Colors::Vertex(c)) => check_count("vertex colors", self.positions.len(), c.len()),
            Some(Colors::Face(c)) => check_count("face colors", self.faces.len(), c.len()),
            None => Ok(()),
        }
    }

    /// Drops faces that repeat a vertex index or have zero area. Returns how many were removed.
    pub fn remove_degenerate_faces(&mut self) -> usize {
        let keep: Vec<bool> = self
            .faces
            .iter()
            .map(|f| {
                f.p0 != f.p1 && f.p1 != f.p2 && f.p2 != f.p0 && self.triangle(f).area() > 0.0
            })
            .collect();
        let removed = keep.iter().filter(|k| !**k).count();
        if removed == 0 {
            return 0;
        }

        let mut flags = keep.iter();
        self.faces.retain(|_| *flags.next().unwrap_or(&true));
        if let Some(Colors::Face(colors)) = &mut self.colors {
            let mut flags = keep.iter();
            colors.retain(|_| *flags.next().unwrap_or(&true));
        }
        removed
    }

    /// Returns a copy in which no two faces share a vertex.
    ///
    /// Face colors become vertex colors on the duplicated corners, which is the only way to
    /// express them in formats that color vertices only.
    pub fn unshared(&self) -> Mesh {
        let mut positions = Vec::with_capacity(self.faces.len() * 3);
        let mut normals = self.normals.as_ref().map(|_| Vec::with_capacity(self.faces.len() * 3));
        let mut colors = self.colors.as_ref().map(|_| Vec::with_capacity(self.faces.len() * 3));
        let mut faces = Vec::with_capacity(self.faces.len());

        for (i, face) in self.faces.iter().enumerate() {
            let base = positions.len() as u32;
            for index in face.indices() {
                positions.push(self.positions[index as usize]);
                if let (Some(out), Some(src)) = (normals.as_mut(), self.normals.as_ref()) {
                    out.push(src[index as usize]);
                }
                if let (Some(out), Some(src)) = (colors.as_mut(), self.colors.as_ref()) {
                    out.push(match src {
                        Colors::Vertex(c) => c[index as usize],
                        Colors::Face(c) => c[i],
                    });
                }
            }
            faces.push(Face::new(base, base + 1, base + 2));
        }

        Mesh {
            positions,
            faces,
            normals,
            colors: colors.map(Colors::Vertex),
            material: self.material.clone(),
        }
    }

    pub fn into_parts(self) -> (Vec<Vector3>, Vec<Face>) {
        (self.positions, self.faces)
    }

    fn check_faces(&self) -> Result<()> {
        let vertex_count = self.positions.len();
        for (i, face) in self.faces.iter().enumerate() {
            if let Some(&index) = face.indices().iter().find(|&&p| p as usize >= vertex_count) {
                return Err(MeshError::IndexOutOfRange {
                    face: i,
                    index,
                    vertex_count,
                });
            }
        }
        Ok(())
    }
}

fn check_count(attribute: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(MeshError::AttributeCount {
            attribute,
            expected,
            actual,
        })
    }
}

type PointKey = [OrderedFloat<f32>; 3];

fn point_key(p: &Vector3) -> PointKey {
    [p.x.into(), p.y.into(), p.z.into()]
}

impl TriangleMesh for Mesh {
    /// Builds an indexed mesh from a triangle soup.
    ///
    /// Triangle soups (such as STL files) repeat every shared corner. Bit-identical points are
    /// welded into a single vertex, in first-seen order, so the result has real connectivity.
    fn from_triangles(triangles: Vec<Triangle>) -> Self {
        let mut positions = Vec::new();
        let mut lookup: HashMap<PointKey, u32> = HashMap::new();
        let mut index_of = |p: Vector3| {
            *lookup.entry(point_key(&p)).or_insert_with(|| {
                positions.push(p);
                positions.len() as u32 - 1
            })
        };

        let faces = triangles
            .iter()
            .map(|t| Face::new(index_of(t.p0), index_of(t.p1), index_of(t.p2)))
            .collect();

        Mesh {
            positions,
            faces,
            normals: None,
            colors: None,
            material: None,
        }
    }

    fn triangle_count(&self) -> usize {
        self.faces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::vec3;

    fn quad() -> Mesh {
        Mesh::new(
            vec![
                vec3(0.0, 0.0, 0.0),
                vec3(1.0, 0.0, 0.0),
                vec3(1.0, 1.0, 0.0),
                vec3(0.0, 1.0, 0.0),
            ],
            vec![Face::new(0, 1, 2), Face::new(0, 2, 3)],
        )
        .unwrap()
    }

    #[test]
    fn rejects_out_of_range_index() {
        let err = Mesh::new(vec![vec3(0.0, 0.0, 0.0)], vec![Face::new(0, 0, 3)]).unwrap_err();
        assert_eq!(
            err,
            MeshError::IndexOutOfRange {
                face: 0,
                index: 3,
                vertex_count: 1
            }
        );
    }

    #[test]
    fn rejects_mismatched_attributes() {
        let err = quad().with_normals(vec![vec3(0.0, 0.0, 1.0)]).unwrap_err();
        assert!(matches!(err, MeshError::AttributeCount { expected: 4, actual: 1, .. }));

        let err = quad().with_colors(Colors::Face(vec![[0; 4]; 3])).unwrap_err();
        assert!(matches!(err, MeshError::AttributeCount { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn welds_triangle_soup() {
        let a = vec3(0.0, 0.0, 0.0);
        let b = vec3(1.0, 0.0, 0.0);
        let c = vec3(1.0, 1.0, 0.0);
        let d = vec3(0.0, 1.0, 0.0);
        let mesh = Mesh::from_triangles(vec![Triangle::new(a, b, c), Triangle::new(a, c, d)]);
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.faces(), &[Face::new(0, 1, 2), Face::new(0, 2, 3)]);
        assert_eq!(mesh.triangle_count(), 2);
    }

    #[test]
    fn removes_degenerate_faces_with_their_colors() {
        let mut mesh = Mesh::new(
            vec![vec3(0.0, 0.0, 0.0), vec3(1.0, 0.0, 0.0), vec3(0.0, 1.0, 0.0)],
            vec![Face::new(0, 1, 2), Face::new(0, 0, 1), Face::new(0, 1, 2)],
        )
        .unwrap()
        .with_colors(Colors::Face(vec![[1, 0, 0, 255], [2, 0, 0, 255], [3, 0, 0, 255]]))
        .unwrap();

        assert_eq!(mesh.remove_degenerate_faces(), 1);
        assert_eq!(mesh.face_count(), 2);
        assert_eq!(
            mesh.colors(),
            Some(&Colors::Face(vec![[1, 0, 0, 255], [3, 0, 0, 255]]))
        );
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn unshared_moves_face_colors_to_corners() {
        let mesh = quad()
            .with_colors(Colors::Face(vec![[255, 0, 0, 255], [0, 255, 0, 255]]))
            .unwrap();
        let flat = mesh.unshared();
        assert_eq!(flat.vertex_count(), 6);
        assert_eq!(flat.faces()[1], Face::new(3, 4, 5));
        match flat.colors() {
            Some(Colors::Vertex(c)) => {
                assert_eq!(c.len(), 6);
                assert_eq!(c[0], [255, 0, 0, 255]);
                assert_eq!(c[5], [0, 255, 0, 255]);
            }
            other => panic!("unexpected colors {:?}", other),
        }
    }
}
