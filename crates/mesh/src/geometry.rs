use cgmath::InnerSpace;

pub type Vector3 = cgmath::Vector3<f32>;

// Position buffers are written as tightly packed xyz floats.
static_assertions::assert_eq_size!(Vector3, [f32; 3]);
static_assertions::assert_eq_align!(Vector3, f32);

/// Shorthand for building a `Vector3`.
#[inline(always)]
pub fn vec3(x: f32, y: f32, z: f32) -> Vector3 {
    Vector3 { x, y, z }
}

#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(C)]
pub struct Triangle {
    pub p0: Vector3,
    pub p1: Vector3,
    pub p2: Vector3,
}

impl Triangle {
    pub fn new(p0: Vector3, p1: Vector3, p2: Vector3) -> Self {
        Self { p0, p1, p2 }
    }

    /// The (unnormalized) cross product of the two edges leaving `p0`.
    ///
    /// Its length is twice the triangle area and it points out of the front face when the
    /// vertices are listed counter-clockwise.
    pub fn area_vector(&self) -> Vector3 {
        (self.p1 - self.p0).cross(self.p2 - self.p0)
    }

    pub fn area(&self) -> f32 {
        self.area_vector().magnitude() * 0.5
    }

    /// Unit normal of the front face, or the zero vector for degenerate triangles.
    pub fn normal(&self) -> Vector3 {
        let n = self.area_vector();
        let len = n.magnitude();
        if len > f32::EPSILON {
            n / len
        } else {
            vec3(0.0, 0.0, 0.0)
        }
    }
}

impl std::default::Default for Triangle {
    fn default() -> Self {
        let origin = vec3(0.0, 0.0, 0.0);
        Self {
            p0: origin,
            p1: origin,
            p2: origin,
        }
    }
}
