//! Mesh data and procedural generation

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Vec2, Vec3, Vec4};

use crate::backend::Vertex;

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique mesh identity, used by devices to cache uploaded buffers.
///
/// Meshes are treated as immutable once drawn; build a new mesh instead of
/// editing one in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshId(u64);

/// An indexed triangle mesh
#[derive(Debug, Clone)]
pub struct Mesh {
    id: MeshId,
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            id: MeshId(NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
            vertices: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Bounding sphere in object space as (center, radius).
    pub fn bounding_sphere(&self) -> (Vec3, f32) {
        if self.vertices.is_empty() {
            return (Vec3::ZERO, 0.0);
        }
        let (min, max) = self.vertices.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), v| (min.min(v.position), max.max(v.position)),
        );
        let center = (min + max) * 0.5;
        let radius = self
            .vertices
            .iter()
            .map(|v| v.position.distance(center))
            .fold(0.0, f32::max);
        (center, radius)
    }

    fn push_quad(&mut self, center: Vec3, normal: Vec3, u_axis: Vec3, v_axis: Vec3) {
        let base = self.vertices.len() as u32;
        let tangent = u_axis.extend(1.0);
        for (du, dv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            self.vertices.push(Vertex {
                position: center + (u_axis * du + v_axis * dv) * 0.5,
                normal,
                uv: Vec2::new((du + 1.0) * 0.5, (1.0 - dv) * 0.5),
                tangent,
            });
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    /// Unit cube centered at origin, counter-clockwise faces
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");
        for normal in [Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y, Vec3::Z, -Vec3::Z] {
            let up = if normal.y.abs() > 0.9 { Vec3::Z } else { Vec3::Y };
            let u_axis = up.cross(normal);
            let v_axis = normal.cross(u_axis);
            mesh.push_quad(normal * 0.5, normal, u_axis, v_axis);
        }
        mesh
    }

    /// Unit quad in the XY plane facing +Z
    pub fn quad() -> Self {
        let mut mesh = Mesh::new("quad");
        mesh.push_quad(Vec3::ZERO, Vec3::Z, Vec3::X, Vec3::Y);
        mesh
    }

    /// UV sphere of diameter one
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");
        let segment_angle = std::f32::consts::TAU / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex {
                    position: normal * 0.5,
                    normal,
                    uv: Vec2::new(
                        segment as f32 / segments as f32,
                        ring as f32 / rings as f32,
                    ),
                    tangent: Vec4::new(-theta.sin(), 0.0, theta.cos(), 1.0),
                });
            }
        }

        let stride = segments + 1;
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * stride + segment;
                let next = current + stride;
                mesh.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }
        mesh
    }

    /// Plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");
        let subdivisions = subdivisions.max(1);
        let stride = subdivisions + 1;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let u = x as f32 / subdivisions as f32;
                let v = z as f32 / subdivisions as f32;
                mesh.vertices.push(Vertex {
                    position: Vec3::new((u - 0.5) * width, 0.0, (v - 0.5) * depth),
                    normal: Vec3::Y,
                    uv: Vec2::new(u, v),
                    tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
                });
            }
        }

        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * stride + x;
                let next = current + stride;
                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_counts_and_bounds() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        let (center, radius) = cube.bounding_sphere();
        assert!(center.length() < 1e-5);
        assert!((radius - 0.75f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_cube_faces_wind_outward() {
        let cube = Mesh::cube();
        for tri in cube.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| cube.vertices[tri[i] as usize].position);
            let face_normal = (b - a).cross(c - a);
            let normal = cube.vertices[tri[0] as usize].normal;
            assert!(face_normal.dot(normal) > 0.0);
        }
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Mesh::quad().id(), Mesh::quad().id());
        let mesh = Mesh::plane(1.0, 1.0, 2);
        assert_eq!(mesh.clone().id(), mesh.id());
    }

    #[test]
    fn test_empty_mesh_bounds() {
        assert_eq!(Mesh::new("empty").bounding_sphere(), (Vec3::ZERO, 0.0));
    }
}
