//! Host-side triangle mesh accumulation.

use glam::{Affine3A, UVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::constants::{BOX_TRIANGLE_COUNT, BOX_VERTEX_COUNT};
use crate::math::{box_transform, Aabb};

/// Corners of the unit cube, indexed by `x | y << 1 | z << 2`.
const UNIT_CUBE_CORNERS: [Vec3; BOX_VERTEX_COUNT] = [
    Vec3::new(0.0, 0.0, 0.0),
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(1.0, 1.0, 0.0),
    Vec3::new(0.0, 0.0, 1.0),
    Vec3::new(1.0, 0.0, 1.0),
    Vec3::new(0.0, 1.0, 1.0),
    Vec3::new(1.0, 1.0, 1.0),
];

/// Two triangles per face, local to [`UNIT_CUBE_CORNERS`].
const UNIT_CUBE_TRIANGLES: [[u32; 3]; BOX_TRIANGLE_COUNT] = [
    [0, 1, 3],
    [2, 0, 3],
    [5, 7, 6],
    [5, 6, 4],
    [0, 4, 5],
    [0, 5, 1],
    [2, 3, 7],
    [2, 7, 6],
    [1, 5, 7],
    [1, 7, 3],
    [4, 0, 2],
    [4, 2, 6],
];

/// A single merged triangle mesh with one surface color.
///
/// Geometry is append-only: primitives are added while the scene is being
/// assembled and the finished mesh is handed to the renderer as an immutable
/// snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    /// Vertex positions.
    pub vertices: Vec<Vec3>,
    /// Triangles as vertex index triples.
    pub indices: Vec<UVec3>,
    /// Surface color shared by every triangle.
    pub color: Vec3,
}

impl TriangleMesh {
    /// Create an empty mesh.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the surface color.
    #[must_use]
    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color;
        self
    }

    /// Append a unit cube mapped through `xfm`.
    ///
    /// Adds 8 vertices and 12 triangles whose indices are offset by the vertex
    /// count before the call.
    pub fn add_unit_cube(&mut self, xfm: &Affine3A) {
        let first_vertex = self.vertices.len() as u32;

        self.vertices
            .extend(UNIT_CUBE_CORNERS.iter().map(|&c| xfm.transform_point3(c)));
        self.indices.extend(
            UNIT_CUBE_TRIANGLES
                .iter()
                .map(|&tri| UVec3::from_array(tri) + UVec3::splat(first_vertex)),
        );
    }

    /// Append an axis-aligned box with the given center and edge lengths.
    pub fn add_cube(&mut self, center: Vec3, size: Vec3) {
        self.add_unit_cube(&box_transform(center, size));
    }

    /// Number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangles.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Whether the mesh holds no triangles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Bounds over every vertex.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::EMPTY;
        for &v in &self.vertices {
            bounds.expand_to_include(v);
        }
        bounds
    }

    /// Check that every triangle references an existing vertex.
    pub fn validate(&self) -> crate::Result<()> {
        let count = self.vertices.len() as u32;
        if let Some((i, tri)) = self
            .indices
            .iter()
            .enumerate()
            .find(|(_, tri)| tri.max_element() >= count)
        {
            return Err(crate::Error::InvalidData(format!(
                "triangle {i} references vertex {} but the mesh has {count} vertices",
                tri.max_element()
            )));
        }
        Ok(())
    }
}
