//! Core scene types for the Prism ray tracer.
//!
//! This crate provides the host-side data the renderer consumes:
//! - Triangle meshes with primitive generation helpers
//! - Wavefront OBJ loading into a single merged mesh
//! - The look-at camera and its launch basis
//! - Ray and bounding box math
//! - Common error types

pub mod camera;
pub mod error;
pub mod math;
pub mod mesh;
pub mod obj;
pub mod scene;

pub use camera::{Camera, CameraBasis};
pub use error::{Error, Result};
pub use math::{Aabb, Ray, TriangleHit};
pub use mesh::TriangleMesh;

/// Engine-wide constants
pub mod constants {
    /// Cosine-of-field-of-view factor scaling the camera's screen basis.
    pub const COS_FOVY: f32 = 0.66;
    /// Vertices emitted per generated box.
    pub const BOX_VERTEX_COUNT: usize = 8;
    /// Triangles emitted per generated box.
    pub const BOX_TRIANGLE_COUNT: usize = 12;
}
