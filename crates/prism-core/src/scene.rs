//! The stock scene rendered by the viewer and the end-to-end tests.

use glam::Vec3;

use crate::camera::Camera;
use crate::math::Aabb;
use crate::mesh::TriangleMesh;

/// Surface color of the stock scene.
pub const SCENE_COLOR: Vec3 = Vec3::new(0.2, 0.8, 0.2);

/// A 10 x 0.1 x 10 floor slab below a 2 x 2 x 2 box at the origin.
#[must_use]
pub fn two_boxes() -> TriangleMesh {
    let mut mesh = TriangleMesh::new().with_color(SCENE_COLOR);
    mesh.add_cube(Vec3::new(0.0, -1.5, 0.0), Vec3::new(10.0, 0.1, 10.0));
    mesh.add_cube(Vec3::ZERO, Vec3::splat(2.0));
    mesh
}

/// Camera the stock scene is framed for.
#[must_use]
pub fn standard_camera() -> Camera {
    Camera::new(Vec3::new(-10.0, 2.0, -12.0), Vec3::ZERO, Vec3::Y)
}

/// Camera looking at the center of `bounds` from the same direction as
/// [`standard_camera`], far enough back to keep the whole box in view.
#[must_use]
pub fn camera_for_bounds(bounds: &Aabb) -> Camera {
    if bounds.is_empty() {
        return standard_camera();
    }
    let center = bounds.center();
    let reach = bounds.size().length().max(f32::EPSILON);
    let direction = standard_camera().from.normalize();
    Camera::new(center + direction * reach * 1.25, center, Vec3::Y)
}
