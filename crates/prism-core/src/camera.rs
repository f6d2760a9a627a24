//! Look-at camera and the screen basis the ray generation program consumes.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Relative length below which a vector is treated as zero.
const DEGENERATE_EPSILON: f32 = 1e-6;

/// Camera described by eye position, look-at target and up hint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Eye position.
    pub from: Vec3,
    /// Point the camera looks at.
    pub at: Vec3,
    /// Approximate up direction.
    pub up: Vec3,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            from: Vec3::new(-10.0, 2.0, -12.0),
            at: Vec3::ZERO,
            up: Vec3::Y,
        }
    }
}

impl Camera {
    /// Create a new camera.
    #[must_use]
    pub const fn new(from: Vec3, at: Vec3, up: Vec3) -> Self {
        Self { from, at, up }
    }

    /// Check that the camera can produce a view basis.
    pub fn validate(&self) -> Result<()> {
        let view = self.at - self.from;
        if !view.is_finite() || !self.up.is_finite() {
            return Err(Error::DegenerateCamera(
                "camera vectors must be finite".to_string(),
            ));
        }
        if view.length_squared() <= DEGENERATE_EPSILON * DEGENERATE_EPSILON {
            return Err(Error::DegenerateCamera(
                "eye and target coincide".to_string(),
            ));
        }
        if self.up.length_squared() <= DEGENERATE_EPSILON * DEGENERATE_EPSILON {
            return Err(Error::DegenerateCamera("up vector is zero".to_string()));
        }
        let side = view.normalize().cross(self.up.normalize());
        if side.length_squared() <= DEGENERATE_EPSILON * DEGENERATE_EPSILON {
            return Err(Error::DegenerateCamera(
                "view direction is parallel to up".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive the launch basis for a frame with the given aspect ratio.
    ///
    /// `horizontal` has length `cos_fovy * aspect` and `vertical` has length
    /// `cos_fovy`; both are perpendicular to the view direction.
    pub fn basis(&self, aspect: f32, cos_fovy: f32) -> Result<CameraBasis> {
        if !aspect.is_finite() || aspect <= 0.0 {
            return Err(Error::InvalidAspect(aspect));
        }
        self.validate()?;

        let direction = (self.at - self.from).normalize();
        let horizontal = cos_fovy * aspect * direction.cross(self.up).normalize();
        let vertical = cos_fovy * horizontal.cross(direction).normalize();

        Ok(CameraBasis {
            position: self.from,
            direction,
            horizontal,
            vertical,
        })
    }
}

/// Screen basis spanning the image plane one unit in front of the eye.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraBasis {
    pub position: Vec3,
    pub direction: Vec3,
    pub horizontal: Vec3,
    pub vertical: Vec3,
}

impl CameraBasis {
    /// Primary ray direction through normalized screen coordinates in `[0, 1]`.
    #[inline]
    #[must_use]
    pub fn ray_direction(&self, u: f32, v: f32) -> Vec3 {
        (self.direction + (u - 0.5) * self.horizontal + (v - 0.5) * self.vertical).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COS_FOVY;
    use approx::assert_relative_eq;

    #[test]
    fn basis_lengths_follow_fov_and_aspect() {
        let camera = Camera::default();
        let aspect = 1920.0 / 1080.0;
        let basis = camera.basis(aspect, COS_FOVY).unwrap();

        assert_relative_eq!(basis.direction.length(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(basis.horizontal.length(), COS_FOVY * aspect, epsilon = 1e-5);
        assert_relative_eq!(basis.vertical.length(), COS_FOVY, epsilon = 1e-5);
        assert_eq!(basis.position, camera.from);
    }

    #[test]
    fn basis_is_orthogonal() {
        let camera = Camera::new(Vec3::new(3.0, 4.0, 5.0), Vec3::new(-1.0, 0.5, 2.0), Vec3::Y);
        let basis = camera.basis(1.0, COS_FOVY).unwrap();

        assert_relative_eq!(basis.direction.dot(basis.horizontal), 0.0, epsilon = 1e-5);
        assert_relative_eq!(basis.direction.dot(basis.vertical), 0.0, epsilon = 1e-5);
        assert_relative_eq!(basis.horizontal.dot(basis.vertical), 0.0, epsilon = 1e-5);
        // Vertical points roughly along up.
        assert!(basis.vertical.dot(Vec3::Y) > 0.0);
    }

    #[test]
    fn center_ray_is_view_direction() {
        let basis = Camera::default().basis(1.0, COS_FOVY).unwrap();
        let center = basis.ray_direction(0.5, 0.5);
        assert_relative_eq!(center.x, basis.direction.x, epsilon = 1e-6);
        assert_relative_eq!(center.y, basis.direction.y, epsilon = 1e-6);
        assert_relative_eq!(center.z, basis.direction.z, epsilon = 1e-6);
    }

    #[test]
    fn coincident_eye_and_target_is_rejected() {
        let camera = Camera::new(Vec3::ONE, Vec3::ONE, Vec3::Y);
        assert!(matches!(
            camera.basis(1.0, COS_FOVY),
            Err(Error::DegenerateCamera(_))
        ));
    }

    #[test]
    fn view_parallel_to_up_is_rejected() {
        let camera = Camera::new(Vec3::ZERO, Vec3::new(0.0, 5.0, 0.0), Vec3::Y);
        assert!(matches!(camera.validate(), Err(Error::DegenerateCamera(_))));
    }

    #[test]
    fn bad_aspect_is_rejected() {
        let camera = Camera::default();
        assert_eq!(camera.basis(0.0, COS_FOVY), Err(Error::InvalidAspect(0.0)));
        assert!(camera.basis(f32::NAN, COS_FOVY).is_err());
    }
}
