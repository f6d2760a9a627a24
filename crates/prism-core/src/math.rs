//! Rays, triangle hits and bounding boxes.

use glam::{Affine3A, Vec3};

/// Half-line with a unit direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Always unit length.
    pub direction: Vec3,
}

impl Ray {
    /// `direction` is normalized.
    #[inline]
    #[must_use]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Point at distance `t` from the origin.
    #[inline]
    #[must_use]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Moller-Trumbore ray/triangle test restricted to `(t_min, t_max)`.
    ///
    /// Triangles are double sided; parallel rays never hit.
    #[must_use]
    pub fn intersect_triangle(
        &self,
        a: Vec3,
        b: Vec3,
        c: Vec3,
        t_min: f32,
        t_max: f32,
    ) -> Option<TriangleHit> {
        const EPSILON: f32 = 1e-8;

        let edge1 = b - a;
        let edge2 = c - a;
        let p = self.direction.cross(edge2);
        let det = edge1.dot(p);
        if det.abs() < EPSILON {
            return None;
        }

        let inv_det = 1.0 / det;
        let s = self.origin - a;
        let u = s.dot(p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let q = s.cross(edge1);
        let v = self.direction.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = edge2.dot(q) * inv_det;
        if t <= t_min || t >= t_max {
            return None;
        }

        Some(TriangleHit {
            t,
            barycentrics: [u, v],
        })
    }
}

/// Result of a ray/triangle intersection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriangleHit {
    /// Distance along the ray.
    pub t: f32,
    /// Barycentric weights of the second and third vertex.
    pub barycentrics: [f32; 2],
}

/// Axis-aligned box, `min` and `max` inclusive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    /// Inverted box that any point or box extends.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[inline]
    #[must_use]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Tight bounds of three points.
    #[inline]
    #[must_use]
    pub fn from_triangle(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self {
            min: a.min(b).min(c),
            max: a.max(b).max(c),
        }
    }

    /// Whether nothing has been added to this box yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    #[inline]
    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Edge lengths.
    #[inline]
    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Surface area, zero for an empty box.
    #[inline]
    #[must_use]
    pub fn surface_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.size();
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Inclusive containment test.
    #[inline]
    #[must_use]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Slab test against a ray with a precomputed reciprocal direction.
    ///
    /// Returns the entry distance when the box overlaps `(t_min, t_max)`.
    #[inline]
    #[must_use]
    pub fn intersect_ray(&self, origin: Vec3, inv_dir: Vec3, t_min: f32, t_max: f32) -> Option<f32> {
        let t1 = (self.min - origin) * inv_dir;
        let t2 = (self.max - origin) * inv_dir;

        let t_near = t1.min(t2).max_element().max(t_min);
        let t_far = t1.max(t2).min_element().min(t_max);

        (t_near <= t_far).then_some(t_near)
    }

    /// Grow to cover `point`.
    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Smallest box covering both.
    #[inline]
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Affine transform mapping the unit cube onto the box `center ± size/2`.
#[must_use]
pub fn box_transform(center: Vec3, size: Vec3) -> Affine3A {
    Affine3A::from_scale_rotation_translation(size, glam::Quat::IDENTITY, center - 0.5 * size)
}
