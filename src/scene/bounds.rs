//! Axis-aligned bounding volumes

use glam::{Mat4, Vec3};

/// Axis-aligned box. An empty volume has `min > max` on every axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingVolume {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BoundingVolume {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingVolume {
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn expand_volume(&mut self, other: &BoundingVolume) {
        if other.is_valid() {
            self.expand(other.min);
            self.expand(other.max);
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Radius of the bounding sphere around [`Self::center`].
    pub fn radius(&self) -> f32 {
        if self.is_valid() {
            self.size().length() * 0.5
        } else {
            0.0
        }
    }

    /// Bounds of the eight transformed corners.
    pub fn transform(&self, matrix: &Mat4) -> BoundingVolume {
        if !self.is_valid() {
            return *self;
        }
        let mut out = BoundingVolume::empty();
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.expand(matrix.transform_point3(corner));
        }
        out
    }

    /// Matrix mapping the unit cube centered at the origin onto this box.
    pub fn unit_cube_transform(&self) -> Mat4 {
        Mat4::from_translation(self.center()) * Mat4::from_scale(self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_and_center() {
        let mut bv = BoundingVolume::empty();
        assert!(!bv.is_valid());
        bv.expand(Vec3::new(-1.0, 0.0, 2.0));
        bv.expand(Vec3::new(3.0, 2.0, 4.0));
        assert!(bv.is_valid());
        assert_eq!(bv.center(), Vec3::new(1.0, 1.0, 3.0));
        assert_eq!(bv.radius(), Vec3::new(4.0, 2.0, 2.0).length() * 0.5);
    }

    #[test]
    fn test_transform_translates_corners() {
        let bv = BoundingVolume::from_min_max(Vec3::splat(-1.0), Vec3::splat(1.0));
        let moved = bv.transform(&Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(9.0, -1.0, -1.0));
        assert_eq!(moved.max, Vec3::new(11.0, 1.0, 1.0));
        assert!(!BoundingVolume::empty().transform(&Mat4::IDENTITY).is_valid());
    }
}
