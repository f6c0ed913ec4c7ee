//! Axis-aligned bounding box

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Box spanning [0, 1] on every axis, used for grids with no active voxels
    pub fn unit() -> Self {
        Self::new(Vec3::ZERO, Vec3::ONE)
    }

    /// Create AABB from a pair of corner arrays
    pub fn from_arrays(min: [f32; 3], max: [f32; 3]) -> Self {
        Self::new(Vec3::from_array(min), Vec3::from_array(max))
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// True when any axis has non-positive extent
    pub fn is_degenerate(&self) -> bool {
        let size = self.size();
        size.x <= 0.0 || size.y <= 0.0 || size.z <= 0.0
    }

    /// Check if point is inside AABB
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y &&
        p.z >= self.min.z && p.z <= self.max.z
    }

    /// Smallest box containing both boxes
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(self.min.min(other.min), self.max.max(other.max))
    }
}
