//! World-space primitives shared by every stage: points are patient
//! coordinates in millimeters.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A point or direction in patient space (mm).
pub type Vec3 = Vector3<f64>;

/// Axis-aligned box in patient space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Inverted box that any point expands.
    pub fn empty() -> Self {
        Self {
            min: Vec3::repeat(f64::INFINITY),
            max: Vec3::repeat(f64::NEG_INFINITY),
        }
    }

    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut bounds = Self::empty();
        for p in points {
            bounds.include(&p);
        }
        bounds
    }

    pub fn include(&mut self, p: &Vec3) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Overlap of two boxes, `None` when they are disjoint.
    pub fn intersect(&self, other: &Bounds) -> Option<Bounds> {
        let min = self.min.sup(&other.min);
        let max = self.max.inf(&other.max);
        if (0..3).any(|i| min[i] > max[i]) {
            return None;
        }
        Some(Bounds { min, max })
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| !(self.min[i] <= self.max[i]))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn contains(&self, p: &Vec3) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }
}

/// Plain-array form of [`Bounds`] used in configuration files.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundsMm {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl From<BoundsMm> for Bounds {
    fn from(b: BoundsMm) -> Self {
        // Accept corners given in any order.
        Bounds::from_points([Vec3::from(b.min), Vec3::from(b.max)])
    }
}

impl From<Bounds> for BoundsMm {
    fn from(b: Bounds) -> Self {
        BoundsMm {
            min: b.min.into(),
            max: b.max.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_of_disjoint_boxes_is_none() {
        let a = Bounds::new(Vec3::zeros(), Vec3::repeat(1.0));
        let b = Bounds::new(Vec3::repeat(2.0), Vec3::repeat(3.0));
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn intersection_keeps_overlap() {
        let a = Bounds::new(Vec3::zeros(), Vec3::repeat(4.0));
        let b = Bounds::new(Vec3::new(2.0, -1.0, 1.0), Vec3::new(6.0, 3.0, 2.0));
        let c = a.intersect(&b).unwrap();
        assert_eq!(c.min, Vec3::new(2.0, 0.0, 1.0));
        assert_eq!(c.max, Vec3::new(4.0, 3.0, 2.0));
    }

    #[test]
    fn empty_bounds_grow_from_points() {
        assert!(Bounds::empty().is_empty());
        let b = Bounds::from_points([Vec3::new(1.0, 5.0, -2.0), Vec3::new(-1.0, 2.0, 3.0)]);
        assert!(!b.is_empty());
        assert_eq!(b.center(), Vec3::new(0.0, 3.5, 0.5));
    }

    #[test]
    fn config_bounds_are_reordered() {
        let b: Bounds = BoundsMm {
            min: [10.0, 0.0, 0.0],
            max: [0.0, 5.0, 5.0],
        }
        .into();
        assert_eq!(b.min.x, 0.0);
        assert_eq!(b.max.x, 10.0);
    }
}
