//! Axis-aligned boxes over `nalgebra` points.

use nalgebra::{Point3, Vector3};

/// An axis-aligned box. All components of `min` are less than or equal to
/// the matching components of `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    min: Point3<f64>,
    max: Point3<f64>,
}

impl Bounds {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        assert!(
            min.x <= max.x && min.y <= max.y && min.z <= max.z,
            "degenerate bounds: min {:?} max {:?}",
            min,
            max
        );
        Bounds { min, max }
    }

    /// An inverted box that grows around the first point it sees.
    pub fn empty() -> Self {
        Bounds {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(f64::MIN, f64::MIN, f64::MIN),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn min(&self) -> Point3<f64> {
        self.min
    }

    pub fn max(&self) -> Point3<f64> {
        self.max
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::new(
            (self.min.x + self.max.x) / 2.,
            (self.min.y + self.max.y) / 2.,
            (self.min.z + self.max.z) / 2.,
        )
    }

    pub fn extents(&self) -> Vector3<f64> {
        self.max - self.min
    }

    /// Inclusive on all faces. Points on the max faces descend into the
    /// high octants and stay addressable at every depth.
    pub fn contains(&self, p: &Point3<f64>) -> bool {
        self.min.x <= p.x
            && p.x <= self.max.x
            && self.min.y <= p.y
            && p.y <= self.max.y
            && self.min.z <= p.z
            && p.z <= self.max.z
    }

    pub fn grow(&mut self, p: &Point3<f64>) {
        self.min = Point3::new(self.min.x.min(p.x), self.min.y.min(p.y), self.min.z.min(p.z));
        self.max = Point3::new(self.max.x.max(p.x), self.max.y.max(p.y), self.max.z.max(p.z));
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Bounds {
            min: Point3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Point3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }

    /// Scales every edge by `factor` around the center.
    pub fn grow_by(&self, factor: f64) -> Bounds {
        let center = self.center();
        let half = (self.extents() / 2.) * factor;
        Bounds {
            min: center - half,
            max: center + half,
        }
    }

    /// The smallest cube containing this box, centered on it.
    pub fn cubeify(&self) -> Bounds {
        let extents = self.extents();
        let edge = extents.x.max(extents.y).max(extents.z);
        let center = self.center();
        let half = Vector3::new(edge / 2., edge / 2., edge / 2.);
        Bounds {
            min: center - half,
            max: center + half,
        }
    }

    /// One of the eight equal sub-boxes. Bit 0 selects the high half in
    /// x, bit 1 in y, bit 2 in z.
    pub fn octant(&self, index: u8) -> Bounds {
        assert!(index < 8);
        let center = self.center();
        let pick = |bit: bool, min: f64, center: f64, max: f64| {
            if bit {
                (center, max)
            } else {
                (min, center)
            }
        };
        let (min_x, max_x) = pick(index & 0b001 != 0, self.min.x, center.x, self.max.x);
        let (min_y, max_y) = pick(index & 0b010 != 0, self.min.y, center.y, self.max.y);
        let (min_z, max_z) = pick(index & 0b100 != 0, self.min.z, center.z, self.max.z);
        Bounds {
            min: Point3::new(min_x, min_y, min_z),
            max: Point3::new(max_x, max_y, max_z),
        }
    }

    /// Index of the octant containing 'p'. A point on a splitting plane
    /// goes to the low side.
    pub fn octant_of(&self, p: &Point3<f64>) -> u8 {
        let center = self.center();
        let gt_x = p.x > center.x;
        let gt_y = p.y > center.y;
        let gt_z = p.z > center.z;
        (gt_x as u8) | (gt_y as u8) << 1 | (gt_z as u8) << 2
    }

    pub fn to_array(&self) -> [f64; 6] {
        [
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
        ]
    }

    pub fn from_array(a: &[f64; 6]) -> Bounds {
        Bounds::new(Point3::new(a[0], a[1], a[2]), Point3::new(a[3], a[4], a[5]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_cube() -> Bounds {
        Bounds::new(Point3::new(0., 0., 0.), Point3::new(16., 16., 16.))
    }

    #[test]
    fn contains_is_inclusive_of_max_faces() {
        let b = unit_cube();
        assert!(b.contains(&Point3::new(0., 0., 0.)));
        assert!(b.contains(&Point3::new(16., 16., 16.)));
        assert!(b.contains(&Point3::new(16., 0., 8.)));
        assert!(!b.contains(&Point3::new(16.000001, 0., 8.)));
        assert!(!b.contains(&Point3::new(-0.000001, 0., 8.)));
    }

    #[test]
    fn octant_partitions_at_center() {
        let b = unit_cube();
        let low = b.octant(0);
        assert_eq!(low.min(), Point3::new(0., 0., 0.));
        assert_eq!(low.max(), Point3::new(8., 8., 8.));
        let high = b.octant(7);
        assert_eq!(high.min(), Point3::new(8., 8., 8.));
        assert_eq!(high.max(), Point3::new(16., 16., 16.));
        let x_high = b.octant(1);
        assert_eq!(x_high.min(), Point3::new(8., 0., 0.));
        assert_eq!(x_high.max(), Point3::new(16., 8., 8.));
    }

    #[test]
    fn octant_of_ties_go_low() {
        let b = unit_cube();
        // The exact center descends into octant 0.
        assert_eq!(b.octant_of(&Point3::new(8., 8., 8.)), 0);
        assert_eq!(b.octant_of(&Point3::new(8.1, 8., 8.)), 1);
        assert_eq!(b.octant_of(&Point3::new(8., 8.1, 8.)), 2);
        assert_eq!(b.octant_of(&Point3::new(8., 8., 8.1)), 4);
        assert_eq!(b.octant_of(&Point3::new(15., 15., 15.)), 7);
    }

    #[test]
    fn grow_by_keeps_center() {
        let b = Bounds::new(Point3::new(0., 0., 0.), Point3::new(10., 20., 30.));
        let grown = b.grow_by(1.5);
        assert_eq!(grown.center(), b.center());
        assert_eq!(grown.extents(), b.extents() * 1.5);
    }

    #[test]
    fn cubeify_uses_longest_edge() {
        let b = Bounds::new(Point3::new(0., 0., 0.), Point3::new(10., 20., 40.));
        let cube = b.cubeify();
        assert_eq!(cube.extents(), Vector3::new(40., 40., 40.));
        assert_eq!(cube.center(), b.center());
    }

    #[test]
    fn union_and_grow() {
        let mut b = Bounds::empty();
        assert!(b.is_empty());
        b.grow(&Point3::new(1., 2., 3.));
        b.grow(&Point3::new(-1., 0., 5.));
        assert_eq!(b.min(), Point3::new(-1., 0., 3.));
        assert_eq!(b.max(), Point3::new(1., 2., 5.));

        let other = Bounds::new(Point3::new(-4., 0., 0.), Point3::new(0., 1., 1.));
        let u = b.union(&other);
        assert_eq!(u.min(), Point3::new(-4., 0., 0.));
        assert_eq!(u.max(), Point3::new(1., 2., 5.));
    }
}
