//! Point types in scaled (integer) and unscaled (millimeter) space.

use crate::{scale, unscale, Coord, CoordF};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// A 2D point with scaled integer coordinates.
///
/// Slicer geometry lives in scaled space so that island tests and travel
/// routing are exact; the emitter converts to millimeters only when a line
/// of G-code is formatted.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: Coord,
    pub y: Coord,
}

impl Point {
    #[inline]
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }

    /// Create a point from millimeter coordinates.
    #[inline]
    pub fn new_scale(x: CoordF, y: CoordF) -> Self {
        Self {
            x: scale(x),
            y: scale(y),
        }
    }

    #[inline]
    pub const fn zero() -> Self {
        Self { x: 0, y: 0 }
    }

    /// Convert to millimeter coordinates.
    #[inline]
    pub fn to_f64(&self) -> PointF {
        PointF {
            x: unscale(self.x),
            y: unscale(self.y),
        }
    }

    /// Squared distance in scaled units; i128 keeps large prints from overflowing.
    #[inline]
    pub fn distance_squared(&self, other: &Point) -> i128 {
        let dx = (other.x - self.x) as i128;
        let dy = (other.y - self.y) as i128;
        dx * dx + dy * dy
    }

    /// Distance in scaled units.
    #[inline]
    pub fn distance(&self, other: &Point) -> CoordF {
        (self.distance_squared(other) as CoordF).sqrt()
    }

    /// Cross product of `(b - a) x (c - a)`.
    #[inline]
    pub fn orientation(a: &Point, b: &Point, c: &Point) -> i128 {
        (b.x - a.x) as i128 * (c.y - a.y) as i128 - (b.y - a.y) as i128 * (c.x - a.x) as i128
    }

    /// Index of the point in `points` closest to this one.
    pub fn nearest_point_index(&self, points: &[Point]) -> Option<usize> {
        points
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| self.distance_squared(p))
            .map(|(i, _)| i)
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Point({}, {})", self.x, self.y)
    }
}

impl Add for Point {
    type Output = Point;

    #[inline]
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    #[inline]
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// A 2D point in millimeters, used for G-code output and the wipe tower.
#[derive(Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointF {
    pub x: CoordF,
    pub y: CoordF,
}

impl PointF {
    #[inline]
    pub const fn new(x: CoordF, y: CoordF) -> Self {
        Self { x, y }
    }

    /// Convert to scaled coordinates.
    #[inline]
    pub fn to_scaled(&self) -> Point {
        Point::new_scale(self.x, self.y)
    }

    #[inline]
    pub fn distance(&self, other: &PointF) -> CoordF {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }

    /// Rotate around `center` by `angle_deg` degrees.
    pub fn rotate_around(&self, center: PointF, angle_deg: CoordF) -> Self {
        if angle_deg.abs() < 1e-9 {
            return *self;
        }
        let (sin_a, cos_a) = angle_deg.to_radians().sin_cos();
        let dx = self.x - center.x;
        let dy = self.y - center.y;
        Self {
            x: center.x + cos_a * dx - sin_a * dy,
            y: center.y + sin_a * dx + cos_a * dy,
        }
    }

    #[inline]
    pub fn approx_eq(&self, other: &PointF, epsilon: CoordF) -> bool {
        (self.x - other.x).abs() < epsilon && (self.y - other.y).abs() < epsilon
    }
}

impl fmt::Debug for PointF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PointF({:.4}, {:.4})", self.x, self.y)
    }
}

impl Add for PointF {
    type Output = PointF;

    #[inline]
    fn add(self, rhs: PointF) -> PointF {
        PointF::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for PointF {
    type Output = PointF;

    #[inline]
    fn sub(self, rhs: PointF) -> PointF {
        PointF::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl From<Point> for PointF {
    fn from(p: Point) -> Self {
        p.to_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_distance() {
        let a = Point::new_scale(0.0, 0.0);
        let b = Point::new_scale(3.0, 4.0);
        assert!((unscale(a.distance(&b) as Coord) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_point_index() {
        let points = vec![
            Point::new(0, 0),
            Point::new(100, 0),
            Point::new(50, 50),
        ];
        assert_eq!(Point::new(90, 5).nearest_point_index(&points), Some(1));
        assert_eq!(Point::zero().nearest_point_index(&[]), None);
    }

    #[test]
    fn test_orientation_sign() {
        let a = Point::new(0, 0);
        let b = Point::new(10, 0);
        assert!(Point::orientation(&a, &b, &Point::new(5, 5)) > 0);
        assert!(Point::orientation(&a, &b, &Point::new(5, -5)) < 0);
    }

    #[test]
    fn test_pointf_rotate_around() {
        let p = PointF::new(1.0, 0.0);
        let r = p.rotate_around(PointF::new(0.0, 0.0), 90.0);
        assert!(r.approx_eq(&PointF::new(0.0, 1.0), 1e-9));
        assert_eq!(p.rotate_around(PointF::new(5.0, 5.0), 0.0), p);
    }
}
