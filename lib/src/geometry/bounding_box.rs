//! Axis-aligned bounding boxes.

use super::{Point, PointF};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};

/// A 2D bounding box in scaled coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
    defined: bool,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundingBox {
    /// An empty box; merging a point defines it.
    pub fn new() -> Self {
        Self {
            min: Point::new(Coord::MAX, Coord::MAX),
            max: Point::new(Coord::MIN, Coord::MIN),
            defined: false,
        }
    }

    pub fn from_points(points: &[Point]) -> Self {
        let mut bb = Self::new();
        for p in points {
            bb.merge_point(*p);
        }
        bb
    }

    #[inline]
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn merge_point(&mut self, p: Point) {
        if self.defined {
            self.min.x = self.min.x.min(p.x);
            self.min.y = self.min.y.min(p.y);
            self.max.x = self.max.x.max(p.x);
            self.max.y = self.max.y.max(p.y);
        } else {
            self.min = p;
            self.max = p;
            self.defined = true;
        }
    }

    pub fn merge(&mut self, other: &BoundingBox) {
        if other.defined {
            self.merge_point(other.min);
            self.merge_point(other.max);
        }
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.min.x / 2 + self.max.x / 2,
            self.min.y / 2 + self.max.y / 2,
        )
    }

    pub fn contains_point(&self, p: &Point) -> bool {
        self.defined
            && p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
    }

    /// Grow the box by `delta` on every side.
    pub fn offset(&mut self, delta: Coord) {
        if self.defined {
            self.min.x -= delta;
            self.min.y -= delta;
            self.max.x += delta;
            self.max.y += delta;
        }
    }
}

/// A 2D bounding box in millimeters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxF {
    pub min: PointF,
    pub max: PointF,
}

impl BoundingBoxF {
    pub fn from_coords(min_x: CoordF, min_y: CoordF, max_x: CoordF, max_y: CoordF) -> Self {
        Self {
            min: PointF::new(min_x, min_y),
            max: PointF::new(max_x, max_y),
        }
    }

    pub fn width(&self) -> CoordF {
        self.max.x - self.min.x
    }

    pub fn depth(&self) -> CoordF {
        self.max.y - self.min.y
    }

    pub fn contains(&self, p: &PointF) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_merge() {
        let mut bb = BoundingBox::new();
        assert!(!bb.is_defined());
        bb.merge_point(Point::new(10, -5));
        bb.merge_point(Point::new(-3, 7));
        assert_eq!(bb.min, Point::new(-3, -5));
        assert_eq!(bb.max, Point::new(10, 7));
        assert!(bb.contains_point(&Point::new(0, 0)));
        assert!(!bb.contains_point(&Point::new(11, 0)));
    }

    #[test]
    fn test_bounding_box_offset_and_center() {
        let mut bb = BoundingBox::from_points(&[Point::new(0, 0), Point::new(100, 50)]);
        bb.offset(10);
        assert_eq!(bb.min, Point::new(-10, -10));
        assert_eq!(bb.center(), Point::new(50, 25));
    }

    #[test]
    fn test_bounding_box_f() {
        let bb = BoundingBoxF::from_coords(1.0, 2.0, 11.0, 7.0);
        assert_eq!(bb.width(), 10.0);
        assert_eq!(bb.depth(), 5.0);
        assert!(bb.contains(&PointF::new(5.0, 5.0)));
    }
}
