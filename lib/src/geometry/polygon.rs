//! Closed polygon contours.

use super::{BoundingBox, Point, Polyline};
use crate::{Coord, CoordF};
use serde::{Deserialize, Serialize};

/// A closed polygon; the last point implicitly connects back to the first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<Point>,
}

/// Where a segment crosses a polygon edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeCrossing {
    /// Index of the edge `points[edge] -> points[edge + 1]`.
    pub edge: usize,
    /// Crossing point.
    pub point: Point,
    /// Parameter along the query segment, 0 at its start and 1 at its end.
    pub t: CoordF,
}

impl Polygon {
    #[inline]
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle, counter-clockwise, in millimeters.
    pub fn rectangle(min_x: CoordF, min_y: CoordF, max_x: CoordF, max_y: CoordF) -> Self {
        Self::new(vec![
            Point::new_scale(min_x, min_y),
            Point::new_scale(max_x, min_y),
            Point::new_scale(max_x, max_y),
            Point::new_scale(min_x, max_y),
        ])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Edge length sum including the closing edge (scaled units).
    pub fn perimeter(&self) -> CoordF {
        if self.points.len() < 2 {
            return 0.0;
        }
        (0..self.points.len())
            .map(|i| self.points[i].distance(&self.points[(i + 1) % self.points.len()]))
            .sum()
    }

    /// Twice the signed area; positive for counter-clockwise contours.
    pub fn signed_area2(&self) -> i128 {
        let n = self.points.len();
        (0..n)
            .map(|i| {
                let a = self.points[i];
                let b = self.points[(i + 1) % n];
                a.x as i128 * b.y as i128 - b.x as i128 * a.y as i128
            })
            .sum()
    }

    /// Area centroid, falling back to the vertex average for degenerate input.
    pub fn centroid(&self) -> Point {
        let n = self.points.len();
        if n == 0 {
            return Point::zero();
        }
        let area2 = self.signed_area2();
        if area2 == 0 {
            let sx: i128 = self.points.iter().map(|p| p.x as i128).sum();
            let sy: i128 = self.points.iter().map(|p| p.y as i128).sum();
            return Point::new((sx / n as i128) as Coord, (sy / n as i128) as Coord);
        }
        let mut cx: f64 = 0.0;
        let mut cy: f64 = 0.0;
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            let cross = a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
            cx += (a.x + b.x) as f64 * cross;
            cy += (a.y + b.y) as f64 * cross;
        }
        let area6 = 3.0 * area2 as f64;
        Point::new((cx / area6).round() as Coord, (cy / area6).round() as Coord)
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// Even-odd ray casting test.
    pub fn contains_point(&self, p: &Point) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.points[i];
            let pj = self.points[j];
            if (pi.y > p.y) != (pj.y > p.y) {
                let x_cross = pi.x as f64
                    + (p.y - pi.y) as f64 * (pj.x - pi.x) as f64 / (pj.y - pi.y) as f64;
                if (p.x as f64) < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// All proper crossings of segment `a -> b` with the polygon edges,
    /// sorted along the segment.
    pub fn segment_crossings(&self, a: Point, b: Point) -> Vec<EdgeCrossing> {
        let n = self.points.len();
        let mut out = Vec::new();
        if n < 2 {
            return out;
        }
        for i in 0..n {
            let c = self.points[i];
            let d = self.points[(i + 1) % n];
            if let Some((t, point)) = segment_intersection(a, b, c, d) {
                out.push(EdgeCrossing { edge: i, point, t });
            }
        }
        out.sort_by(|x, y| x.t.total_cmp(&y.t));
        out
    }

    /// Open the polygon at vertex `idx`, returning a closed polyline that
    /// starts and ends at that vertex.
    pub fn split_at_index(&self, idx: usize) -> Polyline {
        let n = self.points.len();
        let mut points = Vec::with_capacity(n + 1);
        for k in 0..=n {
            points.push(self.points[(idx + k) % n.max(1)]);
        }
        Polyline::new(points)
    }

    pub fn translate(&mut self, v: Point) {
        for p in &mut self.points {
            *p = *p + v;
        }
    }
}

/// Intersection of segments `a-b` and `c-d`, as parameter along `a-b` and point.
pub fn segment_intersection(a: Point, b: Point, c: Point, d: Point) -> Option<(CoordF, Point)> {
    let r = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let s = ((d.x - c.x) as f64, (d.y - c.y) as f64);
    let denom = r.0 * s.1 - r.1 * s.0;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let qp = ((c.x - a.x) as f64, (c.y - a.y) as f64);
    let t = (qp.0 * s.1 - qp.1 * s.0) / denom;
    let u = (qp.0 * r.1 - qp.1 * r.0) / denom;
    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        let point = Point::new(
            (a.x as f64 + t * r.0).round() as Coord,
            (a.y as f64 + t * r.1).round() as Coord,
        );
        Some((t, point))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale;

    fn square() -> Polygon {
        Polygon::rectangle(0.0, 0.0, 10.0, 10.0)
    }

    #[test]
    fn test_perimeter_and_area() {
        let sq = square();
        assert!((sq.perimeter() - scale(40.0) as f64).abs() < 1.0);
        assert!(sq.signed_area2() > 0);
    }

    #[test]
    fn test_centroid() {
        let c = square().centroid();
        assert_eq!(c, Point::new_scale(5.0, 5.0));
    }

    #[test]
    fn test_contains_point() {
        let sq = square();
        assert!(sq.contains_point(&Point::new_scale(5.0, 5.0)));
        assert!(!sq.contains_point(&Point::new_scale(15.0, 5.0)));
    }

    #[test]
    fn test_segment_crossings_sorted() {
        let sq = square();
        let hits = sq.segment_crossings(Point::new_scale(-5.0, 5.0), Point::new_scale(15.0, 5.0));
        assert_eq!(hits.len(), 2);
        assert!(hits[0].t < hits[1].t);
        assert_eq!(hits[0].edge, 3);
        assert_eq!(hits[1].edge, 1);
    }

    #[test]
    fn test_split_at_index_closes_loop() {
        let pl = square().split_at_index(2);
        assert_eq!(pl.points.len(), 5);
        assert_eq!(pl.points.first(), pl.points.last());
        assert_eq!(pl.points[0], Point::new_scale(10.0, 10.0));
    }
}
