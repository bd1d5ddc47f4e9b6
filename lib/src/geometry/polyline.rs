//! Open polylines.

use super::{BoundingBox, Point};
use crate::CoordF;
use serde::{Deserialize, Serialize};

/// An open sequence of points.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polyline {
    pub points: Vec<Point>,
}

impl Polyline {
    #[inline]
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Polyline through millimeter coordinates.
    pub fn from_mm(coords: &[(CoordF, CoordF)]) -> Self {
        Self::new(coords.iter().map(|&(x, y)| Point::new_scale(x, y)).collect())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn first_point(&self) -> Option<Point> {
        self.points.first().copied()
    }

    #[inline]
    pub fn last_point(&self) -> Option<Point> {
        self.points.last().copied()
    }

    /// Length in scaled units.
    pub fn length(&self) -> CoordF {
        self.points.windows(2).map(|w| w[0].distance(&w[1])).sum()
    }

    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// Shorten the polyline by `distance` scaled units from its end.
    pub fn clip_end(&mut self, mut distance: CoordF) {
        while distance > 0.0 && self.points.len() >= 2 {
            let last = self.points[self.points.len() - 1];
            let prev = self.points[self.points.len() - 2];
            let seg = prev.distance(&last);
            if seg > distance {
                let ratio = (seg - distance) / seg;
                let new_last = Point::new(
                    prev.x + ((last.x - prev.x) as f64 * ratio).round() as i64,
                    prev.y + ((last.y - prev.y) as f64 * ratio).round() as i64,
                );
                let n = self.points.len();
                self.points[n - 1] = new_last;
                return;
            }
            distance -= seg;
            self.points.pop();
        }
    }

    /// Split at `distance` scaled units from the start; the split point is
    /// shared by both halves.
    pub fn split_at_distance(&self, distance: CoordF) -> (Polyline, Polyline) {
        let mut walked = 0.0;
        for i in 1..self.points.len() {
            let a = self.points[i - 1];
            let b = self.points[i];
            let seg = a.distance(&b);
            if walked + seg >= distance && seg > 0.0 {
                let ratio = (distance - walked) / seg;
                let p = Point::new(
                    a.x + ((b.x - a.x) as f64 * ratio).round() as i64,
                    a.y + ((b.y - a.y) as f64 * ratio).round() as i64,
                );
                let mut head: Vec<Point> = self.points[..i].to_vec();
                head.push(p);
                let mut tail = vec![p];
                tail.extend_from_slice(&self.points[i..]);
                return (Polyline::new(head), Polyline::new(tail));
            }
            walked += seg;
        }
        (self.clone(), Polyline::new(self.last_point().into_iter().collect()))
    }

    pub fn translate(&mut self, v: Point) {
        for p in &mut self.points {
            *p = *p + v;
        }
    }
}
