//! Travel path planning module.
//!
//! Non-printing moves are routed through a [`TravelRouter`]. The default
//! [`StraightRouter`] goes in a straight line; [`AvoidCrossingPerimeters`]
//! walks around island outlines instead of crossing them.
//!
//! # Algorithm
//!
//! 1. Find every crossing of the direct segment with the island outlines
//! 2. For each outline entered, find where the segment leaves it again
//! 3. Walk the outline between the two crossings in the shorter direction,
//!    keeping a small distance to the contour
//! 4. Simplify the result by skipping points while no new crossing appears
//! 5. Fall back to the direct move when the detour is too long
//!
//! # Example
//!
//! ```ignore
//! use slicer_gcode::travel::{AvoidCrossingPerimeters, TravelRouter};
//!
//! let router = AvoidCrossingPerimeters::new(2.0);
//! let result = router.route(start, end, &islands);
//! ```

use crate::geometry::{to_geo_line_string, to_geo_polygon, EdgeCrossing, Point, Polygon, Polyline};
use crate::{scale, Coord, CoordF};
use geo::Contains;

/// Result of travel planning.
#[derive(Clone, Debug)]
pub struct TravelResult {
    /// The travel path as a polyline.
    pub path: Polyline,
    /// Number of outline crossings of the direct path.
    pub original_crossings: usize,
    /// Whether the path was modified to avoid crossings.
    pub path_modified: bool,
}

impl TravelResult {
    /// Create a simple direct travel result.
    pub fn direct(start: Point, end: Point, original_crossings: usize) -> Self {
        Self {
            path: Polyline::new(vec![start, end]),
            original_crossings,
            path_modified: false,
        }
    }

    /// Whether the final path still crosses an outline.
    pub fn crosses_perimeters(&self) -> bool {
        self.original_crossings > 0 && !self.path_modified
    }
}

/// Decides how the head moves between two points of one layer.
///
/// Routers are shared by reference with the emission sequence only, so they
/// hold no per-move state.
pub trait TravelRouter: Send + Sync {
    /// Plan a travel from `from` to `to` given the layer's island outlines
    /// (bed coordinates, scaled).
    fn route(&self, from: Point, to: Point, boundaries: &[Polygon]) -> TravelResult;
}

/// Always travels in a straight line.
#[derive(Clone, Copy, Debug, Default)]
pub struct StraightRouter;

impl TravelRouter for StraightRouter {
    fn route(&self, from: Point, to: Point, boundaries: &[Polygon]) -> TravelResult {
        TravelResult::direct(from, to, count_crossings(from, to, boundaries))
    }
}

/// Whether a travel path stays entirely inside one island.
///
/// Such a travel only passes over material printed on this layer and does not
/// need a retraction when `only_retract_when_crossing_perimeters` is set.
pub fn travel_within_single_island(path: &Polyline, islands: &[Polygon]) -> bool {
    if path.len() < 2 {
        return true;
    }
    let line = to_geo_line_string(path);
    islands
        .iter()
        .filter(|island| island.len() >= 3)
        .any(|island| to_geo_polygon(island).contains(&line))
}

fn count_crossings(from: Point, to: Point, boundaries: &[Polygon]) -> usize {
    boundaries
        .iter()
        .map(|b| b.segment_crossings(from, to).len())
        .sum()
}

fn crosses_any(from: Point, to: Point, boundaries: &[Polygon]) -> bool {
    boundaries
        .iter()
        .any(|b| !b.segment_crossings(from, to).is_empty())
}

/// Direction for walking around a boundary polygon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// A crossing tagged with the outline it belongs to.
#[derive(Clone, Copy, Debug)]
struct Intersection {
    contour_idx: usize,
    crossing: EdgeCrossing,
}

/// Avoid Crossing Perimeters travel planner.
///
/// Routes travel moves around island outlines to avoid crossing them.
#[derive(Clone, Debug)]
pub struct AvoidCrossingPerimeters {
    /// Give up when the detour is longer than this multiple of the direct move.
    max_detour_ratio: CoordF,
    /// Distance kept from the outline while walking it (scaled).
    boundary_offset: Coord,
}

impl AvoidCrossingPerimeters {
    /// Create a planner with the given maximum detour ratio.
    pub fn new(max_detour_ratio: CoordF) -> Self {
        Self {
            max_detour_ratio,
            boundary_offset: scale(0.01),
        }
    }

    fn intersections(from: Point, to: Point, boundaries: &[Polygon]) -> Vec<Intersection> {
        let mut out: Vec<Intersection> = boundaries
            .iter()
            .enumerate()
            .flat_map(|(contour_idx, b)| {
                b.segment_crossings(from, to)
                    .into_iter()
                    .map(move |crossing| Intersection {
                        contour_idx,
                        crossing,
                    })
            })
            .collect();
        out.sort_by(|a, b| a.crossing.t.total_cmp(&b.crossing.t));
        out
    }

    /// Build the detour; returns the raw point list.
    fn avoid_perimeters_inner(
        &self,
        boundaries: &[Polygon],
        start: Point,
        end: Point,
        intersections: &[Intersection],
    ) -> Vec<Point> {
        let mut result = vec![start];
        let mut first_idx = 0;

        while first_idx < intersections.len() {
            let first = intersections[first_idx];
            let second_idx = (first_idx + 1..intersections.len())
                .rev()
                .find(|&j| intersections[j].contour_idx == first.contour_idx);

            let Some(second_idx) = second_idx else {
                first_idx += 1;
                continue;
            };
            let second = intersections[second_idx];
            let poly = &boundaries[first.contour_idx];
            let n = poly.len();
            let outside = !poly.contains_point(&start);

            result.push(self.offset_point(poly, first.crossing.point, first.crossing.edge, outside));

            let from_edge = first.crossing.edge;
            let to_edge = second.crossing.edge;
            match shortest_direction(poly, &first.crossing, &second.crossing) {
                Direction::Forward => {
                    let mut seg = from_edge;
                    while seg != to_edge {
                        seg = (seg + 1) % n;
                        result.push(self.offset_vertex(poly, seg, outside));
                    }
                }
                Direction::Backward => {
                    let mut seg = from_edge;
                    while seg != to_edge {
                        result.push(self.offset_vertex(poly, seg, outside));
                        seg = if seg == 0 { n - 1 } else { seg - 1 };
                    }
                }
            }

            result.push(self.offset_point(poly, second.crossing.point, second.crossing.edge, outside));
            first_idx = second_idx + 1;
        }

        result.push(end);
        simplify_travel(&result, boundaries)
    }

    /// Move a point on edge `edge` off the outline, to the requested side.
    fn offset_point(&self, poly: &Polygon, point: Point, edge: usize, outside: bool) -> Point {
        let n = poly.len();
        let a = poly.points[edge];
        let b = poly.points[(edge + 1) % n];
        let dx = (b.x - a.x) as f64;
        let dy = (b.y - a.y) as f64;
        let len = (dx * dx + dy * dy).sqrt();
        if len < 1.0 {
            return point;
        }
        self.pick_side(poly, point, (-dy / len, dx / len), outside)
    }

    /// Move a vertex off the outline along its bisector.
    fn offset_vertex(&self, poly: &Polygon, idx: usize, outside: bool) -> Point {
        let n = poly.len();
        let prev = poly.points[if idx == 0 { n - 1 } else { idx - 1 }];
        let curr = poly.points[idx];
        let next = poly.points[(idx + 1) % n];

        let v1 = ((curr.x - prev.x) as f64, (curr.y - prev.y) as f64);
        let v2 = ((next.x - curr.x) as f64, (next.y - curr.y) as f64);
        let len1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
        let len2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
        if len1 < 1.0 || len2 < 1.0 {
            return curr;
        }
        let nx = -v1.1 / len1 - v2.1 / len2;
        let ny = v1.0 / len1 + v2.0 / len2;
        let nlen = (nx * nx + ny * ny).sqrt();
        if nlen < 0.01 {
            return curr;
        }
        // Bisector of a corner is longer than the edge offset.
        let stretch = 2.0 / nlen;
        let normal = (nx / nlen * stretch, ny / nlen * stretch);
        self.pick_side(poly, curr, normal, outside)
    }

    fn pick_side(&self, poly: &Polygon, p: Point, normal: (f64, f64), outside: bool) -> Point {
        let offset = self.boundary_offset as f64;
        let candidate = Point::new(
            (p.x as f64 + normal.0 * offset).round() as Coord,
            (p.y as f64 + normal.1 * offset).round() as Coord,
        );
        if poly.contains_point(&candidate) != outside {
            candidate
        } else {
            Point::new(
                (p.x as f64 - normal.0 * offset).round() as Coord,
                (p.y as f64 - normal.1 * offset).round() as Coord,
            )
        }
    }
}

impl Default for AvoidCrossingPerimeters {
    fn default() -> Self {
        Self::new(2.0)
    }
}

impl TravelRouter for AvoidCrossingPerimeters {
    fn route(&self, from: Point, to: Point, boundaries: &[Polygon]) -> TravelResult {
        let intersections = Self::intersections(from, to, boundaries);
        if intersections.is_empty() {
            return TravelResult::direct(from, to, 0);
        }

        let points = self.avoid_perimeters_inner(boundaries, from, to, &intersections);
        let path = Polyline::new(points);

        let direct_length = from.distance(&to);
        if path.len() <= 2 || path.length() > direct_length * self.max_detour_ratio {
            return TravelResult::direct(from, to, intersections.len());
        }

        TravelResult {
            path,
            original_crossings: intersections.len(),
            path_modified: true,
        }
    }
}

/// Cumulative distance along a polygon to a point on edge `edge`.
fn distance_along(poly: &Polygon, crossing: &EdgeCrossing) -> f64 {
    let mut dist = 0.0;
    for i in 0..crossing.edge {
        dist += poly.points[i].distance(&poly.points[i + 1]);
    }
    dist + poly.points[crossing.edge].distance(&crossing.point)
}

/// Get the shorter direction around a polygon between two crossings.
fn shortest_direction(poly: &Polygon, from: &EdgeCrossing, to: &EdgeCrossing) -> Direction {
    let total = poly.perimeter();
    if total <= 0.0 {
        return Direction::Forward;
    }
    let d1 = distance_along(poly, from);
    let d2 = distance_along(poly, to);
    let forward = if d2 >= d1 { d2 - d1 } else { total - d1 + d2 };
    if forward <= total - forward {
        Direction::Forward
    } else {
        Direction::Backward
    }
}

/// Skip to the furthest point reachable without a new crossing.
fn simplify_travel(path: &[Point], boundaries: &[Polygon]) -> Vec<Point> {
    if path.len() <= 2 {
        return path.to_vec();
    }
    let mut result = vec![path[0]];
    let mut current = 0;
    while current < path.len() - 1 {
        let mut best = current + 1;
        for next in (current + 2)..path.len() {
            if !crosses_any(path[current], path[next], boundaries) {
                best = next;
            }
        }
        result.push(path[best]);
        current = best;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Polygon> {
        vec![Polygon::rectangle(10.0, 10.0, 20.0, 20.0)]
    }

    #[test]
    fn test_straight_router() {
        let result = StraightRouter.route(
            Point::new_scale(0.0, 15.0),
            Point::new_scale(30.0, 15.0),
            &square(),
        );
        assert_eq!(result.path.len(), 2);
        assert_eq!(result.original_crossings, 2);
        assert!(result.crosses_perimeters());
    }

    #[test]
    fn test_avoid_crossing_no_intersection() {
        let router = AvoidCrossingPerimeters::default();
        let result = router.route(
            Point::new_scale(0.0, 5.0),
            Point::new_scale(30.0, 5.0),
            &square(),
        );
        assert!(!result.path_modified);
        assert_eq!(result.path.len(), 2);
    }

    #[test]
    fn test_avoid_crossing_with_intersection() {
        let router = AvoidCrossingPerimeters::default();
        let boundaries = square();
        let result = router.route(
            Point::new_scale(0.0, 15.0),
            Point::new_scale(30.0, 15.0),
            &boundaries,
        );
        assert_eq!(result.original_crossings, 2);
        assert!(result.path_modified);
        assert!(result.path.len() > 2);
        for w in result.path.points.windows(2) {
            assert!(!crosses_any(w[0], w[1], &boundaries));
        }
        assert!(result.path.length() < scale(60.0) as f64);
    }

    #[test]
    fn test_detour_limit_falls_back_to_direct() {
        let router = AvoidCrossingPerimeters::new(1.05);
        let result = router.route(
            Point::new_scale(0.0, 15.0),
            Point::new_scale(30.0, 15.0),
            &square(),
        );
        assert!(!result.path_modified);
        assert_eq!(result.path.len(), 2);
    }

    #[test]
    fn test_empty_boundaries() {
        let router = AvoidCrossingPerimeters::default();
        let result = router.route(Point::new_scale(0.0, 0.0), Point::new_scale(5.0, 5.0), &[]);
        assert_eq!(result.original_crossings, 0);
        assert_eq!(result.path.len(), 2);
    }

    #[test]
    fn test_travel_within_single_island() {
        let islands = square();
        let inside = Polyline::from_mm(&[(11.0, 11.0), (19.0, 19.0)]);
        let across = Polyline::from_mm(&[(11.0, 11.0), (25.0, 15.0)]);
        assert!(travel_within_single_island(&inside, &islands));
        assert!(!travel_within_single_island(&across, &islands));
    }

    #[test]
    fn test_shortest_direction() {
        let poly = &square()[0];
        let a = EdgeCrossing {
            edge: 3,
            point: Point::new_scale(10.0, 15.0),
            t: 0.0,
        };
        let b = EdgeCrossing {
            edge: 0,
            point: Point::new_scale(15.0, 10.0),
            t: 1.0,
        };
        assert_eq!(shortest_direction(poly, &a, &b), Direction::Forward);
        assert_eq!(shortest_direction(poly, &b, &a), Direction::Backward);
    }
}
