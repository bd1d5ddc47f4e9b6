//! Geometry primitives used by the scheduler and emitter.
//!
//! Everything the export stages need from the slicing geometry: points in
//! scaled and millimeter space, bounding boxes, closed contours (island
//! outlines) and open polylines (extrusion and travel paths).

mod bounding_box;
mod point;
mod polygon;
mod polyline;

pub use bounding_box::{BoundingBox, BoundingBoxF};
pub use point::{Point, PointF};
pub use polygon::{segment_intersection, EdgeCrossing, Polygon};
pub use polyline::Polyline;

/// Convert a contour to a `geo` polygon in millimeters.
pub fn to_geo_polygon(polygon: &Polygon) -> geo::Polygon<f64> {
    let ring: Vec<geo::Coord<f64>> = polygon
        .points
        .iter()
        .map(|p| {
            let f = p.to_f64();
            geo::Coord { x: f.x, y: f.y }
        })
        .collect();
    geo::Polygon::new(geo::LineString::from(ring), vec![])
}

/// Convert a polyline to a `geo` line string in millimeters.
pub fn to_geo_line_string(polyline: &Polyline) -> geo::LineString<f64> {
    polyline
        .points
        .iter()
        .map(|p| {
            let f = p.to_f64();
            geo::Coord { x: f.x, y: f.y }
        })
        .collect()
}
