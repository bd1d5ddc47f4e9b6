//! Extrusion entities produced by the perimeter, infill and support stages.
//!
//! The export stages treat these as opaque typed paths: a polyline plus a
//! role and a flow (`mm3_per_mm`). Everything else about how they were
//! generated stays with the slicing stages.

use crate::geometry::{BoundingBox, Point, Polyline};
use crate::{unscale, CoordF};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Extrusion Role
// ============================================================================

/// What an extrusion is for; drives speed, cooling and extruder choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtrusionRole {
    #[default]
    None,
    Perimeter,
    ExternalPerimeter,
    OverhangPerimeter,
    InternalInfill,
    SolidInfill,
    TopSolidInfill,
    BridgeInfill,
    GapFill,
    Skirt,
    SupportMaterial,
    SupportMaterialInterface,
    WipeTower,
    Mixed,
}

impl ExtrusionRole {
    /// Check if role is a perimeter type
    pub fn is_perimeter(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::Perimeter
                | ExtrusionRole::ExternalPerimeter
                | ExtrusionRole::OverhangPerimeter
        )
    }

    /// Check if role is any infill type
    pub fn is_infill(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::InternalInfill
                | ExtrusionRole::SolidInfill
                | ExtrusionRole::TopSolidInfill
                | ExtrusionRole::BridgeInfill
                | ExtrusionRole::GapFill
        )
    }

    /// Check if role is a solid infill type
    pub fn is_solid_infill(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::SolidInfill | ExtrusionRole::TopSolidInfill | ExtrusionRole::BridgeInfill
        )
    }

    /// Check if role is support material
    pub fn is_support(&self) -> bool {
        matches!(
            self,
            ExtrusionRole::SupportMaterial | ExtrusionRole::SupportMaterialInterface
        )
    }

    /// Human readable name, used in `;TYPE:` comments.
    pub fn name(&self) -> &'static str {
        match self {
            ExtrusionRole::None => "Undefined",
            ExtrusionRole::Perimeter => "Inner wall",
            ExtrusionRole::ExternalPerimeter => "Outer wall",
            ExtrusionRole::OverhangPerimeter => "Overhang wall",
            ExtrusionRole::InternalInfill => "Sparse infill",
            ExtrusionRole::SolidInfill => "Internal solid infill",
            ExtrusionRole::TopSolidInfill => "Top surface",
            ExtrusionRole::BridgeInfill => "Bridge",
            ExtrusionRole::GapFill => "Gap infill",
            ExtrusionRole::Skirt => "Skirt",
            ExtrusionRole::SupportMaterial => "Support",
            ExtrusionRole::SupportMaterialInterface => "Support interface",
            ExtrusionRole::WipeTower => "Prime tower",
            ExtrusionRole::Mixed => "Multiple",
        }
    }
}

impl fmt::Display for ExtrusionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Extrusion Path
// ============================================================================

/// A single open extrusion with uniform flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionPath {
    pub polyline: Polyline,
    pub role: ExtrusionRole,
    /// Volumetric flow per unit of length (mm³/mm).
    pub mm3_per_mm: CoordF,
    /// Extrusion width (mm).
    pub width: CoordF,
    /// Layer height the path was planned for (mm).
    pub height: CoordF,
    /// Overhang severity bucket, 0 (fully supported) to 5.
    #[serde(default)]
    pub overhang_degree: u8,
}

impl ExtrusionPath {
    pub fn new(polyline: Polyline, role: ExtrusionRole, width: CoordF, height: CoordF) -> Self {
        Self {
            polyline,
            role,
            mm3_per_mm: width * height,
            width,
            height,
            overhang_degree: 0,
        }
    }

    pub fn with_overhang_degree(mut self, degree: u8) -> Self {
        self.overhang_degree = degree.min(5);
        self
    }

    /// Length in millimeters.
    pub fn length(&self) -> CoordF {
        unscale(self.polyline.length().round() as i64)
    }

    pub fn first_point(&self) -> Option<Point> {
        self.polyline.first_point()
    }

    pub fn last_point(&self) -> Option<Point> {
        self.polyline.last_point()
    }

    pub fn reverse(&mut self) {
        self.polyline.reverse();
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.polyline.len() < 2 {
            return Err(format!(
                "{} path with {} point(s)",
                self.role,
                self.polyline.len()
            ));
        }
        if !(self.mm3_per_mm.is_finite() && self.mm3_per_mm >= 0.0) {
            return Err(format!("{} path with invalid flow {}", self.role, self.mm3_per_mm));
        }
        Ok(())
    }
}

/// A chain of paths printed without lifting, e.g. a perimeter that changes
/// role along its length.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionMultiPath {
    pub paths: Vec<ExtrusionPath>,
}

impl ExtrusionMultiPath {
    pub fn new(paths: Vec<ExtrusionPath>) -> Self {
        Self { paths }
    }

    pub fn length(&self) -> CoordF {
        self.paths.iter().map(|p| p.length()).sum()
    }

    pub fn reverse(&mut self) {
        self.paths.reverse();
        for p in &mut self.paths {
            p.reverse();
        }
    }
}

/// Kind of closed loop, used by the seam and speed logic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtrusionLoopRole {
    #[default]
    Default,
    ContourInternalPerimeter,
    Skirt,
}

/// A closed loop made of one or more paths; last point meets the first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionLoop {
    pub paths: Vec<ExtrusionPath>,
    #[serde(default)]
    pub loop_role: ExtrusionLoopRole,
}

impl ExtrusionLoop {
    pub fn new(paths: Vec<ExtrusionPath>) -> Self {
        Self {
            paths,
            loop_role: ExtrusionLoopRole::Default,
        }
    }

    /// Loop from a single closed polygon contour.
    pub fn from_polygon(
        polygon: &crate::geometry::Polygon,
        role: ExtrusionRole,
        width: CoordF,
        height: CoordF,
    ) -> Self {
        let mut points = polygon.points.clone();
        if let Some(&first) = points.first() {
            points.push(first);
        }
        Self::new(vec![ExtrusionPath::new(
            Polyline::new(points),
            role,
            width,
            height,
        )])
    }

    pub fn length(&self) -> CoordF {
        self.paths.iter().map(|p| p.length()).sum()
    }

    /// Role of the loop as a whole; a loop mixing roles reports its first.
    pub fn role(&self) -> ExtrusionRole {
        self.paths.first().map(|p| p.role).unwrap_or_default()
    }

    /// All vertices of the loop without the closing duplicate.
    pub fn points(&self) -> Vec<Point> {
        let mut out: Vec<Point> = Vec::new();
        for path in &self.paths {
            for p in &path.polyline.points {
                if out.last() != Some(p) {
                    out.push(*p);
                }
            }
        }
        if out.len() > 1 && out.first() == out.last() {
            out.pop();
        }
        out
    }

    pub fn first_point(&self) -> Option<Point> {
        self.paths.first().and_then(|p| p.first_point())
    }
}

/// An ordered group of entities.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionEntityCollection {
    pub entities: Vec<ExtrusionEntity>,
    /// Keep the given order instead of chaining by proximity.
    #[serde(default)]
    pub no_sort: bool,
}

impl ExtrusionEntityCollection {
    pub fn new(entities: Vec<ExtrusionEntity>) -> Self {
        Self {
            entities,
            no_sort: false,
        }
    }
}

// ============================================================================
// Extrusion Entity
// ============================================================================

/// Anything a region can hand to the emitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExtrusionEntity {
    Path(ExtrusionPath),
    MultiPath(ExtrusionMultiPath),
    Loop(ExtrusionLoop),
    Collection(ExtrusionEntityCollection),
}

impl ExtrusionEntity {
    pub fn role(&self) -> ExtrusionRole {
        match self {
            ExtrusionEntity::Path(p) => p.role,
            ExtrusionEntity::MultiPath(mp) => {
                mp.paths.first().map(|p| p.role).unwrap_or_default()
            }
            ExtrusionEntity::Loop(l) => l.role(),
            ExtrusionEntity::Collection(c) => {
                let mut role = ExtrusionRole::None;
                for e in &c.entities {
                    let r = e.role();
                    if role == ExtrusionRole::None {
                        role = r;
                    } else if role != r {
                        return ExtrusionRole::Mixed;
                    }
                }
                role
            }
        }
    }

    /// Length in millimeters.
    pub fn length(&self) -> CoordF {
        match self {
            ExtrusionEntity::Path(p) => p.length(),
            ExtrusionEntity::MultiPath(mp) => mp.length(),
            ExtrusionEntity::Loop(l) => l.length(),
            ExtrusionEntity::Collection(c) => c.entities.iter().map(|e| e.length()).sum(),
        }
    }

    pub fn first_point(&self) -> Option<Point> {
        match self {
            ExtrusionEntity::Path(p) => p.first_point(),
            ExtrusionEntity::MultiPath(mp) => mp.paths.first().and_then(|p| p.first_point()),
            ExtrusionEntity::Loop(l) => l.first_point(),
            ExtrusionEntity::Collection(c) => c.entities.first().and_then(|e| e.first_point()),
        }
    }

    pub fn last_point(&self) -> Option<Point> {
        match self {
            ExtrusionEntity::Path(p) => p.last_point(),
            ExtrusionEntity::MultiPath(mp) => mp.paths.last().and_then(|p| p.last_point()),
            ExtrusionEntity::Loop(l) => l.first_point(),
            ExtrusionEntity::Collection(c) => c.entities.last().and_then(|e| e.last_point()),
        }
    }

    /// Whether the entity can be printed in either direction.
    pub fn can_reverse(&self) -> bool {
        matches!(self, ExtrusionEntity::Path(_) | ExtrusionEntity::MultiPath(_))
    }

    pub fn reverse(&mut self) {
        match self {
            ExtrusionEntity::Path(p) => p.reverse(),
            ExtrusionEntity::MultiPath(mp) => mp.reverse(),
            ExtrusionEntity::Loop(_) => {}
            ExtrusionEntity::Collection(c) => {
                c.entities.reverse();
                for e in &mut c.entities {
                    e.reverse();
                }
            }
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut bb = BoundingBox::new();
        self.visit_paths(&mut |p| bb.merge(&p.polyline.bounding_box()));
        bb
    }

    /// Flatten nested collections into leaf entities, preserving order.
    pub fn flatten_into(&self, out: &mut Vec<ExtrusionEntity>) {
        match self {
            ExtrusionEntity::Collection(c) => {
                for e in &c.entities {
                    e.flatten_into(out);
                }
            }
            other => out.push(other.clone()),
        }
    }

    /// Call `f` for every path in the entity.
    pub fn visit_paths<F: FnMut(&ExtrusionPath)>(&self, f: &mut F) {
        match self {
            ExtrusionEntity::Path(p) => f(p),
            ExtrusionEntity::MultiPath(mp) => mp.paths.iter().for_each(|p| f(p)),
            ExtrusionEntity::Loop(l) => l.paths.iter().for_each(|p| f(p)),
            ExtrusionEntity::Collection(c) => {
                for e in &c.entities {
                    e.visit_paths(f);
                }
            }
        }
    }

    /// Check the entity is printable; the message names the offending path.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut result = Ok(());
        self.visit_paths(&mut |p| {
            if result.is_ok() {
                result = p.validate();
            }
        });
        if let ExtrusionEntity::Loop(l) = self {
            if l.paths.is_empty() {
                return Err("empty loop".into());
            }
        }
        result
    }
}

impl From<ExtrusionPath> for ExtrusionEntity {
    fn from(p: ExtrusionPath) -> Self {
        ExtrusionEntity::Path(p)
    }
}

impl From<ExtrusionLoop> for ExtrusionEntity {
    fn from(l: ExtrusionLoop) -> Self {
        ExtrusionEntity::Loop(l)
    }
}

impl From<ExtrusionMultiPath> for ExtrusionEntity {
    fn from(mp: ExtrusionMultiPath) -> Self {
        ExtrusionEntity::MultiPath(mp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polygon;

    fn square_loop() -> ExtrusionLoop {
        ExtrusionLoop::from_polygon(
            &Polygon::rectangle(0.0, 0.0, 10.0, 10.0),
            ExtrusionRole::ExternalPerimeter,
            0.45,
            0.2,
        )
    }

    #[test]
    fn test_extrusion_role_classification() {
        assert!(ExtrusionRole::ExternalPerimeter.is_perimeter());
        assert!(ExtrusionRole::InternalInfill.is_infill());
        assert!(!ExtrusionRole::InternalInfill.is_solid_infill());
        assert!(ExtrusionRole::BridgeInfill.is_solid_infill());
        assert!(ExtrusionRole::SupportMaterialInterface.is_support());
        assert!(!ExtrusionRole::Skirt.is_perimeter());
    }

    #[test]
    fn test_loop_length_and_points() {
        let l = square_loop();
        assert!((l.length() - 40.0).abs() < 1e-6);
        assert_eq!(l.points().len(), 4);
        assert_eq!(l.role(), ExtrusionRole::ExternalPerimeter);
    }

    #[test]
    fn test_collection_role_mixed() {
        let a = ExtrusionPath::new(
            Polyline::from_mm(&[(0.0, 0.0), (1.0, 0.0)]),
            ExtrusionRole::InternalInfill,
            0.45,
            0.2,
        );
        let mut b = a.clone();
        b.role = ExtrusionRole::GapFill;
        let c = ExtrusionEntity::Collection(ExtrusionEntityCollection::new(vec![
            a.clone().into(),
            a.into(),
        ]));
        assert_eq!(c.role(), ExtrusionRole::InternalInfill);

        let mixed = ExtrusionEntity::Collection(ExtrusionEntityCollection::new(vec![
            b.into(),
            c,
        ]));
        assert_eq!(mixed.role(), ExtrusionRole::Mixed);

        let mut flat = Vec::new();
        mixed.flatten_into(&mut flat);
        assert_eq!(flat.len(), 3);
    }

    #[test]
    fn test_validate_rejects_degenerate_path() {
        let bad = ExtrusionEntity::Path(ExtrusionPath::new(
            Polyline::from_mm(&[(0.0, 0.0)]),
            ExtrusionRole::Perimeter,
            0.45,
            0.2,
        ));
        let err = bad.validate().unwrap_err();
        assert!(err.contains("1 point"));
        assert!(ExtrusionEntity::Loop(square_loop()).validate().is_ok());
    }

    #[test]
    fn test_reverse_path_swaps_endpoints() {
        let mut e = ExtrusionEntity::Path(ExtrusionPath::new(
            Polyline::from_mm(&[(0.0, 0.0), (5.0, 0.0)]),
            ExtrusionRole::SolidInfill,
            0.45,
            0.2,
        ));
        e.reverse();
        assert_eq!(e.first_point(), Some(Point::new_scale(5.0, 0.0)));
        assert!(e.can_reverse());
    }
}
