//! Layer/extruder scheduling and G-code export for multi-material printing.
//!
//! The crate takes a sliced print (per-object layers whose regions are already
//! split into perimeter, infill and support extrusions) and turns it into a
//! G-code stream:
//!
//! - [`gcode::layers`] pairs object and support layers of equal height and
//!   merges them across objects into per-height layer groups
//! - [`gcode::tool_ordering`] decides the extruder sequence of every layer
//! - [`gcode::wipe_tower`] plans the purge tower and hands out its G-code
//! - [`gcode::object_by_extruder`] sorts instances and islands per extruder
//! - [`gcode::emitter`] renders paths and stitches them with travels,
//!   retractions and tool changes
//! - [`gcode::pipeline`] overlaps rendering on worker threads with ordered,
//!   single-threaded emission, filtering and file output
//!
//! # Example
//!
//! ```ignore
//! use slicer_gcode::config::PrintConfig;
//! use slicer_gcode::gcode::GCodeExporter;
//!
//! let exporter = GCodeExporter::new(PrintConfig::default());
//! let outcome = exporter.do_export(&print, "out.gcode", None)?;
//! ```

pub mod config;
pub mod extrusion;
pub mod gcode;
pub mod geometry;
pub mod print;
pub mod travel;

pub use extrusion::{
    ExtrusionEntity, ExtrusionLoop, ExtrusionMultiPath, ExtrusionPath, ExtrusionRole,
};

/// Scaled integer coordinate (1 unit = 1 nanometer).
pub type Coord = i64;

/// Unscaled floating point coordinate in millimeters.
pub type CoordF = f64;

/// Number of scaled units per millimeter.
pub const SCALING_FACTOR: f64 = 1_000_000.0;

/// Tolerance used when comparing print heights (mm).
pub const EPSILON: f64 = 1e-4;

/// Convert millimeters to scaled units.
#[inline]
pub fn scale(v: CoordF) -> Coord {
    (v * SCALING_FACTOR).round() as Coord
}

/// Convert scaled units to millimeters.
#[inline]
pub fn unscale(v: Coord) -> CoordF {
    v as CoordF / SCALING_FACTOR
}

/// Errors that abort an export.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing extruder mapping, invalid filament/tool cross reference, bad settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed geometry handed over by the slicing stages.
    #[error("invalid geometry in object '{object}': {message}")]
    Geometry { object: String, message: String },

    /// A custom G-code template could not be parsed at all.
    #[error("template '{name}' cannot be processed: {message}")]
    Template { name: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker or the writer thread went away unexpectedly.
    #[error("pipeline failure: {0}")]
    Pipeline(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
