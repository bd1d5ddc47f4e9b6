//! Configuration module for print settings.
//!
//! Plain serde structs passed by reference into every stage; see
//! [`PrintConfig`] for the print-wide settings and [`PrintRegionConfig`] for
//! per-region extruder and speed choices.

mod print_config;
mod region_config;

pub use print_config::{
    CoolingConfig, ExtruderConfig, GCodeFlavor, GCodeTemplates, PipelineConfig, PrintConfig,
    PrintSequence, SeamPosition, TimelapseType, WipeTowerConfig,
};
pub use region_config::PrintRegionConfig;
