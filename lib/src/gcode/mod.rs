//! G-code generation.
//!
//! Scheduling ([`layers`], [`tool_ordering`], [`wipe_tower`],
//! [`object_by_extruder`]), emission ([`emitter`], [`writer`]), the layer
//! [`pipeline`] with its post-filters ([`cooling`], [`spiral_vase`]) and the
//! [`export`] driver that ties them together.

pub mod cooling;
pub mod emitter;
pub mod export;
pub mod layers;
pub mod object_by_extruder;
pub mod output;
pub mod pipeline;
pub mod placeholder;
pub mod reader;
pub mod spiral_vase;
pub mod tool_ordering;
pub mod wipe_tower;
pub mod writer;

pub use cooling::CoolingBuffer;
pub use emitter::{render_layer, EmitterPhase, EmitterState, LayerResult, RenderedLayer};
pub use export::{ExportOutcome, GCodeExporter, ObjectExport};
pub use layers::{collect_layers_to_print, collect_layers_to_print_for_print, LayerGroup, LayerToPrint};
pub use object_by_extruder::ObjectByExtruder;
pub use output::{GCodeOutputStream, GCodeProcessorResult};
pub use pipeline::PipelineStatus;
pub use placeholder::{PlaceholderParser, TemplateWarning};
pub use spiral_vase::SpiralVase;
pub use tool_ordering::{LayerTools, ToolOrdering};
pub use wipe_tower::{WipeTower, WipeTowerIntegration};
pub use writer::GCodeWriter;
