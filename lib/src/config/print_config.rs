//! Print-wide configuration.
//!
//! Everything the export stages read is carried explicitly in [`PrintConfig`]
//! and passed by reference; there is no global preset state. Configurations
//! round-trip through JSON with `serde_json`, missing keys falling back to the
//! defaults below.

use crate::{CoordF, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ============================================================================
// Enums
// ============================================================================

/// G-code dialect of the target firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GCodeFlavor {
    #[default]
    Marlin,
    Klipper,
    RepRap,
}

impl fmt::Display for GCodeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GCodeFlavor::Marlin => write!(f, "marlin"),
            GCodeFlavor::Klipper => write!(f, "klipper"),
            GCodeFlavor::RepRap => write!(f, "reprap"),
        }
    }
}

/// Where closed loops start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeamPosition {
    /// Same vertex direction on every layer (the rearmost-left corner of the loop).
    #[default]
    Aligned,
    /// The vertex with the largest Y.
    Rear,
}

/// Whether objects are printed layer by layer together or one after another.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrintSequence {
    #[default]
    ByLayer,
    ByObject,
}

/// Timelapse capture mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimelapseType {
    #[default]
    None,
    /// Head stays where it is; snapshot per layer.
    Traditional,
    /// Head parks on the wipe tower for every snapshot.
    Smooth,
}

// ============================================================================
// Sub-configurations
// ============================================================================

/// Per-extruder (per-filament) settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtruderConfig {
    /// Nozzle diameter (mm).
    pub nozzle_diameter: CoordF,
    /// Filament diameter (mm).
    pub filament_diameter: CoordF,
    /// Filament density (g/cm³).
    pub filament_density: CoordF,
    /// Nozzle temperature (°C).
    pub temperature: u32,
    /// Nozzle temperature on the first layer (°C).
    pub first_layer_temperature: u32,
    /// Retraction length (mm of filament).
    pub retract_length: CoordF,
    /// Retraction length before a tool change (mm of filament).
    pub retract_length_toolchange: CoordF,
    /// Retraction speed (mm/s).
    pub retract_speed: CoordF,
    /// Deretraction speed (mm/s, 0 = same as retraction).
    pub deretract_speed: CoordF,
    /// Travels shorter than this do not retract (mm).
    pub retract_before_travel: CoordF,
    /// Z hop applied on retraction (mm).
    pub z_hop: CoordF,
    /// Move back along the last extrusion while retracting.
    pub wipe: bool,
    /// Length of the wipe move (mm).
    pub wipe_distance: CoordF,
    /// Share of the retraction done before the wipe starts (0.0 - 1.0).
    pub retract_before_wipe: CoordF,
    /// Temperature offset applied to this extruder while it is idle (°C).
    pub standby_temperature_delta: i32,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        Self {
            nozzle_diameter: 0.4,
            filament_diameter: 1.75,
            filament_density: 1.24,
            temperature: 210,
            first_layer_temperature: 215,
            retract_length: 0.8,
            retract_length_toolchange: 2.0,
            retract_speed: 35.0,
            deretract_speed: 0.0,
            retract_before_travel: 2.0,
            z_hop: 0.0,
            wipe: false,
            wipe_distance: 1.0,
            retract_before_wipe: 0.7,
            standby_temperature_delta: -5,
        }
    }
}

impl ExtruderConfig {
    /// Filament cross section (mm²).
    pub fn filament_area(&self) -> CoordF {
        let r = self.filament_diameter / 2.0;
        std::f64::consts::PI * r * r
    }

    pub fn effective_deretract_speed(&self) -> CoordF {
        if self.deretract_speed > 0.0 {
            self.deretract_speed
        } else {
            self.retract_speed
        }
    }

    /// Idle temperature used by ooze prevention, based on the active one.
    pub fn standby_temperature(&self, active: u32) -> u32 {
        (i64::from(active) + i64::from(self.standby_temperature_delta)).clamp(0, i64::from(u32::MAX)) as u32
    }
}

/// Wipe (prime) tower placement and purge settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WipeTowerConfig {
    pub enabled: bool,
    /// Tower origin X (mm).
    pub x: CoordF,
    /// Tower origin Y (mm).
    pub y: CoordF,
    /// Tower width (mm).
    pub width: CoordF,
    /// Rotation around the tower origin (degrees).
    pub rotation_angle: CoordF,
    /// Brim around the first tower layer (mm).
    pub brim_width: CoordF,
    /// Purge volume per tool change when no matrix entry applies (mm³).
    pub purge_volume: CoordF,
    /// Row-major N×N purge volume matrix, `from * N + to` (mm³). Empty = uniform.
    pub flush_volumes_matrix: Vec<CoordF>,
    /// Scales every purge volume.
    pub flush_multiplier: CoordF,
    /// Volume extruded on the tower when priming each extruder (mm³).
    pub prime_volume: CoordF,
    /// Print speed on the tower (mm/s).
    pub speed: CoordF,
}

impl Default for WipeTowerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            x: 170.0,
            y: 125.0,
            width: 60.0,
            rotation_angle: 0.0,
            brim_width: 2.0,
            purge_volume: 140.0,
            flush_volumes_matrix: Vec::new(),
            flush_multiplier: 1.0,
            prime_volume: 45.0,
            speed: 80.0,
        }
    }
}

/// Cooling buffer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolingConfig {
    pub enabled: bool,
    /// Layers printing faster than this are slowed down (s).
    pub min_layer_time: CoordF,
    /// Slowdown never goes below this speed (mm/s).
    pub min_print_speed: CoordF,
    /// Fan turns on for layers faster than this (s).
    pub fan_below_layer_time: CoordF,
    /// Full fan for layers faster than this (s).
    pub full_fan_speed_layer_time: CoordF,
    /// Fan speed range (0.0 - 1.0).
    pub fan_min_speed: CoordF,
    pub fan_max_speed: CoordF,
    /// Fan stays off for the first N layers.
    pub disable_fan_first_layers: u32,
}

impl Default for CoolingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_layer_time: 5.0,
            min_print_speed: 10.0,
            fan_below_layer_time: 60.0,
            full_fan_speed_layer_time: 15.0,
            fan_min_speed: 0.35,
            fan_max_speed: 1.0,
            disable_fan_first_layers: 1,
        }
    }
}

/// Producer/consumer pipeline tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rendering threads (0 = available parallelism).
    pub workers: usize,
    /// Rendered layers allowed in flight between workers and the writer.
    pub queue_capacity: usize,
    /// Layers handed to the worker pool at once.
    pub window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 16,
            window: 8,
        }
    }
}

impl PipelineConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Custom G-code scripts. `{name}` / `[name]` placeholders are substituted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GCodeTemplates {
    pub machine_start_gcode: String,
    pub machine_end_gcode: String,
    pub before_layer_change_gcode: String,
    pub layer_change_gcode: String,
    pub change_filament_gcode: String,
    pub color_change_gcode: String,
    pub pause_gcode: String,
    pub template_custom_gcode: String,
}

// ============================================================================
// Print Config
// ============================================================================

/// Settings shared by the whole print.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintConfig {
    pub gcode_flavor: GCodeFlavor,
    /// One entry per configured extruder/filament.
    pub extruders: Vec<ExtruderConfig>,
    /// Extruder printing first (1-based, 0 = first one used).
    pub start_filament: u32,
    /// Explicit first layer extruder order (1-based).
    pub first_layer_print_sequence: Vec<u32>,
    /// Several filaments sharing one nozzle.
    pub single_extruder_multi_material: bool,
    pub print_sequence: PrintSequence,
    pub spiral_vase: bool,
    pub timelapse_type: TimelapseType,
    /// Print infill before perimeters within an island.
    pub infill_first: bool,
    /// Emit object labels for firmware object cancellation.
    pub label_objects: bool,
    pub avoid_crossing_perimeters: bool,
    /// Give up on a detour longer than this multiple of the direct distance.
    pub max_travel_detour_ratio: CoordF,
    /// Skip retraction for travels that stay inside one island.
    pub only_retract_when_crossing_perimeters: bool,
    /// Drop idle extruders to their standby temperature on tool changes.
    pub ooze_prevention: bool,
    /// Travel speed (mm/s).
    pub travel_speed: CoordF,
    /// Z travel speed (mm/s).
    pub travel_speed_z: CoordF,
    /// Speed cap on the first layer (mm/s).
    pub first_layer_speed: CoordF,
    /// Acceleration applied to moves with no role-specific value (mm/s²).
    pub default_acceleration: u32,
    pub travel_acceleration: u32,
    pub first_layer_acceleration: u32,
    /// Ramp speed changes between adjacent paths instead of stepping.
    pub smooth_speed_discontinuity: bool,
    /// Length of the ramp at each speed step (mm).
    pub speed_ramp_length: CoordF,
    pub bed_temperature: u32,
    pub first_layer_bed_temperature: u32,
    /// Seconds per move overhead used by the layer time estimate.
    pub machine_time_overhead: CoordF,
    pub templates: GCodeTemplates,
    pub wipe_tower: WipeTowerConfig,
    pub cooling: CoolingConfig,
    pub pipeline: PipelineConfig,
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            gcode_flavor: GCodeFlavor::Marlin,
            extruders: vec![ExtruderConfig::default()],
            start_filament: 0,
            first_layer_print_sequence: Vec::new(),
            single_extruder_multi_material: false,
            print_sequence: PrintSequence::ByLayer,
            spiral_vase: false,
            timelapse_type: TimelapseType::None,
            infill_first: false,
            label_objects: true,
            avoid_crossing_perimeters: false,
            max_travel_detour_ratio: 2.0,
            only_retract_when_crossing_perimeters: true,
            ooze_prevention: false,
            travel_speed: 150.0,
            travel_speed_z: 10.0,
            first_layer_speed: 30.0,
            default_acceleration: 1000,
            travel_acceleration: 1500,
            first_layer_acceleration: 500,
            smooth_speed_discontinuity: true,
            speed_ramp_length: 1.0,
            bed_temperature: 60,
            first_layer_bed_temperature: 65,
            machine_time_overhead: 0.0,
            templates: GCodeTemplates::default(),
            wipe_tower: WipeTowerConfig::default(),
            cooling: CoolingConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl PrintConfig {
    /// Create a config with `count` identical extruders.
    pub fn with_extruders(count: usize) -> Self {
        Self {
            extruders: vec![ExtruderConfig::default(); count.max(1)],
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PrintConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn extruder_count(&self) -> usize {
        self.extruders.len()
    }

    /// Settings of a zero-based extruder; out of range falls back to the last one.
    pub fn extruder(&self, idx: usize) -> &ExtruderConfig {
        static FALLBACK: std::sync::OnceLock<ExtruderConfig> = std::sync::OnceLock::new();
        self.extruders
            .get(idx)
            .or_else(|| self.extruders.last())
            .unwrap_or_else(|| FALLBACK.get_or_init(ExtruderConfig::default))
    }

    /// A wipe tower is only built when objects are printed layer by layer.
    pub fn has_wipe_tower(&self) -> bool {
        self.wipe_tower.enabled && self.print_sequence == PrintSequence::ByLayer
    }

    /// Purge volume for a switch between two zero-based extruders (mm³).
    pub fn flush_volume(&self, from: usize, to: usize) -> CoordF {
        if from == to {
            return 0.0;
        }
        let n = self.extruders.len();
        let matrix = &self.wipe_tower.flush_volumes_matrix;
        let base = if matrix.len() >= n * n && from < n && to < n {
            matrix[from * n + to]
        } else {
            self.wipe_tower.purge_volume
        };
        base * self.wipe_tower.flush_multiplier
    }

    /// Check cross references and value ranges before any output is produced.
    pub fn validate(&self) -> Result<()> {
        let n = self.extruders.len();
        if n == 0 {
            return Err(Error::Config("no extruders configured".into()));
        }
        for (i, e) in self.extruders.iter().enumerate() {
            if e.nozzle_diameter <= 0.0 {
                return Err(Error::Config(format!(
                    "extruder {} has nozzle diameter {}",
                    i + 1,
                    e.nozzle_diameter
                )));
            }
            if e.filament_diameter <= 0.0 {
                return Err(Error::Config(format!(
                    "extruder {} has filament diameter {}",
                    i + 1,
                    e.filament_diameter
                )));
            }
            if e.retract_length < 0.0 || e.retract_speed <= 0.0 {
                return Err(Error::Config(format!(
                    "extruder {} has invalid retraction settings",
                    i + 1
                )));
            }
            if !(0.0..=1.0).contains(&e.retract_before_wipe) || e.wipe_distance < 0.0 {
                return Err(Error::Config(format!(
                    "extruder {} has invalid wipe settings",
                    i + 1
                )));
            }
        }
        if self.start_filament as usize > n {
            return Err(Error::Config(format!(
                "start filament {} is not configured ({} extruder(s))",
                self.start_filament, n
            )));
        }
        for &id in &self.first_layer_print_sequence {
            if id == 0 || id as usize > n {
                return Err(Error::Config(format!(
                    "first layer print sequence references extruder {} ({} configured)",
                    id, n
                )));
            }
        }
        let matrix_len = self.wipe_tower.flush_volumes_matrix.len();
        if matrix_len != 0 && matrix_len != n * n {
            return Err(Error::Config(format!(
                "flush volume matrix has {} entries, expected {}",
                matrix_len,
                n * n
            )));
        }
        if self.wipe_tower.enabled && self.wipe_tower.width <= 0.0 {
            return Err(Error::Config("wipe tower width must be positive".into()));
        }
        if self.ooze_prevention && self.has_wipe_tower() {
            return Err(Error::Config(
                "ooze prevention cannot be combined with a wipe tower".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 || self.pipeline.window == 0 {
            return Err(Error::Config(
                "pipeline queue capacity and window must be at least 1".into(),
            ));
        }
        if self.travel_speed <= 0.0 {
            return Err(Error::Config("travel speed must be positive".into()));
        }
        Ok(())
    }
}
