//! Print region configuration.
//!
//! A region is the part of an object sharing one set of extrusion settings:
//! which extruders print its walls and infill, how fast, and where loops
//! start. Extruder ids here are 1-based as in user-facing settings.

use crate::config::print_config::SeamPosition;
use crate::{CoordF, ExtrusionRole};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration for a specific print region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintRegionConfig {
    // === Extruders ===
    /// Wall extruder (1-based, 0 = extruder 1).
    pub extruder: u32,

    /// Sparse infill extruder (0 = same as wall extruder).
    pub infill_extruder: u32,

    /// Solid infill extruder (0 = same as sparse infill extruder).
    pub solid_infill_extruder: u32,

    // === Speeds (mm/s) ===
    pub external_perimeter_speed: CoordF,
    pub perimeter_speed: CoordF,

    /// Speed of the most severe overhang; milder ones interpolate towards
    /// the perimeter speed.
    pub overhang_speed: CoordF,

    /// Speed for closed loops shorter than `small_perimeter_threshold`.
    pub small_perimeter_speed: CoordF,

    /// Loop length below which the small perimeter speed applies (mm).
    pub small_perimeter_threshold: CoordF,

    pub infill_speed: CoordF,
    pub solid_infill_speed: CoordF,
    pub top_solid_infill_speed: CoordF,
    pub bridge_speed: CoordF,
    pub gap_fill_speed: CoordF,
    pub support_speed: CoordF,

    // === Accelerations (mm/s², 0 = print default) ===
    pub external_perimeter_acceleration: u32,
    pub perimeter_acceleration: u32,
    pub infill_acceleration: u32,

    // === Seam ===
    pub seam_position: SeamPosition,

    /// Distance the loop end stops short of the seam (mm).
    pub seam_gap: CoordF,

    // === Wiping ===
    /// Purge into this region's sparse infill after a tool change.
    pub wipe_into_infill: bool,
}

impl PrintRegionConfig {
    /// Create a new PrintRegionConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the wall extruder.
    pub fn extruder(mut self, extruder: u32) -> Self {
        self.extruder = extruder;
        self
    }

    /// Builder method: set the sparse infill extruder.
    pub fn infill_extruder(mut self, extruder: u32) -> Self {
        self.infill_extruder = extruder;
        self
    }

    /// Builder method: set the solid infill extruder.
    pub fn solid_infill_extruder(mut self, extruder: u32) -> Self {
        self.solid_infill_extruder = extruder;
        self
    }

    /// Builder method: set the seam position.
    pub fn seam_position(mut self, seam: SeamPosition) -> Self {
        self.seam_position = seam;
        self
    }

    /// Builder method: enable/disable wiping into infill.
    pub fn wipe_into_infill(mut self, enabled: bool) -> Self {
        self.wipe_into_infill = enabled;
        self
    }

    /// Get the effective wall extruder (1-based).
    pub fn effective_extruder(&self) -> u32 {
        self.extruder.max(1)
    }

    /// Get the effective infill extruder (falls back to wall extruder).
    pub fn effective_infill_extruder(&self) -> u32 {
        if self.infill_extruder > 0 {
            self.infill_extruder
        } else {
            self.effective_extruder()
        }
    }

    /// Get the effective solid infill extruder.
    pub fn effective_solid_infill_extruder(&self) -> u32 {
        if self.solid_infill_extruder > 0 {
            self.solid_infill_extruder
        } else {
            self.effective_infill_extruder()
        }
    }

    /// 1-based extruder printing entities of the given role.
    pub fn extruder_for_role(&self, role: ExtrusionRole) -> u32 {
        match role {
            ExtrusionRole::InternalInfill => self.effective_infill_extruder(),
            ExtrusionRole::SolidInfill
            | ExtrusionRole::TopSolidInfill
            | ExtrusionRole::BridgeInfill
            | ExtrusionRole::GapFill => self.effective_solid_infill_extruder(),
            _ => self.effective_extruder(),
        }
    }

    /// Base print speed for a role (mm/s).
    pub fn speed_for_role(&self, role: ExtrusionRole) -> CoordF {
        match role {
            ExtrusionRole::ExternalPerimeter => self.external_perimeter_speed,
            ExtrusionRole::Perimeter | ExtrusionRole::Skirt => self.perimeter_speed,
            ExtrusionRole::OverhangPerimeter => self.overhang_speed,
            ExtrusionRole::InternalInfill => self.infill_speed,
            ExtrusionRole::SolidInfill => self.solid_infill_speed,
            ExtrusionRole::TopSolidInfill => self.top_solid_infill_speed,
            ExtrusionRole::BridgeInfill => self.bridge_speed,
            ExtrusionRole::GapFill => self.gap_fill_speed,
            ExtrusionRole::SupportMaterial | ExtrusionRole::SupportMaterialInterface => {
                self.support_speed
            }
            ExtrusionRole::WipeTower | ExtrusionRole::Mixed | ExtrusionRole::None => {
                self.perimeter_speed
            }
        }
    }

    /// Acceleration for a role (0 = use the print default).
    pub fn acceleration_for_role(&self, role: ExtrusionRole) -> u32 {
        match role {
            ExtrusionRole::ExternalPerimeter => self.external_perimeter_acceleration,
            r if r.is_perimeter() => self.perimeter_acceleration,
            r if r.is_infill() => self.infill_acceleration,
            _ => 0,
        }
    }
}

impl Default for PrintRegionConfig {
    fn default() -> Self {
        Self {
            // Extruders
            extruder: 1,
            infill_extruder: 0,
            solid_infill_extruder: 0,

            // Speeds
            external_perimeter_speed: 25.0,
            perimeter_speed: 45.0,
            overhang_speed: 10.0,
            small_perimeter_speed: 25.0,
            small_perimeter_threshold: 20.0,
            infill_speed: 80.0,
            solid_infill_speed: 40.0,
            top_solid_infill_speed: 30.0,
            bridge_speed: 25.0,
            gap_fill_speed: 20.0,
            support_speed: 60.0,

            // Accelerations
            external_perimeter_acceleration: 500,
            perimeter_acceleration: 1000,
            infill_acceleration: 0,

            // Seam
            seam_position: SeamPosition::Aligned,
            seam_gap: 0.0,

            // Wiping
            wipe_into_infill: false,
        }
    }
}

impl fmt::Display for PrintRegionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PrintRegionConfig(walls=T{}, infill=T{}, solid=T{})",
            self.effective_extruder(),
            self.effective_infill_extruder(),
            self.effective_solid_infill_extruder()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_region_config_default() {
        let config = PrintRegionConfig::default();
        assert_eq!(config.extruder, 1);
        assert_eq!(config.seam_position, SeamPosition::Aligned);
        assert!(!config.wipe_into_infill);
    }

    #[test]
    fn test_print_region_config_builder() {
        let config = PrintRegionConfig::new()
            .extruder(2)
            .infill_extruder(3)
            .seam_position(SeamPosition::Rear)
            .wipe_into_infill(true);

        assert_eq!(config.extruder, 2);
        assert_eq!(config.infill_extruder, 3);
        assert_eq!(config.seam_position, SeamPosition::Rear);
        assert!(config.wipe_into_infill);
    }

    #[test]
    fn test_effective_extruders() {
        let mut config = PrintRegionConfig::default();
        config.extruder = 0;
        assert_eq!(config.effective_extruder(), 1);
        assert_eq!(config.effective_infill_extruder(), 1);
        assert_eq!(config.effective_solid_infill_extruder(), 1);

        config.infill_extruder = 2;
        assert_eq!(config.effective_infill_extruder(), 2);
        assert_eq!(config.effective_solid_infill_extruder(), 2);

        config.solid_infill_extruder = 3;
        assert_eq!(config.effective_solid_infill_extruder(), 3);
    }

    #[test]
    fn test_extruder_for_role() {
        let config = PrintRegionConfig::new()
            .extruder(1)
            .infill_extruder(2)
            .solid_infill_extruder(3);
        assert_eq!(config.extruder_for_role(ExtrusionRole::ExternalPerimeter), 1);
        assert_eq!(config.extruder_for_role(ExtrusionRole::InternalInfill), 2);
        assert_eq!(config.extruder_for_role(ExtrusionRole::TopSolidInfill), 3);
    }

    #[test]
    fn test_speed_for_role() {
        let config = PrintRegionConfig::default();
        assert_eq!(config.speed_for_role(ExtrusionRole::ExternalPerimeter), 25.0);
        assert_eq!(config.speed_for_role(ExtrusionRole::InternalInfill), 80.0);
        assert_eq!(config.acceleration_for_role(ExtrusionRole::Perimeter), 1000);
        assert_eq!(config.acceleration_for_role(ExtrusionRole::SupportMaterial), 0);
    }
}
