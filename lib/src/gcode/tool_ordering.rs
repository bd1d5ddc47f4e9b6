//! Tool Ordering Module for Multi-Extruder Coordination
//!
//! Decides, for every layer group, which extruders print and in which order.
//!
//! ## Key Concepts
//!
//! - **LayerTools**: Per-layer information about required extruders and toolchanges
//! - **Extruder Order**: The sequence of extruders within a layer
//! - **Don't care**: Support printed with whatever extruder is active (id 0)
//! - **Wipe Tower Partitions**: Number of wipe tower segments needed per layer
//!
//! ## Algorithm Overview
//!
//! 1. Collect all extruders needed per layer from objects and supports
//! 2. Order each layer: the previous layer's last extruder first when it is
//!    needed again, the rest ascending; the first layer starts with the start
//!    filament or follows an explicit first layer sequence
//! 3. Resolve "don't care" extruders to the active one
//! 4. Calculate wipe tower partition requirements
//! 5. Redirect purging into sparse infill where regions allow it
//! 6. Assign custom G-codes (color changes, pauses) to layers
//!
//! The heuristic is local: it only looks one layer back and does not search
//! for a globally minimal number of tool changes.

use std::collections::HashMap;

use crate::config::{PrintConfig, PrintRegionConfig, TimelapseType};
use crate::gcode::layers::{collect_layers_for_object, collect_layers_to_print_for_print, LayerGroup};
use crate::print::{CustomGCodeItem, CustomGCodeType, Print, PrintObject};
use crate::{CoordF, Error, ExtrusionEntity, ExtrusionRole, Result, EPSILON};
use tracing::{debug, warn};

// ============================================================================
// Extruder assignment
// ============================================================================

/// 1-based extruder printing an object entity (never "don't care").
pub(crate) fn entity_extruder(region: &PrintRegionConfig, entity: &ExtrusionEntity) -> u32 {
    region.extruder_for_role(entity.role())
}

/// 1-based extruder printing a support entity, 0 when any extruder will do.
pub(crate) fn support_extruder(object: &PrintObject, entity: &ExtrusionEntity) -> u32 {
    if entity.role() == ExtrusionRole::SupportMaterialInterface {
        object.config.support_interface_filament
    } else {
        object.config.support_filament
    }
}

// ============================================================================
// Wiping Extrusions
// ============================================================================

/// Identifies one sparse infill entity of one object copy within a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// Object index within the print.
    pub object: usize,
    /// Instance index within the object.
    pub instance: usize,
    /// Index into the layer's regions.
    pub region: usize,
    /// Index into the region's fills.
    pub entity: usize,
}

/// Tracks which extrusions are used for wiping during tool changes
#[derive(Debug, Clone, Default)]
pub struct WipingExtrusions {
    /// Entity -> zero-based extruder printing it instead of its own.
    overrides: HashMap<EntityKey, u32>,
    /// Purge volume left for the tower, keyed by the new extruder (mm³).
    tower_purge: HashMap<u32, CoordF>,
}

impl WipingExtrusions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any extrusions have been overridden
    pub fn is_anything_overridden(&self) -> bool {
        !self.overrides.is_empty()
    }

    pub fn set_extruder_override(&mut self, key: EntityKey, extruder: u32) {
        self.overrides.insert(key, extruder);
    }

    /// Zero-based extruder an entity was moved to, if any.
    pub fn extruder_override(&self, key: &EntityKey) -> Option<u32> {
        self.overrides.get(key).copied()
    }

    pub fn is_entity_overridden(&self, key: &EntityKey) -> bool {
        self.overrides.contains_key(key)
    }

    /// Purge volume still to be done on the tower when switching to `new_extruder`.
    pub fn tower_purge_volume(&self, new_extruder: u32) -> Option<CoordF> {
        self.tower_purge.get(&new_extruder).copied()
    }

    fn set_tower_purge_volume(&mut self, new_extruder: u32, volume: CoordF) {
        self.tower_purge.insert(new_extruder, volume);
    }
}

// ============================================================================
// Layer Tools
// ============================================================================

/// Per-layer information about extruders and toolchanges
#[derive(Debug, Clone)]
pub struct LayerTools {
    /// Print Z height of this layer
    pub print_z: CoordF,
    /// Whether this layer has object extrusions
    pub has_object: bool,
    /// Whether this layer has support extrusions
    pub has_support: bool,
    /// Zero-based extruder IDs in print order; each appears once
    pub extruders: Vec<u32>,
    /// Whether wipe tower is active at this layer
    pub has_wipe_tower: bool,
    /// Number of wipe tower partitions at this layer
    pub wipe_tower_partitions: usize,
    /// Wipe tower layer height
    pub wipe_tower_layer_height: CoordF,
    /// Custom G-code to be performed before this layer
    pub custom_gcode: Option<CustomGCodeItem>,
    /// Wiping extrusions for this layer
    wiping_extrusions: WipingExtrusions,
}

impl LayerTools {
    /// Create new layer tools for a given Z height
    pub fn new(print_z: CoordF) -> Self {
        Self {
            print_z,
            has_object: false,
            has_support: false,
            extruders: Vec::new(),
            has_wipe_tower: false,
            wipe_tower_partitions: 0,
            wipe_tower_layer_height: 0.0,
            custom_gcode: None,
            wiping_extrusions: WipingExtrusions::new(),
        }
    }

    /// Check if extruder `a` comes before extruder `b` in the order
    pub fn is_extruder_order(&self, a: u32, b: u32) -> bool {
        if a == b {
            return false;
        }
        for &extruder in &self.extruders {
            if extruder == a {
                return true;
            }
            if extruder == b {
                return false;
            }
        }
        false
    }

    /// Check if this layer uses a specific extruder
    pub fn has_extruder(&self, extruder: u32) -> bool {
        self.extruders.contains(&extruder)
    }

    /// Get reference to wiping extrusions
    pub fn wiping_extrusions(&self) -> &WipingExtrusions {
        &self.wiping_extrusions
    }

    /// `(old, new)` pairs of the tool changes in this layer, given the
    /// extruder active when the layer starts.
    pub fn tool_changes(&self, mut current: Option<u32>) -> Vec<(u32, u32)> {
        let mut changes = Vec::new();
        for &e in &self.extruders {
            if let Some(old) = current {
                if old != e {
                    changes.push((old, e));
                }
            }
            current = Some(e);
        }
        changes
    }
}

// ============================================================================
// Tool Ordering
// ============================================================================

/// Per-layer extruder schedule of a print (or of one object when printing
/// objects one after another).
#[derive(Debug, Clone, Default)]
pub struct ToolOrdering {
    /// Per-layer tool information
    layer_tools: Vec<LayerTools>,
    /// First printing extruder (0-based)
    first_printing_extruder: Option<u32>,
    /// Last printing extruder (0-based)
    last_printing_extruder: Option<u32>,
    /// All extruders used in the print (0-based, ascending)
    all_printing_extruders: Vec<u32>,
}

impl ToolOrdering {
    /// Schedule every layer of a print printed layer by layer.
    pub fn for_print(print: &Print, config: &PrintConfig, first_extruder: Option<u32>) -> Result<Self> {
        let groups = collect_layers_to_print_for_print(print);
        Self::for_layer_groups(&groups, config, first_extruder, &print.custom_gcode_per_print_z)
    }

    /// Schedule one object for sequential printing.
    pub fn for_object(
        object: &PrintObject,
        config: &PrintConfig,
        first_extruder: Option<u32>,
        custom_gcodes: &[CustomGCodeItem],
    ) -> Result<Self> {
        let groups = collect_layers_for_object(object);
        Self::for_layer_groups(&groups, config, first_extruder, custom_gcodes)
    }

    /// Schedule already collected layer groups. `first_extruder` is the
    /// zero-based extruder active before the first layer, if any.
    pub fn for_layer_groups(
        groups: &[LayerGroup<'_>],
        config: &PrintConfig,
        first_extruder: Option<u32>,
        custom_gcodes: &[CustomGCodeItem],
    ) -> Result<Self> {
        let mut ordering = Self {
            layer_tools: groups.iter().map(|g| LayerTools::new(g.print_z)).collect(),
            ..Default::default()
        };
        ordering.collect_extruders(groups, config)?;
        ordering.handle_dontcare_extruders(config, first_extruder);
        ordering.collect_extruder_statistics();
        ordering.fill_wipe_tower_partitions(config);
        ordering.mark_wiping_extrusions(groups, config, first_extruder);
        ordering.assign_custom_gcodes(custom_gcodes, config.extruder_count());

        debug!(
            layers = ordering.layer_tools.len(),
            extruders = ?ordering.all_printing_extruders,
            tool_changes = ordering.tool_change_count(),
            "tool ordering computed"
        );
        Ok(ordering)
    }

    /// Gather the 1-based extruders (0 = don't care) of every layer.
    fn collect_extruders(&mut self, groups: &[LayerGroup<'_>], config: &PrintConfig) -> Result<()> {
        let n = config.extruder_count() as u32;
        let check = |object: &PrintObject, id: u32, what: &str| -> Result<u32> {
            if id > n {
                Err(Error::Config(format!(
                    "object '{}' {} uses extruder {} but only {} configured",
                    object.name(),
                    what,
                    id,
                    n
                )))
            } else {
                Ok(id)
            }
        };

        for (lt, group) in self.layer_tools.iter_mut().zip(groups) {
            for layer in &group.layers {
                let object = layer.object;
                if let Some(object_layer) = layer.object_layer {
                    for region in &object_layer.regions {
                        let region_config = object.region_config(region.region_id);
                        for entity in region.perimeters.iter().chain(region.fills.iter()) {
                            let id = check(object, entity_extruder(&region_config, entity), "region")?;
                            lt.extruders.push(id);
                            lt.has_object = true;
                        }
                    }
                }
                if let Some(support_layer) = layer.support_layer {
                    for entity in &support_layer.support_fills {
                        let id = check(object, support_extruder(object, entity), "support")?;
                        lt.extruders.push(id);
                        lt.has_support = true;
                    }
                }
            }
            lt.extruders.sort_unstable();
            lt.extruders.dedup();
        }
        Ok(())
    }

    /// Resolve "don't care" entries, order each layer and switch to zero-based ids.
    fn handle_dontcare_extruders(&mut self, config: &PrintConfig, first_extruder: Option<u32>) {
        // 1-based start extruder anchoring the first printed layer
        let start = first_extruder
            .map(|e| e + 1)
            .or_else(|| config.first_layer_print_sequence.first().copied())
            .or((config.start_filament > 0).then_some(config.start_filament));

        let mut last: Option<u32> = start;
        let mut first_layer = true;

        for lt in &mut self.layer_tools {
            if lt.extruders.is_empty() {
                continue;
            }
            let has_dontcare = lt.extruders.first() == Some(&0);
            lt.extruders.retain(|&e| e != 0);
            if lt.extruders.is_empty() && has_dontcare {
                lt.extruders.push(last.unwrap_or(1));
            }

            if first_layer && first_extruder.is_none() && !config.first_layer_print_sequence.is_empty() {
                let mut ordered: Vec<u32> = config
                    .first_layer_print_sequence
                    .iter()
                    .copied()
                    .filter(|e| lt.extruders.contains(e))
                    .collect();
                ordered.dedup();
                let rest: Vec<u32> = lt
                    .extruders
                    .iter()
                    .copied()
                    .filter(|e| !ordered.contains(e))
                    .collect();
                ordered.extend(rest);
                lt.extruders = ordered;
            } else if let Some(prev) = last {
                if let Some(pos) = lt.extruders.iter().position(|&e| e == prev) {
                    let e = lt.extruders.remove(pos);
                    lt.extruders.insert(0, e);
                }
            }

            first_layer = false;
            last = lt.extruders.last().copied();
        }

        for lt in &mut self.layer_tools {
            for e in &mut lt.extruders {
                *e -= 1;
            }
        }
    }

    /// Collect statistics about all extruders used
    fn collect_extruder_statistics(&mut self) {
        self.first_printing_extruder = self
            .layer_tools
            .iter()
            .find_map(|lt| lt.extruders.first().copied());
        self.last_printing_extruder = self
            .layer_tools
            .iter()
            .rev()
            .find_map(|lt| lt.extruders.last().copied());

        let mut all: Vec<u32> = self
            .layer_tools
            .iter()
            .flat_map(|lt| lt.extruders.iter().copied())
            .collect();
        all.sort_unstable();
        all.dedup();
        self.all_printing_extruders = all;
    }

    /// Fill wipe tower partition requirements
    fn fill_wipe_tower_partitions(&mut self, config: &PrintConfig) {
        if self.layer_tools.is_empty()
            || !config.has_wipe_tower()
            || self.all_printing_extruders.len() < 2
        {
            return;
        }

        // Count tool changes per layer
        let mut last_extruder: Option<u32> = None;
        for lt in &mut self.layer_tools {
            lt.wipe_tower_partitions = lt.extruders.len();
            if !lt.extruders.is_empty() {
                if last_extruder.is_none() || last_extruder == Some(lt.extruders[0]) {
                    // First extruder matches last, no initial tool change needed
                    lt.wipe_tower_partitions = lt.wipe_tower_partitions.saturating_sub(1);
                }
                last_extruder = lt.extruders.last().copied();
            }
        }

        // Propagate partitions down (lower layers must support upper)
        for i in (0..self.layer_tools.len().saturating_sub(1)).rev() {
            let above = self.layer_tools[i + 1].wipe_tower_partitions;
            let lt = &mut self.layer_tools[i];
            lt.wipe_tower_partitions = lt.wipe_tower_partitions.max(above);
        }

        let smooth_timelapse = config.timelapse_type == TimelapseType::Smooth;
        for (i, lt) in self.layer_tools.iter_mut().enumerate() {
            lt.has_wipe_tower = i == 0
                || lt.wipe_tower_partitions > 0
                || (smooth_timelapse && lt.has_object);
        }

        // Calculate wipe tower layer heights
        let mut last_z = 0.0;
        for lt in &mut self.layer_tools {
            if lt.has_wipe_tower {
                lt.wipe_tower_layer_height = lt.print_z - last_z;
                last_z = lt.print_z;
            }
        }
    }

    /// Purge into sparse infill of regions that allow it, reducing what is
    /// left for the tower.
    fn mark_wiping_extrusions(
        &mut self,
        groups: &[LayerGroup<'_>],
        config: &PrintConfig,
        first_extruder: Option<u32>,
    ) {
        if !config.has_wipe_tower() || self.all_printing_extruders.len() < 2 {
            return;
        }

        let mut current = first_extruder.or(self.first_printing_extruder);
        for (lt, group) in self.layer_tools.iter_mut().zip(groups) {
            let changes = lt.tool_changes(current);
            if let Some(&last) = lt.extruders.last() {
                current = Some(last);
            }
            if !lt.has_object {
                continue;
            }

            for (old, new) in changes {
                let mut remaining = config.flush_volume(old as usize, new as usize);

                'objects: for layer in &group.layers {
                    let (Some(object_layer), object) = (layer.object_layer, layer.object) else {
                        continue;
                    };
                    for instance in 0..object.instances().len() {
                        for (region_idx, region) in object_layer.regions.iter().enumerate() {
                            let region_config = object.region_config(region.region_id);
                            if !region_config.wipe_into_infill {
                                continue;
                            }
                            for (entity_idx, entity) in region.fills.iter().enumerate() {
                                if remaining <= 0.0 {
                                    break 'objects;
                                }
                                if entity.role() != ExtrusionRole::InternalInfill {
                                    continue;
                                }
                                let key = EntityKey {
                                    object: object.id(),
                                    instance,
                                    region: region_idx,
                                    entity: entity_idx,
                                };
                                if lt.wiping_extrusions.is_entity_overridden(&key) {
                                    continue;
                                }
                                // Already printed by the time `new` is active.
                                let natural = entity_extruder(&region_config, entity) - 1;
                                if lt.is_extruder_order(natural, new) {
                                    continue;
                                }
                                let mut volume = 0.0;
                                entity.visit_paths(&mut |p| volume += p.length() * p.mm3_per_mm);
                                lt.wiping_extrusions.set_extruder_override(key, new);
                                remaining -= volume;
                            }
                        }
                    }
                }
                lt.wiping_extrusions
                    .set_tower_purge_volume(new, remaining.max(0.0));
            }
        }
    }

    /// Attach color changes, pauses and custom scripts to the first layer at
    /// or above their height.
    fn assign_custom_gcodes(&mut self, custom_gcodes: &[CustomGCodeItem], num_extruders: usize) {
        if custom_gcodes.is_empty() || self.layer_tools.is_empty() {
            return;
        }

        // Which extruders print at or above each layer
        let mut printing_above: Vec<Vec<bool>> = vec![Vec::new(); self.layer_tools.len()];
        let mut current_above = vec![false; num_extruders];
        for (i, lt) in self.layer_tools.iter().enumerate().rev() {
            for &e in &lt.extruders {
                if let Some(slot) = current_above.get_mut(e as usize) {
                    *slot = true;
                }
            }
            printing_above[i] = current_above.clone();
        }

        let mut items: Vec<&CustomGCodeItem> = custom_gcodes.iter().collect();
        items.sort_by(|a, b| a.print_z.total_cmp(&b.print_z));

        for item in items {
            let Some(idx) = self
                .layer_tools
                .iter()
                .position(|lt| lt.print_z + EPSILON >= item.print_z)
            else {
                warn!(print_z = item.print_z, "custom G-code above the last layer ignored");
                continue;
            };

            if item.gcode_type == CustomGCodeType::ColorChange && item.extruder > 0 {
                let used_above = printing_above[idx]
                    .get(item.extruder as usize - 1)
                    .copied()
                    .unwrap_or(false);
                if !used_above {
                    debug!(
                        print_z = item.print_z,
                        extruder = item.extruder,
                        "color change skipped, extruder not used above"
                    );
                    continue;
                }
            }

            let lt = &mut self.layer_tools[idx];
            if lt.custom_gcode.is_some() {
                warn!(print_z = lt.print_z, "more than one custom G-code on a layer, keeping the first");
                continue;
            }
            lt.custom_gcode = Some(item.clone());
        }
    }

    /// Number of extruder switches across the whole schedule, starting from
    /// the first printing extruder.
    pub fn tool_change_count(&self) -> usize {
        self.tool_change_count_from(self.first_printing_extruder)
    }

    /// Number of extruder switches when `initial` is active before the first layer.
    pub fn tool_change_count_from(&self, initial: Option<u32>) -> usize {
        let mut current = initial;
        let mut count = 0;
        for lt in &self.layer_tools {
            count += lt.tool_changes(current).len();
            if let Some(&last) = lt.extruders.last() {
                current = Some(last);
            }
        }
        count
    }

    pub fn first_extruder(&self) -> Option<u32> {
        self.first_printing_extruder
    }

    pub fn last_extruder(&self) -> Option<u32> {
        self.last_printing_extruder
    }

    pub fn all_extruders(&self) -> &[u32] {
        &self.all_printing_extruders
    }

    pub fn layer_tools(&self) -> &[LayerTools] {
        &self.layer_tools
    }

    pub fn get_layer_tools(&self, index: usize) -> Option<&LayerTools> {
        self.layer_tools.get(index)
    }

    pub fn has_wipe_tower(&self) -> bool {
        self.layer_tools.iter().any(|lt| lt.has_wipe_tower)
    }

    pub fn len(&self) -> usize {
        self.layer_tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layer_tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerTools> {
        self.layer_tools.iter()
    }
}
