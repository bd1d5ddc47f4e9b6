//! Per-layer visitation order of objects, instances and islands.
//!
//! For one scheduled layer the sorter turns the extruder order of the
//! [`LayerTools`] into a flat list of [`ObjectByExtruder`] records:
//!
//! - all records of one extruder are contiguous, in the layer's extruder order
//! - entities redirected into infill for purging come first in the block of
//!   the extruder they purge, and are skipped in their own extruder's block
//! - instances follow model order
//! - islands of one record are chained nearest-next by bounding box centre,
//!   starting from where the previous record ended
//!
//! The records only borrow the layer's entities.

use crate::gcode::layers::{LayerGroup, LayerToPrint};
use crate::gcode::tool_ordering::{entity_extruder, support_extruder, EntityKey, LayerTools};
use crate::geometry::{Point, Polygon};
use crate::print::{Layer, PrintObject};
use crate::ExtrusionEntity;

/// Which collection of the layer an entity comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Perimeter,
    Infill,
    Support,
}

/// Non-owning reference to one entity of a layer.
#[derive(Clone, Copy, Debug)]
pub struct EntityRef<'a> {
    pub entity: &'a ExtrusionEntity,
    /// Index of the region within the layer (0 for support).
    pub region: usize,
    /// Index into the object's region configs.
    pub region_id: usize,
    /// Index within the region's perimeters, fills or the support fills.
    pub index: usize,
    pub kind: EntityKind,
}

/// Entities of one slice island printed by one extruder.
#[derive(Clone, Debug, Default)]
pub struct Island<'a> {
    /// Bounding box centre of the island, object coordinates.
    pub center: Point,
    pub perimeters: Vec<EntityRef<'a>>,
    pub infills: Vec<EntityRef<'a>>,
}

impl<'a> Island<'a> {
    pub fn is_empty(&self) -> bool {
        self.perimeters.is_empty() && self.infills.is_empty()
    }

    /// Entities in print order.
    pub fn entities(&self, infill_first: bool) -> Vec<EntityRef<'a>> {
        let (first, second) = if infill_first {
            (&self.infills, &self.perimeters)
        } else {
            (&self.perimeters, &self.infills)
        };
        first.iter().chain(second.iter()).copied().collect()
    }
}

/// Everything one extruder prints on one object copy of a layer.
#[derive(Clone, Debug)]
pub struct ObjectByExtruder<'a> {
    pub object: &'a PrintObject,
    pub instance: usize,
    /// Instance offset on the bed (scaled).
    pub shift: Point,
    /// Zero-based extruder.
    pub extruder: u32,
    /// Made of infill that absorbs the purge of a tool change.
    pub wiping: bool,
    pub support: Vec<EntityRef<'a>>,
    pub islands: Vec<Island<'a>>,
}

impl<'a> ObjectByExtruder<'a> {
    pub fn is_empty(&self) -> bool {
        self.support.is_empty() && self.islands.iter().all(Island::is_empty)
    }

    pub fn entity_count(&self) -> usize {
        self.support.len()
            + self
                .islands
                .iter()
                .map(|i| i.perimeters.len() + i.infills.len())
                .sum::<usize>()
    }
}

fn island_index(islands: &[Polygon], centers: &[Point], p: Option<Point>) -> usize {
    let Some(p) = p else {
        return 0;
    };
    if let Some(idx) = islands.iter().position(|island| island.contains_point(&p)) {
        return idx;
    }
    centers
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| c.distance_squared(&p))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Split one object layer's entities printed by `extruder` into islands.
fn collect_islands<'a>(
    layer: &'a LayerToPrint<'a>,
    object_layer: &'a Layer,
    instance: usize,
    extruder: u32,
    wiping: bool,
    lt: &LayerTools,
) -> Vec<Island<'a>> {
    let object = layer.object;
    let mut centers: Vec<Point> = object_layer
        .lslices
        .iter()
        .map(|island| island.bounding_box().center())
        .collect();
    if centers.is_empty() {
        centers.push(object_layer.bounding_box().center());
    }
    let mut islands: Vec<Island<'a>> = centers
        .iter()
        .map(|&center| Island {
            center,
            ..Default::default()
        })
        .collect();
    let first = lt.extruders.first().copied().unwrap_or(0);
    let wiping_extrusions = lt.wiping_extrusions();

    for (region_idx, region) in object_layer.regions.iter().enumerate() {
        let region_config = object.region_config(region.region_id);
        let resolve = |natural: u32| natural.checked_sub(1).unwrap_or(first);

        for (kind, entities) in [
            (EntityKind::Perimeter, &region.perimeters),
            (EntityKind::Infill, &region.fills),
        ] {
            for (index, entity) in entities.iter().enumerate() {
                let overridden = if kind == EntityKind::Infill {
                    wiping_extrusions.extruder_override(&EntityKey {
                        object: object.id(),
                        instance,
                        region: region_idx,
                        entity: index,
                    })
                } else {
                    None
                };
                let prints_here = match (wiping, overridden) {
                    (true, Some(e)) => e == extruder,
                    (true, None) => false,
                    (false, Some(_)) => false,
                    (false, None) => resolve(entity_extruder(&region_config, entity)) == extruder,
                };
                if !prints_here {
                    continue;
                }
                let target = island_index(&object_layer.lslices, &centers, entity.first_point());
                let entity_ref = EntityRef {
                    entity,
                    region: region_idx,
                    region_id: region.region_id,
                    index,
                    kind,
                };
                match kind {
                    EntityKind::Perimeter => islands[target].perimeters.push(entity_ref),
                    _ => islands[target].infills.push(entity_ref),
                }
            }
        }
    }
    islands.retain(|i| !i.is_empty());
    islands
}

/// Chain islands nearest-next from `from`; returns the last centre visited.
fn order_islands(islands: &mut Vec<Island<'_>>, shift: Point, mut from: Point) -> Point {
    let mut remaining = std::mem::take(islands);
    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .enumerate()
            .min_by_key(|(_, island)| (island.center + shift).distance_squared(&from))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let island = remaining.remove(next);
        from = island.center + shift;
        islands.push(island);
    }
    from
}

/// Support entities of one object layer printed by `extruder`.
fn collect_support<'a>(layer: &LayerToPrint<'a>, extruder: u32, lt: &LayerTools) -> Vec<EntityRef<'a>> {
    let Some(support_layer) = layer.support_layer else {
        return Vec::new();
    };
    let first = lt.extruders.first().copied().unwrap_or(0);
    support_layer
        .support_fills
        .iter()
        .enumerate()
        .filter(|(_, entity)| {
            let e = support_extruder(layer.object, entity);
            e.checked_sub(1).unwrap_or(first) == extruder
        })
        .map(|(index, entity)| EntityRef {
            entity,
            region: 0,
            region_id: 0,
            index,
            kind: EntityKind::Support,
        })
        .collect()
}

/// Build the visitation records of one layer group.
///
/// `single_object_instance` restricts the result to one `(object id,
/// instance)` pair, as used when objects are printed one after another.
pub fn sort_layer<'a>(
    group: &'a LayerGroup<'a>,
    lt: &LayerTools,
    single_object_instance: Option<(usize, usize)>,
) -> Vec<ObjectByExtruder<'a>> {
    let mut records = Vec::new();
    let mut last = Point::zero();
    let has_wiping = lt.wiping_extrusions().is_anything_overridden();

    for &extruder in &lt.extruders {
        let passes: &[bool] = if has_wiping { &[true, false] } else { &[false] };
        for &wiping in passes {
            for layer in &group.layers {
                let object = layer.object;
                for (instance, copy) in object.instances().iter().enumerate() {
                    if single_object_instance.is_some_and(|sel| sel != (object.id(), instance)) {
                        continue;
                    }
                    let support = if wiping {
                        Vec::new()
                    } else {
                        collect_support(layer, extruder, lt)
                    };
                    let mut islands = match layer.object_layer {
                        Some(object_layer) => {
                            collect_islands(layer, object_layer, instance, extruder, wiping, lt)
                        }
                        None => Vec::new(),
                    };
                    last = order_islands(&mut islands, copy.shift, last);

                    let record = ObjectByExtruder {
                        object,
                        instance,
                        shift: copy.shift,
                        extruder,
                        wiping,
                        support,
                        islands,
                    };
                    if !record.is_empty() {
                        records.push(record);
                    }
                }
            }
        }
    }
    records
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrintConfig, PrintRegionConfig};
    use crate::extrusion::ExtrusionPath;
    use crate::gcode::layers::collect_layers_to_print_for_print;
    use crate::gcode::tool_ordering::ToolOrdering;
    use crate::geometry::Polyline;
    use crate::print::{LayerRegion, Print, SupportLayer};
    use crate::ExtrusionRole;

    /// Roles the record will print, in order of first appearance.
    fn record_roles(record: &ObjectByExtruder<'_>, infill_first: bool) -> Vec<ExtrusionRole> {
        let mut roles = Vec::new();
        let mut push = |r: ExtrusionRole| {
            if !roles.contains(&r) {
                roles.push(r);
            }
        };
        for e in &record.support {
            push(e.entity.role());
        }
        for island in &record.islands {
            for e in island.entities(infill_first) {
                push(e.entity.role());
            }
        }
        roles
    }

    fn path(role: ExtrusionRole, x: f64, y: f64) -> ExtrusionPath {
        ExtrusionPath::new(Polyline::from_mm(&[(x, y), (x + 2.0, y)]), role, 0.45, 0.2)
    }

    /// Two islands: one around x=5, one around x=25.
    fn two_island_object(name: &str, region: PrintRegionConfig) -> PrintObject {
        PrintObject::new(name)
            .with_region_config(region)
            .with_instance(0.0, 0.0)
            .with_layer(
                Layer::new(0, 0.2, 0.2)
                    .with_island(Polygon::rectangle(0.0, 0.0, 10.0, 10.0))
                    .with_island(Polygon::rectangle(20.0, 0.0, 30.0, 10.0))
                    .with_region(
                        LayerRegion::new(0)
                            .with_perimeter(path(ExtrusionRole::ExternalPerimeter, 22.0, 5.0))
                            .with_perimeter(path(ExtrusionRole::ExternalPerimeter, 2.0, 5.0))
                            .with_fill(path(ExtrusionRole::InternalInfill, 23.0, 6.0))
                            .with_fill(path(ExtrusionRole::InternalInfill, 3.0, 6.0)),
                    ),
            )
    }

    #[test]
    fn test_islands_nearest_first() {
        let print = Print::new().with_object(two_island_object("a", PrintRegionConfig::default()));
        let config = PrintConfig::default();
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();

        let records = sort_layer(&groups[0], &ordering.layer_tools()[0], None);
        assert_eq!(records.len(), 1);
        let islands = &records[0].islands;
        assert_eq!(islands.len(), 2);
        // From the origin the left island is closer
        assert!(islands[0].center.x < islands[1].center.x);
        for island in islands {
            assert_eq!(island.perimeters.len(), 1);
            assert_eq!(island.infills.len(), 1);
        }
        let order = islands[0].entities(false);
        assert_eq!(order[0].kind, EntityKind::Perimeter);
        let order = islands[0].entities(true);
        assert_eq!(order[0].kind, EntityKind::Infill);
    }

    #[test]
    fn test_extruder_blocks_are_contiguous() {
        let region = PrintRegionConfig::new().extruder(1).infill_extruder(2);
        let print = Print::new()
            .with_object(two_island_object("a", region.clone()))
            .with_object(two_island_object("b", region).with_instance(50.0, 0.0));
        let config = PrintConfig::with_extruders(2);
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();
        let lt = &ordering.layer_tools()[0];

        let records = sort_layer(&groups[0], lt, None);
        let extruders: Vec<u32> = records.iter().map(|r| r.extruder).collect();
        // object a: 1 copy, object b: 2 copies; each prints walls then infill
        assert_eq!(extruders, vec![0, 0, 0, 1, 1, 1]);
        let objects: Vec<(usize, usize)> = records[..3]
            .iter()
            .map(|r| (r.object.id(), r.instance))
            .collect();
        assert_eq!(objects, vec![(0, 0), (1, 0), (1, 1)]);
        for r in &records[..3] {
            assert!(r.islands.iter().all(|i| i.infills.is_empty()));
        }
        // Every entity appears exactly once
        let total: usize = records.iter().map(|r| r.entity_count()).sum();
        assert_eq!(total, 4 * 3);
    }

    #[test]
    fn test_single_object_instance() {
        let print = Print::new()
            .with_object(two_island_object("a", PrintRegionConfig::default()))
            .with_object(two_island_object("b", PrintRegionConfig::default()));
        let config = PrintConfig::default();
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();

        let records = sort_layer(&groups[0], &ordering.layer_tools()[0], Some((1, 0)));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object.name(), "b");
    }

    #[test]
    fn test_support_dontcare_uses_first_extruder() {
        let region = PrintRegionConfig::new().extruder(2);
        let object = two_island_object("a", region).with_support_layer(
            SupportLayer::new(0, 0.2, 0.2).with_fill(path(ExtrusionRole::SupportMaterial, 40.0, 0.0)),
        );
        let print = Print::new().with_object(object);
        let config = PrintConfig::with_extruders(2);
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();
        let lt = &ordering.layer_tools()[0];
        assert_eq!(lt.extruders, vec![1]);

        let records = sort_layer(&groups[0], lt, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].support.len(), 1);
        assert_eq!(records[0].extruder, 1);
        assert_eq!(record_roles(&records[0], false)[0], ExtrusionRole::SupportMaterial);
    }

    #[test]
    fn test_wiping_records_come_first() {
        let region = PrintRegionConfig::new()
            .extruder(1)
            .infill_extruder(2)
            .wipe_into_infill(true);
        let print = Print::new().with_object(two_island_object("a", region));
        let mut config = PrintConfig::with_extruders(2);
        config.wipe_tower.enabled = true;
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();
        let lt = &ordering.layer_tools()[0];
        assert!(lt.wiping_extrusions().is_anything_overridden());

        let records = sort_layer(&groups[0], lt, None);
        let wiping: Vec<&ObjectByExtruder<'_>> = records.iter().filter(|r| r.wiping).collect();
        assert_eq!(wiping.len(), 1);
        assert_eq!(wiping[0].extruder, 1);
        let pos = records.iter().position(|r| r.wiping).unwrap();
        assert_eq!(records[pos - 1].extruder, 0);
        // No entity is printed twice
        let total: usize = records.iter().map(|r| r.entity_count()).sum();
        assert_eq!(total, 4);
    }
}
