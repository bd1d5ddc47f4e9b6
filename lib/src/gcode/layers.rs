//! Layer collection.
//!
//! Pairs every object layer with the support layer printed at the same height
//! and merges the result across objects into per-height [`LayerGroup`]s, the
//! unit scheduled by the tool orderer and emitted by the pipeline.

use crate::print::{Layer, Print, PrintObject, SupportLayer};
use crate::{CoordF, EPSILON};
use rayon::prelude::*;

/// Object and support layer of one object printed at one height.
///
/// Borrows both layers; owns no geometry.
#[derive(Clone, Copy, Debug)]
pub struct LayerToPrint<'a> {
    pub object: &'a PrintObject,
    pub object_layer: Option<&'a Layer>,
    pub support_layer: Option<&'a SupportLayer>,
}

impl<'a> LayerToPrint<'a> {
    /// Mean print height of the layers present.
    pub fn print_z(&self) -> CoordF {
        match (self.object_layer, self.support_layer) {
            (Some(o), Some(s)) => 0.5 * (o.print_z + s.print_z),
            (Some(o), None) => o.print_z,
            (None, Some(s)) => s.print_z,
            (None, None) => 0.0,
        }
    }

    /// Thickness of the thicker layer present.
    pub fn height(&self) -> CoordF {
        let o = self.object_layer.map_or(0.0, |l| l.height);
        let s = self.support_layer.map_or(0.0, |l| l.height);
        o.max(s)
    }

    pub fn has_extrusions(&self) -> bool {
        self.object_layer.is_some_and(|l| l.has_extrusions())
            || self.support_layer.is_some_and(|l| l.has_extrusions())
    }
}

/// All objects' layers sharing one print height.
#[derive(Clone, Debug)]
pub struct LayerGroup<'a> {
    pub print_z: CoordF,
    /// One entry per object present at this height, in object order.
    pub layers: Vec<LayerToPrint<'a>>,
}

impl<'a> LayerGroup<'a> {
    /// Thickest layer of the group.
    pub fn height(&self) -> CoordF {
        self.layers.iter().map(|l| l.height()).fold(0.0, CoordF::max)
    }

    pub fn has_object(&self) -> bool {
        self.layers.iter().any(|l| l.object_layer.is_some())
    }

    pub fn has_support(&self) -> bool {
        self.layers.iter().any(|l| l.support_layer.is_some())
    }
}

/// Pair one object's layers and support layers by print height.
///
/// Layers without extrusions are skipped; an object without layers yields an
/// empty vector.
pub fn collect_layers_to_print(object: &PrintObject) -> Vec<LayerToPrint<'_>> {
    let layers = object.layers();
    let supports = object.support_layers();
    let mut out = Vec::with_capacity(layers.len().max(supports.len()));

    let (mut i, mut j) = (0, 0);
    while i < layers.len() || j < supports.len() {
        let layer = layers.get(i);
        let support = supports.get(j);
        let entry = match (layer, support) {
            (Some(l), Some(s)) if (l.print_z - s.print_z).abs() < EPSILON => {
                i += 1;
                j += 1;
                LayerToPrint {
                    object,
                    object_layer: Some(l),
                    support_layer: Some(s),
                }
            }
            (Some(l), Some(s)) if l.print_z < s.print_z => {
                i += 1;
                LayerToPrint {
                    object,
                    object_layer: Some(l),
                    support_layer: None,
                }
            }
            (_, Some(s)) => {
                j += 1;
                LayerToPrint {
                    object,
                    object_layer: None,
                    support_layer: Some(s),
                }
            }
            (Some(l), None) => {
                i += 1;
                LayerToPrint {
                    object,
                    object_layer: Some(l),
                    support_layer: None,
                }
            }
            (None, None) => break,
        };

        // Drop empty halves so later stages only see printable layers.
        let entry = LayerToPrint {
            object_layer: entry.object_layer.filter(|l| l.has_extrusions()),
            support_layer: entry.support_layer.filter(|l| l.has_extrusions()),
            ..entry
        };
        if entry.has_extrusions() {
            out.push(entry);
        }
    }
    out
}

/// Collect every object in parallel and merge the results by print height.
pub fn collect_layers_to_print_for_print(print: &Print) -> Vec<LayerGroup<'_>> {
    let per_object: Vec<Vec<LayerToPrint<'_>>> = print
        .objects()
        .par_iter()
        .map(collect_layers_to_print)
        .collect();

    let mut ordering: Vec<(CoordF, usize, LayerToPrint<'_>)> = per_object
        .into_iter()
        .enumerate()
        .flat_map(|(object_idx, layers)| {
            layers
                .into_iter()
                .map(move |l| (l.print_z(), object_idx, l))
        })
        .collect();
    ordering.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut groups: Vec<LayerGroup<'_>> = Vec::new();
    for (print_z, _, layer) in ordering {
        match groups.last_mut() {
            Some(group) if (print_z - group.print_z).abs() < EPSILON => group.layers.push(layer),
            _ => groups.push(LayerGroup {
                print_z,
                layers: vec![layer],
            }),
        }
    }
    groups
}

/// One group per layer of a single object, for sequential printing.
pub fn collect_layers_for_object(object: &PrintObject) -> Vec<LayerGroup<'_>> {
    collect_layers_to_print(object)
        .into_iter()
        .map(|l| LayerGroup {
            print_z: l.print_z(),
            layers: vec![l],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrintRegionConfig;
    use crate::extrusion::{ExtrusionPath, ExtrusionRole};
    use crate::geometry::Polyline;
    use crate::print::LayerRegion;

    fn line() -> ExtrusionPath {
        ExtrusionPath::new(
            Polyline::from_mm(&[(0.0, 0.0), (5.0, 0.0)]),
            ExtrusionRole::Perimeter,
            0.45,
            0.2,
        )
    }

    fn layer(id: usize, z: f64) -> Layer {
        Layer::new(id, z, 0.2).with_region(LayerRegion::new(0).with_perimeter(line()))
    }

    fn support(id: usize, z: f64) -> SupportLayer {
        let mut path = line();
        path.role = ExtrusionRole::SupportMaterial;
        SupportLayer::new(id, z, 0.2).with_fill(path)
    }

    fn object(name: &str) -> PrintObject {
        PrintObject::new(name)
            .with_region_config(PrintRegionConfig::default())
            .with_instance(0.0, 0.0)
    }

    #[test]
    fn test_pairs_support_at_equal_height() {
        let obj = object("a")
            .with_layer(layer(0, 0.2))
            .with_layer(layer(1, 0.4))
            .with_support_layer(support(0, 0.2 + EPSILON / 10.0))
            .with_support_layer(support(1, 0.3));
        let collected = collect_layers_to_print(&obj);
        assert_eq!(collected.len(), 3);
        assert!(collected[0].object_layer.is_some() && collected[0].support_layer.is_some());
        assert!(collected[1].object_layer.is_none());
        assert!((collected[1].print_z() - 0.3).abs() < 1e-9);
        assert!(collected[2].support_layer.is_none());
    }

    #[test]
    fn test_empty_object_yields_nothing() {
        let obj = object("empty");
        assert!(collect_layers_to_print(&obj).is_empty());
    }

    #[test]
    fn test_skips_layers_without_extrusions() {
        let obj = object("a")
            .with_layer(Layer::new(0, 0.2, 0.2))
            .with_layer(layer(1, 0.4));
        let collected = collect_layers_to_print(&obj);
        assert_eq!(collected.len(), 1);
        assert!((collected[0].print_z() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_merge_across_objects() {
        let print = Print::new()
            .with_object(object("a").with_layer(layer(0, 0.2)).with_layer(layer(1, 0.4)))
            .with_object(object("b").with_layer(layer(0, 0.2)).with_layer(layer(1, 0.3)))
            .with_object(object("empty"));
        let groups = collect_layers_to_print_for_print(&print);
        let zs: Vec<f64> = groups.iter().map(|g| g.print_z).collect();
        assert_eq!(zs.len(), 3);
        assert!(zs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(groups[0].layers.len(), 2);
        assert_eq!(groups[0].layers[0].object.name(), "a");
        assert_eq!(groups[0].layers[1].object.name(), "b");
    }
}
