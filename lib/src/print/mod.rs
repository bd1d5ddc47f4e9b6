//! Print module - the sliced model handed to G-code export.
//!
//! This module provides the input types of the export stages:
//! - [`Print`] - an entire print job with its per-height custom G-code
//! - [`PrintObject`] - one sliced object, its layers, support layers,
//!   region settings and placed instances
//! - [`Layer`], [`LayerRegion`], [`SupportLayer`] - per-height geometry

mod layer;

pub use layer::{Layer, LayerRegion, SupportLayer};

use crate::config::PrintRegionConfig;
use crate::geometry::{BoundingBox, Point};
use crate::{CoordF, Error, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Custom G-code
// ============================================================================

/// Type of custom G-code event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomGCodeType {
    /// Color change (M600)
    ColorChange,
    /// Pause print
    Pause,
    /// Custom G-code template
    Custom,
}

/// Custom G-code event requested at a print height
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomGCodeItem {
    /// Print Z height for this event
    pub print_z: CoordF,
    /// Type of G-code event
    pub gcode_type: CustomGCodeType,
    /// Extruder index (1-based, for color changes)
    pub extruder: u32,
    /// New color (hex string, for color changes)
    pub color: String,
    /// Custom G-code content (for custom events)
    pub extra: String,
}

impl CustomGCodeItem {
    pub fn color_change(print_z: CoordF, extruder: u32, color: &str) -> Self {
        Self {
            print_z,
            gcode_type: CustomGCodeType::ColorChange,
            extruder,
            color: color.to_string(),
            extra: String::new(),
        }
    }

    pub fn pause(print_z: CoordF) -> Self {
        Self {
            print_z,
            gcode_type: CustomGCodeType::Pause,
            extruder: 0,
            color: String::new(),
            extra: String::new(),
        }
    }

    pub fn custom(print_z: CoordF, gcode: &str) -> Self {
        Self {
            print_z,
            gcode_type: CustomGCodeType::Custom,
            extruder: 0,
            color: String::new(),
            extra: gcode.to_string(),
        }
    }
}

// ============================================================================
// Print Object
// ============================================================================

/// Object-level settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintObjectConfig {
    /// Support extruder (1-based, 0 = whatever is active).
    pub support_filament: u32,
    /// Support interface extruder (1-based, 0 = whatever is active).
    pub support_interface_filament: u32,
}

/// One placed copy of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintInstance {
    /// Offset of this copy on the bed (scaled).
    pub shift: Point,
    /// Unique id across the print, used for object labels.
    pub label_id: usize,
}

/// Represents a single sliced object to be printed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrintObject {
    /// Position of this object within the print.
    id: usize,
    name: String,
    pub config: PrintObjectConfig,
    region_configs: Vec<PrintRegionConfig>,
    layers: Vec<Layer>,
    support_layers: Vec<SupportLayer>,
    instances: Vec<PrintInstance>,
}

impl PrintObject {
    /// Create a new print object with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder method: add a region config; layer regions refer to it by index.
    pub fn with_region_config(mut self, config: PrintRegionConfig) -> Self {
        self.region_configs.push(config);
        self
    }

    /// Builder method: add a layer.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Builder method: add a support layer.
    pub fn with_support_layer(mut self, layer: SupportLayer) -> Self {
        self.support_layers.push(layer);
        self
    }

    /// Builder method: place a copy at `(x, y)` millimeters.
    pub fn with_instance(mut self, x: CoordF, y: CoordF) -> Self {
        self.instances.push(PrintInstance {
            shift: Point::new_scale(x, y),
            label_id: 0,
        });
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn support_layers(&self) -> &[SupportLayer] {
        &self.support_layers
    }

    pub fn instances(&self) -> &[PrintInstance] {
        &self.instances
    }

    pub fn region_configs(&self) -> &[PrintRegionConfig] {
        &self.region_configs
    }

    /// Region settings; objects without explicit regions use defaults.
    pub fn region_config(&self, region_id: usize) -> PrintRegionConfig {
        self.region_configs
            .get(region_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Bounding box of every island of every layer, object coordinates.
    pub fn bounding_box(&self) -> BoundingBox {
        let mut bb = BoundingBox::new();
        for layer in &self.layers {
            bb.merge(&layer.bounding_box());
        }
        bb
    }

    /// Highest print_z of any layer or support layer.
    pub fn max_z(&self) -> CoordF {
        self.layers
            .iter()
            .map(|l| l.print_z)
            .chain(self.support_layers.iter().map(|l| l.print_z))
            .fold(0.0, CoordF::max)
    }

    /// Check the geometry handed over by the slicing stages.
    pub fn validate(&self) -> Result<()> {
        let geometry_error = |message: String| Error::Geometry {
            object: self.name.clone(),
            message,
        };
        if self.instances.is_empty() && !self.layers.is_empty() {
            return Err(geometry_error("object has no instances".into()));
        }
        let mut last_z = f64::NEG_INFINITY;
        for layer in &self.layers {
            if !(layer.print_z.is_finite() && layer.height > 0.0) {
                return Err(geometry_error(format!(
                    "layer {} has invalid height {} at z {}",
                    layer.id, layer.height, layer.print_z
                )));
            }
            if layer.print_z < last_z {
                return Err(geometry_error(format!(
                    "layer {} at z {} is below the previous layer",
                    layer.id, layer.print_z
                )));
            }
            last_z = layer.print_z;
            for region in &layer.regions {
                if region.region_id >= self.region_configs.len().max(1) {
                    return Err(geometry_error(format!(
                        "layer {} references region {} ({} configured)",
                        layer.id,
                        region.region_id,
                        self.region_configs.len()
                    )));
                }
                for entity in region.perimeters.iter().chain(region.fills.iter()) {
                    entity.validate().map_err(|m| {
                        geometry_error(format!("layer {}: {}", layer.id, m))
                    })?;
                }
            }
        }
        for layer in &self.support_layers {
            for entity in &layer.support_fills {
                entity.validate().map_err(|m| {
                    geometry_error(format!("support layer {}: {}", layer.id, m))
                })?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Print
// ============================================================================

/// Represents an entire print job containing one or more objects.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Print {
    objects: Vec<PrintObject>,
    /// Color changes, pauses and custom scripts requested by height.
    pub custom_gcode_per_print_z: Vec<CustomGCodeItem>,
}

impl Print {
    /// Create a new empty print job.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object; assigns its id and unique instance label ids.
    pub fn add_object(&mut self, mut object: PrintObject) {
        object.id = self.objects.len();
        let mut next_label = self
            .objects
            .iter()
            .map(|o| o.instances.len())
            .sum::<usize>();
        for instance in &mut object.instances {
            instance.label_id = next_label;
            next_label += 1;
        }
        self.objects.push(object);
    }

    /// Builder method: add an object.
    pub fn with_object(mut self, object: PrintObject) -> Self {
        self.add_object(object);
        self
    }

    /// Get the objects in this print job.
    pub fn objects(&self) -> &[PrintObject] {
        &self.objects
    }

    /// Get the number of objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Check if the print job is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// `(object, instance)` pairs in model order.
    pub fn instance_order(&self) -> Vec<(usize, usize)> {
        self.objects
            .iter()
            .enumerate()
            .flat_map(|(oi, o)| (0..o.instances.len()).map(move |ii| (oi, ii)))
            .collect()
    }

    /// A print with only the given object, keeping its labels.
    pub fn single_object(&self, object_idx: usize) -> Option<Print> {
        let mut object = self.objects.get(object_idx)?.clone();
        object.id = 0;
        Some(Print {
            objects: vec![object],
            custom_gcode_per_print_z: self.custom_gcode_per_print_z.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extrusion::{ExtrusionPath, ExtrusionRole};
    use crate::geometry::{Polygon, Polyline};

    fn object_with_layers(name: &str, zs: &[f64]) -> PrintObject {
        let mut obj = PrintObject::new(name)
            .with_region_config(PrintRegionConfig::default())
            .with_instance(0.0, 0.0);
        for (i, &z) in zs.iter().enumerate() {
            obj = obj.with_layer(
                Layer::new(i, z, 0.2)
                    .with_island(Polygon::rectangle(0.0, 0.0, 10.0, 10.0))
                    .with_region(LayerRegion::new(0).with_perimeter(ExtrusionPath::new(
                        Polyline::from_mm(&[(0.0, 0.0), (10.0, 0.0)]),
                        ExtrusionRole::Perimeter,
                        0.45,
                        0.2,
                    ))),
            );
        }
        obj
    }

    #[test]
    fn test_print_new() {
        let print = Print::new();
        assert!(print.is_empty());
        assert_eq!(print.object_count(), 0);
    }

    #[test]
    fn test_add_object_assigns_ids_and_labels() {
        let mut print = Print::new();
        print.add_object(object_with_layers("a", &[0.2]).with_instance(20.0, 0.0));
        print.add_object(object_with_layers("b", &[0.2]));
        assert_eq!(print.objects()[1].id(), 1);
        let labels: Vec<usize> = print
            .objects()
            .iter()
            .flat_map(|o| o.instances().iter().map(|i| i.label_id))
            .collect();
        assert_eq!(labels, vec![0, 1, 2]);
        assert_eq!(print.instance_order(), vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn test_validate_rejects_descending_layers() {
        let obj = object_with_layers("cube", &[0.4, 0.2]);
        match obj.validate() {
            Err(Error::Geometry { object, message }) => {
                assert_eq!(object, "cube");
                assert!(message.contains("below"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_region() {
        let obj = PrintObject::new("x")
            .with_instance(0.0, 0.0)
            .with_layer(Layer::new(0, 0.2, 0.2).with_region(LayerRegion::new(3)));
        assert!(matches!(obj.validate(), Err(Error::Geometry { .. })));
    }

    #[test]
    fn test_max_z_and_bbox() {
        let obj = object_with_layers("cube", &[0.2, 0.4]);
        assert!((obj.max_z() - 0.4).abs() < 1e-9);
        assert_eq!(obj.bounding_box().max, Point::new_scale(10.0, 10.0));
    }
}
