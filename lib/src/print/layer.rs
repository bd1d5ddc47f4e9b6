//! Per-object layers as handed over by the slicing stages.

use crate::extrusion::ExtrusionEntity;
use crate::geometry::{BoundingBox, Polygon};
use crate::CoordF;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One horizontal slice of an object with its finished extrusions.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Layer {
    /// Layer index within the object (0-based).
    pub id: usize,

    /// Top of the layer (mm).
    pub print_z: CoordF,

    /// Layer thickness (mm).
    pub height: CoordF,

    /// Island outlines of the slice, object coordinates.
    pub lslices: Vec<Polygon>,

    /// One entry per region printed at this layer.
    pub regions: Vec<LayerRegion>,
}

impl Layer {
    pub fn new(id: usize, print_z: CoordF, height: CoordF) -> Self {
        Self {
            id,
            print_z,
            height,
            lslices: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Builder method: add an island outline.
    pub fn with_island(mut self, island: Polygon) -> Self {
        self.lslices.push(island);
        self
    }

    /// Builder method: add a region.
    pub fn with_region(mut self, region: LayerRegion) -> Self {
        self.regions.push(region);
        self
    }

    /// Whether any region has something to print.
    pub fn has_extrusions(&self) -> bool {
        self.regions.iter().any(|r| r.has_extrusions())
    }

    /// Bounding box of all islands.
    pub fn bounding_box(&self) -> BoundingBox {
        let mut bb = BoundingBox::new();
        for island in &self.lslices {
            bb.merge(&island.bounding_box());
        }
        bb
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Layer(id={}, z={:.3}, h={:.3}, islands={}, regions={})",
            self.id,
            self.print_z,
            self.height,
            self.lslices.len(),
            self.regions.len()
        )
    }
}

/// Extrusions of one region within a layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LayerRegion {
    /// Index into the owning object's region configs.
    pub region_id: usize,
    pub perimeters: Vec<ExtrusionEntity>,
    pub fills: Vec<ExtrusionEntity>,
}

impl LayerRegion {
    pub fn new(region_id: usize) -> Self {
        Self {
            region_id,
            perimeters: Vec::new(),
            fills: Vec::new(),
        }
    }

    pub fn with_perimeter(mut self, entity: impl Into<ExtrusionEntity>) -> Self {
        self.perimeters.push(entity.into());
        self
    }

    pub fn with_fill(mut self, entity: impl Into<ExtrusionEntity>) -> Self {
        self.fills.push(entity.into());
        self
    }

    pub fn has_extrusions(&self) -> bool {
        !self.perimeters.is_empty() || !self.fills.is_empty()
    }
}

/// Support structures generated for one object at one height.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SupportLayer {
    pub id: usize,
    pub print_z: CoordF,
    pub height: CoordF,
    pub support_fills: Vec<ExtrusionEntity>,
}

impl SupportLayer {
    pub fn new(id: usize, print_z: CoordF, height: CoordF) -> Self {
        Self {
            id,
            print_z,
            height,
            support_fills: Vec::new(),
        }
    }

    pub fn with_fill(mut self, entity: impl Into<ExtrusionEntity>) -> Self {
        self.support_fills.push(entity.into());
        self
    }

    pub fn has_extrusions(&self) -> bool {
        !self.support_fills.is_empty()
    }
}
