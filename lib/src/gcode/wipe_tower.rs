//! Wipe Tower Module for Multi-Material Printing
//!
//! The wipe tower is a sacrificial structure printed alongside the model
//! that absorbs the material purged during tool changes:
//! - Purging old filament during tool changes
//! - Priming the new filament before continuing the print
//! - Keeping every tower layer printed so the tower stays stable
//!
//! ## Key Concepts
//!
//! - **Plan**: every tool change of the print is registered up front with
//!   its purge volume, which fixes the depth of the tower
//! - **Tool change result**: a ready-made G-code fragment in tower-local
//!   coordinates, produced before emission starts
//! - **Integration**: during emission [`WipeTowerIntegration`] hands the
//!   fragments out in order, transforms them onto the bed and splices in the
//!   actual extruder switch
//!
//! Fragments contain a [`TOOLCHANGE_PLACEHOLDER`] line where the nozzle is
//! already parked on the tower; the integration replaces it with the tool
//! change and unretract of the emission state.

use std::f64::consts::PI;
use std::fmt::Write as _;

use tracing::debug;

use crate::config::PrintConfig;
use crate::gcode::emitter::{EmitterPhase, EmitterState};
use crate::gcode::reader::GCodeMove;
use crate::gcode::tool_ordering::ToolOrdering;
use crate::geometry::{BoundingBoxF, PointF};
use crate::{CoordF, Error, ExtrusionRole, Result};

// ============================================================================
// Constants
// ============================================================================

/// Small epsilon for floating point comparisons
const WT_EPSILON: CoordF = 1e-4;

/// Width to nozzle diameter ratio
const WIDTH_TO_NOZZLE_RATIO: CoordF = 1.25;

/// Brim loops are spaced slightly closer than the line width
const BRIM_SPACING_RATIO: CoordF = 0.9;

/// Line marking where the tool switch belongs inside a fragment.
pub const TOOLCHANGE_PLACEHOLDER: &str = ";_TOOLCHANGE";

/// Comment opening every tower fragment.
pub const WIPE_TOWER_START: &str = ";WIPE_TOWER_START";

/// Comment closing every tower fragment.
pub const WIPE_TOWER_END: &str = ";WIPE_TOWER_END";

/// Minimum depth per height mapping for tower stability
const MIN_DEPTH_PER_HEIGHT: &[(CoordF, CoordF)] = &[
    (5.0, 1.0),
    (100.0, 10.0),
    (180.0, 15.0),
    (250.0, 20.0),
    (350.0, 25.0),
];

// ============================================================================
// Types
// ============================================================================

/// Axis-aligned box in tower-local coordinates
#[derive(Debug, Clone, Copy)]
pub struct BoxCoordinates {
    /// Left-down corner
    pub ld: PointF,
    /// Left-up corner
    pub lu: PointF,
    /// Right-down corner
    pub rd: PointF,
    /// Right-up corner
    pub ru: PointF,
}

impl BoxCoordinates {
    pub fn new(left: CoordF, bottom: CoordF, width: CoordF, height: CoordF) -> Self {
        Self {
            ld: PointF::new(left, bottom),
            lu: PointF::new(left, bottom + height),
            rd: PointF::new(left + width, bottom),
            ru: PointF::new(left + width, bottom + height),
        }
    }

    pub fn expand(&mut self, offset: CoordF) {
        self.ld = self.ld + PointF::new(-offset, -offset);
        self.lu = self.lu + PointF::new(-offset, offset);
        self.rd = self.rd + PointF::new(offset, -offset);
        self.ru = self.ru + PointF::new(offset, offset);
    }

    pub fn width(&self) -> CoordF {
        self.rd.x - self.ld.x
    }

    pub fn height(&self) -> CoordF {
        self.lu.y - self.ld.y
    }
}

/// Result of a tool change operation
#[derive(Debug, Clone, Default)]
pub struct ToolChangeResult {
    /// Print height of this tool change
    pub print_z: CoordF,
    /// Layer height
    pub layer_height: CoordF,
    /// G-code section, tower-local coordinates
    pub gcode: String,
    /// Where the fragment expects the nozzle (tower-local)
    pub start_pos: PointF,
    /// Where the fragment leaves the nozzle (tower-local)
    pub end_pos: PointF,
    /// Time elapsed during this fragment (s)
    pub elapsed_time: CoordF,
    /// Is this a priming extrusion?
    pub priming: bool,
    /// Is this an actual tool change?
    pub is_tool_change: bool,
    /// Tool active before the fragment
    pub initial_tool: u32,
    /// Tool active after the fragment
    pub new_tool: u32,
    /// Purge volume used (mm³)
    pub purge_volume: CoordF,
    /// Filament pushed by the fragment (mm)
    pub used_filament: CoordF,
}

/// Information about a planned tool change
#[derive(Debug, Clone)]
pub struct ToolChangeInfo {
    pub old_tool: u32,
    pub new_tool: u32,
    /// Depth taken on the tower (mm)
    pub required_depth: CoordF,
    /// Volume to purge (mm³)
    pub wipe_volume: CoordF,
    /// Extrusion length needed for the purge (mm of line)
    pub wipe_length: CoordF,
}

/// Information about a single layer in the wipe tower
#[derive(Debug, Clone)]
pub struct WipeTowerLayerInfo {
    /// Z height
    pub z: CoordF,
    /// Layer height
    pub height: CoordF,
    /// Spacing factor of wipe lines on this layer
    pub extra_spacing: CoordF,
    /// Tool changes in this layer
    pub tool_changes: Vec<ToolChangeInfo>,
}

impl WipeTowerLayerInfo {
    pub fn new(z: CoordF, height: CoordF) -> Self {
        Self {
            z,
            height,
            extra_spacing: 1.0,
            tool_changes: vec![],
        }
    }

    /// Calculate total depth for all tool changes
    pub fn toolchanges_depth(&self) -> CoordF {
        self.tool_changes.iter().map(|tc| tc.required_depth).sum()
    }
}

// ============================================================================
// Wipe Tower Writer
// ============================================================================

/// Formats tower moves in tower-local coordinates and keeps track of time
/// and filament.
struct WipeTowerWriter {
    /// First position reached, where the caller parks the nozzle
    start_pos: Option<PointF>,
    current_pos: PointF,
    current_feedrate: CoordF,
    /// Filament length per mm of line
    extrusion_flow: CoordF,
    gcode: String,
    elapsed_time: CoordF,
    used_filament_length: CoordF,
}

impl WipeTowerWriter {
    fn new(pos: PointF, extrusion_flow: CoordF) -> Self {
        Self {
            start_pos: None,
            current_pos: pos,
            current_feedrate: 0.0,
            extrusion_flow,
            gcode: String::new(),
            elapsed_time: 0.0,
            used_filament_length: 0.0,
        }
    }

    fn start_pos(&self) -> PointF {
        self.start_pos.unwrap_or(self.current_pos)
    }

    fn comment(&mut self, text: &str) -> &mut Self {
        let _ = writeln!(self.gcode, "; {}", text);
        self
    }

    fn append(&mut self, gcode: &str) -> &mut Self {
        self.gcode.push_str(gcode);
        self
    }

    /// Set feedrate (mm/min)
    fn feedrate(&mut self, f: CoordF) -> &mut Self {
        if (self.current_feedrate - f).abs() > WT_EPSILON {
            let _ = writeln!(self.gcode, "G1 F{:.0}", f);
            self.current_feedrate = f;
        }
        self
    }

    fn advance(&mut self, target: PointF) -> CoordF {
        let len = self.current_pos.distance(&target);
        if self.current_feedrate > 0.0 {
            self.elapsed_time += len / self.current_feedrate * 60.0;
        }
        self.current_pos = target;
        len
    }

    /// Travel to position. The first travel only marks the start position.
    fn travel(&mut self, x: CoordF, y: CoordF) -> &mut Self {
        let target = PointF::new(x, y);
        if self.start_pos.is_none() {
            self.start_pos = Some(target);
            self.current_pos = target;
            return self;
        }
        if target.approx_eq(&self.current_pos, WT_EPSILON) {
            return self;
        }
        let _ = writeln!(self.gcode, "G1 X{:.3} Y{:.3}", x, y);
        self.advance(target);
        self
    }

    /// Extrude to position with the default flow
    fn extrude(&mut self, x: CoordF, y: CoordF) -> &mut Self {
        let len = self.current_pos.distance(&PointF::new(x, y));
        self.extrude_explicit(x, y, len * self.extrusion_flow)
    }

    /// Extrude to position pushing `e` mm of filament
    fn extrude_explicit(&mut self, x: CoordF, y: CoordF, e: CoordF) -> &mut Self {
        if self.start_pos.is_none() {
            self.start_pos = Some(self.current_pos);
        }
        let _ = writeln!(self.gcode, "G1 X{:.3} Y{:.3} E{:.5}", x, y, e);
        self.advance(PointF::new(x, y));
        self.used_filament_length += e;
        self
    }

    /// Extrude a rectangle starting from the closest corner
    fn rectangle(&mut self, box_coords: &BoxCoordinates) -> &mut Self {
        let corners = [box_coords.ld, box_coords.lu, box_coords.ru, box_coords.rd];
        let mut closest_idx = 0;
        let mut min_dist = CoordF::MAX;
        for (i, corner) in corners.iter().enumerate() {
            let d = self.current_pos.distance(corner);
            if d < min_dist {
                min_dist = d;
                closest_idx = i;
            }
        }

        for i in 0..=4 {
            let c = corners[(closest_idx + i) % 4];
            if i == 0 {
                self.travel(c.x, c.y);
            } else {
                self.extrude(c.x, c.y);
            }
        }
        self
    }

    /// Fill a box with back-and-forth lines
    fn rectangle_fill_box(&mut self, box_coords: &BoxCoordinates, spacing: CoordF) -> &mut Self {
        let height = box_coords.height();
        let num_lines = (height / spacing).floor() as usize;
        if num_lines < 1 {
            return self;
        }

        let actual_spacing = height / num_lines as CoordF;
        let mut y = box_coords.ld.y + actual_spacing / 2.0;
        let mut left_to_right = true;
        for _ in 0..num_lines {
            let (start_x, end_x) = if left_to_right {
                (box_coords.ld.x, box_coords.rd.x)
            } else {
                (box_coords.rd.x, box_coords.ld.x)
            };
            self.travel(start_x, y);
            self.extrude(end_x, y);
            y += actual_spacing;
            left_to_right = !left_to_right;
        }
        self
    }

    /// Purge `length` mm of line in rows from `y0` towards `+dy` between
    /// `xl` and `xr`; the last row is cut so the volume is exact.
    fn wipe_rows(&mut self, xl: CoordF, xr: CoordF, y0: CoordF, dy: CoordF, length: CoordF) -> &mut Self {
        let line_len = xr - xl;
        if line_len <= WT_EPSILON {
            return self;
        }
        // A zero purge still lays one full row so the layer gets printed.
        let mut remaining = if length <= WT_EPSILON { line_len } else { length };
        let mut y = y0;
        let mut left_to_right = true;
        while remaining > WT_EPSILON {
            let (start, dir) = if left_to_right { (xl, 1.0) } else { (xr, -1.0) };
            let seg = remaining.min(line_len);
            self.travel(start, y);
            self.extrude(start + dir * seg, y);
            remaining -= seg;
            y += dy;
            left_to_right = !left_to_right;
        }
        self
    }
}

// ============================================================================
// Wipe Tower
// ============================================================================

/// Tower generator: collects the plan, sizes the tower and produces every
/// fragment ahead of emission.
#[derive(Debug, Clone)]
pub struct WipeTower {
    width: CoordF,
    brim_width: CoordF,
    /// Print speed (mm/s)
    speed: CoordF,
    first_layer_speed: CoordF,
    prime_volume: CoordF,
    perimeter_width: CoordF,
    filament_areas: Vec<CoordF>,
    /// Layer plan
    plan: Vec<WipeTowerLayerInfo>,
    /// Calculated depth
    depth: CoordF,
    extra_spacing: CoordF,
    // Generation state
    current_tool: u32,
    layer_idx: usize,
    tool_change_idx: usize,
    depth_traversed: CoordF,
    print_brim: bool,
    num_tool_changes: usize,
    used_filament_length: Vec<CoordF>,
}

impl WipeTower {
    /// Create a new wipe tower with `initial_tool` loaded
    pub fn new(config: &PrintConfig, initial_tool: u32) -> Self {
        let nozzle = config.extruder(initial_tool as usize).nozzle_diameter;
        let n = config.extruder_count().max(1);
        Self {
            width: config.wipe_tower.width,
            brim_width: config.wipe_tower.brim_width,
            speed: config.wipe_tower.speed,
            first_layer_speed: config.first_layer_speed,
            prime_volume: config.wipe_tower.prime_volume,
            perimeter_width: nozzle * WIDTH_TO_NOZZLE_RATIO,
            filament_areas: (0..n).map(|i| config.extruder(i).filament_area()).collect(),
            plan: Vec::new(),
            depth: 0.0,
            extra_spacing: 1.0,
            current_tool: initial_tool,
            layer_idx: 0,
            tool_change_idx: 0,
            depth_traversed: 0.0,
            print_brim: config.wipe_tower.brim_width > 0.0,
            num_tool_changes: 0,
            used_filament_length: vec![0.0; n],
        }
    }

    /// Line cross-section: rectangle with rounded ends (mm²)
    fn line_area(&self, layer_height: CoordF) -> CoordF {
        layer_height * (self.perimeter_width - layer_height * (1.0 - PI / 4.0))
    }

    fn filament_area(&self, tool: u32) -> CoordF {
        self.filament_areas
            .get(tool as usize)
            .copied()
            .unwrap_or(PI * 0.875 * 0.875)
    }

    /// Filament length per mm of tower line
    fn extrusion_flow(&self, layer_height: CoordF, tool: u32) -> CoordF {
        self.line_area(layer_height) / self.filament_area(tool)
    }

    /// Convert volume to line length
    fn volume_to_length(&self, volume: CoordF, layer_height: CoordF) -> CoordF {
        let area = self.line_area(layer_height);
        if area > 0.0 {
            volume / area
        } else {
            0.0
        }
    }

    pub fn width(&self) -> CoordF {
        self.width
    }

    pub fn depth(&self) -> CoordF {
        self.depth
    }

    pub fn brim_width(&self) -> CoordF {
        self.brim_width
    }

    pub fn perimeter_width(&self) -> CoordF {
        self.perimeter_width
    }

    pub fn plan(&self) -> &[WipeTowerLayerInfo] {
        &self.plan
    }

    pub fn number_of_toolchanges(&self) -> usize {
        self.num_tool_changes
    }

    /// Filament used per extruder by everything generated so far (mm)
    pub fn used_filament(&self) -> &[CoordF] {
        &self.used_filament_length
    }

    /// Tower-local footprint including the brim
    pub fn bounding_box(&self) -> BoundingBoxF {
        BoundingBoxF::from_coords(
            -self.brim_width,
            -self.brim_width,
            self.width + self.brim_width,
            self.depth + self.brim_width,
        )
    }

    /// Minimum depth keeping a tower of `max_height` stable
    pub fn limit_depth_by_height(max_height: CoordF) -> CoordF {
        for &(height, depth) in MIN_DEPTH_PER_HEIGHT {
            if max_height <= height {
                return depth;
            }
        }
        let (h, d) = MIN_DEPTH_PER_HEIGHT[MIN_DEPTH_PER_HEIGHT.len() - 1];
        max_height * d / h
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Register a tool change. `old_tool == new_tool` only makes sure the
    /// layer exists so the tower keeps growing.
    pub fn plan_toolchange(
        &mut self,
        z: CoordF,
        layer_height: CoordF,
        old_tool: u32,
        new_tool: u32,
        wipe_volume: CoordF,
    ) {
        let needs_layer = match self.plan.last() {
            Some(last) => last.z + WT_EPSILON < z,
            None => true,
        };
        if needs_layer {
            self.plan.push(WipeTowerLayerInfo::new(z, layer_height));
        }
        if old_tool == new_tool {
            return;
        }

        let line_len = self.width - 2.0 * self.perimeter_width;
        if line_len <= WT_EPSILON {
            return;
        }
        let wipe_length = self.volume_to_length(wipe_volume, layer_height);
        let lines = ((wipe_length / line_len).ceil() as usize).max(1);
        let tool_change = ToolChangeInfo {
            old_tool,
            new_tool,
            required_depth: lines as CoordF * self.perimeter_width,
            wipe_volume,
            wipe_length,
        };
        if let Some(layer) = self.plan.last_mut() {
            layer.tool_changes.push(tool_change);
            self.num_tool_changes += 1;
        }
    }

    /// Size the tower once every tool change is planned
    pub fn plan_tower(&mut self) {
        let max_depth = self
            .plan
            .iter()
            .map(|info| info.toolchanges_depth())
            .fold(0.0, CoordF::max);
        let max_height = self.plan.last().map(|l| l.z).unwrap_or(0.0);
        let min_depth = Self::limit_depth_by_height(max_height);

        self.extra_spacing = if max_depth > WT_EPSILON && max_depth + WT_EPSILON < min_depth {
            min_depth / max_depth
        } else {
            1.0
        };

        let extra_spacing = self.extra_spacing;
        for (idx, info) in self.plan.iter_mut().enumerate() {
            // The first layer stays dense for adhesion
            info.extra_spacing = if idx == 0 { 1.0 } else { extra_spacing };
            for tc in &mut info.tool_changes {
                tc.required_depth *= info.extra_spacing;
            }
        }

        self.depth = self
            .plan
            .iter()
            .map(|info| info.toolchanges_depth())
            .fold(0.0, CoordF::max)
            .max(min_depth)
            + 2.0 * self.perimeter_width;
        debug!(
            layers = self.plan.len(),
            depth = self.depth,
            extra_spacing = self.extra_spacing,
            "wipe tower planned"
        );
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Generate all fragments, per layer the tool changes followed by the
    /// layer finish.
    pub fn generate(&mut self) -> Vec<Vec<ToolChangeResult>> {
        self.plan_tower();

        let mut results = Vec::with_capacity(self.plan.len());
        for layer_idx in 0..self.plan.len() {
            self.layer_idx = layer_idx;
            self.tool_change_idx = 0;
            self.depth_traversed = self.perimeter_width;

            let new_tools: Vec<u32> = self.plan[layer_idx]
                .tool_changes
                .iter()
                .map(|tc| tc.new_tool)
                .collect();
            let mut layer_results = Vec::with_capacity(new_tools.len() + 1);
            for new_tool in new_tools {
                layer_results.push(self.tool_change(new_tool));
            }
            layer_results.push(self.finish_layer());
            results.push(layer_results);
        }
        results
    }

    fn layer(&self) -> (CoordF, CoordF, CoordF) {
        self.plan
            .get(self.layer_idx)
            .map(|l| (l.z, l.height, l.extra_spacing))
            .unwrap_or((0.0, 0.2, 1.0))
    }

    fn print_speed(&self) -> CoordF {
        if self.layer_idx == 0 {
            self.speed.min(self.first_layer_speed)
        } else {
            self.speed
        }
    }

    fn new_writer(&self, pos: PointF, layer_height: CoordF, tool: u32) -> WipeTowerWriter {
        let mut writer = WipeTowerWriter::new(pos, self.extrusion_flow(layer_height, tool));
        writer.append(WIPE_TOWER_START).append("\n");
        writer
    }

    /// Perform the next planned tool change of the current layer
    fn tool_change(&mut self, new_tool: u32) -> ToolChangeResult {
        let old_tool = self.current_tool;
        let (z, layer_height, spacing_factor) = self.layer();
        let info = self
            .plan
            .get(self.layer_idx)
            .and_then(|l| l.tool_changes.get(self.tool_change_idx))
            .cloned()
            .unwrap_or(ToolChangeInfo {
                old_tool,
                new_tool,
                required_depth: self.perimeter_width,
                wipe_volume: 0.0,
                wipe_length: 0.0,
            });
        self.tool_change_idx += 1;

        let pw = self.perimeter_width;
        let dy = pw * spacing_factor;
        let xl = pw;
        let xr = self.width - pw;
        let y0 = self.depth_traversed + dy / 2.0;

        let mut writer = self.new_writer(PointF::new(xl, y0), layer_height, new_tool);
        writer.comment(&format!("tool change T{} -> T{}", old_tool, new_tool));
        writer.travel(xl, y0);
        writer.append(TOOLCHANGE_PLACEHOLDER).append("\n");
        writer.feedrate(self.print_speed() * 60.0);
        writer.wipe_rows(xl, xr, y0, dy, info.wipe_length);
        writer.append(WIPE_TOWER_END).append("\n");

        self.depth_traversed += info.required_depth;
        self.current_tool = new_tool;
        self.construct_tcr(writer, z, layer_height, false, true, old_tool, info.wipe_volume)
    }

    /// Sparse fill of the rest of the layer, the tower outline, and the brim
    /// on the first layer.
    fn finish_layer(&mut self) -> ToolChangeResult {
        let (z, layer_height, spacing_factor) = self.layer();
        let is_first_layer = self.layer_idx == 0;
        let tool = self.current_tool;
        let pw = self.perimeter_width;

        let mut writer = self.new_writer(PointF::new(pw, self.depth_traversed), layer_height, tool);
        writer.comment("finish layer");
        writer.append(TOOLCHANGE_PLACEHOLDER).append("\n");
        writer.feedrate(self.print_speed() * 60.0);

        let fill_box = BoxCoordinates::new(
            pw,
            self.depth_traversed,
            self.width - 2.0 * pw,
            self.depth - self.depth_traversed - pw,
        );
        if fill_box.height() > pw {
            let spacing = if is_first_layer {
                pw
            } else {
                pw * spacing_factor.max(2.0)
            };
            writer.rectangle_fill_box(&fill_box, spacing);
        }

        let wt_box = BoxCoordinates::new(0.0, 0.0, self.width, self.depth);
        writer.rectangle(&wt_box);

        if is_first_layer && self.print_brim {
            let brim_spacing = pw * BRIM_SPACING_RATIO;
            let num_loops = (self.brim_width / brim_spacing).ceil() as usize;
            for i in 1..=num_loops {
                let mut brim_box = wt_box;
                brim_box.expand(i as CoordF * brim_spacing);
                writer.rectangle(&brim_box);
            }
            self.print_brim = false;
        }
        writer.append(WIPE_TOWER_END).append("\n");

        self.depth_traversed = self.depth;
        self.construct_tcr(writer, z, layer_height, false, false, tool, 0.0)
    }

    /// Prime lines in front of the tower, one block per tool
    pub fn prime(&mut self, tools_to_prime: &[u32]) -> Vec<ToolChangeResult> {
        let (z, layer_height) = self
            .plan
            .first()
            .map(|l| (l.z, l.height))
            .unwrap_or((0.2, 0.2));
        let pw = self.perimeter_width;
        let mut y = -(self.brim_width + 2.0 * pw);
        let mut results = Vec::with_capacity(tools_to_prime.len());

        for &tool in tools_to_prime {
            let old_tool = self.current_tool;
            let length = self.volume_to_length(self.prime_volume, layer_height);
            let rows = ((length / self.width).ceil() as usize).max(1);

            let mut writer = self.new_writer(PointF::new(0.0, y), layer_height, tool);
            writer.comment(&format!("prime T{}", tool));
            writer.travel(0.0, y);
            writer.append(TOOLCHANGE_PLACEHOLDER).append("\n");
            writer.feedrate(self.first_layer_speed * 60.0);
            writer.wipe_rows(0.0, self.width, y, -pw, length);
            writer.append(WIPE_TOWER_END).append("\n");
            y -= rows as CoordF * pw + pw;

            self.current_tool = tool;
            let mut tcr = self.construct_tcr(writer, z, layer_height, true, old_tool != tool, old_tool, 0.0);
            tcr.priming = true;
            results.push(tcr);
        }
        results
    }

    /// Purge of the loaded filament on top of the tower at the end of a
    /// single-extruder multi-material print.
    pub fn final_purge(&mut self) -> ToolChangeResult {
        let (z, layer_height) = self
            .plan
            .last()
            .map(|l| (l.z + l.height, l.height))
            .unwrap_or((0.2, 0.2));
        let tool = self.current_tool;
        let pw = self.perimeter_width;
        let length = self.volume_to_length(self.prime_volume, layer_height);

        let mut writer = self.new_writer(PointF::new(pw, pw), layer_height, tool);
        writer.comment("final purge");
        writer.travel(pw, pw * 1.5);
        writer.append(TOOLCHANGE_PLACEHOLDER).append("\n");
        writer.feedrate(self.speed * 60.0);
        writer.wipe_rows(pw, self.width - pw, pw * 1.5, pw, length);
        writer.append(WIPE_TOWER_END).append("\n");
        self.construct_tcr(writer, z, layer_height, false, false, tool, self.prime_volume)
    }

    #[allow(clippy::too_many_arguments)]
    fn construct_tcr(
        &mut self,
        writer: WipeTowerWriter,
        print_z: CoordF,
        layer_height: CoordF,
        priming: bool,
        is_tool_change: bool,
        old_tool: u32,
        purge_volume: CoordF,
    ) -> ToolChangeResult {
        let tool = self.current_tool;
        if let Some(slot) = self.used_filament_length.get_mut(tool as usize) {
            *slot += writer.used_filament_length;
        }
        ToolChangeResult {
            print_z,
            layer_height,
            start_pos: writer.start_pos(),
            end_pos: writer.current_pos,
            elapsed_time: writer.elapsed_time,
            used_filament: writer.used_filament_length,
            gcode: writer.gcode,
            priming,
            is_tool_change,
            initial_tool: old_tool,
            new_tool: tool,
            purge_volume,
        }
    }
}

// ============================================================================
// Integration
// ============================================================================

/// Hands out the pre-generated tower fragments during emission.
///
/// Only ever driven by the single emission sequence, one layer after the
/// other.
#[derive(Debug, Clone)]
pub struct WipeTowerIntegration {
    position: PointF,
    rotation: CoordF,
    footprint: BoundingBoxF,
    priming: Vec<ToolChangeResult>,
    tool_changes: Vec<Vec<ToolChangeResult>>,
    final_purge: Option<ToolChangeResult>,
    layer_idx: Option<usize>,
    tool_change_idx: usize,
    is_first_print: bool,
    used_filament: Vec<CoordF>,
}

impl WipeTowerIntegration {
    /// Plan and generate the tower for `ordering`. `None` when the print
    /// needs no tower.
    pub fn plan(ordering: &ToolOrdering, config: &PrintConfig) -> Option<Self> {
        if !config.has_wipe_tower() || !ordering.has_wipe_tower() {
            return None;
        }
        let first = ordering.first_extruder()?;

        let mut tower = WipeTower::new(config, first);
        let mut current = first;
        for lt in ordering.iter() {
            if lt.has_wipe_tower {
                let changes = lt.tool_changes(Some(current));
                if changes.is_empty() {
                    tower.plan_toolchange(lt.print_z, lt.wipe_tower_layer_height, current, current, 0.0);
                }
                for (old, new) in changes {
                    let volume = lt
                        .wiping_extrusions()
                        .tower_purge_volume(new)
                        .unwrap_or_else(|| config.flush_volume(old as usize, new as usize));
                    tower.plan_toolchange(lt.print_z, lt.wipe_tower_layer_height, old, new, volume);
                }
            }
            if let Some(&last) = lt.extruders.last() {
                current = last;
            }
        }

        let tool_changes = tower.generate();
        let priming = tower.prime(&[first]);
        let final_purge = config
            .single_extruder_multi_material
            .then(|| tower.final_purge());

        let position = PointF::new(config.wipe_tower.x, config.wipe_tower.y);
        let rotation = config.wipe_tower.rotation_angle;
        let local = tower.bounding_box();
        let corners = [
            PointF::new(local.min.x, local.min.y),
            PointF::new(local.max.x, local.min.y),
            PointF::new(local.max.x, local.max.y),
            PointF::new(local.min.x, local.max.y),
        ]
        .map(|p| p.rotate_around(PointF::new(0.0, 0.0), rotation) + position);
        let footprint = BoundingBoxF::from_coords(
            corners.iter().map(|p| p.x).fold(CoordF::MAX, CoordF::min),
            corners.iter().map(|p| p.y).fold(CoordF::MAX, CoordF::min),
            corners.iter().map(|p| p.x).fold(CoordF::MIN, CoordF::max),
            corners.iter().map(|p| p.y).fold(CoordF::MIN, CoordF::max),
        );

        debug!(
            layers = tool_changes.len(),
            tool_changes = tower.number_of_toolchanges(),
            depth = tower.depth(),
            "wipe tower generated"
        );
        Some(Self {
            position,
            rotation,
            footprint,
            priming,
            tool_changes,
            final_purge,
            layer_idx: None,
            tool_change_idx: 0,
            is_first_print: true,
            used_filament: vec![0.0; config.extruder_count()],
        })
    }

    /// Tower footprint on the bed, brim included
    pub fn footprint(&self) -> BoundingBoxF {
        self.footprint
    }

    /// Number of tower layers
    pub fn layer_count(&self) -> usize {
        self.tool_changes.len()
    }

    /// Whether nothing was printed on the tower yet
    pub fn is_first_print(&self) -> bool {
        self.is_first_print
    }

    /// Filament extruded on the tower per extruder (mm)
    pub fn used_filament_length(&self) -> Vec<CoordF> {
        self.used_filament.clone()
    }

    /// Advance to the next tower layer
    pub fn next_layer(&mut self) {
        self.layer_idx = Some(self.layer_idx.map_or(0, |i| i + 1));
        self.tool_change_idx = 0;
    }

    fn transform(&self, p: PointF) -> PointF {
        p.rotate_around(PointF::new(0.0, 0.0), self.rotation) + self.position
    }

    /// Rewrite the XY words of the fragment's moves onto the bed
    fn transform_gcode(&self, gcode: &str, start: PointF) -> String {
        let mut out = String::with_capacity(gcode.len() + gcode.len() / 4);
        let mut local = start;
        for line in gcode.lines() {
            let Some(mov) = GCodeMove::parse(line).filter(|m| m.has_xy()) else {
                out.push_str(line);
                out.push('\n');
                continue;
            };
            local = PointF::new(mov.x.unwrap_or(local.x), mov.y.unwrap_or(local.y));
            let p = self.transform(local);
            let _ = write!(out, "G1 X{:.3} Y{:.3}", p.x, p.y);
            if let Some(e) = mov.e {
                let _ = write!(out, " E{:.5}", e);
            }
            if let Some(f) = mov.f {
                let _ = write!(out, " F{:.0}", f);
            }
            out.push('\n');
        }
        out
    }

    /// Splice one fragment into the emission: park on the tower, run the
    /// fragment and leave the state where the fragment ends.
    fn append_tcr(
        &mut self,
        state: &mut EmitterState<'_>,
        tcr: &ToolChangeResult,
        new_extruder: Option<u32>,
    ) -> Result<String> {
        let mut gcode = state.close_label();
        gcode.push_str(&state.retract(tcr.is_tool_change));
        if (state.writer().z() - tcr.print_z).abs() > WT_EPSILON {
            gcode.push_str(&state.travel_to_z(tcr.print_z));
        }
        gcode.push_str(&state.move_to(self.transform(tcr.start_pos), "move to wipe tower"));
        let _ = writeln!(gcode, ";TYPE:{}", ExtrusionRole::WipeTower.name());

        let mut switch = String::new();
        if let Some(extruder) = new_extruder {
            state.set_phase(EmitterPhase::ToolChanging);
            switch.push_str(&state.set_extruder(extruder)?);
        }
        switch.push_str(&state.unretract());

        let body = self.transform_gcode(&tcr.gcode, tcr.start_pos);
        match body.find(TOOLCHANGE_PLACEHOLDER) {
            Some(at) => {
                let rest = &body[at + TOOLCHANGE_PLACEHOLDER.len()..];
                gcode.push_str(&body[..at]);
                gcode.push_str(&switch);
                gcode.push_str(rest.strip_prefix('\n').unwrap_or(rest));
            }
            None => {
                gcode.push_str(&switch);
                gcode.push_str(&body);
            }
        }

        state.resume_after_tower(self.transform(tcr.end_pos));
        if let Some(slot) = self.used_filament.get_mut(tcr.new_tool as usize) {
            *slot += tcr.used_filament;
        }
        self.is_first_print = false;
        Ok(gcode)
    }

    /// Tower fragments due before printing with `extruder_id`: the tool
    /// change when one is needed and, on the layer's last extruder, the
    /// layer finish.
    pub fn tool_change(
        &mut self,
        state: &mut EmitterState<'_>,
        extruder_id: u32,
        finish_layer: bool,
    ) -> Result<String> {
        let layer_idx = self
            .layer_idx
            .ok_or_else(|| Error::Pipeline("wipe tower used before its first layer".into()))?;
        let mut gcode = String::new();

        if state.need_toolchange(extruder_id) {
            let tcr = self
                .tool_changes
                .get(layer_idx)
                .and_then(|layer| layer.get(self.tool_change_idx))
                .filter(|tcr| tcr.is_tool_change)
                .cloned()
                .ok_or_else(|| {
                    Error::Pipeline(format!(
                        "no wipe tower tool change left on tower layer {} for extruder {}",
                        layer_idx, extruder_id
                    ))
                })?;
            if tcr.new_tool != extruder_id {
                return Err(Error::Pipeline(format!(
                    "wipe tower planned a change to extruder {} but extruder {} was requested",
                    tcr.new_tool, extruder_id
                )));
            }
            self.tool_change_idx += 1;
            gcode.push_str(&self.append_tcr(state, &tcr, Some(extruder_id))?);
        }

        if finish_layer {
            let tcr = self
                .tool_changes
                .get(layer_idx)
                .and_then(|layer| layer.get(self.tool_change_idx))
                .filter(|tcr| !tcr.is_tool_change)
                .cloned()
                .ok_or_else(|| {
                    Error::Pipeline(format!("wipe tower layer {} has no finish block left", layer_idx))
                })?;
            self.tool_change_idx += 1;
            gcode.push_str(&self.append_tcr(state, &tcr, None)?);
        }
        Ok(gcode)
    }

    /// Prime lines printed before the first layer
    pub fn prime(&mut self, state: &mut EmitterState<'_>) -> Result<String> {
        let priming = std::mem::take(&mut self.priming);
        let mut gcode = String::new();
        for tcr in &priming {
            let switch = state.need_toolchange(tcr.new_tool).then_some(tcr.new_tool);
            gcode.push_str(&self.append_tcr(state, tcr, switch)?);
        }
        if !gcode.is_empty() {
            gcode.insert_str(0, "; priming\n");
        }
        Ok(gcode)
    }

    /// Final purge after the last layer, if one was generated
    pub fn finalize(&mut self, state: &mut EmitterState<'_>) -> Result<String> {
        match self.final_purge.take() {
            Some(tcr) => self.append_tcr(state, &tcr, None),
            None => Ok(String::new()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
