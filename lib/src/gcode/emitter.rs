//! Extrusion emitter.
//!
//! Emission is split in two halves:
//!
//! - [`render_layer`] turns the sorted plan of one layer into self-contained
//!   blocks of relative-E extrusion moves. It only reads the print and the
//!   configuration, so the pipeline runs it on worker threads.
//! - [`EmitterState`] stitches rendered layers into the output strictly in
//!   layer order: layer changes, custom G-code, tool changes (through the wipe
//!   tower when there is one), travels with their retractions, accelerations
//!   and object labels. It owns all machine state.
//!
//! Every rendered path is a block opened by a feedrate line tagged
//! `;_EXTRUDE_SET_SPEED` and closed by `;_EXTRUDE_END`, which is what the
//! cooling buffer rescales.

use crate::config::{GCodeFlavor, PrintConfig, PrintRegionConfig, SeamPosition};
use crate::gcode::layers::LayerGroup;
use crate::gcode::object_by_extruder::sort_layer;
use crate::gcode::placeholder::{PlaceholderParser, TemplateWarning};
use crate::gcode::tool_ordering::LayerTools;
use crate::gcode::wipe_tower::WipeTowerIntegration;
use crate::gcode::writer::{GCodeWriter, EXTRUDE_END_TAG};
use crate::geometry::{BoundingBox, Point, PointF, Polygon, Polyline};
use crate::print::{CustomGCodeItem, CustomGCodeType};
use crate::travel::{travel_within_single_island, AvoidCrossingPerimeters, StraightRouter, TravelRouter};
use crate::{
    CoordF, Error, ExtrusionEntity, ExtrusionLoop, ExtrusionPath, ExtrusionRole, Result,
    SCALING_FACTOR,
};
use std::fmt::Write as _;
use tracing::trace;

/// Number of intermediate speeds used when ramping between two paths.
const RAMP_STEPS: usize = 3;

/// Positions closer than this are the same point (mm).
const POSITION_EPSILON: CoordF = 1e-3;

/// Width/height changes below this do not get a new marker (mm).
const MARKER_EPSILON: CoordF = 1e-4;

// ============================================================================
// Rendered layers
// ============================================================================

/// One extrusion path ready to be spliced into the output.
#[derive(Debug, Clone)]
pub struct RenderedPath {
    pub role: ExtrusionRole,
    /// First point on the bed (mm).
    pub start: PointF,
    /// Last point on the bed (mm).
    pub end: PointF,
    /// Tagged feedrate line, relative-E moves and the end tag.
    pub gcode: String,
    /// Printed length (mm).
    pub length: CoordF,
    /// Filament pushed (mm).
    pub filament: CoordF,
    /// Estimated print time (s).
    pub time: CoordF,
    /// Acceleration to set before the path (0 = leave as is).
    pub acceleration: u32,
    /// Extrusion width and height (mm).
    pub width: CoordF,
    pub height: CoordF,
    /// Polyline on the bed (mm), used for wiping after the path.
    pub points: Vec<PointF>,
}

/// Everything one extruder prints on one object copy, rendered.
#[derive(Debug, Clone)]
pub struct RenderedRecord {
    pub object_id: usize,
    pub object_name: String,
    pub instance: usize,
    pub label_id: usize,
    /// Zero-based extruder.
    pub extruder: u32,
    pub wiping: bool,
    pub paths: Vec<RenderedPath>,
}

/// A layer rendered by a worker, waiting for its turn in the emission.
#[derive(Debug, Clone)]
pub struct RenderedLayer {
    /// Position in the emission sequence of the current object or print.
    pub index: usize,
    pub print_z: CoordF,
    pub height: CoordF,
    pub layer_tools: LayerTools,
    /// Island outlines of every printed copy, bed coordinates (scaled).
    pub islands: Vec<Polygon>,
    pub records: Vec<RenderedRecord>,
    pub spiral_vase: bool,
}

impl RenderedLayer {
    /// An empty layer at `print_z`, used for layers with nothing to print.
    pub fn empty(index: usize, print_z: CoordF, height: CoordF, layer_tools: LayerTools) -> Self {
        Self {
            index,
            print_z,
            height,
            layer_tools,
            islands: Vec::new(),
            records: Vec::new(),
            spiral_vase: false,
        }
    }

    pub fn path_count(&self) -> usize {
        self.records.iter().map(|r| r.paths.len()).sum()
    }
}

/// Per-path settings shared by all entities of one region of one copy.
struct RenderContext<'c> {
    config: &'c PrintConfig,
    region: &'c PrintRegionConfig,
    shift: Point,
    filament_area: CoordF,
    first_layer: bool,
}

impl RenderContext<'_> {
    fn render_entity(&self, entity: &ExtrusionEntity, out: &mut Vec<RenderedPath>) {
        match entity {
            ExtrusionEntity::Path(p) => self.render_chain(std::slice::from_ref(p), None, out),
            ExtrusionEntity::MultiPath(mp) => self.render_chain(&mp.paths, None, out),
            ExtrusionEntity::Loop(l) => {
                let paths = loop_from_seam(l, self.region.seam_position, self.region.seam_gap);
                self.render_chain(&paths, Some(l.length()), out);
            }
            ExtrusionEntity::Collection(c) => {
                for e in &c.entities {
                    self.render_entity(e, out);
                }
            }
        }
    }

    fn path_speed(&self, path: &ExtrusionPath, loop_length: Option<CoordF>) -> CoordF {
        let mut speed = self.region.speed_for_role(path.role);
        if path.overhang_degree > 0 && path.role.is_perimeter() {
            let t = CoordF::from(path.overhang_degree.min(5)) / 5.0;
            speed += (self.region.overhang_speed - speed) * t;
        }
        if path.role.is_perimeter()
            && loop_length.is_some_and(|len| len < self.region.small_perimeter_threshold)
        {
            speed = speed.min(self.region.small_perimeter_speed);
        }
        if self.first_layer && self.config.first_layer_speed > 0.0 {
            speed = speed.min(self.config.first_layer_speed);
        }
        speed.max(1.0)
    }

    fn acceleration(&self, role: ExtrusionRole) -> u32 {
        if self.first_layer {
            return self.config.first_layer_acceleration;
        }
        match self.region.acceleration_for_role(role) {
            0 => self.config.default_acceleration,
            a => a,
        }
    }

    /// Paths printed back to back; speed changes between them are ramped.
    fn render_chain(
        &self,
        paths: &[ExtrusionPath],
        loop_length: Option<CoordF>,
        out: &mut Vec<RenderedPath>,
    ) {
        let mut previous_speed: Option<CoordF> = None;
        for path in paths {
            if path.polyline.len() < 2 {
                continue;
            }
            let speed = self.path_speed(path, loop_length);
            let ramp_from = previous_speed.filter(|&v| {
                self.config.smooth_speed_discontinuity
                    && self.config.speed_ramp_length > 0.0
                    && (v - speed).abs() > 1e-3
            });
            out.push(self.render_path(path, speed, ramp_from));
            previous_speed = Some(speed);
        }
    }

    fn render_path(&self, path: &ExtrusionPath, speed: CoordF, ramp_from: Option<CoordF>) -> RenderedPath {
        let points: Vec<PointF> = path
            .polyline
            .points
            .iter()
            .map(|p| (*p + self.shift).to_f64())
            .collect();
        let marks: Vec<CoordF> = match ramp_from {
            Some(_) => (1..=RAMP_STEPS)
                .map(|i| self.config.speed_ramp_length * i as CoordF / RAMP_STEPS as CoordF)
                .collect(),
            None => Vec::new(),
        };
        let step_speed = |step: usize| match ramp_from {
            Some(v0) if step < RAMP_STEPS => {
                v0 + (speed - v0) * (step + 1) as CoordF / (RAMP_STEPS + 1) as CoordF
            }
            _ => speed,
        };

        let e_per_mm = path.mm3_per_mm / self.filament_area;
        let mut gcode = GCodeWriter::speed_line(step_speed(0), true);
        let mut current_step = 0;
        let (mut length, mut filament, mut time) = (0.0, 0.0, 0.0);
        let start = points[0];
        let mut from = start;
        for (to, step) in split_at_marks(&points, &marks) {
            let d = from.distance(&to);
            if d <= 1e-6 {
                continue;
            }
            if step != current_step {
                gcode.push_str(&GCodeWriter::speed_line(step_speed(step), true));
                current_step = step;
            }
            let e = d * e_per_mm;
            gcode.push_str(&GCodeWriter::extrusion_line(to, e));
            length += d;
            filament += e;
            time += d / step_speed(step);
            from = to;
        }
        gcode.push_str(EXTRUDE_END_TAG);
        gcode.push('\n');

        RenderedPath {
            role: path.role,
            start,
            end: from,
            gcode,
            length,
            filament,
            time,
            acceleration: self.acceleration(path.role),
            width: path.width,
            height: path.height,
            points,
        }
    }
}

/// Polyline vertices with extra split points at the distances in `marks`,
/// each tagged with the number of marks passed before it.
fn split_at_marks(points: &[PointF], marks: &[CoordF]) -> Vec<(PointF, usize)> {
    let mut out = Vec::with_capacity(points.len() + marks.len());
    let mut walked = 0.0;
    let mut mark = 0;
    for w in points.windows(2) {
        let (a, b) = (w[0], w[1]);
        let seg = a.distance(&b);
        while mark < marks.len() && marks[mark] < walked + seg {
            let t = (marks[mark] - walked) / seg;
            out.push((PointF::new(a.x + (b.x - a.x) * t, a.y + (b.y - a.y) * t), mark));
            mark += 1;
        }
        out.push((b, mark));
        walked += seg;
    }
    out
}

fn seam_index(points: &[Point], seam: SeamPosition) -> usize {
    match seam {
        SeamPosition::Rear => points
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.y.cmp(&b.y).then(b.x.cmp(&a.x)))
            .map(|(i, _)| i)
            .unwrap_or(0),
        SeamPosition::Aligned => {
            let bb = BoundingBox::from_points(points);
            Point::new(bb.min.x, bb.max.y)
                .nearest_point_index(points)
                .unwrap_or(0)
        }
    }
}

/// The loop's paths rotated to start at the seam vertex, with the end
/// stopping `seam_gap` mm short of it.
fn loop_from_seam(l: &ExtrusionLoop, seam: SeamPosition, seam_gap: CoordF) -> Vec<ExtrusionPath> {
    let points = l.points();
    if points.is_empty() {
        return l.paths.clone();
    }
    let seam_point = points[seam_index(&points, seam)];
    let Some((pi, k)) = l.paths.iter().enumerate().find_map(|(pi, p)| {
        p.polyline
            .points
            .iter()
            .position(|q| *q == seam_point)
            .map(|k| (pi, k))
    }) else {
        return l.paths.clone();
    };

    let split = &l.paths[pi];
    let closed = &split.polyline.points;
    if l.paths.len() == 1 && closed.len() > 2 && closed.first() == closed.last() {
        let mut path = split.clone();
        let mut rotated = closed[k..].to_vec();
        rotated.extend_from_slice(&closed[1..=k]);
        path.polyline = Polyline::new(rotated);
        let mut out = vec![path];
        clip_chain_end(&mut out, seam_gap);
        return out;
    }

    let mut out = Vec::with_capacity(l.paths.len() + 1);
    let mut tail = split.clone();
    tail.polyline = Polyline::new(split.polyline.points[k..].to_vec());
    if tail.polyline.len() >= 2 {
        out.push(tail);
    }
    out.extend(l.paths[pi + 1..].iter().cloned());
    out.extend(l.paths[..pi].iter().cloned());
    let mut head = split.clone();
    head.polyline = Polyline::new(split.polyline.points[..=k].to_vec());
    if head.polyline.len() >= 2 {
        out.push(head);
    }

    clip_chain_end(&mut out, seam_gap);
    out
}

fn clip_chain_end(paths: &mut Vec<ExtrusionPath>, gap: CoordF) {
    if gap <= 0.0 {
        return;
    }
    let total: CoordF = paths.iter().map(|p| p.length()).sum();
    if total <= 2.0 * gap {
        return;
    }
    let mut remaining = gap * SCALING_FACTOR;
    while remaining > 0.0 {
        let Some(last) = paths.last_mut() else {
            break;
        };
        let len = last.polyline.length();
        if len <= remaining {
            remaining -= len;
            paths.pop();
        } else {
            last.polyline.clip_end(remaining);
            break;
        }
    }
}

/// Render one layer group.
///
/// Pure function of its inputs; `layer_index` 0 is printed with first layer
/// speeds and accelerations. `single_object_instance` restricts the layer to
/// one `(object id, instance)` pair.
pub fn render_layer(
    group: &LayerGroup<'_>,
    lt: &LayerTools,
    config: &PrintConfig,
    layer_index: usize,
    single_object_instance: Option<(usize, usize)>,
) -> Result<RenderedLayer> {
    let first_layer = layer_index == 0;
    let records = sort_layer(group, lt, single_object_instance);

    let mut islands = Vec::new();
    for layer in &group.layers {
        let Some(object_layer) = layer.object_layer else {
            continue;
        };
        for (instance, copy) in layer.object.instances().iter().enumerate() {
            if single_object_instance.is_some_and(|sel| sel != (layer.object.id(), instance)) {
                continue;
            }
            for island in &object_layer.lslices {
                let mut island = island.clone();
                island.translate(copy.shift);
                islands.push(island);
            }
        }
    }

    let mut rendered = Vec::with_capacity(records.len());
    for record in &records {
        let object = record.object;
        let filament_area = config.extruder(record.extruder as usize).filament_area();
        let mut paths = Vec::new();
        let entities = record
            .support
            .iter()
            .copied()
            .chain(record.islands.iter().flat_map(|i| i.entities(config.infill_first)));
        for entity_ref in entities {
            entity_ref
                .entity
                .validate()
                .map_err(|message| Error::Geometry {
                    object: object.name().to_string(),
                    message: format!("layer at z={:.3}: {}", group.print_z, message),
                })?;
            let region = object.region_config(entity_ref.region_id);
            let ctx = RenderContext {
                config,
                region: &region,
                shift: record.shift,
                filament_area,
                first_layer,
            };
            ctx.render_entity(entity_ref.entity, &mut paths);
        }
        rendered.push(RenderedRecord {
            object_id: object.id(),
            object_name: object.name().to_string(),
            instance: record.instance,
            label_id: object
                .instances()
                .get(record.instance)
                .map(|i| i.label_id)
                .unwrap_or(0),
            extruder: record.extruder,
            wiping: record.wiping,
            paths,
        });
    }

    let spiral_vase =
        config.spiral_vase && layer_index > 0 && rendered.len() == 1 && !group.has_support();
    trace!(
        layer = layer_index,
        print_z = group.print_z,
        records = rendered.len(),
        "layer rendered"
    );
    Ok(RenderedLayer {
        index: layer_index,
        print_z: group.print_z,
        height: group.height(),
        layer_tools: lt.clone(),
        islands,
        records: rendered,
        spiral_vase,
    })
}

/// The last `distance` mm of `points`, walked backwards from the end.
fn wipe_path(points: &[PointF], distance: CoordF) -> Vec<PointF> {
    let Some(&last) = points.last() else {
        return Vec::new();
    };
    if distance <= 0.0 {
        return Vec::new();
    }
    let mut out = vec![last];
    let mut left = distance;
    for w in points.windows(2).rev() {
        let (a, b) = (w[1], w[0]);
        let d = a.distance(&b);
        if d <= 1e-9 {
            continue;
        }
        if d >= left {
            let t = left / d;
            out.push(PointF::new(a.x + (b.x - a.x) * t, a.y + (b.y - a.y) * t));
            return out;
        }
        out.push(b);
        left -= d;
    }
    out
}

// ============================================================================
// Object labels
// ============================================================================

/// Firmware-safe name of one object copy.
pub fn label_name(object_name: &str, object_id: usize, instance: usize) -> String {
    let name: String = object_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}_id_{}_copy_{}", name, object_id, instance)
}

fn label_start(flavor: GCodeFlavor, id: usize, name: &str) -> String {
    match flavor {
        GCodeFlavor::Marlin => format!("M486 S{}\n", id),
        GCodeFlavor::Klipper => format!("EXCLUDE_OBJECT_START NAME={}\n", name),
        GCodeFlavor::RepRap => format!("; printing object {}\n", name),
    }
}

fn label_end(flavor: GCodeFlavor, name: &str) -> String {
    match flavor {
        GCodeFlavor::Marlin => "M486 S-1\n".to_string(),
        GCodeFlavor::Klipper => format!("EXCLUDE_OBJECT_END NAME={}\n", name),
        GCodeFlavor::RepRap => format!("; stop printing object {}\n", name),
    }
}

// ============================================================================
// Emitter state
// ============================================================================

/// What the machine is doing between two emitted lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmitterPhase {
    #[default]
    Idle,
    Traveling,
    Extruding,
    Retracted,
    ToolChanging,
}

/// Output of one emitted layer, before the post-filters.
#[derive(Debug, Clone)]
pub struct LayerResult {
    pub gcode: String,
    pub layer_id: usize,
    pub spiral_vase_enable: bool,
    /// Last layer of the print or of one sequential object.
    pub cooling_buffer_flush: bool,
    /// Number of layers emitted before this one.
    pub gcode_store_pos: usize,
    /// Estimated print time without cooling slowdown (s).
    pub layer_time: CoordF,
}

/// Machine state of the emission sequence.
///
/// Exclusively owned by the single thread stitching layers together.
pub struct EmitterState<'a> {
    config: &'a PrintConfig,
    writer: GCodeWriter,
    router: Box<dyn TravelRouter>,
    placeholders: PlaceholderParser,
    phase: EmitterPhase,
    last_pos: Option<PointF>,
    last_role: ExtrusionRole,
    open_label: Option<String>,
    islands: Vec<Polygon>,
    first_layer: bool,
    used_extruders: Vec<u32>,
    second_layer_things_done: bool,
    /// Set once the first layer skirt has been left.
    brim_done: bool,
    /// Width and height of the last `;WIDTH:` / `;HEIGHT:` markers.
    last_width: CoordF,
    last_height: CoordF,
    /// `(object id, instance)` of the copy printed last.
    last_instance: Option<(usize, usize)>,
    /// The next travel goes from one copy to another.
    copy_changed: bool,
    /// Where the nozzle can wipe when retracting, starting at the current position.
    wipe_path: Vec<PointF>,
    layers_emitted: usize,
    tool_change_count: usize,
    warnings: Vec<TemplateWarning>,
    layer_time: CoordF,
}

impl<'a> EmitterState<'a> {
    pub fn new(config: &'a PrintConfig) -> Self {
        let router: Box<dyn TravelRouter> = if config.avoid_crossing_perimeters {
            Box::new(AvoidCrossingPerimeters::new(config.max_travel_detour_ratio))
        } else {
            Box::new(StraightRouter)
        };
        Self {
            config,
            writer: GCodeWriter::new(config),
            router,
            placeholders: PlaceholderParser::new(),
            phase: EmitterPhase::Idle,
            last_pos: None,
            last_role: ExtrusionRole::None,
            open_label: None,
            islands: Vec::new(),
            first_layer: true,
            used_extruders: Vec::new(),
            second_layer_things_done: false,
            brim_done: false,
            last_width: 0.0,
            last_height: 0.0,
            last_instance: None,
            copy_changed: false,
            wipe_path: Vec::new(),
            layers_emitted: 0,
            tool_change_count: 0,
            warnings: Vec::new(),
            layer_time: 0.0,
        }
    }

    /// Builder method: route travels with a custom router.
    pub fn with_router(mut self, router: Box<dyn TravelRouter>) -> Self {
        self.router = router;
        self
    }

    /// Builder method: zero-based extruders whose temperatures are managed.
    pub fn with_used_extruders(mut self, extruders: &[u32]) -> Self {
        self.used_extruders = extruders.to_vec();
        self
    }

    pub fn writer(&self) -> &GCodeWriter {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut GCodeWriter {
        &mut self.writer
    }

    pub fn placeholders_mut(&mut self) -> &mut PlaceholderParser {
        &mut self.placeholders
    }

    pub fn phase(&self) -> EmitterPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: EmitterPhase) {
        self.phase = phase;
    }

    pub fn last_position(&self) -> Option<PointF> {
        self.last_pos
    }

    /// Tool changes emitted so far; the initial selection does not count.
    pub fn tool_change_count(&self) -> usize {
        self.tool_change_count
    }

    pub fn layers_emitted(&self) -> usize {
        self.layers_emitted
    }

    pub fn brim_done(&self) -> bool {
        self.brim_done
    }

    /// `(object id, instance)` of the copy printed last.
    pub fn last_instance(&self) -> Option<(usize, usize)> {
        self.last_instance
    }

    /// Template warnings collected since the last call.
    pub fn take_warnings(&mut self) -> Vec<TemplateWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Substitute a template, collecting its warnings. Empty templates yield
    /// nothing; the result always ends with a newline.
    pub fn process_template(&mut self, template: &str, name: &str) -> Result<String> {
        if template.trim().is_empty() {
            return Ok(String::new());
        }
        let (mut text, warnings) = self.placeholders.process(template, name)?;
        self.warnings.extend(warnings);
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        Ok(text)
    }

    // ========================================================================
    // Machine primitives
    // ========================================================================

    pub fn need_toolchange(&self, extruder: u32) -> bool {
        self.writer.need_toolchange(extruder)
    }

    /// Select `extruder`. The first selection is a plain `T` line; later ones
    /// run the filament change template and carry the tool change marker.
    pub fn set_extruder(&mut self, extruder: u32) -> Result<String> {
        if !self.need_toolchange(extruder) {
            return Ok(String::new());
        }
        let config = self.config;
        if extruder as usize >= config.extruder_count() {
            return Err(Error::Config(format!(
                "extruder {} selected but only {} configured",
                extruder + 1,
                config.extruder_count()
            )));
        }
        self.placeholders.set("current_extruder", extruder);
        let Some(previous) = self.writer.extruder() else {
            return Ok(self.writer.select_initial_extruder(extruder));
        };

        self.phase = EmitterPhase::ToolChanging;
        self.placeholders.set("previous_extruder", previous);
        self.placeholders.set("next_extruder", extruder);
        let mut gcode =
            self.process_template(&config.templates.change_filament_gcode, "change_filament_gcode")?;
        gcode.push_str(&self.writer.toolchange(extruder));
        self.tool_change_count += 1;
        trace!(from = previous, to = extruder, "tool change");
        Ok(gcode)
    }

    /// Retract the active extruder, with the tool change length if
    /// `toolchange`, wiping back along the last extrusion when enabled.
    pub fn retract(&mut self, toolchange: bool) -> String {
        let wipe = std::mem::take(&mut self.wipe_path);
        let gcode = self.writer.retract_with_wipe(&wipe, toolchange);
        if let (Some(from), Some(to)) = (self.last_pos, self.writer.position()) {
            if !from.approx_eq(&to, POSITION_EPSILON) {
                let wiped: CoordF = wipe.windows(2).map(|w| w[0].distance(&w[1])).sum();
                self.layer_time += wiped / self.config.travel_speed;
                self.last_pos = Some(to);
            }
        }
        if self.writer.is_retracted() {
            self.phase = EmitterPhase::Retracted;
        }
        gcode
    }

    pub fn unretract(&mut self) -> String {
        let gcode = self.writer.unretract();
        if self.phase == EmitterPhase::Retracted {
            self.phase = EmitterPhase::Traveling;
        }
        gcode
    }

    pub fn travel_to_z(&mut self, z: CoordF) -> String {
        self.writer.travel_to_z(z, None)
    }

    /// Straight travel to `p` without any retraction decision.
    pub fn move_to(&mut self, p: PointF, comment: &str) -> String {
        self.travel_line(p, Some(comment))
    }

    fn travel_line(&mut self, p: PointF, comment: Option<&str>) -> String {
        let speed = self.config.travel_speed;
        if let Some(from) = self.last_pos {
            self.layer_time += from.distance(&p) / speed;
        }
        self.last_pos = Some(p);
        self.wipe_path.clear();
        self.phase = EmitterPhase::Traveling;
        self.writer.travel_to_xy(p, speed, comment)
    }

    /// Close the object label left open, if any.
    pub fn close_label(&mut self) -> String {
        match self.open_label.take() {
            Some(name) => label_end(self.writer.flavor(), &name),
            None => String::new(),
        }
    }

    /// Pick up after a wipe tower fragment ending at `end`.
    pub fn resume_after_tower(&mut self, end: PointF) {
        self.writer.reset_feedrate();
        self.writer.note_position(end);
        self.last_pos = Some(end);
        self.wipe_path.clear();
        self.last_role = ExtrusionRole::WipeTower;
        self.phase = EmitterPhase::Extruding;
    }

    // ========================================================================
    // Travel
    // ========================================================================

    /// Whether a travel along `path` has to retract first. Travels between
    /// two object copies always do once they are long enough.
    pub fn needs_retraction(&self, path: &Polyline) -> bool {
        let Some(extruder) = self.writer.extruder() else {
            return false;
        };
        let length = path.length() / SCALING_FACTOR;
        if length < self.config.extruder(extruder as usize).retract_before_travel {
            return false;
        }
        if self.config.only_retract_when_crossing_perimeters
            && !self.copy_changed
            && travel_within_single_island(path, &self.islands)
        {
            return false;
        }
        true
    }

    /// Travel to the start of the next extrusion.
    ///
    /// Moves inside one island of the same copy go straight, as do moves
    /// leaving the first layer skirt; everything else goes through the router.
    fn travel_to(&mut self, to: PointF, straight: bool) -> String {
        let Some(from) = self.last_pos else {
            return self.travel_line(to, None);
        };
        let direct = Polyline::new(vec![from.to_scaled(), to.to_scaled()]);
        let path = if straight
            || (!self.copy_changed && travel_within_single_island(&direct, &self.islands))
        {
            direct
        } else {
            self.router
                .route(from.to_scaled(), to.to_scaled(), &self.islands)
                .path
        };
        let mut gcode = String::new();
        if self.needs_retraction(&path) {
            gcode.push_str(&self.retract(false));
        }
        let points = &path.points;
        if !self.first_layer {
            gcode.push_str(&self.writer.set_acceleration(self.config.travel_acceleration));
        }
        if points.len() > 2 {
            for p in &points[1..points.len() - 1] {
                gcode.push_str(&self.travel_line(p.to_f64(), None));
            }
        }
        gcode.push_str(&self.travel_line(to, None));
        gcode
    }

    // ========================================================================
    // Extrusion
    // ========================================================================

    fn extrude(&mut self, path: &RenderedPath) -> String {
        let mut gcode = String::new();
        let leaving_skirt = !self.brim_done
            && self.last_role == ExtrusionRole::Skirt
            && path.role != ExtrusionRole::Skirt;
        if leaving_skirt {
            self.brim_done = true;
        }
        if !self
            .last_pos
            .is_some_and(|p| p.approx_eq(&path.start, POSITION_EPSILON))
        {
            gcode.push_str(&self.travel_to(path.start, leaving_skirt));
        }
        self.copy_changed = false;
        gcode.push_str(&self.unretract());
        if path.role != self.last_role {
            let _ = writeln!(gcode, ";TYPE:{}", path.role.name());
            self.last_role = path.role;
        }
        if (path.width - self.last_width).abs() > MARKER_EPSILON {
            let _ = writeln!(gcode, ";WIDTH:{:.3}", path.width);
            self.last_width = path.width;
        }
        if (path.height - self.last_height).abs() > MARKER_EPSILON {
            let _ = writeln!(gcode, ";HEIGHT:{:.3}", path.height);
            self.last_height = path.height;
        }
        gcode.push_str(&self.writer.set_acceleration(path.acceleration));
        gcode.push_str(&path.gcode);
        // The cooling buffer may rewrite the tagged feedrate
        self.writer.reset_feedrate();
        self.writer.note_position(path.end);
        self.last_pos = Some(path.end);
        self.layer_time += path.time;
        self.phase = EmitterPhase::Extruding;
        let config = self.config;
        let extruder = config.extruder(self.writer.extruder().unwrap_or(0) as usize);
        if extruder.wipe {
            self.wipe_path = wipe_path(&path.points, extruder.wipe_distance);
        }
        gcode
    }

    fn emit_record(&mut self, record: &RenderedRecord) -> String {
        let mut gcode = String::new();
        if record.paths.is_empty() {
            return gcode;
        }
        let copy = (record.object_id, record.instance);
        if self.last_instance != Some(copy) {
            self.copy_changed = self.last_instance.is_some();
            self.last_instance = Some(copy);
        }
        if self.config.label_objects {
            let name = label_name(&record.object_name, record.object_id, record.instance);
            if self.open_label.as_deref() != Some(name.as_str()) {
                gcode.push_str(&self.close_label());
                gcode.push_str(&label_start(self.writer.flavor(), record.label_id, &name));
                self.open_label = Some(name);
            }
        }
        for path in &record.paths {
            gcode.push_str(&self.extrude(path));
        }
        gcode
    }

    /// Switch extruders in place, without a wipe tower.
    ///
    /// With ooze prevention the outgoing extruder drops to its standby
    /// temperature and the incoming one is waited for at its working one.
    fn change_extruder(&mut self, extruder: u32) -> Result<String> {
        if !self.need_toolchange(extruder) {
            return Ok(String::new());
        }
        let mut gcode = self.close_label();
        gcode.push_str(&self.retract(true));
        let ooze_prevention = self.config.ooze_prevention && self.writer.extruder().is_some();
        if let Some(previous) = self.writer.extruder().filter(|_| ooze_prevention) {
            let standby = self
                .config
                .extruder(previous as usize)
                .standby_temperature(self.active_temperature(previous));
            gcode.push_str(&self.writer.set_temperature(standby, false, Some(previous)));
        }
        gcode.push_str(&self.set_extruder(extruder)?);
        if ooze_prevention {
            let temperature = self.active_temperature(extruder);
            gcode.push_str(&self.writer.set_temperature(temperature, true, Some(extruder)));
        }
        Ok(gcode)
    }

    /// Working temperature of `extruder` on the current layer.
    fn active_temperature(&self, extruder: u32) -> u32 {
        let config = self.config.extruder(extruder as usize);
        if self.first_layer {
            config.first_layer_temperature
        } else {
            config.temperature
        }
    }

    // ========================================================================
    // Layers
    // ========================================================================

    fn second_layer_temperatures(&self) -> String {
        let config = self.config;
        let mut gcode = String::new();
        if config.bed_temperature > 0 && config.bed_temperature != config.first_layer_bed_temperature {
            gcode.push_str(&self.writer.set_bed_temperature(config.bed_temperature, false));
        }
        for &e in &self.used_extruders {
            // idle extruders stay at standby until their next tool change
            if config.ooze_prevention && self.writer.extruder() != Some(e) {
                continue;
            }
            let extruder = config.extruder(e as usize);
            if extruder.temperature > 0 && extruder.temperature != extruder.first_layer_temperature {
                gcode.push_str(&self.writer.set_temperature(extruder.temperature, false, Some(e)));
            }
        }
        gcode
    }

    /// Get ready for the first layer of the next sequentially printed
    /// object: back to first layer temperatures (waiting for the active
    /// extruder) and first layer state.
    pub fn start_next_object(&mut self) -> String {
        let config = self.config;
        self.first_layer = true;
        self.second_layer_things_done = false;
        self.brim_done = false;

        let mut gcode = String::new();
        if config.first_layer_bed_temperature > 0
            && config.first_layer_bed_temperature != config.bed_temperature
        {
            gcode.push_str(&self.writer.set_bed_temperature(config.first_layer_bed_temperature, true));
        }
        let active = self.writer.extruder();
        let mut wait = String::new();
        for &e in &self.used_extruders {
            let extruder = config.extruder(e as usize);
            if extruder.first_layer_temperature == 0
                || extruder.first_layer_temperature == extruder.temperature
            {
                continue;
            }
            if active == Some(e) {
                wait = self.writer.set_temperature(extruder.first_layer_temperature, true, Some(e));
            } else if !config.ooze_prevention {
                gcode.push_str(&self.writer.set_temperature(extruder.first_layer_temperature, false, Some(e)));
            }
        }
        gcode.push_str(&wait);
        gcode
    }

    fn custom_gcode(&mut self, item: &CustomGCodeItem) -> Result<String> {
        let config = self.config;
        let mut gcode = self.retract(false);
        match item.gcode_type {
            CustomGCodeType::ColorChange => {
                let extruder = item.extruder.saturating_sub(1);
                self.placeholders.set("color_change_extruder", extruder);
                self.placeholders.set("color", &item.color);
                let _ = writeln!(gcode, ";COLOR_CHANGE,T{},{}", extruder, item.color);
                gcode.push_str(
                    &self.process_template(&config.templates.color_change_gcode, "color_change_gcode")?,
                );
            }
            CustomGCodeType::Pause => {
                gcode.push_str(";PAUSE_PRINT\n");
                gcode.push_str(&self.process_template(&config.templates.pause_gcode, "pause_gcode")?);
            }
            CustomGCodeType::Custom => {
                gcode.push_str(";CUSTOM_GCODE\n");
                let template = if item.extra.trim().is_empty() {
                    config.templates.template_custom_gcode.as_str()
                } else {
                    item.extra.as_str()
                };
                gcode.push_str(&self.process_template(template, "template_custom_gcode")?);
            }
        }
        Ok(gcode)
    }

    /// Emit one rendered layer.
    ///
    /// The tower is consulted only on layers flagged for it; it then handles
    /// every tool change of the layer and finishes its own layer with the
    /// last extruder.
    pub fn process_layer(
        &mut self,
        layer: &RenderedLayer,
        tower: Option<&mut WipeTowerIntegration>,
        flush: bool,
    ) -> Result<LayerResult> {
        let config = self.config;
        let lt = &layer.layer_tools;
        self.first_layer = layer.index == 0;
        self.islands = layer.islands.clone();
        self.layer_time = 0.0;
        self.placeholders.set("layer_num", layer.index);
        self.placeholders.set("layer_z", format!("{:.3}", layer.print_z));

        let mut gcode = self.process_template(
            &config.templates.before_layer_change_gcode,
            "before_layer_change_gcode",
        )?;
        let _ = writeln!(
            gcode,
            ";LAYER_CHANGE\n;Z:{:.3}\n;HEIGHT:{:.3}",
            layer.print_z, layer.height
        );
        self.last_height = layer.height;
        if !self.first_layer && !layer.spiral_vase {
            gcode.push_str(&self.retract(false));
        }
        gcode.push_str(&self.writer.travel_to_z(layer.print_z, Some("move to next layer")));
        gcode.push_str(&self.process_template(&config.templates.layer_change_gcode, "layer_change_gcode")?);

        if !self.first_layer && !self.second_layer_things_done {
            gcode.push_str(&self.second_layer_temperatures());
            self.second_layer_things_done = true;
        }
        if let Some(item) = &lt.custom_gcode {
            gcode.push_str(&self.custom_gcode(item)?);
        }

        let mut tower = tower.filter(|_| lt.has_wipe_tower);
        if let Some(t) = tower.as_deref_mut() {
            t.next_layer();
        }
        let count = lt.extruders.len();
        for (i, &extruder) in lt.extruders.iter().enumerate() {
            match tower.as_deref_mut() {
                Some(t) => gcode.push_str(&t.tool_change(self, extruder, i + 1 == count)?),
                None => gcode.push_str(&self.change_extruder(extruder)?),
            }
            for record in layer.records.iter().filter(|r| r.extruder == extruder) {
                gcode.push_str(&self.emit_record(record));
            }
        }
        gcode.push_str(&self.close_label());
        if self.first_layer {
            self.brim_done = true;
        }

        let result = LayerResult {
            gcode,
            layer_id: layer.index,
            spiral_vase_enable: layer.spiral_vase,
            cooling_buffer_flush: flush,
            gcode_store_pos: self.layers_emitted,
            layer_time: self.layer_time,
        };
        self.layers_emitted += 1;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::layers::collect_layers_to_print_for_print;
    use crate::gcode::tool_ordering::ToolOrdering;
    use crate::gcode::writer::TOOL_CHANGE_TAG;
    use crate::print::{Layer, LayerRegion, Print, PrintObject};
    use crate::ExtrusionMultiPath;
    use approx::assert_relative_eq;

    fn square_layer(id: usize, z: f64) -> Layer {
        Layer::new(id, z, 0.2)
            .with_island(Polygon::rectangle(0.0, 0.0, 20.0, 20.0))
            .with_region(
                LayerRegion::new(0)
                    .with_perimeter(ExtrusionLoop::from_polygon(
                        &Polygon::rectangle(2.0, 2.0, 18.0, 18.0),
                        ExtrusionRole::ExternalPerimeter,
                        0.45,
                        0.2,
                    ))
                    .with_fill(ExtrusionPath::new(
                        Polyline::from_mm(&[(5.0, 5.0), (15.0, 5.0)]),
                        ExtrusionRole::InternalInfill,
                        0.45,
                        0.2,
                    )),
            )
    }

    fn square_print() -> Print {
        Print::new().with_object(
            PrintObject::new("cube")
                .with_layer(square_layer(0, 0.2))
                .with_instance(10.0, 10.0),
        )
    }

    fn path(role: ExtrusionRole, from: (f64, f64), to: (f64, f64)) -> RenderedPath {
        let start = PointF::new(from.0, from.1);
        let end = PointF::new(to.0, to.1);
        let mut gcode = GCodeWriter::speed_line(40.0, true);
        gcode.push_str(&GCodeWriter::extrusion_line(end, 0.1));
        gcode.push_str(EXTRUDE_END_TAG);
        gcode.push('\n');
        RenderedPath {
            role,
            start,
            end,
            gcode,
            length: start.distance(&end),
            filament: 0.1,
            time: start.distance(&end) / 40.0,
            acceleration: 0,
            width: 0.45,
            height: 0.2,
            points: vec![start, end],
        }
    }

    fn record(extruder: u32, label_id: usize, paths: Vec<RenderedPath>) -> RenderedRecord {
        RenderedRecord {
            object_id: 0,
            object_name: "cube".into(),
            instance: label_id,
            label_id,
            extruder,
            wiping: false,
            paths,
        }
    }

    fn layer(index: usize, extruders: Vec<u32>, records: Vec<RenderedRecord>) -> RenderedLayer {
        let z = 0.2 * (index + 1) as f64;
        let mut lt = LayerTools::new(z);
        lt.extruders = extruders;
        RenderedLayer {
            records,
            ..RenderedLayer::empty(index, z, 0.2, lt)
        }
    }

    #[test]
    fn test_render_starts_loop_at_seam() {
        let config = PrintConfig::default();
        let print = square_print();
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();
        let lt = ordering.get_layer_tools(0).unwrap();

        let layer = render_layer(&groups[0], lt, &config, 0, None).unwrap();
        assert_eq!(layer.records.len(), 1);
        assert_eq!(layer.islands.len(), 1);
        let paths = &layer.records[0].paths;
        assert_eq!(paths.len(), 2);
        // Perimeter first, starting at the rear left corner of the copy
        assert_eq!(paths[0].role, ExtrusionRole::ExternalPerimeter);
        assert!(paths[0].start.approx_eq(&PointF::new(12.0, 28.0), 1e-6));
        assert!(paths[0].end.approx_eq(&PointF::new(12.0, 28.0), 1e-6));
        assert_relative_eq!(paths[0].length, 64.0, epsilon = 1e-6);
        assert_eq!(paths[1].role, ExtrusionRole::InternalInfill);
    }

    #[test]
    fn test_render_extrusion_amount_and_first_layer_speed() {
        let config = PrintConfig::default();
        let print = square_print();
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();
        let layer = render_layer(&groups[0], ordering.get_layer_tools(0).unwrap(), &config, 0, None).unwrap();

        let infill = &layer.records[0].paths[1];
        let expected = 10.0 * 0.45 * 0.2 / config.extruder(0).filament_area();
        assert_relative_eq!(infill.filament, expected, epsilon = 1e-9);
        // Infill is 80 mm/s, capped to 30 on the first layer
        assert!(infill.gcode.starts_with("G1 F1800 ;_EXTRUDE_SET_SPEED\n"));
        assert!(infill.gcode.ends_with(";_EXTRUDE_END\n"));
        assert_eq!(infill.acceleration, config.first_layer_acceleration);
    }

    #[test]
    fn test_invalid_geometry_names_object() {
        let config = PrintConfig::default();
        let broken = Layer::new(0, 0.2, 0.2).with_region(LayerRegion::new(0).with_fill(
            ExtrusionPath::new(Polyline::from_mm(&[(1.0, 1.0)]), ExtrusionRole::SolidInfill, 0.45, 0.2),
        ));
        let print = Print::new().with_object(
            PrintObject::new("broken").with_layer(broken).with_instance(0.0, 0.0),
        );
        let groups = collect_layers_to_print_for_print(&print);
        let ordering = ToolOrdering::for_print(&print, &config, None).unwrap();
        let err = render_layer(&groups[0], ordering.get_layer_tools(0).unwrap(), &config, 0, None)
            .unwrap_err();
        assert!(matches!(err, Error::Geometry { ref object, .. } if object == "broken"));
    }

    #[test]
    fn test_speed_ramp_between_paths() {
        let config = PrintConfig::default();
        let region = PrintRegionConfig::default();
        let ctx = RenderContext {
            config: &config,
            region: &region,
            shift: Point::zero(),
            filament_area: 2.4,
            first_layer: false,
        };
        let chain = ExtrusionMultiPath::new(vec![
            ExtrusionPath::new(
                Polyline::from_mm(&[(0.0, 0.0), (10.0, 0.0)]),
                ExtrusionRole::ExternalPerimeter,
                0.45,
                0.2,
            ),
            ExtrusionPath::new(
                Polyline::from_mm(&[(10.0, 0.0), (20.0, 0.0)]),
                ExtrusionRole::Perimeter,
                0.45,
                0.2,
            ),
        ]);
        let mut out = Vec::new();
        ctx.render_entity(&ExtrusionEntity::MultiPath(chain), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].gcode.matches(";_EXTRUDE_SET_SPEED").count(), 1);
        // 25 -> 45 mm/s in three steps over the first millimeter
        let second = &out[1].gcode;
        assert_eq!(second.matches(";_EXTRUDE_SET_SPEED").count(), 4);
        for f in ["F1800", "F2100", "F2400", "F2700"] {
            assert!(second.contains(&format!("G1 {} ;_EXTRUDE_SET_SPEED", f)), "{}", f);
        }
        assert_relative_eq!(out[1].length, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_overhang_and_small_perimeter_speed() {
        let config = PrintConfig::default();
        let region = PrintRegionConfig::default();
        let ctx = RenderContext {
            config: &config,
            region: &region,
            shift: Point::zero(),
            filament_area: 2.4,
            first_layer: false,
        };
        let p = ExtrusionPath::new(Polyline::from_mm(&[(0.0, 0.0), (50.0, 0.0)]), ExtrusionRole::Perimeter, 0.45, 0.2);
        assert_relative_eq!(ctx.path_speed(&p, None), 45.0);
        let half = p.clone().with_overhang_degree(2);
        // 45 + (10 - 45) * 0.4
        assert_relative_eq!(ctx.path_speed(&half, None), 31.0, epsilon = 1e-9);
        let full = p.clone().with_overhang_degree(5);
        assert_relative_eq!(ctx.path_speed(&full, None), 10.0, epsilon = 1e-9);
        assert_relative_eq!(ctx.path_speed(&p, Some(12.0)), 25.0);
        assert_relative_eq!(ctx.path_speed(&p, Some(120.0)), 45.0);
    }

    #[test]
    fn test_seam_gap_shortens_loop() {
        let l = ExtrusionLoop::from_polygon(
            &Polygon::rectangle(0.0, 0.0, 10.0, 10.0),
            ExtrusionRole::Perimeter,
            0.45,
            0.2,
        );
        let full = loop_from_seam(&l, SeamPosition::Rear, 0.0);
        let clipped = loop_from_seam(&l, SeamPosition::Rear, 0.5);
        let len = |paths: &[ExtrusionPath]| paths.iter().map(|p| p.length()).sum::<f64>();
        assert_relative_eq!(len(&full), 40.0, epsilon = 1e-6);
        assert_relative_eq!(len(&clipped), 39.5, epsilon = 1e-6);
        assert_eq!(clipped[0].first_point(), Some(Point::new_scale(0.0, 10.0)));
    }

    #[test]
    fn test_first_selection_is_not_a_tool_change() {
        let config = PrintConfig::with_extruders(2);
        let mut state = EmitterState::new(&config);
        assert_eq!(state.set_extruder(0).unwrap(), "T0\n");
        assert_eq!(state.tool_change_count(), 0);
        let change = state.set_extruder(1).unwrap();
        assert!(change.contains(TOOL_CHANGE_TAG));
        assert_eq!(state.tool_change_count(), 1);
        assert_eq!(state.phase(), EmitterPhase::ToolChanging);
        assert!(matches!(state.set_extruder(5), Err(Error::Config(_))));
    }

    #[test]
    fn test_layer_changes_tools_in_order() {
        let mut config = PrintConfig::with_extruders(2);
        config.label_objects = false;
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();

        let layer = layer(
            0,
            vec![0, 1],
            vec![
                record(0, 0, vec![path(ExtrusionRole::Perimeter, (0.0, 0.0), (10.0, 0.0))]),
                record(1, 0, vec![path(ExtrusionRole::InternalInfill, (10.0, 0.0), (10.0, 10.0))]),
            ],
        );
        let result = state.process_layer(&layer, None, false).unwrap();
        let gcode = &result.gcode;
        assert_eq!(gcode.matches(";LAYER_CHANGE").count(), 1);
        assert!(gcode.contains(";Z:0.200\n;HEIGHT:0.200\n"));
        assert_eq!(gcode.matches(TOOL_CHANGE_TAG).count(), 1);
        let t1 = gcode.find("T1\n").unwrap();
        assert!(gcode.find(";TYPE:Inner wall").unwrap() < t1);
        assert!(t1 < gcode.find(";TYPE:Sparse infill").unwrap());
        assert!(gcode.contains("retract for toolchange"));
        assert_eq!(state.tool_change_count(), 1);
        assert_eq!(result.gcode_store_pos, 0);
        assert!(result.layer_time > 0.0);
    }

    #[test]
    fn test_long_travel_retracts() {
        let config = PrintConfig::default();
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let layer = layer(
            0,
            vec![0],
            vec![record(
                0,
                0,
                vec![
                    path(ExtrusionRole::Perimeter, (0.0, 0.0), (10.0, 0.0)),
                    path(ExtrusionRole::Perimeter, (50.0, 0.0), (60.0, 0.0)),
                ],
            )],
        );
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        let retract = gcode.find("; retract").unwrap();
        let travel = gcode.find("G1 X50.000 Y0.000").unwrap();
        assert!(retract < travel);
        let unretract = gcode.find("; unretract").unwrap();
        assert!(travel < unretract);
    }

    #[test]
    fn test_travel_inside_island_does_not_retract() {
        let config = PrintConfig::default();
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let mut layer = layer(
            0,
            vec![0],
            vec![record(
                0,
                0,
                vec![
                    path(ExtrusionRole::Perimeter, (10.0, 10.0), (20.0, 10.0)),
                    path(ExtrusionRole::Perimeter, (60.0, 10.0), (70.0, 10.0)),
                ],
            )],
        );
        layer.islands = vec![Polygon::rectangle(0.0, 0.0, 100.0, 100.0)];
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        assert!(!gcode.contains("; retract"));
        assert!(state.needs_retraction(&Polyline::from_mm(&[(50.0, 50.0), (150.0, 50.0)])));
        assert!(!state.needs_retraction(&Polyline::from_mm(&[(50.0, 50.0), (51.0, 50.0)])));
    }

    #[test]
    fn test_labels_by_flavor() {
        let config = PrintConfig::default();
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let layer = layer(
            0,
            vec![0],
            vec![
                record(0, 0, vec![path(ExtrusionRole::Perimeter, (0.0, 0.0), (1.0, 0.0))]),
                record(0, 1, vec![path(ExtrusionRole::Perimeter, (1.0, 0.0), (2.0, 0.0))]),
            ],
        );
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        assert!(gcode.contains("M486 S0\n"));
        assert!(gcode.contains("M486 S1\n"));
        assert_eq!(gcode.matches("M486 S-1\n").count(), 2);

        let klipper = PrintConfig {
            gcode_flavor: GCodeFlavor::Klipper,
            ..PrintConfig::default()
        };
        let mut state = EmitterState::new(&klipper);
        state.set_extruder(0).unwrap();
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        assert!(gcode.contains("EXCLUDE_OBJECT_START NAME=cube_id_0_copy_0\n"));
        assert!(gcode.contains("EXCLUDE_OBJECT_END NAME=cube_id_0_copy_1\n"));
    }

    #[test]
    fn test_second_layer_switches_temperatures() {
        let config = PrintConfig::default();
        let mut state = EmitterState::new(&config).with_used_extruders(&[0]);
        state.set_extruder(0).unwrap();
        let first = state.process_layer(&layer(0, vec![0], Vec::new()), None, false).unwrap();
        assert!(!first.gcode.contains("M104"));
        let second = state.process_layer(&layer(1, vec![0], Vec::new()), None, false).unwrap();
        assert!(second.gcode.contains("M140 S60\n"));
        assert!(second.gcode.contains("M104 S210 T0\n"));
        assert_eq!(second.gcode_store_pos, 1);
        let third = state.process_layer(&layer(2, vec![0], Vec::new()), None, true).unwrap();
        assert!(!third.gcode.contains("M104"));
        assert!(third.cooling_buffer_flush);
    }

    #[test]
    fn test_custom_gcode_and_template_warnings() {
        let mut config = PrintConfig::default();
        config.templates.layer_change_gcode = ";AFTER_LAYER_CHANGE {layer_num} {missing}".into();
        config.templates.pause_gcode = "M601".into();
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let mut l = layer(3, vec![0], Vec::new());
        l.layer_tools.custom_gcode = Some(CustomGCodeItem::pause(0.8));
        let gcode = state.process_layer(&l, None, false).unwrap().gcode;
        assert!(gcode.contains(";AFTER_LAYER_CHANGE 3 \n"));
        assert!(gcode.contains(";PAUSE_PRINT\nM601\n"));
        let warnings = state.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].name, "layer_change_gcode");
        assert!(state.take_warnings().is_empty());
    }

    #[test]
    fn test_width_and_height_markers_on_change() {
        let mut config = PrintConfig::default();
        config.label_objects = false;
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let mut wide = path(ExtrusionRole::InternalInfill, (10.0, 0.0), (10.0, 10.0));
        wide.width = 0.5;
        let mut tall = path(ExtrusionRole::InternalInfill, (10.0, 10.0), (0.0, 10.0));
        tall.width = 0.5;
        tall.height = 0.3;
        let layer = layer(
            0,
            vec![0],
            vec![record(
                0,
                0,
                vec![path(ExtrusionRole::Perimeter, (0.0, 0.0), (10.0, 0.0)), wide, tall],
            )],
        );
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        assert_eq!(gcode.matches(";WIDTH:0.450\n").count(), 1);
        assert_eq!(gcode.matches(";WIDTH:0.500\n").count(), 1);
        // the layer header already announced 0.2
        assert_eq!(gcode.matches(";HEIGHT:0.200\n").count(), 1);
        assert_eq!(gcode.matches(";HEIGHT:0.300\n").count(), 1);
        assert!(gcode.find(";WIDTH:0.500").unwrap() < gcode.find(";HEIGHT:0.300").unwrap());
    }

    #[test]
    fn test_travel_between_copies_retracts() {
        let mut config = PrintConfig::default();
        config.label_objects = false;
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let mut layer = layer(
            0,
            vec![0],
            vec![
                record(0, 0, vec![path(ExtrusionRole::Perimeter, (10.0, 10.0), (20.0, 10.0))]),
                record(0, 1, vec![path(ExtrusionRole::Perimeter, (60.0, 10.0), (70.0, 10.0))]),
            ],
        );
        layer.islands = vec![Polygon::rectangle(0.0, 0.0, 100.0, 100.0)];
        assert_eq!(state.last_instance(), None);
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        let retract = gcode.find("; retract").unwrap();
        assert!(retract < gcode.find("G1 X60.000 Y10.000").unwrap());
        assert_eq!(state.last_instance(), Some((0, 1)));
    }

    #[test]
    fn test_skirt_then_brim_done() {
        let config = PrintConfig::default();
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let first = layer(
            0,
            vec![0],
            vec![record(
                0,
                0,
                vec![
                    path(ExtrusionRole::Skirt, (0.0, 0.0), (30.0, 0.0)),
                    path(ExtrusionRole::Perimeter, (10.0, 10.0), (20.0, 10.0)),
                ],
            )],
        );
        assert!(!state.brim_done());
        state.process_layer(&first, None, false).unwrap();
        assert!(state.brim_done());
        state.start_next_object();
        assert!(!state.brim_done());
    }

    #[test]
    fn test_start_next_object_restores_first_layer_temperatures() {
        let config = PrintConfig::default();
        let mut state = EmitterState::new(&config).with_used_extruders(&[0]);
        state.set_extruder(0).unwrap();
        state.process_layer(&layer(0, vec![0], Vec::new()), None, false).unwrap();
        state.process_layer(&layer(1, vec![0], Vec::new()), None, false).unwrap();

        assert_eq!(state.start_next_object(), "M190 S65\nM109 S215 T0\n");
        let first = state.process_layer(&layer(0, vec![0], Vec::new()), None, false).unwrap();
        assert!(!first.gcode.contains("M104"));
        let second = state.process_layer(&layer(1, vec![0], Vec::new()), None, false).unwrap();
        assert!(second.gcode.contains("M140 S60\n"));
        assert!(second.gcode.contains("M104 S210 T0\n"));

        let mut same = PrintConfig::default();
        same.extruders[0].first_layer_temperature = 210;
        same.first_layer_bed_temperature = 60;
        let mut state = EmitterState::new(&same).with_used_extruders(&[0]);
        state.set_extruder(0).unwrap();
        assert_eq!(state.start_next_object(), "");
    }

    #[test]
    fn test_retraction_wipes_back_along_last_path() {
        let mut config = PrintConfig::default();
        config.label_objects = false;
        config.extruders[0].wipe = true;
        let mut state = EmitterState::new(&config);
        state.set_extruder(0).unwrap();
        let layer = layer(
            0,
            vec![0],
            vec![record(
                0,
                0,
                vec![
                    path(ExtrusionRole::Perimeter, (0.0, 0.0), (10.0, 0.0)),
                    path(ExtrusionRole::Perimeter, (50.0, 0.0), (60.0, 0.0)),
                ],
            )],
        );
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        let wipe = gcode.find("G1 X9.000 Y0.000 E-").unwrap();
        assert!(gcode[wipe..].starts_with("G1 X9.000 Y0.000 E-0.24000"));
        assert!(gcode.find("; retract").unwrap() < wipe);
        assert!(wipe < gcode.find("G1 X50.000 Y0.000").unwrap());
        assert_eq!(gcode.matches("; wipe and retract").count(), 1);
    }

    #[test]
    fn test_ooze_prevention_on_tool_change() {
        let mut config = PrintConfig::with_extruders(2);
        config.label_objects = false;
        config.ooze_prevention = true;
        let mut state = EmitterState::new(&config).with_used_extruders(&[0, 1]);
        state.set_extruder(0).unwrap();
        let layer = layer(
            0,
            vec![0, 1],
            vec![
                record(0, 0, vec![path(ExtrusionRole::Perimeter, (0.0, 0.0), (10.0, 0.0))]),
                record(1, 0, vec![path(ExtrusionRole::InternalInfill, (10.0, 0.0), (10.0, 10.0))]),
            ],
        );
        let gcode = state.process_layer(&layer, None, false).unwrap().gcode;
        let standby = gcode.find("M104 S210 T0\n").unwrap();
        let t1 = gcode.find("\nT1\n").unwrap();
        let heat = gcode.find("M109 S215 T1\n").unwrap();
        assert!(standby < t1 && t1 < heat);
        assert!(heat < gcode.find(";TYPE:Sparse infill").unwrap());

        // second layer: only the active extruder goes to its normal temperature
        let second = state.process_layer(&layer_on(1, vec![1]), None, false).unwrap().gcode;
        assert!(second.contains("M104 S210 T1\n"));
        assert!(!second.contains("T0\n"));
    }

    fn layer_on(index: usize, extruders: Vec<u32>) -> RenderedLayer {
        layer(index, extruders, Vec::new())
    }
}
