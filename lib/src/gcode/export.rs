//! Export driver.
//!
//! Ties the stages together: validates the input, writes the preamble, runs
//! the layer pipeline (render on workers, stitch + filter + write on the
//! calling thread) and closes the file with the end sequence and usage
//! summary. Output goes to `<path>.tmp` and only replaces `path` once the
//! export completed.

use crate::config::{GCodeFlavor, PrintConfig, PrintSequence, TimelapseType};
use crate::gcode::cooling::CoolingBuffer;
use crate::gcode::emitter::{label_name, render_layer, EmitterState, LayerResult, RenderedLayer};
use crate::gcode::layers::{collect_layers_for_object, collect_layers_to_print_for_print, LayerGroup};
use crate::gcode::output::{
    GCodeOutputStream, GCodeProcessorResult, TIMELAPSE_WARNING_BY_OBJECT,
    TIMELAPSE_WARNING_NO_WIPE_TOWER, TIMELAPSE_WARNING_SPIRAL_VASE,
};
use crate::gcode::pipeline::{self, PipelineStatus};
use crate::gcode::spiral_vase::SpiralVase;
use crate::gcode::tool_ordering::ToolOrdering;
use crate::gcode::wipe_tower::WipeTowerIntegration;
use crate::print::Print;
use crate::{CoordF, Error, Result};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Height above the tallest finished object used to move between objects.
const OBJECT_CLEARANCE_Z: CoordF = 1.0;

/// How an export ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportOutcome {
    Completed(GCodeProcessorResult),
    /// Stopped on request; no file was left behind.
    Cancelled,
}

impl ExportOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportOutcome::Cancelled)
    }

    pub fn result(&self) -> Option<&GCodeProcessorResult> {
        match self {
            ExportOutcome::Completed(result) => Some(result),
            ExportOutcome::Cancelled => None,
        }
    }

    pub fn into_result(self) -> Option<GCodeProcessorResult> {
        match self {
            ExportOutcome::Completed(result) => Some(result),
            ExportOutcome::Cancelled => None,
        }
    }
}

/// Result of one file of [`GCodeExporter::export_objects_separately`].
#[derive(Debug)]
pub struct ObjectExport {
    pub name: String,
    pub path: PathBuf,
    pub outcome: Result<ExportOutcome>,
}

/// Post-filters applied to every emitted layer, in order.
struct LayerFilters {
    spiral_vase: SpiralVase,
    cooling: CoolingBuffer,
}

impl LayerFilters {
    fn new(config: &PrintConfig) -> Self {
        Self {
            spiral_vase: SpiralVase::new(),
            cooling: CoolingBuffer::new(config.cooling.clone(), config.travel_speed),
        }
    }

    fn apply<W: Write>(&mut self, layer: LayerResult, stream: &mut GCodeOutputStream<W>) -> Result<()> {
        let gcode = self.spiral_vase.process_layer(&layer.gcode, layer.spiral_vase_enable);
        let gcode = self
            .cooling
            .process_layer(&gcode, layer.layer_id, layer.cooling_buffer_flush);
        stream.note_layer_time(layer.layer_time);
        stream.write(&gcode)
    }
}

/// Turns a sliced [`Print`] into G-code.
#[derive(Debug, Clone)]
pub struct GCodeExporter {
    config: PrintConfig,
}

impl GCodeExporter {
    pub fn new(config: PrintConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PrintConfig {
        &self.config
    }

    /// Export `print` to `path`.
    ///
    /// `cancel` is polled once per layer; a cancelled export removes its
    /// partial output and returns [`ExportOutcome::Cancelled`].
    pub fn do_export(
        &self,
        print: &Print,
        path: impl AsRef<Path>,
        cancel: Option<&AtomicBool>,
    ) -> Result<ExportOutcome> {
        let path = path.as_ref();
        self.validate(print)?;

        let never = AtomicBool::new(false);
        let cancel = cancel.unwrap_or(&never);
        let tmp = tmp_path(path);
        debug!(path = %tmp.display(), "writing G-code");

        let written = File::create(&tmp)
            .map_err(Error::from)
            .and_then(|file| self.write_gcode(print, BufWriter::new(file), cancel));
        match written {
            Ok(Some((file, result))) => {
                drop(file);
                if let Err(e) = fs::rename(&tmp, path) {
                    let _ = fs::remove_file(&tmp);
                    return Err(e.into());
                }
                info!(path = %path.display(), %result, "G-code export finished");
                Ok(ExportOutcome::Completed(result))
            }
            Ok(None) => {
                let _ = fs::remove_file(&tmp);
                info!(path = %path.display(), "G-code export cancelled");
                Ok(ExportOutcome::Cancelled)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                warn!(path = %path.display(), error = %e, "G-code export failed");
                Err(e)
            }
        }
    }

    /// Export into memory.
    pub fn export_to_string(&self, print: &Print) -> Result<(String, GCodeProcessorResult)> {
        self.validate(print)?;
        let never = AtomicBool::new(false);
        let (bytes, result) = self
            .write_gcode(print, Vec::new(), &never)?
            .ok_or_else(|| Error::Pipeline("in-memory export was cancelled".into()))?;
        let gcode = String::from_utf8(bytes).map_err(|e| Error::Pipeline(e.to_string()))?;
        Ok((gcode, result))
    }

    /// One file per object in `dir`, named `<index>_<object name>.gcode`.
    ///
    /// Configuration errors abort the whole batch; geometry errors only fail
    /// the file of the object they were found in.
    pub fn export_objects_separately(
        &self,
        print: &Print,
        dir: impl AsRef<Path>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<ObjectExport>> {
        let dir = dir.as_ref();
        self.config.validate()?;
        fs::create_dir_all(dir)?;

        let mut exports = Vec::with_capacity(print.object_count());
        for (idx, object) in print.objects().iter().enumerate() {
            let name = object.name().to_string();
            let path = dir.join(format!("{}_{}.gcode", idx, sanitize_file_name(&name)));
            let outcome = if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                Ok(ExportOutcome::Cancelled)
            } else {
                match print.single_object(idx) {
                    Some(single) => self.do_export(&single, &path, cancel),
                    None => Err(Error::Pipeline(format!("object {idx} vanished from the print"))),
                }
            };
            if let Err(Error::Config(message)) = outcome {
                return Err(Error::Config(message));
            }
            exports.push(ObjectExport { name, path, outcome });
        }
        Ok(exports)
    }

    fn validate(&self, print: &Print) -> Result<()> {
        self.config.validate()?;
        if print.is_empty() {
            return Err(Error::Config("print has no objects".into()));
        }
        print.objects().iter().try_for_each(|o| o.validate())
    }

    /// Write the whole file; `None` when cancelled.
    fn write_gcode<W: Write>(
        &self,
        print: &Print,
        out: W,
        cancel: &AtomicBool,
    ) -> Result<Option<(W, GCodeProcessorResult)>> {
        let config = &self.config;
        let mut stream = GCodeOutputStream::new(out, config.extruder_count());
        let (status, mut state, has_tower) = match config.print_sequence {
            PrintSequence::ByLayer => self.write_by_layer(print, &mut stream, cancel)?,
            PrintSequence::ByObject => self.write_by_object(print, &mut stream, cancel)?,
        };
        if status == PipelineStatus::Cancelled {
            return Ok(None);
        }

        let mut end = state.close_label();
        end.push_str(&state.retract(false));
        end.push_str(&state.process_template(&config.templates.machine_end_gcode, "machine_end_gcode")?);
        stream.write(&end)?;
        stream.write(&usage_summary(stream.result()))?;

        let warnings = state.take_warnings();
        for warning in &warnings {
            warn!(%warning, "template substitution failed");
        }
        stream.add_warnings(warnings);
        stream.set_timelapse_warning_code(timelapse_warning_code(config, has_tower));

        let (out, result) = stream.finish()?;
        debug!(
            layers = result.layer_count,
            tool_changes = result.tool_change_count,
            emitter_tool_changes = state.tool_change_count(),
            "G-code written"
        );
        Ok(Some((out, result)))
    }

    fn write_by_layer<'c, W: Write>(
        &'c self,
        print: &Print,
        stream: &mut GCodeOutputStream<W>,
        cancel: &AtomicBool,
    ) -> Result<(PipelineStatus, EmitterState<'c>, bool)> {
        let config = &self.config;
        let groups = collect_layers_to_print_for_print(print);
        let ordering =
            ToolOrdering::for_layer_groups(&groups, config, None, &print.custom_gcode_per_print_z)?;
        let mut tower = WipeTowerIntegration::plan(&ordering, config);
        let mut state = EmitterState::new(config).with_used_extruders(ordering.all_extruders());
        let first_extruder = ordering.first_extruder().unwrap_or(0);
        info!(
            layers = groups.len(),
            tool_changes = ordering.tool_change_count(),
            wipe_tower = tower.is_some(),
            "exporting by layer"
        );

        let mut preamble = self.preamble(print, &mut state, first_extruder, groups.len())?;
        if let Some(t) = tower.as_mut() {
            preamble.push_str(&t.prime(&mut state)?);
        }
        stream.write(&preamble)?;

        let mut filters = LayerFilters::new(config);
        let last = groups.len().saturating_sub(1);
        let status = pipeline::run(
            groups.len(),
            &config.pipeline,
            cancel,
            |i| render_group(&groups, &ordering, config, i, None),
            |i, layer| {
                let result = state.process_layer(&layer, tower.as_mut(), i == last)?;
                filters.apply(result, stream)
            },
        )?;

        if status == PipelineStatus::Completed {
            let mut tail = filters.cooling.flush();
            if let Some(t) = tower.as_mut() {
                tail.push_str(&t.finalize(&mut state)?);
            }
            stream.write(&tail)?;
        }
        Ok((status, state, tower.is_some()))
    }

    /// Print every instance to completion before starting the next one.
    ///
    /// No wipe tower: objects are finished one at a time so there is no
    /// shared tower height to keep in step.
    fn write_by_object<'c, W: Write>(
        &'c self,
        print: &Print,
        stream: &mut GCodeOutputStream<W>,
        cancel: &AtomicBool,
    ) -> Result<(PipelineStatus, EmitterState<'c>, bool)> {
        let config = &self.config;
        let customs = &print.custom_gcode_per_print_z;
        let order = print.instance_order();
        info!(instances = order.len(), "exporting by object");

        let per_object: Vec<Vec<LayerGroup<'_>>> =
            print.objects().iter().map(collect_layers_for_object).collect();
        let mut used = Vec::new();
        for object in print.objects() {
            let ordering = ToolOrdering::for_object(object, config, None, customs)?;
            for &e in ordering.all_extruders() {
                if !used.contains(&e) {
                    used.push(e);
                }
            }
        }
        used.sort_unstable();

        let first_ordering = match order.first() {
            Some(&(object_idx, _)) => {
                ToolOrdering::for_object(&print.objects()[object_idx], config, None, customs)?
            }
            None => ToolOrdering::default(),
        };
        let first_extruder = first_ordering.first_extruder().unwrap_or(0);
        let total_layers: usize = order.iter().map(|&(o, _)| per_object[o].len()).sum();

        let mut state = EmitterState::new(config).with_used_extruders(&used);
        let preamble = self.preamble(print, &mut state, first_extruder, total_layers)?;
        stream.write(&preamble)?;

        let mut filters = LayerFilters::new(config);
        let mut printed_height: CoordF = 0.0;
        for (n, &(object_idx, instance)) in order.iter().enumerate() {
            let object = &print.objects()[object_idx];
            let groups = &per_object[object_idx];
            if groups.is_empty() {
                continue;
            }
            if n > 0 {
                let mut gcode = state.close_label();
                gcode.push_str(&state.retract(false));
                gcode.push_str(&state.travel_to_z(printed_height + OBJECT_CLEARANCE_Z));
                let start = object.bounding_box().min + object.instances()[instance].shift;
                gcode.push_str(&state.move_to(start.to_f64(), "move to next object"));
                gcode.push_str(&state.start_next_object());
                stream.write(&gcode)?;
            }

            let ordering =
                ToolOrdering::for_layer_groups(groups, config, state.writer().extruder(), customs)?;
            let selected = Some((object.id(), instance));
            let last = groups.len() - 1;
            let status = pipeline::run(
                groups.len(),
                &config.pipeline,
                cancel,
                |i| render_group(groups, &ordering, config, i, selected),
                |i, layer| {
                    let result = state.process_layer(&layer, None, i == last)?;
                    filters.apply(result, stream)
                },
            )?;
            if status == PipelineStatus::Cancelled {
                return Ok((status, state, false));
            }
            printed_height = printed_height.max(object.max_z());
            debug!(object = object.name(), instance, "object finished");
        }
        stream.write(&filters.cooling.flush())?;
        Ok((PipelineStatus::Completed, state, false))
    }

    /// Header, object labels, temperatures, start template and first tool.
    fn preamble(
        &self,
        print: &Print,
        state: &mut EmitterState<'_>,
        first_extruder: u32,
        layer_count: usize,
    ) -> Result<String> {
        let config = &self.config;
        let first = config.extruder(first_extruder as usize);

        let placeholders = state.placeholders_mut();
        placeholders.set("initial_extruder", first_extruder);
        placeholders.set("initial_tool", first_extruder);
        placeholders.set("current_extruder", first_extruder);
        placeholders.set("total_layer_count", layer_count);
        placeholders.set("layer_num", 0);
        placeholders.set("layer_z", "0.000");
        placeholders.set("bed_temperature", config.bed_temperature);
        placeholders.set("first_layer_bed_temperature", config.first_layer_bed_temperature);
        placeholders.set("first_layer_temperature", first.first_layer_temperature);
        placeholders.set("temperature", first.temperature);

        let mut gcode = format!(
            "; generated by slicer-gcode {}\n; total layer count = {}\n\n",
            env!("CARGO_PKG_VERSION"),
            layer_count
        );
        if config.label_objects {
            gcode.push_str(&label_definitions(print, config.gcode_flavor));
        }

        let writer = state.writer();
        let mut temps = writer.set_bed_temperature(config.first_layer_bed_temperature, true);
        temps.push_str(&writer.set_temperature(first.first_layer_temperature, false, Some(first_extruder)));
        gcode.push_str(&temps);
        gcode.push_str(&state.process_template(&config.templates.machine_start_gcode, "machine_start_gcode")?);

        let writer = state.writer();
        let mut setup = writer.set_temperature(first.first_layer_temperature, true, Some(first_extruder));
        setup.push_str(&writer.preamble());
        gcode.push_str(&setup);
        gcode.push_str(&state.set_extruder(first_extruder)?);
        Ok(gcode)
    }
}

fn render_group(
    groups: &[LayerGroup<'_>],
    ordering: &ToolOrdering,
    config: &PrintConfig,
    index: usize,
    single_object_instance: Option<(usize, usize)>,
) -> Result<RenderedLayer> {
    let lt = ordering
        .get_layer_tools(index)
        .ok_or_else(|| Error::Pipeline(format!("no tool ordering for layer {index}")))?;
    render_layer(&groups[index], lt, config, index, single_object_instance)
}

/// Object declarations some firmwares need before the first layer.
fn label_definitions(print: &Print, flavor: GCodeFlavor) -> String {
    let instances: usize = print.objects().iter().map(|o| o.instances().len()).sum();
    match flavor {
        GCodeFlavor::Marlin => format!("M486 T{}\n", instances),
        GCodeFlavor::Klipper => {
            let mut gcode = String::new();
            for object in print.objects() {
                let center = object.bounding_box().center();
                for (i, instance) in object.instances().iter().enumerate() {
                    let c = (center + instance.shift).to_f64();
                    let _ = writeln!(
                        gcode,
                        "EXCLUDE_OBJECT_DEFINE NAME={} CENTER={:.3},{:.3}",
                        label_name(object.name(), object.id(), i),
                        c.x,
                        c.y
                    );
                }
            }
            gcode
        }
        GCodeFlavor::RepRap => String::new(),
    }
}

fn usage_summary(result: &GCodeProcessorResult) -> String {
    let lengths: Vec<String> = result
        .filament_used_mm
        .iter()
        .map(|mm| format!("{:.2}", mm))
        .collect();
    format!(
        "; filament used [mm] = {}\n; total filament used [m] = {:.3}\n; estimated printing time = {}\n",
        lengths.join(","),
        result.filament_used_meters(),
        result.print_time_formatted()
    )
}

fn timelapse_warning_code(config: &PrintConfig, has_wipe_tower: bool) -> u32 {
    let mut code = 0;
    if config.timelapse_type == TimelapseType::Traditional {
        if config.print_sequence == PrintSequence::ByObject {
            code |= TIMELAPSE_WARNING_BY_OBJECT;
        }
        if config.spiral_vase {
            code |= TIMELAPSE_WARNING_SPIRAL_VASE;
        }
    }
    if config.timelapse_type == TimelapseType::Smooth && !has_wipe_tower {
        code |= TIMELAPSE_WARNING_NO_WIPE_TOWER;
    }
    code
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmp_path_appends_suffix() {
        assert_eq!(tmp_path(Path::new("/a/b/out.gcode")), PathBuf::from("/a/b/out.gcode.tmp"));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("my part/v2"), "my_part_v2");
    }

    #[test]
    fn test_timelapse_warning_bits() {
        let mut config = PrintConfig::default();
        assert_eq!(timelapse_warning_code(&config, false), 0);

        config.timelapse_type = TimelapseType::Traditional;
        config.print_sequence = PrintSequence::ByObject;
        config.spiral_vase = true;
        assert_eq!(
            timelapse_warning_code(&config, false),
            TIMELAPSE_WARNING_BY_OBJECT | TIMELAPSE_WARNING_SPIRAL_VASE
        );

        config.timelapse_type = TimelapseType::Smooth;
        assert_eq!(timelapse_warning_code(&config, false), TIMELAPSE_WARNING_NO_WIPE_TOWER);
        assert_eq!(timelapse_warning_code(&config, true), 0);
    }

    #[test]
    fn test_usage_summary() {
        let mut result = GCodeProcessorResult::new(2);
        result.filament_used_mm = vec![1500.0, 250.5];
        let summary = usage_summary(&result);
        assert!(summary.contains("; filament used [mm] = 1500.00,250.50"));
        assert!(summary.contains("; total filament used [m] = 1.750"));
    }

    #[test]
    fn test_outcome_accessors() {
        let done = ExportOutcome::Completed(GCodeProcessorResult::new(1));
        assert!(!done.is_cancelled());
        assert!(done.result().is_some());
        assert!(ExportOutcome::Cancelled.is_cancelled());
        assert!(ExportOutcome::Cancelled.into_result().is_none());
    }
}
