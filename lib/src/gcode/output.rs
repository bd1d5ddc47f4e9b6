//! G-code output stream and processor result.
//!
//! [`GCodeOutputStream`] is the last stage of the pipeline: it writes the
//! filtered text of each layer and reads it back on the fly to fill the
//! [`GCodeProcessorResult`] handed to the caller.

use crate::gcode::placeholder::TemplateWarning;
use crate::gcode::reader::{parse_tool_select, GCodeMove};
use crate::gcode::writer::TOOL_CHANGE_TAG;
use crate::{CoordF, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

/// By-object printing with a traditional timelapse.
pub const TIMELAPSE_WARNING_BY_OBJECT: u32 = 1;
/// Spiral vase with a traditional timelapse.
pub const TIMELAPSE_WARNING_SPIRAL_VASE: u32 = 1 << 1;
/// Smooth timelapse without a wipe tower to park on.
pub const TIMELAPSE_WARNING_NO_WIPE_TOWER: u32 = 1 << 2;

/// Summary of an exported file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GCodeProcessorResult {
    /// Net filament pushed per extruder (mm).
    pub filament_used_mm: Vec<CoordF>,
    /// Estimated time of every layer before cooling slowdown (s).
    pub layer_times: Vec<CoordF>,
    /// Tool change markers found in the output.
    pub tool_change_count: usize,
    /// Layer change markers found in the output.
    pub layer_count: usize,
    /// Bit set of `TIMELAPSE_WARNING_*`.
    pub timelapse_warning_code: u32,
    /// Template substitution failures, in the order they happened.
    pub warnings: Vec<TemplateWarning>,
    pub bytes_written: u64,
}

impl GCodeProcessorResult {
    pub fn new(extruder_count: usize) -> Self {
        Self {
            filament_used_mm: vec![0.0; extruder_count],
            ..Default::default()
        }
    }

    pub fn total_filament_mm(&self) -> CoordF {
        self.filament_used_mm.iter().sum()
    }

    pub fn filament_used_meters(&self) -> CoordF {
        self.total_filament_mm() / 1000.0
    }

    pub fn print_time_seconds(&self) -> CoordF {
        self.layer_times.iter().sum()
    }

    /// Estimated print time as HH:MM:SS.
    pub fn print_time_formatted(&self) -> String {
        let total_seconds = self.print_time_seconds() as u64;
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

impl fmt::Display for GCodeProcessorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GCodeProcessorResult(layers={}, tool_changes={}, time={}, filament={:.2}m)",
            self.layer_count,
            self.tool_change_count,
            self.print_time_formatted(),
            self.filament_used_meters()
        )
    }
}

/// Writes G-code text and keeps the statistics of what went through.
pub struct GCodeOutputStream<W: Write> {
    inner: W,
    current_extruder: usize,
    result: GCodeProcessorResult,
}

impl<W: Write> GCodeOutputStream<W> {
    pub fn new(inner: W, extruder_count: usize) -> Self {
        Self {
            inner,
            current_extruder: 0,
            result: GCodeProcessorResult::new(extruder_count),
        }
    }

    /// Write a chunk of complete lines.
    pub fn write(&mut self, gcode: &str) -> Result<()> {
        if gcode.is_empty() {
            return Ok(());
        }
        for line in gcode.lines() {
            self.scan(line);
        }
        self.inner.write_all(gcode.as_bytes())?;
        self.result.bytes_written += gcode.len() as u64;
        Ok(())
    }

    fn scan(&mut self, line: &str) {
        if line.trim_end() == TOOL_CHANGE_TAG {
            self.result.tool_change_count += 1;
            return;
        }
        if line.starts_with(";LAYER_CHANGE") {
            self.result.layer_count += 1;
            return;
        }
        if let Some(t) = parse_tool_select(line) {
            self.current_extruder = t as usize;
            if self.result.filament_used_mm.len() <= self.current_extruder {
                self.result.filament_used_mm.resize(self.current_extruder + 1, 0.0);
            }
            return;
        }
        if let Some(e) = GCodeMove::parse(line).and_then(|m| m.e) {
            if let Some(used) = self.result.filament_used_mm.get_mut(self.current_extruder) {
                *used += e;
            }
        }
    }

    pub fn note_layer_time(&mut self, seconds: CoordF) {
        self.result.layer_times.push(seconds);
    }

    pub fn set_timelapse_warning_code(&mut self, code: u32) {
        self.result.timelapse_warning_code = code;
    }

    pub fn add_warnings(&mut self, warnings: impl IntoIterator<Item = TemplateWarning>) {
        self.result.warnings.extend(warnings);
    }

    /// Statistics gathered so far.
    pub fn result(&self) -> &GCodeProcessorResult {
        &self.result
    }

    /// Flush the writer and hand back both halves.
    pub fn finish(mut self) -> Result<(W, GCodeProcessorResult)> {
        self.inner.flush()?;
        Ok((self.inner, self.result))
    }
}
