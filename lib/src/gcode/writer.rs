//! G-code line formatter and writer state.
//!
//! [`GCodeWriter`] formats motion commands and remembers what the machine was
//! last told: active extruder, Z, lift, feedrate, acceleration and how much
//! filament each extruder currently has retracted. Retractions can be spread
//! over a wipe move back along the last extrusion. Extrusion is always
//! relative (`M83`); the pure formatting helpers are associated functions so
//! that layer rendering can use them from worker threads.

use crate::config::{ExtruderConfig, GCodeFlavor, PrintConfig};
use crate::geometry::PointF;
use crate::CoordF;
use std::fmt::Write as _;

/// Marker preceding every tool change emitted during the print.
pub const TOOL_CHANGE_TAG: &str = "; TOOL_CHANGE";

/// Comment appended to feedrate lines the cooling buffer may rescale.
pub const EXTRUDE_SET_SPEED_TAG: &str = ";_EXTRUDE_SET_SPEED";

/// Comment closing an extrusion block started by a tagged feedrate line.
pub const EXTRUDE_END_TAG: &str = ";_EXTRUDE_END";

const XYZ_EPSILON: CoordF = 1e-5;

/// Wipe moves run at this share of the travel speed.
const WIPE_SPEED_RATIO: CoordF = 0.8;

#[derive(Debug, Clone)]
pub struct GCodeWriter {
    flavor: GCodeFlavor,
    extruders: Vec<ExtruderConfig>,
    travel_speed: CoordF,
    travel_speed_z: CoordF,
    current_extruder: Option<u32>,
    /// Filament currently pulled back, per extruder (mm).
    retracted: Vec<CoordF>,
    /// Z hop currently applied (mm).
    lifted: CoordF,
    z: CoordF,
    /// Last feedrate sent (mm/min).
    feedrate: Option<CoordF>,
    acceleration: Option<u32>,
    pos: Option<PointF>,
}

impl GCodeWriter {
    pub fn new(config: &PrintConfig) -> Self {
        Self {
            flavor: config.gcode_flavor,
            extruders: config.extruders.clone(),
            travel_speed: config.travel_speed,
            travel_speed_z: config.travel_speed_z,
            current_extruder: None,
            retracted: vec![0.0; config.extruders.len()],
            lifted: 0.0,
            z: 0.0,
            feedrate: None,
            acceleration: None,
            pos: None,
        }
    }

    // ========================================================================
    // Pure formatting
    // ========================================================================

    /// `G1 X.. Y.. E..` with relative E.
    pub fn extrusion_line(p: PointF, e: CoordF) -> String {
        format!("G1 X{:.3} Y{:.3} E{:.5}\n", p.x, p.y, e)
    }

    /// Feedrate line in mm/min from a speed in mm/s, optionally tagged for the cooling buffer.
    pub fn speed_line(speed_mm_s: CoordF, tagged: bool) -> String {
        if tagged {
            format!("G1 F{:.0} {}\n", speed_mm_s * 60.0, EXTRUDE_SET_SPEED_TAG)
        } else {
            format!("G1 F{:.0}\n", speed_mm_s * 60.0)
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn flavor(&self) -> GCodeFlavor {
        self.flavor
    }

    pub fn extruder(&self) -> Option<u32> {
        self.current_extruder
    }

    pub fn z(&self) -> CoordF {
        self.z
    }

    pub fn position(&self) -> Option<PointF> {
        self.pos
    }

    pub fn lifted(&self) -> CoordF {
        self.lifted
    }

    /// Filament retracted on the active extruder (mm).
    pub fn retracted_length(&self) -> CoordF {
        self.current_extruder
            .and_then(|e| self.retracted.get(e as usize).copied())
            .unwrap_or(0.0)
    }

    pub fn is_retracted(&self) -> bool {
        self.retracted_length() > XYZ_EPSILON
    }

    pub fn need_toolchange(&self, extruder: u32) -> bool {
        self.current_extruder != Some(extruder)
    }

    fn extruder_config(&self) -> ExtruderConfig {
        let idx = self.current_extruder.unwrap_or(0) as usize;
        self.extruders
            .get(idx)
            .or_else(|| self.extruders.last())
            .cloned()
            .unwrap_or_default()
    }

    /// Forget the cached feedrate, e.g. after foreign G-code was appended.
    pub fn reset_feedrate(&mut self) {
        self.feedrate = None;
    }

    pub fn note_position(&mut self, pos: PointF) {
        self.pos = Some(pos);
    }

    // ========================================================================
    // Machine setup
    // ========================================================================

    /// Units, absolute XYZ and relative extrusion.
    pub fn preamble(&self) -> String {
        let mut gcode = String::from("G21 ; set units to millimeters\nG90 ; use absolute coordinates\n");
        gcode.push_str("M83 ; use relative distances for extrusion\n");
        gcode
    }

    pub fn set_temperature(&self, temperature: u32, wait: bool, tool: Option<u32>) -> String {
        let code = if wait { "M109" } else { "M104" };
        match tool {
            Some(t) => format!("{} S{} T{}\n", code, temperature, t),
            None => format!("{} S{}\n", code, temperature),
        }
    }

    pub fn set_bed_temperature(&self, temperature: u32, wait: bool) -> String {
        let code = if wait { "M190" } else { "M140" };
        format!("{} S{}\n", code, temperature)
    }

    pub fn set_acceleration(&mut self, acceleration: u32) -> String {
        if acceleration == 0 || self.acceleration == Some(acceleration) {
            return String::new();
        }
        self.acceleration = Some(acceleration);
        match self.flavor {
            GCodeFlavor::Klipper => format!("SET_VELOCITY_LIMIT ACCEL={}\n", acceleration),
            GCodeFlavor::Marlin | GCodeFlavor::RepRap => format!("M204 S{}\n", acceleration),
        }
    }

    /// Select the first extruder without the tool change marker.
    pub fn select_initial_extruder(&mut self, extruder: u32) -> String {
        self.current_extruder = Some(extruder);
        format!("T{}\n", extruder)
    }

    /// Switch extruders; the marker line makes every switch countable.
    pub fn toolchange(&mut self, extruder: u32) -> String {
        self.current_extruder = Some(extruder);
        format!("{}\nT{}\n", TOOL_CHANGE_TAG, extruder)
    }

    // ========================================================================
    // Motion
    // ========================================================================

    fn feedrate_word(&mut self, feedrate_mm_min: CoordF) -> String {
        if self
            .feedrate
            .is_some_and(|f| (f - feedrate_mm_min).abs() < XYZ_EPSILON)
        {
            String::new()
        } else {
            self.feedrate = Some(feedrate_mm_min);
            format!(" F{:.0}", feedrate_mm_min)
        }
    }

    /// Non-extruding move in the XY plane.
    pub fn travel_to_xy(&mut self, p: PointF, speed_mm_s: CoordF, comment: Option<&str>) -> String {
        let f = self.feedrate_word(speed_mm_s * 60.0);
        self.pos = Some(p);
        let mut line = format!("G1 X{:.3} Y{:.3}{}", p.x, p.y, f);
        if let Some(c) = comment {
            let _ = write!(line, " ; {}", c);
        }
        line.push('\n');
        line
    }

    /// Move to a new layer height, keeping any lift applied.
    pub fn travel_to_z(&mut self, z: CoordF, comment: Option<&str>) -> String {
        if (self.z - z).abs() < XYZ_EPSILON && self.lifted == 0.0 {
            return String::new();
        }
        self.z = z;
        // A layer change cancels the lift; the next retraction lifts again.
        self.lifted = 0.0;
        let f = self.feedrate_word(self.travel_speed_z * 60.0);
        let mut line = format!("G1 Z{:.3}{}", z, f);
        if let Some(c) = comment {
            let _ = write!(line, " ; {}", c);
        }
        line.push('\n');
        line
    }

    fn retract_to(&mut self, length: CoordF, comment: &str, wipe: &[PointF]) -> String {
        let Some(extruder) = self.current_extruder else {
            return String::new();
        };
        let config = self.extruder_config();
        let idx = extruder as usize;
        if idx >= self.retracted.len() {
            self.retracted.resize(idx + 1, 0.0);
        }
        let delta = length - self.retracted[idx];
        let mut gcode = String::new();
        if delta > XYZ_EPSILON {
            let wipe_length: CoordF = wipe.windows(2).map(|w| w[0].distance(&w[1])).sum();
            let before = if config.wipe && wipe_length > XYZ_EPSILON {
                delta * config.retract_before_wipe
            } else {
                delta
            };
            if before > XYZ_EPSILON {
                let f = self.feedrate_word(config.retract_speed * 60.0);
                let _ = writeln!(gcode, "G1 E{:.5}{} ; {}", -before, f, comment);
            }
            let during = delta - before;
            if during > XYZ_EPSILON {
                gcode.push_str(&self.wipe(wipe, wipe_length, during));
            }
            self.retracted[idx] = length;
        }
        gcode.push_str(&self.lift(config.z_hop));
        gcode
    }

    /// Move along `path` while pulling back `retract` mm of filament,
    /// spread over the path by length.
    fn wipe(&mut self, path: &[PointF], length: CoordF, retract: CoordF) -> String {
        let mut gcode = String::new();
        let speed = self.travel_speed * WIPE_SPEED_RATIO;
        for w in path.windows(2) {
            let d = w[0].distance(&w[1]);
            if d <= XYZ_EPSILON {
                continue;
            }
            let f = self.feedrate_word(speed * 60.0);
            let _ = writeln!(
                gcode,
                "G1 X{:.3} Y{:.3} E{:.5}{} ; wipe and retract",
                w[1].x,
                w[1].y,
                -retract * d / length,
                f
            );
            self.pos = Some(w[1]);
        }
        gcode
    }

    /// Retract the active extruder, by the tool change length if
    /// `toolchange`. With wiping enabled the retraction is spread over a move
    /// along `wipe`, which starts at the current position.
    pub fn retract_with_wipe(&mut self, wipe: &[PointF], toolchange: bool) -> String {
        let config = self.extruder_config();
        if toolchange {
            let length = config.retract_length_toolchange.max(config.retract_length);
            self.retract_to(length, "retract for toolchange", wipe)
        } else {
            self.retract_to(config.retract_length, "retract", wipe)
        }
    }

    /// Push back whatever the active extruder has retracted and drop any lift.
    pub fn unretract(&mut self) -> String {
        let mut gcode = self.unlift();
        let Some(extruder) = self.current_extruder else {
            return gcode;
        };
        let config = self.extruder_config();
        let length = self.retracted.get(extruder as usize).copied().unwrap_or(0.0);
        if length > XYZ_EPSILON {
            let f = self.feedrate_word(config.effective_deretract_speed() * 60.0);
            let _ = writeln!(gcode, "G1 E{:.5}{} ; unretract", length, f);
            self.retracted[extruder as usize] = 0.0;
        }
        gcode
    }

    /// Raise Z by `hop` above the layer height.
    pub fn lift(&mut self, hop: CoordF) -> String {
        if hop <= 0.0 || self.lifted > 0.0 {
            return String::new();
        }
        self.lifted = hop;
        let f = self.feedrate_word(self.travel_speed_z * 60.0);
        format!("G1 Z{:.3}{} ; lift\n", self.z + hop, f)
    }

    pub fn unlift(&mut self) -> String {
        if self.lifted <= 0.0 {
            return String::new();
        }
        self.lifted = 0.0;
        let f = self.feedrate_word(self.travel_speed_z * 60.0);
        format!("G1 Z{:.3}{} ; restore layer Z\n", self.z, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> GCodeWriter {
        let mut config = PrintConfig::with_extruders(2);
        config.extruders[1].retract_length = 1.5;
        config.extruders[0].z_hop = 0.4;
        GCodeWriter::new(&config)
    }

    #[test]
    fn test_retract_is_idempotent() {
        let mut w = writer();
        w.select_initial_extruder(0);
        let first = w.retract_with_wipe(&[], false);
        assert!(first.contains("G1 E-0.80000 F2100"));
        assert!(first.contains("G1 Z0.400"));
        assert!(w.is_retracted());
        assert_eq!(w.retract_with_wipe(&[], false), "");
        let back = w.unretract();
        assert!(back.contains("G1 Z0.000"));
        assert!(back.contains("G1 E0.80000"));
        assert!(!w.is_retracted());
    }

    #[test]
    fn test_toolchange_retract_tops_up() {
        let mut w = writer();
        w.select_initial_extruder(0);
        w.retract_with_wipe(&[], false);
        let more = w.retract_with_wipe(&[], true);
        assert!(more.contains("E-1.20000"));
        assert!(w.need_toolchange(1));
        assert_eq!(w.toolchange(1), "; TOOL_CHANGE\nT1\n");
        assert!(!w.is_retracted());
        assert!(!w.need_toolchange(1));
    }

    #[test]
    fn test_retract_with_wipe() {
        let mut config = PrintConfig::with_extruders(2);
        config.extruders[0].wipe = true;
        config.extruders[0].retract_length = 1.0;
        config.extruders[0].retract_before_wipe = 0.6;
        let mut w = GCodeWriter::new(&config);
        w.select_initial_extruder(0);

        let path = [PointF::new(10.0, 0.0), PointF::new(9.0, 0.0), PointF::new(9.0, 1.0)];
        let gcode = w.retract_with_wipe(&path, false);
        let lines: Vec<&str> = gcode.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("G1 E-0.60000 F2100"));
        assert_eq!(lines[1], "G1 X9.000 Y0.000 E-0.20000 F7200 ; wipe and retract");
        assert_eq!(lines[2], "G1 X9.000 Y1.000 E-0.20000 ; wipe and retract");
        assert_eq!(w.position(), Some(PointF::new(9.0, 1.0)));
        assert!((w.retracted_length() - 1.0).abs() < 1e-9);

        // no wipe configured: plain retraction whatever the path
        w.unretract();
        w.toolchange(1);
        let plain = w.retract_with_wipe(&path, false);
        assert_eq!(plain.lines().count(), 1);
        assert!(!plain.contains("wipe"));
    }

    #[test]
    fn test_feedrate_only_on_change() {
        let mut w = writer();
        let a = w.travel_to_xy(PointF::new(1.0, 2.0), 100.0, None);
        let b = w.travel_to_xy(PointF::new(3.0, 2.0), 100.0, Some("move"));
        assert_eq!(a, "G1 X1.000 Y2.000 F6000\n");
        assert_eq!(b, "G1 X3.000 Y2.000 ; move\n");
        w.reset_feedrate();
        assert!(w.travel_to_xy(PointF::new(0.0, 0.0), 100.0, None).contains("F6000"));
    }

    #[test]
    fn test_acceleration_by_flavor() {
        let mut w = writer();
        assert_eq!(w.set_acceleration(1000), "M204 S1000\n");
        assert_eq!(w.set_acceleration(1000), "");
        assert_eq!(w.set_acceleration(0), "");

        let config = PrintConfig {
            gcode_flavor: GCodeFlavor::Klipper,
            ..PrintConfig::default()
        };
        let mut k = GCodeWriter::new(&config);
        assert_eq!(k.set_acceleration(500), "SET_VELOCITY_LIMIT ACCEL=500\n");
    }

    #[test]
    fn test_formatting_helpers() {
        assert_eq!(
            GCodeWriter::extrusion_line(PointF::new(1.0, 2.5), 0.123456),
            "G1 X1.000 Y2.500 E0.12346\n"
        );
        assert_eq!(
            GCodeWriter::speed_line(25.0, true),
            "G1 F1500 ;_EXTRUDE_SET_SPEED\n"
        );
    }
}
