//! Cooling buffer for layer time-based fan control and speed adjustments.
//!
//! The buffer is a text filter placed after emission:
//! - Estimates each layer's print time from its moves, per extruder
//! - Slows down tagged extrusion feedrates so short layers reach the
//!   minimum layer time, never below the minimum print speed
//! - Controls fan speed based on layer time thresholds
//!
//! Only feedrate lines tagged with [`EXTRUDE_SET_SPEED_TAG`] are rescaled;
//! the tags are stripped from the output. A layer is held back until the
//! next one arrives, or until flushed.

use crate::config::CoolingConfig;
use crate::gcode::reader::{parse_tool_select, GCodeMove};
use crate::gcode::writer::{EXTRUDE_END_TAG, EXTRUDE_SET_SPEED_TAG};
use crate::{CoordF, ExtrusionRole};

/// Represents a single move/extrusion segment for cooling calculations.
#[derive(Debug, Clone)]
pub struct CoolingMove {
    /// Length of the move in mm.
    pub length: f64,
    /// Original feedrate in mm/s.
    pub feedrate: f64,
    /// Whether this is a travel move (non-extrusion).
    pub is_travel: bool,
    /// Whether this can be slowed down.
    pub can_slowdown: bool,
    /// Time to execute this move at original speed (seconds).
    pub time: f64,
    /// Adjusted feedrate after cooling slowdown (mm/s).
    pub adjusted_feedrate: f64,
}

impl CoolingMove {
    fn new(length: f64, feedrate: f64, is_travel: bool, can_slowdown: bool) -> Self {
        let time = if feedrate > 0.0 { length / feedrate } else { 0.0 };
        Self {
            length,
            feedrate,
            is_travel,
            can_slowdown: can_slowdown && !is_travel,
            time,
            adjusted_feedrate: feedrate,
        }
    }

    /// Create a travel move.
    pub fn travel(length: f64, feedrate: f64) -> Self {
        Self::new(length, feedrate, true, false)
    }

    /// Create an extrusion move; bridges keep their speed.
    pub fn extrusion(length: f64, feedrate: f64, role: ExtrusionRole) -> Self {
        Self::new(length, feedrate, false, role != ExtrusionRole::BridgeInfill)
    }

    /// An extrusion the buffer must not touch, e.g. on the wipe tower.
    pub fn fixed(length: f64, feedrate: f64) -> Self {
        Self::new(length, feedrate, false, false)
    }

    /// Calculate time at current adjusted feedrate.
    pub fn adjusted_time(&self) -> f64 {
        if self.adjusted_feedrate > 0.0 {
            self.length / self.adjusted_feedrate
        } else {
            0.0
        }
    }
}

/// Per-extruder adjustments for cooling.
#[derive(Debug, Clone)]
pub struct PerExtruderAdjustments {
    /// Extruder index.
    pub extruder_id: u32,
    /// All moves for this extruder.
    pub moves: Vec<CoolingMove>,
    /// Total extrusion time (excluding travels).
    pub extrusion_time: f64,
    /// Total travel time.
    pub travel_time: f64,
    /// Time that can be slowed down.
    pub slowdown_time: f64,
    /// Slowdown factor applied (1.0 = no slowdown).
    pub slowdown_factor: f64,
}

impl PerExtruderAdjustments {
    pub fn new(extruder_id: u32) -> Self {
        Self {
            extruder_id,
            moves: Vec::new(),
            extrusion_time: 0.0,
            travel_time: 0.0,
            slowdown_time: 0.0,
            slowdown_factor: 1.0,
        }
    }

    /// Add a move to this extruder's list.
    pub fn add_move(&mut self, mov: CoolingMove) {
        if mov.is_travel {
            self.travel_time += mov.time;
        } else {
            self.extrusion_time += mov.time;
            if mov.can_slowdown {
                self.slowdown_time += mov.time;
            }
        }
        self.moves.push(mov);
    }

    /// Get total time at original speeds.
    pub fn total_time(&self) -> f64 {
        self.extrusion_time + self.travel_time
    }

    /// Get total time after adjustments.
    pub fn adjusted_total_time(&self) -> f64 {
        self.moves.iter().map(|m| m.adjusted_time()).sum()
    }

    /// Apply slowdown factor to all eligible moves.
    pub fn apply_slowdown(&mut self, factor: f64, min_speed: f64) {
        self.slowdown_factor = factor;
        for mov in &mut self.moves {
            if mov.can_slowdown {
                mov.adjusted_feedrate = (mov.feedrate / factor).max(min_speed.min(mov.feedrate));
            }
        }
    }
}

/// One line of a layer as seen by the buffer.
enum Line<'a> {
    Text(&'a str),
    /// Tagged feedrate line (mm/min) opening an adjustable block.
    SetSpeed { feedrate: CoordF, bridge: bool },
    /// `;_EXTRUDE_END` marker, dropped from the output.
    End,
}

/// Cooling buffer that manages layer cooling and fan control.
#[derive(Debug)]
pub struct CoolingBuffer {
    config: CoolingConfig,
    travel_speed: CoordF,
    /// Processed layer waiting for the next one.
    pending: Option<String>,
    current_extruder: u32,
    x: CoordF,
    y: CoordF,
    /// Current feedrate (mm/min).
    feedrate: CoordF,
    /// Last fan command sent, 0-255.
    fan_speed: Option<u32>,
}

impl CoolingBuffer {
    pub fn new(config: CoolingConfig, travel_speed: CoordF) -> Self {
        Self {
            config,
            travel_speed,
            pending: None,
            current_extruder: 0,
            x: 0.0,
            y: 0.0,
            feedrate: travel_speed * 60.0,
            fan_speed: None,
        }
    }

    pub fn config(&self) -> &CoolingConfig {
        &self.config
    }

    /// Calculate the slowdown factor needed to meet minimum layer time.
    ///
    /// Returns the factor by which print speeds should be divided.
    /// A factor of 1.0 means no slowdown needed.
    pub fn calculate_layer_slowdown(
        &self,
        per_extruder_adjustments: &mut [PerExtruderAdjustments],
    ) -> f64 {
        let total_time: f64 = per_extruder_adjustments
            .iter()
            .map(|adj| adj.total_time())
            .sum();

        if total_time >= self.config.min_layer_time {
            return 1.0;
        }

        let total_slowdown_time: f64 = per_extruder_adjustments
            .iter()
            .map(|adj| adj.slowdown_time)
            .sum();
        if total_slowdown_time <= 0.0 {
            return 1.0;
        }

        let fixed_time = total_time - total_slowdown_time;
        let target_slowdown_time = self.config.min_layer_time - fixed_time;
        let factor = (target_slowdown_time / total_slowdown_time).max(1.0);

        // The slowest adjustable move limits the factor
        let mut max_factor = f64::MAX;
        for adj in per_extruder_adjustments.iter() {
            for mov in &adj.moves {
                if mov.can_slowdown && mov.feedrate > 0.0 {
                    max_factor = max_factor.min(mov.feedrate / self.config.min_print_speed);
                }
            }
        }

        let final_factor = factor.min(max_factor).max(1.0);
        for adj in per_extruder_adjustments.iter_mut() {
            adj.apply_slowdown(final_factor, self.config.min_print_speed);
        }
        final_factor
    }

    /// Fan speed (0.0 - 1.0) for a layer printed in `layer_time` seconds.
    pub fn calculate_fan_speed(&self, layer_index: usize, layer_time: f64) -> f64 {
        if layer_index < self.config.disable_fan_first_layers as usize {
            return 0.0;
        }
        if layer_time >= self.config.fan_below_layer_time {
            return 0.0;
        }
        if layer_time <= self.config.full_fan_speed_layer_time {
            return self.config.fan_max_speed;
        }
        let range = self.config.fan_below_layer_time - self.config.full_fan_speed_layer_time;
        if range > 0.0 {
            let t = (self.config.fan_below_layer_time - layer_time) / range;
            self.config.fan_min_speed + t * (self.config.fan_max_speed - self.config.fan_min_speed)
        } else {
            self.config.fan_max_speed
        }
    }

    /// Feed one layer; returns the previously held layer (or both when `flush`).
    pub fn process_layer(&mut self, gcode: &str, layer_index: usize, flush: bool) -> String {
        let processed = self.apply(gcode, layer_index);
        let mut out = self.pending.take().unwrap_or_default();
        if flush {
            out.push_str(&processed);
        } else {
            self.pending = Some(processed);
        }
        out
    }

    /// Release the held layer.
    pub fn flush(&mut self) -> String {
        self.pending.take().unwrap_or_default()
    }

    fn apply(&mut self, gcode: &str, layer_index: usize) -> String {
        let mut lines: Vec<Line<'_>> = Vec::new();
        let mut adjustments: Vec<PerExtruderAdjustments> = Vec::new();
        let mut in_block = false;
        let mut bridge = false;

        for text in gcode.lines() {
            if let Some(t) = parse_tool_select(text) {
                self.current_extruder = t;
            }
            if let Some(role) = text.strip_prefix(";TYPE:") {
                bridge = role.trim() == ExtrusionRole::BridgeInfill.name();
            }
            if text.trim() == EXTRUDE_END_TAG {
                in_block = false;
                lines.push(Line::End);
                continue;
            }
            let Some(mov) = GCodeMove::parse(text) else {
                lines.push(Line::Text(text));
                continue;
            };
            if let Some(f) = mov.f {
                self.feedrate = f;
            }
            if text.contains(EXTRUDE_SET_SPEED_TAG) {
                in_block = true;
                lines.push(Line::SetSpeed {
                    feedrate: self.feedrate,
                    bridge,
                });
                continue;
            }
            lines.push(Line::Text(text));

            if !mov.has_xy() {
                continue;
            }
            let x = mov.x.unwrap_or(self.x);
            let y = mov.y.unwrap_or(self.y);
            let length = ((x - self.x).powi(2) + (y - self.y).powi(2)).sqrt();
            self.x = x;
            self.y = y;

            let speed = self.feedrate / 60.0;
            let cooling_move = if !mov.is_extrusion() {
                CoolingMove::travel(length, speed)
            } else if in_block && !bridge {
                CoolingMove::extrusion(length, speed, ExtrusionRole::Perimeter)
            } else {
                CoolingMove::fixed(length, speed)
            };
            let idx = match adjustments
                .iter()
                .position(|a| a.extruder_id == self.current_extruder)
            {
                Some(idx) => idx,
                None => {
                    adjustments.push(PerExtruderAdjustments::new(self.current_extruder));
                    adjustments.len() - 1
                }
            };
            adjustments[idx].add_move(cooling_move);
        }

        let factor = if self.config.enabled {
            self.calculate_layer_slowdown(&mut adjustments)
        } else {
            1.0
        };
        let layer_time: f64 = adjustments.iter().map(|a| a.adjusted_total_time()).sum();

        let mut out = String::with_capacity(gcode.len() + 32);
        let fan_line = self.fan_line(layer_index, layer_time);
        let mut fan_pending = fan_line.is_some();
        let min_feedrate = self.config.min_print_speed * 60.0;

        for line in lines {
            match line {
                Line::Text(text) => {
                    out.push_str(text);
                    out.push('\n');
                    if fan_pending && text.starts_with(";HEIGHT:") {
                        if let Some(fan) = &fan_line {
                            out.push_str(fan);
                        }
                        fan_pending = false;
                    }
                }
                Line::SetSpeed { feedrate, bridge } => {
                    let f = if bridge || factor <= 1.0 {
                        feedrate
                    } else {
                        (feedrate / factor).max(min_feedrate.min(feedrate))
                    };
                    out.push_str(&format!("G1 F{:.0}\n", f));
                }
                Line::End => {}
            }
        }
        if fan_pending {
            if let Some(fan) = fan_line {
                out.insert_str(0, &fan);
            }
        }
        out
    }

    fn fan_line(&mut self, layer_index: usize, layer_time: f64) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let speed = (self.calculate_fan_speed(layer_index, layer_time) * 255.0).round() as u32;
        if self.fan_speed == Some(speed) {
            return None;
        }
        self.fan_speed = Some(speed);
        Some(if speed == 0 {
            "M107\n".to_string()
        } else {
            format!("M106 S{}\n", speed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(config: CoolingConfig) -> CoolingBuffer {
        CoolingBuffer::new(config, 150.0)
    }

    /// A layer printing `len` mm at 50 mm/s in one tagged block.
    fn layer(len: f64) -> String {
        format!(
            ";LAYER_CHANGE\n;Z:0.4\n;HEIGHT:0.2\nG1 X0 Y0 F9000\n;TYPE:Outer wall\nG1 F3000 ;_EXTRUDE_SET_SPEED\nG1 X{:.3} Y0 E1.0\n;_EXTRUDE_END\n",
            len
        )
    }

    #[test]
    fn test_slowdown_calculation_no_slowdown_needed() {
        let buffer = buffer(CoolingConfig {
            min_layer_time: 5.0,
            min_print_speed: 10.0,
            ..Default::default()
        });

        let mut adj = PerExtruderAdjustments::new(0);
        adj.add_move(CoolingMove::extrusion(500.0, 50.0, ExtrusionRole::Perimeter)); // 10 seconds

        let mut adjustments = vec![adj];
        let factor = buffer.calculate_layer_slowdown(&mut adjustments);
        assert!((factor - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_slowdown_calculation_slowdown_needed() {
        let buffer = buffer(CoolingConfig {
            min_layer_time: 10.0,
            min_print_speed: 10.0,
            ..Default::default()
        });

        let mut adj = PerExtruderAdjustments::new(0);
        adj.add_move(CoolingMove::extrusion(250.0, 50.0, ExtrusionRole::Perimeter)); // 5 seconds

        let mut adjustments = vec![adj];
        let factor = buffer.calculate_layer_slowdown(&mut adjustments);
        assert!((factor - 2.0).abs() < 0.1);
        assert!(adjustments[0].adjusted_total_time() >= 9.9);
    }

    #[test]
    fn test_bridge_cannot_slowdown() {
        let mov = CoolingMove::extrusion(10.0, 20.0, ExtrusionRole::BridgeInfill);
        assert!(!mov.can_slowdown);
        assert!(!CoolingMove::travel(10.0, 150.0).can_slowdown);
    }

    #[test]
    fn test_fan_speed_first_layer_disabled() {
        let buffer = buffer(CoolingConfig {
            disable_fan_first_layers: 2,
            ..Default::default()
        });
        assert_eq!(buffer.calculate_fan_speed(0, 1.0), 0.0);
        assert_eq!(buffer.calculate_fan_speed(1, 1.0), 0.0);
        assert!(buffer.calculate_fan_speed(2, 1.0) > 0.0);
    }

    #[test]
    fn test_fan_speed_based_on_layer_time() {
        let buffer = buffer(CoolingConfig {
            disable_fan_first_layers: 0,
            fan_below_layer_time: 60.0,
            full_fan_speed_layer_time: 15.0,
            fan_min_speed: 0.4,
            fan_max_speed: 1.0,
            ..Default::default()
        });
        assert_eq!(buffer.calculate_fan_speed(5, 100.0), 0.0);
        assert_eq!(buffer.calculate_fan_speed(5, 10.0), 1.0);
        let speed = buffer.calculate_fan_speed(5, 37.5);
        assert!((speed - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_process_layer_holds_one_layer() {
        let mut buffer = buffer(CoolingConfig {
            min_layer_time: 0.0,
            disable_fan_first_layers: 0,
            ..Default::default()
        });
        let first = buffer.process_layer(&layer(100.0), 0, false);
        assert!(first.is_empty());
        let second = buffer.process_layer(&layer(100.0), 1, false);
        assert!(second.contains(";LAYER_CHANGE"));
        assert!(!second.contains(EXTRUDE_SET_SPEED_TAG));
        assert!(!second.contains(EXTRUDE_END_TAG));
        assert!(second.contains("G1 F3000\n"));
        let rest = buffer.flush();
        assert_eq!(rest.matches(";LAYER_CHANGE").count(), 1);
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn test_short_layer_is_slowed_and_fanned() {
        let mut buffer = buffer(CoolingConfig {
            min_layer_time: 10.0,
            min_print_speed: 10.0,
            disable_fan_first_layers: 0,
            ..Default::default()
        });
        // 100 mm at 50 mm/s = 2 s of extrusion
        let out = buffer.process_layer(&layer(100.0), 3, true);
        let feed_line = out
            .lines()
            .find(|l| l.starts_with("G1 F") && !l.contains('X'))
            .unwrap();
        let f: f64 = feed_line[4..].parse().unwrap();
        assert!(f < 3000.0);
        assert!(f >= 600.0);
        let height = out.find(";HEIGHT:").unwrap();
        let fan = out.find("M106 S255").unwrap();
        assert!(fan > height);
    }

    #[test]
    fn test_bridge_keeps_speed() {
        let mut buffer = buffer(CoolingConfig {
            min_layer_time: 100.0,
            ..Default::default()
        });
        let gcode = ";TYPE:Bridge\nG1 F1500 ;_EXTRUDE_SET_SPEED\nG1 X10 Y0 E0.5\n;_EXTRUDE_END\n";
        let out = buffer.process_layer(gcode, 5, true);
        assert!(out.contains("G1 F1500\n"));
    }

    #[test]
    fn test_disabled_only_strips_tags() {
        let mut buffer = buffer(CoolingConfig {
            enabled: false,
            ..Default::default()
        });
        let out = buffer.process_layer(&layer(10.0), 4, true);
        assert!(out.contains("G1 F3000\n"));
        assert!(!out.contains("M106"));
        assert!(!out.contains("M107"));
    }
}
