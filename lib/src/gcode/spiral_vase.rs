//! Spiral vase mode for continuous Z movement.
//!
//! Works on the rendered text of a layer: for layers flagged for spiral
//! printing the discrete layer-change Z move is dropped and every extrusion
//! in the layer climbs from the previous layer's Z to this layer's Z in
//! proportion to the distance printed so far.

use crate::gcode::reader::GCodeMove;
use crate::CoordF;
use std::fmt::Write as _;

#[derive(Debug, Clone, Default)]
pub struct SpiralVase {
    /// Z the previous layer finished at.
    last_z: Option<CoordF>,
    /// Whether the previous layer was spiralized.
    active: bool,
}

fn layer_z(gcode: &str) -> Option<CoordF> {
    gcode
        .lines()
        .find_map(|l| l.strip_prefix(";Z:"))
        .and_then(|z| z.trim().parse().ok())
}

impl SpiralVase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether spiral mode is currently active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Process a layer. Layers with `enable == false` pass through untouched.
    pub fn process_layer(&mut self, gcode: &str, enable: bool) -> String {
        let z = layer_z(gcode);
        let previous = self.last_z;
        if z.is_some() {
            self.last_z = z;
        }

        let (Some(z), Some(z_start), true) = (z, previous, enable) else {
            self.active = false;
            return gcode.to_string();
        };

        // Total extruded XY length of the layer
        let mut total = 0.0;
        let mut pos: Option<(CoordF, CoordF)> = None;
        for line in gcode.lines() {
            if let Some(mov) = GCodeMove::parse(line) {
                if !mov.has_xy() {
                    continue;
                }
                let (px, py) = pos.unwrap_or((0.0, 0.0));
                let next = (mov.x.unwrap_or(px), mov.y.unwrap_or(py));
                if mov.is_extrusion() && pos.is_some() {
                    total += ((next.0 - px).powi(2) + (next.1 - py).powi(2)).sqrt();
                }
                pos = Some(next);
            }
        }
        if total <= 0.0 {
            self.active = false;
            return gcode.to_string();
        }

        let dz = z - z_start;
        let mut out = String::with_capacity(gcode.len() + gcode.len() / 8);
        let mut done = 0.0;
        let mut pos: Option<(CoordF, CoordF)> = None;
        for line in gcode.lines() {
            let Some(mov) = GCodeMove::parse(line) else {
                out.push_str(line);
                out.push('\n');
                continue;
            };
            if !mov.has_xy() {
                // The layer change itself, the spiral covers it
                if mov.z.is_some_and(|mz| (mz - z).abs() < 1e-4) && mov.e.is_none() {
                    continue;
                }
                out.push_str(line);
                out.push('\n');
                continue;
            }
            let (px, py) = pos.unwrap_or((0.0, 0.0));
            let (x, y) = (mov.x.unwrap_or(px), mov.y.unwrap_or(py));
            let had_pos = pos.is_some();
            pos = Some((x, y));
            if !mov.is_extrusion() || !had_pos {
                out.push_str(line);
                out.push('\n');
                continue;
            }
            done += ((x - px).powi(2) + (y - py).powi(2)).sqrt();
            let line_z = z_start + dz * (done / total).min(1.0);
            let _ = write!(
                out,
                "G1 X{:.3} Y{:.3} Z{:.3} E{:.5}",
                x,
                y,
                line_z,
                mov.e.unwrap_or(0.0)
            );
            if let Some(f) = mov.f {
                let _ = write!(out, " F{:.0}", f);
            }
            out.push('\n');
        }
        self.active = true;
        out
    }

    /// Reset the processor state.
    pub fn reset(&mut self) {
        self.last_z = None;
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn layer(z: f64) -> String {
        format!(
            ";LAYER_CHANGE\n;Z:{z:.3}\n;HEIGHT:0.2\nG1 Z{z:.3} F600\nG1 X0.000 Y0.000 F9000\nG1 X10.000 Y0.000 E0.50000\nG1 X10.000 Y10.000 E0.50000\n"
        )
    }

    fn z_values(gcode: &str) -> Vec<f64> {
        gcode
            .lines()
            .filter_map(GCodeMove::parse)
            .filter(|m| m.is_extrusion())
            .filter_map(|m| m.z)
            .collect()
    }

    #[test]
    fn test_disabled_layer_passes_through() {
        let mut vase = SpiralVase::new();
        let input = layer(0.2);
        assert_eq!(vase.process_layer(&input, false), input);
        assert!(!vase.is_active());
    }

    #[test]
    fn test_first_layer_cannot_spiral() {
        let mut vase = SpiralVase::new();
        let input = layer(0.2);
        assert_eq!(vase.process_layer(&input, true), input);
    }

    #[test]
    fn test_z_ramps_along_layer() {
        let mut vase = SpiralVase::new();
        vase.process_layer(&layer(0.2), false);
        let out = vase.process_layer(&layer(0.4), true);
        assert!(vase.is_active());
        assert!(!out.contains("G1 Z0.400 F600"));
        let zs = z_values(&out);
        assert_eq!(zs.len(), 2);
        assert_relative_eq!(zs[0], 0.3, epsilon = 1e-3);
        assert_relative_eq!(zs[1], 0.4, epsilon = 1e-3);
        // Travel keeps its original form
        assert!(out.contains("G1 X0.000 Y0.000 F9000"));
    }

    #[test]
    fn test_reset() {
        let mut vase = SpiralVase::new();
        vase.process_layer(&layer(0.2), false);
        vase.reset();
        let input = layer(0.4);
        assert_eq!(vase.process_layer(&input, true), input);
    }
}
