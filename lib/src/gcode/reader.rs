//! Minimal G-code line reader shared by the post-filters and the output stream.

use crate::CoordF;

/// A parsed `G0`/`G1` move. Missing words are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GCodeMove {
    pub x: Option<CoordF>,
    pub y: Option<CoordF>,
    pub z: Option<CoordF>,
    pub e: Option<CoordF>,
    /// Feedrate in mm/min.
    pub f: Option<CoordF>,
}

impl GCodeMove {
    /// Parse a linear move; any other line yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let code = line.split(';').next().unwrap_or("").trim();
        let mut parts = code.split_whitespace();
        match parts.next() {
            Some("G0") | Some("G1") => {}
            _ => return None,
        }

        let mut mov = GCodeMove::default();
        for part in parts {
            if part.len() < 2 {
                continue;
            }
            let (word, value) = part.split_at(1);
            let Ok(value) = value.parse::<CoordF>() else {
                continue;
            };
            match word {
                "X" | "x" => mov.x = Some(value),
                "Y" | "y" => mov.y = Some(value),
                "Z" | "z" => mov.z = Some(value),
                "E" | "e" => mov.e = Some(value),
                "F" | "f" => mov.f = Some(value),
                _ => {}
            }
        }
        Some(mov)
    }

    pub fn has_xy(&self) -> bool {
        self.x.is_some() || self.y.is_some()
    }

    /// Moves in the plane while pushing filament.
    pub fn is_extrusion(&self) -> bool {
        self.has_xy() && self.e.is_some_and(|e| e > 0.0)
    }
}

/// Extruder selected by a `T<n>` line.
pub fn parse_tool_select(line: &str) -> Option<u32> {
    let code = line.split(';').next().unwrap_or("").trim();
    let digits = code.strip_prefix('T')?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move() {
        let mov = GCodeMove::parse("G1 X10.5 Y-2 E0.12345 F1800 ; comment X99").unwrap();
        assert_eq!(mov.x, Some(10.5));
        assert_eq!(mov.y, Some(-2.0));
        assert_eq!(mov.e, Some(0.12345));
        assert_eq!(mov.f, Some(1800.0));
        assert!(mov.is_extrusion());
    }

    #[test]
    fn test_parse_non_moves() {
        assert!(GCodeMove::parse("; G1 X1").is_none());
        assert!(GCodeMove::parse("M104 S200").is_none());
        assert!(GCodeMove::parse("G10").is_none());
        let retract = GCodeMove::parse("G1 E-0.8 F2100").unwrap();
        assert!(!retract.is_extrusion());
    }

    #[test]
    fn test_parse_tool_select() {
        assert_eq!(parse_tool_select("T1"), Some(1));
        assert_eq!(parse_tool_select("T12 ; comment"), Some(12));
        assert_eq!(parse_tool_select("TOOL"), None);
        assert_eq!(parse_tool_select("G1 T1"), None);
    }
}
