//! Target-box geometry
//!
//! `[W]x[H][flag]` in the notation the image tool understands: `120x` fits
//! to 120 pixels wide, `x90` to 90 high, `800x600>` only shrinks.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static GEOMETRY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d*)[xX](\d*)([<>!^]?)$").expect("geometry pattern compiles"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid geometry: {0:?}")]
pub struct GeometryError(pub String);

/// Resize modifier appended to a geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryFlag {
    /// `>`: only shrink larger images
    ShrinkOnly,
    /// `<`: only enlarge smaller images
    EnlargeOnly,
    /// `!`: ignore aspect ratio
    Exact,
    /// `^`: fill the box (minimum dimensions)
    Fill,
}

impl GeometryFlag {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '>' => Some(Self::ShrinkOnly),
            '<' => Some(Self::EnlargeOnly),
            '!' => Some(Self::Exact),
            '^' => Some(Self::Fill),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::ShrinkOnly => '>',
            Self::EnlargeOnly => '<',
            Self::Exact => '!',
            Self::Fill => '^',
        }
    }
}

/// A target box; at least one side is always present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Geometry {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub flag: Option<GeometryFlag>,
}

impl Geometry {
    /// A box with both sides set and no modifier
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            flag: None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, GeometryError> {
        let caps = GEOMETRY_PATTERN
            .captures(s.trim())
            .ok_or_else(|| GeometryError(s.to_string()))?;

        let side = |idx: usize| -> Result<Option<u32>, GeometryError> {
            match caps.get(idx).map(|m| m.as_str()).filter(|v| !v.is_empty()) {
                Some(v) => v.parse().map(Some).map_err(|_| GeometryError(s.to_string())),
                None => Ok(None),
            }
        };

        let width = side(1)?;
        let height = side(2)?;
        if width.is_none() && height.is_none() {
            return Err(GeometryError(s.to_string()));
        }
        if width == Some(0) || height == Some(0) {
            return Err(GeometryError(s.to_string()));
        }

        let flag = caps
            .get(3)
            .and_then(|m| m.as_str().chars().next())
            .and_then(GeometryFlag::from_char);

        Ok(Self {
            width,
            height,
            flag,
        })
    }

    /// Both sides, when the box is fully specified
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }

    /// Whether `s` is a raw dimension spec rather than a symbolic name
    pub fn is_dimension_spec(s: &str) -> bool {
        Self::parse(s).is_ok()
    }
}

impl FromStr for Geometry {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Geometry {
    type Error = GeometryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Geometry> for String {
    fn from(value: Geometry) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(w) = self.width {
            write!(f, "{}", w)?;
        }
        write!(f, "x")?;
        if let Some(h) = self.height {
            write!(f, "{}", h)?;
        }
        if let Some(flag) = self.flag {
            write!(f, "{}", flag.as_char())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variants() {
        let width_only = Geometry::parse("120x").unwrap();
        assert_eq!(width_only.width, Some(120));
        assert_eq!(width_only.height, None);
        assert_eq!(width_only.dimensions(), None);

        let height_only = Geometry::parse("x90").unwrap();
        assert_eq!(height_only.width, None);
        assert_eq!(height_only.height, Some(90));

        let boxed = Geometry::parse("800x600>").unwrap();
        assert_eq!(boxed.dimensions(), Some((800, 600)));
        assert_eq!(boxed.flag, Some(GeometryFlag::ShrinkOnly));

        assert_eq!(Geometry::parse("100X100").unwrap(), Geometry::new(100, 100));
    }

    #[test]
    fn test_rejects_non_geometry() {
        for input in ["medium", "x", "", "12x34x56", "0x10", "-5x10", "10x10+2+3"] {
            assert!(Geometry::parse(input).is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_display_matches_tool_notation() {
        for input in ["120x", "x90", "800x600", "100x100!", "64x64^"] {
            assert_eq!(Geometry::parse(input).unwrap().to_string(), input);
        }
    }

    #[test]
    fn test_dimension_spec_detection() {
        assert!(Geometry::is_dimension_spec("120x"));
        assert!(Geometry::is_dimension_spec("800x600<"));
        assert!(!Geometry::is_dimension_spec("medium"));
        assert!(!Geometry::is_dimension_spec("large_2x"));
    }
}
