//! Printer and engine configuration threaded through the pipeline
//!
//! The external engine version is an explicit value handed to the sanitizer
//! and invoker, never a hidden constant, so version-scoped rewrite rules can
//! be retired when the pinned engine changes.

use crate::transform::Aabb;
use std::collections::BTreeMap;
use std::fmt;

/// Physical extruder slots on the target hardware
pub const MAX_SLOTS: usize = 4;

/// Build volume cuboid in millimeters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildVolume {
    /// X extent (width)
    pub x: f64,
    /// Y extent (depth)
    pub y: f64,
    /// Z extent (height)
    pub z: f64,
}

impl BuildVolume {
    /// Default build envelope for the target hardware
    pub const DEFAULT: BuildVolume = BuildVolume {
        x: 270.0,
        y: 270.0,
        z: 270.0,
    };

    /// Per-axis overruns of a bounding box against this volume
    ///
    /// Checks extent per axis (does the footprint fit), not absolute
    /// placement; placement warnings are handled by the plate validator.
    pub fn overruns(&self, bounds: &Aabb) -> Vec<AxisOverrun> {
        let size = bounds.size();
        let limits = [self.x, self.y, self.z];
        let mut out = Vec::new();
        for (i, axis) in [Axis::X, Axis::Y, Axis::Z].into_iter().enumerate() {
            if size[i] > limits[i] {
                out.push(AxisOverrun {
                    axis,
                    extent: size[i],
                    limit: limits[i],
                });
            }
        }
        out
    }
}

impl Default for BuildVolume {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One of the three printer axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Width
    X,
    /// Depth
    Y,
    /// Height
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// How far one axis exceeds the build volume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisOverrun {
    /// Offending axis
    pub axis: Axis,
    /// Extent of the plate on that axis
    pub extent: f64,
    /// Build volume limit on that axis
    pub limit: f64,
}

impl AxisOverrun {
    /// Overrun amount in millimeters
    pub fn amount(&self) -> f64 {
        self.extent - self.limit
    }
}

impl fmt::Display for AxisOverrun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} extent exceeds build volume: {:.1}mm > {:.1}mm ({}-axis)",
            match self.axis {
                Axis::X => "Width",
                Axis::Y => "Depth",
                Axis::Z => "Height",
            },
            self.extent,
            self.limit,
            self.axis
        )
    }
}

/// Printer identity plus its build envelope
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterProfile {
    /// Human-readable printer name
    pub name: String,
    /// Build volume limits
    pub build_volume: BuildVolume,
}

impl Default for PrinterProfile {
    fn default() -> Self {
        PrinterProfile {
            name: "Generic 4-slot".to_string(),
            build_volume: BuildVolume::DEFAULT,
        }
    }
}

/// Version of the pinned external slicing engine
///
/// Rewrite rules are keyed to the version prefix they target so stale
/// workarounds are visible and removable when the pin moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineVersion(String);

impl EngineVersion {
    /// Wrap a version string such as `"2.2.4"`
    pub fn new(version: impl Into<String>) -> Self {
        EngineVersion(version.into())
    }

    /// The raw version string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a rule targeting `prefix` applies to this version
    ///
    /// Prefix match on dot boundaries: a rule for `"2.2"` applies to
    /// `2.2.4` but not to `2.20.0`. The empty prefix matches every version.
    pub fn matches(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        match self.0.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested logical slot -> physical tool mapping for one slice job
///
/// Created per slice request and discarded after the job completes. Drives
/// both the pre-slice metadata remap and the post-slice G-code remap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotMap {
    map: BTreeMap<u8, u8>,
}

impl SlotMap {
    /// Empty map (no remapping)
    pub fn new() -> Self {
        SlotMap::default()
    }

    /// Build from (logical, physical) pairs; both 0-based
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u8, u8)>) -> Self {
        SlotMap {
            map: pairs.into_iter().collect(),
        }
    }

    /// Map one logical slot to a physical tool
    pub fn insert(&mut self, logical: u8, physical: u8) {
        self.map.insert(logical, physical);
    }

    /// Physical tool for a logical slot, if mapped
    pub fn physical(&self, logical: u8) -> Option<u8> {
        self.map.get(&logical).copied()
    }

    /// Number of mapped slots
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no slots are mapped
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether the caller requested multi-tool output
    pub fn is_multi_tool(&self) -> bool {
        self.map.len() > 1
    }

    /// Whether every mapping is slot -> same slot
    pub fn is_identity(&self) -> bool {
        self.map.iter().all(|(l, p)| l == p)
    }

    /// Iterate (logical, physical) pairs in slot order
    pub fn iter(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.map.iter().map(|(l, p)| (*l, *p))
    }
}

/// Per-slot filament parameters for a slice request
#[derive(Debug, Clone, PartialEq)]
pub struct FilamentSlot {
    /// Material short name (e.g. `PLA`)
    pub material: String,
    /// Display color, `#RRGGBB`
    pub color: String,
    /// Nozzle temperature in degrees Celsius
    pub nozzle_temp: u32,
    /// Bed temperature in degrees Celsius
    pub bed_temp: u32,
}

impl Default for FilamentSlot {
    fn default() -> Self {
        FilamentSlot {
            material: "PLA".to_string(),
            color: "#FFFFFF".to_string(),
            nozzle_temp: 210,
            bed_temp: 60,
        }
    }
}

/// Caller-provided parameters for one slice job
#[derive(Debug, Clone, Default)]
pub struct SliceRequest {
    /// Filament loaded per logical slot, in slot order
    pub filaments: Vec<FilamentSlot>,
    /// Raw setting overrides merged last into the project settings
    pub overrides: serde_json::Map<String, serde_json::Value>,
    /// Requested logical -> physical slot mapping
    pub slot_map: SlotMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_prefix_matches_on_dot_boundaries() {
        let v = EngineVersion::new("2.2.4");
        assert!(v.matches("2.2"));
        assert!(v.matches("2.2.4"));
        assert!(v.matches(""));
        assert!(!v.matches("2.2.41"));
        assert!(!v.matches("2.3"));

        let v = EngineVersion::new("2.20.0");
        assert!(!v.matches("2.2"));
    }

    #[test]
    fn overruns_report_each_failing_axis() {
        let volume = BuildVolume::DEFAULT;
        let bounds = Aabb::new([0.0, 0.0, 0.0], [300.0, 100.0, 280.0]);
        let overruns = volume.overruns(&bounds);
        assert_eq!(overruns.len(), 2);
        assert_eq!(overruns[0].axis, Axis::X);
        assert!((overruns[0].amount() - 30.0).abs() < 1e-9);
        assert_eq!(overruns[1].axis, Axis::Z);
    }

    #[test]
    fn slot_map_identity_and_multi_tool() {
        let identity = SlotMap::from_pairs([(0, 0), (1, 1)]);
        assert!(identity.is_identity());
        assert!(identity.is_multi_tool());

        let remap = SlotMap::from_pairs([(0, 2), (1, 3)]);
        assert!(!remap.is_identity());
        assert_eq!(remap.physical(0), Some(2));
        assert_eq!(remap.physical(7), None);
    }
}
