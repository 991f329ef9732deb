//! G-code metadata extraction and post-processing
//!
//! Engine output files run into tens of megabytes, so everything here
//! streams: the summary pass reads the text once, and the layer reader
//! serves paged windows instead of materializing the whole file.

mod layers;
mod remap;

pub use layers::{Layer, LayerPage, LayerReader, Move, MoveKind};
pub use remap::remap_gcode;

use crate::transform::Aabb;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// Layer-change comment spellings emitted by known engine versions
///
/// Different engine versions write different markers; a file has zero
/// layers only when none of these appears anywhere.
pub const LAYER_MARKERS: &[&str] = &[";LAYER_CHANGE", "; CHANGE_LAYER", ";LAYER:"];

/// Whether a line is a layer-change marker in any known spelling
pub fn is_layer_marker(line: &str) -> bool {
    let trimmed = line.trim_end();
    LAYER_MARKERS.iter().any(|m| trimmed.starts_with(m))
}

/// One recorded tool selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToolChange {
    /// Selected tool index (0-based)
    pub tool: u8,
    /// Layer the selection occurred in (0-based)
    pub layer: usize,
}

/// Metadata extracted from one G-code document in a single pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GcodeSummary {
    /// Total layer count (header comment preferred, marker count fallback)
    pub layer_count: usize,
    /// Z height at the start of each layer, in layer order
    pub layer_heights: Vec<f64>,
    /// Running min/max per axis over every coordinate-bearing G0/G1 move
    pub bounds: Aabb,
    /// Tool selections in document order
    pub tool_changes: Vec<ToolChange>,
    /// Estimated print time in seconds (0 when no estimate comment exists)
    pub estimated_time_seconds: u64,
    /// Filament length in millimeters (0.0 when absent)
    pub filament_used_mm: f64,
    /// Filament weight in grams (0.0 when absent)
    pub filament_used_g: f64,
}

impl GcodeSummary {
    /// Stream a G-code document and extract its metadata
    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut state = MotionState::default();
        let mut header_layers: Option<usize> = None;
        let mut marker_count = 0usize;
        let mut pending_layer_z = false;
        let mut layer_heights = Vec::new();
        let mut bounds = Aabb::EMPTY;
        let mut tool_changes = Vec::new();
        let mut time_seconds: Option<u64> = None;
        let mut legacy_time_seconds: Option<u64> = None;
        let mut filament_mm: Option<f64> = None;
        let mut filament_g: Option<f64> = None;
        let mut legacy_filament_m: Option<f64> = None;

        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if is_layer_marker(trimmed) {
                marker_count += 1;
                pending_layer_z = true;
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix(';') {
                parse_comment(
                    rest,
                    &mut header_layers,
                    &mut time_seconds,
                    &mut legacy_time_seconds,
                    &mut filament_mm,
                    &mut filament_g,
                    &mut legacy_filament_m,
                );
                continue;
            }

            let code = strip_inline_comment(trimmed);
            if code.is_empty() {
                continue;
            }

            if let Some(tool) = parse_tool_select(code) {
                tool_changes.push(ToolChange {
                    tool,
                    layer: marker_count.saturating_sub(1),
                });
                continue;
            }

            if let Some(moved) = state.apply(code) {
                if moved.has_z && pending_layer_z {
                    layer_heights.push(state.z);
                    pending_layer_z = false;
                }
                // Each axis updates only when the command names it: a Z-only
                // hop at the parked position leaves the X/Y bounds alone.
                let position = [state.x, state.y, state.z];
                for (i, named) in [moved.has_x, moved.has_y, moved.has_z]
                    .into_iter()
                    .enumerate()
                {
                    if named {
                        bounds.min[i] = bounds.min[i].min(position[i]);
                        bounds.max[i] = bounds.max[i].max(position[i]);
                    }
                }
            }
        }

        let layer_count = match header_layers {
            Some(n) if n > 0 => n,
            _ => marker_count,
        };

        let summary = GcodeSummary {
            layer_count,
            layer_heights,
            bounds,
            tool_changes,
            estimated_time_seconds: time_seconds.or(legacy_time_seconds).unwrap_or(0),
            filament_used_mm: filament_mm
                .or(legacy_filament_m.map(|m| m * 1000.0))
                .unwrap_or(0.0),
            filament_used_g: filament_g.unwrap_or(0.0),
        };
        info!(
            layers = summary.layer_count,
            tools = summary.distinct_tools().len(),
            est_seconds = summary.estimated_time_seconds,
            "parsed gcode summary"
        );
        Ok(summary)
    }

    /// Parse a G-code file from disk
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_reader(BufReader::new(std::fs::File::open(path)?))
    }

    /// Distinct tools selected anywhere in the document
    pub fn distinct_tools(&self) -> BTreeSet<u8> {
        self.tool_changes.iter().map(|t| t.tool).collect()
    }
}

/// Trailing comment-block parsing, newest format first
fn parse_comment(
    rest: &str,
    header_layers: &mut Option<usize>,
    time_seconds: &mut Option<u64>,
    legacy_time_seconds: &mut Option<u64>,
    filament_mm: &mut Option<f64>,
    filament_g: &mut Option<f64>,
    legacy_filament_m: &mut Option<f64>,
) {
    let lower = rest.to_ascii_lowercase();

    if header_layers.is_none() && lower.contains("total layer number") {
        if let Some(value) = rest.split(':').nth(1) {
            *header_layers = value.trim().parse().ok();
        }
        return;
    }

    if time_seconds.is_none()
        && lower.contains("estimated printing time")
        && lower.contains("normal mode")
    {
        if let Some(value) = rest.split('=').nth(1) {
            *time_seconds = Some(parse_duration(value));
        }
        return;
    }
    if legacy_time_seconds.is_none() {
        if let Some(value) = rest.trim_start().strip_prefix("TIME:") {
            *legacy_time_seconds = value.trim().parse().ok();
            return;
        }
    }

    if lower.contains("filament used") {
        if filament_mm.is_none() && lower.contains("[mm]") {
            *filament_mm = first_number_after_equals(rest);
            return;
        }
        if filament_g.is_none() && lower.contains("[g]") {
            *filament_g = first_number_after_equals(rest);
            return;
        }
        // Legacy spelling: "Filament used: 1.23m".
        if legacy_filament_m.is_none() {
            if let Some(value) = rest.split(':').nth(1) {
                let trimmed = value.trim().trim_end_matches('m');
                *legacy_filament_m = trimmed.trim().parse().ok();
            }
        }
    }
}

/// Parse `1h 23m 45s` style durations to seconds; missing units are zero
fn parse_duration(text: &str) -> u64 {
    let mut total = 0u64;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            if !digits.is_empty() {
                let value: u64 = digits.parse().unwrap_or(0);
                match c {
                    'h' => total += value * 3600,
                    'm' => total += value * 60,
                    's' => total += value,
                    _ => {}
                }
            }
            digits.clear();
        }
    }
    total
}

fn first_number_after_equals(text: &str) -> Option<f64> {
    let value = text.split('=').nth(1)?;
    let token: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    token.parse().ok()
}

/// Standalone tool-select line (`T0`, `T3`)
pub(crate) fn parse_tool_select(code: &str) -> Option<u8> {
    let rest = code.strip_prefix('T')?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

pub(crate) fn strip_inline_comment(line: &str) -> &str {
    match line.find(';') {
        Some(index) => line[..index].trim(),
        None => line.trim(),
    }
}

/// One processed move
pub(crate) struct AppliedMove {
    pub has_x: bool,
    pub has_y: bool,
    pub has_z: bool,
    pub extruding: bool,
    pub from: [f64; 2],
}

/// Tracks position and addressing modes across a G-code stream
///
/// Handles G90/G91 positioning, M82/M83 extrusion addressing, and G92
/// resets; extrusion is recognized by an increasing E value.
#[derive(Debug, Clone)]
pub(crate) struct MotionState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
    absolute_position: bool,
    absolute_extrusion: bool,
}

impl Default for MotionState {
    fn default() -> Self {
        MotionState {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            e: 0.0,
            absolute_position: true,
            absolute_extrusion: false,
        }
    }
}

impl MotionState {
    /// Apply one command line (comments already stripped); returns move
    /// details for G0/G1
    pub fn apply(&mut self, code: &str) -> Option<AppliedMove> {
        if code.starts_with("G90") {
            self.absolute_position = true;
            return None;
        }
        if code.starts_with("G91") {
            self.absolute_position = false;
            return None;
        }
        if code.starts_with("M82") {
            self.absolute_extrusion = true;
            return None;
        }
        if code.starts_with("M83") {
            self.absolute_extrusion = false;
            return None;
        }
        if code.starts_with("G92") {
            for (axis, value) in coordinate_words(code) {
                match axis {
                    'X' => self.x = value,
                    'Y' => self.y = value,
                    'Z' => self.z = value,
                    'E' => self.e = value,
                    _ => {}
                }
            }
            return None;
        }

        let is_move = code.starts_with("G0 ")
            || code.starts_with("G1 ")
            || code == "G0"
            || code == "G1";
        if !is_move {
            return None;
        }

        let from = [self.x, self.y];
        let prev_e = self.e;
        let mut has_x = false;
        let mut has_y = false;
        let mut has_z = false;
        for (axis, value) in coordinate_words(code) {
            match axis {
                'X' => {
                    self.x = if self.absolute_position { value } else { self.x + value };
                    has_x = true;
                }
                'Y' => {
                    self.y = if self.absolute_position { value } else { self.y + value };
                    has_y = true;
                }
                'Z' => {
                    self.z = if self.absolute_position { value } else { self.z + value };
                    has_z = true;
                }
                'E' => {
                    self.e = if self.absolute_extrusion { value } else { self.e + value };
                }
                _ => {}
            }
        }

        Some(AppliedMove {
            has_x,
            has_y,
            has_z,
            extruding: self.e > prev_e,
            from,
        })
    }
}

fn coordinate_words(code: &str) -> impl Iterator<Item = (char, f64)> + '_ {
    code.split_whitespace().skip(1).filter_map(|word| {
        let mut chars = word.chars();
        let axis = chars.next()?.to_ascii_uppercase();
        let value: f64 = chars.as_str().parse().ok()?;
        Some((axis, value))
    })
}
