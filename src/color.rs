//! Color and extruder assignment detection
//!
//! Packages routinely declare a larger filament palette than the geometry
//! actually uses: authoring tools pad the palette with default slots. "Every
//! color mentioned anywhere" therefore overestimates, and the detector walks
//! the assignment records first, falling back through progressively weaker
//! signals. Only colors bound to geometry are reported active.

use crate::error::{AssignmentError, ContainerError, Error};
use crate::package::{ModelPackage, CUSTOM_GCODE_PATH, FILAMENT_SEQUENCE_PATH};
use crate::profile::MAX_SLOTS;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use tracing::{debug, info};

/// How a color ended up in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Bound to geometry through an assignment record or paint data
    Assigned,
    /// Declared in the palette but never bound to geometry
    PaletteOnly,
}

/// One color with its logical slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColorAssignment {
    /// Normalized `#RRGGBB` value
    pub color: String,
    /// 0-based logical slot (palette index), when known
    pub slot: Option<u8>,
    /// How this color was detected
    pub provenance: Provenance,
}

/// Detection result for one package
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColorReport {
    /// Colors actually bound to geometry, in slot order
    pub active: Vec<ColorAssignment>,
    /// Full declared palette, normalized, order preserved
    pub palette: Vec<String>,
    /// Extruder slots (1-based) assigned at object or part level
    pub assigned_slots: Vec<u8>,
    /// Whether the package is a painted single-extruder-multi-material file
    pub single_extruder_multi_material: bool,
    /// Whether mid-print tool changes are recorded per layer
    pub layer_tool_changes: bool,
}

impl ColorReport {
    /// Whether a multi-material slice is required
    pub fn is_multi_material(&self) -> bool {
        self.active.len() > 1
    }

    /// Number of extruder slots the package needs
    pub fn required_slots(&self) -> usize {
        self.active.len().max(1)
    }
}

/// Detect active colors and extruder assignments for a package
///
/// More active colors than the hardware has slots is an overflow error, not
/// a truncation: the caller decides whether to fall back to a
/// single-material slice.
pub fn detect_colors(package: &ModelPackage) -> Result<ColorReport, Error> {
    let settings = package.model_settings()?;
    let assigned_slots: Vec<u8> = settings
        .as_ref()
        .map(|s| s.assigned_extruders().into_iter().collect())
        .unwrap_or_default();

    let project = package.project_settings()?;
    let palette = project
        .as_ref()
        .map(|p| string_list(p, "filament_colour"))
        .unwrap_or_default();
    let semm = project
        .as_ref()
        .and_then(|p| p.get("single_extruder_multi_material"))
        .map(|v| scalar_string(v) == "1")
        .unwrap_or(false);
    let layer_tool_changes = has_layer_tool_changes(package)?;

    let mut report = ColorReport {
        active: Vec::new(),
        palette: palette.clone(),
        assigned_slots: assigned_slots.clone(),
        single_extruder_multi_material: semm,
        layer_tool_changes,
    };

    // Painted files bind the whole palette through per-triangle paint data,
    // and per-layer tool changes do the same through the layer records;
    // neither leaves object-level assignment crumbs for every color.
    if (semm || layer_tool_changes) && palette.len() > 1 {
        for (index, color) in palette.iter().enumerate() {
            report.active.push(ColorAssignment {
                color: color.clone(),
                slot: u8::try_from(index).ok(),
                provenance: Provenance::Assigned,
            });
        }
        debug!(
            colors = report.active.len(),
            semm, layer_tool_changes, "whole palette active (painted or layer-switched file)"
        );
        return finish(report);
    }

    // Strongest signal: object/part assignment records intersected with the
    // declared palette.
    if !assigned_slots.is_empty() && !palette.is_empty() {
        for &slot in &assigned_slots {
            let index = (slot as usize).saturating_sub(1);
            if let Some(color) = palette.get(index) {
                if !report.active.iter().any(|a| a.color == *color) {
                    report.active.push(ColorAssignment {
                        color: color.clone(),
                        slot: u8::try_from(index).ok(),
                        provenance: Provenance::Assigned,
                    });
                }
            }
        }
        if !report.active.is_empty() {
            return finish(report);
        }
    }

    // Vendor fallback: the filament sequence document names the colors the
    // authoring tool planned to load.
    let sequence_colors = filament_sequence_colors(package)?;
    if !sequence_colors.is_empty() {
        for color in sequence_colors {
            if !report.active.iter().any(|a| a.color == color) {
                report.active.push(ColorAssignment {
                    color,
                    slot: None,
                    provenance: Provenance::Assigned,
                });
            }
        }
        return finish(report);
    }

    // Nothing bound the palette to geometry: report the palette entries as
    // declared-but-unused so callers can still show them.
    if let Some(project) = project.as_ref() {
        for key in ["extruder_colour", "filament_colour"] {
            for color in string_list(project, key) {
                if !report.palette.contains(&color) {
                    report.palette.push(color);
                }
            }
        }
    }
    if let Some(first) = report.palette.first() {
        report.active.push(ColorAssignment {
            color: first.clone(),
            slot: Some(0),
            provenance: Provenance::PaletteOnly,
        });
    }
    finish(report)
}

fn finish(report: ColorReport) -> Result<ColorReport, Error> {
    let assigned = report
        .active
        .iter()
        .filter(|a| a.provenance == Provenance::Assigned)
        .count();
    if assigned > MAX_SLOTS {
        return Err(AssignmentError::Overflow {
            active: assigned,
            slots: MAX_SLOTS,
        }
        .into());
    }
    info!(
        active = report.active.len(),
        palette = report.palette.len(),
        multi_material = report.is_multi_material(),
        "color detection complete"
    );
    Ok(report)
}

/// Whether the per-layer custom G-code document records tool changes
///
/// The vendor's multi-as-single mode stores mid-print filament swaps as
/// `type="2"` layer entries; their presence forces multi-material handling
/// even when object-level assignments all point at slot 1.
pub fn has_layer_tool_changes(package: &ModelPackage) -> Result<bool, ContainerError> {
    let Some(bytes) = package.entry(CUSTOM_GCODE_PATH) else {
        return Ok(false);
    };
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::with_capacity(1024);
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ContainerError::MalformedXml {
                file: CUSTOM_GCODE_PATH.to_string(),
                message: e.to_string(),
            })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                if e.local_name().as_ref() == b"layer" {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"type"
                            && attr.value.as_ref() == b"2"
                        {
                            return Ok(true);
                        }
                    }
                }
            }
            Event::Eof => return Ok(false),
            _ => {}
        }
        buf.clear();
    }
}

/// Colors listed in the vendor filament sequence document
fn filament_sequence_colors(package: &ModelPackage) -> Result<Vec<String>, ContainerError> {
    let Some(bytes) = package.entry(FILAMENT_SEQUENCE_PATH) else {
        return Ok(Vec::new());
    };
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ContainerError::MalformedJson {
            file: FILAMENT_SEQUENCE_PATH.to_string(),
            message: e.to_string(),
        })?;

    let mut colors = Vec::new();
    let mut push = |raw: &str| {
        let color = normalize_color(raw);
        if !color.is_empty() && !colors.contains(&color) {
            colors.push(color);
        }
    };

    if let Some(info) = value.get("filament_info").and_then(|v| v.as_array()) {
        for filament in info {
            if let Some(color) = filament.get("color").and_then(|c| c.as_str()) {
                push(color);
            }
        }
    }
    if let Some(map) = value.as_object() {
        for plate in map.values() {
            if let Some(sequence) = plate.get("sequence").and_then(|v| v.as_array()) {
                for filament in sequence {
                    if let Some(color) = filament.get("color").and_then(|c| c.as_str()) {
                        push(color);
                    }
                }
            }
        }
    }
    Ok(colors)
}

fn normalize_color(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('#') {
        trimmed.to_string()
    } else {
        format!("#{trimmed}")
    }
}

fn scalar_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .first()
            .map(scalar_string)
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

fn string_list(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(normalize_color)
            .filter(|c| !c.is_empty())
            .collect(),
        Some(serde_json::Value::String(s)) => {
            let color = normalize_color(s);
            if color.is_empty() {
                Vec::new()
            } else {
                vec![color]
            }
        }
        _ => Vec::new(),
    }
}
