//! Rewrite rule tables and the field-level helpers they share
//!
//! Every rule is data plus a small pure function over the settings map, so
//! each can be tested on its own and retired independently when the pinned
//! engine moves. Vendor configs encode numeric fields as either a scalar
//! string or a single-item list; helpers read either shape and write back
//! the shape they found.

use serde_json::{Map, Value};

/// Settings map type used throughout the sanitizer
pub type Settings = Map<String, Value>;

/// A numeric field clamped to a minimum the engine tolerates
#[derive(Debug, Clone, Copy)]
pub struct ClampRule {
    /// Settings key
    pub key: &'static str,
    /// Minimum value; the engine misbehaves below it
    pub minimum: i64,
}

/// Fields the engine rejects or mishandles when below their minimum
pub const CLAMP_RULES: &[ClampRule] = &[
    ClampRule { key: "raft_first_layer_expansion", minimum: 0 },
    ClampRule { key: "tree_support_wall_count", minimum: 0 },
    ClampRule { key: "prime_volume", minimum: 0 },
    ClampRule { key: "prime_tower_brim_width", minimum: 0 },
    ClampRule { key: "prime_tower_brim_chamfer", minimum: 0 },
    ClampRule { key: "prime_tower_brim_chamfer_max_width", minimum: 0 },
    ClampRule { key: "solid_infill_filament", minimum: 1 },
    ClampRule { key: "sparse_infill_filament", minimum: 1 },
    ClampRule { key: "wall_filament", minimum: 1 },
];

/// Vendor metadata entries dropped from the sanitized package
///
/// The filament sequence document in particular can crash the engine.
pub const STRIP_ENTRIES: &[&str] = &[
    "Metadata/slice_info.config",
    "Metadata/cut_information.xml",
    "Metadata/filament_sequence.json",
];

/// Entry-name prefixes of vendor preview images, dropped for size
pub const STRIP_PREFIXES: &[&str] = &["Metadata/plate", "Metadata/top", "Metadata/pick"];

/// Engine versions whose stale-plate-name segfault needs the identity scrub
pub const PLATER_NAME_SCRUB_VERSIONS: &[&str] = &["2.2"];

/// Prime tower geometry defaults used when the config omits them
pub const PRIME_TOWER_DEFAULT_WIDTH: f64 = 35.0;
/// Default prime tower brim width in millimeters
pub const PRIME_TOWER_DEFAULT_BRIM: f64 = 3.0;
/// Safety margin between tower brim edge and the bed edge
pub const WIPE_TOWER_EDGE_MARGIN: f64 = 6.0;
/// Floor on the tower half-span regardless of configured width
pub const WIPE_TOWER_MIN_HALF_SPAN: f64 = 12.0;

/// Per-slot list fields padded to the target slot count, with the default
/// used when the field is absent or empty
pub const SLOT_LIST_DEFAULTS: &[(&str, &str)] = &[
    ("filament_type", "PLA"),
    ("filament_colour", "#FFFFFF"),
    ("extruder_colour", "#FFFFFF"),
    ("default_filament_profile", "Generic PLA"),
    ("filament_settings_id", "Generic PLA"),
    ("nozzle_temperature", "210"),
    ("nozzle_temperature_initial_layer", "210"),
    ("bed_temperature", "60"),
    ("bed_temperature_initial_layer", "60"),
    ("cool_plate_temp", "60"),
    ("cool_plate_temp_initial_layer", "60"),
    ("textured_plate_temp", "60"),
    ("textured_plate_temp_initial_layer", "60"),
];

/// Whether an archive entry is removed by the strip table
pub fn is_stripped_entry(name: &str) -> bool {
    STRIP_ENTRIES.contains(&name) || STRIP_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Read a field as text, unwrapping a single-item list encoding
fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => items.first().and_then(field_text),
        _ => None,
    }
}

/// Write a field back in the shape it was read from
fn write_back(settings: &mut Settings, key: &str, original: &Value, text: String) {
    let new = if original.is_array() {
        Value::Array(vec![Value::String(text)])
    } else {
        Value::String(text)
    };
    settings.insert(key.to_string(), new);
}

/// Numeric value of a field, with a fallback for absent or unparseable
pub fn numeric_field(settings: &Settings, key: &str, fallback: f64) -> f64 {
    settings
        .get(key)
        .and_then(field_text)
        .and_then(|t| t.trim().parse::<f64>().ok())
        .unwrap_or(fallback)
}

/// Apply one clamp rule; absent fields are left absent
pub fn apply_clamp(settings: &mut Settings, rule: &ClampRule) {
    let Some(original) = settings.get(rule.key).cloned() else {
        return;
    };
    let numeric = field_text(&original)
        .and_then(|t| t.trim().parse::<f64>().ok())
        .map(|f| f as i64)
        .unwrap_or(rule.minimum);
    let clamped = numeric.max(rule.minimum);
    write_back(settings, rule.key, &original, clamped.to_string());
}

/// Apply every clamp rule
pub fn apply_clamps(settings: &mut Settings) {
    for rule in CLAMP_RULES {
        apply_clamp(settings, rule);
    }
}

/// Keep the wipe/prime tower safely inside bed bounds
///
/// Vendor configs can carry a low `wipe_tower_x` (15mm is common) that puts
/// a wide tower at or past the printable edge.
pub fn reposition_wipe_tower(settings: &mut Settings, bed_size_mm: f64) {
    let width = numeric_field(settings, "prime_tower_width", PRIME_TOWER_DEFAULT_WIDTH);
    let brim = numeric_field(settings, "prime_tower_brim_width", PRIME_TOWER_DEFAULT_BRIM).max(0.0);
    let half_span = (width / 2.0 + brim + WIPE_TOWER_EDGE_MARGIN).max(WIPE_TOWER_MIN_HALF_SPAN);
    let min_pos = half_span;
    let max_pos = (bed_size_mm - half_span).max(min_pos);

    for key in ["wipe_tower_x", "wipe_tower_y"] {
        let Some(original) = settings.get(key).cloned() else {
            continue;
        };
        let Some(numeric) = field_text(&original).and_then(|t| t.trim().parse::<f64>().ok())
        else {
            continue;
        };
        let clamped = numeric.clamp(min_pos, max_pos);
        write_back(settings, key, &original, format!("{clamped:.3}"));
    }
}

/// Coerce a field to a list, treating absent and null as empty
pub fn ensure_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other.clone()],
    }
}

/// Pad a list to the target length by repeating its last element
pub fn pad_list(mut values: Vec<Value>, target_len: usize, default_value: &str) -> Vec<Value> {
    if values.is_empty() {
        values.push(Value::String(default_value.to_string()));
    }
    while values.len() < target_len {
        let last = values.last().cloned().unwrap_or(Value::Null);
        values.push(last);
    }
    values
}
