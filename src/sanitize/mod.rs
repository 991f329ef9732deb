//! Profile sanitization for the pinned external slicing engine
//!
//! The engine is a black box pinned at a known version, and a family of its
//! input quirks is worked around here: settings below tolerated minimums,
//! vendor metadata documents it chokes on, prime towers placed off the bed,
//! and stale plate names that segfault it. Each workaround is a table entry
//! in [`rules`], keyed to the engine version it targets, so the library of
//! rewrites shrinks when the pin moves.
//!
//! The source package is never mutated; sanitization derives a new package.

pub mod rules;

use crate::color::has_layer_tool_changes;
use crate::error::{ContainerError, Error, SanitizeError};
use crate::package::{
    Dialect, ModelPackage, MODEL_SETTINGS_PATH, PROJECT_SETTINGS_PATH,
};
use crate::profile::{BuildVolume, EngineVersion, SliceRequest, SlotMap, MAX_SLOTS};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::{debug, info};

/// Result of sanitizing a package for one slice request
#[derive(Debug, Clone)]
pub struct SanitizedPackage {
    /// The derived package, safe to hand to the engine
    pub package: ModelPackage,
    /// Whether the caller should route this package through an external
    /// geometry rebuild before slicing
    ///
    /// Set for vendor-dialect packages with neither multi-extruder
    /// assignments nor layer tool changes: those carry no metadata a rebuild
    /// would destroy, and rebuilding sheds the vendor quirks wholesale.
    /// Packages whose assignments a rebuild would destroy are preserved.
    pub needs_mesh_rebuild: bool,
    /// Extruder slot count the padded per-slot lists were sized to
    pub target_slots: usize,
}

/// Applies the rewrite rule library for a pinned engine version
#[derive(Debug, Clone)]
pub struct Sanitizer {
    version: EngineVersion,
    volume: BuildVolume,
}

impl Sanitizer {
    /// Sanitizer for a pinned engine version with the default build volume
    pub fn new(version: EngineVersion) -> Self {
        Sanitizer {
            version,
            volume: BuildVolume::DEFAULT,
        }
    }

    /// Override the bed size used for prime tower repositioning
    pub fn with_build_volume(mut self, volume: BuildVolume) -> Self {
        self.volume = volume;
        self
    }

    /// Derive a sanitized package for one slice request
    ///
    /// Rules whose prerequisite metadata document is missing are skipped.
    /// Running the sanitizer on its own output with the same request (and no
    /// slot remap) changes nothing.
    pub fn sanitize(
        &self,
        source: &ModelPackage,
        request: &SliceRequest,
    ) -> Result<SanitizedPackage, Error> {
        let model_settings = source.model_settings()?;
        let has_multi_assignments = model_settings
            .as_ref()
            .map(|s| s.has_multi_extruder_assignments())
            .unwrap_or(false);
        let layer_tool_changes = has_layer_tool_changes(source)?;
        let needs_mesh_rebuild = source.dialect() == Dialect::BambuStudio
            && !has_multi_assignments
            && !layer_tool_changes;

        let assigned_max = model_settings
            .as_ref()
            .and_then(|s| s.assigned_extruders().into_iter().max())
            .unwrap_or(1) as usize;
        let target_slots = assigned_max.max(request.filaments.len()).max(1);

        let config = self.build_settings(source, request, target_slots)?;
        let settings_bytes = serde_json::to_vec_pretty(&Value::Object(config))
            .map_err(|e| SanitizeError::Settings(e.to_string()))?;

        let mut entries = BTreeMap::new();
        for (name, data) in source.entries() {
            if name == PROJECT_SETTINGS_PATH || rules::is_stripped_entry(name) {
                debug!(entry = %name, "stripping vendor entry");
                continue;
            }
            let data = if name == MODEL_SETTINGS_PATH {
                self.scrub_model_settings(data, &request.slot_map)?
            } else {
                data.clone()
            };
            entries.insert(name.clone(), data);
        }
        entries.insert(PROJECT_SETTINGS_PATH.to_string(), settings_bytes);

        let package = ModelPackage::from_entries(entries)
            .map_err(|e| SanitizeError::Repack(e.to_string()))?;

        info!(
            engine = %self.version,
            target_slots,
            needs_mesh_rebuild,
            has_multi_assignments,
            layer_tool_changes,
            "sanitized package"
        );

        Ok(SanitizedPackage {
            package,
            needs_mesh_rebuild,
            target_slots,
        })
    }

    /// Build the merged, clamped project settings map
    fn build_settings(
        &self,
        source: &ModelPackage,
        request: &SliceRequest,
        target_slots: usize,
    ) -> Result<Map<String, Value>, Error> {
        let mut config = source.project_settings()?.unwrap_or_default();

        if !request.filaments.is_empty() {
            let column = |f: fn(&crate::profile::FilamentSlot) -> String| -> Value {
                Value::Array(
                    request
                        .filaments
                        .iter()
                        .map(|slot| Value::String(f(slot)))
                        .collect(),
                )
            };
            config.insert("filament_type".into(), column(|s| s.material.clone()));
            config.insert("filament_colour".into(), column(|s| s.color.clone()));
            config.insert(
                "nozzle_temperature".into(),
                column(|s| s.nozzle_temp.to_string()),
            );
            config.insert(
                "nozzle_temperature_initial_layer".into(),
                column(|s| s.nozzle_temp.to_string()),
            );
            config.insert(
                "bed_temperature".into(),
                column(|s| s.bed_temp.to_string()),
            );
            config.insert(
                "bed_temperature_initial_layer".into(),
                column(|s| s.bed_temp.to_string()),
            );
        }

        // Caller overrides win over everything from the package.
        for (key, value) in &request.overrides {
            config.insert(key.clone(), value.clone());
        }

        // Relative extruder addressing per layer, and arc fitting to keep
        // output size down.
        config
            .entry("layer_gcode".to_string())
            .or_insert_with(|| Value::String("G92 E0".into()));
        config
            .entry("enable_arc_fitting".to_string())
            .or_insert_with(|| Value::String("1".into()));
        // Slices target explicit extruder slots, not single-nozzle MMU
        // swaps; leaving this on inflates toolchange moves and estimates.
        config.insert(
            "single_extruder_multi_material".to_string(),
            Value::String("0".into()),
        );

        rules::apply_clamps(&mut config);
        rules::reposition_wipe_tower(&mut config, self.volume.x);

        for (key, default_value) in rules::SLOT_LIST_DEFAULTS {
            let values = rules::ensure_list(config.get(*key));
            config.insert(
                (*key).to_string(),
                Value::Array(rules::pad_list(values, target_slots, default_value)),
            );
        }

        let mut single = rules::ensure_list(config.get("bed_temperature_initial_layer_single"));
        if single.is_empty() {
            single = rules::ensure_list(config.get("bed_temperature_initial_layer"))
                .into_iter()
                .take(1)
                .collect();
        }
        config.insert(
            "bed_temperature_initial_layer_single".to_string(),
            Value::Array(single),
        );

        Ok(config)
    }

    /// Rewrite the vendor settings document: clear stale plate names for
    /// affected engine versions and apply the requested slot remap to
    /// per-object extruder metadata
    fn scrub_model_settings(
        &self,
        bytes: &[u8],
        slot_map: &SlotMap,
    ) -> Result<Vec<u8>, ContainerError> {
        let scrub_names = rules::PLATER_NAME_SCRUB_VERSIONS
            .iter()
            .any(|prefix| self.version.matches(prefix));

        let malformed = |message: String| ContainerError::MalformedXml {
            file: MODEL_SETTINGS_PATH.to_string(),
            message,
        };

        let mut reader = Reader::from_reader(bytes);
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let mut buf = Vec::with_capacity(4096);

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| malformed(e.to_string()))?;
            let rewritten = match &event {
                Event::Start(e) | Event::Empty(e)
                    if e.local_name().as_ref() == b"metadata" =>
                {
                    rewrite_metadata(e, scrub_names, slot_map)
                        .map_err(|m| malformed(m))?
                }
                Event::Eof => break,
                _ => None,
            };
            match rewritten {
                Some(elem) => {
                    let out = if matches!(event, Event::Empty(_)) {
                        Event::Empty(elem)
                    } else {
                        Event::Start(elem)
                    };
                    writer.write_event(out).map_err(|e| malformed(e.to_string()))?;
                }
                None => {
                    writer
                        .write_event(event)
                        .map_err(|e| malformed(e.to_string()))?;
                }
            }
            buf.clear();
        }

        Ok(writer.into_inner().into_inner())
    }
}

/// Rewrite one metadata element if a rule applies, preserving attribute
/// order; `None` means copy the original through
fn rewrite_metadata(
    e: &BytesStart<'_>,
    scrub_names: bool,
    slot_map: &SlotMap,
) -> Result<Option<BytesStart<'static>>, String> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut key = String::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| err.to_string())?
            .into_owned();
        if attr.key.local_name().as_ref() == b"key" {
            key = value.clone();
        }
        attrs.push((name, value));
    }

    let mut changed = false;
    for (name, value) in attrs.iter_mut() {
        if name != "value" {
            continue;
        }
        if scrub_names && key == "plater_name" && !value.is_empty() {
            value.clear();
            changed = true;
        } else if key == "extruder" && !slot_map.is_empty() {
            if let Ok(source_slot) = value.trim().parse::<u8>() {
                if source_slot >= 1 {
                    if let Some(physical) = slot_map.physical(source_slot - 1) {
                        let target_slot = physical + 1;
                        if (1..=MAX_SLOTS as u8).contains(&target_slot)
                            && target_slot != source_slot
                        {
                            *value = target_slot.to_string();
                            changed = true;
                        }
                    }
                }
            }
        }
    }

    if !changed {
        return Ok(None);
    }

    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut elem = BytesStart::new(name);
    for (name, value) in &attrs {
        elem.push_attribute((name.as_str(), value.as_str()));
    }
    Ok(Some(elem.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{ModelSettings, MODEL_PATH, SLICE_INFO_PATH};
    use crate::profile::FilamentSlot;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    const MODEL: &str = r#"<model><resources>
        <object id="1"><mesh><vertices>
            <vertex x="0" y="0" z="0"/><vertex x="10" y="10" z="10"/>
        </vertices><triangles><triangle v1="0" v2="1" v3="0"/></triangles></mesh></object>
    </resources><build><item objectid="1"/></build></model>"#;

    const MODEL_SETTINGS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<config>
  <object id="1">
    <metadata key="name" value="Widget"/>
    <metadata key="extruder" value="2"/>
  </object>
  <plate>
    <metadata key="plater_id" value="1"/>
    <metadata key="plater_name" value="Stale name"/>
  </plate>
</config>"#;

    fn bambu_package(project_settings: &str) -> ModelPackage {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in [
            (MODEL_PATH, MODEL),
            (MODEL_SETTINGS_PATH, MODEL_SETTINGS),
            (PROJECT_SETTINGS_PATH, project_settings),
            (SLICE_INFO_PATH, "<config/>"),
            ("Metadata/plate_1.png", "png"),
            ("Metadata/top_1.png", "png"),
        ] {
            zip.start_file(name, options).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        ModelPackage::from_bytes(&zip.finish().unwrap().into_inner()).unwrap()
    }

    fn project_json() -> &'static str {
        r##"{
            "filament_colour": ["#FF0000", "#00FF00"],
            "raft_first_layer_expansion": "-2",
            "wall_filament": "0",
            "wipe_tower_x": "15",
            "prime_tower_width": "35",
            "prime_tower_brim_width": "3",
            "time_estimate": "unknown-shape"
        }"##
    }

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(EngineVersion::new("2.2.4"))
    }

    #[test]
    fn strips_vendor_metadata_and_previews() {
        let out = sanitizer()
            .sanitize(&bambu_package(project_json()), &SliceRequest::default())
            .unwrap();
        assert!(!out.package.has_entry(SLICE_INFO_PATH));
        assert!(!out.package.has_entry("Metadata/plate_1.png"));
        assert!(!out.package.has_entry("Metadata/top_1.png"));
        assert!(out.package.has_entry(MODEL_PATH));
        assert!(out.package.has_entry(MODEL_SETTINGS_PATH));
    }

    #[test]
    fn clamps_and_repositions_while_passing_unknown_fields_through() {
        let out = sanitizer()
            .sanitize(&bambu_package(project_json()), &SliceRequest::default())
            .unwrap();
        let settings = out.package.project_settings().unwrap().unwrap();
        assert_eq!(settings["raft_first_layer_expansion"], serde_json::json!("0"));
        assert_eq!(settings["wall_filament"], serde_json::json!("1"));
        assert_eq!(settings["wipe_tower_x"], serde_json::json!("26.500"));
        assert_eq!(settings["time_estimate"], serde_json::json!("unknown-shape"));
        assert_eq!(
            settings["single_extruder_multi_material"],
            serde_json::json!("0")
        );
        assert_eq!(settings["layer_gcode"], serde_json::json!("G92 E0"));
    }

    #[test]
    fn plater_name_cleared_for_affected_engine_only() {
        let pkg = bambu_package(project_json());

        let out = sanitizer().sanitize(&pkg, &SliceRequest::default()).unwrap();
        let scrubbed = out.package.model_settings().unwrap().unwrap();
        assert_eq!(scrubbed.plates[0].name, None);
        // The rest of the document is untouched.
        assert_eq!(scrubbed.object(1).unwrap().name.as_deref(), Some("Widget"));

        let newer = Sanitizer::new(EngineVersion::new("2.3.0"));
        let out = newer.sanitize(&pkg, &SliceRequest::default()).unwrap();
        let kept = out.package.model_settings().unwrap().unwrap();
        assert_eq!(kept.plates[0].name.as_deref(), Some("Stale name"));
    }

    #[test]
    fn slot_remap_rewrites_extruder_metadata() {
        let request = SliceRequest {
            slot_map: SlotMap::from_pairs([(0, 2), (1, 3)]),
            ..SliceRequest::default()
        };
        let out = sanitizer()
            .sanitize(&bambu_package(project_json()), &request)
            .unwrap();
        let settings = out.package.model_settings().unwrap().unwrap();
        // Object was on slot 2 (logical index 1), remapped to physical 3,
        // stored 1-based as 4.
        assert_eq!(settings.object(1).unwrap().extruder, Some(4));
    }

    #[test]
    fn slot_lists_padded_to_the_assigned_slot_count() {
        let request = SliceRequest {
            filaments: vec![FilamentSlot::default()],
            ..SliceRequest::default()
        };
        let out = sanitizer()
            .sanitize(&bambu_package(project_json()), &request)
            .unwrap();
        // Highest assigned extruder is 2, so lists are two wide.
        assert_eq!(out.target_slots, 2);
        let settings = out.package.project_settings().unwrap().unwrap();
        assert_eq!(
            settings["nozzle_temperature"],
            serde_json::json!(["210", "210"])
        );
        assert_eq!(
            settings["bed_temperature_initial_layer_single"],
            serde_json::json!(["60"])
        );
    }

    #[test]
    fn sanitizing_its_own_output_changes_nothing() {
        let request = SliceRequest::default();
        let first = sanitizer()
            .sanitize(&bambu_package(project_json()), &request)
            .unwrap();
        let second = sanitizer().sanitize(&first.package, &request).unwrap();
        assert_eq!(first.package.entries(), second.package.entries());
    }

    #[test]
    fn rebuild_flag_set_only_without_preservable_metadata() {
        // Assignments on slot 2 must be preserved.
        let out = sanitizer()
            .sanitize(&bambu_package(project_json()), &SliceRequest::default())
            .unwrap();
        assert!(!out.needs_mesh_rebuild);

        // Same package with all assignments on slot 1 can be rebuilt.
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in [
            (MODEL_PATH, MODEL),
            (
                MODEL_SETTINGS_PATH,
                r#"<config><object id="1"><metadata key="extruder" value="1"/></object></config>"#,
            ),
            (SLICE_INFO_PATH, "<config/>"),
        ] {
            zip.start_file(name, options).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        let plain = ModelPackage::from_bytes(&zip.finish().unwrap().into_inner()).unwrap();
        let out = sanitizer().sanitize(&plain, &SliceRequest::default()).unwrap();
        assert!(out.needs_mesh_rebuild);
    }

    #[test]
    fn missing_metadata_documents_skip_their_rules() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file(MODEL_PATH, SimpleFileOptions::default()).unwrap();
        zip.write_all(MODEL.as_bytes()).unwrap();
        let bare = ModelPackage::from_bytes(&zip.finish().unwrap().into_inner()).unwrap();

        let out = sanitizer().sanitize(&bare, &SliceRequest::default()).unwrap();
        // New project settings are still injected.
        let settings = out.package.project_settings().unwrap().unwrap();
        assert_eq!(settings["layer_gcode"], serde_json::json!("G92 E0"));
        assert!(!out.package.has_entry(MODEL_SETTINGS_PATH));
    }

    #[test]
    fn scrubbed_settings_still_parse_as_vendor_settings() {
        let out = sanitizer()
            .sanitize(&bambu_package(project_json()), &SliceRequest::default())
            .unwrap();
        let bytes = out.package.entry(MODEL_SETTINGS_PATH).unwrap();
        ModelSettings::parse(MODEL_SETTINGS_PATH, bytes).unwrap();
    }
}
