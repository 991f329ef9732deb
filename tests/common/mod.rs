//! Shared package construction helpers for the integration tests

use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Archive the given entries as ZIP bytes
pub fn zip_entries(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Resource XML for a cuboid mesh spanning the origin to (sx, sy, sz)
pub fn cube_object(id: usize, sx: f64, sy: f64, sz: f64) -> String {
    format!(
        r#"<object id="{id}"><mesh><vertices>
            <vertex x="0" y="0" z="0"/>
            <vertex x="{sx}" y="0" z="0"/>
            <vertex x="{sx}" y="{sy}" z="0"/>
            <vertex x="0" y="{sy}" z="{sz}"/>
            <vertex x="{sx}" y="{sy}" z="{sz}"/>
        </vertices><triangles>
            <triangle v1="0" v2="1" v3="2"/>
            <triangle v1="2" v2="3" v3="4"/>
        </triangles></mesh></object>"#
    )
}

/// A primary model document with one build item per (object id, transform)
pub fn model_document(objects: &[String], items: &[(usize, &str)]) -> String {
    let resources = objects.join("\n    ");
    let build: String = items
        .iter()
        .map(|(id, transform)| {
            format!(r#"    <item objectid="{id}" transform="{transform}"/>"#)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02">
  <resources>
    {resources}
  </resources>
  <build>
{build}
  </build>
</model>"#
    )
}

/// Vendor per-object settings with one extruder assignment per object
pub fn settings_with_extruders(slots: &[(usize, u8)]) -> String {
    let objects: String = slots
        .iter()
        .map(|(id, slot)| {
            format!(r#"<object id="{id}"><metadata key="extruder" value="{slot}"/></object>"#)
        })
        .collect();
    format!("<config>{objects}</config>")
}

/// Minimal project settings JSON carrying just a filament palette
pub fn palette_json(colors: &[&str]) -> String {
    let quoted: Vec<String> = colors.iter().map(|c| format!("\"{c}\"")).collect();
    format!(r#"{{"filament_colour":[{}]}}"#, quoted.join(","))
}
