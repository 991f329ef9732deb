//! Model package container handling
//!
//! Packages are ZIP archives carrying a primary XML model document, optional
//! externally referenced component documents, and optional vendor metadata
//! documents. The container layer reads every entry once into an ordered
//! path -> bytes map; the primary model is parsed eagerly, while referenced
//! component documents are parsed lazily because component-style packages
//! can spread many megabytes of mesh across dozens of documents.
//!
//! A [`ModelPackage`] is immutable once parsed. Every rewrite (plate
//! extraction, sanitization) derives a new package from a new entry map.

mod document;
mod settings;

pub use document::{
    filter_build_items, BuildItem, ComponentRef, MeshSource, MeshStats, ModelDocument,
    ObjectInventory, ObjectResource,
};
pub use settings::{ModelSettings, ObjectSettings, PlateGroup};

use crate::error::ContainerError;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Primary model document path within the archive
pub const MODEL_PATH: &str = "3D/3dmodel.model";

/// Per-object settings and plate grouping metadata (vendor dialect)
pub const MODEL_SETTINGS_PATH: &str = "Metadata/model_settings.config";

/// Embedded slicer configuration (JSON)
pub const PROJECT_SETTINGS_PATH: &str = "Metadata/project_settings.config";

/// Vendor slice summary metadata
pub const SLICE_INFO_PATH: &str = "Metadata/slice_info.config";

/// Vendor filament ordering metadata (JSON)
pub const FILAMENT_SEQUENCE_PATH: &str = "Metadata/filament_sequence.json";

/// Vendor per-layer custom G-code (mid-print tool changes live here)
pub const CUSTOM_GCODE_PATH: &str = "Metadata/custom_gcode_per_layer.xml";

/// Vendor cut metadata
pub const CUT_INFORMATION_PATH: &str = "Metadata/cut_information.xml";

/// Prefixes of vendor preview image entries
pub const PREVIEW_PREFIXES: &[&str] = &["Metadata/plate", "Metadata/top_", "Metadata/pick_"];

/// Entries whose presence marks the BambuStudio dialect
const BAMBU_SIGNATURE_ENTRIES: &[&str] = &[
    MODEL_SETTINGS_PATH,
    SLICE_INFO_PATH,
    FILAMENT_SEQUENCE_PATH,
];

/// Source dialect of a package, probed from signature metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Plain core-spec package with no vendor metadata
    Generic,
    /// BambuStudio/OrcaSlicer family export
    BambuStudio,
}

/// An opened, parsed model package
#[derive(Debug, Clone)]
pub struct ModelPackage {
    entries: BTreeMap<String, Vec<u8>>,
    document: ModelDocument,
    dialect: Dialect,
}

impl ModelPackage {
    /// Open a package from a reader
    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, ContainerError> {
        let mut archive =
            ZipArchive::new(reader).map_err(|e| ContainerError::NotAZip(e.to_string()))?;

        let mut entries = BTreeMap::new();
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| ContainerError::NotAZip(e.to_string()))?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            entries.insert(file.name().to_string(), data);
        }

        Self::from_entries(entries)
    }

    /// Open a package from in-memory bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        Self::from_reader(Cursor::new(bytes))
    }

    /// Open a package from a file path
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Build a package from an already-extracted entry map
    ///
    /// Used both when opening an archive and when deriving rewritten
    /// packages; the primary model is re-parsed so the derived package is
    /// self-consistent.
    pub fn from_entries(entries: BTreeMap<String, Vec<u8>>) -> Result<Self, ContainerError> {
        let model_bytes = entries
            .get(MODEL_PATH)
            .ok_or_else(|| ContainerError::MissingModel(MODEL_PATH.to_string()))?;
        let document = ModelDocument::parse(MODEL_PATH, model_bytes)?;

        let dialect = if BAMBU_SIGNATURE_ENTRIES
            .iter()
            .any(|name| entries.contains_key(*name))
        {
            Dialect::BambuStudio
        } else {
            Dialect::Generic
        };

        debug!(
            entries = entries.len(),
            objects = document.objects.len(),
            build_items = document.build.len(),
            ?dialect,
            "opened model package"
        );

        Ok(ModelPackage {
            entries,
            document,
            dialect,
        })
    }

    /// Raw bytes of an archive entry
    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(|v| v.as_slice())
    }

    /// Whether an entry exists
    pub fn has_entry(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All entry names in archive order
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// The full entry map (for deriving rewritten packages)
    pub fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.entries
    }

    /// The parsed primary model document
    pub fn document(&self) -> &ModelDocument {
        &self.document
    }

    /// Probed source dialect
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Lazily parse an externally referenced component document
    ///
    /// `path` is the reference as written in the component attribute; a
    /// leading slash is tolerated.
    pub fn component_document(&self, path: &str) -> Result<ModelDocument, ContainerError> {
        let clean = path.trim_start_matches('/');
        let bytes = self
            .entry(clean)
            .ok_or_else(|| ContainerError::MissingEntry(clean.to_string()))?;
        ModelDocument::parse(clean, bytes)
    }

    /// Parse the vendor per-object settings document, if present
    pub fn model_settings(&self) -> Result<Option<ModelSettings>, ContainerError> {
        match self.entry(MODEL_SETTINGS_PATH) {
            Some(bytes) => Ok(Some(ModelSettings::parse(MODEL_SETTINGS_PATH, bytes)?)),
            None => Ok(None),
        }
    }

    /// Parse the embedded slicer configuration (JSON), if present
    pub fn project_settings(
        &self,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, ContainerError> {
        let Some(bytes) = self.entry(PROJECT_SETTINGS_PATH) else {
            return Ok(None);
        };
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| ContainerError::MalformedJson {
                file: PROJECT_SETTINGS_PATH.to_string(),
                message: e.to_string(),
            })?;
        match value {
            serde_json::Value::Object(map) => Ok(Some(map)),
            other => Err(ContainerError::MalformedJson {
                file: PROJECT_SETTINGS_PATH.to_string(),
                message: format!("expected a JSON object, got {other}"),
            }),
        }
    }

    /// Write the package back out as a ZIP archive
    pub fn write_to<W: Write + Seek>(&self, writer: W) -> Result<W, ContainerError> {
        let mut zip = ZipWriter::new(writer);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in &self.entries {
            zip.start_file(name.as_str(), options)
                .map_err(|e| ContainerError::NotAZip(e.to_string()))?;
            zip.write_all(data)?;
        }
        zip.finish()
            .map_err(|e| ContainerError::NotAZip(e.to_string()))
    }

    /// Serialize the package to in-memory ZIP bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ContainerError> {
        let cursor = self.write_to(Cursor::new(Vec::new()))?;
        Ok(cursor.into_inner())
    }

    /// Write the package to a file path
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), ContainerError> {
        let file = std::fs::File::create(path)?;
        self.write_to(file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_model_xml() -> &'static str {
        r#"<?xml version="1.0" encoding="UTF-8"?>
<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02">
  <resources>
    <object id="1" name="cube">
      <mesh>
        <vertices>
          <vertex x="0" y="0" z="0"/>
          <vertex x="10" y="0" z="0"/>
          <vertex x="10" y="10" z="0"/>
          <vertex x="0" y="0" z="10"/>
        </vertices>
        <triangles>
          <triangle v1="0" v2="1" v3="2"/>
          <triangle v1="0" v2="1" v3="3"/>
        </triangles>
      </mesh>
    </object>
  </resources>
  <build>
    <item objectid="1" transform="1 0 0 0 1 0 0 0 1 100 100 0"/>
  </build>
</model>"#
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn rejects_non_zip_bytes() {
        let err = ModelPackage::from_bytes(b"this is not a zip archive").unwrap_err();
        assert!(matches!(err, ContainerError::NotAZip(_)));
    }

    #[test]
    fn rejects_archive_without_model_document() {
        let bytes = zip_with(&[("readme.txt", b"hello")]);
        let err = ModelPackage::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ContainerError::MissingModel(_)));
    }

    #[test]
    fn parses_minimal_package_as_generic_dialect() {
        let bytes = zip_with(&[(MODEL_PATH, minimal_model_xml().as_bytes())]);
        let pkg = ModelPackage::from_bytes(&bytes).unwrap();
        assert_eq!(pkg.dialect(), Dialect::Generic);
        assert_eq!(pkg.document().objects.len(), 1);
        assert_eq!(pkg.document().build.len(), 1);
        assert!(pkg.model_settings().unwrap().is_none());
        assert!(pkg.project_settings().unwrap().is_none());
    }

    #[test]
    fn vendor_signature_entries_mark_bambu_dialect() {
        let bytes = zip_with(&[
            (MODEL_PATH, minimal_model_xml().as_bytes()),
            (SLICE_INFO_PATH, b"<config/>"),
        ]);
        let pkg = ModelPackage::from_bytes(&bytes).unwrap();
        assert_eq!(pkg.dialect(), Dialect::BambuStudio);
    }

    #[test]
    fn absent_optional_metadata_is_not_an_error() {
        let bytes = zip_with(&[(MODEL_PATH, minimal_model_xml().as_bytes())]);
        let pkg = ModelPackage::from_bytes(&bytes).unwrap();
        assert!(pkg.entry(CUSTOM_GCODE_PATH).is_none());
        assert!(pkg.entry(FILAMENT_SEQUENCE_PATH).is_none());
    }

    #[test]
    fn round_trips_through_zip_bytes() {
        let bytes = zip_with(&[
            (MODEL_PATH, minimal_model_xml().as_bytes()),
            (PROJECT_SETTINGS_PATH, br#"{"layer_height":"0.2"}"#),
        ]);
        let pkg = ModelPackage::from_bytes(&bytes).unwrap();
        let reopened = ModelPackage::from_bytes(&pkg.to_bytes().unwrap()).unwrap();
        assert_eq!(
            reopened.entry_names().collect::<Vec<_>>(),
            pkg.entry_names().collect::<Vec<_>>()
        );
        assert_eq!(
            reopened.project_settings().unwrap().unwrap()["layer_height"],
            serde_json::json!("0.2")
        );
    }
}
