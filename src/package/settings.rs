//! Vendor per-object settings document
//!
//! BambuStudio-family exports carry `Metadata/model_settings.config`, an XML
//! document of `<metadata key="..." value="..."/>` entries grouped under
//! `<object>`, `<part>`, `<plate>`, and `<model_instance>` elements. It is
//! the authoritative source for plate grouping, authoring names, and
//! per-object extruder assignments; the primary model document knows none of
//! that.

use crate::error::ContainerError;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeSet;

/// Settings attached to one object (and its parts)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSettings {
    /// Object id in the primary model document
    pub id: usize,
    /// Vendor authoring name, if present
    pub name: Option<String>,
    /// Object-level extruder assignment (1-based), if present
    pub extruder: Option<u8>,
    /// Part-level extruder assignments (1-based), in document order
    pub part_extruders: Vec<u8>,
}

/// One plate group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlateGroup {
    /// Vendor plate index (`plater_id`, 1-based), if present
    pub plater_id: Option<usize>,
    /// User-assigned plate name (`plater_name`), if present and non-empty
    pub name: Option<String>,
    /// Object ids placed on this plate, in document order
    pub object_ids: Vec<usize>,
}

/// Parsed vendor settings document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSettings {
    /// Per-object settings in document order
    pub objects: Vec<ObjectSettings>,
    /// Plate groups in document order
    pub plates: Vec<PlateGroup>,
}

enum Scope {
    Top,
    Object,
    Part,
    Plate,
    Instance,
}

impl ModelSettings {
    /// Parse the vendor settings document
    pub fn parse(file: &str, bytes: &[u8]) -> Result<Self, ContainerError> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let malformed = |message: String| ContainerError::MalformedXml {
            file: file.to_string(),
            message,
        };

        let mut settings = ModelSettings::default();
        let mut scope = Scope::Top;

        let mut buf = Vec::with_capacity(4096);
        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| malformed(e.to_string()))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let empty = matches!(event, Event::Empty(_));
                    match e.local_name().as_ref() {
                        b"object" if !empty => {
                            let mut object = ObjectSettings::default();
                            for attr in e.attributes() {
                                let attr = attr.map_err(|err| malformed(err.to_string()))?;
                                if attr.key.local_name().as_ref() == b"id" {
                                    let raw = attr
                                        .unescape_value()
                                        .map_err(|err| malformed(err.to_string()))?;
                                    object.id = raw.trim().parse().map_err(|_| {
                                        malformed(format!("object id '{raw}' is not an integer"))
                                    })?;
                                }
                            }
                            settings.objects.push(object);
                            scope = Scope::Object;
                        }
                        b"part" if !empty => {
                            if matches!(scope, Scope::Object) {
                                scope = Scope::Part;
                            }
                        }
                        b"plate" if !empty => {
                            settings.plates.push(PlateGroup::default());
                            scope = Scope::Plate;
                        }
                        b"model_instance" if !empty => {
                            if matches!(scope, Scope::Plate) {
                                scope = Scope::Instance;
                            }
                        }
                        b"metadata" => {
                            let mut key = None;
                            let mut value = None;
                            for attr in e.attributes() {
                                let attr = attr.map_err(|err| malformed(err.to_string()))?;
                                let v = attr
                                    .unescape_value()
                                    .map_err(|err| malformed(err.to_string()))?
                                    .into_owned();
                                match attr.key.local_name().as_ref() {
                                    b"key" => key = Some(v),
                                    b"value" => value = Some(v),
                                    _ => {}
                                }
                            }
                            if let (Some(key), Some(value)) = (key, value) {
                                settings.apply_metadata(&scope, &key, value);
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"object" => scope = Scope::Top,
                    b"part" => scope = Scope::Object,
                    b"plate" => scope = Scope::Top,
                    b"model_instance" => scope = Scope::Plate,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(settings)
    }

    fn apply_metadata(&mut self, scope: &Scope, key: &str, value: String) {
        match scope {
            Scope::Object => {
                if let Some(object) = self.objects.last_mut() {
                    match key {
                        "name" => object.name = Some(value),
                        "extruder" => {
                            if let Ok(slot) = value.trim().parse::<u8>() {
                                object.extruder = Some(slot);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Scope::Part => {
                if let Some(object) = self.objects.last_mut() {
                    if key == "extruder" {
                        if let Ok(slot) = value.trim().parse::<u8>() {
                            object.part_extruders.push(slot);
                        }
                    }
                }
            }
            Scope::Plate => {
                if let Some(plate) = self.plates.last_mut() {
                    match key {
                        "plater_id" => {
                            if let Ok(id) = value.trim().parse::<usize>() {
                                plate.plater_id = Some(id);
                            }
                        }
                        "plater_name" => {
                            if !value.trim().is_empty() {
                                plate.name = Some(value);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Scope::Instance => {
                if let Some(plate) = self.plates.last_mut() {
                    if key == "object_id" {
                        if let Ok(id) = value.trim().parse::<usize>() {
                            plate.object_ids.push(id);
                        }
                    }
                }
            }
            Scope::Top => {}
        }
    }

    /// Settings for one object, if present
    pub fn object(&self, id: usize) -> Option<&ObjectSettings> {
        self.objects.iter().find(|o| o.id == id)
    }

    /// The plate group containing an object, if any
    pub fn plate_for_object(&self, object_id: usize) -> Option<&PlateGroup> {
        self.plates
            .iter()
            .find(|p| p.object_ids.contains(&object_id))
    }

    /// Every extruder slot assigned at object or part level (1-based)
    pub fn assigned_extruders(&self) -> BTreeSet<u8> {
        let mut out = BTreeSet::new();
        for object in &self.objects {
            if let Some(slot) = object.extruder {
                out.insert(slot);
            }
            out.extend(object.part_extruders.iter().copied());
        }
        out
    }

    /// Whether any object or part is assigned to a slot beyond the first
    pub fn has_multi_extruder_assignments(&self) -> bool {
        self.assigned_extruders().iter().any(|slot| *slot > 1)
    }
}
