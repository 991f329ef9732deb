//! XML model document parsing
//!
//! Parses the primary model document (and externally referenced component
//! documents) into object resources and build items. Mesh geometry is
//! reduced to statistics and bounds at parse time; the pipeline never needs
//! individual vertices after the bounding box is known, and keeping them
//! would triple the memory footprint of component-heavy packages.

use crate::error::ContainerError;
use crate::transform::{Aabb, Transform};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Summary of an inline mesh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshStats {
    /// Number of vertices
    pub vertex_count: usize,
    /// Number of triangles
    pub triangle_count: usize,
    /// Bounds of the vertex cloud in object-local coordinates
    pub bounds: Aabb,
}

/// A reference from a composite object to another object resource
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRef {
    /// Referenced object id
    pub object_id: usize,
    /// Archive path of the referenced document, if external
    pub path: Option<String>,
    /// Local placement of the component within the composite
    pub transform: Transform,
}

/// Geometry carried by an object resource
#[derive(Debug, Clone, PartialEq)]
pub enum MeshSource {
    /// Inline mesh, summarized
    Inline(MeshStats),
    /// Composite of references to other objects
    Components(Vec<ComponentRef>),
}

/// One `<object>` resource
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectResource {
    /// Resource id, unique within its document
    pub id: usize,
    /// Authoring name, if any
    pub name: Option<String>,
    /// Geometry, absent when the object carries neither mesh nor components
    pub mesh: Option<MeshSource>,
}

/// One `<item>` in the build section
#[derive(Debug, Clone, PartialEq)]
pub struct BuildItem {
    /// Referenced object id
    pub object_id: usize,
    /// Placement on the bed
    pub transform: Transform,
    /// Whether the item is flagged printable (absent attribute means yes)
    pub printable: bool,
}

/// Object resources of one document, keyed by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectInventory {
    objects: BTreeMap<usize, ObjectResource>,
}

impl ObjectInventory {
    /// Look up an object by resource id
    pub fn get(&self, id: usize) -> Option<&ObjectResource> {
        self.objects.get(&id)
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the document declares no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterate objects in id order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectResource> {
        self.objects.values()
    }
}

/// A parsed model document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDocument {
    /// Declared object resources
    pub objects: ObjectInventory,
    /// Build items in document order
    pub build: Vec<BuildItem>,
}

/// Where the parser currently is inside an `<object>`
enum ObjectContext {
    Top,
    Mesh,
    Components,
}

impl ModelDocument {
    /// Parse a model document from raw XML bytes
    ///
    /// `file` is the archive path, used only for error context.
    pub fn parse(file: &str, bytes: &[u8]) -> Result<Self, ContainerError> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let malformed = |message: String| ContainerError::MalformedXml {
            file: file.to_string(),
            message,
        };

        let mut document = ModelDocument::default();
        let mut current: Option<(ObjectResource, ObjectContext, MeshStats)> = None;
        let mut components: Vec<ComponentRef> = Vec::new();
        let mut in_build = false;

        let mut buf = Vec::with_capacity(4096);
        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| malformed(e.to_string()))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let empty = matches!(event, Event::Empty(_));
                    match e.local_name().as_ref() {
                        b"object" => {
                            let attrs = read_attrs(e, file)?;
                            let id = parse_usize_attr(&attrs, "id", file)?
                                .ok_or_else(|| malformed("object without id".to_string()))?;
                            let object = ObjectResource {
                                id,
                                name: attrs.get("name").cloned(),
                                mesh: None,
                            };
                            if empty {
                                document.objects.objects.insert(id, object);
                            } else {
                                current = Some((object, ObjectContext::Top, MeshStats {
                                    vertex_count: 0,
                                    triangle_count: 0,
                                    bounds: Aabb::EMPTY,
                                }));
                                components.clear();
                            }
                        }
                        b"mesh" if current.is_some() && !empty => {
                            if let Some((_, ctx, _)) = current.as_mut() {
                                *ctx = ObjectContext::Mesh;
                            }
                        }
                        b"components" if current.is_some() && !empty => {
                            if let Some((_, ctx, _)) = current.as_mut() {
                                *ctx = ObjectContext::Components;
                            }
                        }
                        b"vertex" => {
                            if let Some((_, ObjectContext::Mesh, stats)) = current.as_mut() {
                                let attrs = read_attrs(e, file)?;
                                let p = [
                                    parse_f64_attr(&attrs, "x", file)?.unwrap_or(0.0),
                                    parse_f64_attr(&attrs, "y", file)?.unwrap_or(0.0),
                                    parse_f64_attr(&attrs, "z", file)?.unwrap_or(0.0),
                                ];
                                stats.bounds.include(p);
                                stats.vertex_count += 1;
                            }
                        }
                        b"triangle" => {
                            if let Some((_, ObjectContext::Mesh, stats)) = current.as_mut() {
                                stats.triangle_count += 1;
                            }
                        }
                        b"component" => {
                            if let Some((_, ObjectContext::Components, _)) = current.as_ref() {
                                let attrs = read_attrs(e, file)?;
                                let object_id = parse_usize_attr(&attrs, "objectid", file)?
                                    .ok_or_else(|| {
                                        malformed("component without objectid".to_string())
                                    })?;
                                components.push(ComponentRef {
                                    object_id,
                                    path: attrs.get("path").cloned(),
                                    transform: parse_transform_attr(&attrs, file)?,
                                });
                            }
                        }
                        b"build" if !empty => {
                            in_build = true;
                        }
                        b"item" if in_build => {
                            let attrs = read_attrs(e, file)?;
                            let object_id = parse_usize_attr(&attrs, "objectid", file)?
                                .ok_or_else(|| malformed("item without objectid".to_string()))?;
                            let printable = attrs
                                .get("printable")
                                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                                .unwrap_or(true);
                            document.build.push(BuildItem {
                                object_id,
                                transform: parse_transform_attr(&attrs, file)?,
                                printable,
                            });
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"object" => {
                        if let Some((mut object, _, stats)) = current.take() {
                            object.mesh = if !components.is_empty() {
                                Some(MeshSource::Components(std::mem::take(&mut components)))
                            } else if stats.vertex_count > 0 {
                                Some(MeshSource::Inline(stats))
                            } else {
                                None
                            };
                            document.objects.objects.insert(object.id, object);
                        }
                    }
                    b"mesh" | b"components" => {
                        if let Some((_, ctx, _)) = current.as_mut() {
                            *ctx = ObjectContext::Top;
                        }
                    }
                    b"build" => {
                        in_build = false;
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(document)
    }
}

/// Rewrite a model document keeping only the build items selected by `keep`
///
/// Everything outside the build section is copied through untouched, so
/// resources, namespaces, and vendor attributes survive byte-for-byte. The
/// closure receives the 0-based index of each build item in document order.
pub fn filter_build_items(
    file: &str,
    bytes: &[u8],
    mut keep: impl FnMut(usize) -> bool,
) -> Result<Vec<u8>, ContainerError> {
    let mut reader = Reader::from_reader(bytes);
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let malformed = |message: String| ContainerError::MalformedXml {
        file: file.to_string(),
        message,
    };

    let mut in_build = false;
    let mut item_index = 0usize;
    // Depth of a dropped non-empty <item> subtree, when inside one.
    let mut dropping_depth: Option<usize> = None;

    let mut buf = Vec::with_capacity(4096);
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| malformed(e.to_string()))?;
        match &event {
            Event::Start(e) => {
                let name = e.local_name();
                if let Some(depth) = dropping_depth.as_mut() {
                    *depth += 1;
                    buf.clear();
                    continue;
                }
                if name.as_ref() == b"build" {
                    in_build = true;
                } else if in_build && name.as_ref() == b"item" {
                    let index = item_index;
                    item_index += 1;
                    if !keep(index) {
                        dropping_depth = Some(1);
                        buf.clear();
                        continue;
                    }
                }
            }
            Event::Empty(e) => {
                if dropping_depth.is_some() {
                    buf.clear();
                    continue;
                }
                if in_build && e.local_name().as_ref() == b"item" {
                    let index = item_index;
                    item_index += 1;
                    if !keep(index) {
                        buf.clear();
                        continue;
                    }
                }
            }
            Event::End(e) => {
                if let Some(depth) = dropping_depth.as_mut() {
                    *depth -= 1;
                    if *depth == 0 {
                        dropping_depth = None;
                    }
                    buf.clear();
                    continue;
                }
                if e.local_name().as_ref() == b"build" {
                    in_build = false;
                }
            }
            Event::Eof => break,
            _ => {
                if dropping_depth.is_some() {
                    buf.clear();
                    continue;
                }
            }
        }
        writer
            .write_event(event)
            .map_err(|e| malformed(e.to_string()))?;
        buf.clear();
    }

    Ok(writer.into_inner().into_inner())
}

type AttrMap = BTreeMap<String, String>;

fn read_attrs(e: &BytesStart<'_>, file: &str) -> Result<AttrMap, ContainerError> {
    let mut out = AttrMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ContainerError::MalformedXml {
            file: file.to_string(),
            message: err.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ContainerError::MalformedXml {
                file: file.to_string(),
                message: err.to_string(),
            })?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn parse_usize_attr(
    attrs: &AttrMap,
    name: &str,
    file: &str,
) -> Result<Option<usize>, ContainerError> {
    match attrs.get(name) {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ContainerError::MalformedXml {
                file: file.to_string(),
                message: format!("attribute {name}='{raw}' is not a non-negative integer"),
            }),
        None => Ok(None),
    }
}

fn parse_f64_attr(attrs: &AttrMap, name: &str, file: &str) -> Result<Option<f64>, ContainerError> {
    match attrs.get(name) {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ContainerError::MalformedXml {
                file: file.to_string(),
                message: format!("attribute {name}='{raw}' is not a number"),
            }),
        None => Ok(None),
    }
}

fn parse_transform_attr(attrs: &AttrMap, file: &str) -> Result<Transform, ContainerError> {
    match attrs.get("transform") {
        Some(raw) => Transform::parse(raw).map_err(|e| ContainerError::MalformedXml {
            file: file.to_string(),
            message: e.to_string(),
        }),
        None => Ok(Transform::IDENTITY),
    }
}
