//! Plate detection, bounds computation, and single-plate extraction
//!
//! Multi-plate packages put one build item per plate (the manufacturer
//! convention: each plate is one container object). Treating such a build as
//! a single scene is the central correctness hazard here: combined bounds
//! can exceed the build volume even when every individual plate fits, so
//! partitioning must happen before any fit verdict is computed.

use crate::error::{ContainerError, Error, GeometryError};
use crate::package::{
    filter_build_items, Dialect, MeshSource, ModelPackage, ModelSettings, PlateGroup, MODEL_PATH,
};
use crate::profile::BuildVolume;
use crate::transform::{Aabb, Transform};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Tolerance below which a negative Z minimum is floating-point noise
const BELOW_BED_TOLERANCE: f64 = 1e-3;

/// Largest negative Z offset still attributed to the authoring-tool origin
/// convention rather than a real sunk placement
const ORIGIN_ARTIFACT_MAX_DEPTH: f64 = 3.0;

/// One object placed on a plate
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedObject {
    /// Object id in the primary model document
    pub object_id: usize,
    /// Resolved display name, if any source provides one
    pub name: Option<String>,
    /// Placement on the bed (the build item transform)
    pub transform: Transform,
    /// Bounds in object-local space, components composed in
    pub local_bounds: Aabb,
    /// Bounds on the bed, all 8 corners through the placement transform
    pub world_bounds: Aabb,
    /// Whether the build item is flagged printable
    pub printable: bool,
}

/// Advisory fit assessment for one plate
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Verdict {
    /// Whether the plate's extents fit the build volume
    pub fits: bool,
    /// Human-readable warnings; non-empty does not block anything
    pub warnings: Vec<String>,
}

/// One independently sliceable scene within a package
#[derive(Debug, Clone, PartialEq)]
pub struct Plate {
    /// 1-based plate index, stable for the lifetime of the package
    pub index: usize,
    /// Resolved display name
    pub name: String,
    /// Member objects in build order
    pub objects: Vec<PlacedObject>,
    /// Union of member world bounds
    pub bounds: Aabb,
    /// Fit assessment against the build volume
    pub verdict: Verdict,
    /// Indices into the build item list backing this plate
    item_indices: Vec<usize>,
}

impl Plate {
    /// Build item indices (0-based, document order) backing this plate
    pub fn item_indices(&self) -> &[usize] {
        &self.item_indices
    }
}

/// Whether a below-bed Z minimum matches the authoring-tool origin artifact
///
/// Some BambuStudio-family exports sink objects slightly below Z=0 as a
/// side effect of the authoring tool's internal origin convention; the
/// geometry still prints from the bed. The below-bed warning is suppressed
/// for that pattern. The fit check is unaffected either way. Best-effort
/// classifier: a genuine sub-3mm sink in a vendor package is not
/// distinguishable from the artifact.
pub fn is_authoring_origin_artifact(dialect: Dialect, min_z: f64) -> bool {
    dialect == Dialect::BambuStudio
        && min_z < -BELOW_BED_TOLERANCE
        && min_z >= -ORIGIN_ARTIFACT_MAX_DEPTH
}

/// Derive the plate list for a package
///
/// Pure with respect to the package: recomputed on every call, so callers
/// always see current logic applied to previously uploaded packages.
pub fn extract_plates(package: &ModelPackage, volume: &BuildVolume) -> Result<Vec<Plate>, Error> {
    let document = package.document();
    let settings = package.model_settings()?;
    let partitions = partition_build(document, settings.as_ref());

    let mut resolver = GeometryResolver::new(package);
    let mut plates = Vec::with_capacity(partitions.len());

    for (plate_index, partition) in partitions.into_iter().enumerate() {
        let index = plate_index + 1;
        let mut objects = Vec::with_capacity(partition.item_indices.len());
        let mut bounds = Aabb::EMPTY;
        let mut all_printable = true;

        for &item_index in &partition.item_indices {
            let item = &document.build[item_index];
            let local_bounds = resolver.local_bounds(MODEL_PATH, item.object_id)?;
            let world_bounds = item.transform.apply_aabb(&local_bounds);
            bounds = bounds.union(&world_bounds);
            all_printable &= item.printable;
            objects.push(PlacedObject {
                object_id: item.object_id,
                name: resolve_object_name(package, settings.as_ref(), item.object_id),
                transform: item.transform,
                local_bounds,
                world_bounds,
                printable: item.printable,
            });
        }

        let name = partition
            .name
            .or_else(|| objects.iter().find_map(|o| o.name.clone()))
            .unwrap_or_else(|| format!("Plate {index}"));

        let verdict = assess(&bounds, volume, package.dialect(), all_printable, index);
        if !verdict.warnings.is_empty() {
            warn!(plate = index, warnings = ?verdict.warnings, "plate validation warnings");
        }
        let size = bounds.size();
        info!(
            plate = index,
            name = %name,
            width = format_args!("{:.1}", size[0]),
            depth = format_args!("{:.1}", size[1]),
            height = format_args!("{:.1}", size[2]),
            fits = verdict.fits,
            "derived plate"
        );

        plates.push(Plate {
            index,
            name,
            objects,
            bounds,
            verdict,
            item_indices: partition.item_indices,
        });
    }

    Ok(plates)
}

/// Derive a single-plate package containing only the selected plate's items
///
/// Everything except the primary model's build section is copied verbatim,
/// so vendor metadata and shared resources survive. Slicing the result never
/// touches sibling plate geometry.
pub fn extract_plate(package: &ModelPackage, plate_index: usize) -> Result<ModelPackage, Error> {
    let document = package.document();
    let settings = package.model_settings()?;
    let partitions = partition_build(document, settings.as_ref());

    if plate_index == 0 || plate_index > partitions.len() {
        return Err(GeometryError::PlateNotFound {
            requested: plate_index,
            available: partitions.len(),
        }
        .into());
    }

    if partitions.len() == 1 {
        debug!("single-plate package, deriving verbatim copy");
        return Ok(ModelPackage::from_entries(package.entries().clone())?);
    }

    let keep: BTreeSet<usize> = partitions[plate_index - 1].item_indices.iter().copied().collect();
    let model_bytes = package
        .entry(MODEL_PATH)
        .ok_or_else(|| ContainerError::MissingModel(MODEL_PATH.to_string()))?;
    let rewritten = filter_build_items(MODEL_PATH, model_bytes, |i| keep.contains(&i))?;

    let mut entries = package.entries().clone();
    entries.insert(MODEL_PATH.to_string(), rewritten);
    info!(plate = plate_index, kept_items = keep.len(), "extracted single-plate package");
    Ok(ModelPackage::from_entries(entries)?)
}

struct Partition {
    item_indices: Vec<usize>,
    name: Option<String>,
}

/// Partition build items into plates
///
/// Grouping metadata wins when it covers every item; otherwise a multi-item
/// build is one plate per item and a single-item build is one plate.
fn partition_build(
    document: &crate::package::ModelDocument,
    settings: Option<&ModelSettings>,
) -> Vec<Partition> {
    let items = &document.build;
    if items.is_empty() {
        return Vec::new();
    }

    if let Some(settings) = settings {
        if !settings.plates.is_empty() {
            let covered = items
                .iter()
                .all(|item| settings.plate_for_object(item.object_id).is_some());
            if covered {
                let mut groups: Vec<(&PlateGroup, Vec<usize>)> =
                    settings.plates.iter().map(|g| (g, Vec::new())).collect();
                for (index, item) in items.iter().enumerate() {
                    for (group, members) in groups.iter_mut() {
                        if group.object_ids.contains(&item.object_id) {
                            members.push(index);
                            break;
                        }
                    }
                }
                return groups
                    .into_iter()
                    .filter(|(_, members)| !members.is_empty())
                    .map(|(group, members)| Partition {
                        item_indices: members,
                        name: group.name.clone(),
                    })
                    .collect();
            }
        }
    }

    if items.len() == 1 {
        return vec![Partition {
            item_indices: vec![0],
            name: plate_group_name(settings, 1),
        }];
    }

    (0..items.len())
        .map(|index| Partition {
            item_indices: vec![index],
            name: plate_group_name(settings, index + 1),
        })
        .collect()
}

/// Vendor plate name for a 1-based plate index, when grouping metadata
/// carries one without covering the build
fn plate_group_name(settings: Option<&ModelSettings>, index: usize) -> Option<String> {
    settings?
        .plates
        .iter()
        .find(|p| p.plater_id == Some(index))
        .and_then(|p| p.name.clone())
}

/// Display name for an object: vendor settings name, then model document
/// name, then (for unnamed container objects) the first external component's
/// document name or path stem
fn resolve_object_name(
    package: &ModelPackage,
    settings: Option<&ModelSettings>,
    object_id: usize,
) -> Option<String> {
    if let Some(name) = settings
        .and_then(|s| s.object(object_id))
        .and_then(|o| o.name.clone())
    {
        return Some(name);
    }

    let object = package.document().objects.get(object_id)?;
    if let Some(name) = object.name.clone() {
        return Some(name);
    }

    if let Some(MeshSource::Components(refs)) = object.mesh.as_ref() {
        let first_external = refs.iter().find_map(|r| r.path.as_deref())?;
        if let Ok(doc) = package.component_document(first_external) {
            if let Some(name) = doc.objects.iter().find_map(|o| o.name.clone()) {
                return Some(name);
            }
        }
        let stem = first_external
            .rsplit('/')
            .next()
            .map(|f| f.split('.').next().unwrap_or(f))
            .filter(|s| !s.is_empty())?;
        return Some(stem.to_string());
    }

    None
}

fn assess(
    bounds: &Aabb,
    volume: &BuildVolume,
    dialect: Dialect,
    all_printable: bool,
    plate_index: usize,
) -> Verdict {
    let overruns = volume.overruns(bounds);
    let mut warnings: Vec<String> = overruns.iter().map(|o| o.to_string()).collect();

    if !bounds.is_empty()
        && bounds.min[2] < -BELOW_BED_TOLERANCE
        && !is_authoring_origin_artifact(dialect, bounds.min[2])
    {
        warnings.push(format!(
            "Objects extend below bed (Z_min = {:.1}mm). This may cause printing issues.",
            bounds.min[2]
        ));
    }

    if !all_printable {
        warnings.push(format!("Plate {plate_index} is marked as non-printable"));
    }

    Verdict {
        fits: overruns.is_empty(),
        warnings,
    }
}

/// Lazily resolves object-local bounds across component documents
///
/// External component documents are parsed at most once per package walk;
/// component-heavy packages reference the same document from many objects.
struct GeometryResolver<'a> {
    package: &'a ModelPackage,
    documents: BTreeMap<String, crate::package::ModelDocument>,
    cache: BTreeMap<(String, usize), Aabb>,
    visiting: BTreeSet<(String, usize)>,
}

impl<'a> GeometryResolver<'a> {
    fn new(package: &'a ModelPackage) -> Self {
        GeometryResolver {
            package,
            documents: BTreeMap::new(),
            cache: BTreeMap::new(),
            visiting: BTreeSet::new(),
        }
    }

    fn mesh_source(
        &mut self,
        path: &str,
        object_id: usize,
    ) -> Result<Option<MeshSource>, Error> {
        if path == MODEL_PATH {
            return match self.package.document().objects.get(object_id) {
                Some(object) => Ok(object.mesh.clone()),
                None => Err(GeometryError::UnresolvedComponent {
                    path: path.to_string(),
                    object_id,
                }
                .into()),
            };
        }
        if !self.documents.contains_key(path) {
            let parsed = self.package.component_document(path)?;
            self.documents.insert(path.to_string(), parsed);
        }
        match self.documents[path].objects.get(object_id) {
            Some(object) => Ok(object.mesh.clone()),
            None => Err(GeometryError::UnresolvedComponent {
                path: path.to_string(),
                object_id,
            }
            .into()),
        }
    }

    fn local_bounds(&mut self, path: &str, object_id: usize) -> Result<Aabb, Error> {
        let key = (path.to_string(), object_id);
        if let Some(bounds) = self.cache.get(&key) {
            return Ok(*bounds);
        }
        if !self.visiting.insert(key.clone()) {
            // Reference cycle; treat as unresolvable rather than recursing.
            return Err(GeometryError::UnresolvedComponent {
                path: path.to_string(),
                object_id,
            }
            .into());
        }

        let result = (|| -> Result<Aabb, Error> {
            match self.mesh_source(path, object_id)? {
                None => Err(GeometryError::MissingMesh { object_id }.into()),
                Some(MeshSource::Inline(stats)) => Ok(stats.bounds),
                Some(MeshSource::Components(refs)) => {
                    let mut out = Aabb::EMPTY;
                    for component in refs {
                        let child_path = component
                            .path
                            .as_deref()
                            .map(|p| p.trim_start_matches('/'))
                            .unwrap_or(path)
                            .to_string();
                        let child = self.local_bounds(&child_path, component.object_id)?;
                        out = out.union(&component.transform.apply_aabb(&child));
                    }
                    Ok(out)
                }
            }
        })();

        self.visiting.remove(&key);
        if let Ok(bounds) = &result {
            self.cache.insert(key, *bounds);
        }
        result
    }
}
