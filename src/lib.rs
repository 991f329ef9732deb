//! platekit: model package preparation and G-code post-processing for a
//! pinned external slicing engine
//!
//! The pipeline ingests ZIP-based model packages in several vendor dialects,
//! derives per-plate geometry and color intent, rewrites embedded slicer
//! configuration so a quirky version-pinned engine survives it, invokes the
//! engine, and turns the resulting G-code into structured preview data with
//! corrected tool assignments.
//!
//! Stage order: [`package`] → [`plate`] (using [`transform`]) → [`color`] →
//! [`sanitize`] → [`invoke`] → [`gcode`].
//!
//! ```no_run
//! use platekit::package::ModelPackage;
//! use platekit::plate::extract_plates;
//! use platekit::profile::BuildVolume;
//!
//! # fn main() -> platekit::Result<()> {
//! let package = ModelPackage::from_path("upload.3mf")?;
//! for plate in extract_plates(&package, &BuildVolume::DEFAULT)? {
//!     println!("{}: fits={}", plate.name, plate.verdict.fits);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod color;
pub mod error;
pub mod gcode;
pub mod invoke;
pub mod package;
pub mod plate;
pub mod profile;
pub mod sanitize;
pub mod transform;

pub use error::{Error, Result};
pub use package::ModelPackage;
pub use plate::{extract_plate, extract_plates, Plate};
pub use profile::{BuildVolume, EngineVersion, PrinterProfile, SliceRequest, SlotMap};
pub use sanitize::{SanitizedPackage, Sanitizer};
