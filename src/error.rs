//! Error types for package preparation and G-code post-processing
//!
//! Each stage of the pipeline has its own error enum so callers can match on
//! the concern that failed. A top-level [`Error`] aggregates them for APIs
//! that span stages.
//!
//! Validation outcomes (plate exceeds build volume, objects below bed) are
//! never errors: they are returned as structured data from the plate
//! extractor. Only engine failures and remap failures abort a slice job.

use std::io;
use thiserror::Error;

/// Result type for platekit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors opening or reading the model package container
#[derive(Error, Debug)]
pub enum ContainerError {
    /// The uploaded bytes are not a readable ZIP archive
    ///
    /// Raised when the central directory cannot be read at all. A truncated
    /// upload or a plain STL renamed to the package extension ends up here.
    #[error("not a ZIP archive: {0}")]
    NotAZip(String),

    /// The primary model document is missing from the archive
    #[error("missing primary model document '{0}'")]
    MissingModel(String),

    /// A referenced archive entry does not exist
    #[error("missing archive entry '{0}'")]
    MissingEntry(String),

    /// An XML document inside the package could not be parsed
    #[error("malformed XML in '{file}': {message}")]
    MalformedXml {
        /// Archive path of the offending document
        file: String,
        /// Parser diagnostic
        message: String,
    },

    /// A JSON metadata document inside the package could not be parsed
    #[error("malformed JSON in '{file}': {message}")]
    MalformedJson {
        /// Archive path of the offending document
        file: String,
        /// Parser diagnostic
        message: String,
    },

    /// I/O error reading the package
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors resolving geometry for a placed object
#[derive(Error, Debug)]
pub enum GeometryError {
    /// An object referenced from the build has no mesh and no components
    #[error("object {object_id} has no mesh data")]
    MissingMesh {
        /// Resource id of the object
        object_id: usize,
    },

    /// A component reference points at a document or object that does not exist
    #[error("unresolvable component reference to object {object_id} in '{path}'")]
    UnresolvedComponent {
        /// Archive path of the referenced document (the primary model for
        /// local references)
        path: String,
        /// Object id the component points at
        object_id: usize,
    },

    /// A transform attribute did not contain 12 finite coefficients
    #[error("invalid transform attribute: {0}")]
    BadTransform(String),

    /// A plate index outside the package's plate list
    #[error("plate {requested} not found (package has {available} plates)")]
    PlateNotFound {
        /// 1-based plate index asked for
        requested: usize,
        /// Number of plates in the package
        available: usize,
    },
}

/// Errors assigning active colors to extruder slots
#[derive(Error, Debug)]
pub enum AssignmentError {
    /// The package binds more colors to geometry than the hardware has slots
    ///
    /// Reported instead of truncating so the caller can decide to fall back
    /// to a single-material slice.
    #[error("{active} active colors exceed the {slots} available extruder slots")]
    Overflow {
        /// Colors actually bound to geometry
        active: usize,
        /// Physical slots on the target hardware
        slots: usize,
    },
}

/// Errors producing a sanitized package
///
/// Rules whose prerequisite metadata document is missing are skipped, not
/// raised, so this only surfaces when the derived package itself cannot be
/// assembled.
#[derive(Error, Debug)]
pub enum SanitizeError {
    /// The rewritten project settings could not be serialized
    #[error("could not serialize rewritten settings: {0}")]
    Settings(String),

    /// The derived package could not be assembled
    #[error("could not assemble sanitized package: {0}")]
    Repack(String),
}

/// Failures of the external slicing engine
///
/// Always carries the captured diagnostic text, and distinguishes a crash
/// (signal-terminated) from an orderly non-zero exit so callers can tell
/// "your request is unsupported for this file" from "the engine crashed,
/// try a narrower request".
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine exited with a non-zero status
    #[error("engine exited with status {exit_code}: {stderr}")]
    Failed {
        /// Process exit code
        exit_code: i32,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// The engine was terminated by a signal
    #[error("engine crashed (terminated by signal): {stderr}")]
    Crashed {
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// The engine did not finish within the configured timeout
    #[error("engine timed out after {seconds}s")]
    TimedOut {
        /// Configured timeout that elapsed
        seconds: u64,
    },

    /// The engine reported success but produced no output file
    #[error("engine exited 0 but no G-code output found in '{dir}'")]
    MissingOutput {
        /// Directory that was searched
        dir: String,
    },

    /// The engine binary could not be started
    #[error("could not start engine: {0}")]
    Spawn(#[from] io::Error),

    /// The invoker was shut down while the request was queued
    #[error("slice request canceled while queued")]
    Canceled,
}

/// Failures rewriting tool assignments in generated G-code
#[derive(Error, Debug)]
pub enum RemapError {
    /// Multi-tool output was requested but the stream selects fewer tools
    ///
    /// Indicates the engine silently compacted or dropped the multi-material
    /// request; surfaced instead of producing a misleading remap.
    #[error(
        "expected multi-tool output for {requested} mapped slots but found \
         {found} distinct tool selections"
    )]
    SingleToolOutput {
        /// Slots in the requested mapping
        requested: usize,
        /// Distinct tool selections found in the stream
        found: usize,
    },
}

/// Top-level error covering every pipeline stage
#[derive(Error, Debug)]
pub enum Error {
    /// Container could not be opened or read
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Geometry could not be resolved
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// Color-to-slot assignment failed
    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    /// Sanitized package could not be produced
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    /// External engine failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Tool remap failed
    #[error(transparent)]
    Remap(#[from] RemapError),

    /// I/O error outside the container layer
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_errors_name_the_offending_entry() {
        let err = ContainerError::MissingModel("3D/3dmodel.model".to_string());
        assert!(err.to_string().contains("3D/3dmodel.model"));

        let err = ContainerError::MalformedXml {
            file: "Metadata/model_settings.config".to_string(),
            message: "unexpected EOF".to_string(),
        };
        assert!(err.to_string().contains("model_settings.config"));
        assert!(err.to_string().contains("unexpected EOF"));
    }

    #[test]
    fn engine_failure_distinguishes_crash_from_exit() {
        let failed = EngineError::Failed {
            exit_code: 2,
            stdout: String::new(),
            stderr: "bad plate".to_string(),
        };
        assert!(failed.to_string().contains("status 2"));

        let crashed = EngineError::Crashed {
            stdout: String::new(),
            stderr: "SIGSEGV".to_string(),
        };
        assert!(crashed.to_string().contains("crashed"));
    }

    #[test]
    fn overflow_reports_both_counts() {
        let err = AssignmentError::Overflow { active: 5, slots: 4 };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('4'));
    }
}
