use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort startup before the main loop is entered.
///
/// Every variant here is fatal: the process logs it and exits non-zero.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("could not create or access data directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no ambient light sensor found under {base_path:?}")]
    AlsNotFound { base_path: PathBuf },

    #[error("no usable backlight device found under /sys/class/backlight")]
    BacklightNotFound,

    #[error("graphics initialisation failed: {0}")]
    Gpu(#[from] crate::gpu::GpuError),

    #[error("compositor has no outputs")]
    NoOutputs,

    #[error("compositor does not support the export-dmabuf protocol")]
    MissingExportDmabuf,

    #[error("compositor connection failed: {0}")]
    Compositor(String),

    #[error("frame not importable: {plane_count} planes, modifier {modifier:?}")]
    FrameNotImportable {
        plane_count: usize,
        modifier: Option<u64>,
    },

    #[error("frame import failed: {0}")]
    FrameImport(#[from] crate::gpu::ImportError),

    #[error("compositor cancelled capture permanently")]
    PermanentCaptureCancel,
}

/// Errors surfaced while loading or saving the training set. These are logged but never
/// fatal: a load failure starts with an empty set, a save failure leaves the in-memory
/// set intact.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed training point at line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

/// Errors reading the ambient light sensor's raw illuminance node. Per §7, a transient
/// read failure is treated as -1 by the caller, not propagated as a hard error.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse illuminance reading {raw:?}")]
    Parse { raw: String },
}

/// Errors writing or reading the backlight device node.
#[derive(Debug, Error)]
pub enum BacklightError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
