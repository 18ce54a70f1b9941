//! Environment-variable parsing and device-node discovery (§6, §4.8).
//!
//! Everything in here is thin I/O: scan a couple of sysfs directories, read a handful of
//! small text files, resolve a data directory. None of it is part of the adaptive-control
//! core, but it is still logged and typed like the rest of the daemon.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::InitError;

const DEFAULT_ALS_BASE_PATH: &str = "/sys/bus/iio/devices";
const BACKLIGHT_BASE_PATH: &str = "/sys/class/backlight";

/// Resolved paths and calibration constants the rest of the daemon needs. Produced once
/// by [`Config::discover`] and treated as immutable for the process lifetime -- hotplug
/// of the backlight or sensor is out of scope (§1 Non-goals).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_file: PathBuf,
    pub als_raw_path: PathBuf,
    pub als_scale: f64,
    pub als_offset: f64,
    pub backlight_max_path: PathBuf,
    pub backlight_brightness_path: PathBuf,
}

impl Config {
    /// Runs every discovery step in §4.8 and returns a fully-resolved [`Config`], or the
    /// first [`InitError`] encountered. Each step is fatal on its own; there is no partial
    /// configuration.
    pub fn discover() -> Result<Self, InitError> {
        let data_file = discover_data_file()?;
        let (als_raw_path, als_scale, als_offset) = discover_als()?;
        let (backlight_max_path, backlight_brightness_path) = discover_backlight()?;

        Ok(Self {
            data_file,
            als_raw_path,
            als_scale,
            als_offset,
            backlight_max_path,
            backlight_brightness_path,
        })
    }
}

fn discover_data_file() -> Result<PathBuf, InitError> {
    let data_home = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .ok_or_else(|| InitError::DataDir {
            path: PathBuf::from("$XDG_DATA_HOME or $HOME"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "neither variable is set"),
        })?;

    let dir = data_home.join("wluma");
    create_data_dir(&dir)?;

    debug!(path = %dir.display(), "resolved data directory");
    Ok(dir.join("data"))
}

#[cfg(unix)]
fn create_data_dir(dir: &Path) -> Result<(), InitError> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|source| InitError::DataDir {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn create_data_dir(dir: &Path) -> Result<(), InitError> {
    std::fs::create_dir_all(dir).map_err(|source| InitError::DataDir {
        path: dir.to_path_buf(),
        source,
    })
}

fn discover_als() -> Result<(PathBuf, f64, f64), InitError> {
    let base_path = std::env::var("WLUMA_LIGHT_SENSOR_BASE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ALS_BASE_PATH));

    let entries = fs::read_dir(&base_path).map_err(|_| InitError::AlsNotFound {
        base_path: base_path.clone(),
    })?;

    for entry in entries.flatten() {
        let device_dir = entry.path();
        let name = match fs::read_to_string(device_dir.join("name")) {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.trim() != "als" {
            continue;
        }

        let scale = read_optional_f64(&device_dir.join("in_illuminance_scale")).unwrap_or(1.0);
        let offset = read_optional_f64(&device_dir.join("in_illuminance_offset")).unwrap_or(0.0);
        let raw_path = device_dir.join("in_illuminance_raw");

        if raw_path.exists() {
            debug!(path = %raw_path.display(), scale, offset, "found ambient light sensor");
            return Ok((raw_path, scale, offset));
        }
    }

    Err(InitError::AlsNotFound { base_path })
}

fn read_optional_f64(path: &Path) -> Option<f64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn discover_backlight() -> Result<(PathBuf, PathBuf), InitError> {
    let entries = fs::read_dir(BACKLIGHT_BASE_PATH).map_err(|_| InitError::BacklightNotFound)?;

    for entry in entries.flatten() {
        let device_dir = entry.path();
        let max_path = device_dir.join("max_brightness");
        let brightness_path = device_dir.join("brightness");

        if fs::File::open(&max_path).is_ok() && fs::File::open(&brightness_path).is_ok() {
            debug!(device = %device_dir.display(), "found backlight device");
            return Ok((max_path, brightness_path));
        }
        warn!(device = %device_dir.display(), "backlight candidate is not readable, skipping");
    }

    Err(InitError::BacklightNotFound)
}
