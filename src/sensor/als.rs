//! Ambient light sensor: opens the raw illuminance node once and keeps reading it (§6).

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use tracing::warn;

use crate::error::SensorError;

/// Anything that can yield a calibrated lux reading, `-1` on a transient failure.
/// Lets the dispatcher be driven by [`AlsSensor`] in production and by [`FakeAls`] in
/// tests, in the spirit of `wlsun`'s `MockAls` test harness.
pub trait LightSensor {
    fn read_lux(&mut self) -> i64;
}

/// A positional reader over `in_illuminance_raw`, calibrated with the sensor's own
/// scale/offset (§6: `raw_lux = round((raw_read + offset) * scale)`).
pub struct AlsSensor {
    file: File,
    path: PathBuf,
    scale: f64,
    offset: f64,
}

impl AlsSensor {
    pub fn open(path: PathBuf, scale: f64, offset: f64) -> Result<Self, SensorError> {
        let file = File::open(&path).map_err(|source| SensorError::Read {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            file,
            path,
            scale,
            offset,
        })
    }

    /// Reads and calibrates one raw illuminance sample. Per §7, a transient read failure
    /// is a recoverable condition for the caller: this returns `-1` rather than erroring,
    /// mirroring the sentinel convention used by the luma extractor.
    pub fn read_lux(&mut self) -> i64 {
        match self.read_raw() {
            Ok(raw) => ((raw + self.offset) * self.scale).round() as i64,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ambient light read failed");
                -1
            }
        }
    }

    fn read_raw(&mut self) -> Result<f64, SensorError> {
        let mut buf = [0u8; 50];
        let n = self
            .file
            .read_at(&mut buf, 0)
            .map_err(|source| SensorError::Read {
                path: self.path.clone(),
                source,
            })?;

        let text = std::str::from_utf8(&buf[..n]).unwrap_or_default().trim();
        text.parse::<f64>().map_err(|_| SensorError::Parse {
            raw: text.to_string(),
        })
    }
}

impl LightSensor for AlsSensor {
    fn read_lux(&mut self) -> i64 {
        self.read_lux()
    }
}

/// A sensor stand-in for tests: yields a fixed sequence of raw readings.
#[cfg(test)]
pub struct FakeAls {
    readings: Vec<i64>,
    next: usize,
}

#[cfg(test)]
impl FakeAls {
    pub fn new(readings: Vec<i64>) -> Self {
        Self { readings, next: 0 }
    }

    pub fn read_lux(&mut self) -> i64 {
        let value = *self.readings.get(self.next).unwrap_or(&-1);
        self.next += 1;
        value
    }
}

#[cfg(test)]
impl LightSensor for FakeAls {
    fn read_lux(&mut self) -> i64 {
        self.read_lux()
    }
}
