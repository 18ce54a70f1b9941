//! Training set persistence: plain-text, one point per line (§4.6, §6).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::controller::types::TrainingPoint;
use crate::error::StoreError;

/// A backend the controller can load its training set from and persist it to. Lets the
/// controller be driven by [`TrainingStore`] in production and by [`InMemoryStore`] in
/// tests, in the spirit of `wlsun`'s `MockAls` test harness.
pub trait PointStore {
    fn load(&mut self) -> Vec<TrainingPoint>;
    fn save(&mut self, points: &[TrainingPoint]) -> Result<(), StoreError>;
}

/// Opens (creating if necessary) the data file in mode 0600, read/write/data-sync, and
/// keeps the handle open for the process lifetime so saves can truncate-and-rewrite it
/// in place (§6: "opened mode 0600 read/write/create/data-sync").
pub struct TrainingStore {
    path: PathBuf,
    file: File,
}

impl TrainingStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .custom_flags(libc::O_DSYNC)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    /// Loads every point currently on disk. Best-effort per §4.6: a malformed line
    /// aborts the load and returns an empty set, logging a warning, without touching
    /// the file on disk.
    pub fn load(&mut self) -> Vec<TrainingPoint> {
        match self.try_load() {
            Ok(points) => points,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to load training set, starting empty");
                Vec::new()
            }
        }
    }

    fn try_load(&mut self) -> Result<Vec<TrainingPoint>, StoreError> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        let reader = BufReader::new(&self.file);
        let mut points = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            points.push(parse_line(idx + 1, &line)?);
        }
        Ok(points)
    }

    /// Truncates the file to zero, rewinds, and rewrites every point in `points`'
    /// current order. Called immediately after every mutation (§4.5.1).
    pub fn save(&mut self, points: &[TrainingPoint]) -> Result<(), StoreError> {
        self.file.set_len(0).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        let mut buf = String::new();
        for point in points {
            buf.push_str(&format!("{} {} {}\n", point.lux, point.luma, point.backlight));
        }
        self.file
            .write_all(buf.as_bytes())
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

impl PointStore for TrainingStore {
    fn load(&mut self) -> Vec<TrainingPoint> {
        self.load()
    }

    fn save(&mut self, points: &[TrainingPoint]) -> Result<(), StoreError> {
        self.save(points)
    }
}

/// An in-memory stand-in for tests: holds the training set in a `Vec`, with no file I/O
/// and a `save` that never fails.
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryStore {
    points: Vec<TrainingPoint>,
}

#[cfg(test)]
impl PointStore for InMemoryStore {
    fn load(&mut self) -> Vec<TrainingPoint> {
        self.points.clone()
    }

    fn save(&mut self, points: &[TrainingPoint]) -> Result<(), StoreError> {
        self.points = points.to_vec();
        Ok(())
    }
}

fn parse_line(line_no: usize, line: &str) -> Result<TrainingPoint, StoreError> {
    let mut fields = line.split_whitespace();
    let malformed = || StoreError::Malformed {
        line: line_no,
        text: line.to_string(),
    };

    let lux: i64 = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
    let luma: u8 = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
    let backlight: u8 = fields.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
    if fields.next().is_some() {
        return Err(malformed());
    }

    Ok(TrainingPoint::new(lux, luma, backlight))
}

/// Used by tests that want a store backed by a scratch file rather than the real data
/// directory.
#[cfg(test)]
pub fn scratch_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_preserves_set() {
        let dir = tempdir().unwrap();
        let path = scratch_path(dir.path(), "data");
        let points = vec![
            TrainingPoint::new(200, 50, 70),
            TrainingPoint::new(0, 0, 10),
            TrainingPoint::new(12345, 66, 33),
        ];

        let mut store = TrainingStore::open(path.clone()).unwrap();
        store.save(&points).unwrap();

        let mut reloaded_store = TrainingStore::open(path).unwrap();
        let reloaded = reloaded_store.load();
        assert_eq!(reloaded, points);
    }

    #[test]
    fn save_is_truncate_then_rewrite() {
        let dir = tempdir().unwrap();
        let path = scratch_path(dir.path(), "data");
        let mut store = TrainingStore::open(path.clone()).unwrap();

        store
            .save(&[TrainingPoint::new(1, 2, 3), TrainingPoint::new(4, 5, 6)])
            .unwrap();
        store.save(&[TrainingPoint::new(9, 9, 9)]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "9 9 9\n");
    }

    #[test]
    fn malformed_line_yields_empty_set_and_keeps_file() {
        let dir = tempdir().unwrap();
        let path = scratch_path(dir.path(), "data");
        std::fs::write(&path, "200 50 70\nnot a point\n").unwrap();

        let mut store = TrainingStore::open(path.clone()).unwrap();
        let points = store.load();
        assert!(points.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "200 50 70\nnot a point\n");
    }

    #[test]
    fn empty_file_loads_to_empty_set() {
        let dir = tempdir().unwrap();
        let path = scratch_path(dir.path(), "data");
        let mut store = TrainingStore::open(path).unwrap();
        assert!(store.load().is_empty());
    }
}
