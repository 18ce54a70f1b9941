//! Edit-detection state machine and prediction glue (§4.5).

pub mod predict;
pub mod store;
pub mod types;

use tracing::{debug, info};

use crate::error::StoreError;
use types::{dominates, PendingEdit, TrainingPoint};

// §4.5 sets the nominal cooldown at C = 15 cycles, counted from (and including) the
// cycle that first opens the pending edit. That opening cycle just records the
// candidate and does not itself count down, so the counter seeded on open is C - 1:
// with C - 1 further identical cycles it reaches zero on the 15th cycle overall,
// matching the §8 worked example ("Feed (200, 50, 70) for 15 consecutive cycles. After
// cycle 15 the set is {(200, 50, 70)}"). A literal `countdown := C` with a `== 1`
// confirm threshold is off by one against that example; this constant and the
// decrement-then-check order below resolve the discrepancy in the example's favour.
const PENDING_COOLDOWN_RESET: u8 = 14;

/// What the dispatcher should do as a result of one controller cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No backlight write this cycle.
    Idle,
    /// Drive the backlight toward this predicted target (§4.5.3).
    Predict(u8),
}

pub struct Controller<S: store::PointStore = store::TrainingStore> {
    store: S,
    points: Vec<TrainingPoint>,
    lux_max_seen: i64,
    pending: Option<PendingEdit>,
    countdown: u8,
    last_written: u8,
}

impl<S: store::PointStore> Controller<S> {
    pub fn new(mut store: S) -> Self {
        let points = store.load();
        let lux_max_seen = points.iter().map(|p| p.lux).max().unwrap_or(0).max(1);
        info!(points = points.len(), lux_max_seen, "controller initialised");

        Self {
            store,
            points,
            lux_max_seen,
            pending: None,
            countdown: 0,
            last_written: 0,
        }
    }

    pub fn points(&self) -> &[TrainingPoint] {
        &self.points
    }

    /// Called once per warm-up cycle (§4.4 not yet `ready()`), so the controller's
    /// notion of "last-written backlight" tracks reality even before it starts making
    /// decisions (§4.7 step 4).
    pub fn observe_during_warmup(&mut self, backlight: u8) {
        self.last_written = backlight;
    }

    /// Called once per cycle once the lux window is full. `lux` is the smoothed
    /// reading, `luma` the extracted screen brightness, `observed_backlight` the
    /// currently-set backlight percentage.
    pub fn cycle(&mut self, lux: i64, luma: u8, observed_backlight: u8) -> Decision {
        if let Some(pending) = self.pending {
            if observed_backlight != pending.backlight {
                self.open_pending(lux, luma, observed_backlight);
                return Decision::Idle;
            }
            self.countdown -= 1;
            if self.countdown == 0 {
                self.confirm(pending);
            } else {
                debug!(countdown = self.countdown, "edit-counting");
            }
            return Decision::Idle;
        }

        if observed_backlight != self.last_written {
            self.open_pending(lux, luma, observed_backlight);
            return Decision::Idle;
        }

        if self.points.is_empty() {
            // "training set empty and countdown was 0": even though nothing changed,
            // there is nothing to predict from, so treat the current value as the
            // starting point to learn.
            self.open_pending(lux, luma, observed_backlight);
            return Decision::Idle;
        }

        let lux_cap = lux.min(self.lux_max_seen);
        let target = predict::predict(&self.points, lux_cap, luma, self.lux_max_seen);
        if target == observed_backlight {
            Decision::Idle
        } else {
            debug!(target, observed_backlight, "predicted new target");
            self.last_written = target;
            Decision::Predict(target)
        }
    }

    fn open_pending(&mut self, lux: i64, luma: u8, backlight: u8) {
        self.pending = Some(PendingEdit::new(lux, luma, backlight));
        self.countdown = PENDING_COOLDOWN_RESET;
        debug!(lux, luma, backlight, "edit-pending opened");
    }

    fn confirm(&mut self, pending: PendingEdit) {
        let point = pending.into_point();
        self.insert(point);
        self.lux_max_seen = self.lux_max_seen.max(point.lux).max(1);
        self.last_written = point.backlight;
        self.pending = None;
        self.countdown = 0;
        info!(lux = point.lux, luma = point.luma, backlight = point.backlight, "learned new point");
    }

    /// Appends `point` and prunes every existing point it dominates (§4.5.1), then
    /// persists the whole set. A save failure is logged but never rolls back the
    /// in-memory update (§7).
    fn insert(&mut self, point: TrainingPoint) {
        self.points.retain(|existing| !dominates(&point, existing));
        self.points.push(point);

        if let Err(err) = self.store.save(&self.points) {
            log_save_error(&err);
        }
    }
}

fn log_save_error(err: &StoreError) {
    tracing::warn!(error = %err, "failed to persist training set");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn controller_at(dir: &tempfile::TempDir) -> Controller {
        let path: PathBuf = dir.path().join("data");
        Controller::new(store::TrainingStore::open(path).unwrap())
    }

    #[test]
    fn first_learning_confirms_after_fifteen_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_at(&dir);
        controller.observe_during_warmup(70);

        for _ in 0..14 {
            assert_eq!(controller.cycle(200, 50, 70), Decision::Idle);
        }
        assert_eq!(controller.cycle(200, 50, 70), Decision::Idle);

        assert_eq!(controller.points(), &[TrainingPoint::new(200, 50, 70)]);
    }

    #[test]
    fn replacement_overwrites_same_lux_and_luma() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_at(&dir);
        controller.observe_during_warmup(70);
        for _ in 0..15 {
            controller.cycle(200, 50, 70);
        }
        assert_eq!(controller.points(), &[TrainingPoint::new(200, 50, 70)]);

        for _ in 0..15 {
            controller.cycle(200, 50, 40);
        }
        assert_eq!(controller.points(), &[TrainingPoint::new(200, 50, 40)]);
    }

    #[test]
    fn monotone_pruning_drops_both_old_points() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_at(&dir);
        controller.observe_during_warmup(30);
        for _ in 0..15 {
            controller.cycle(100, 50, 30);
        }
        for _ in 0..15 {
            controller.cycle(500, 50, 60);
        }
        assert_eq!(controller.points().len(), 2);

        for _ in 0..15 {
            controller.cycle(300, 50, 80);
        }
        assert_eq!(controller.points(), &[TrainingPoint::new(300, 50, 80)]);
    }

    #[test]
    fn cancelled_learning_is_never_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_at(&dir);
        controller.observe_during_warmup(80);

        // Cycle 1: user starts adjusting.
        assert_eq!(controller.cycle(500, 40, 80), Decision::Idle);
        // Cycles 2-5: keeps moving it, resetting the cooldown each time.
        for _ in 0..4 {
            controller.cycle(500, 40, 85);
        }
        // Holds steady at 85 for the remaining cooldown.
        for _ in 0..14 {
            controller.cycle(500, 40, 85);
        }

        assert_eq!(controller.points(), &[TrainingPoint::new(500, 40, 85)]);
    }

    #[test]
    fn empty_set_at_idle_opens_edit_pending_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_at(&dir);
        controller.observe_during_warmup(50);

        // Nothing changed and the set is empty: still opens a pending window.
        assert_eq!(controller.cycle(100, 50, 50), Decision::Idle);
        for _ in 0..13 {
            controller.cycle(100, 50, 50);
        }
        assert!(controller.points().is_empty());
        controller.cycle(100, 50, 50);
        assert_eq!(controller.points(), &[TrainingPoint::new(100, 50, 50)]);
    }

    #[test]
    fn interpolation_drives_toward_predicted_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_at(&dir);
        controller.observe_during_warmup(10);
        for _ in 0..15 {
            controller.cycle(0, 0, 10);
        }
        for _ in 0..15 {
            controller.cycle(0, 100, 50);
        }
        for _ in 0..15 {
            controller.cycle(100, 0, 20);
        }

        // Simulate the backlight currently sitting at 50 (whatever last wrote it);
        // observed == last-written enters idle-predict rather than edit-pending.
        controller.observe_during_warmup(50);
        let decision = controller.cycle(50, 50, 50);
        assert_eq!(decision, Decision::Predict(35));
    }
}
