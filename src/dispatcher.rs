//! Top-level cycle loop: capture a frame, extract luma, read sensors, ask the
//! controller for a decision, act on it, sleep, repeat (§4.7).

use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::backlight::{BacklightControl, BacklightDevice};
use crate::compositor::CompositorClient;
use crate::controller::store::PointStore;
use crate::controller::{Controller, Decision};
use crate::error::InitError;
use crate::frame::{FrameDescriptor, FrameEvent};
use crate::gpu::{extract_luma, GpuContext, ImportedImage};
use crate::sensor::{AlsSensor, LightSensor, LuxSmoother};
use crate::signals::ShutdownFlag;

const CYCLE_SLEEP: Duration = Duration::from_millis(100);

pub struct Dispatcher {
    compositor: CompositorClient,
    gpu: GpuContext,
    als: Box<dyn LightSensor>,
    backlight: Box<dyn BacklightControl>,
    lux_smoother: LuxSmoother,
    controller: Controller,
    shutdown: ShutdownFlag,
}

impl Dispatcher {
    pub fn new(
        compositor: CompositorClient,
        gpu: GpuContext,
        als: AlsSensor,
        backlight: BacklightDevice,
        controller: Controller,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            compositor,
            gpu,
            als: Box::new(als),
            backlight: Box::new(backlight),
            lux_smoother: LuxSmoother::new(),
            controller,
            shutdown,
        }
    }

    /// Runs cycles until a permanent compositor cancellation or a shutdown signal is
    /// observed. A non-importable frame or a frame-import failure is also fatal per
    /// §4.2/§7: both propagate out and cause the process to exit non-zero (§7 line
    /// ~208). Other per-cycle failures (luma extraction, a transient ALS read, a
    /// transient compositor cancel) are logged and the cycle is simply skipped.
    pub fn run(&mut self) -> Result<(), InitError> {
        loop {
            if self.shutdown.requested() {
                info!("shutdown requested, exiting cleanly");
                return Ok(());
            }

            match self.compositor.capture_frame()? {
                FrameEvent::Ready(descriptor) => self.run_cycle(descriptor)?,
                FrameEvent::Cancel(reason) => {
                    if reason.is_permanent() {
                        error!(?reason, "compositor cancelled capture permanently");
                        return Err(InitError::PermanentCaptureCancel);
                    }
                    warn!(?reason, "capture cancelled, re-arming");
                }
            }

            if self.shutdown.requested() {
                info!("shutdown requested, exiting cleanly");
                return Ok(());
            }
            sleep_interruptible(CYCLE_SLEEP, &self.shutdown);
        }
    }

    fn run_cycle(&mut self, descriptor: FrameDescriptor) -> Result<(), InitError> {
        if !descriptor.is_importable() {
            error!(
                planes = descriptor.plane_count(),
                modifier = ?descriptor.modifier,
                "frame not importable, aborting"
            );
            return Err(InitError::FrameNotImportable {
                plane_count: descriptor.plane_count(),
                modifier: descriptor.modifier,
            });
        }

        let imported = ImportedImage::import(&self.gpu, &descriptor).map_err(|err| {
            error!(error = %err, "frame import failed, aborting");
            InitError::FrameImport(err)
        })?;

        let luma = extract_luma(&mut self.gpu, &imported);
        imported.destroy(&self.gpu);

        if luma < 0 {
            return Ok(());
        }
        let luma = luma as u8;

        let shutdown = self.shutdown.clone();
        let mut should_stop = move || shutdown.requested();
        control_cycle(
            self.als.as_mut(),
            &mut self.lux_smoother,
            self.backlight.as_mut(),
            &mut self.controller,
            luma,
            &mut should_stop,
        )
    }
}

/// The portion of one cycle that doesn't touch the compositor or the GPU: read the
/// ambient light, smooth it, read the observed backlight, feed the controller, and act
/// on its decision. Factored out of [`Dispatcher::run_cycle`] so it can be exercised
/// deterministically against [`crate::sensor::als::FakeAls`],
/// [`crate::backlight::FakeBacklight`] and an in-memory
/// [`crate::controller::store::InMemoryStore`]-backed [`Controller`], without a real
/// compositor or GPU (§1.1 test tooling, in the spirit of `wlsun`'s `MockAls` harness).
fn control_cycle<S: PointStore>(
    als: &mut dyn LightSensor,
    lux_smoother: &mut LuxSmoother,
    backlight: &mut dyn BacklightControl,
    controller: &mut Controller<S>,
    luma: u8,
    should_stop: &mut dyn FnMut() -> bool,
) -> Result<(), InitError> {
    let raw_lux = als.read_lux();
    if raw_lux < 0 {
        return Ok(());
    }
    lux_smoother.push(raw_lux);

    let observed_backlight = match backlight.read_percent() {
        Ok(value) => value,
        Err(err) => {
            error!(error = %err, "failed to read backlight, skipping cycle");
            return Ok(());
        }
    };

    if !lux_smoother.ready() {
        controller.observe_during_warmup(observed_backlight);
        return Ok(());
    }

    let decision = controller.cycle(lux_smoother.value(), luma, observed_backlight);

    if let Decision::Predict(target) = decision {
        if let Err(err) = backlight.transition(observed_backlight, target, should_stop) {
            error!(error = %err, "failed to write backlight");
        }
    }
    Ok(())
}

fn sleep_interruptible(duration: Duration, shutdown: &ShutdownFlag) {
    const SLICE: Duration = Duration::from_millis(10);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if shutdown.requested() {
            return;
        }
        let slice = SLICE.min(remaining);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlight::FakeBacklight;
    use crate::controller::store::InMemoryStore;
    use crate::sensor::FakeAls;

    fn never_stop() -> impl FnMut() -> bool {
        || false
    }

    #[test]
    fn transient_als_failure_skips_the_cycle_without_touching_the_backlight() {
        let mut als = FakeAls::new(vec![-1]);
        let mut lux_smoother = LuxSmoother::new();
        let mut backlight = FakeBacklight::new(50);
        let mut controller = Controller::new(InMemoryStore::default());
        let mut should_stop = never_stop();

        control_cycle(
            &mut als,
            &mut lux_smoother,
            &mut backlight,
            &mut controller,
            50,
            &mut should_stop,
        )
        .unwrap();

        assert!(backlight.writes.is_empty());
        assert_eq!(backlight.percent, 50);
    }

    #[test]
    fn warmup_observes_backlight_without_writing() {
        let mut als = FakeAls::new(vec![100; 5]);
        let mut lux_smoother = LuxSmoother::new();
        let mut backlight = FakeBacklight::new(60);
        let mut controller = Controller::new(InMemoryStore::default());
        let mut should_stop = never_stop();

        for _ in 0..5 {
            control_cycle(
                &mut als,
                &mut lux_smoother,
                &mut backlight,
                &mut controller,
                50,
                &mut should_stop,
            )
            .unwrap();
        }

        assert!(!lux_smoother.ready());
        assert!(backlight.writes.is_empty());
    }

    #[test]
    fn confirmed_training_point_then_matching_prediction_does_not_rewrite() {
        let mut als = FakeAls::new(vec![200; 10_000]);
        let mut lux_smoother = LuxSmoother::new();
        let mut backlight = FakeBacklight::new(70);
        let mut controller = Controller::new(InMemoryStore::default());
        let mut should_stop = never_stop();

        // Fill the lux window, then hold the backlight steady long enough to confirm a
        // training point at (200, 50, 70).
        for _ in 0..10 + 14 {
            control_cycle(
                &mut als,
                &mut lux_smoother,
                &mut backlight,
                &mut controller,
                50,
                &mut should_stop,
            )
            .unwrap();
        }

        assert_eq!(controller.points().len(), 1);
        assert!(backlight.writes.is_empty());

        // One more idle cycle at the same observed values: prediction already matches
        // the observed backlight, so no transition is driven.
        control_cycle(
            &mut als,
            &mut lux_smoother,
            &mut backlight,
            &mut controller,
            50,
            &mut should_stop,
        )
        .unwrap();
        assert!(backlight.writes.is_empty());
    }
}
