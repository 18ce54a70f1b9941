//! Wayland export-dmabuf client (§4.7, §6).
//!
//! Talks to the compositor's `zwlr_export_dmabuf_manager_v1` global to request frames of
//! one output, without cursor, and turns its event stream into the `FrameEvent`s the
//! dispatcher consumes. This is pure protocol glue: the event handlers only fill in a
//! builder and hand the result back through a channel-like cell, they never touch the
//! GPU or the controller.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, warn};
use wayland_client::protocol::wl_output::WlOutput;
use wayland_client::{Display, EventQueue, GlobalManager, Main};
use wayland_protocols::wlr::unstable::export_dmabuf::v1::client::zwlr_export_dmabuf_frame_v1::{
    CancelReason as ProtoCancelReason, Event as FrameEventProto, ZwlrExportDmabufFrameV1,
};
use wayland_protocols::wlr::unstable::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1;

use crate::error::InitError;
use crate::frame::{CancelReason, FrameDescriptor, FrameEvent, PlaneInfo};

#[derive(Default)]
struct FrameBuilder {
    width: u32,
    height: u32,
    planes: Vec<PlaneInfo>,
    modifier: Option<u64>,
}

/// Owns the Wayland connection and the single outstanding capture request.
pub struct CompositorClient {
    _display: Display,
    event_queue: EventQueue,
    manager: Main<ZwlrExportDmabufManagerV1>,
    output: Main<WlOutput>,
    pending: Rc<RefCell<Option<FrameEvent>>>,
}

impl CompositorClient {
    /// Connects to the compositor, binds the export-dmabuf manager, and selects the
    /// first advertised output. Every failure here is fatal per §7.
    pub fn connect() -> Result<Self, InitError> {
        let display = Display::connect_to_env()
            .map_err(|e| InitError::Compositor(format!("cannot connect to compositor: {e}")))?;
        let mut event_queue = display.create_event_queue();
        let attached = display.attach(event_queue.token());

        let globals = GlobalManager::new(&attached);
        event_queue
            .sync_roundtrip(&mut (), |_, _, _| {})
            .map_err(|e| InitError::Compositor(format!("initial roundtrip failed: {e}")))?;

        let manager = globals
            .instantiate_exact::<ZwlrExportDmabufManagerV1>(1)
            .map_err(|_| InitError::MissingExportDmabuf)?;

        let output = globals
            .instantiate_exact::<WlOutput>(1)
            .map_err(|_| InitError::NoOutputs)?;

        Ok(Self {
            _display: display,
            event_queue,
            manager,
            output,
            pending: Rc::new(RefCell::new(None)),
        })
    }

    /// Requests one frame from the selected output, without cursor, and blocks
    /// (dispatching Wayland events on this thread) until `ready` or `cancel` arrives.
    pub fn capture_frame(&mut self) -> Result<FrameEvent, InitError> {
        let builder = Rc::new(RefCell::new(FrameBuilder::default()));
        let pending = self.pending.clone();
        *pending.borrow_mut() = None;

        let overlay_cursor = 0; // without cursor, per §4.7 step 1
        let frame: Main<ZwlrExportDmabufFrameV1> =
            self.manager.capture_output(overlay_cursor, &self.output);

        frame.quick_assign(move |_frame, event, _| {
            let mut builder = builder.borrow_mut();
            match event {
                FrameEventProto::Frame {
                    width,
                    height,
                    mod_high,
                    mod_low,
                    ..
                } => {
                    builder.width = width;
                    builder.height = height;
                    builder.modifier = Some(((mod_high as u64) << 32) | mod_low as u64);
                }
                FrameEventProto::Object { fd, size, .. } => {
                    builder.planes.push(PlaneInfo { fd, size: size as u32 });
                }
                FrameEventProto::Ready { .. } => {
                    let descriptor = FrameDescriptor {
                        width: builder.width,
                        height: builder.height,
                        planes: std::mem::take(&mut builder.planes),
                        modifier: builder.modifier,
                    };
                    *pending.borrow_mut() = Some(FrameEvent::Ready(descriptor));
                }
                FrameEventProto::Cancel { reason } => {
                    let reason = match reason {
                        ProtoCancelReason::Permanent => CancelReason::Permanent,
                        ProtoCancelReason::Resizing => CancelReason::ResizeRequired,
                        _ => CancelReason::Temporary,
                    };
                    *pending.borrow_mut() = Some(FrameEvent::Cancel(reason));
                }
                _ => {}
            }
        });

        loop {
            self.event_queue
                .dispatch(&mut (), |event, _, _| {
                    warn!(?event, "unhandled compositor event");
                })
                .map_err(|e| InitError::Compositor(format!("event dispatch failed: {e}")))?;

            if let Some(result) = self.pending.borrow_mut().take() {
                return Ok(result);
            }
        }
    }
}

/// Duplicates a DMA-BUF fd so the importer can own a copy independent of the frame
/// object's lifetime (§4.2, §9: "the per-frame image's memory object takes ownership of
/// the duplicated file descriptor").
pub fn dup_fd(fd: RawFd) -> RawFd {
    // Safety: `fd` is a valid, open descriptor owned by the in-flight frame record for
    // the duration of this call.
    unsafe { libc::dup(fd) }
}

/// Closes a DMA-BUF fd exactly once, as `frame_free` must (§5).
pub fn close_fd(fd: RawFd) {
    // Safety: callers are required to close each fd exactly once; see frame_free in the
    // dispatcher, the sole caller.
    let result = unsafe { libc::close(fd) };
    if result != 0 {
        debug!(fd, "close() on dmabuf fd failed, ignoring");
    }
}
