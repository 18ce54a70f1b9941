//! The compositor-exported frame descriptor consumed by the frame importer (§4.2, §6).

use std::os::unix::io::RawFd;

/// One plane of a compositor-exported DMA-BUF frame.
#[derive(Debug, Clone, Copy)]
pub struct PlaneInfo {
    pub fd: RawFd,
    pub size: u32,
}

/// `{width, height, plane_count, fds[], sizes[]}` as delivered by the export-dmabuf
/// protocol's `frame`/`object` events (§4.2, §6). Only plane 0 is ever imported; a
/// second plane or a non-default modifier is a permanent failure (§4.2).
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneInfo>,
    /// DRM format modifier, high/low 32 bits as delivered by the protocol. `None` means
    /// "not yet reported"; `Some(0)` is the default/linear modifier.
    pub modifier: Option<u64>,
}

impl FrameDescriptor {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// §4.2: more than one plane, or any non-default modifier, is a permanent failure.
    pub fn is_importable(&self) -> bool {
        self.plane_count() == 1 && matches!(self.modifier, None | Some(0))
    }
}

/// Reason a compositor `cancel` event gave for abandoning a frame request (§4.7, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Transient: a new capture should be re-armed.
    Temporary,
    /// Fatal: the loop must stop.
    Permanent,
    /// The compositor requested resizing the buffer and trying again -- scanned as a
    /// content-size mismatch, which the core treats as permanent since resize is a
    /// documented non-goal (§1, §9).
    ResizeRequired,
}

impl CancelReason {
    pub fn is_permanent(self) -> bool {
        matches!(self, CancelReason::Permanent | CancelReason::ResizeRequired)
    }
}

/// One iteration's worth of compositor events, as consumed by the dispatcher (§4.7).
pub enum FrameEvent {
    Ready(FrameDescriptor),
    Cancel(CancelReason),
}
