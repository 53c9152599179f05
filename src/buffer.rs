//! GPU-resident frame buffers shared between the producer and the encoder.
//!
//! A [`GpuBuffer`] wraps one video frame that lives in GPU memory, described
//! by per-plane DMA-BUF descriptors. Shared ownership is `Arc<GpuBuffer>`:
//! the encoder clones the `Arc` when a frame is admitted and drops its clone
//! once the hardware pipeline has consumed (or failed to consume) the frame.
//!
//! Independent of reference counting, a buffer carries a *hold* flag. While
//! held, the producer must not recycle the backing storage. The hold is
//! taken on admission and released from the completion path; an optional
//! release hook notifies the producer, and fires at most once.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Orientation of the pixel data relative to scanout.
///
/// The encoder only accepts [`FrameTransform::Normal`] frames; the variants
/// mirror the output transforms a compositor can hand us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameTransform {
    Normal,
    Rotated90,
    Rotated180,
    Rotated270,
    Flipped,
    FlippedRotated90,
    FlippedRotated180,
    FlippedRotated270,
}

/// One plane of a DMA-BUF backed frame.
///
/// The file descriptor is owned by the producer; the encoder duplicates it
/// when exporting the frame to the hardware pipeline and never closes the
/// producer's copy.
#[derive(Clone, Copy, Debug)]
pub struct DmaBufPlane {
    pub fd: RawFd,
    pub stride: u32,
    pub offset: u32,
    pub modifier: u64,
}

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

/// A producer-supplied video frame resident in GPU memory.
pub struct GpuBuffer {
    width: u32,
    height: u32,
    fourcc: u32,
    transform: FrameTransform,
    planes: Vec<DmaBufPlane>,
    held: AtomicBool,
    on_release: Option<ReleaseHook>,
}

impl GpuBuffer {
    pub fn new(
        width: u32,
        height: u32,
        fourcc: u32,
        transform: FrameTransform,
        planes: Vec<DmaBufPlane>,
    ) -> Self {
        Self {
            width,
            height,
            fourcc,
            transform,
            planes,
            held: AtomicBool::new(false),
            on_release: None,
        }
    }

    /// Register a hook invoked when the hold on this buffer is released.
    pub fn with_release_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// DRM fourcc of the pixel format.
    pub fn fourcc(&self) -> u32 {
        self.fourcc
    }

    pub fn transform(&self) -> FrameTransform {
        self.transform
    }

    pub fn planes(&self) -> &[DmaBufPlane] {
        &self.planes
    }

    /// Mark the buffer as in use by the encoder.
    pub fn hold(&self) {
        self.held.store(true, Ordering::Release);
    }

    /// Release the hold and fire the release hook.
    ///
    /// Releasing a buffer that is not held is a no-op, so the hook fires at
    /// most once per hold even if completion and teardown both release.
    pub fn release(&self) {
        if self.held.swap(false, Ordering::AcqRel) {
            if let Some(hook) = &self.on_release {
                hook();
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fourcc", &format_args!("{:#010x}", self.fourcc))
            .field("transform", &self.transform)
            .field("planes", &self.planes.len())
            .field("held", &self.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn plane() -> DmaBufPlane {
        DmaBufPlane {
            fd: -1,
            stride: 256,
            offset: 0,
            modifier: 0,
        }
    }

    #[test]
    fn release_fires_hook_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let buffer = GpuBuffer::new(64, 64, 0, FrameTransform::Normal, vec![plane()])
            .with_release_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        buffer.hold();
        assert!(buffer.is_held());

        buffer.release();
        buffer.release();
        assert!(!buffer.is_held());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_without_hold_is_silent() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let buffer = GpuBuffer::new(64, 64, 0, FrameTransform::Normal, vec![plane()])
            .with_release_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        buffer.release();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }
}
