//! Conversion/encode pipeline boundary.
//!
//! The scheduler drives any backend implementing [`EncodePipeline`]; the
//! production backend is [`vaapi::VaapiPipeline`]. Exactly one
//! conversion/encode cycle runs per admitted frame; the trait has no way
//! to batch.

use crate::buffer::GpuBuffer;
use crate::error::PipelineError;
use bytes::Bytes;
use std::sync::Arc;

mod drm_frame;
pub mod vaapi;

/// One dequeued frame handed to the pipeline, with its keyframe intent.
pub struct FrameRequest {
    pub buffer: Arc<GpuBuffer>,
    /// Snapshot of the keyframe latch taken when this frame was dequeued.
    pub keyframe: bool,
}

/// An encoded bitstream packet ready for delivery.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub keyframe: bool,
}

/// Outcome of one conversion/encode cycle.
pub enum ProcessOutcome {
    /// The cycle produced one packet for the submitted frame.
    Packet(EncodedPacket),
    /// The encoder buffered the frame internally and produced no packet
    /// yet. Not an error; later frames may still yield output.
    NeedMore,
}

/// A color-conversion + hardware-encode backend.
///
/// `process` may block; the scheduler only ever calls it from a background
/// task, never on the caller's thread. The backend is moved into that task
/// for the duration of the cycle, so implementations need no internal
/// locking. Dropping the backend releases every session resource it owns.
pub trait EncodePipeline: Send + 'static {
    fn process(&mut self, request: &FrameRequest) -> Result<ProcessOutcome, PipelineError>;
}
