//! FIFO admission queue of frames waiting for the encode slot.

use crate::buffer::GpuBuffer;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ordered, unbounded queue of admitted buffers.
///
/// Each entry owns one `Arc` reference to its buffer; the reference is
/// handed on to the current-frame slot when the scheduler dequeues it.
#[derive(Default)]
pub(crate) struct FrameQueue {
    entries: VecDeque<Arc<GpuBuffer>>,
}

impl FrameQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, buffer: Arc<GpuBuffer>) {
        self.entries.push_back(buffer);
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<GpuBuffer>> {
        self.entries.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
