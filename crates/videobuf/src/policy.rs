// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{io, sync::Arc};

use crate::{
    backend::MemoryBackend,
    buffer::{Field, Geometry},
};

/// Device-specific hooks of a queue.
///
/// Hooks are invoked with the queue's management lock held and never with
/// the completion lock held, so an implementation may call back into a
/// [`crate::completion::Completer`] at any time. Hooks must not call back
/// into the [`crate::Queue`] itself.
pub trait QueuePolicy<B: MemoryBackend>: Send + Sync {
    /// Negotiates the buffer count and payload size for an allocation.
    ///
    /// `count` is the requested count, already clamped to
    /// [`crate::VIDEO_MAX_FRAME`], and `size` the payload size of the
    /// queue's current format. The returned size is page aligned by the
    /// queue.
    fn buf_setup(&self, count: u32, size: usize) -> io::Result<(u32, usize)>;

    /// Validates and completes the geometry of a buffer about to be queued.
    fn buf_prepare(&self, index: u32, geometry: &mut Geometry, field: Field) -> io::Result<()>;

    /// Hands a buffer to the device. Called in submission order, either on
    /// `qbuf` while streaming or reading, or from `streamon`.
    fn buf_queue(&self, index: u32, memory: &B::Memory);

    /// Releases device resources attached to a buffer.
    fn buf_release(&self, index: u32);

    /// Called for buffers that were in flight when the queue was cancelled.
    fn buf_cancel(&self, _index: u32) {}

    /// Called after a buffer was returned to the consumer by `dqbuf`.
    fn buf_dequeue(&self, _index: u32) {}
}

impl<B: MemoryBackend, P: QueuePolicy<B> + ?Sized> QueuePolicy<B> for Arc<P> {
    fn buf_setup(&self, count: u32, size: usize) -> io::Result<(u32, usize)> {
        (**self).buf_setup(count, size)
    }

    fn buf_prepare(&self, index: u32, geometry: &mut Geometry, field: Field) -> io::Result<()> {
        (**self).buf_prepare(index, geometry, field)
    }

    fn buf_queue(&self, index: u32, memory: &B::Memory) {
        (**self).buf_queue(index, memory)
    }

    fn buf_release(&self, index: u32) {
        (**self).buf_release(index)
    }

    fn buf_cancel(&self, index: u32) {
        (**self).buf_cancel(index)
    }

    fn buf_dequeue(&self, index: u32) {
        (**self).buf_dequeue(index)
    }
}
