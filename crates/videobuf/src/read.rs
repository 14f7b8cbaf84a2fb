// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Read-mode fallback: byte-oriented access to frames for consumers that do
//! not manage buffers themselves.

use std::sync::MutexGuard;

use crate::{
    backend::MemoryBackend,
    buffer::{BufferState, MemoryModel},
    policy::QueuePolicy,
    queue::{Inner, Queue, ReadCursor, VIDEO_MAX_FRAME},
    Error,
};

/// Final state of a buffer the read paths waited on.
struct Completed {
    state: BufferState,
    sequence: u32,
}

impl<P, B> Queue<P, B>
where
    P: QueuePolicy<B>,
    B: MemoryBackend,
{
    /// Enters read mode, allocating the internal read pool.
    ///
    /// The pool holds `read_ahead + 1` buffers unless the policy asks for
    /// more. Calling this while already reading is a no-op.
    pub fn read_start(&self) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        self.read_start_locked(&mut inner)
    }

    fn read_start_locked(&self, inner: &mut Inner<B::Memory>) -> Result<(), Error> {
        if inner.streaming {
            return Err(Error::InvalidState("streaming active"));
        }
        if inner.reading {
            return Ok(());
        }
        let wanted = (self.config().read_ahead() + 1).min(VIDEO_MAX_FRAME) as u32;
        let (count, size) = self
            .policy()
            .buf_setup(wanted, inner.format.size())
            .map_err(Error::PolicyRejected)?;
        let granted = self.setup_locked(inner, count.max(1), size, MemoryModel::UserPointer)?;

        inner.reading = true;
        inner.cursor = None;
        inner.primed = false;
        log::debug!("read mode: {} buffers of {} bytes", granted, size);
        Ok(())
    }

    /// Leaves read mode, cancelling outstanding reads and freeing the pool.
    pub fn read_stop(&self) {
        let mut inner = self.lock_inner();
        if inner.reading {
            self.read_stop_locked(&mut inner);
        }
    }

    pub(crate) fn read_stop_locked(&self, inner: &mut Inner<B::Memory>) {
        self.cancel_locked(inner);
        inner.reading = false;
        if let Err(err) = self.free_locked(inner) {
            log::warn!("read pool not freed: {}", err);
        }
        log::debug!("read mode stopped");
    }

    /// Reads from one frame at a time.
    ///
    /// Serves bytes from the frame under the read cursor, capturing a new
    /// frame when there is none. A frame is recycled once fully read, so a
    /// short `out` buffer drains it over several calls.
    pub fn read_one(&self, out: &mut [u8], nonblocking: bool) -> Result<usize, Error> {
        let mut inner = self.lock_inner();
        self.read_start_locked(&mut inner)?;

        let (index, offset) = match inner.cursor {
            Some(cursor) => (cursor.index, cursor.offset),
            None => {
                let index = self.free_read_buffer(&inner)?;
                self.submit_locked(&mut inner, index)?;
                inner.cursor = Some(ReadCursor { index, offset: 0 });
                (index, 0)
            }
        };

        let (mut inner, completed) = self.wait_read(inner, index, nonblocking)?;
        if completed.state == BufferState::Error {
            log::warn!("read: dropping bad frame in buffer {}", index);
            self.recycle_locked(&mut inner, index);
            return Err(Error::FrameFailed(index));
        }

        let slot = inner.slot(index)?;
        let size = slot.geometry.size;
        let n = self.copy_out(slot, offset, out)?;
        if offset + n >= size {
            self.recycle_locked(&mut inner, index);
        } else {
            inner.cursor = Some(ReadCursor {
                index,
                offset: offset + n,
            });
        }
        Ok(n)
    }

    /// Reads a continuous byte stream of frames.
    ///
    /// The first call queues the whole read pool; afterwards every drained
    /// buffer is queued again so the device always has `read_ahead` buffers
    /// ahead of the one being read. Fills `out` completely unless a wait
    /// fails, in which case the bytes copied so far are returned.
    pub fn read_stream(&self, out: &mut [u8], nonblocking: bool) -> Result<usize, Error> {
        let mut inner = self.lock_inner();
        self.read_start_locked(&mut inner)?;

        if !inner.primed {
            let idle: Vec<u32> = {
                let lists = self.shared.lock();
                (0..inner.count())
                    .filter(|&index| lists.is_queueable(index))
                    .collect()
            };
            for index in idle {
                self.submit_locked(&mut inner, index)?;
            }
            inner.primed = true;
        }

        let mut copied = 0;
        while copied < out.len() {
            let cursor = match inner.cursor {
                Some(cursor) => cursor,
                None => {
                    let Some(index) = self.shared.lock().oldest() else {
                        break;
                    };
                    ReadCursor { index, offset: 0 }
                }
            };
            inner.cursor = Some(cursor);
            let index = cursor.index;

            let (guard, completed) = match self.wait_read(inner, index, nonblocking) {
                Ok(result) => result,
                Err(_) if copied > 0 => return Ok(copied),
                Err(err) => return Err(err),
            };
            inner = guard;

            let slot = inner.slot(index)?;
            let size = slot.geometry.size;
            let mut offset = cursor.offset;
            if completed.state == BufferState::Done {
                let chunk = &mut out[copied..];
                let n = self.copy_out(slot, offset, chunk)?;
                if self.config().vbi_counter() {
                    stamp_counter(&mut chunk[..n], offset, size, completed.sequence);
                }
                copied += n;
                offset += n;
            } else {
                log::warn!("read: skipping bad frame in buffer {}", index);
                offset = size;
            }

            if offset >= size {
                inner.cursor = None;
                self.submit_locked(&mut inner, index)?;
            } else {
                inner.cursor = Some(ReadCursor { index, offset });
            }
        }
        Ok(copied)
    }

    /// Buffer index and byte offset the read paths will continue from.
    pub fn read_cursor(&self) -> Option<(u32, usize)> {
        self.lock_inner()
            .cursor
            .map(|cursor| (cursor.index, cursor.offset))
    }

    /// First read buffer the consumer side owns.
    fn free_read_buffer(&self, inner: &Inner<B::Memory>) -> Result<u32, Error> {
        let lists = self.shared.lock();
        (0..inner.count())
            .find(|&index| lists.is_queueable(index))
            .ok_or(Error::InvalidState("no free read buffer"))
    }

    /// Waits until a read buffer leaves the device and takes it off the
    /// ready list.
    ///
    /// The management lock is released while waiting; a cancellation or a
    /// `read_stop` in the meantime is reported as `Cancelled`.
    fn wait_read<'a>(
        &'a self,
        inner: MutexGuard<'a, Inner<B::Memory>>,
        index: u32,
        nonblocking: bool,
    ) -> Result<(MutexGuard<'a, Inner<B::Memory>>, Completed), Error> {
        let mut lists = self.shared.lock();
        if !lists.is_in_flight(index) {
            lists.take_ready(index);
            let completed = completion_of(&lists, index)?;
            return Ok((inner, completed));
        }
        if nonblocking {
            return Err(Error::WouldBlock);
        }

        drop(inner);
        let lists = self
            .shared
            .wait(lists, false, |lists| !lists.is_in_flight(index))?;
        drop(lists);

        let inner = self.lock_inner();
        let current = inner.cursor.map(|cursor| cursor.index);
        if !inner.reading || current != Some(index) {
            return Err(Error::Cancelled);
        }
        let mut lists = self.shared.lock();
        if lists.is_in_flight(index) {
            return Err(Error::Cancelled);
        }
        lists.take_ready(index);
        let completed = completion_of(&lists, index)?;
        drop(lists);
        Ok((inner, completed))
    }

    /// Hands a drained read buffer back to the pool.
    fn recycle_locked(&self, inner: &mut Inner<B::Memory>, index: u32) {
        self.policy().buf_release(index);
        self.shared.lock().set_state(index, BufferState::NeedsInit);
        inner.cursor = None;
    }
}

fn completion_of(lists: &crate::completion::Lists, index: u32) -> Result<Completed, Error> {
    let state = lists.state(index).ok_or(Error::InvalidIndex(index))?;
    Ok(Completed {
        state,
        sequence: lists.sequence(index),
    })
}

/// Writes `counter` into the last four bytes of a `size`-byte frame, for the
/// part of the frame that `chunk` holds starting at `offset`.
fn stamp_counter(chunk: &mut [u8], offset: usize, size: usize, counter: u32) {
    if size < 4 {
        return;
    }
    let tail = size - 4;
    for (k, byte) in counter.to_le_bytes().into_iter().enumerate() {
        let position = tail + k;
        if position >= offset && position < offset + chunk.len() {
            chunk[position - offset] = byte;
        }
    }
}
