// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::{
    backend::{LockTarget, MemoryBackend},
    buffer::{BufType, BufferInfo, BufferState, Field, Geometry, MemoryModel, Slot, UserPtr},
    completion::{Completer, Lists, Shared},
    lock,
    mapping::Mapping,
    policy::QueuePolicy,
    Error,
};

/// Maximum number of buffers a queue can hold.
pub const VIDEO_MAX_FRAME: usize = 32;

/// Granularity of buffer sizes and mapping offsets.
pub const PAGE_SIZE: usize = 4096;

pub(crate) fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Frame format new buffers inherit at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub width: u32,
    pub height: u32,
    pub bytesperline: u32,
    pub input: Option<u32>,
}

impl Format {
    pub fn new(width: u32, height: u32, bytesperline: u32) -> Self {
        Format {
            width,
            height,
            bytesperline,
            input: None,
        }
    }

    pub fn size(&self) -> usize {
        self.bytesperline as usize * self.height as usize
    }
}

impl Default for Format {
    /// 640x480 at 16 bits per pixel.
    fn default() -> Self {
        Format::new(640, 480, 640 * 2)
    }
}

/// Queue configuration.
///
/// ```
/// use std::time::Duration;
/// use videobuf::buffer::Field;
/// use videobuf::QueueConfig;
///
/// let config = QueueConfig::default()
///     .with_field(Field::Alternate)
///     .with_read_ahead(2)
///     .with_wait_interval(Duration::from_millis(5));
/// assert_eq!(config.read_ahead(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct QueueConfig {
    buf_type: BufType,
    field: Field,
    format: Format,
    read_ahead: usize,
    vbi_counter: bool,
    wait_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            buf_type: BufType::VideoCapture,
            field: Field::None,
            format: Format::default(),
            read_ahead: 1,
            vbi_counter: false,
            wait_interval: Duration::from_millis(10),
        }
    }
}

impl QueueConfig {
    pub fn with_buf_type(self, buf_type: BufType) -> Self {
        QueueConfig { buf_type, ..self }
    }

    /// Field order stamped on submitted buffers. `Field::Alternate`
    /// alternates top and bottom fields.
    pub fn with_field(self, field: Field) -> Self {
        QueueConfig { field, ..self }
    }

    pub fn with_format(self, format: Format) -> Self {
        QueueConfig { format, ..self }
    }

    /// Buffers kept queued ahead of the one being drained in read mode.
    pub fn with_read_ahead(self, read_ahead: usize) -> Self {
        QueueConfig {
            read_ahead: read_ahead.min(VIDEO_MAX_FRAME - 1),
            ..self
        }
    }

    /// Stamps the frame sequence number into the last four bytes of every
    /// frame served by `read_stream`.
    pub fn with_vbi_counter(self, vbi_counter: bool) -> Self {
        QueueConfig {
            vbi_counter,
            ..self
        }
    }

    /// How often blocking waits check the interrupt flag.
    pub fn with_wait_interval(self, wait_interval: Duration) -> Self {
        QueueConfig {
            wait_interval,
            ..self
        }
    }

    pub fn buf_type(&self) -> BufType {
        self.buf_type
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn read_ahead(&self) -> usize {
        self.read_ahead
    }

    pub fn vbi_counter(&self) -> bool {
        self.vbi_counter
    }

    pub fn wait_interval(&self) -> Duration {
        self.wait_interval
    }
}

/// Position of the read paths inside the buffer being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadCursor {
    pub(crate) index: u32,
    pub(crate) offset: usize,
}

/// Structural state, guarded by the management lock.
pub(crate) struct Inner<M> {
    pub(crate) slots: Vec<Option<Slot<M>>>,
    pub(crate) format: Format,
    pub(crate) streaming: bool,
    pub(crate) reading: bool,
    pub(crate) last: Field,
    pub(crate) queued_since_alloc: bool,
    pub(crate) mappings: Vec<Arc<Mapping>>,
    pub(crate) next_map_id: u64,
    pub(crate) cursor: Option<ReadCursor>,
    pub(crate) primed: bool,
}

impl<M> Inner<M> {
    fn new(format: Format) -> Self {
        Inner {
            slots: (0..VIDEO_MAX_FRAME).map(|_| None).collect(),
            format,
            streaming: false,
            reading: false,
            last: Field::Bottom,
            queued_since_alloc: false,
            mappings: Vec::new(),
            next_map_id: 0,
            cursor: None,
            primed: false,
        }
    }

    pub(crate) fn slot(&self, index: u32) -> Result<&Slot<M>, Error> {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidIndex(index))
    }

    pub(crate) fn slot_mut(&mut self, index: u32) -> Result<&mut Slot<M>, Error> {
        self.slots
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidIndex(index))
    }

    pub(crate) fn count(&self) -> u32 {
        self.slots.iter().flatten().count() as u32
    }

    fn any_mapped(&self) -> bool {
        self.slots.iter().flatten().any(Slot::is_mapped)
    }

    /// Field the next submitted buffer carries, without consuming it.
    fn peek_field(&self, policy: Field) -> Field {
        match policy {
            Field::Alternate if self.last == Field::Top => Field::Bottom,
            Field::Alternate => Field::Top,
            field => field,
        }
    }

    /// Field for the buffer being submitted now.
    fn next_field(&mut self, policy: Field) -> Field {
        let field = self.peek_field(policy);
        if policy == Field::Alternate {
            self.last = field;
        }
        field
    }
}

/// Video capture buffer queue.
///
/// The queue owns a fixed arena of up to [`VIDEO_MAX_FRAME`] buffers and
/// arbitrates them between a consumer, using the methods below, and a
/// device, which receives buffers through its [`QueuePolicy`] and reports
/// them back through a [`Completer`].
///
/// All methods take `&self`; a queue is shared between threads behind an
/// `Arc`.
pub struct Queue<P, B: MemoryBackend> {
    config: QueueConfig,
    policy: P,
    backend: B,
    pub(crate) inner: Mutex<Inner<B::Memory>>,
    pub(crate) shared: Arc<Shared>,
}

impl<P, B> Queue<P, B>
where
    P: QueuePolicy<B>,
    B: MemoryBackend,
{
    pub fn new(config: QueueConfig, policy: P, backend: B) -> Self {
        let shared = Arc::new(Shared::new(config.wait_interval()));
        let inner = Mutex::new(Inner::new(config.format()));
        Queue {
            config,
            policy,
            backend,
            inner,
            shared,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Handle for the device side to report completed buffers.
    pub fn completer(&self) -> Completer {
        Completer::new(Arc::clone(&self.shared))
    }

    /// Flag that aborts blocking waits with [`Error::Interrupted`] while set.
    ///
    /// Suitable for `signal_hook::flag::register`.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.shared.interrupt_flag()
    }

    /// Raises the interrupt flag and wakes every waiter.
    pub fn interrupt(&self) {
        self.shared.interrupt_flag().store(true, Ordering::Release);
        self.shared.wake_all();
    }

    /// Clears a previously raised interrupt flag.
    pub fn clear_interrupt(&self) {
        self.shared.interrupt_flag().store(false, Ordering::Release);
    }

    pub fn format(&self) -> Format {
        self.lock_inner().format
    }

    /// Changes the format inherited by the next allocation.
    pub fn set_format(&self, format: Format) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        if self.busy_locked(&inner) {
            return Err(Error::Busy);
        }
        inner.format = format;
        Ok(())
    }

    /// Number of allocated buffers.
    pub fn count(&self) -> u32 {
        self.lock_inner().count()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_inner().streaming
    }

    pub fn is_reading(&self) -> bool {
        self.lock_inner().reading
    }

    /// True while streaming, reading, mapped or while any buffer is in
    /// flight.
    pub fn is_busy(&self) -> bool {
        let inner = self.lock_inner();
        self.busy_locked(&inner)
    }

    fn busy_locked(&self, inner: &Inner<B::Memory>) -> bool {
        if inner.streaming || inner.reading || inner.any_mapped() {
            return true;
        }
        let lists = self.shared.lock();
        !lists.pending.is_empty() || !lists.ready.is_empty()
    }

    /// Field the next submitted buffer will carry.
    pub fn next_field(&self) -> Field {
        self.lock_inner().peek_field(self.config.field())
    }

    /// Allocates `count` buffers of the given memory model.
    ///
    /// Any existing pool is freed first; `count == 0` only frees. The policy
    /// negotiates the final count and size. Returns the number of buffers
    /// actually allocated, which may be lower than requested when the
    /// backend runs out of memory part way through.
    ///
    /// The old pool is released before the new one is allocated so its
    /// memory counts toward the new request. When not even the first new
    /// buffer can be allocated the call fails with `BackendFailure` and the
    /// queue is left with no buffers.
    pub fn reqbufs(&self, count: u32, memory: MemoryModel) -> Result<u32, Error> {
        let mut inner = self.lock_inner();
        if inner.streaming || inner.reading {
            return Err(Error::Busy);
        }
        if !self.shared.lock().pending.is_empty() {
            return Err(Error::Busy);
        }
        if count == 0 {
            self.free_locked(&mut inner)?;
            log::debug!("reqbufs: released all buffers");
            return Ok(0);
        }

        let requested = count.min(VIDEO_MAX_FRAME as u32);
        let (count, size) = self
            .policy
            .buf_setup(requested, inner.format.size())
            .map_err(Error::PolicyRejected)?;
        let granted = self.setup_locked(&mut inner, count, size, memory)?;
        log::debug!(
            "reqbufs: {} of {} {} buffers, {} bytes each",
            granted,
            requested,
            memory,
            page_align(size)
        );
        Ok(granted)
    }

    /// Replaces the pool with `count` buffers of `size` payload bytes.
    pub(crate) fn setup_locked(
        &self,
        inner: &mut Inner<B::Memory>,
        count: u32,
        size: usize,
        memory: MemoryModel,
    ) -> Result<u32, Error> {
        self.free_locked(inner)?;

        let count = (count as usize).min(VIDEO_MAX_FRAME);
        let bsize = page_align(size);
        let geometry = Geometry {
            width: inner.format.width,
            height: inner.format.height,
            bytesperline: inner.format.bytesperline,
            size,
            field: self.config.field(),
            input: inner.format.input,
        };

        let mut granted = 0;
        for i in 0..count {
            let mem = match self.backend.alloc(bsize) {
                Ok(mem) => mem,
                Err(err) if i == 0 => return Err(Error::BackendFailure(err)),
                Err(err) => {
                    log::warn!("allocation stopped at buffer {}: {}", i, err);
                    break;
                }
            };
            let boff = match memory {
                MemoryModel::Mapped => i * bsize,
                _ => 0,
            };
            inner.slots[i] = Some(Slot::new(mem, memory, geometry, bsize, boff));
            granted += 1;
        }

        let mut lists = self.shared.lock();
        for index in 0..granted {
            lists.allocate(index);
        }
        drop(lists);

        inner.queued_since_alloc = false;
        inner.last = Field::Bottom;
        Ok(granted)
    }

    /// Frees every buffer. Fails with `Busy` while any buffer is mapped.
    pub(crate) fn free_locked(&self, inner: &mut Inner<B::Memory>) -> Result<(), Error> {
        if inner.any_mapped() {
            return Err(Error::Busy);
        }
        {
            let mut lists = self.shared.lock();
            lists.cancel();
            lists.clear();
        }
        self.shared.wake_all();

        for (i, entry) in inner.slots.iter_mut().enumerate() {
            if let Some(mut slot) = entry.take() {
                self.policy.buf_release(i as u32);
                if slot.locked {
                    self.backend.unlock(&mut slot.mem);
                }
            }
        }
        inner.mappings.clear();
        inner.cursor = None;
        inner.primed = false;
        Ok(())
    }

    /// Snapshot of one buffer.
    pub fn query(&self, index: u32) -> Result<BufferInfo, Error> {
        let inner = self.lock_inner();
        let slot = inner.slot(index)?;
        let lists = self.shared.lock();
        Ok(snapshot(index, slot, &lists))
    }

    /// Submits a buffer.
    ///
    /// `userptr` is required for `UserPointer` buffers and optional for
    /// `Overlay` buffers, where its address is the framebuffer offset. The
    /// buffer reaches the device right away while streaming, otherwise on
    /// [`Queue::streamon`].
    pub fn qbuf(&self, index: u32, memory: MemoryModel, userptr: Option<UserPtr>) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        if inner.reading {
            return Err(Error::Busy);
        }

        let queueable = {
            let lists = self.shared.lock();
            if lists.state(index).is_none() {
                return Err(Error::InvalidIndex(index));
            }
            lists.is_queueable(index)
        };
        let slot = inner.slot_mut(index)?;
        if slot.memory != memory {
            return Err(Error::InvalidState("memory model does not match allocation"));
        }
        if !queueable {
            return Err(Error::InvalidState("buffer is already queued or not yet dequeued"));
        }

        let previous = (slot.baddr, slot.boff);
        match (memory, userptr) {
            (MemoryModel::UserPointer, None) => {
                return Err(Error::InvalidState("user pointer required"));
            }
            (MemoryModel::UserPointer, Some(ptr)) => {
                if ptr.len < slot.bsize {
                    return Err(Error::InvalidState("user buffer smaller than buffer size"));
                }
                if slot.locked && slot.baddr != Some(ptr.addr) {
                    // previously pinned pages belong to another address
                    self.policy.buf_release(index);
                    self.backend.unlock(&mut slot.mem);
                    slot.locked = false;
                }
                slot.baddr = Some(ptr.addr);
            }
            (MemoryModel::Overlay, Some(ptr)) => slot.boff = ptr.addr,
            _ => {}
        }

        if let Err(err) = self.submit_locked(&mut inner, index) {
            if let Ok(slot) = inner.slot_mut(index) {
                (slot.baddr, slot.boff) = previous;
            }
            return Err(err);
        }
        log::trace!("qbuf {} ({})", index, memory);
        Ok(())
    }

    /// Prepares, locks and queues a buffer the caller has validated.
    pub(crate) fn submit_locked(&self, inner: &mut Inner<B::Memory>, index: u32) -> Result<(), Error> {
        let submit_now = inner.streaming || inner.reading;
        let field = inner.next_field(self.config.field());
        let slot = inner.slot_mut(index)?;

        let mut geometry = slot.geometry;
        geometry.field = field;
        self.policy
            .buf_prepare(index, &mut geometry, field)
            .map_err(Error::PolicyRejected)?;

        if !slot.locked {
            let target = LockTarget {
                memory: slot.memory,
                size: geometry.size,
                bsize: slot.bsize,
                boff: slot.boff,
                baddr: slot.baddr,
            };
            self.backend
                .iolock(&mut slot.mem, &target)
                .map_err(Error::BackendFailure)?;
            slot.locked = true;
        }
        slot.geometry = geometry;

        {
            let mut lists = self.shared.lock();
            lists.set_state(index, BufferState::Queued);
            lists.pending.push_back(index);
        }
        if submit_now {
            self.policy.buf_queue(index, &slot.mem);
        }
        inner.queued_since_alloc = true;
        self.shared.wake_all();
        Ok(())
    }

    /// Waits for a specific buffer to leave the device.
    ///
    /// Returns the buffer state once it is no longer queued or active.
    pub fn waiton(&self, index: u32, nonblocking: bool) -> Result<BufferState, Error> {
        let lists = self.shared.lock();
        if lists.state(index).is_none() {
            return Err(Error::InvalidIndex(index));
        }
        let lists = self
            .shared
            .wait(lists, nonblocking, |lists| !lists.is_in_flight(index))?;
        lists.state(index).ok_or(Error::InvalidIndex(index))
    }

    /// Retrieves the oldest completed buffer.
    ///
    /// The management lock is released while blocking so cancellation can
    /// proceed and release the caller with [`Error::Cancelled`].
    pub fn dqbuf(&self, nonblocking: bool) -> Result<BufferInfo, Error> {
        let mut inner = self.lock_inner();
        loop {
            if inner.reading {
                return Err(Error::Busy);
            }
            let lists = self.shared.lock();
            if !lists.ready.is_empty() {
                return self.dequeue_locked(&mut inner, lists);
            }
            if nonblocking {
                return Err(Error::WouldBlock);
            }
            if lists.pending.is_empty() && !inner.streaming {
                return Err(Error::InvalidState("no buffers queued"));
            }

            drop(inner);
            let lists = self
                .shared
                .wait(lists, false, |lists| !lists.ready.is_empty())?;
            drop(lists);
            inner = self.lock_inner();
        }
    }

    fn dequeue_locked(
        &self,
        inner: &mut Inner<B::Memory>,
        mut lists: MutexGuard<'_, Lists>,
    ) -> Result<BufferInfo, Error> {
        let index = lists
            .ready
            .pop_front()
            .ok_or(Error::InvalidState("ready list empty"))?;
        let slot = inner.slot_mut(index)?;
        let info = snapshot(index, slot, &lists);

        let one_shot = slot.memory == MemoryModel::UserPointer;
        let next = if one_shot {
            BufferState::NeedsInit
        } else {
            BufferState::Prepared
        };
        lists.set_state(index, next);
        drop(lists);

        self.policy.buf_dequeue(index);
        if one_shot && slot.locked {
            self.backend.unlock(&mut slot.mem);
            slot.locked = false;
        }
        log::trace!("dqbuf {} {} seq {}", index, info.state, info.sequence);
        Ok(info)
    }

    /// Starts streaming. Buffers queued so far reach the device in order.
    pub fn streamon(&self) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        if inner.reading {
            return Err(Error::InvalidState("read mode active"));
        }
        if inner.streaming {
            return Err(Error::InvalidState("already streaming"));
        }
        if inner.count() == 0 {
            return Err(Error::InvalidState("no buffers allocated"));
        }
        if !inner.queued_since_alloc {
            return Err(Error::InvalidState("no buffers queued"));
        }

        inner.streaming = true;
        let pending: Vec<u32> = self.shared.lock().pending.iter().copied().collect();
        for &index in &pending {
            if let Ok(slot) = inner.slot(index) {
                self.policy.buf_queue(index, &slot.mem);
            }
        }
        log::debug!("streamon: {} buffers handed to device", pending.len());
        Ok(())
    }

    /// Stops streaming and cancels every buffer. Always succeeds and may be
    /// called any number of times.
    pub fn streamoff(&self) {
        let mut inner = self.lock_inner();
        self.cancel_locked(&mut inner);
        inner.streaming = false;
    }

    /// Ends streaming and read mode.
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        self.cancel_locked(&mut inner);
        inner.streaming = false;
        if inner.reading {
            self.read_stop_locked(&mut inner);
        }
    }

    /// Fails every buffer the device or consumer still holds, parks
    /// undequeued frames as IDLE, empties both lists and releases all
    /// waiters.
    pub(crate) fn cancel_locked(&self, inner: &mut Inner<B::Memory>) {
        let in_flight = self.shared.lock().cancel();
        self.shared.wake_all();

        for &index in &in_flight {
            self.policy.buf_cancel(index);
        }
        for (i, entry) in inner.slots.iter_mut().enumerate() {
            let Some(slot) = entry.as_mut() else {
                continue;
            };
            self.policy.buf_release(i as u32);
            // user pages are pinned per submission, the queue's own read
            // buffers stay locked for reuse
            if slot.locked && slot.memory == MemoryModel::UserPointer && slot.baddr.is_some() {
                self.backend.unlock(&mut slot.mem);
                slot.locked = false;
            }
        }
        inner.cursor = None;
        inner.primed = false;
        if !in_flight.is_empty() {
            log::debug!("cancelled {} in-flight buffers", in_flight.len());
        }
    }

    /// Readiness without blocking: a completed buffer is waiting (streaming)
    /// or the buffer the read paths will serve next has completed.
    pub fn poll_readiness(&self) -> bool {
        let inner = self.lock_inner();
        let lists = self.shared.lock();
        if inner.reading {
            let next = inner.cursor.map(|cursor| cursor.index).or_else(|| lists.oldest());
            return next
                .and_then(|index| lists.state(index))
                .is_some_and(BufferState::is_complete);
        }
        !lists.ready.is_empty()
    }

    /// Copies payload bytes out of a buffer the consumer owns.
    pub fn copy_payload(&self, index: u32, offset: usize, out: &mut [u8]) -> Result<usize, Error> {
        let inner = self.lock_inner();
        let slot = inner.slot(index)?;
        if self.shared.lock().is_in_flight(index) {
            return Err(Error::Busy);
        }
        self.copy_out(slot, offset, out)
    }

    pub(crate) fn copy_out(&self, slot: &Slot<B::Memory>, offset: usize, out: &mut [u8]) -> Result<usize, Error> {
        let size = slot.geometry.size;
        if offset >= size {
            return Ok(0);
        }
        let n = out.len().min(size - offset);
        self.backend.sync(&slot.mem).map_err(Error::BackendFailure)?;
        self.backend
            .read_at(&slot.mem, offset, &mut out[..n])
            .map_err(Error::BackendFailure)
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, Inner<B::Memory>> {
        lock(&self.inner)
    }
}

impl<P, B: MemoryBackend> Drop for Queue<P, B> {
    fn drop(&mut self) {
        // wake anyone still parked on a completer-held reference
        let _ = self.shared.lock().cancel();
        self.shared.wake_all();
    }
}

pub(crate) fn snapshot<M>(index: u32, slot: &Slot<M>, lists: &Lists) -> BufferInfo {
    BufferInfo {
        index,
        state: lists.state(index).unwrap_or(BufferState::NeedsInit),
        memory: slot.memory,
        geometry: slot.geometry,
        bsize: slot.bsize,
        boff: slot.boff,
        baddr: slot.baddr,
        mapped: slot.is_mapped(),
        sequence: lists.sequence(index),
        timestamp: lists.timestamp(index),
    }
}
