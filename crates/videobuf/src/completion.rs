// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use unix_ts::Timestamp;

use crate::{buffer::BufferState, lock, Error, VIDEO_MAX_FRAME};

/// Buffer states and list membership, guarded by the completion lock.
#[derive(Debug)]
pub(crate) struct Lists {
    states: Vec<Option<BufferState>>,
    sequence: Vec<u32>,
    timestamps: Vec<Option<Timestamp>>,
    pub(crate) pending: VecDeque<u32>,
    pub(crate) ready: VecDeque<u32>,
    next_sequence: u32,
    pub(crate) epoch: u64,
}

impl Lists {
    fn new() -> Self {
        Lists {
            states: vec![None; VIDEO_MAX_FRAME],
            sequence: vec![0; VIDEO_MAX_FRAME],
            timestamps: vec![None; VIDEO_MAX_FRAME],
            pending: VecDeque::with_capacity(VIDEO_MAX_FRAME),
            ready: VecDeque::with_capacity(VIDEO_MAX_FRAME),
            next_sequence: 0,
            epoch: 0,
        }
    }

    /// State of an allocated buffer, `None` when the slot is empty.
    pub(crate) fn state(&self, index: u32) -> Option<BufferState> {
        self.states.get(index as usize).copied().flatten()
    }

    pub(crate) fn set_state(&mut self, index: u32, state: BufferState) {
        if let Some(slot) = self.states.get_mut(index as usize) {
            *slot = Some(state);
        }
    }

    /// Publishes a freshly allocated slot.
    pub(crate) fn allocate(&mut self, index: u32) {
        let i = index as usize;
        self.states[i] = Some(BufferState::NeedsInit);
        self.sequence[i] = 0;
        self.timestamps[i] = None;
    }

    /// Forgets every slot. Lists must already be empty.
    pub(crate) fn clear(&mut self) {
        self.states.iter_mut().for_each(|state| *state = None);
        self.pending.clear();
        self.ready.clear();
    }

    pub(crate) fn sequence(&self, index: u32) -> u32 {
        self.sequence.get(index as usize).copied().unwrap_or(0)
    }

    pub(crate) fn timestamp(&self, index: u32) -> Option<Timestamp> {
        self.timestamps.get(index as usize).cloned().flatten()
    }

    pub(crate) fn is_in_flight(&self, index: u32) -> bool {
        self.state(index).is_some_and(BufferState::is_in_flight)
    }

    /// True while a completed buffer waits on the ready list.
    pub(crate) fn is_ready(&self, index: u32) -> bool {
        self.ready.contains(&index)
    }

    /// True when the consumer owns the buffer and may submit it. A failed
    /// frame is queueable only once it has been dequeued.
    pub(crate) fn is_queueable(&self, index: u32) -> bool {
        self.state(index).is_some_and(BufferState::is_queueable) && !self.is_ready(index)
    }

    /// Takes a buffer off the ready list if it is there.
    pub(crate) fn take_ready(&mut self, index: u32) {
        self.ready.retain(|&i| i != index);
    }

    /// Oldest buffer handed to the device that the consumer has not taken.
    pub(crate) fn oldest(&self) -> Option<u32> {
        self.ready.front().or(self.pending.front()).copied()
    }

    /// Empties both lists and returns the buffers that were in flight.
    ///
    /// Completed buffers the consumer never dequeued become IDLE, so a
    /// captured frame is dropped but not reported as failed. Every other
    /// buffer that is not already IDLE ends in ERROR. A second call finds
    /// the ready list empty and leaves every state as it is.
    pub(crate) fn cancel(&mut self) -> Vec<u32> {
        let in_flight = self.pending.drain(..).collect();
        for index in std::mem::take(&mut self.ready) {
            self.set_state(index, BufferState::Idle);
        }
        self.states
            .iter_mut()
            .flatten()
            .filter(|state| **state != BufferState::Idle)
            .for_each(|state| *state = BufferState::Error);
        self.epoch = self.epoch.wrapping_add(1);
        in_flight
    }
}

/// State shared between a queue and its completers.
#[derive(Debug)]
pub(crate) struct Shared {
    lists: Mutex<Lists>,
    done: Condvar,
    interrupted: Arc<AtomicBool>,
    wait_interval: Duration,
}

impl Shared {
    pub(crate) fn new(wait_interval: Duration) -> Self {
        Shared {
            lists: Mutex::new(Lists::new()),
            done: Condvar::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            wait_interval,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Lists> {
        lock(&self.lists)
    }

    pub(crate) fn wake_all(&self) {
        self.done.notify_all();
    }

    pub(crate) fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Waits on the completion condition until `ready` holds.
    ///
    /// Fails with `WouldBlock` when `nonblocking` is set and the condition
    /// does not hold yet, `Cancelled` when the queue is cancelled while
    /// waiting and `Interrupted` once the interrupt flag is raised. The flag
    /// is polled every `wait_interval` so a signal handler that only stores
    /// to the flag still releases the waiter.
    pub(crate) fn wait<'a, F>(
        &'a self,
        mut guard: MutexGuard<'a, Lists>,
        nonblocking: bool,
        mut ready: F,
    ) -> Result<MutexGuard<'a, Lists>, Error>
    where
        F: FnMut(&Lists) -> bool,
    {
        let epoch = guard.epoch;
        loop {
            if ready(&guard) {
                return Ok(guard);
            }
            if nonblocking {
                return Err(Error::WouldBlock);
            }
            if guard.epoch != epoch {
                return Err(Error::Cancelled);
            }
            if self.interrupted.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            guard = self
                .done
                .wait_timeout(guard, self.wait_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Handle used by the device side to report buffer progress.
///
/// A completer only ever takes the completion lock, so it can be driven from
/// a capture thread or any interrupt-like context while consumers hold the
/// queue's management lock. Completing a buffer moves it from the pending
/// list to the tail of the ready list, stamps it with the next sequence
/// number and the current time, and wakes every waiter.
#[derive(Debug, Clone)]
pub struct Completer {
    shared: Arc<Shared>,
}

impl Completer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Completer { shared }
    }

    /// Marks a queued buffer as being filled.
    pub fn start(&self, index: u32) -> Result<(), Error> {
        let mut lists = self.shared.lock();
        match lists.state(index) {
            Some(BufferState::Queued) => {
                lists.set_state(index, BufferState::Active);
                log::trace!("buffer {} active", index);
                Ok(())
            }
            Some(_) => Err(Error::InvalidState("buffer is not queued")),
            None => Err(Error::InvalidIndex(index)),
        }
    }

    /// Reports a good frame. Returns the sequence number it was given.
    pub fn complete(&self, index: u32) -> Result<u32, Error> {
        self.finish(index, BufferState::Done)
    }

    /// Reports a bad frame; the consumer sees the buffer in ERROR.
    pub fn fail(&self, index: u32) -> Result<u32, Error> {
        self.finish(index, BufferState::Error)
    }

    /// Buffers the device currently owns, oldest first.
    pub fn pending(&self) -> Vec<u32> {
        self.shared.lock().pending.iter().copied().collect()
    }

    /// Completed buffers waiting to be dequeued, in delivery order.
    pub fn ready(&self) -> Vec<u32> {
        self.shared.lock().ready.iter().copied().collect()
    }

    fn finish(&self, index: u32, state: BufferState) -> Result<u32, Error> {
        let sequence = {
            let mut lists = self.shared.lock();
            match lists.state(index) {
                Some(current) if current.is_in_flight() => {}
                Some(_) => return Err(Error::InvalidState("buffer is not in flight")),
                None => return Err(Error::InvalidIndex(index)),
            }

            lists.pending.retain(|&i| i != index);
            lists.ready.push_back(index);
            lists.set_state(index, state);

            let i = index as usize;
            let sequence = lists.next_sequence;
            lists.next_sequence = sequence.wrapping_add(1);
            lists.sequence[i] = sequence;
            lists.timestamps[i] = Some(now());
            sequence
        };
        self.shared.wake_all();

        if state == BufferState::Error {
            log::warn!("buffer {} completed with error (seq {})", index, sequence);
        } else {
            log::trace!("buffer {} done (seq {})", index, sequence);
        }
        Ok(sequence)
    }
}

/// Wall-clock completion time.
fn now() -> Timestamp {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp::new(since.as_secs() as i64, since.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Instant};

    fn shared() -> Arc<Shared> {
        Arc::new(Shared::new(Duration::from_millis(5)))
    }

    fn queue_buffer(shared: &Shared, index: u32) {
        let mut lists = shared.lock();
        lists.allocate(index);
        lists.set_state(index, BufferState::Queued);
        lists.pending.push_back(index);
    }

    #[test]
    fn test_complete_moves_to_ready() {
        let shared = shared();
        queue_buffer(&shared, 0);
        queue_buffer(&shared, 1);
        let completer = Completer::new(Arc::clone(&shared));

        completer.start(1).unwrap();
        assert_eq!(completer.complete(1).unwrap(), 0);
        assert_eq!(completer.fail(0).unwrap(), 1);

        let lists = shared.lock();
        assert!(lists.pending.is_empty());
        assert_eq!(lists.ready, VecDeque::from(vec![1, 0]));
        assert_eq!(lists.state(1), Some(BufferState::Done));
        assert_eq!(lists.state(0), Some(BufferState::Error));
        assert!(lists.timestamp(1).is_some());
    }

    #[test]
    fn test_complete_rejects_idle_buffer() {
        let shared = shared();
        shared.lock().allocate(3);
        let completer = Completer::new(Arc::clone(&shared));
        assert!(matches!(completer.complete(3), Err(Error::InvalidState(_))));
        assert!(matches!(completer.start(3), Err(Error::InvalidState(_))));
        assert!(matches!(completer.complete(9), Err(Error::InvalidIndex(9))));
    }

    #[test]
    fn test_wait_nonblocking() {
        let shared = shared();
        let guard = shared.lock();
        let result = shared.wait(guard, true, |lists| !lists.ready.is_empty());
        assert!(matches!(result, Err(Error::WouldBlock)));
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let shared = shared();
        queue_buffer(&shared, 0);
        let completer = Completer::new(Arc::clone(&shared));
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(0).unwrap();
        });
        let guard = shared.lock();
        let guard = shared
            .wait(guard, false, |lists| !lists.ready.is_empty())
            .unwrap();
        assert_eq!(guard.ready.front(), Some(&0));
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_cancelled() {
        let shared = shared();
        let waker = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.lock().cancel();
            waker.wake_all();
        });
        let guard = shared.lock();
        let result = shared.wait(guard, false, |lists| !lists.ready.is_empty());
        assert!(matches!(result, Err(Error::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_interrupted() {
        let shared = shared();
        let flag = shared.interrupt_flag();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            // no notify: the waiter must notice the flag on its own
            flag.store(true, Ordering::Release);
        });
        let guard = shared.lock();
        let result = shared.wait(guard, false, |lists| !lists.ready.is_empty());
        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let shared = shared();
        queue_buffer(&shared, 0);
        queue_buffer(&shared, 1);
        let mut lists = shared.lock();
        assert_eq!(lists.cancel(), vec![0, 1]);
        let states: Vec<_> = (0..2).map(|i| lists.state(i)).collect();
        assert!(lists.cancel().is_empty());
        let again: Vec<_> = (0..2).map(|i| lists.state(i)).collect();
        assert_eq!(states, again);
        assert_eq!(lists.state(0), Some(BufferState::Error));
    }

    #[test]
    fn test_cancel_parks_undequeued_frames() {
        let shared = shared();
        for index in 0..3 {
            queue_buffer(&shared, index);
        }
        let completer = Completer::new(Arc::clone(&shared));
        completer.complete(0).unwrap();
        completer.fail(1).unwrap();

        let mut lists = shared.lock();
        assert_eq!(lists.cancel(), vec![2]);
        assert!(lists.ready.is_empty());
        assert_eq!(lists.state(0), Some(BufferState::Idle));
        assert_eq!(lists.state(1), Some(BufferState::Idle));
        assert_eq!(lists.state(2), Some(BufferState::Error));

        lists.cancel();
        assert_eq!(lists.state(0), Some(BufferState::Idle));
        assert_eq!(lists.state(2), Some(BufferState::Error));
    }

    #[test]
    fn test_failed_frame_queueable_after_dequeue() {
        let shared = shared();
        queue_buffer(&shared, 0);
        Completer::new(Arc::clone(&shared)).fail(0).unwrap();

        let mut lists = shared.lock();
        assert_eq!(lists.state(0), Some(BufferState::Error));
        assert!(lists.is_ready(0));
        assert!(!lists.is_queueable(0));

        lists.take_ready(0);
        assert!(lists.is_queueable(0));
    }
}
