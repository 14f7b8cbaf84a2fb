// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! videobuf: Video Capture Buffer-Queue Core for Rust
//!
//! A reusable engine that manages a fixed pool of frame buffers shared between
//! a capture device, which fills buffers from an interrupt-like completion
//! path, and a consumer that retrieves them through explicit queue/dequeue
//! streaming or through a byte-oriented read fallback.
//!
//! The core never touches hardware. Device specifics come in through a
//! [`policy::QueuePolicy`] and buffer memory through a
//! [`backend::MemoryBackend`]; the queue owns the buffer state machine, the
//! pending and ready lists and the mapping bookkeeping in between.
//!
//! # Quick Start
//!
//! ## Streaming (queue/dequeue)
//!
//! ```no_run
//! use videobuf::backend::HeapBackend;
//! use videobuf::buffer::MemoryModel;
//! use videobuf::queue::{Queue, QueueConfig};
//! use videobuf::vivid::{DeviceConfig, VirtualDevice};
//! use std::sync::Arc;
//!
//! let device = Arc::new(VirtualDevice::new(DeviceConfig::default()));
//! let queue = Queue::new(QueueConfig::default(), Arc::clone(&device), HeapBackend::new());
//!
//! let count = queue.reqbufs(4, MemoryModel::Mapped)?;
//! for index in 0..count {
//!     queue.qbuf(index, MemoryModel::Mapped, None)?;
//! }
//! queue.streamon()?;
//!
//! let capture = device.spawn(queue.completer());
//! let info = queue.dqbuf(false)?;
//! println!("frame {} from buffer {}", info.sequence, info.index);
//! capture.stop();
//! queue.streamoff();
//! # Ok::<(), videobuf::Error>(())
//! ```
//!
//! ## Read mode
//!
//! ```no_run
//! # use videobuf::backend::HeapBackend;
//! # use videobuf::queue::{Queue, QueueConfig};
//! # use videobuf::vivid::{DeviceConfig, VirtualDevice};
//! # use std::sync::Arc;
//! # let device = Arc::new(VirtualDevice::new(DeviceConfig::default()));
//! # let queue = Queue::new(QueueConfig::default(), Arc::clone(&device), HeapBackend::new());
//! let capture = device.spawn(queue.completer());
//! let mut frame = vec![0u8; device.config().frame_size()];
//! let n = queue.read_stream(&mut frame, false)?;
//! println!("read {} bytes", n);
//! capture.stop();
//! queue.read_stop();
//! # Ok::<(), videobuf::Error>(())
//! ```
//!
//! # Locking
//!
//! Every queue carries two synchronisation domains. A management mutex
//! serialises structural operations (allocation, submission, streaming
//! control, mapping). A completion mutex with a condition variable protects
//! buffer states and the pending/ready lists; the completion path reaches
//! only this one through a [`completion::Completer`]. Blocking calls release
//! the management lock while they wait so cancellation can always proceed.

use std::{
    error, fmt, io,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Error type for queue operations
#[derive(Debug)]
pub enum Error {
    /// Buffer index out of range or not allocated
    InvalidIndex(u32),

    /// Operation not legal for the current mode or buffer state
    InvalidState(&'static str),

    /// Structural change requested while streaming, reading or mapped
    Busy,

    /// Non-blocking call found nothing to return
    WouldBlock,

    /// Blocking call aborted through the queue's interrupt flag
    Interrupted,

    /// Blocking call released because the queue was cancelled
    Cancelled,

    /// Allocation, locking, sync or mapping failure from the memory backend
    BackendFailure(io::Error),

    /// Device-specific refusal from the queue policy
    PolicyRejected(io::Error),

    /// The device flagged the frame in this buffer as bad
    FrameFailed(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidIndex(index) => write!(f, "invalid buffer index {}", index),
            Error::InvalidState(reason) => write!(f, "invalid state: {}", reason),
            Error::Busy => write!(f, "queue is busy"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Interrupted => write!(f, "wait interrupted"),
            Error::Cancelled => write!(f, "queue cancelled while waiting"),
            Error::BackendFailure(err) => write!(f, "memory backend failure: {}", err),
            Error::PolicyRejected(err) => write!(f, "rejected by queue policy: {}", err),
            Error::FrameFailed(index) => write!(f, "device reported a bad frame in buffer {}", index),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::BackendFailure(err) => Some(err),
            Error::PolicyRejected(err) => Some(err),
            _ => None,
        }
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Queue state stays consistent across a panicking policy hook because every
/// transition is completed before hooks are invoked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The buffer module provides the buffer slot types and state machine.
pub mod buffer;

/// The backend module provides the buffer memory backend interface and the
/// heap backend.
pub mod backend;

/// The policy module provides the device-specific queue policy interface.
pub mod policy;

/// The completion module provides the interrupt-side completion path and the
/// shared wait primitive.
pub mod completion;

/// The mapping module provides consumer mapping records.
pub mod mapping;

/// The queue module provides the queue core.
pub mod queue;

mod read;

/// The vivid module provides a virtual capture device.
pub mod vivid;

/// The fourcc module provides portable handling of fourcc codes.
pub mod fourcc;

pub use queue::{Queue, QueueConfig, PAGE_SIZE, VIDEO_MAX_FRAME};

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", Error::InvalidIndex(7)),
            "invalid buffer index 7"
        );
        assert_eq!(
            format!("{}", Error::InvalidState("already streaming")),
            "invalid state: already streaming"
        );
        assert_eq!(format!("{}", Error::Busy), "queue is busy");
    }

    #[test]
    fn test_error_source() {
        let err = Error::BackendFailure(io::Error::from(io::ErrorKind::OutOfMemory));
        assert!(err.source().is_some());
        assert!(Error::WouldBlock.source().is_none());
    }

    #[test]
    fn test_lock_recovers_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let clone = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 1);
    }
}
