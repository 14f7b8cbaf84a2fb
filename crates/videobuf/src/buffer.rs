// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{fmt, sync::Weak};
use unix_ts::Timestamp;

use crate::mapping::Mapping;

/// Lifecycle state of a buffer slot.
///
/// Buffers move `NeedsInit -> Prepared -> Queued -> Active -> Done` and are
/// then dequeued and re-queued. `Error` is reached when the device flags a
/// bad frame or the queue is cancelled while the buffer is held. A
/// cancellation parks completed buffers nobody dequeued as `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Allocated but not yet prepared for the current format.
    NeedsInit,
    /// Prepared and owned by the consumer.
    Prepared,
    /// Waiting for the device on the pending list.
    Queued,
    /// Being filled by the device.
    Active,
    /// Filled by the device, waiting on the ready list.
    Done,
    /// Device or cancellation failure.
    Error,
    /// Allocated and unused; a completed frame dropped by a cancellation.
    Idle,
}

impl BufferState {
    pub fn name(&self) -> &'static str {
        match self {
            BufferState::NeedsInit => "needs-init",
            BufferState::Prepared => "prepared",
            BufferState::Queued => "queued",
            BufferState::Active => "active",
            BufferState::Done => "done",
            BufferState::Error => "error",
            BufferState::Idle => "idle",
        }
    }

    /// True while the device owns the buffer memory.
    pub fn is_in_flight(self) -> bool {
        matches!(self, BufferState::Queued | BufferState::Active)
    }

    /// True once the device has finished with the buffer, good frame or not.
    pub fn is_complete(self) -> bool {
        matches!(self, BufferState::Done | BufferState::Error)
    }

    /// States a consumer may submit from.
    pub fn is_queueable(self) -> bool {
        matches!(
            self,
            BufferState::NeedsInit
                | BufferState::Prepared
                | BufferState::Idle
                | BufferState::Error
        )
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Field order of a frame.
///
/// `Alternate` used as the queue's field policy means every submitted buffer
/// carries a single field, alternating `Top` and `Bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Field {
    /// Progressive frame.
    #[default]
    None,
    Top,
    Bottom,
    /// Both fields interleaved line by line.
    Interlaced,
    /// Top field stored first, then bottom.
    SeqTb,
    /// Bottom field stored first, then top.
    SeqBt,
    Alternate,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Field::None => "none",
            Field::Top => "top",
            Field::Bottom => "bottom",
            Field::Interlaced => "interlaced",
            Field::SeqTb => "seq-tb",
            Field::SeqBt => "seq-bt",
            Field::Alternate => "alternate",
        };
        f.write_str(name)
    }
}

/// Memory model of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryModel {
    /// Memory allocated by the queue and mapped into the consumer.
    ///
    /// Provides zero-copy access; buffer offsets are assigned at allocation.
    Mapped,

    /// Memory supplied by the consumer for each submission.
    ///
    /// The consumer passes an address and length with every `qbuf`, and the
    /// backend locks that range until the buffer is dequeued.
    UserPointer,

    /// Frames written directly into a framebuffer region.
    Overlay,
}

impl fmt::Display for MemoryModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryModel::Mapped => write!(f, "MMAP"),
            MemoryModel::UserPointer => write!(f, "USERPTR"),
            MemoryModel::Overlay => write!(f, "OVERLAY"),
        }
    }
}

/// Buffer type tag of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufType {
    #[default]
    VideoCapture,
    VideoOutput,
    VideoOverlay,
    VbiCapture,
    VbiOutput,
}

impl fmt::Display for BufType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BufType::VideoCapture => "video-capture",
            BufType::VideoOutput => "video-output",
            BufType::VideoOverlay => "video-overlay",
            BufType::VbiCapture => "vbi-capture",
            BufType::VbiOutput => "vbi-output",
        };
        f.write_str(name)
    }
}

/// Consumer-supplied memory for a `UserPointer` submission, or the
/// framebuffer offset of an `Overlay` submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserPtr {
    pub addr: usize,
    pub len: usize,
}

impl UserPtr {
    pub fn new(addr: usize, len: usize) -> Self {
        UserPtr { addr, len }
    }
}

/// Frame geometry of a buffer.
///
/// Copied from the queue format at allocation and refined by the policy's
/// prepare hook on every submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    /// Stride override, 0 lets the policy compute it.
    pub bytesperline: u32,
    /// Payload size in bytes.
    pub size: usize,
    pub field: Field,
    pub input: Option<u32>,
}

/// Snapshot of one buffer, as reported by `query` and `dqbuf`.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub index: u32,
    pub state: BufferState,
    pub memory: MemoryModel,
    pub geometry: Geometry,
    /// Mapped size, page aligned.
    pub bsize: usize,
    /// Offset inside the queue's mapping space.
    pub boff: usize,
    /// Consumer address of a `UserPointer` buffer.
    pub baddr: Option<usize>,
    pub mapped: bool,
    pub sequence: u32,
    pub timestamp: Option<Timestamp>,
}

impl BufferInfo {
    pub fn is_done(&self) -> bool {
        self.state == BufferState::Done
    }
}

/// One slot of the queue arena. Everything here is guarded by the
/// management lock; state and list membership live in the completion lists.
pub(crate) struct Slot<M> {
    pub(crate) geometry: Geometry,
    pub(crate) memory: MemoryModel,
    pub(crate) bsize: usize,
    pub(crate) boff: usize,
    pub(crate) baddr: Option<usize>,
    pub(crate) map: Option<Weak<Mapping>>,
    pub(crate) locked: bool,
    pub(crate) mem: M,
}

impl<M> Slot<M> {
    pub(crate) fn new(mem: M, memory: MemoryModel, geometry: Geometry, bsize: usize, boff: usize) -> Self {
        Slot {
            geometry,
            memory,
            bsize,
            boff,
            baddr: None,
            map: None,
            locked: false,
            mem,
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.map.as_ref().is_some_and(|map| map.strong_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classes() {
        let all = [
            BufferState::NeedsInit,
            BufferState::Prepared,
            BufferState::Queued,
            BufferState::Active,
            BufferState::Done,
            BufferState::Error,
            BufferState::Idle,
        ];
        for state in all {
            // a state belongs to at most one of the three classes, except
            // Error which is both complete and re-queueable
            if state.is_in_flight() {
                assert!(!state.is_complete() && !state.is_queueable());
            }
        }
        assert!(BufferState::Error.is_complete());
        assert!(BufferState::Error.is_queueable());
        assert!(!BufferState::Done.is_queueable());
        assert!(BufferState::Active.is_in_flight());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MemoryModel::Mapped), "MMAP");
        assert_eq!(format!("{}", MemoryModel::UserPointer), "USERPTR");
        assert_eq!(format!("{}", BufferState::NeedsInit), "needs-init");
        assert_eq!(format!("{}", Field::SeqTb), "seq-tb");
        assert_eq!(format!("{}", BufType::default()), "video-capture");
    }

    #[test]
    fn test_slot_mapping_is_weak() {
        let mut slot = Slot::new((), MemoryModel::Mapped, Geometry::default(), 4096, 0);
        assert!(!slot.is_mapped());
        let mapping = std::sync::Arc::new(Mapping::new(1, 0x1000, 4096, 0, 0, 1));
        slot.map = Some(std::sync::Arc::downgrade(&mapping));
        assert!(slot.is_mapped());
        drop(mapping);
        assert!(!slot.is_mapped());
    }
}
