// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    backend::MemoryBackend,
    buffer::MemoryModel,
    policy::QueuePolicy,
    queue::{Queue, PAGE_SIZE, VIDEO_MAX_FRAME},
    Error,
};

/// Consumer-visible mapping covering one or more consecutive buffers.
///
/// The queue holds the only strong reference; buffers point back through a
/// `Weak`, so dropping the record is enough for every covered buffer to
/// forget it.
#[derive(Debug)]
pub struct Mapping {
    id: u64,
    start: usize,
    len: usize,
    offset: usize,
    first: u32,
    buffers: u32,
    refs: AtomicU32,
}

impl Mapping {
    pub(crate) fn new(id: u64, start: usize, len: usize, offset: usize, first: u32, buffers: u32) -> Self {
        Mapping {
            id,
            start,
            len,
            offset,
            first,
            buffers,
            refs: AtomicU32::new(buffers),
        }
    }

    /// Remaining references.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last consumer address.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn buffers(&self) -> Range<u32> {
        self.first..self.first + self.buffers
    }

    /// Drops one reference, returns how many remain.
    fn release(&self) -> u32 {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn region(&self, owner: usize) -> Region {
        Region {
            owner,
            id: self.id,
            start: self.start,
            len: self.len,
            offset: self.offset,
            first: self.first,
            buffers: self.buffers,
        }
    }
}

/// Handle returned to the consumer by [`Queue::mmap_setup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    owner: usize,
    id: u64,
    start: usize,
    len: usize,
    offset: usize,
    first: u32,
    buffers: u32,
}

impl Region {
    /// Consumer address of the first mapped byte.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset the region was requested at.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Indices of the buffers the region covers.
    pub fn buffers(&self) -> Range<u32> {
        self.first..self.first + self.buffers
    }
}

impl<P, B> Queue<P, B>
where
    P: QueuePolicy<B>,
    B: MemoryBackend,
{
    /// Maps the buffers starting at `offset` into consumer space.
    ///
    /// `offset` must be the offset of a `Mapped` buffer and `length` must
    /// cover whole buffers exactly. A single region may span the entire pool
    /// or a single buffer.
    pub fn mmap_setup(&self, offset: usize, length: usize) -> Result<Region, Error> {
        let mut inner = self.lock_inner();
        if inner.streaming || inner.reading {
            return Err(Error::InvalidState("cannot map while streaming or reading"));
        }

        let first = (0..VIDEO_MAX_FRAME)
            .find(|&i| {
                inner.slots[i]
                    .as_ref()
                    .is_some_and(|slot| slot.memory == MemoryModel::Mapped && slot.boff == offset)
            })
            .ok_or(Error::InvalidIndex((offset / PAGE_SIZE) as u32))?;

        let mut covered = 0;
        let mut last = first;
        for i in first..VIDEO_MAX_FRAME {
            let Some(slot) = inner.slots[i].as_ref() else {
                break;
            };
            if slot.memory != MemoryModel::Mapped {
                break;
            }
            if slot.is_mapped() {
                return Err(Error::Busy);
            }
            covered += slot.bsize;
            last = i;
            if covered >= length {
                break;
            }
        }
        if length == 0 || covered != length {
            return Err(Error::InvalidState("length does not cover whole buffers"));
        }

        let start = {
            let mems: Vec<&B::Memory> = inner.slots[first..=last]
                .iter()
                .flatten()
                .map(|slot| &slot.mem)
                .collect();
            self.backend()
                .mmap(&mems, offset, length)
                .map_err(Error::BackendFailure)?
        };

        let id = inner.next_map_id;
        inner.next_map_id += 1;
        let buffers = (last - first + 1) as u32;
        let mapping = Arc::new(Mapping::new(id, start, length, offset, first as u32, buffers));
        for slot in inner.slots[first..=last].iter_mut().flatten() {
            slot.map = Some(Arc::downgrade(&mapping));
        }
        inner.mappings.push(Arc::clone(&mapping));

        log::debug!(
            "mmap: buffers {}..={} at {:#x}, {} bytes",
            first,
            last,
            start,
            length
        );
        Ok(mapping.region(self.owner_token()))
    }

    /// Drops one reference to a mapping. Returns true when this released the
    /// mapping and its memory.
    pub fn unmap(&self, region: &Region) -> Result<bool, Error> {
        let mut inner = self.lock_inner();
        if region.owner != self.owner_token() {
            return Err(Error::InvalidState("mapping belongs to another queue"));
        }
        let position = inner
            .mappings
            .iter()
            .position(|mapping| mapping.id == region.id)
            .ok_or(Error::InvalidState("unknown mapping"))?;
        let mapping = Arc::clone(&inner.mappings[position]);

        {
            let lists = self.shared.lock();
            if mapping.buffers().any(|index| lists.is_in_flight(index)) {
                return Err(Error::Busy);
            }
        }

        let remaining = mapping.release();
        if remaining > 0 {
            log::trace!("unmap {:#x}: {} references left", mapping.start(), remaining);
            return Ok(false);
        }

        inner.mappings.remove(position);
        for index in mapping.buffers() {
            if let Ok(slot) = inner.slot_mut(index) {
                slot.map = None;
            }
        }
        self.backend().munmap(mapping.start(), mapping.end() - mapping.start());
        log::debug!("unmap {:#x}: released", mapping.start());
        Ok(true)
    }

    /// Identifies this queue in the regions it hands out.
    fn owner_token(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Live mappings of this queue.
    pub fn mappings(&self) -> Vec<Arc<Mapping>> {
        self.lock_inner().mappings.clone()
    }
}
