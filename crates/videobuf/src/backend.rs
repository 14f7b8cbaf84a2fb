// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError,
    },
};

use crate::{buffer::MemoryModel, lock};

/// What a backend is asked to lock before a buffer is handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTarget {
    pub memory: MemoryModel,
    /// Payload size the device will write.
    pub size: usize,
    /// Allocated size of the buffer.
    pub bsize: usize,
    pub boff: usize,
    /// Consumer address for `UserPointer` buffers, `None` for the queue's
    /// own read buffers.
    pub baddr: Option<usize>,
}

/// Buffer memory provider for one family of memory models.
///
/// The queue core never interprets [`MemoryBackend::Memory`]; it only passes
/// it back to the backend and to the queue policy's submission hook. Every
/// fallible hook returns an [`io::Result`] which the queue reports as
/// [`crate::Error::BackendFailure`].
pub trait MemoryBackend: Send + Sync {
    /// Backend-private payload of one buffer.
    type Memory: Send + Sync;

    /// Allocates the memory behind one buffer slot.
    fn alloc(&self, size: usize) -> io::Result<Self::Memory>;

    /// Copies payload bytes starting at `offset` into `out`.
    fn read_at(&self, mem: &Self::Memory, offset: usize, out: &mut [u8]) -> io::Result<usize>;

    /// Makes the memory usable by the device (pinning user pages, building
    /// scatter lists, ...). Called once until [`MemoryBackend::unlock`].
    fn iolock(&self, mem: &mut Self::Memory, target: &LockTarget) -> io::Result<()>;

    /// Releases whatever [`MemoryBackend::iolock`] acquired.
    fn unlock(&self, _mem: &mut Self::Memory) {}

    /// Makes device writes visible to the host before the payload is read.
    fn sync(&self, _mem: &Self::Memory) -> io::Result<()> {
        Ok(())
    }

    /// Maps consecutive buffers into consumer space. Returns the consumer
    /// address of the first byte.
    fn mmap(&self, mems: &[&Self::Memory], offset: usize, len: usize) -> io::Result<usize>;

    /// Tears down a mapping created by [`MemoryBackend::mmap`].
    fn munmap(&self, _start: usize, _len: usize) {}
}

/// Base of the pretend consumer address space handed out by [`HeapBackend`].
const MAP_BASE: usize = 0x7f00_0000_0000;

struct Block {
    bytes: RwLock<Vec<u8>>,
    budget: Arc<AtomicUsize>,
}

impl Drop for Block {
    fn drop(&mut self) {
        let len = self
            .bytes
            .get_mut()
            .map(|bytes| bytes.len())
            .unwrap_or_else(|err| err.into_inner().len());
        self.budget.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Heap memory behind one buffer.
///
/// Clones share the same bytes, which lets a device thread write into a
/// buffer it was handed by the submission hook.
#[derive(Clone)]
pub struct HeapMemory {
    block: Arc<Block>,
    user: Option<usize>,
}

impl HeapMemory {
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumer address this memory is currently locked to.
    pub fn user_addr(&self) -> Option<usize> {
        self.user
    }

    /// Writes `data` at `offset`, truncated to the buffer length. Returns the
    /// number of bytes written.
    pub fn write(&self, offset: usize, data: &[u8]) -> usize {
        let mut bytes = self.bytes_mut();
        if offset >= bytes.len() {
            return 0;
        }
        let n = data.len().min(bytes.len() - offset);
        bytes[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    /// Runs `f` over the whole buffer with write access.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes_mut())
    }

    /// Copies out up to `out.len()` bytes starting at `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        let bytes = self.bytes();
        if offset >= bytes.len() {
            return 0;
        }
        let n = out.len().min(bytes.len() - offset);
        out[..n].copy_from_slice(&bytes[offset..offset + n]);
        n
    }

    fn bytes(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.block.bytes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn bytes_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.block.bytes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HeapMemory")
            .field("len", &self.len())
            .field("user", &self.user)
            .finish()
    }
}

/// vmalloc-style backend serving every memory model from the heap.
///
/// Mappings are bookkeeping only: [`MemoryBackend::mmap`] hands out addresses
/// in a reserved range and remembers them until they are unmapped, which lets
/// tests observe exactly when the queue releases a mapping.
#[derive(Debug, Default)]
pub struct HeapBackend {
    limit: Option<usize>,
    allocated: Arc<AtomicUsize>,
    maps: Mutex<BTreeMap<usize, usize>>,
    unmapped: AtomicUsize,
}

impl HeapBackend {
    pub fn new() -> Self {
        HeapBackend::default()
    }

    /// Fails allocations once `bytes` are live.
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Bytes currently allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Number of live mappings.
    pub fn mappings(&self) -> usize {
        lock(&self.maps).len()
    }

    /// Number of mappings released so far.
    pub fn unmapped(&self) -> usize {
        self.unmapped.load(Ordering::Acquire)
    }

    fn reserve(&self, size: usize) -> io::Result<()> {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= limit)
            })
            .map(|_| ())
            .map_err(|used| {
                io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("heap limit reached: {} of {} bytes in use", used, limit),
                )
            })
    }
}

impl MemoryBackend for HeapBackend {
    type Memory = HeapMemory;

    fn alloc(&self, size: usize) -> io::Result<HeapMemory> {
        self.reserve(size)?;
        Ok(HeapMemory {
            block: Arc::new(Block {
                bytes: RwLock::new(vec![0; size]),
                budget: Arc::clone(&self.allocated),
            }),
            user: None,
        })
    }

    fn read_at(&self, mem: &HeapMemory, offset: usize, out: &mut [u8]) -> io::Result<usize> {
        Ok(mem.read(offset, out))
    }

    fn iolock(&self, mem: &mut HeapMemory, target: &LockTarget) -> io::Result<()> {
        if target.size > mem.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds buffer of {}", target.size, mem.len()),
            ));
        }
        match (target.memory, target.baddr) {
            (MemoryModel::UserPointer, Some(0)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "null user pointer",
            )),
            (MemoryModel::UserPointer, addr) => {
                mem.user = addr;
                Ok(())
            }
            (MemoryModel::Mapped, _) | (MemoryModel::Overlay, _) => Ok(()),
        }
    }

    fn unlock(&self, mem: &mut HeapMemory) {
        mem.user = None;
    }

    fn mmap(&self, mems: &[&HeapMemory], offset: usize, len: usize) -> io::Result<usize> {
        let total: usize = mems.iter().map(|mem| mem.len()).sum();
        if total < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mapping of {} bytes exceeds {} allocated", len, total),
            ));
        }
        let start = MAP_BASE + offset;
        let mut maps = lock(&self.maps);
        if maps.contains_key(&start) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "offset already mapped",
            ));
        }
        maps.insert(start, len);
        log::debug!("heap map {:#x}+{} ({} buffers)", start, len, mems.len());
        Ok(start)
    }

    fn munmap(&self, start: usize, len: usize) {
        if lock(&self.maps).remove(&start).is_some() {
            self.unmapped.fetch_add(1, Ordering::AcqRel);
            log::debug!("heap unmap {:#x}+{}", start, len);
        } else {
            log::warn!("heap unmap of unknown mapping {:#x}", start);
        }
    }
}
