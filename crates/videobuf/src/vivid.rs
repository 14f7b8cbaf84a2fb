// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    backend::{HeapBackend, HeapMemory},
    buffer::{Field, Geometry},
    completion::Completer,
    fourcc::FourCC,
    lock,
    policy::QueuePolicy,
    VIDEO_MAX_FRAME,
};

/// How long an idle capture thread waits before looking for buffers again.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Configuration of a [`VirtualDevice`].
///
/// ```
/// use videobuf::fourcc::FourCC;
/// use videobuf::vivid::DeviceConfig;
///
/// let config = DeviceConfig::default()
///     .with_resolution(320, 240)
///     .with_format(FourCC::RGB3)
///     .with_fps(60);
/// assert_eq!(config.frame_size(), 320 * 240 * 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    width: u32,
    height: u32,
    format: FourCC,
    fps: u32,
    min_buffers: u32,
    error_every: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            width: 640,
            height: 480,
            format: FourCC::YUYV,
            fps: 30,
            min_buffers: 2,
            error_every: 0,
        }
    }
}

impl DeviceConfig {
    pub fn with_resolution(self, width: u32, height: u32) -> Self {
        DeviceConfig {
            width,
            height,
            ..self
        }
    }

    pub fn with_format(self, format: FourCC) -> Self {
        DeviceConfig { format, ..self }
    }

    /// Frame rate; 0 produces frames as fast as buffers are queued.
    pub fn with_fps(self, fps: u32) -> Self {
        DeviceConfig { fps, ..self }
    }

    /// Smallest buffer count the device accepts.
    pub fn with_min_buffers(self, min_buffers: u32) -> Self {
        DeviceConfig {
            min_buffers,
            ..self
        }
    }

    /// Flags every n-th frame as bad, 0 never.
    pub fn with_error_every(self, error_every: u64) -> Self {
        DeviceConfig {
            error_every,
            ..self
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> FourCC {
        self.format
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn min_buffers(&self) -> u32 {
        self.min_buffers
    }

    pub fn error_every(&self) -> u64 {
        self.error_every
    }

    /// Stride of one line, 2 bytes per pixel for unknown formats.
    pub fn bytesperline(&self) -> u32 {
        self.format
            .bytesperline(self.width)
            .unwrap_or(self.width.saturating_mul(2))
    }

    /// Payload size of one full frame.
    pub fn frame_size(&self) -> usize {
        self.format
            .frame_size(self.width, self.height)
            .unwrap_or(self.bytesperline() as usize * self.height as usize)
    }

    /// Time between two frames.
    pub fn frame_interval(&self) -> Duration {
        match self.fps {
            0 => Duration::ZERO,
            fps => Duration::from_secs(1) / fps,
        }
    }
}

/// Simulated capture device.
///
/// Buffers handed over by the queue are kept in submission order; each
/// [`VirtualDevice::capture`] fills the oldest one with a test pattern and
/// completes it the way an interrupt handler would. The first eight bytes of
/// every frame carry the device frame counter, little endian.
#[derive(Debug)]
pub struct VirtualDevice {
    config: DeviceConfig,
    active: Mutex<VecDeque<(u32, HeapMemory)>>,
    frames: AtomicU64,
}

impl VirtualDevice {
    pub fn new(config: DeviceConfig) -> Self {
        VirtualDevice {
            config,
            active: Mutex::new(VecDeque::new()),
            frames: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Frames produced so far, good or bad.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Buffers currently held by the device.
    pub fn queued(&self) -> Vec<u32> {
        lock(&self.active).iter().map(|(index, _)| *index).collect()
    }

    /// Fills and completes the oldest buffer the device holds. Returns its
    /// index, or `None` when the device holds no buffer.
    pub fn capture(&self, completer: &Completer) -> Option<u32> {
        let (index, memory) = lock(&self.active).pop_front()?;
        if let Err(err) = completer.start(index) {
            // cancelled between submission and capture
            log::debug!("vivid: buffer {} no longer queued: {}", index, err);
            return None;
        }

        let frame = self.frames.fetch_add(1, Ordering::AcqRel);
        let bad = self.config.error_every > 0 && (frame + 1) % self.config.error_every == 0;
        let result = if bad {
            completer.fail(index)
        } else {
            render(&memory, frame, self.config.bytesperline() as usize);
            completer.complete(index)
        };
        match result {
            Ok(_) => Some(index),
            Err(err) => {
                log::debug!("vivid: completing buffer {} failed: {}", index, err);
                None
            }
        }
    }

    /// Runs the device on its own thread until the returned handle is
    /// stopped or dropped.
    pub fn spawn(self: &Arc<Self>, completer: Completer) -> CaptureThread {
        let device = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let interval = device.config.frame_interval();
            let mut captured = 0u64;
            while !flag.load(Ordering::Acquire) {
                if device.capture(&completer).is_some() {
                    captured += 1;
                    thread::sleep(interval);
                } else {
                    thread::sleep(IDLE_POLL);
                }
            }
            captured
        });
        log::debug!(
            "vivid: capturing {}x{} {} at {} fps",
            self.config.width,
            self.config.height,
            self.config.format,
            self.config.fps
        );
        CaptureThread {
            stop,
            handle: Some(handle),
        }
    }
}

fn render(memory: &HeapMemory, frame: u64, stride: usize) {
    memory.with_bytes(|bytes| {
        for (i, byte) in bytes.iter_mut().enumerate() {
            let (row, column) = match stride {
                0 => (0, i),
                stride => (i / stride, i % stride),
            };
            *byte = (column / 8 + row) as u8 ^ frame as u8;
        }
        let header = frame.to_le_bytes();
        let n = header.len().min(bytes.len());
        bytes[..n].copy_from_slice(&header[..n]);
    });
}

impl QueuePolicy<HeapBackend> for VirtualDevice {
    fn buf_setup(&self, count: u32, _size: usize) -> io::Result<(u32, usize)> {
        let size = self.config.frame_size();
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty frame format"));
        }
        let count = count.max(self.config.min_buffers).min(VIDEO_MAX_FRAME as u32);
        Ok((count, size))
    }

    fn buf_prepare(&self, _index: u32, geometry: &mut Geometry, field: Field) -> io::Result<()> {
        let full = self.config.frame_size();
        if full == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty frame format"));
        }
        geometry.width = self.config.width;
        geometry.bytesperline = geometry.bytesperline.max(self.config.bytesperline());
        match field {
            // single field: half the lines
            Field::Top | Field::Bottom => {
                geometry.height = self.config.height / 2;
                geometry.size = full / 2;
            }
            _ => {
                geometry.height = self.config.height;
                geometry.size = full;
            }
        }
        geometry.field = field;
        Ok(())
    }

    fn buf_queue(&self, index: u32, memory: &HeapMemory) {
        lock(&self.active).push_back((index, memory.clone()));
    }

    fn buf_release(&self, index: u32) {
        lock(&self.active).retain(|(i, _)| *i != index);
    }

    fn buf_cancel(&self, index: u32) {
        log::trace!("vivid: cancel buffer {}", index);
        self.buf_release(index);
    }
}

/// Handle of a running [`VirtualDevice`] capture thread.
#[derive(Debug)]
pub struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl CaptureThread {
    /// Stops capturing and returns the number of frames the thread produced.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.stop.store(true, Ordering::Release);
        let captured = self
            .handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(0);
        log::debug!("vivid: capture stopped after {} frames", captured);
        captured
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}
