// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use clap::Args as ClapArgs;
use signal_hook::consts::SIGINT;
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use videobuf::backend::HeapBackend;
use videobuf::buffer::UserPtr;
use videobuf::fourcc::FourCC;
use videobuf::queue::Format;
use videobuf::vivid::{DeviceConfig, VirtualDevice};
use videobuf::{Queue, QueueConfig, PAGE_SIZE};

/// Queue driven by the virtual capture device.
pub type CaptureQueue = Queue<Arc<VirtualDevice>, HeapBackend>;

/// How often a bounded wait polls for a frame.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Base of the pretend consumer addresses handed out for user-pointer
/// buffers.
const USERPTR_BASE: usize = 0x5500_0000_0000;

/// Virtual device options shared by the capture commands
#[derive(ClapArgs, Debug)]
pub struct DeviceArgs {
    /// Resolution in WxH format
    #[arg(short, long, default_value = "640x480")]
    pub resolution: String,

    /// Pixel format FOURCC
    #[arg(long, default_value = "YUYV")]
    pub format: String,

    /// Device frame rate (0 = as fast as buffers are queued)
    #[arg(short = 'F', long, default_value = "30")]
    pub fps: u32,

    /// Flag every N-th frame as bad (0 = never)
    #[arg(long, default_value = "0")]
    pub error_every: u64,

    /// Give up when no frame arrives within this many milliseconds (0 = wait forever)
    #[arg(long, default_value = "2000")]
    pub timeout: u64,
}

impl DeviceArgs {
    pub fn device_config(&self) -> Result<DeviceConfig, CliError> {
        let (width, height) = parse_resolution(&self.resolution)?;
        let format = parse_fourcc(&self.format)?;
        log::debug!("Device: {}x{} {} at {} fps", width, height, format, self.fps);
        Ok(DeviceConfig::default()
            .with_resolution(width, height)
            .with_format(format)
            .with_fps(self.fps)
            .with_error_every(self.error_every))
    }
}

/// Creates the virtual device and a queue whose format follows it.
pub fn open(device: DeviceConfig, config: QueueConfig) -> (Arc<VirtualDevice>, CaptureQueue) {
    let format = Format::new(device.width(), device.height(), device.bytesperline());
    let device = Arc::new(VirtualDevice::new(device));
    let queue = Queue::new(config.with_format(format), Arc::clone(&device), HeapBackend::new());
    (device, queue)
}

/// Runs a queue operation under an optional time limit.
///
/// Without a limit the operation blocks (`attempt(false)`). With one it is
/// retried non-blocking until it yields something other than `WouldBlock`,
/// the limit passes or `interrupt` is raised.
pub fn wait_for<T>(
    timeout: Option<Duration>,
    interrupt: &AtomicBool,
    mut attempt: impl FnMut(bool) -> Result<T, videobuf::Error>,
) -> Result<T, CliError> {
    let Some(timeout) = timeout else {
        return Ok(attempt(false)?);
    };

    let deadline = Instant::now() + timeout;
    loop {
        match attempt(true) {
            Err(videobuf::Error::WouldBlock) => {
                if interrupt.load(Ordering::Relaxed) {
                    return Err(CliError::Interrupted);
                }
                if Instant::now() >= deadline {
                    return Err(CliError::Timeout(format!(
                        "no frame within {} ms",
                        timeout.as_millis()
                    )));
                }
                thread::sleep(POLL_INTERVAL);
            }
            result => return Ok(result?),
        }
    }
}

/// Parse resolution string in format "WxH" or "W*H"
pub fn parse_resolution(s: &str) -> Result<(u32, u32), CliError> {
    let (width_str, height_str) = s
        .split_once('x')
        .or_else(|| s.split_once('*'))
        .ok_or_else(|| {
            CliError::InvalidArgs(format!(
                "Invalid resolution format (expected WxH or W*H): {}",
                s
            ))
        })?;

    let width = width_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid width in resolution: {}", s)))?;
    let height = height_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid height in resolution: {}", s)))?;

    if width == 0 || height == 0 {
        return Err(CliError::InvalidArgs(format!(
            "Resolution dimensions must be positive: {}",
            s
        )));
    }

    Ok((width, height))
}

/// Parse a FOURCC the virtual device can render.
pub fn parse_fourcc(s: &str) -> Result<FourCC, CliError> {
    let fourcc: FourCC = s
        .parse()
        .map_err(|e| CliError::InvalidArgs(format!("{}", e)))?;
    if fourcc.bytes_per_pixel().is_none() {
        return Err(CliError::InvalidArgs(format!(
            "Unsupported pixel format: {}",
            fourcc
        )));
    }
    Ok(fourcc)
}

/// Consumer buffer for user-pointer streaming. Every index gets its own
/// page-aligned range of `len` bytes.
pub fn user_pointer(index: u32, len: usize) -> UserPtr {
    let stride = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    UserPtr::new(USERPTR_BASE + index as usize * stride, len)
}

/// Wait budget for one frame, `None` waits forever.
pub fn timeout(ms: u64) -> Option<Duration> {
    match ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

/// Install signal handler for graceful shutdown on Ctrl+C
///
/// Registers SIGINT against the queue's interrupt flag so blocking waits
/// return `Interrupted` as soon as the signal arrives.
pub fn install_signal_handler(interrupt: Arc<AtomicBool>) -> Result<(), CliError> {
    flag::register(SIGINT, interrupt)
        .map_err(|e| CliError::General(format!("Failed to register signal handler: {}", e)))?;

    log::debug!("Installed SIGINT handler");
    Ok(())
}
