// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::MetricsCollector;
use crate::utils::{self, CaptureQueue, DeviceArgs};
use clap::{Args as ClapArgs, ValueEnum};
use std::sync::atomic::Ordering;
use std::time::Instant;
use videobuf::buffer::{BufferState, MemoryModel};
use videobuf::mapping::Region;
use videobuf::QueueConfig;

#[derive(ClapArgs, Debug)]
pub struct Args {
    #[command(flatten)]
    device: DeviceArgs,

    /// Number of buffers to request
    #[arg(short, long, default_value = "4")]
    buffers: u32,

    /// Buffer memory model
    #[arg(short, long, value_enum, default_value = "mmap")]
    memory: Memory,

    /// Number of frames to dequeue (0=unlimited)
    #[arg(short, long, default_value = "100")]
    frames: u64,

    /// Print performance metrics on exit
    #[arg(long)]
    metrics: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Memory {
    /// Buffers owned by the queue and mapped into the consumer
    Mmap,
    /// Consumer-supplied memory, resubmitted with every enqueue
    Userptr,
}

impl From<Memory> for MemoryModel {
    fn from(memory: Memory) -> Self {
        match memory {
            Memory::Mmap => MemoryModel::Mapped,
            Memory::Userptr => MemoryModel::UserPointer,
        }
    }
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::info!("Starting {:?} streaming capture", args.memory);
    log::debug!("Stream parameters: {:?}", args);

    if args.buffers == 0 {
        return Err(CliError::InvalidArgs(
            "at least one buffer is required".to_string(),
        ));
    }

    let (device, queue) = utils::open(args.device.device_config()?, QueueConfig::default());
    let interrupt = queue.interrupt_flag();
    utils::install_signal_handler(queue.interrupt_flag())?;

    let memory = MemoryModel::from(args.memory);
    let count = queue.reqbufs(args.buffers, memory)?;
    log::info!("Allocated {} of {} {} buffers", count, args.buffers, memory);

    let regions = match memory {
        MemoryModel::Mapped => map_buffers(&queue, count)?,
        _ => Vec::new(),
    };
    for index in 0..count {
        enqueue(&queue, index, memory)?;
    }
    queue.streamon()?;
    let capture = device.spawn(queue.completer());

    let mut metrics = MetricsCollector::new();
    let max_frames = if args.frames == 0 {
        u64::MAX
    } else {
        args.frames
    };
    let timeout = utils::timeout(args.device.timeout);

    log::info!(
        "Streaming {} frames (Ctrl+C to stop)...",
        if max_frames == u64::MAX {
            "unlimited".to_string()
        } else {
            max_frames.to_string()
        }
    );

    let mut result = Ok(());
    let mut dequeued = 0u64;
    while dequeued < max_frames && !interrupt.load(Ordering::Relaxed) {
        let started = Instant::now();
        let info = match utils::wait_for(timeout, &interrupt, |nonblocking| {
            queue.dqbuf(nonblocking)
        }) {
            Ok(info) => info,
            Err(err) => {
                result = Err(err);
                break;
            }
        };
        dequeued += 1;

        if info.state == BufferState::Error {
            log::warn!("Buffer {} returned a bad frame (seq {})", info.index, info.sequence);
            metrics.record_error();
        } else {
            metrics.record_frame(info.geometry.size as u64, started.elapsed());
        }
        let drops = metrics.track_sequence(info.sequence);
        if drops > 0 {
            log::debug!("{} frames dropped before seq {}", drops, info.sequence);
        }
        log::trace!("Frame seq {} in buffer {}", info.sequence, info.index);

        if let Err(err) = enqueue(&queue, info.index, memory) {
            result = Err(err);
            break;
        }

        if dequeued % 30 == 0 {
            log::debug!("Dequeued {} frames", dequeued);
        }
    }

    let produced = capture.stop();
    queue.streamoff();
    for region in &regions {
        queue.unmap(region)?;
    }
    queue.reqbufs(0, memory)?;
    log::info!(
        "Dequeued {} frames total, device produced {}",
        dequeued,
        produced
    );

    let interrupted =
        interrupt.load(Ordering::Relaxed) || matches!(result, Err(CliError::Interrupted));
    if interrupted {
        log::info!("Received Ctrl+C, stopping...");
    }

    if json {
        metrics
            .print_json()
            .map_err(|e| CliError::General(format!("Failed to output JSON metrics: {}", e)))?;
    } else if args.metrics {
        metrics.print_text();
    }

    if interrupted {
        return Err(CliError::Interrupted);
    }
    result
}

/// Maps every buffer through its own region.
fn map_buffers(queue: &CaptureQueue, count: u32) -> Result<Vec<Region>, CliError> {
    let mut regions = Vec::with_capacity(count as usize);
    for index in 0..count {
        let info = queue.query(index)?;
        let region = queue.mmap_setup(info.boff, info.bsize)?;
        log::debug!(
            "Buffer {} mapped at {:#x} ({} bytes)",
            index,
            region.start(),
            region.len()
        );
        regions.push(region);
    }
    Ok(regions)
}

fn enqueue(queue: &CaptureQueue, index: u32, memory: MemoryModel) -> Result<(), CliError> {
    let userptr = match memory {
        MemoryModel::UserPointer => Some(utils::user_pointer(index, queue.query(index)?.bsize)),
        _ => None,
    };
    queue.qbuf(index, memory, userptr)?;
    Ok(())
}
