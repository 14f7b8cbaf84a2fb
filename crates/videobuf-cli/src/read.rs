// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::MetricsCollector;
use crate::utils::{self, DeviceArgs};
use clap::Args as ClapArgs;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use videobuf::QueueConfig;

#[derive(ClapArgs, Debug)]
pub struct Args {
    #[command(flatten)]
    device: DeviceArgs,

    /// Read continuously with read-ahead instead of one frame per call
    #[arg(short, long)]
    stream: bool,

    /// Bytes per read call (0 = one frame)
    #[arg(short, long, default_value = "0")]
    chunk: usize,

    /// Buffers kept queued ahead of the reader in stream mode
    #[arg(long, default_value = "1")]
    read_ahead: usize,

    /// Stamp the frame counter into the last 4 bytes of each frame
    #[arg(long)]
    vbi_counter: bool,

    /// Number of frames to read (0=unlimited)
    #[arg(short, long, default_value = "30")]
    frames: u64,

    /// Print performance metrics on exit
    #[arg(long)]
    metrics: bool,
}

/// Outcome of one read call.
enum Chunk {
    Bytes(usize),
    Failed(u32),
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::info!(
        "Starting {} read capture",
        if args.stream { "streaming" } else { "single frame" }
    );
    log::debug!("Read parameters: {:?}", args);

    let config = QueueConfig::default()
        .with_read_ahead(args.read_ahead)
        .with_vbi_counter(args.vbi_counter);
    let (device, queue) = utils::open(args.device.device_config()?, config);
    let interrupt = queue.interrupt_flag();
    utils::install_signal_handler(queue.interrupt_flag())?;

    let frame_size = device.config().frame_size();
    let chunk = if args.chunk == 0 { frame_size } else { args.chunk };
    let mut buf = vec![0u8; chunk];
    let timeout = utils::timeout(args.device.timeout);
    let max_frames = if args.frames == 0 {
        u64::MAX
    } else {
        args.frames
    };

    let capture = device.spawn(queue.completer());
    let mut metrics = MetricsCollector::new();
    // bytes of the frame currently being read and the time spent on it
    let mut partial = 0usize;
    let mut waited = Duration::ZERO;
    let mut frames = 0u64;

    let mut result = Ok(());
    while frames < max_frames && !interrupt.load(Ordering::Relaxed) {
        let started = Instant::now();
        let outcome = utils::wait_for(timeout, &interrupt, |nonblocking| {
            let read = if args.stream {
                queue.read_stream(&mut buf, nonblocking)
            } else {
                queue.read_one(&mut buf, nonblocking)
            };
            match read {
                Ok(n) => Ok(Chunk::Bytes(n)),
                Err(videobuf::Error::FrameFailed(index)) => Ok(Chunk::Failed(index)),
                Err(err) => Err(err),
            }
        });
        waited += started.elapsed();

        let n = match outcome {
            Ok(Chunk::Bytes(n)) => n,
            Ok(Chunk::Failed(index)) => {
                log::warn!("Buffer {} returned a bad frame", index);
                metrics.record_error();
                frames += 1;
                partial = 0;
                continue;
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        };

        if args.vbi_counter && partial == 0 && n % frame_size == 0 {
            for frame in buf[..n].chunks(frame_size) {
                if let Some(counter) = frame_counter(frame) {
                    metrics.track_sequence(counter);
                }
            }
        }

        partial += n;
        while partial >= frame_size {
            metrics.record_frame(frame_size as u64, waited);
            waited = Duration::ZERO;
            partial -= frame_size;
            frames += 1;
        }
        log::trace!("Read {} bytes, {} frames so far", n, frames);
    }

    capture.stop();
    queue.read_stop();
    if partial > 0 {
        metrics.record_bytes(partial as u64);
    }
    log::info!("Read {} frames total", frames);

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

/// Counter stamped into the last four bytes of a frame, little endian.
fn frame_counter(frame: &[u8]) -> Option<u32> {
    let tail = frame.len().checked_sub(4)?;
    let bytes: [u8; 4] = frame[tail..].try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}
