// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::utils;
use clap::Args as ClapArgs;
use serde::Serialize;
use videobuf::vivid::DeviceConfig;
use videobuf::{QueueConfig, PAGE_SIZE, VIDEO_MAX_FRAME};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Resolution in WxH format
    #[arg(short, long, default_value = "640x480")]
    resolution: String,

    /// Pixel format FOURCC
    #[arg(long, default_value = "YUYV")]
    format: String,

    /// Device frame rate
    #[arg(short = 'F', long, default_value = "30")]
    fps: u32,
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    version: String,
    queue: QueueLimits,
    device: DeviceInfo,
}

#[derive(Debug, Serialize)]
struct QueueLimits {
    max_buffers: usize,
    page_size: usize,
    read_ahead: usize,
    wait_interval_ms: u64,
}

#[derive(Debug, Serialize)]
struct DeviceInfo {
    width: u32,
    height: u32,
    format: String,
    fps: u32,
    bytesperline: u32,
    frame_size: usize,
    buffer_size: usize,
    min_buffers: u32,
}

impl From<&DeviceConfig> for DeviceInfo {
    fn from(config: &DeviceConfig) -> Self {
        let frame_size = config.frame_size();
        DeviceInfo {
            width: config.width(),
            height: config.height(),
            format: config.format().to_string(),
            fps: config.fps(),
            bytesperline: config.bytesperline(),
            frame_size,
            buffer_size: (frame_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1),
            min_buffers: config.min_buffers(),
        }
    }
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing info command: {:?}", args);

    let (width, height) = utils::parse_resolution(&args.resolution)?;
    let device = DeviceConfig::default()
        .with_resolution(width, height)
        .with_format(utils::parse_fourcc(&args.format)?)
        .with_fps(args.fps);
    let queue = QueueConfig::default();

    let info = SystemInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue: QueueLimits {
            max_buffers: VIDEO_MAX_FRAME,
            page_size: PAGE_SIZE,
            read_ahead: queue.read_ahead(),
            wait_interval_ms: queue.wait_interval().as_millis() as u64,
        },
        device: DeviceInfo::from(&device),
    };

    if json {
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| CliError::General(format!("Failed to serialize JSON: {}", e)))?;
        println!("{}", json);
    } else {
        print_text(&info);
    }

    Ok(())
}

fn print_text(info: &SystemInfo) {
    println!("videobuf {}", info.version);
    println!("\n=== Queue ===");
    println!("Max buffers:       {}", info.queue.max_buffers);
    println!("Page size:         {} bytes", info.queue.page_size);
    println!("Read-ahead:        {}", info.queue.read_ahead);
    println!("Wait interval:     {} ms", info.queue.wait_interval_ms);
    println!("\n=== Virtual Device ===");
    println!(
        "Format:            {}x{} {} @ {} fps",
        info.device.width, info.device.height, info.device.format, info.device.fps
    );
    println!("Bytes per line:    {}", info.device.bytesperline);
    println!("Frame size:        {} bytes", info.device.frame_size);
    println!("Buffer size:       {} bytes", info.device.buffer_size);
    println!("Min buffers:       {}", info.device.min_buffers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use videobuf::fourcc::FourCC;

    #[test]
    fn test_device_info_rounds_buffer_to_pages() {
        let config = DeviceConfig::default()
            .with_resolution(100, 1)
            .with_format(FourCC::GREY);
        let info = DeviceInfo::from(&config);
        assert_eq!(info.frame_size, 100);
        assert_eq!(info.buffer_size, PAGE_SIZE);
        assert_eq!(info.format, "GREY");
    }
}
