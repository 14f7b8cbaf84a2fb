// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use serde::Serialize;
use std::time::{Duration, Instant};

/// Performance metrics collected during capture
#[derive(Debug, Clone, Serialize)]
pub struct FrameMetrics {
    /// Good frames delivered to the consumer
    pub frames_processed: u64,
    /// Frames the device flagged as bad
    pub error_frames: u64,
    /// Total payload bytes delivered
    pub bytes_processed: u64,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Average throughput in frames per second
    pub throughput_fps: f64,
    /// Average bandwidth in megabits per second
    pub bandwidth_mbps: f64,
    /// Shortest wait for a frame in microseconds
    pub wait_min_us: u64,
    /// Longest wait for a frame in microseconds
    pub wait_max_us: u64,
    /// Median wait for a frame in microseconds
    pub wait_p50_us: u64,
    /// 95th percentile wait in microseconds
    pub wait_p95_us: u64,
    /// Sequence numbers skipped between delivered frames
    pub dropped_frames: u64,
}

/// Metrics collector for tracking dequeue performance
pub struct MetricsCollector {
    start_time: Instant,
    waits_us: Vec<u64>,
    frames: u64,
    error_frames: u64,
    bytes: u64,
    prev_sequence: Option<u32>,
    dropped_frames: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            waits_us: Vec::new(),
            frames: 0,
            error_frames: 0,
            bytes: 0,
            prev_sequence: None,
            dropped_frames: 0,
        }
    }

    /// Record a good frame and how long the consumer waited for it
    pub fn record_frame(&mut self, bytes: u64, wait: Duration) {
        self.frames += 1;
        self.bytes += bytes;
        self.waits_us.push(wait.as_micros() as u64);
    }

    /// Record a frame the device flagged as bad
    pub fn record_error(&mut self) {
        self.error_frames += 1;
    }

    /// Record bytes delivered outside whole frames (read mode)
    pub fn record_bytes(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    /// Track the completion sequence to detect drops
    /// Returns the number of dropped frames detected (0 or N)
    pub fn track_sequence(&mut self, sequence: u32) -> u64 {
        let drops = match self.prev_sequence {
            Some(prev) if sequence > prev => (sequence - prev - 1) as u64,
            Some(prev) => {
                // a restarted stream counts from zero again
                log::warn!("Frame sequence decreased: {} -> {}", prev, sequence);
                0
            }
            None => 0,
        };

        self.dropped_frames += drops;
        self.prev_sequence = Some(sequence);
        drops
    }

    /// Finalize and calculate all metrics
    pub fn finalize(&mut self) -> FrameMetrics {
        let duration = self.start_time.elapsed();
        let duration_secs = duration.as_secs_f64();

        let throughput_fps = if duration_secs > 0.0 {
            self.frames as f64 / duration_secs
        } else {
            0.0
        };
        let bandwidth_mbps = if duration_secs > 0.0 {
            (self.bytes as f64 * 8.0) / (duration_secs * 1_000_000.0)
        } else {
            0.0
        };

        self.waits_us.sort_unstable();

        FrameMetrics {
            frames_processed: self.frames,
            error_frames: self.error_frames,
            bytes_processed: self.bytes,
            duration_ms: duration.as_millis() as u64,
            throughput_fps,
            bandwidth_mbps,
            wait_min_us: self.waits_us.first().copied().unwrap_or(0),
            wait_max_us: self.waits_us.last().copied().unwrap_or(0),
            wait_p50_us: self.percentile(50.0),
            wait_p95_us: self.percentile(95.0),
            dropped_frames: self.dropped_frames,
        }
    }

    /// Calculate percentile from sorted wait data
    fn percentile(&self, p: f64) -> u64 {
        if self.waits_us.is_empty() {
            return 0;
        }

        let len = self.waits_us.len();
        let idx = ((p / 100.0) * (len - 1) as f64).round() as usize;
        self.waits_us[idx.min(len - 1)]
    }

    /// Print metrics in human-readable format
    pub fn print_text(&mut self) {
        let metrics = self.finalize();
        println!("\n=== Capture Metrics ===");
        println!("Frames processed:  {}", metrics.frames_processed);
        println!(
            "Bytes processed:   {} ({:.2} MB)",
            metrics.bytes_processed,
            metrics.bytes_processed as f64 / 1_048_576.0
        );
        println!(
            "Duration:          {:.2} s",
            metrics.duration_ms as f64 / 1000.0
        );
        println!("Throughput:        {:.2} fps", metrics.throughput_fps);
        println!("Bandwidth:         {:.2} Mbps", metrics.bandwidth_mbps);

        if metrics.frames_processed > 0 {
            println!("\nWait Statistics (µs):");
            println!("  Min:    {}", metrics.wait_min_us);
            println!("  Max:    {}", metrics.wait_max_us);
            println!("  P50:    {}", metrics.wait_p50_us);
            println!("  P95:    {}", metrics.wait_p95_us);
        }

        if metrics.error_frames > 0 {
            println!("\nError frames:      {}", metrics.error_frames);
        }
        if metrics.dropped_frames > 0 {
            println!("Dropped frames:    {}", metrics.dropped_frames);
        }
    }

    /// Print metrics in JSON format
    pub fn print_json(&mut self) -> Result<(), serde_json::Error> {
        let metrics = self.finalize();
        let json = serde_json::to_string_pretty(&metrics)?;
        println!("{}", json);
        Ok(())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_calculation() {
        let mut collector = MetricsCollector::new();

        for i in 0..=10 {
            collector.record_frame(100, Duration::from_micros(i * 10));
        }

        let metrics = collector.finalize();
        assert_eq!(metrics.frames_processed, 11);
        assert_eq!(metrics.bytes_processed, 1100);
        assert_eq!(metrics.wait_p50_us, 50);
        assert_eq!(metrics.wait_p95_us, 100);
        assert_eq!(metrics.wait_min_us, 0);
        assert_eq!(metrics.wait_max_us, 100);
    }

    #[test]
    fn test_dropped_frames_detection() {
        let mut collector = MetricsCollector::new();

        assert_eq!(collector.track_sequence(0), 0);
        assert_eq!(collector.track_sequence(1), 0);
        assert_eq!(collector.track_sequence(5), 3);
        assert_eq!(collector.track_sequence(6), 0);
        assert_eq!(collector.dropped_frames, 3);

        // restart
        assert_eq!(collector.track_sequence(0), 0);
        assert_eq!(collector.dropped_frames, 3);
    }

    #[test]
    fn test_error_frames_are_not_processed_frames() {
        let mut collector = MetricsCollector::new();
        collector.record_frame(10, Duration::ZERO);
        collector.record_error();
        collector.record_error();

        let metrics = collector.finalize();
        assert_eq!(metrics.frames_processed, 1);
        assert_eq!(metrics.error_frames, 2);
    }

    #[test]
    fn test_empty_metrics() {
        let mut collector = MetricsCollector::new();
        let metrics = collector.finalize();

        assert_eq!(metrics.frames_processed, 0);
        assert_eq!(metrics.bytes_processed, 0);
        assert_eq!(metrics.wait_min_us, 0);
        assert_eq!(metrics.wait_max_us, 0);
    }
}
