//! Runtime stats for a session: periodic progress lines while samples flow,
//! and a summary of rate and contents once it ends.

use std::time::{Duration, Instant};

use tracing::info;

use crate::{buffer::SampleBuffer, Sample};

/// How often (in samples) progress is reported
pub const REPORT_EVERY: usize = 100;

#[derive(Debug)]
pub struct Progress {
    label: &'static str,
    target: Option<usize>,
    count: usize,
    started: Instant,
}

impl Progress {
    pub fn new(label: &'static str, target: Option<usize>) -> Self {
        Self {
            label,
            target,
            count: 0,
            started: Instant::now(),
        }
    }

    /// Count one sample, logging every [`REPORT_EVERY`]th
    pub fn record(&mut self, latest: Sample) {
        self.count += 1;
        if self.count % REPORT_EVERY == 0 {
            match self.target {
                Some(target) => info!(
                    "{} {}/{} samples, latest value: {}",
                    self.label, self.count, target, latest
                ),
                None => info!("{} {} samples, latest value: {}", self.label, self.count, latest),
            }
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.started = Instant::now();
    }

    /// Log the closing statistics
    pub fn finish(&self) {
        let elapsed = self.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            self.count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        info!(
            "{} {} samples in {:.3} s ({:.1} samples/s)",
            self.label,
            self.count,
            elapsed.as_secs_f64(),
            rate
        );
    }
}

/// Log what a collector ended up holding
pub fn summarize(buffer: &SampleBuffer) {
    info!("Received {} total samples", buffer.len());
    for (i, value) in buffer.first(5).iter().enumerate() {
        info!("  {}: value={}", i + 1, value);
    }
    if let Some((min, max)) = buffer.range() {
        info!("Value range: {} to {}", min, max);
    }
}
