//! Upload progress: rate, ETA and a throttle so the event bus only sees
//! meaningful steps.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Minimum gap between two reported samples, unless the percentage moved a lot
const REPORT_INTERVAL: Duration = Duration::from_millis(250);
const REPORT_PERCENT_STEP: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// Average rate since the tracker started
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    /// 0-100; an empty archive counts as done
    pub percent_complete: f64,
}

impl TransferProgress {
    fn at(total_bytes: u64, transferred_bytes: u64) -> Self {
        let percent_complete = match total_bytes {
            0 => 100.0,
            total => (transferred_bytes.min(total) as f64 * 100.0) / total as f64,
        };
        Self {
            total_bytes,
            transferred_bytes,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

/// Turns raw byte offsets from the upload stream into throttled samples.
///
/// A resumed upload starts at a non-zero offset; the rate only counts bytes
/// sent since the first sample.
pub struct ProgressTracker {
    total_bytes: u64,
    started: Instant,
    baseline: Option<u64>,
    last_report: Option<(Instant, f64)>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            started: Instant::now(),
            baseline: None,
            last_report: None,
        }
    }

    /// Compute the sample for `sent` bytes without touching the throttle.
    pub fn sample(&mut self, sent: u64) -> TransferProgress {
        let baseline = *self.baseline.get_or_insert(sent);
        let mut progress = TransferProgress::at(self.total_bytes, sent);

        let secs = self.started.elapsed().as_secs_f64();
        let moved = sent.saturating_sub(baseline);
        if secs > 0.0 && moved > 0 {
            progress.bytes_per_second = (moved as f64 / secs) as u64;
        }
        if progress.bytes_per_second > 0 {
            progress.eta_seconds =
                self.total_bytes.saturating_sub(sent) / progress.bytes_per_second;
        }
        progress
    }

    /// Sample and return it if it is worth publishing. The first and the
    /// final sample always are.
    pub fn record(&mut self, sent: u64) -> Option<TransferProgress> {
        let progress = self.sample(sent);
        let now = Instant::now();

        let due = match self.last_report {
            None => true,
            Some(_) if progress.is_complete() => true,
            Some((at, percent)) => {
                now.duration_since(at) >= REPORT_INTERVAL
                    || progress.percent_complete - percent >= REPORT_PERCENT_STEP
            }
        };
        if !due {
            return None;
        }
        self.last_report = Some((now, progress.percent_complete));
        Some(progress)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const STEPS: [(u64, &str); 4] = [
        (1 << 40, "TB"),
        (1 << 30, "GB"),
        (1 << 20, "MB"),
        (1 << 10, "KB"),
    ];
    STEPS
        .iter()
        .find(|(scale, _)| bytes >= *scale)
        .map(|(scale, unit)| format!("{:.1} {}", bytes as f64 / *scale as f64, unit))
        .unwrap_or_else(|| format!("{bytes} B"))
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m {s}s"),
        _ => format!("{h}h {m}m"),
    }
}
