use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receives progress notifications synchronously.
///
/// `done` and `total` are bytes for single-object transfers and entry counts
/// for directory passes; `label` is the remote key or relative path.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, done: u64, total: u64, label: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64, &str) + Send + Sync,
{
    fn on_progress(&self, done: u64, total: u64, label: &str) {
        self(done, total, label)
    }
}

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Measures transfer speed over a sliding window and for the whole run.
pub struct TransferMeter {
    inner: Mutex<MeterInner>,
}

struct MeterInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
    started_at: Instant,
    total_bytes: u64,
}

impl Default for TransferMeter {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl TransferMeter {
    /// Creates a new meter.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
                started_at: Instant::now(),
                total_bytes: 0,
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.total_bytes += bytes;
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        let cutoff = now.checked_sub(s.window_size).unwrap_or(s.started_at);
        s.samples.retain(|sample| sample.timestamp >= cutoff);

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Bytes recorded since the meter was created.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.lock().unwrap().started_at.elapsed()
    }

    /// Whole-run throughput in MB/s.
    pub fn average_mb_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_bytes() as f64 / (1024.0 * 1024.0) / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn closure_is_a_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let sink: Arc<dyn ProgressSink> = Arc::new(move |done: u64, total: u64, label: &str| {
            seen_cb.lock().unwrap().push((done, total, label.to_string()));
        });
        sink.on_progress(10, 100, "a/b.bin");
        sink.on_progress(100, 100, "a/b.bin");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (100, 100, "a/b.bin".to_string()));
    }

    #[test]
    fn meter_no_samples() {
        let meter = TransferMeter::default();
        assert_eq!(meter.bytes_per_second(), 0.0);
        assert!(meter.eta(1000).is_none());
        assert_eq!(meter.total_bytes(), 0);
    }

    #[test]
    fn meter_single_sample() {
        let meter = TransferMeter::default();
        meter.add_sample(1000);
        assert_eq!(meter.bytes_per_second(), 0.0);
        assert_eq!(meter.total_bytes(), 1000);
    }

    #[test]
    fn meter_multiple_samples() {
        let meter = TransferMeter::new(Some(Duration::from_secs(10)), None);
        meter.add_sample(1000);
        std::thread::sleep(Duration::from_millis(50));
        meter.add_sample(1000);
        let speed = meter.bytes_per_second();
        assert!(speed > 0.0, "speed should be positive, got {speed}");
        assert!(meter.eta(10_000).is_some());
    }

    #[test]
    fn meter_max_samples_keeps_total() {
        let meter = TransferMeter::new(None, Some(5));
        for _ in 0..10 {
            meter.add_sample(100);
        }
        assert_eq!(meter.inner.lock().unwrap().samples.len(), 5);
        assert_eq!(meter.total_bytes(), 1000);
    }

    #[test]
    fn meter_concurrent_access() {
        let meter = Arc::new(TransferMeter::default());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = Arc::clone(&meter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.add_sample(10);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(meter.total_bytes(), 10_000);
    }
}
