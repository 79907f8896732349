//! In-process counters, gauges and histograms, with anomaly callbacks.
//!
//! Constructed once at startup and passed by reference; no global state.
//! Counters are lock-free; histograms and the anomaly window sit behind a
//! mutex since they are touched at most once per unit or write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::warn;

const ANOMALY_WINDOW: usize = 100;

type AnomalyCallback = Box<dyn Fn(&Anomaly) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub rate: f64,
    pub window: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    ApiFailureRate,
}

/// Fixed-bucket histogram: counts per upper bound plus sum/count.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: Vec<f64>) -> Self {
        let counts = vec![0; bounds.len() + 1];
        Self {
            bounds,
            counts,
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.counts[slot] += 1;
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn buckets(&self) -> impl Iterator<Item = (Option<f64>, u64)> + '_ {
        self.bounds
            .iter()
            .map(|b| Some(*b))
            .chain(std::iter::once(None))
            .zip(self.counts.iter().copied())
    }
}

struct AnomalyState {
    recent_api_results: VecDeque<bool>,
    /// Latched while above threshold so a sustained failure storm fires the
    /// callback once, not per call.
    failure_alert_active: bool,
}

pub struct PipelineMetrics {
    // Counters
    files_processed: AtomicU64,
    files_failed: AtomicU64,
    units_created: AtomicU64,
    api_calls: AtomicU64,
    api_failures: AtomicU64,

    // Gauges
    queue_depth: AtomicI64,
    memory_mb: AtomicU64,

    // Histograms
    unit_processing_duration_s: Mutex<Histogram>,
    db_write_latency_ms: Mutex<Histogram>,

    failure_rate_threshold: f64,
    anomaly_state: Mutex<AnomalyState>,
    callbacks: Mutex<Vec<AnomalyCallback>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl PipelineMetrics {
    pub fn new(failure_rate_threshold: f64) -> Self {
        Self {
            files_processed: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            units_created: AtomicU64::new(0),
            api_calls: AtomicU64::new(0),
            api_failures: AtomicU64::new(0),
            queue_depth: AtomicI64::new(0),
            memory_mb: AtomicU64::new(0),
            unit_processing_duration_s: Mutex::new(Histogram::new(vec![
                1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
            ])),
            db_write_latency_ms: Mutex::new(Histogram::new(vec![
                5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
            ])),
            failure_rate_threshold,
            anomaly_state: Mutex::new(AnomalyState {
                recent_api_results: VecDeque::with_capacity(ANOMALY_WINDOW),
                failure_alert_active: false,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn on_anomaly(&self, callback: impl Fn(&Anomaly) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("metrics mutex poisoned")
            .push(Box::new(callback));
    }

    // -- counters --

    pub fn file_processed(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn units_created(&self, count: u64) {
        self.units_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn api_call(&self, ok: bool) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.api_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.track_api_result(ok);
    }

    // -- gauges --

    pub fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_memory_mb(&self, mb: u64) {
        self.memory_mb.store(mb, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    // -- histograms --

    pub fn observe_unit_duration_s(&self, seconds: f64) {
        self.unit_processing_duration_s
            .lock()
            .expect("metrics mutex poisoned")
            .observe(seconds);
    }

    pub fn observe_db_write_ms(&self, millis: f64) {
        self.db_write_latency_ms
            .lock()
            .expect("metrics mutex poisoned")
            .observe(millis);
    }

    // -- snapshot --

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            units_created: self.units_created.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            api_failures: self.api_failures.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            memory_mb: self.memory_mb.load(Ordering::Relaxed),
            unit_duration_mean_s: self
                .unit_processing_duration_s
                .lock()
                .expect("metrics mutex poisoned")
                .mean(),
            db_write_mean_ms: self
                .db_write_latency_ms
                .lock()
                .expect("metrics mutex poisoned")
                .mean(),
        }
    }

    fn track_api_result(&self, ok: bool) {
        let anomaly = {
            let mut state = self.anomaly_state.lock().expect("metrics mutex poisoned");
            if state.recent_api_results.len() == ANOMALY_WINDOW {
                state.recent_api_results.pop_front();
            }
            state.recent_api_results.push_back(ok);

            if state.recent_api_results.len() < ANOMALY_WINDOW {
                None
            } else {
                let failures = state.recent_api_results.iter().filter(|r| !**r).count();
                let rate = failures as f64 / ANOMALY_WINDOW as f64;
                if rate > self.failure_rate_threshold {
                    if state.failure_alert_active {
                        None
                    } else {
                        state.failure_alert_active = true;
                        Some(Anomaly {
                            kind: AnomalyKind::ApiFailureRate,
                            rate,
                            window: ANOMALY_WINDOW,
                        })
                    }
                } else {
                    state.failure_alert_active = false;
                    None
                }
            }
        };

        if let Some(anomaly) = anomaly {
            warn!(
                rate = anomaly.rate,
                window = anomaly.window,
                "API failure rate anomaly"
            );
            for callback in self
                .callbacks
                .lock()
                .expect("metrics mutex poisoned")
                .iter()
            {
                callback(&anomaly);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub files_processed: u64,
    pub files_failed: u64,
    pub units_created: u64,
    pub api_calls: u64,
    pub api_failures: u64,
    pub queue_depth: i64,
    pub memory_mb: u64,
    pub unit_duration_mean_s: f64,
    pub db_write_mean_ms: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Pipeline Metrics ===")?;
        writeln!(f, "Files processed:  {}", self.files_processed)?;
        writeln!(f, "Files failed:     {}", self.files_failed)?;
        writeln!(f, "Units created:    {}", self.units_created)?;
        writeln!(f, "API calls:        {}", self.api_calls)?;
        writeln!(f, "API failures:     {}", self.api_failures)?;
        writeln!(f, "Mean unit time:   {:.1}s", self.unit_duration_mean_s)?;
        writeln!(f, "Mean DB write:    {:.1}ms", self.db_write_mean_ms)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let m = PipelineMetrics::default();
        m.file_processed();
        m.file_processed();
        m.file_failed();
        m.units_created(7);
        m.api_call(true);
        m.api_call(false);

        let snap = m.snapshot();
        assert_eq!(snap.files_processed, 2);
        assert_eq!(snap.files_failed, 1);
        assert_eq!(snap.units_created, 7);
        assert_eq!(snap.api_calls, 2);
        assert_eq!(snap.api_failures, 1);
    }

    #[test]
    fn histogram_buckets_and_mean() {
        let mut h = Histogram::new(vec![1.0, 10.0]);
        h.observe(0.5);
        h.observe(5.0);
        h.observe(50.0);
        assert_eq!(h.count(), 3);
        assert!((h.mean() - 18.5).abs() < 1e-9);
        let buckets: Vec<(Option<f64>, u64)> = h.buckets().collect();
        assert_eq!(buckets, vec![(Some(1.0), 1), (Some(10.0), 1), (None, 1)]);
    }

    #[test]
    fn anomaly_fires_once_above_threshold() {
        let m = PipelineMetrics::new(0.2);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        m.on_anomaly(move |anomaly| {
            assert_eq!(anomaly.kind, AnomalyKind::ApiFailureRate);
            assert!(anomaly.rate > 0.2);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        // 70 successes then 30 failures: rate crosses 20% within the window.
        for _ in 0..70 {
            m.api_call(true);
        }
        for _ in 0..30 {
            m.api_call(false);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Still failing: latched, no second alert.
        m.api_call(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Recover, then cross again: a fresh alert fires.
        for _ in 0..100 {
            m.api_call(true);
        }
        for _ in 0..25 {
            m.api_call(false);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_anomaly_below_full_window() {
        let m = PipelineMetrics::new(0.2);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        m.on_anomaly(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..50 {
            m.api_call(false);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
