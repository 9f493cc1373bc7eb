//! # Rate Estimation
//!
//! Per-(task, stage) transfer-rate estimators. Rate and ETA math use the
//! monotonic clock; wall-clock timestamps are only for persisted records.
//!
//! Each update computes the cumulative rate since the stage started and
//! smooths it with a moving average over the last K samples. Estimator
//! state is process-local and rolled back when the corresponding persist
//! fails, so a retried update does not double-count.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Moving-average estimator for one stage
#[derive(Debug)]
pub struct RateEstimator {
    started: Instant,
    window: usize,
    speeds: VecDeque<f64>,
    /// Kept so a failed persist can undo the latest sample
    previous_speeds: Option<VecDeque<f64>>,
}

impl RateEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            started: Instant::now(),
            window: window.max(1),
            speeds: VecDeque::new(),
            previous_speeds: None,
        }
    }

    /// Record cumulative bytes processed and return the smoothed rate.
    pub fn record(&mut self, bytes_processed: u64) -> f64 {
        self.record_with_elapsed(bytes_processed, self.started.elapsed())
    }

    fn record_with_elapsed(&mut self, bytes_processed: u64, elapsed: Duration) -> f64 {
        self.previous_speeds = Some(self.speeds.clone());
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 && bytes_processed > 0 {
            if self.speeds.len() >= self.window {
                self.speeds.pop_front();
            }
            self.speeds.push_back(bytes_processed as f64 / secs);
        }
        self.current()
    }

    pub fn current(&self) -> f64 {
        if self.speeds.is_empty() {
            0.0
        } else {
            self.speeds.iter().sum::<f64>() / self.speeds.len() as f64
        }
    }

    /// Undo the most recent `record`
    pub fn rollback(&mut self) {
        if let Some(previous) = self.previous_speeds.take() {
            self.speeds = previous;
        }
    }

    #[cfg(test)]
    fn record_at(&mut self, bytes_processed: u64, elapsed_secs: f64) -> f64 {
        self.record_with_elapsed(bytes_processed, Duration::from_secs_f64(elapsed_secs))
    }
}

/// Estimators keyed by (task, stage)
#[derive(Debug, Default)]
pub struct RateBook {
    window: usize,
    estimators: Mutex<HashMap<(String, String), RateEstimator>>,
}

impl RateBook {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            estimators: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), RateEstimator>> {
        self.estimators.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start (or restart) an estimator for a stage
    pub fn start(&self, task_id: &str, stage: &str) {
        self.lock().insert(
            (task_id.to_string(), stage.to_string()),
            RateEstimator::new(self.window),
        );
    }

    /// Record a sample; stages without a started estimator get one lazily
    pub fn record(&self, task_id: &str, stage: &str, bytes_processed: u64) -> f64 {
        let mut book = self.lock();
        book.entry((task_id.to_string(), stage.to_string()))
            .or_insert_with(|| RateEstimator::new(self.window))
            .record(bytes_processed)
    }

    /// Undo the most recent sample after a failed persist
    pub fn rollback(&self, task_id: &str, stage: &str) {
        if let Some(estimator) = self
            .lock()
            .get_mut(&(task_id.to_string(), stage.to_string()))
        {
            estimator.rollback();
        }
    }

    /// Drop the estimator when a stage completes or fails
    pub fn finish(&self, task_id: &str, stage: &str) {
        self.lock()
            .remove(&(task_id.to_string(), stage.to_string()));
    }

    /// Drop all estimators for a task (terminal transitions)
    pub fn clear_task(&self, task_id: &str) {
        self.lock().retain(|(task, _), _| task != task_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_rate_smoothing() {
        let mut est = RateEstimator::new(5);
        // Steady 1000 B/s
        assert!((est.record_at(1_000, 1.0) - 1_000.0).abs() < 1.0);
        assert!((est.record_at(2_000, 2.0) - 1_000.0).abs() < 1.0);
        assert!((est.record_at(3_000, 3.0) - 1_000.0).abs() < 1.0);
    }

    #[test]
    fn test_window_bounds_samples() {
        let mut est = RateEstimator::new(2);
        est.record_at(1_000, 1.0); // 1000 B/s
        est.record_at(4_000, 2.0); // 2000 B/s
        est.record_at(9_000, 3.0); // 3000 B/s, evicts the first
        assert!((est.current() - 2_500.0).abs() < 1.0);
    }

    #[test]
    fn test_zero_elapsed_or_bytes_yields_no_sample() {
        let mut est = RateEstimator::new(5);
        assert_eq!(est.record_at(0, 1.0), 0.0);
        assert_eq!(est.record_at(100, 0.0), 0.0);
    }

    #[test]
    fn test_rollback_restores_previous_state() {
        let mut est = RateEstimator::new(5);
        est.record_at(1_000, 1.0);
        let before = est.current();

        est.record_at(50_000, 2.0);
        assert!(est.current() > before);

        est.rollback();
        assert!((est.current() - before).abs() < 1e-9);
    }

    #[test]
    fn test_book_lifecycle() {
        let book = RateBook::new(5);
        book.start("t1", "downloading");
        assert_eq!(book.tracked_count(), 1);

        let rate = book.record("t1", "downloading", 10_000);
        assert!(rate >= 0.0);

        book.finish("t1", "downloading");
        assert_eq!(book.tracked_count(), 0);
    }

    #[test]
    fn test_clear_task_drops_all_stages() {
        let book = RateBook::new(5);
        book.start("t1", "a");
        book.start("t1", "b");
        book.start("t2", "a");
        book.clear_task("t1");
        assert_eq!(book.tracked_count(), 1);
    }
}
