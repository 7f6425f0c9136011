//! Progress reporting, record hand-off and cooperative cancellation.

use std::borrow::Borrow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::automation::record::EntityRecord;

/// Share of the progress bar reserved for setup (connect, navigate, filters, count).
pub const SETUP_PERCENT: f32 = 15.0;
/// Share covered by the per-entity loop.
pub const LOOP_PERCENT: f32 = 80.0;

/// Snapshot handed to the progress sink on phase changes and after every entity.
#[derive(Debug, Clone)]
pub struct CollectionProgress {
    pub status: String,
    /// Entities processed so far
    pub current: usize,
    pub total: usize,
    /// 0 to 100
    pub percentage: f32,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
    pub average_confidence: f32,
    /// Records collected so far, shared with the runner rather than copied
    pub records: Vec<Arc<EntityRecord>>,
}

/// Receives progress snapshots. Implemented for closures.
pub trait ProgressSink {
    fn on_progress(&mut self, progress: &CollectionProgress);
}

impl<F: FnMut(&CollectionProgress)> ProgressSink for F {
    fn on_progress(&mut self, progress: &CollectionProgress) {
        self(progress)
    }
}

/// Receives each finished record as soon as it is collected.
pub trait RecordSink {
    fn on_record(&mut self, record: &EntityRecord) -> anyhow::Result<()>;
}

/// Record sink that keeps nothing.
pub struct DiscardRecords;

impl RecordSink for DiscardRecords {
    fn on_record(&mut self, _record: &EntityRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Cloneable stop flag, polled before each entity.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Percentage after `processed` of `total` entities.
pub fn entity_percentage(processed: usize, total: usize) -> f32 {
    if total == 0 {
        return SETUP_PERCENT;
    }
    SETUP_PERCENT + (processed as f32 / total as f32) * LOOP_PERCENT
}

/// Linear extrapolation of the remaining time. `None` before the first entity.
pub fn estimate_remaining(elapsed: Duration, processed: usize, total: usize) -> Option<Duration> {
    if processed == 0 {
        return None;
    }
    let per_entity = elapsed.as_secs_f64() / processed as f64;
    let remaining = total.saturating_sub(processed) as f64;
    Some(Duration::from_secs_f64(per_entity * remaining))
}

/// Mean of the per-record averages, 0 for no records.
pub fn running_average<R: Borrow<EntityRecord>>(records: &[R]) -> f32 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().map(|r| r.borrow().average_confidence()).sum::<f32>() / records.len() as f32
}

/// Builds snapshots against the run's start time.
pub struct ProgressTracker {
    started: Instant,
    total: usize,
}

impl ProgressTracker {
    pub fn start() -> Self {
        Self { started: Instant::now(), total: 0 }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    pub fn phase(&self, status: &str, percentage: f32, records: &[Arc<EntityRecord>]) -> CollectionProgress {
        CollectionProgress {
            status: status.to_string(),
            current: records.len(),
            total: self.total,
            percentage,
            elapsed: self.elapsed(),
            estimated_remaining: None,
            average_confidence: running_average(records),
            records: records.to_vec(),
        }
    }

    pub fn entity(&self, status: &str, records: &[Arc<EntityRecord>]) -> CollectionProgress {
        let elapsed = self.elapsed();
        let processed = records.len();
        CollectionProgress {
            status: status.to_string(),
            current: processed,
            total: self.total,
            percentage: entity_percentage(processed, self.total),
            elapsed,
            estimated_remaining: estimate_remaining(elapsed, processed, self.total),
            average_confidence: running_average(records),
            records: records.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_percentage() {
        assert_eq!(entity_percentage(0, 4), 15.0);
        assert_eq!(entity_percentage(2, 4), 55.0);
        assert_eq!(entity_percentage(4, 4), 95.0);
        assert_eq!(entity_percentage(0, 0), 15.0);
    }

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0, 5), None);
        let eta = estimate_remaining(Duration::from_secs(10), 2, 5).unwrap();
        assert!((eta.as_secs_f64() - 15.0).abs() < 1e-6);
        assert_eq!(estimate_remaining(Duration::from_secs(10), 5, 5), Some(Duration::ZERO));
    }

    #[test]
    fn test_running_average() {
        let mut a = EntityRecord::new(1);
        a.set_confidence("name", 1.0);
        let b = EntityRecord::new(2);
        assert_eq!(running_average::<EntityRecord>(&[]), 0.0);
        assert_eq!(running_average(&[a, b]), 0.5);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |p: &CollectionProgress| seen.push(p.percentage);
            let mut tracker = ProgressTracker::start();
            tracker.set_total(2);
            sink.on_progress(&tracker.phase("Connecting", 5.0, &[]));
            sink.on_progress(&tracker.entity("Entity 1", &[Arc::new(EntityRecord::new(1))]));
        }
        assert_eq!(seen, vec![5.0, 55.0]);
    }

    #[test]
    fn test_snapshot_shares_records() {
        let mut record = EntityRecord::new(1);
        record.type_image = Some(vec![0u8; 4096]);
        let records = vec![Arc::new(record)];
        let mut tracker = ProgressTracker::start();
        tracker.set_total(3);

        let snapshot = tracker.entity("Entity 1", &records);
        assert_eq!(snapshot.current, 1);
        assert!(Arc::ptr_eq(&snapshot.records[0], &records[0]));
        assert_eq!(Arc::strong_count(&records[0]), 2);
    }
}
