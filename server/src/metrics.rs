use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 10;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        raise_to(&self.max_ms, ms);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => {
                self.buckets[idx].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

fn raise_to(target: &AtomicU64, value: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while value > current {
        match target.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub register: LatencySnapshot,
    pub draw: LatencySnapshot,
    pub status: LatencySnapshot,
    pub reject_origin: u64,
    pub reject_rate_limit: u64,
    pub reject_body_limit: u64,
    pub unauthorized: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    register: LatencyMetrics,
    draw: LatencyMetrics,
    status: LatencyMetrics,
    reject_origin: AtomicU64,
    reject_rate_limit: AtomicU64,
    reject_body_limit: AtomicU64,
    unauthorized: AtomicU64,
}

impl HttpMetrics {
    pub fn record_register(&self, duration: Duration) {
        self.register.record(duration);
    }

    pub fn record_draw(&self, duration: Duration) {
        self.draw.record(duration);
    }

    pub fn record_status(&self, duration: Duration) {
        self.status.record(duration);
    }

    pub fn inc_reject_origin(&self) {
        self.reject_origin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.reject_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_body_limit(&self) {
        self.reject_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unauthorized(&self) {
        self.unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            register: self.register.snapshot(),
            draw: self.draw.snapshot(),
            status: self.status.snapshot(),
            reject_origin: self.reject_origin.load(Ordering::Relaxed),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct MailMetricsSnapshot {
    pub sent: u64,
    pub failed: u64,
}

#[derive(Default)]
pub struct MailMetrics {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl MailMetrics {
    pub fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MailMetricsSnapshot {
        MailMetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PersistenceMetricsSnapshot {
    pub queue_depth: u64,
    pub queue_high_water: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub coalesced: u64,
}

#[derive(Default)]
pub struct PersistenceMetrics {
    queue_depth: AtomicU64,
    queue_high_water: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
    coalesced: AtomicU64,
}

impl PersistenceMetrics {
    pub fn inc_queue_depth(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        raise_to(&self.queue_high_water, depth);
    }

    pub fn dec_queue_depth(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }

    pub fn inc_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_coalesced(&self, skipped: u64) {
        self.coalesced.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PersistenceMetricsSnapshot {
        PersistenceMetricsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub http: HttpMetricsSnapshot,
    pub mail: MailMetricsSnapshot,
    pub persistence: PersistenceMetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_buckets_and_overflow() {
        let metrics = HttpMetrics::default();
        metrics.record_draw(Duration::from_millis(3));
        metrics.record_draw(Duration::from_millis(4_000));
        let snapshot = metrics.snapshot().draw;
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.counts[2], 1);
        assert_eq!(snapshot.overflow, 1);
        assert_eq!(snapshot.max_ms, 4_000);
    }

    #[test]
    fn queue_depth_tracks_high_water_and_never_underflows() {
        let metrics = PersistenceMetrics::default();
        metrics.inc_queue_depth();
        metrics.inc_queue_depth();
        metrics.dec_queue_depth();
        metrics.dec_queue_depth();
        metrics.dec_queue_depth();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_depth, 0);
        assert_eq!(snapshot.queue_high_water, 2);
    }
}
