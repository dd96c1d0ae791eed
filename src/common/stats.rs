use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoMetric {
    BytesWritten,
    WriteNanos,
    FsyncNanos,
    RangeSyncNanos,
    PrepareWriteNanos,
}

/// Sink for the writer's I/O measurements. Injected at construction so
/// the core stays free of process-global counters; implementations decide
/// aggregation and thread safety.
pub trait IoStats: Send + Sync {
    fn add(&self, metric: IoMetric, value: u64);
}

#[derive(Default)]
pub struct NoopIoStats;

impl IoStats for NoopIoStats {
    fn add(&self, _metric: IoMetric, _value: u64) {}
}

/// Scoped timer reporting elapsed nanoseconds to the sink on drop, so the
/// measurement is recorded on every exit path of the enclosing scope.
pub struct IoTimer {
    stats: Arc<dyn IoStats>,
    metric: IoMetric,
    start: Instant,
}

impl IoTimer {
    pub fn new(stats: Arc<dyn IoStats>, metric: IoMetric) -> Self {
        IoTimer {
            stats,
            metric,
            start: Instant::now(),
        }
    }
}

impl Drop for IoTimer {
    fn drop(&mut self) {
        self.stats
            .add(self.metric, self.start.elapsed().as_nanos() as u64);
    }
}
