use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use crate::error::Stage;

// 两次进度事件之间的最小间隔
const EMIT_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub stage: Stage,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub eta: Option<Duration>,
}

/// 进度事件的发送端，没有订阅者时什么也不做
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: String,
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, tx: Option<UnboundedSender<ProgressEvent>>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    pub fn disabled() -> Self {
        Self::new(String::new(), None)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self, stage: Stage) {
        self.emit(stage, 0, None, None);
    }

    pub fn emit(&self, stage: Stage, bytes_done: u64, bytes_total: Option<u64>, eta: Option<Duration>) {
        if let Some(tx) = &self.tx {
            // 接收端关掉了就不再发
            let _ = tx.send(ProgressEvent {
                job_id: self.job_id.clone(),
                stage,
                bytes_done,
                bytes_total,
                eta,
            });
        }
    }
}

/// 统计整个任务的下载字节数，对外报告的值只增不减
#[derive(Debug)]
pub struct ByteTracker {
    reporter: ProgressReporter,
    total: Option<u64>,
    initial: u64,
    done: AtomicU64,
    reported: AtomicU64,
    started: Instant,
    last_emit_ms: AtomicU64,
}

impl ByteTracker {
    pub fn new(reporter: ProgressReporter, initial: u64, total: Option<u64>) -> Self {
        Self {
            reporter,
            total,
            initial,
            done: AtomicU64::new(initial),
            reported: AtomicU64::new(initial),
            started: Instant::now(),
            last_emit_ms: AtomicU64::new(0),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.done.fetch_add(bytes, Ordering::Relaxed);
        self.maybe_emit(false);
    }

    /// 重试前撤回失败分块已计入的字节
    pub fn rollback(&self, bytes: u64) {
        let _ = self
            .done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(bytes)));
    }

    pub fn finish(&self) {
        self.maybe_emit(true);
    }

    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    fn maybe_emit(&self, force: bool) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_emit_ms.load(Ordering::Relaxed);
        if !force && elapsed_ms < last + EMIT_INTERVAL_MS {
            return;
        }
        if !force
            && self
                .last_emit_ms
                .compare_exchange(last, elapsed_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            // 别的分块刚发过
            return;
        }

        let mut value = self.done.load(Ordering::Relaxed);
        if let Some(total) = self.total {
            value = value.min(total);
        }
        let previous = self.reported.fetch_max(value, Ordering::Relaxed);
        let value = value.max(previous);

        self.reporter
            .emit(Stage::Download, value, self.total, self.eta(value, elapsed_ms));
    }

    fn eta(&self, done: u64, elapsed_ms: u64) -> Option<Duration> {
        let total = self.total?;
        let fetched = done.saturating_sub(self.initial);
        if fetched == 0 || elapsed_ms == 0 {
            return None;
        }
        let rate = fetched as f64 / (elapsed_ms as f64 / 1000.0);
        Some(Duration::from_secs_f64(total.saturating_sub(done) as f64 / rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_bytes_never_decrease() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tracker = ByteTracker::new(ProgressReporter::new("job", Some(tx)), 0, Some(100));

        tracker.add(60);
        tracker.finish();
        tracker.rollback(60);
        tracker.finish();
        tracker.add(100);
        tracker.finish();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.bytes_done);
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
        assert_eq!(seen.last(), Some(&100));
    }
}
