use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    // 可以为负，表示已经透支
    available: f64,
    last_refill: Instant,
}

/// 整个任务共享的令牌桶，单位是字节每秒
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// 桶容量为一秒的流量
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            rate,
            capacity: rate,
            bucket: Mutex::new(Bucket {
                available: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.rate as u64
    }

    /// 先扣令牌，不够就按欠下的量睡眠，睡眠时不持有锁
    pub async fn acquire(&self, bytes: u64) {
        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.available = (bucket.available + elapsed * self.rate).min(self.capacity);
            bucket.last_refill = now;

            bucket.available -= bytes as f64;
            if bucket.available >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.available / self.rate)
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
