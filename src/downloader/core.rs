use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{DownloadError, FetchError};
use super::plan::{ChunkPlan, ChunkSpec};
use super::progress::{ByteTracker, ProgressReporter};
use super::rate_limit::RateLimiter;
use super::source::ChunkSource;
use super::state::{ChunkStatus, DownloadState};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// 首次失败之后最多再试几次
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub attempt_timeout: Duration,
    /// 取消后给在途请求收尾的时间
    pub cancel_grace: Duration,
    /// 字节每秒，`None` 不限速
    pub rate_limit: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(2),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// 本次实际下载的分块数
    pub chunks_fetched: usize,
    /// 从上次状态里直接复用的分块数
    pub chunks_reused: usize,
    /// 每路流最终的文件长度
    pub lengths: Vec<(String, u64)>,
}

/// 第 `attempt` 次失败后的等待时间：基数翻倍，封顶，再加最多一半的随机抖动
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base
        .checked_mul(1u32 << attempt.saturating_sub(1).min(16))
        .unwrap_or(cap)
        .min(cap);
    let jitter_ms = exp.as_millis() as u64 / 2;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    (exp + jitter).min(cap)
}

// 单次尝试的结果
enum AttemptError {
    Fetch(FetchError),
    Cancelled,
}

// 所有分块任务共享的上下文
struct TaskContext {
    source: Arc<dyn ChunkSource>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    global: Option<Arc<Semaphore>>,
    limiter: Option<RateLimiter>,
    state: Arc<DownloadState>,
    tracker: ByteTracker,
    cancel: CancellationToken,
}

pub struct DownloadScheduler {
    source: Arc<dyn ChunkSource>,
    config: SchedulerConfig,
    global: Option<Arc<Semaphore>>,
}

impl DownloadScheduler {
    pub fn new(source: Arc<dyn ChunkSource>, config: SchedulerConfig) -> Self {
        Self {
            source,
            config,
            global: None,
        }
    }

    /// 多个任务共用的全局并发上限
    pub fn with_global_limit(mut self, global: Arc<Semaphore>) -> Self {
        self.global = Some(global);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 下载所有计划中尚未完成的分块，并校验最终文件
    pub async fn run(
        &self,
        plans: &[ChunkPlan],
        state: Arc<DownloadState>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        for plan in plans {
            Self::prepare_file(plan).await?;
        }

        let total = plans
            .iter()
            .map(|p| p.total_length)
            .sum::<Option<u64>>();

        let ctx = Arc::new(TaskContext {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            global: self.global.clone(),
            limiter: self.config.rate_limit.map(RateLimiter::new),
            state: Arc::clone(&state),
            tracker: ByteTracker::new(progress.clone(), state.done_bytes(), total),
            cancel: cancel.child_token(),
        });

        let mut report = DownloadReport::default();

        let pending: Vec<(Arc<Vec<String>>, ChunkSpec)> = Self::pending_chunks(plans, &state, &mut report);
        info!(
            "开始下载: {} 个分块待下载，{} 个分块已完成",
            pending.len(),
            report.chunks_reused
        );

        let first = Self::fetch_all(&ctx, pending).await;
        report.chunks_fetched += Self::settle(&state, first).await?;

        // 校验不通过的分块重新下载一次
        let bad = Self::verify(plans, &state).await?;
        if !bad.is_empty() {
            warn!("校验发现 {} 个分块异常，重新下载", bad.len());
            for (_, chunk) in &bad {
                state.set(&chunk.key, ChunkStatus::Pending);
            }
            let retry = Self::fetch_all(&ctx, bad).await;
            report.chunks_fetched += Self::settle(&state, retry).await?;

            let still_bad = Self::verify(plans, &state).await?;
            if let Some((_, chunk)) = still_bad.first() {
                let plan = plans
                    .iter()
                    .find(|p| p.rendition_id == chunk.key.rendition_id);
                let expected = plan.and_then(|p| {
                    p.total_length
                        .or_else(|| state.discovered_length(&p.rendition_id))
                });
                let actual = file_len(&chunk.destination).await;
                return Err(DownloadError::Integrity {
                    rendition: chunk.key.rendition_id.clone(),
                    expected,
                    actual,
                });
            }
        }

        for plan in plans {
            let len = file_len(&plan.destination).await;
            report.lengths.push((plan.rendition_id.clone(), len));
        }

        ctx.tracker.finish();
        info!("下载完成: 本次下载 {} 个分块", report.chunks_fetched);
        Ok(report)
    }

    // 创建目标文件，长度已知时预分配
    async fn prepare_file(plan: &ChunkPlan) -> Result<(), DownloadError> {
        if let Some(parent) = plan.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&plan.destination)
            .await?;

        if let Some(len) = plan.total_length {
            if file.metadata().await?.len() != len {
                file.set_len(len).await?;
            }
        }
        Ok(())
    }

    fn pending_chunks(
        plans: &[ChunkPlan],
        state: &DownloadState,
        report: &mut DownloadReport,
    ) -> Vec<(Arc<Vec<String>>, ChunkSpec)> {
        let mut pending = Vec::new();
        for plan in plans {
            let locators = Arc::new(plan.locators.clone());
            for chunk in &plan.chunks {
                if state.is_done(&chunk.key) {
                    report.chunks_reused += 1;
                } else {
                    pending.push((Arc::clone(&locators), chunk.clone()));
                }
            }
        }
        pending
    }

    async fn fetch_all(
        ctx: &Arc<TaskContext>,
        chunks: Vec<(Arc<Vec<String>>, ChunkSpec)>,
    ) -> Vec<Result<u64, DownloadError>> {
        let mut tasks = JoinSet::new();
        for (locators, chunk) in chunks {
            let ctx = Arc::clone(ctx);
            tasks.spawn(async move { Self::fetch_chunk(ctx, locators, chunk).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("分块任务异常退出: {}", e);
                    Err(DownloadError::TaskPanicked(e.to_string()))
                }
            };
            if matches!(&result, Err(e) if !matches!(e, DownloadError::Cancelled)) {
                ctx.cancel.cancel();
            }
            results.push(result);
        }
        results
    }

    /// 收尾：在途分块退回待下载并落盘，再挑出最该报告的错误
    async fn settle(
        state: &DownloadState,
        results: Vec<Result<u64, DownloadError>>,
    ) -> Result<usize, DownloadError> {
        let rolled = state.rollback_in_flight();
        if rolled > 0 {
            debug!("{} 个在途分块退回待下载", rolled);
        }
        state.persist().await?;

        let mut fetched = 0;
        let mut cancelled = false;
        let mut failure = None;
        for result in results {
            match result {
                Ok(_) => fetched += 1,
                Err(DownloadError::Cancelled) => cancelled = true,
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        match (failure, cancelled) {
            (Some(e), _) => Err(e),
            (None, true) => Err(DownloadError::Cancelled),
            (None, false) => Ok(fetched),
        }
    }

    /// 返回需要重新下载的分块
    async fn verify(
        plans: &[ChunkPlan],
        state: &DownloadState,
    ) -> Result<Vec<(Arc<Vec<String>>, ChunkSpec)>, DownloadError> {
        let mut bad = Vec::new();
        for plan in plans {
            let locators = Arc::new(plan.locators.clone());
            let expected = plan
                .total_length
                .or_else(|| state.discovered_length(&plan.rendition_id));
            let mut actual = file_len(&plan.destination).await;

            if let Some(expected) = expected {
                if actual > expected {
                    // 多出来的是旧文件的残留
                    let file = OpenOptions::new().write(true).open(&plan.destination).await?;
                    file.set_len(expected).await?;
                    actual = expected;
                }
            }

            for chunk in &plan.chunks {
                let chunk_len = chunk.length.or(expected);
                let status_ok = matches!(
                    (state.get(&chunk.key), chunk_len),
                    (Some(ChunkStatus::Done { bytes }), Some(len)) if bytes == len
                );
                let covered = chunk_len.is_some_and(|len| actual >= chunk.offset + len);

                if !(status_ok && covered) {
                    debug!(
                        "分块校验失败: {} #{} (状态 {:?}, 文件长度 {})",
                        chunk.key.rendition_id,
                        chunk.key.index,
                        state.get(&chunk.key),
                        actual
                    );
                    bad.push((Arc::clone(&locators), chunk.clone()));
                }
            }
        }
        Ok(bad)
    }

    async fn fetch_chunk(
        ctx: Arc<TaskContext>,
        locators: Arc<Vec<String>>,
        chunk: ChunkSpec,
    ) -> Result<u64, DownloadError> {
        let key = chunk.key.clone();
        let mut attempt: u32 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            // 许可只在请求期间持有，退避等待时不占用
            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
                permit = Arc::clone(&ctx.semaphore).acquire_owned() => {
                    permit.map_err(|_| DownloadError::SemaphoreError)?
                }
            };
            let global_permit = match &ctx.global {
                Some(global) => Some(tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
                    permit = Arc::clone(global).acquire_owned() => {
                        permit.map_err(|_| DownloadError::SemaphoreError)?
                    }
                }),
                None => None,
            };

            ctx.state.set(&key, ChunkStatus::InFlight);

            // 每次重试换一个镜像
            let locator = locators
                .get(attempt as usize % locators.len().max(1))
                .map(String::as_str)
                .unwrap_or_default();

            let result = Self::fetch_once(&ctx, locator, &chunk).await;
            drop(global_permit);
            drop(permit);

            match result {
                Ok(bytes) => {
                    if chunk.length.is_none() {
                        ctx.state.set_discovered_length(&key.rendition_id, bytes);
                        let file = OpenOptions::new().write(true).open(&chunk.destination).await?;
                        file.set_len(chunk.offset + bytes).await?;
                    }
                    ctx.state.set(&key, ChunkStatus::Done { bytes });
                    ctx.state.persist().await?;
                    debug!("分块完成: {} #{} ({} 字节)", key.rendition_id, key.index, bytes);
                    return Ok(bytes);
                }
                Err(AttemptError::Cancelled) => {
                    ctx.state.set(&key, ChunkStatus::Pending);
                    return Err(DownloadError::Cancelled);
                }
                Err(AttemptError::Fetch(e)) => {
                    attempt += 1;
                    let reason = e.to_string();
                    ctx.state.set(
                        &key,
                        ChunkStatus::Failed {
                            reason: reason.clone(),
                            attempts: attempt,
                        },
                    );

                    if attempt > ctx.config.max_retries {
                        error!(
                            "分块 {} #{} 重试 {} 次后仍然失败: {}，停止整个任务",
                            key.rendition_id, key.index, ctx.config.max_retries, reason
                        );
                        // 不再发起新的请求，在途分块按取消流程收尾
                        ctx.cancel.cancel();
                        return Err(DownloadError::DownloadFailed {
                            rendition: key.rendition_id.clone(),
                            chunk: key.index,
                            reason,
                        });
                    }

                    let delay = backoff_delay(attempt, ctx.config.backoff_base, ctx.config.backoff_cap);
                    warn!(
                        "分块 {} #{} 第 {} 次失败: {}，{:?} 后重试",
                        key.rendition_id, key.index, attempt, reason, delay
                    );

                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            ctx.state.set(&key, ChunkStatus::Pending);
                            return Err(DownloadError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    // 一次尝试：超时和取消都在这里处理，失败时撤回已计入进度的字节
    async fn fetch_once(ctx: &TaskContext, locator: &str, chunk: &ChunkSpec) -> Result<u64, AttemptError> {
        let counted = AtomicU64::new(0);
        let work = tokio::time::timeout(
            ctx.config.attempt_timeout,
            Self::transfer(ctx, locator, chunk, &counted),
        );
        tokio::pin!(work);

        let outcome = tokio::select! {
            r = &mut work => r,
            _ = ctx.cancel.cancelled() => {
                match tokio::time::timeout(ctx.config.cancel_grace, &mut work).await {
                    Ok(r) => r,
                    Err(_) => {
                        debug!("取消宽限期已过，放弃分块 #{}", chunk.key.index);
                        ctx.tracker.rollback(counted.load(Ordering::Relaxed));
                        return Err(AttemptError::Cancelled);
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => {
                ctx.tracker.rollback(counted.load(Ordering::Relaxed));
                Err(AttemptError::Fetch(e))
            }
            Err(_) => {
                ctx.tracker.rollback(counted.load(Ordering::Relaxed));
                Err(AttemptError::Fetch(FetchError::Timeout))
            }
        }
    }

    async fn transfer(
        ctx: &TaskContext,
        locator: &str,
        chunk: &ChunkSpec,
        counted: &AtomicU64,
    ) -> Result<u64, FetchError> {
        let resp = ctx
            .source
            .fetch_range(locator, chunk.offset, chunk.length)
            .await?;

        let expected = chunk.length.or(resp.content_length);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&chunk.destination)
            .await?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;

        let mut written = 0u64;
        let mut body = resp.body;
        while let Some(item) = body.next().await {
            let mut bytes = item?;
            if let Some(len) = chunk.length {
                // 服务端多给的部分属于别的分块
                let remaining = len - written;
                if bytes.len() as u64 > remaining {
                    bytes.truncate(remaining as usize);
                }
            }
            if bytes.is_empty() {
                break;
            }

            if let Some(limiter) = &ctx.limiter {
                limiter.acquire(bytes.len() as u64).await;
            }

            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
            counted.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            ctx.tracker.add(bytes.len() as u64);

            if chunk.length == Some(written) {
                break;
            }
        }
        file.flush().await?;

        match expected {
            Some(expected) if written != expected => Err(FetchError::ShortRead {
                expected,
                actual: written,
            }),
            _ => Ok(written),
        }
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}
