//! 单个下载任务的完整流程。
//!
//! 解析 → 选流 → 分块 → 下载 → 合并，弹幕的下载和转换与媒体下载并行。
//! 任何阶段失败都会报告出错的阶段，已经下载好的分块和状态文件保留在临时目录里，
//! 下次运行同一个任务时直接续传。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::client::client::BiliClient;
use crate::common::client::error::ApiError;
use crate::common::models::Credential;
use crate::danmaku::{DanmakuConverter, DanmakuDocument, DanmakuFormat, RawDanmaku};
use crate::downloader::core::backoff_delay;
use crate::downloader::error::FetchError;
use crate::downloader::progress::{ProgressEvent, ProgressReporter};
use crate::downloader::{
    ChunkMode, ChunkPlan, ChunkPlanner, ChunkSource, DownloadScheduler, DownloadState,
    HttpChunkSource, SchedulerConfig,
};
use crate::error::{JobError, PipelineError, Stage};
use crate::parser::errors::ResolutionError;
use crate::parser::models::{Codec, PageId, RenditionDescriptor, Title, VideoQuality};
use crate::parser::stream_selector::{self, DegradePolicy, SelectionConstraints, SelectionResult};
use crate::parser::resolver::danmaku_segment_count;
use crate::parser::{Resolver, TitleResolver};
use crate::post_process::{Assembler, AssemblyRequest, ContainerFormat, SubtitleMode};

/// 一个下载任务
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub page: PageId,
    /// 输出路径模板，支持 `{title}` `{id}` `{quality}`
    pub output_template: String,
    pub quality_ceiling: VideoQuality,
    pub codec_preference: Vec<Codec>,
    pub concurrency: usize,
    pub want_danmaku: bool,
    pub credential: Option<Credential>,
}

impl JobDescriptor {
    pub fn new(page: PageId) -> Self {
        Self {
            page,
            output_template: "{title}".to_string(),
            quality_ceiling: VideoQuality::default(),
            codec_preference: vec![Codec::Avc, Codec::Hevc, Codec::Av1],
            concurrency: 4,
            want_danmaku: true,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub chunk_mode: ChunkMode,
    pub temp_dir: PathBuf,
    /// 分块和解析共用的重试次数
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub attempt_timeout: Duration,
    pub job_timeout: Option<Duration>,
    pub cancel_grace: Duration,
    pub rate_limit: Option<u64>,
    pub degrade: DegradePolicy,
    pub danmaku_format: DanmakuFormat,
    pub subtitle_mode: SubtitleMode,
    pub overwrite: bool,
    pub require_audio: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            chunk_mode: ChunkMode::default(),
            temp_dir: std::env::temp_dir().join("bilifetch"),
            max_retries: scheduler.max_retries,
            backoff_base: scheduler.backoff_base,
            backoff_cap: scheduler.backoff_cap,
            attempt_timeout: scheduler.attempt_timeout,
            job_timeout: None,
            cancel_grace: scheduler.cancel_grace,
            rate_limit: None,
            degrade: DegradePolicy::default(),
            danmaku_format: DanmakuFormat::default(),
            subtitle_mode: SubtitleMode::default(),
            overwrite: false,
            require_audio: true,
        }
    }
}

impl DownloadOptions {
    fn scheduler_config(&self, concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: concurrency.max(1),
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
            attempt_timeout: self.attempt_timeout,
            cancel_grace: self.cancel_grace,
            rate_limit: self.rate_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSuccess {
    pub job_id: String,
    pub output: PathBuf,
    pub subtitle: Option<PathBuf>,
    pub duration: Duration,
    /// 输出文件已存在，本次什么也没做
    pub skipped: bool,
    /// 选中的清晰度高于上限
    pub degraded: bool,
    /// 格式错误被跳过的弹幕条数
    pub danmaku_skipped: usize,
}

pub struct Pipeline {
    resolver: Arc<dyn TitleResolver>,
    source: Arc<dyn ChunkSource>,
    global: Option<Arc<Semaphore>>,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl Pipeline {
    pub fn new(resolver: Arc<dyn TitleResolver>, source: Arc<dyn ChunkSource>) -> Self {
        Self {
            resolver,
            source,
            global: None,
            progress: None,
        }
    }

    /// 用真实的 B 站接口和 CDN 组装
    pub fn http(credential: Option<Credential>, danmaku_format: DanmakuFormat) -> Result<Self, ApiError> {
        let client = BiliClient::new(credential)?;
        Ok(Self::new(
            Arc::new(Resolver::new(client.clone(), danmaku_format)),
            Arc::new(HttpChunkSource::new(client)),
        ))
    }

    /// 多个任务共用的分块并发上限
    pub fn with_global_limit(mut self, global: Arc<Semaphore>) -> Self {
        self.global = Some(global);
        self
    }

    pub fn with_progress(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub async fn run(
        &self,
        job: &JobDescriptor,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<JobSuccess, JobError> {
        let job_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let reporter = ProgressReporter::new(job_id.clone(), self.progress.clone());
        let child = cancel.child_token();

        let work = self.execute(job, options, &reporter, &child);
        tokio::pin!(work);

        let result = match options.job_timeout {
            Some(limit) => tokio::select! {
                r = &mut work => r,
                _ = tokio::time::sleep(limit) => {
                    warn!("任务超过 {:?} 未完成，正在停止", limit);
                    // 让调度器把在途分块退回并写好状态文件
                    child.cancel();
                    match work.await {
                        Ok(done) => Ok(done),
                        Err(e) => Err(JobError::new(e.stage, PipelineError::Timeout(limit))),
                    }
                }
            },
            None => work.await,
        };

        result.map(|done| JobSuccess {
            job_id,
            output: done.output,
            subtitle: done.subtitle,
            duration: started.elapsed(),
            skipped: done.skipped,
            degraded: done.degraded,
            danmaku_skipped: done.danmaku_skipped,
        })
    }

    async fn execute(
        &self,
        job: &JobDescriptor,
        options: &DownloadOptions,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Finished, JobError> {
        // 解析
        reporter.stage(Stage::Resolve);
        let title = self
            .resolve(&job.page, options, cancel)
            .await
            .map_err(|e| JobError::new(Stage::Resolve, e))?;

        // 选流，地址过期就重新解析一次
        reporter.stage(Stage::Select);
        let constraints = SelectionConstraints {
            quality_ceiling: job.quality_ceiling,
            codec_preference: job.codec_preference.clone(),
            want_danmaku: job.want_danmaku,
            require_audio: options.require_audio,
            degrade: options.degrade,
        };
        let (title, selection) = self
            .select_fresh(title, &job.page, &constraints, options, cancel)
            .await?;

        info!(
            "已选择: 视频 {}{}{}",
            selection.video.id(),
            selection
                .audio
                .as_ref()
                .map(|a| format!("，音频 {}", a.id()))
                .unwrap_or_default(),
            selection
                .danmaku
                .as_ref()
                .map(|d| format!("，弹幕 {}", d.id()))
                .unwrap_or_default(),
        );

        let output_base = render_output(&job.output_template, &title, selection.video.quality);
        let embed = options.subtitle_mode == SubtitleMode::Embed && selection.danmaku.is_some();
        let container = ContainerFormat::choose(selection.audio.as_ref().map(|a| &a.codec), embed);
        let final_output = container.apply_to(&output_base);

        if !options.overwrite && tokio::fs::try_exists(&final_output).await.unwrap_or(false) {
            info!("文件已存在，跳过: {:?}", final_output);
            return Ok(Finished {
                output: final_output,
                subtitle: None,
                skipped: true,
                degraded: selection.degraded,
                danmaku_skipped: 0,
            });
        }

        // 分块
        reporter.stage(Stage::Plan);
        tokio::fs::create_dir_all(&options.temp_dir)
            .await
            .map_err(|e| JobError::new(Stage::Plan, e))?;

        let mut plans = Vec::new();
        for descriptor in std::iter::once(&selection.video).chain(selection.audio.as_ref()) {
            plans.push(self.plan(&title, descriptor, options).await);
        }
        let sidecar = state_path(&options.temp_dir, &title.id);
        let state = DownloadState::load_or_new(&sidecar, &plans)
            .await
            .map(Arc::new)
            .map_err(|e| JobError::new(Stage::Plan, e))?;

        // 下载，弹幕同时进行
        let mut scheduler = DownloadScheduler::new(
            Arc::clone(&self.source),
            options.scheduler_config(job.concurrency),
        );
        if let Some(global) = &self.global {
            scheduler = scheduler.with_global_limit(Arc::clone(global));
        }

        let media = scheduler.run(&plans, Arc::clone(&state), reporter, cancel);
        let danmaku = async {
            let Some(descriptor) = &selection.danmaku else {
                return Ok(None);
            };
            let result = self.danmaku(descriptor, title.duration_secs, options, cancel).await;
            if result.is_err() {
                // 弹幕已经失败，媒体没必要继续下
                cancel.cancel();
            }
            result.map(Some)
        };
        let (media, danmaku) = tokio::join!(media, danmaku);

        let document = danmaku?;
        let report = media.map_err(|e| JobError::new(Stage::Download, e))?;
        debug!("下载报告: {:?}", report);

        // 合并
        let total_bytes: u64 = report.lengths.iter().map(|(_, len)| len).sum();
        reporter.emit(Stage::Assemble, total_bytes, Some(total_bytes), None);

        let audio_plan = selection.audio.as_ref().and(plans.get(1));
        let danmaku_skipped = document.as_ref().map_or(0, DanmakuDocument::skipped);
        let request = AssemblyRequest {
            video: plans[0].destination.clone(),
            audio: audio_plan.map(|p| p.destination.clone()),
            audio_codec: selection.audio.as_ref().map(|a| a.codec.clone()),
            danmaku: document,
            width: selection.video.width.unwrap_or(0),
            height: selection.video.height.unwrap_or(0),
            output: output_base,
            work_dir: options.temp_dir.clone(),
        };

        let assembler = Assembler::new(options.subtitle_mode);
        let outcome = tokio::select! {
            r = assembler.assemble(&request) => r.map_err(|e| JobError::new(Stage::Assemble, e))?,
            _ = cancel.cancelled() => {
                return Err(JobError::new(Stage::Assemble, PipelineError::Cancelled));
            }
        };

        // 合并成功后才清理临时文件
        let mut leftovers: Vec<PathBuf> = plans.iter().map(|p| p.destination.clone()).collect();
        if embed {
            leftovers.push(Assembler::embedded_subtitle_path(&request));
        }
        for path in leftovers {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("清理临时文件失败: {:?}: {}", path, e);
            }
        }
        if let Err(e) = state.remove_sidecar().await {
            warn!("清理状态文件失败: {}", e);
        }

        info!("任务完成: {:?}", outcome.output);
        Ok(Finished {
            output: outcome.output,
            subtitle: outcome.subtitle,
            skipped: false,
            degraded: selection.degraded,
            danmaku_skipped,
        })
    }

    /// 临时错误按退避重试
    async fn resolve(
        &self,
        page: &PageId,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<Title, PipelineError> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                r = self.resolver.resolve(page) => r,
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            };

            match result {
                Ok(title) => return Ok(title),
                Err(e) if e.is_transient() && attempt < options.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(attempt, options.backoff_base, options.backoff_cap);
                    warn!("解析失败: {}，{:?} 后第 {} 次重试", e, delay, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn select_fresh(
        &self,
        title: Title,
        page: &PageId,
        constraints: &SelectionConstraints,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<(Title, SelectionResult), JobError> {
        let selection = stream_selector::select(&title, constraints)
            .map_err(|e| JobError::new(Stage::Select, e))?;
        if !selection_expired(&selection) {
            return Ok((title, selection));
        }

        warn!("下载地址已过期，重新解析");
        let title = self
            .resolve(page, options, cancel)
            .await
            .map_err(|e| JobError::new(Stage::Resolve, e))?;
        let selection = stream_selector::select(&title, constraints)
            .map_err(|e| JobError::new(Stage::Select, e))?;
        if selection_expired(&selection) {
            return Err(JobError::new(
                Stage::Resolve,
                ResolutionError::Transient("重新解析后的下载地址仍然已过期".to_string()),
            ));
        }
        Ok((title, selection))
    }

    // 长度未知时先探测一下，探测失败就按单个开放分块下载
    async fn plan(&self, title: &Title, descriptor: &RenditionDescriptor, options: &DownloadOptions) -> ChunkPlan {
        let descriptor = if descriptor.byte_length.is_some() {
            descriptor.clone()
        } else {
            let len = match self.source.probe_length(&descriptor.locator).await {
                Ok(len) => len,
                Err(e) => {
                    warn!("获取 {} 的长度失败: {}", descriptor.id(), e);
                    None
                }
            };
            descriptor.clone().with_byte_length(len)
        };

        let destination = data_path(&options.temp_dir, &title.id, &descriptor.id());
        let plan = ChunkPlanner::plan(&descriptor, options.chunk_mode, &destination);
        debug!(
            "{}: {:?} 字节，{} 个分块",
            plan.rendition_id,
            plan.total_length,
            plan.chunks.len()
        );
        plan
    }

    async fn danmaku(
        &self,
        descriptor: &RenditionDescriptor,
        duration_secs: u64,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DanmakuDocument, JobError> {
        let raw = match descriptor.codec {
            Codec::DanmakuProtobuf => {
                let mut segments = Vec::new();
                for (index, locator) in segment_locators(&descriptor.locator, duration_secs)
                    .iter()
                    .enumerate()
                {
                    segments.push(self.fetch_whole(descriptor, index + 1, locator, options, cancel).await?);
                }
                RawDanmaku::Protobuf(segments)
            }
            _ => RawDanmaku::Xml(
                self.fetch_whole(descriptor, 0, &descriptor.locator, options, cancel)
                    .await?,
            ),
        };

        let document = DanmakuConverter::convert(&raw).map_err(|e| JobError::new(Stage::Convert, e))?;
        info!(
            "弹幕转换完成: {} 条，跳过 {} 条",
            document.len(),
            document.skipped()
        );
        Ok(document)
    }

    // 弹幕文件很小，整个取回来
    async fn fetch_whole(
        &self,
        descriptor: &RenditionDescriptor,
        index: usize,
        locator: &str,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, JobError> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                r = self.read_body(locator) => r,
                _ = cancel.cancelled() => {
                    return Err(JobError::new(Stage::Download, PipelineError::Cancelled));
                }
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < options.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(attempt, options.backoff_base, options.backoff_cap);
                    warn!("弹幕下载失败: {}，{:?} 后重试", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(JobError::new(Stage::Download, PipelineError::Cancelled));
                        }
                    }
                }
                Err(e) => {
                    return Err(JobError::new(
                        Stage::Download,
                        PipelineError::DownloadFailed {
                            rendition: descriptor.id(),
                            chunk: index,
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }
    }

    async fn read_body(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self.source.fetch_range(locator, 0, None).await?;
        let mut body = resp.body;
        let mut out = Vec::new();
        while let Some(bytes) = body.next().await {
            out.extend_from_slice(&bytes?);
        }
        Ok(out)
    }
}

// execute 的结果，耗时和任务 id 由 run 补上
struct Finished {
    output: PathBuf,
    subtitle: Option<PathBuf>,
    skipped: bool,
    degraded: bool,
    danmaku_skipped: usize,
}

fn selection_expired(selection: &SelectionResult) -> bool {
    let now = Utc::now();
    std::iter::once(&selection.video)
        .chain(selection.audio.as_ref())
        .chain(selection.danmaku.as_ref())
        .any(|d| d.is_expired(now))
}

/// protobuf 弹幕每 6 分钟一段，`segment_index` 从 1 开始
pub fn segment_locators(locator: &str, duration_secs: u64) -> Vec<String> {
    (1..=danmaku_segment_count(duration_secs))
        .map(|index| format!("{}&segment_index={}", locator, index))
        .collect()
}

pub fn data_path(temp_dir: &Path, title_id: &str, rendition_id: &str) -> PathBuf {
    temp_dir.join(format!("{}_{}.m4s", title_id, rendition_id))
}

pub fn state_path(temp_dir: &Path, title_id: &str) -> PathBuf {
    temp_dir.join(format!("{}.state", title_id))
}

/// 展开输出模板，标题里的非法字符替换成下划线
pub fn render_output(template: &str, title: &Title, quality: u32) -> PathBuf {
    let quality_name = VideoQuality::from_id(quality)
        .map(|q| q.description().to_string())
        .unwrap_or_else(|| quality.to_string());
    let rendered = template
        .replace("{title}", &clean_filename(&title.name))
        .replace("{id}", &clean_filename(&title.id))
        .replace("{quality}", &clean_filename(&quality_name));
    PathBuf::from(rendered)
}

fn clean_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(name: &str) -> Title {
        Title {
            id: "BV1xx411c7mD_62131".to_string(),
            name: name.to_string(),
            aid: 1,
            bvid: "BV1xx411c7mD".to_string(),
            cid: 62131,
            duration_secs: 60,
            renditions: Vec::new(),
            resolved_at: Utc::now(),
        }
    }

    #[test]
    fn renders_template_placeholders() {
        let path = render_output("out/{title}-{quality}-{id}", &title("a/b: c?"), 64);
        assert_eq!(
            path,
            PathBuf::from(format!(
                "out/a_b_ c_-{}-BV1xx411c7mD_62131",
                VideoQuality::Q720P.description()
            ))
        );
    }

    #[test]
    fn empty_title_gets_placeholder_name() {
        let path = render_output("{title}", &title(" ... "), 80);
        assert_eq!(path, PathBuf::from("untitled"));
    }

    #[test]
    fn protobuf_segments_follow_title_duration() {
        let locators = segment_locators("https://api.bilibili.com/x/v2/dm/web/seg.so?type=1&oid=1", 721);
        assert_eq!(locators.len(), 3);
        assert!(locators[0].ends_with("&segment_index=1"));
        assert!(locators[2].ends_with("&segment_index=3"));
        assert_eq!(segment_locators("x?oid=1", 0).len(), 1);
    }

    #[test]
    fn on_disk_layout_is_deterministic() {
        let dir = Path::new("/tmp/job");
        assert_eq!(
            data_path(dir, "BV1_2", "video-80-avc"),
            PathBuf::from("/tmp/job/BV1_2_video-80-avc.m4s")
        );
        assert_eq!(state_path(dir, "BV1_2"), PathBuf::from("/tmp/job/BV1_2.state"));
    }
}
