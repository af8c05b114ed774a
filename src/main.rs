use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bili_fetch::common::logger::PrettyLogger;
use bili_fetch::common::models::Credential;
use bili_fetch::danmaku::DanmakuFormat;
use bili_fetch::downloader::ChunkMode;
use bili_fetch::downloader::progress::ProgressEvent;
use bili_fetch::parser::models::{Codec, PageId, VideoQuality};
use bili_fetch::parser::stream_selector::DegradePolicy;
use bili_fetch::post_process::SubtitleMode;
use bili_fetch::{DownloadOptions, JobDescriptor, Pipeline, Stage};

mod cli;

fn build_job(args: &cli::Cli) -> Result<(JobDescriptor, DownloadOptions)> {
    let page = PageId::parse(&args.url).with_context(|| format!("无法识别的链接: {}", args.url))?;

    let quality_ceiling = VideoQuality::from_id(args.quality).unwrap_or_else(|| {
        warn!("未知的清晰度 {}，使用 1080P", args.quality);
        VideoQuality::Q1080P
    });
    debug!("命令行质量参数: {} -> {:?}", args.quality, quality_ceiling);

    let codec_preference = args
        .vcodec
        .iter()
        .map(|c| c.parse::<Codec>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("编码参数错误: {}", e))?;

    let danmaku_format: DanmakuFormat = args.danmaku_format.parse().map_err(|e: String| anyhow!(e))?;

    let job = JobDescriptor {
        page,
        output_template: args
            .output_dir
            .join(&args.output_template)
            .to_string_lossy()
            .into_owned(),
        quality_ceiling,
        codec_preference,
        concurrency: args.concurrency,
        want_danmaku: !args.no_danmaku,
        credential: args.cookie.as_deref().map(Credential::new),
    };

    let mut options = DownloadOptions {
        chunk_mode: match args.block_size {
            0 => ChunkMode::Single,
            kib => ChunkMode::Sized(kib * 1024),
        },
        max_retries: args.retries,
        job_timeout: args.timeout.map(Duration::from_secs),
        rate_limit: args.rate_limit.map(|kib| kib * 1024),
        degrade: if args.strict_quality {
            DegradePolicy::Strict
        } else {
            DegradePolicy::NextAbove
        },
        danmaku_format,
        subtitle_mode: if args.embed_danmaku {
            SubtitleMode::Embed
        } else {
            SubtitleMode::Sidecar
        },
        overwrite: args.overwrite,
        require_audio: !args.no_audio,
        ..DownloadOptions::default()
    };
    if let Some(dir) = &args.tmp_dir {
        options.temp_dir = dir.clone();
    }

    Ok((job, options))
}

// 按阶段切换进度条
fn spawn_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {msg})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");

        let labels: HashMap<Stage, &'static str> = [
            (Stage::Resolve, "解析中"),
            (Stage::Select, "选择流"),
            (Stage::Plan, "准备分块"),
            (Stage::Download, "下载中"),
            (Stage::Convert, "转换弹幕"),
            (Stage::Assemble, "合并中"),
        ]
        .into_iter()
        .collect();

        let mut current = None;
        while let Some(event) = rx.recv().await {
            if current != Some(event.stage) {
                current = Some(event.stage);
                if event.stage == Stage::Download {
                    bar.set_style(style.clone());
                }
                bar.set_message(labels.get(&event.stage).copied().unwrap_or_default());
            }
            if let Some(total) = event.bytes_total {
                bar.set_length(total);
            }
            bar.set_position(event.bytes_done);
            if let Some(eta) = event.eta {
                bar.set_message(format!("剩余 {}s", eta.as_secs()));
            }
        }
        bar.finish_and_clear();
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(if args.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let (job, options) = build_job(&args)?;
    if job.credential.is_none() {
        warn!("未提供 Cookie，可能无法下载高清或受限内容");
    }

    PrettyLogger::step_start(format!("开始下载: {}", job.page));

    let (tx, rx) = mpsc::unbounded_channel();
    let pipeline = Pipeline::http(job.credential.clone(), options.danmaku_format)?.with_progress(tx);
    let progress = spawn_progress(rx);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在保存下载进度...");
            ctrl_c.cancel();
        }
    });

    let result = pipeline.run(&job, &options, &cancel).await;
    drop(pipeline);
    let _ = progress.await;

    match result {
        Ok(done) if done.skipped => {
            PrettyLogger::warning(format!("输出文件已存在，跳过: {}", done.output.display()));
            Ok(())
        }
        Ok(done) => {
            if done.degraded {
                PrettyLogger::warning("清晰度上限以内没有可用的流，已使用更高一档");
            }
            PrettyLogger::completion_summary(
                &done.output,
                done.subtitle.as_deref(),
                done.duration,
                done.danmaku_skipped,
            );
            info!("{}", "下载完成！".green());
            Ok(())
        }
        Err(e) => {
            PrettyLogger::error(format!("任务失败 {}", e));
            if matches!(e.stage, Stage::Download | Stage::Convert | Stage::Assemble) {
                PrettyLogger::file_info("临时文件已保留，重新运行即可续传", &options.temp_dir);
            }
            Err(e.into())
        }
    }
}
