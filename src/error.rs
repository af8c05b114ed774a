use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::danmaku::DanmakuError;
use crate::downloader::error::DownloadError;
use crate::parser::errors::ResolutionError;
use crate::parser::stream_selector::SelectionError;
use crate::post_process::AssemblyError;

/// 任务所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolve,
    Select,
    Plan,
    Download,
    Convert,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolve => "resolve",
            Stage::Select => "select",
            Stage::Plan => "plan",
            Stage::Download => "download",
            Stage::Convert => "convert",
            Stage::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("解析失败: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("没有可用的流: {0}")]
    NoPlayableRendition(String),
    #[error("分块下载失败: {rendition} #{chunk}: {reason}")]
    DownloadFailed {
        rendition: String,
        chunk: usize,
        reason: String,
    },
    #[error("完整性校验失败: {0}")]
    IntegrityError(String),
    #[error("弹幕无法解析: {0}")]
    UnparseableStream(String),
    #[error("合并失败: {0}")]
    AssemblyError(#[from] AssemblyError),
    #[error("任务超时 ({0:?})")]
    Timeout(Duration),
    #[error("任务已取消")]
    Cancelled,
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SelectionError> for PipelineError {
    fn from(error: SelectionError) -> Self {
        PipelineError::NoPlayableRendition(error.to_string())
    }
}

impl From<DanmakuError> for PipelineError {
    fn from(error: DanmakuError) -> Self {
        match error {
            DanmakuError::UnparseableStream(msg) => PipelineError::UnparseableStream(msg),
        }
    }
}

impl From<DownloadError> for PipelineError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::DownloadFailed {
                rendition,
                chunk,
                reason,
            } => PipelineError::DownloadFailed {
                rendition,
                chunk,
                reason,
            },
            e @ DownloadError::Integrity { .. } => PipelineError::IntegrityError(e.to_string()),
            DownloadError::Cancelled => PipelineError::Cancelled,
            DownloadError::IoError(e) => PipelineError::Io(e),
            e => PipelineError::Io(std::io::Error::other(e.to_string())),
        }
    }
}

/// 失败的任务：出错的阶段加具体原因
#[derive(Debug, Error)]
#[error("[{stage}] {error}")]
pub struct JobError {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl JobError {
    pub fn new(stage: Stage, error: impl Into<PipelineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}
