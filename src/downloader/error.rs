use std::fmt;

#[derive(Debug)]
pub enum DownloadError {
    DownloadFailed {
        rendition: String,
        chunk: usize,
        reason: String,
    },
    Integrity {
        rendition: String,
        expected: Option<u64>,
        actual: u64,
    },
    Cancelled,
    IoError(std::io::Error),
    State(String),
    SemaphoreError,
    TaskPanicked(String),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::DownloadFailed {
                rendition,
                chunk,
                reason,
            } => write!(f, "分块下载失败: {} #{}: {}", rendition, chunk, reason),
            DownloadError::Integrity {
                rendition,
                expected,
                actual,
            } => match expected {
                Some(expected) => write!(
                    f,
                    "完整性校验失败: {} 期望 {} 字节，实际 {} 字节",
                    rendition, expected, actual
                ),
                None => write!(f, "完整性校验失败: {} 实际 {} 字节", rendition, actual),
            },
            DownloadError::Cancelled => write!(f, "下载已取消"),
            DownloadError::IoError(e) => write!(f, "IO错误: {}", e),
            DownloadError::State(msg) => write!(f, "下载状态错误: {}", msg),
            DownloadError::SemaphoreError => write!(f, "信号量错误"),
            DownloadError::TaskPanicked(msg) => write!(f, "下载任务异常退出: {}", msg),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DownloadError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        DownloadError::IoError(error)
    }
}

/// 单次取数失败的原因，只在调度器内部流转
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// 网络或服务端错误，可重试
    Http(String),
    Status(u16),
    ShortRead { expected: u64, actual: u64 },
    Timeout,
    Io(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Http(msg) => write!(f, "HTTP错误: {}", msg),
            FetchError::Status(code) => write!(f, "HTTP 状态异常: {}", code),
            FetchError::ShortRead { expected, actual } => {
                write!(f, "数据不完整: 期望 {} 字节，实际 {} 字节", expected, actual)
            }
            FetchError::Timeout => write!(f, "请求超时"),
            FetchError::Io(msg) => write!(f, "写入失败: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Http(error.to_string())
        }
    }
}

impl From<crate::common::client::error::ApiError> for FetchError {
    fn from(error: crate::common::client::error::ApiError) -> Self {
        use crate::common::client::error::ApiError;
        match error {
            ApiError::Reqwest(e) => e.into(),
            ApiError::Status(code) => FetchError::Status(code),
            other => FetchError::Http(other.to_string()),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(error: std::io::Error) -> Self {
        FetchError::Io(error.to_string())
    }
}
