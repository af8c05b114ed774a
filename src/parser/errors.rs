use thiserror::Error;

use crate::common::client::error::ApiError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("视频不存在: {0}")]
    NotFound(String),
    #[error("无权访问: {0}")]
    AccessDenied(String),
    #[error("响应格式错误: {0}")]
    MalformedResponse(String),
    #[error("临时错误: {0}")]
    Transient(String),
}

impl ResolutionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    // B站业务错误码映射
    pub fn from_api_code(code: i64, message: &str) -> Self {
        let detail = format!("({}) {}", code, message);
        match code {
            -404 | 62002 | 62004 => Self::NotFound(detail),
            -403 | -10403 | -101 | 87008 => Self::AccessDenied(detail),
            -412 | -503 | -500 | -509 => Self::Transient(detail),
            _ => Self::MalformedResponse(detail),
        }
    }
}

impl From<ApiError> for ResolutionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Reqwest(e) => {
                if e.is_decode() {
                    ResolutionError::MalformedResponse(e.to_string())
                } else {
                    ResolutionError::Transient(e.to_string())
                }
            }
            ApiError::Status(code) => match code {
                401 | 403 => ResolutionError::AccessDenied(format!("HTTP {}", code)),
                404 => ResolutionError::NotFound(format!("HTTP {}", code)),
                412 | 429 => ResolutionError::Transient(format!("HTTP {}，可能触发了风控", code)),
                c if c >= 500 => ResolutionError::Transient(format!("HTTP {}", code)),
                _ => ResolutionError::MalformedResponse(format!("HTTP {}", code)),
            },
            ApiError::ApiError(code, msg) => ResolutionError::from_api_code(code, &msg),
            ApiError::InvalidResponse(msg) => ResolutionError::MalformedResponse(msg),
            // 返回 HTML 多半是风控页
            ApiError::HtmlResponse => ResolutionError::Transient("返回了 HTML 页面".to_string()),
        }
    }
}
