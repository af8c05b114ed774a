use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("网络请求失败: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("HTTP 状态异常: {0}")]
    Status(u16),

    #[error("响应解析失败: {0}")]
    InvalidResponse(String),

    #[error("B站 API 错误({0}): {1}")]
    ApiError(i64, String), // B站 API 返回的业务错误码

    #[error("返回了 HTML 页面而不是 JSON")]
    HtmlResponse,
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}
