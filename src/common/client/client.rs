use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::{
    Client, ClientBuilder, RequestBuilder, Response,
    header::{ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, COOKIE, HeaderMap, HeaderValue, REFERER, USER_AGENT},
};
use serde_json::Value;
use tracing::{debug, error};

use super::error::ApiError;
use crate::common::models::Credential;

const API_TIMEOUT: Duration = Duration::from_secs(10);

// 携带登录凭据的 B站 客户端
#[derive(Debug, Clone)]
pub struct BiliClient {
    inner: Client,
    credential: Option<Credential>,
}

impl BiliClient {
    pub fn new(credential: Option<Credential>) -> Result<Self, ApiError> {
        let inner = ClientBuilder::new()
            .connect_timeout(API_TIMEOUT)
            .default_headers(Self::get_default_headers())
            .build()?;

        Ok(Self {
            inner,
            credential: credential.filter(|c| !c.is_empty()),
        })
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9"));
        // 分段下载依赖原始字节偏移，不能让服务端压缩
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(REFERER, HeaderValue::from_static("https://www.bilibili.com/"));
        headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36"));
        headers
    }

    fn with_credential(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(cred) => builder.header(COOKIE, cred.as_header_value()),
            None => builder,
        }
    }

    // 请求 JSON 接口，返回通过业务码检查后的完整响应
    pub async fn get_json(&self, url: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let resp = self
            .with_credential(self.inner.get(url).query(params))
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                error!("请求失败: {}", e);
                ApiError::Reqwest(e)
            })?;

        Self::handle_response(resp).await
    }

    // 范围请求，`range` 为 (起始偏移, 长度)，长度为空表示读到结尾
    pub async fn get_range(&self, url: &str, range: Option<(u64, Option<u64>)>) -> Result<Response, ApiError> {
        let mut builder = self.with_credential(self.inner.get(url));
        if let Some((offset, length)) = range {
            let value = match length {
                Some(len) if len > 0 => format!("bytes={}-{}", offset, offset + len - 1),
                _ => format!("bytes={}-", offset),
            };
            builder = builder.header(reqwest::header::RANGE, value);
        }
        Ok(builder.send().await?)
    }

    pub async fn head(&self, url: &str) -> Result<Response, ApiError> {
        let resp = self
            .with_credential(self.inner.head(url))
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        Ok(resp)
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Bytes, ApiError> {
        let resp = self.get_range(url, None).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        Ok(resp.bytes().await?)
    }

    fn try_decompress(raw: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut decoder = GzDecoder::new(raw);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded)?;
        Ok(decoded)
    }

    async fn handle_response(resp: Response) -> Result<Value, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let url = resp.url().to_string();
        let raw_body = resp.bytes().await?;

        // gzip 魔数开头才解压，否则原样使用
        let body = if raw_body.starts_with(&[0x1f, 0x8b]) {
            Self::try_decompress(&raw_body).unwrap_or_else(|_| raw_body.to_vec())
        } else {
            raw_body.to_vec()
        };

        let text = String::from_utf8_lossy(&body);

        match serde_json::from_str::<Value>(&text) {
            Ok(json_value) => {
                if let Some(code) = json_value.get("code").and_then(|v| v.as_i64()) {
                    if code != 0 {
                        let message = json_value
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or("Unknown error")
                            .to_string();
                        debug!("接口 {} 返回错误码 {}: {}", url, code, message);
                        return Err(ApiError::ApiError(code, message));
                    }
                }
                Ok(json_value)
            }
            Err(e) => {
                if text.contains("<!DOCTYPE html>") || text.contains("<html") {
                    return Err(ApiError::HtmlResponse);
                }
                error!("失败的请求的URL: {}", url);
                Err(ApiError::InvalidResponse(e.to_string()))
            }
        }
    }
}
