use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE};
use tracing::debug;

use super::error::FetchError;
use crate::common::client::client::BiliClient;

/// 一次范围请求的响应
pub struct RangeResponse {
    /// 本次响应体的字节数（响应头里有的话）
    pub content_length: Option<u64>,
    /// 整个资源的长度，来自 Content-Range
    pub total_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

/// 分块数据的来源，调度器只通过它取数
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// 资源总长度，服务端不给就是 `None`
    async fn probe_length(&self, locator: &str) -> Result<Option<u64>, FetchError>;

    async fn fetch_range(
        &self,
        locator: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<RangeResponse, FetchError>;
}

pub struct HttpChunkSource {
    client: BiliClient,
}

impl HttpChunkSource {
    pub fn new(client: BiliClient) -> Self {
        Self { client }
    }
}

// "bytes 0-1023/4096" -> (0, 1023, Some(4096))
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

fn header_u64(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn probe_length(&self, locator: &str) -> Result<Option<u64>, FetchError> {
        // 有的 CDN 不支持 HEAD，退回到只取一个字节的范围请求
        if let Ok(resp) = self.client.head(locator).await {
            if resp.status().is_success() {
                if let Some(len) = header_u64(&resp, CONTENT_LENGTH).filter(|l| *l > 0) {
                    return Ok(Some(len));
                }
            }
        }

        let resp = self.client.get_range(locator, Some((0, Some(1)))).await?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .and_then(|(_, _, total)| total)),
            StatusCode::OK => Ok(header_u64(&resp, CONTENT_LENGTH)),
            status => Err(FetchError::Status(status.as_u16())),
        }
    }

    async fn fetch_range(
        &self,
        locator: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<RangeResponse, FetchError> {
        let resp = self.client.get_range(locator, Some((offset, length))).await?;
        let status = resp.status();

        let total_length = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .and_then(|(_, _, total)| total);

        let content_length = match status {
            StatusCode::PARTIAL_CONTENT => header_u64(&resp, CONTENT_LENGTH),
            // 不支持范围请求的服务端会返回整个文件，只能用在偏移为 0 的分块
            StatusCode::OK if offset == 0 => {
                debug!("服务端忽略了 Range 请求头: {}", locator);
                length.or_else(|| header_u64(&resp, CONTENT_LENGTH))
            }
            status => return Err(FetchError::Status(status.as_u16())),
        };

        let total_length = total_length.or_else(|| {
            (status == StatusCode::OK)
                .then(|| header_u64(&resp, CONTENT_LENGTH))
                .flatten()
        });

        let body = resp.bytes_stream().map(|r| r.map_err(FetchError::from));
        let body = match (status, length) {
            // 整个文件返回时截掉本分块之外的部分
            (StatusCode::OK, Some(limit)) => truncate(body, limit).boxed(),
            _ => body.boxed(),
        };

        Ok(RangeResponse {
            content_length,
            total_length,
            body,
        })
    }
}

fn truncate<S>(stream: S, limit: u64) -> impl futures::Stream<Item = Result<Bytes, FetchError>> + Send
where
    S: futures::Stream<Item = Result<Bytes, FetchError>> + Send,
{
    stream
        .scan(0u64, move |taken, item| {
            let out = match item {
                Ok(_) if *taken >= limit => None,
                Ok(mut bytes) => {
                    let remaining = limit - *taken;
                    if bytes.len() as u64 > remaining {
                        bytes.truncate(remaining as usize);
                    }
                    *taken += bytes.len() as u64;
                    Some(Ok(bytes))
                }
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(out)
        })
}
