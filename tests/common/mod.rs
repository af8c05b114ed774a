#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;

use bili_fetch::downloader::error::FetchError;
use bili_fetch::downloader::source::{ChunkSource, RangeResponse};
use bili_fetch::parser::TitleResolver;
use bili_fetch::parser::errors::ResolutionError;
use bili_fetch::parser::models::{Codec, PageId, RenditionDescriptor, RenditionKind, Title};

/// 确定性的伪随机字节
pub fn sample_bytes(len: usize) -> Bytes {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect::<Vec<u8>>()
        .into()
}

pub fn descriptor(kind: RenditionKind, quality: u32, codec: Codec, len: Option<u64>, locator: &str) -> RenditionDescriptor {
    RenditionDescriptor {
        kind,
        quality,
        codec,
        byte_length: len,
        locator: locator.to_string(),
        mirrors: Vec::new(),
        width: Some(1920),
        height: Some(1080),
        expires_at: Utc::now() + ChronoDuration::hours(1),
    }
}

pub fn title(renditions: Vec<RenditionDescriptor>) -> Title {
    Title {
        id: "BV1xx411c7mD_62131".to_string(),
        name: "测试视频".to_string(),
        aid: 170001,
        bvid: "BV1xx411c7mD".to_string(),
        cid: 62131,
        duration_secs: 600,
        renditions,
        resolved_at: Utc::now(),
    }
}

// 离开作用域时把在途计数减回去，取消时也一样
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// 模拟数据文件被外部改坏
struct Truncation {
    locator: String,
    offset: u64,
    target: PathBuf,
    len: u64,
}

/// 内存里的数据源，记录并发和请求次数
#[derive(Default)]
pub struct MemorySource {
    objects: HashMap<String, Bytes>,
    delay: Duration,
    report_length: bool,
    failing_offsets: HashSet<u64>,
    short_reads: Mutex<HashSet<u64>>,
    truncations: Vec<Truncation>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            report_length: true,
            ..Default::default()
        }
    }

    pub fn with_object(mut self, locator: &str, data: Bytes) -> Self {
        self.objects.insert(locator.to_string(), data);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 从这个偏移开始的请求总是返回 503
    pub fn failing_at(mut self, offset: u64) -> Self {
        self.failing_offsets.insert(offset);
        self
    }

    /// 这个偏移的第一次请求只返回一半数据
    pub fn short_read_once_at(self, offset: u64) -> Self {
        self.short_reads
            .lock()
            .expect("lock")
            .insert(offset);
        self
    }

    /// 每次请求 `locator` 的 `offset` 时，先把 `target` 截断到 `len`
    pub fn truncating_on(mut self, locator: &str, offset: u64, target: &Path, len: u64) -> Self {
        self.truncations.push(Truncation {
            locator: locator.to_string(),
            offset,
            target: target.to_path_buf(),
            len,
        });
        self
    }

    pub fn without_length(mut self) -> Self {
        self.report_length = false;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    async fn probe_length(&self, locator: &str) -> Result<Option<u64>, FetchError> {
        let data = self.objects.get(locator).ok_or(FetchError::Status(404))?;
        Ok(self.report_length.then_some(data.len() as u64))
    }

    async fn fetch_range(
        &self,
        locator: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<RangeResponse, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing_offsets.contains(&offset) {
            return Err(FetchError::Status(503));
        }

        for t in self.truncations.iter().filter(|t| t.locator == locator && t.offset == offset) {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&t.target)
                .and_then(|f| f.set_len(t.len))
                .expect("truncate");
        }

        let data = self.objects.get(locator).ok_or(FetchError::Status(404))?;
        let total = data.len() as u64;
        if offset > total {
            return Err(FetchError::Status(416));
        }
        let end = length.map_or(total, |len| (offset + len).min(total));
        let mut body = data.slice(offset as usize..end as usize);

        if self.short_reads.lock().expect("lock").remove(&offset) {
            body.truncate(body.len() / 2);
        }

        let content_length = Some(end - offset);
        let pieces: Vec<Result<Bytes, FetchError>> = body
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        Ok(RangeResponse {
            content_length,
            total_length: Some(total),
            body: futures::stream::iter(pieces).boxed(),
        })
    }
}

/// 按顺序返回预设结果的解析器
pub struct ScriptedResolver {
    responses: Mutex<VecDeque<Result<Title, ResolutionError>>>,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(responses: Vec<Result<Title, ResolutionError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TitleResolver for ScriptedResolver {
    async fn resolve(&self, _page: &PageId) -> Result<Title, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(ResolutionError::NotFound("没有更多预设结果".to_string())))
    }
}
