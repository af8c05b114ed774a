//! 弹幕解析与转换。
//!
//! 两种来源：`comment.bilibili.com/{cid}.xml` 的 XML 文件，
//! 以及 `x/v2/dm/web/seg.so` 按 6 分钟分段返回的 protobuf。
//! 单条记录坏了只跳过并计数，整个载荷无法识别时才报错。

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, warn};

pub mod ass;
pub mod protobuf;
pub mod xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DanmakuFormat {
    #[default]
    Xml,
    Protobuf,
}

impl FromStr for DanmakuFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xml" => Ok(Self::Xml),
            "protobuf" | "proto" | "pb" => Ok(Self::Protobuf),
            other => Err(format!("不支持的弹幕格式: {}", other)),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DanmakuError {
    #[error("无法识别的弹幕数据: {0}")]
    UnparseableStream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DanmakuMode {
    Scroll,
    Bottom,
    Top,
    Reverse,
    Special,
}

impl DanmakuMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1..=3 => Some(Self::Scroll),
            4 => Some(Self::Bottom),
            5 => Some(Self::Top),
            6 => Some(Self::Reverse),
            7..=9 => Some(Self::Special),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DanmakuStyle {
    pub mode: DanmakuMode,
    pub font_size: u32,
    /// 0xRRGGBB
    pub color: u32,
}

impl Default for DanmakuStyle {
    fn default() -> Self {
        Self {
            mode: DanmakuMode::Scroll,
            font_size: 25,
            color: 0xFFFFFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanmakuEntry {
    /// 相对视频开头的毫秒数
    pub time_ms: u64,
    pub text: String,
    pub style: DanmakuStyle,
}

impl fmt::Display for DanmakuEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}ms] {}", self.time_ms, self.text)
    }
}

/// 按时间升序排好的弹幕
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DanmakuDocument {
    entries: Vec<DanmakuEntry>,
    skipped: usize,
}

impl DanmakuDocument {
    /// 稳定排序，同一时刻的弹幕保持原顺序
    pub fn new(mut entries: Vec<DanmakuEntry>, skipped: usize) -> Self {
        entries.sort_by_key(|e| e.time_ms);
        Self { entries, skipped }
    }

    pub fn entries(&self) -> &[DanmakuEntry] {
        &self.entries
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 下载到的原始弹幕
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawDanmaku {
    Xml(Vec<u8>),
    /// 每个元素是一个分段的完整响应体
    Protobuf(Vec<Vec<u8>>),
}

pub struct DanmakuConverter;

impl DanmakuConverter {
    pub fn convert(raw: &RawDanmaku) -> Result<DanmakuDocument, DanmakuError> {
        let (entries, skipped) = match raw {
            RawDanmaku::Xml(bytes) => xml::parse(bytes)?,
            RawDanmaku::Protobuf(segments) => {
                let mut entries = Vec::new();
                let mut skipped = 0;
                for segment in segments {
                    let (mut e, s) = protobuf::parse_segment(segment)?;
                    entries.append(&mut e);
                    skipped += s;
                }
                (entries, skipped)
            }
        };

        if skipped > 0 {
            warn!("跳过了 {} 条格式错误的弹幕", skipped);
        }
        debug!("弹幕解析完成，共 {} 条", entries.len());

        Ok(DanmakuDocument::new(entries, skipped))
    }
}
