use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::errors::ResolutionError;

// 取不到 deadline 参数时，认为链接在解析后 110 分钟过期
pub const DEFAULT_LOCATOR_TTL_MINUTES: i64 = 110;

// 视频清晰度选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VideoQuality {
    Q240P = 6,      // 极速 240P
    Q360P = 16,     // 流畅 360P
    Q480P = 32,     // 清晰 480P
    Q720P = 64,     // 高清 720P
    Q720P60 = 74,   // 高清 720P60
    Q1080P = 80,    // 高清 1080P
    Q1080PP = 112,  // 高清 1080P+
    Q1080P60 = 116, // 高清 1080P60
    Q4K = 120,      // 超清 4K
    QHdr = 125,     // HDR 真彩色
    QDolby = 126,   // 杜比视界
    Q8K = 127,      // 超高清 8K
}

impl Default for VideoQuality {
    fn default() -> Self {
        Self::Q1080P // 默认选择 1080P
    }
}

impl VideoQuality {
    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            6 => Self::Q240P,
            16 => Self::Q360P,
            32 => Self::Q480P,
            64 => Self::Q720P,
            74 => Self::Q720P60,
            80 => Self::Q1080P,
            112 => Self::Q1080PP,
            116 => Self::Q1080P60,
            120 => Self::Q4K,
            125 => Self::QHdr,
            126 => Self::QDolby,
            127 => Self::Q8K,
            _ => return None,
        })
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Q240P => "240P 极速",
            Self::Q360P => "360P 流畅",
            Self::Q480P => "480P 清晰",
            Self::Q720P => "720P 高清",
            Self::Q720P60 => "720P60 高帧率",
            Self::Q1080P => "1080P 高清",
            Self::Q1080PP => "1080P+ 高码率",
            Self::Q1080P60 => "1080P60 高帧率",
            Self::Q4K => "4K 超清",
            Self::QHdr => "HDR 真彩色",
            Self::QDolby => "杜比视界",
            Self::Q8K => "8K 超高清",
        }
    }
}

// 音频质量，数值即接口里的 id
pub enum AudioQuality {
    Quality64k = 30216,
    Quality132k = 30232,
    QualityDolby = 30250,
    QualityHiRes = 30251,
    Quality192k = 30280,
}

impl AudioQuality {
    // 从高到低的优先级
    pub const PRIORITY: [u32; 5] = [
        AudioQuality::QualityHiRes as u32,
        AudioQuality::QualityDolby as u32,
        AudioQuality::Quality192k as u32,
        AudioQuality::Quality132k as u32,
        AudioQuality::Quality64k as u32,
    ];

    /// 优先级越小越好，未知 id 排在最后
    pub fn rank(id: u32) -> usize {
        Self::PRIORITY
            .iter()
            .position(|q| *q == id)
            .unwrap_or(Self::PRIORITY.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Codec {
    Avc,
    Hevc,
    Av1,
    Mp4a,
    Flac,
    Eac3,
    DanmakuXml,
    DanmakuProtobuf,
    Other(String),
}

impl Codec {
    // 接口里 dash.video[].codecid 的取值
    pub fn from_video_codecid(id: u32) -> Option<Self> {
        match id {
            7 => Some(Self::Avc),
            12 => Some(Self::Hevc),
            13 => Some(Self::Av1),
            _ => None,
        }
    }

    // 形如 "avc1.640032"、"hev1.1.6.L150.90"、"mp4a.40.2"、"fLaC"
    pub fn from_codecs_str(codecs: &str) -> Self {
        let lower = codecs.trim().to_ascii_lowercase();
        let prefix = lower.split('.').next().unwrap_or_default();
        match prefix {
            "avc1" | "avc3" => Self::Avc,
            "hev1" | "hvc1" => Self::Hevc,
            "av01" => Self::Av1,
            "mp4a" => Self::Mp4a,
            "flac" => Self::Flac,
            "ec-3" | "eac3" => Self::Eac3,
            "" => Self::Other("unknown".to_string()),
            other => Self::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Avc => "avc",
            Self::Hevc => "hevc",
            Self::Av1 => "av1",
            Self::Mp4a => "mp4a",
            Self::Flac => "flac",
            Self::Eac3 => "eac3",
            Self::DanmakuXml => "xml",
            Self::DanmakuProtobuf => "protobuf",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avc" | "h264" | "avc1" => Ok(Self::Avc),
            "hevc" | "h265" | "hev1" => Ok(Self::Hevc),
            "av1" | "av01" => Ok(Self::Av1),
            "mp4a" | "aac" => Ok(Self::Mp4a),
            "flac" => Ok(Self::Flac),
            "eac3" | "ec-3" => Ok(Self::Eac3),
            other => Err(format!("不支持的编码: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RenditionKind {
    Video,
    Audio,
    Danmaku,
}

impl fmt::Display for RenditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Danmaku => "danmaku",
        };
        f.write_str(s)
    }
}

/// 一路可下载的流。
///
/// `quality` 对视频是清晰度 id，对音频是音质 id，对弹幕是分段数。
/// protobuf 弹幕的 `locator` 不带 `segment_index`，取流时按分段数逐段补上。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionDescriptor {
    pub kind: RenditionKind,
    pub quality: u32,
    pub codec: Codec,
    pub byte_length: Option<u64>,
    pub locator: String,
    pub mirrors: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub expires_at: DateTime<Utc>,
}

impl RenditionDescriptor {
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.kind, self.quality, self.codec.tag())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 主地址在前，备用地址在后
    pub fn locators(&self) -> Vec<String> {
        std::iter::once(self.locator.clone())
            .chain(self.mirrors.iter().cloned())
            .collect()
    }

    pub fn with_byte_length(mut self, len: Option<u64>) -> Self {
        self.byte_length = len;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Title {
    pub id: String,
    pub name: String,
    pub aid: u64,
    pub bvid: String,
    pub cid: u64,
    pub duration_secs: u64,
    pub renditions: Vec<RenditionDescriptor>,
    pub resolved_at: DateTime<Utc>,
}

impl Title {
    pub fn renditions_of(&self, kind: RenditionKind) -> impl Iterator<Item = &RenditionDescriptor> {
        self.renditions.iter().filter(move |r| r.kind == kind)
    }

    /// 最早过期的一路流决定整个目录是否需要重新解析
    pub fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        self.renditions.iter().map(|r| r.expires_at).min()
    }
}

/// 从地址里的 `deadline` 参数推算过期时间
pub fn locator_expiry(locator: &str, resolved_at: DateTime<Utc>) -> DateTime<Utc> {
    let from_query = Url::parse(locator).ok().and_then(|url| {
        url.query_pairs()
            .find(|(k, _)| k == "deadline")
            .and_then(|(_, v)| v.parse::<i64>().ok())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    });

    from_query.unwrap_or(resolved_at + ChronoDuration::minutes(DEFAULT_LOCATOR_TTL_MINUTES))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoKey {
    Bvid(String),
    Aid(u64),
    Episode(u64),
}

impl fmt::Display for VideoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bvid(bvid) => write!(f, "普通视频 {}", bvid),
            Self::Aid(aid) => write!(f, "普通视频 av{}", aid),
            Self::Episode(ep) => write!(f, "番剧 EP{}", ep),
        }
    }
}

/// 页面标识：视频 id 加分 P 序号（从 1 开始）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageId {
    pub key: VideoKey,
    pub part: u32,
}

static BV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(BV[0-9A-Za-z]{10})").unwrap());
static AV_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bav(\d+)").unwrap());
static EP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bep(\d+)").unwrap());

impl PageId {
    pub fn new(key: VideoKey) -> Self {
        Self { key, part: 1 }
    }

    pub fn with_part(mut self, part: u32) -> Self {
        self.part = part.max(1);
        self
    }

    pub fn parse(input: &str) -> Result<Self, ResolutionError> {
        let input = input.trim();

        // 完整链接里可能带 ?p=N
        let part = Url::parse(input)
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(k, _)| k == "p")
                    .and_then(|(_, v)| v.parse::<u32>().ok())
            })
            .unwrap_or(1);

        let key = if let Some(caps) = BV_RE.captures(input) {
            let raw = &caps[1];
            // 前缀统一成大写 BV，后面的部分大小写敏感
            VideoKey::Bvid(format!("BV{}", &raw[2..]))
        } else if let Some(caps) = EP_RE.captures(input) {
            VideoKey::Episode(parse_numeric(&caps[1])?)
        } else if let Some(caps) = AV_RE.captures(input) {
            VideoKey::Aid(parse_numeric(&caps[1])?)
        } else {
            return Err(ResolutionError::NotFound(format!("无法识别的视频标识: {}", input)));
        };

        Ok(Self::new(key).with_part(part))
    }
}

fn parse_numeric(raw: &str) -> Result<u64, ResolutionError> {
    raw.parse()
        .map_err(|_| ResolutionError::NotFound(format!("无效的数字 id: {}", raw)))
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} P{}", self.key, self.part)
    }
}
