use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::errors::ResolutionError;
use super::models::{
    Codec, PageId, RenditionDescriptor, RenditionKind, Title, VideoKey, locator_expiry,
};
use super::play_url::{DashItem, PlayUrlData, SeasonData, ViewData};
use crate::common::client::client::BiliClient;
use crate::danmaku::DanmakuFormat;

const VIEW_API: &str = "https://api.bilibili.com/x/web-interface/view";
const PLAY_URL_API: &str = "https://api.bilibili.com/x/player/playurl";
const SEASON_API: &str = "https://api.bilibili.com/pgc/view/web/season";
const PGC_PLAY_URL_API: &str = "https://api.bilibili.com/pgc/player/web/playurl";
const DANMAKU_XML_API: &str = "https://comment.bilibili.com";
const DANMAKU_SEG_API: &str = "https://api.bilibili.com/x/v2/dm/web/seg.so";

// 每个 protobuf 弹幕分段覆盖 6 分钟
pub const DANMAKU_SEGMENT_SECS: u64 = 360;

/// 把页面标识解析成完整的流目录
#[async_trait]
pub trait TitleResolver: Send + Sync {
    async fn resolve(&self, page: &PageId) -> Result<Title, ResolutionError>;
}

/// 单个分 P 的基本信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub aid: u64,
    pub bvid: String,
    pub cid: u64,
    pub name: String,
    pub duration_secs: u64,
    pub ep_id: Option<u64>,
}

pub struct Resolver {
    client: BiliClient,
    danmaku_format: DanmakuFormat,
}

impl Resolver {
    pub fn new(client: BiliClient, danmaku_format: DanmakuFormat) -> Self {
        Self {
            client,
            danmaku_format,
        }
    }

    async fn fetch_page_info(&self, page: &PageId) -> Result<PageInfo, ResolutionError> {
        match &page.key {
            VideoKey::Bvid(bvid) => {
                let body = self
                    .client
                    .get_json(VIEW_API, &[("bvid", bvid.clone())])
                    .await?;
                parse_view(&body, page.part)
            }
            VideoKey::Aid(aid) => {
                let body = self
                    .client
                    .get_json(VIEW_API, &[("aid", aid.to_string())])
                    .await?;
                parse_view(&body, page.part)
            }
            VideoKey::Episode(ep_id) => {
                let body = self
                    .client
                    .get_json(SEASON_API, &[("ep_id", ep_id.to_string())])
                    .await?;
                parse_season(&body, *ep_id)
            }
        }
    }

    async fn fetch_play_url(&self, info: &PageInfo) -> Result<Value, ResolutionError> {
        let mut params = vec![
            ("bvid", info.bvid.clone()),
            ("cid", info.cid.to_string()),
            ("qn", "127".to_string()),
            ("fnver", "0".to_string()),
            ("fnval", "4048".to_string()),
            ("fourk", "1".to_string()),
        ];

        let api = match info.ep_id {
            Some(ep_id) => {
                params.push(("avid", info.aid.to_string()));
                params.push(("ep_id", ep_id.to_string()));
                PGC_PLAY_URL_API
            }
            None => PLAY_URL_API,
        };

        Ok(self.client.get_json(api, &params).await?)
    }
}

#[async_trait]
impl TitleResolver for Resolver {
    async fn resolve(&self, page: &PageId) -> Result<Title, ResolutionError> {
        info!("开始解析: {}", page);

        let info = self.fetch_page_info(page).await?;
        debug!("分P信息: {:?}", info);

        let body = self.fetch_play_url(&info).await?;
        let resolved_at = Utc::now();
        let mut renditions = parse_play_url(&body, resolved_at)?;
        renditions.push(danmaku_rendition(
            self.danmaku_format,
            &info,
            resolved_at,
        ));

        let title = build_title(info, renditions, resolved_at);
        info!(
            "解析完成: {} ({} 路流)",
            title.name,
            title.renditions.len()
        );
        Ok(title)
    }
}

// data 或 result，番剧接口新版本还会再套一层 video_info
fn payload<'a>(body: &'a Value) -> Result<&'a Value, ResolutionError> {
    let data = body
        .get("data")
        .filter(|v| !v.is_null())
        .or_else(|| body.get("result").filter(|v| !v.is_null()))
        .ok_or_else(|| ResolutionError::MalformedResponse("响应中缺少 data/result 字段".to_string()))?;

    Ok(data.get("video_info").filter(|v| v.is_object()).unwrap_or(data))
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, ResolutionError> {
    serde_json::from_value(value.clone()).map_err(|e| ResolutionError::MalformedResponse(e.to_string()))
}

pub fn parse_view(body: &Value, part: u32) -> Result<PageInfo, ResolutionError> {
    let view: ViewData = decode(payload(body)?)?;

    let aid = view
        .aid
        .ok_or_else(|| ResolutionError::MalformedResponse("缺少 aid".to_string()))?;
    let bvid = view
        .bvid
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolutionError::MalformedResponse("缺少 bvid".to_string()))?;
    let title = view
        .title
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolutionError::MalformedResponse("缺少 title".to_string()))?;

    let pages = view.pages.unwrap_or_default();
    if pages.is_empty() {
        // 老稿件可能没有 pages，只能用顶层 cid
        if part > 1 {
            return Err(ResolutionError::NotFound(format!("{} 没有 P{}", bvid, part)));
        }
        let cid = view
            .cid
            .ok_or_else(|| ResolutionError::MalformedResponse("缺少 cid".to_string()))?;
        return Ok(PageInfo {
            aid,
            bvid,
            cid,
            name: title,
            duration_secs: view.duration.unwrap_or(0),
            ep_id: None,
        });
    }

    let page_count = pages.len();
    let page = pages
        .into_iter()
        .enumerate()
        .find(|(i, p)| p.page.unwrap_or(*i as u32 + 1) == part)
        .map(|(_, p)| p)
        .ok_or_else(|| ResolutionError::NotFound(format!("{} 没有 P{}", bvid, part)))?;

    let cid = page
        .cid
        .ok_or_else(|| ResolutionError::MalformedResponse("分P缺少 cid".to_string()))?;

    // 多P视频用分P标题区分
    let name = match page.part.filter(|p| !p.is_empty()) {
        Some(part_name) if page_count > 1 && part_name != title => format!("{} - {}", title, part_name),
        _ => title,
    };

    Ok(PageInfo {
        aid,
        bvid,
        cid,
        name,
        duration_secs: page.duration.or(view.duration).unwrap_or(0),
        ep_id: None,
    })
}

pub fn parse_season(body: &Value, ep_id: u64) -> Result<PageInfo, ResolutionError> {
    let season: SeasonData = decode(payload(body)?)?;

    let episode = season
        .episodes
        .unwrap_or_default()
        .into_iter()
        .find(|ep| ep.id.or(ep.ep_id) == Some(ep_id))
        .ok_or_else(|| ResolutionError::NotFound(format!("剧集中没有 ep{}", ep_id)))?;

    let aid = episode
        .aid
        .ok_or_else(|| ResolutionError::MalformedResponse("剧集缺少 aid".to_string()))?;
    let bvid = episode
        .bvid
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolutionError::MalformedResponse("剧集缺少 bvid".to_string()))?;
    let cid = episode
        .cid
        .ok_or_else(|| ResolutionError::MalformedResponse("剧集缺少 cid".to_string()))?;

    let season_title = season
        .season_title
        .or(season.title)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolutionError::MalformedResponse("缺少剧集标题".to_string()))?;

    let episode_name = episode
        .show_title
        .or_else(|| match (episode.title, episode.long_title) {
            (Some(t), Some(l)) if !l.is_empty() => Some(format!("第{}话 {}", t, l)),
            (Some(t), _) => Some(format!("第{}话", t)),
            (None, l) => l,
        })
        .filter(|s| !s.is_empty());

    let name = match episode_name {
        Some(ep_name) => format!("{} {}", season_title, ep_name),
        None => season_title,
    };

    Ok(PageInfo {
        aid,
        bvid,
        cid,
        name,
        duration_secs: episode.duration.unwrap_or(0) / 1000,
        ep_id: Some(ep_id),
    })
}

/// 从 playurl 响应里取出所有媒体流，DASH 和 durl 两种形态都支持
pub fn parse_play_url(
    body: &Value,
    resolved_at: DateTime<Utc>,
) -> Result<Vec<RenditionDescriptor>, ResolutionError> {
    let data: PlayUrlData = decode(payload(body)?)?;
    let mut renditions = Vec::new();

    if let Some(dash) = data.dash {
        for item in dash.video.unwrap_or_default() {
            match dash_rendition(RenditionKind::Video, &item, resolved_at) {
                Some(r) => renditions.push(r),
                None => warn!("跳过字段不全的视频流: {:?}", item.id),
            }
        }

        let flac = dash.flac.and_then(|f| f.audio);
        let dolby = dash.dolby.and_then(|d| d.audio).unwrap_or_default();
        let audio_items = dash
            .audio
            .unwrap_or_default()
            .into_iter()
            .chain(flac)
            .chain(dolby);

        for item in audio_items {
            match dash_rendition(RenditionKind::Audio, &item, resolved_at) {
                Some(r) => renditions.push(r),
                None => warn!("跳过字段不全的音频流: {:?}", item.id),
            }
        }
    } else if let Some(durl) = data.durl {
        if durl.len() > 1 {
            return Err(ResolutionError::MalformedResponse(format!(
                "不支持分段的 durl 流 ({} 段)",
                durl.len()
            )));
        }
        if let Some(item) = durl.into_iter().next() {
            let locator = item
                .url
                .filter(|u| !u.is_empty())
                .ok_or_else(|| ResolutionError::MalformedResponse("durl 缺少 url".to_string()))?;
            let quality = data
                .quality
                .ok_or_else(|| ResolutionError::MalformedResponse("durl 缺少 quality".to_string()))?;
            let codec = if locator.contains(".flv") {
                Codec::Other("flv".to_string())
            } else {
                Codec::Avc
            };
            renditions.push(RenditionDescriptor {
                kind: RenditionKind::Video,
                quality,
                codec,
                byte_length: item.size.filter(|s| *s > 0),
                expires_at: locator_expiry(&locator, resolved_at),
                locator,
                mirrors: item.backup_url.unwrap_or_default(),
                width: None,
                height: None,
            });
        }
    }

    if !renditions.iter().any(|r| r.kind == RenditionKind::Video) {
        return Err(ResolutionError::MalformedResponse(
            "没有可播放的视频流".to_string(),
        ));
    }

    debug!("playurl 中共解析出 {} 路媒体流", renditions.len());
    Ok(renditions)
}

fn dash_rendition(
    kind: RenditionKind,
    item: &DashItem,
    resolved_at: DateTime<Utc>,
) -> Option<RenditionDescriptor> {
    let quality = item.id?;
    let locator = item.base_url.clone().filter(|u| !u.is_empty())?;

    let codec = match kind {
        RenditionKind::Video => item
            .codecid
            .and_then(Codec::from_video_codecid)
            .or_else(|| item.codecs.as_deref().map(Codec::from_codecs_str))?,
        _ => item
            .codecs
            .as_deref()
            .map(Codec::from_codecs_str)
            .unwrap_or(Codec::Mp4a),
    };

    Some(RenditionDescriptor {
        kind,
        quality,
        codec,
        byte_length: None,
        expires_at: locator_expiry(&locator, resolved_at),
        locator,
        mirrors: item.backup_url.clone().unwrap_or_default(),
        width: item.width.filter(|_| kind == RenditionKind::Video),
        height: item.height.filter(|_| kind == RenditionKind::Video),
    })
}

pub fn danmaku_segment_count(duration_secs: u64) -> u32 {
    duration_secs.div_ceil(DANMAKU_SEGMENT_SECS).max(1) as u32
}

pub fn danmaku_rendition(
    format: DanmakuFormat,
    info: &PageInfo,
    resolved_at: DateTime<Utc>,
) -> RenditionDescriptor {
    let (codec, locator) = match format {
        DanmakuFormat::Xml => (
            Codec::DanmakuXml,
            format!("{}/{}.xml", DANMAKU_XML_API, info.cid),
        ),
        DanmakuFormat::Protobuf => (
            Codec::DanmakuProtobuf,
            format!("{}?type=1&oid={}&pid={}", DANMAKU_SEG_API, info.cid, info.aid),
        ),
    };

    // 弹幕没有清晰度，分段数由时长决定
    RenditionDescriptor {
        kind: RenditionKind::Danmaku,
        quality: 0,
        codec,
        byte_length: None,
        expires_at: locator_expiry(&locator, resolved_at),
        locator,
        mirrors: Vec::new(),
        width: None,
        height: None,
    }
}

pub fn build_title(
    info: PageInfo,
    renditions: Vec<RenditionDescriptor>,
    resolved_at: DateTime<Utc>,
) -> Title {
    Title {
        id: format!("{}_{}", info.bvid, info.cid),
        name: info.name,
        aid: info.aid,
        bvid: info.bvid,
        cid: info.cid,
        duration_secs: info.duration_secs,
        renditions,
        resolved_at,
    }
}
