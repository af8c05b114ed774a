//! 接口响应里用得到的字段。
//!
//! 字段全部可选：只取认识的字段，其余忽略；必需字段缺失时由解析函数报错。

use serde::Deserialize;

// x/web-interface/view 的 data
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ViewData {
    pub aid: Option<u64>,
    pub bvid: Option<String>,
    pub title: Option<String>,
    pub cid: Option<u64>,
    pub duration: Option<u64>,
    pub pages: Option<Vec<ViewPage>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ViewPage {
    pub cid: Option<u64>,
    pub page: Option<u32>,
    pub part: Option<String>,
    pub duration: Option<u64>,
}

// pgc/view/web/season 的 result
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SeasonData {
    pub title: Option<String>,
    pub season_title: Option<String>,
    pub episodes: Option<Vec<SeasonEpisode>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SeasonEpisode {
    pub id: Option<u64>,
    pub ep_id: Option<u64>,
    pub aid: Option<u64>,
    pub bvid: Option<String>,
    pub cid: Option<u64>,
    pub title: Option<String>,
    pub long_title: Option<String>,
    pub show_title: Option<String>,
    // 毫秒
    pub duration: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PlayUrlData {
    pub quality: Option<u32>,
    pub timelength: Option<u64>,
    pub accept_quality: Option<Vec<u32>>,
    pub dash: Option<DashInfo>,
    pub durl: Option<Vec<DurlItem>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DashInfo {
    pub duration: Option<u64>,
    pub video: Option<Vec<DashItem>>,
    pub audio: Option<Vec<DashItem>>,
    pub flac: Option<FlacInfo>,
    pub dolby: Option<DolbyInfo>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FlacInfo {
    pub display: Option<bool>,
    pub audio: Option<DashItem>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DolbyInfo {
    #[serde(rename = "type")]
    pub kind: Option<u32>,
    pub audio: Option<Vec<DashItem>>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DashItem {
    pub id: Option<u32>,
    pub base_url: Option<String>,
    pub backup_url: Option<Vec<String>>,
    pub bandwidth: Option<u64>,
    pub mime_type: Option<String>,
    pub codecs: Option<String>,
    pub codecid: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

// 非 DASH 的整段 flv/mp4
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DurlItem {
    pub order: Option<u32>,
    pub length: Option<u64>,
    pub size: Option<u64>,
    pub url: Option<String>,
    pub backup_url: Option<Vec<String>>,
}
