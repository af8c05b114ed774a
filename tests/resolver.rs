use chrono::{TimeZone, Utc};
use serde_json::json;

use bili_fetch::danmaku::DanmakuFormat;
use bili_fetch::parser::errors::ResolutionError;
use bili_fetch::parser::models::{Codec, RenditionKind};
use bili_fetch::parser::resolver::{
    build_title, danmaku_rendition, danmaku_segment_count, parse_play_url, parse_season, parse_view,
};

fn view_body() -> serde_json::Value {
    json!({
        "code": 0,
        "message": "0",
        "ttl": 1,
        "data": {
            "bvid": "BV1xx411c7mD",
            "aid": 170001,
            "videos": 2,
            "tid": 17,
            "title": "合集标题",
            "pubdate": 1700000000,
            "duration": 1210,
            "cid": 1001,
            "owner": { "mid": 1, "name": "up" },
            "stat": { "view": 123 },
            "pages": [
                { "cid": 1001, "page": 1, "part": "第一集", "duration": 610, "dimension": { "width": 1920, "height": 1080 } },
                { "cid": 1002, "page": 2, "part": "第二集", "duration": 600 }
            ]
        }
    })
}

fn dash_body() -> serde_json::Value {
    json!({
        "code": 0,
        "data": {
            "quality": 80,
            "format": "flv",
            "timelength": 610000,
            "accept_quality": [80, 64, 32, 16],
            "dash": {
                "duration": 610,
                "video": [
                    {
                        "id": 80,
                        "base_url": "https://upos-sz-mirrorcos.bilivideo.com/v80.m4s?deadline=1700003600",
                        "backup_url": ["https://upos-sz-mirrorali.bilivideo.com/v80.m4s?deadline=1700003600"],
                        "bandwidth": 1_500_000,
                        "mime_type": "video/mp4",
                        "codecs": "avc1.640032",
                        "codecid": 7,
                        "width": 1920,
                        "height": 1080,
                        "frame_rate": "29.970",
                        "segment_base": { "initialization": "0-1000", "index_range": "1001-2000" }
                    },
                    { "id": 80, "base_url": "https://cdn/v80-hevc.m4s", "codecs": "hev1.1.6.L150.90", "codecid": 12 },
                    { "id": 32, "base_url": "https://cdn/v32.m4s", "codecs": "avc1.64001F", "codecid": 7 },
                    { "id": 64, "codecs": "avc1.640028", "codecid": 7 }
                ],
                "audio": [
                    { "id": 30280, "base_url": "https://cdn/a192.m4s", "codecs": "mp4a.40.2" },
                    { "id": 30216, "base_url": "https://cdn/a64.m4s", "codecs": "mp4a.40.2" }
                ],
                "dolby": { "type": 0, "audio": null },
                "flac": { "display": true, "audio": { "id": 30251, "base_url": "https://cdn/flac.m4s", "codecs": "fLaC" } }
            }
        }
    })
}

fn resolved_at() -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

#[test]
fn view_selects_requested_part() {
    let info = parse_view(&view_body(), 2).unwrap();
    assert_eq!(info.aid, 170001);
    assert_eq!(info.bvid, "BV1xx411c7mD");
    assert_eq!(info.cid, 1002);
    assert_eq!(info.name, "合集标题 - 第二集");
    assert_eq!(info.duration_secs, 600);
    assert_eq!(info.ep_id, None);
}

#[test]
fn view_missing_part_is_not_found() {
    assert!(matches!(parse_view(&view_body(), 5), Err(ResolutionError::NotFound(_))));
}

#[test]
fn view_missing_mandatory_field_is_malformed() {
    let mut body = view_body();
    body["data"].as_object_mut().unwrap().remove("bvid");
    assert!(matches!(parse_view(&body, 1), Err(ResolutionError::MalformedResponse(_))));

    let no_data = json!({ "code": 0, "message": "0" });
    assert!(matches!(parse_view(&no_data, 1), Err(ResolutionError::MalformedResponse(_))));
}

#[test]
fn season_episode_is_found_by_ep_id() {
    let body = json!({
        "code": 0,
        "result": {
            "season_id": 33,
            "season_title": "某番剧",
            "episodes": [
                { "id": 11, "aid": 1, "bvid": "BV1aa", "cid": 101, "title": "1", "long_title": "开端", "duration": 1_420_000 },
                { "id": 12, "aid": 2, "bvid": "BV1bb", "cid": 102, "title": "2", "long_title": "", "duration": 1_430_000 }
            ]
        }
    });

    let info = parse_season(&body, 11).unwrap();
    assert_eq!(info.cid, 101);
    assert_eq!(info.name, "某番剧 第1话 开端");
    assert_eq!(info.duration_secs, 1420);
    assert_eq!(info.ep_id, Some(11));

    let info = parse_season(&body, 12).unwrap();
    assert_eq!(info.name, "某番剧 第2话");

    assert!(matches!(parse_season(&body, 99), Err(ResolutionError::NotFound(_))));
}

#[test]
fn dash_payload_tolerates_extra_and_missing_fields() {
    let renditions = parse_play_url(&dash_body(), resolved_at()).unwrap();

    let videos: Vec<_> = renditions.iter().filter(|r| r.kind == RenditionKind::Video).collect();
    let audios: Vec<_> = renditions.iter().filter(|r| r.kind == RenditionKind::Audio).collect();

    // 缺 base_url 的 64 被跳过
    assert_eq!(videos.len(), 3);
    assert_eq!(audios.len(), 3);

    let avc = videos.iter().find(|v| v.quality == 80 && v.codec == Codec::Avc).unwrap();
    assert_eq!(avc.mirrors.len(), 1);
    assert_eq!(avc.width, Some(1920));
    assert_eq!(avc.expires_at.timestamp(), 1_700_003_600);
    assert_eq!(avc.id(), "video-80-avc");

    assert!(videos.iter().any(|v| v.codec == Codec::Hevc));
    assert!(audios.iter().any(|a| a.quality == 30251 && a.codec == Codec::Flac));
}

#[test]
fn durl_payload_becomes_single_video() {
    let body = json!({
        "code": 0,
        "data": {
            "quality": 32,
            "durl": [{ "order": 1, "length": 60000, "size": 4_000_000, "url": "https://cdn/whole.mp4", "backup_url": null }]
        }
    });

    let renditions = parse_play_url(&body, resolved_at()).unwrap();
    assert_eq!(renditions.len(), 1);
    assert_eq!(renditions[0].kind, RenditionKind::Video);
    assert_eq!(renditions[0].quality, 32);
    assert_eq!(renditions[0].byte_length, Some(4_000_000));
}

#[test]
fn payload_without_video_is_malformed() {
    let body = json!({ "code": 0, "data": { "quality": 80, "dash": { "video": [], "audio": [] } } });
    assert!(matches!(
        parse_play_url(&body, resolved_at()),
        Err(ResolutionError::MalformedResponse(_))
    ));
}

#[test]
fn catalog_includes_danmaku_descriptor() {
    let info = parse_view(&view_body(), 1).unwrap();
    let mut renditions = parse_play_url(&dash_body(), resolved_at()).unwrap();
    renditions.push(danmaku_rendition(DanmakuFormat::Xml, &info, resolved_at()));

    let title = build_title(info, renditions, resolved_at());
    assert_eq!(title.id, "BV1xx411c7mD_1001");
    let danmaku: Vec<_> = title.renditions_of(RenditionKind::Danmaku).collect();
    assert_eq!(danmaku.len(), 1);
    assert_eq!(danmaku[0].locator, "https://comment.bilibili.com/1001.xml");
}

#[test]
fn protobuf_danmaku_segments_follow_duration() {
    assert_eq!(danmaku_segment_count(0), 1);
    assert_eq!(danmaku_segment_count(360), 1);
    assert_eq!(danmaku_segment_count(361), 2);

    let info = parse_view(&view_body(), 1).unwrap();
    let descriptor = danmaku_rendition(DanmakuFormat::Protobuf, &info, resolved_at());
    assert_eq!(descriptor.codec, Codec::DanmakuProtobuf);
    assert_eq!(descriptor.quality, 0);
    assert_eq!(danmaku_segment_count(info.duration_secs), 2);
    assert!(descriptor.locator.contains("oid=1001"));
    assert!(descriptor.locator.contains("pid=170001"));
}

#[test]
fn platform_codes_map_to_error_kinds() {
    assert!(matches!(ResolutionError::from_api_code(-404, "啥都木有"), ResolutionError::NotFound(_)));
    assert!(matches!(ResolutionError::from_api_code(87008, "需要购买"), ResolutionError::AccessDenied(_)));
    assert!(ResolutionError::from_api_code(-503, "调用速度过快").is_transient());
}
