mod common;

use bili_fetch::parser::models::{Codec, RenditionDescriptor, RenditionKind, VideoQuality};
use bili_fetch::parser::stream_selector::{
    DegradePolicy, SelectionConstraints, SelectionError, select,
};

use common::{descriptor, title};

fn video(quality: u32, codec: Codec, locator: &str) -> RenditionDescriptor {
    descriptor(RenditionKind::Video, quality, codec, None, locator)
}

fn audio(quality: u32, codec: Codec, locator: &str) -> RenditionDescriptor {
    descriptor(RenditionKind::Audio, quality, codec, None, locator)
}

fn danmaku() -> RenditionDescriptor {
    descriptor(RenditionKind::Danmaku, 1, Codec::DanmakuXml, None, "https://comment.bilibili.com/62131.xml")
}

fn ceiling(quality: VideoQuality) -> SelectionConstraints {
    SelectionConstraints {
        quality_ceiling: quality,
        ..Default::default()
    }
}

#[test]
fn picks_highest_quality_under_ceiling() {
    let catalog = title(vec![
        video(80, Codec::Avc, "https://cdn/v80"),
        video(32, Codec::Avc, "https://cdn/v32"),
        audio(30280, Codec::Mp4a, "https://cdn/a"),
    ]);

    let result = select(&catalog, &ceiling(VideoQuality::Q720P)).unwrap();
    assert_eq!(result.video.quality, 32);
    assert!(!result.degraded);
    assert_eq!(result.audio.unwrap().quality, 30280);
}

#[test]
fn selection_is_deterministic_regardless_of_catalog_order() {
    let renditions = vec![
        video(80, Codec::Hevc, "https://cdn/b"),
        video(80, Codec::Avc, "https://cdn/c"),
        video(80, Codec::Avc, "https://cdn/a"),
        video(64, Codec::Avc, "https://cdn/d"),
        audio(30232, Codec::Mp4a, "https://cdn/a132"),
        audio(30280, Codec::Mp4a, "https://cdn/a192"),
        danmaku(),
    ];
    let mut reversed = renditions.clone();
    reversed.reverse();

    let constraints = SelectionConstraints::default();
    let first = select(&title(renditions), &constraints).unwrap();
    let second = select(&title(reversed), &constraints).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.video.codec, Codec::Avc);
    assert_eq!(first.video.locator, "https://cdn/a");
    assert_eq!(first.audio.unwrap().quality, 30280);
}

#[test]
fn codec_preference_breaks_ties() {
    let catalog = title(vec![
        video(80, Codec::Avc, "https://cdn/avc"),
        video(80, Codec::Av1, "https://cdn/av1"),
        video(80, Codec::Hevc, "https://cdn/hevc"),
    ]);
    let constraints = SelectionConstraints {
        codec_preference: vec![Codec::Av1, Codec::Hevc, Codec::Avc],
        ..Default::default()
    };

    let result = select(&catalog, &constraints).unwrap();
    assert_eq!(result.video.codec, Codec::Av1);
}

#[test]
fn degrades_to_next_quality_above_ceiling() {
    let catalog = title(vec![
        video(116, Codec::Avc, "https://cdn/v116"),
        video(80, Codec::Avc, "https://cdn/v80"),
    ]);

    let result = select(&catalog, &ceiling(VideoQuality::Q480P)).unwrap();
    assert_eq!(result.video.quality, 80);
    assert!(result.degraded);
}

#[test]
fn strict_policy_fails_when_ceiling_unmet() {
    let catalog = title(vec![video(80, Codec::Avc, "https://cdn/v80")]);
    let constraints = SelectionConstraints {
        quality_ceiling: VideoQuality::Q360P,
        degrade: DegradePolicy::Strict,
        ..Default::default()
    };

    assert_eq!(
        select(&catalog, &constraints),
        Err(SelectionError::CeilingUnmet { ceiling: 16, lowest: 80 })
    );
}

#[test]
fn catalog_without_video_is_unplayable() {
    let catalog = title(vec![audio(30280, Codec::Mp4a, "https://cdn/a"), danmaku()]);
    assert!(matches!(
        select(&catalog, &SelectionConstraints::default()),
        Err(SelectionError::NoPlayableRendition(_))
    ));
}

#[test]
fn hires_audio_wins_over_aac() {
    let catalog = title(vec![
        video(80, Codec::Avc, "https://cdn/v"),
        audio(30280, Codec::Mp4a, "https://cdn/a192"),
        audio(30251, Codec::Flac, "https://cdn/flac"),
        audio(30250, Codec::Eac3, "https://cdn/dolby"),
    ]);

    let result = select(&catalog, &SelectionConstraints::default()).unwrap();
    assert_eq!(result.audio.unwrap().codec, Codec::Flac);
}

#[test]
fn optional_slots_follow_constraints() {
    let catalog = title(vec![
        video(80, Codec::Avc, "https://cdn/v"),
        audio(30280, Codec::Mp4a, "https://cdn/a"),
        danmaku(),
    ]);

    let full = select(&catalog, &SelectionConstraints::default()).unwrap();
    assert!(full.audio.is_some());
    assert!(full.danmaku.is_some());

    let bare = select(
        &catalog,
        &SelectionConstraints {
            want_danmaku: false,
            require_audio: false,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(bare.audio.is_none());
    assert!(bare.danmaku.is_none());

    // 只有画面的稿件，音频位留空
    let video_only = title(vec![video(80, Codec::Avc, "https://cdn/v")]);
    let result = select(&video_only, &SelectionConstraints::default()).unwrap();
    assert!(result.audio.is_none());
}
