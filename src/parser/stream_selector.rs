use std::cmp::Reverse;

use thiserror::Error;
use tracing::{debug, warn};

use super::models::{AudioQuality, Codec, RenditionDescriptor, RenditionKind, Title, VideoQuality};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("没有可播放的视频流: {0}")]
    NoPlayableRendition(String),
    #[error("没有不高于 {ceiling} 的清晰度，最低可用清晰度为 {lowest}")]
    CeilingUnmet { ceiling: u32, lowest: u32 },
}

/// 上限以内没有可用清晰度时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegradePolicy {
    /// 退而求其次，取上限之上最低的一档
    #[default]
    NextAbove,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionConstraints {
    pub quality_ceiling: VideoQuality,
    pub codec_preference: Vec<Codec>,
    pub want_danmaku: bool,
    pub require_audio: bool,
    pub degrade: DegradePolicy,
}

impl Default for SelectionConstraints {
    fn default() -> Self {
        Self {
            quality_ceiling: VideoQuality::default(),
            codec_preference: vec![Codec::Avc, Codec::Hevc, Codec::Av1],
            want_danmaku: true,
            require_audio: true,
            degrade: DegradePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    pub video: RenditionDescriptor,
    pub audio: Option<RenditionDescriptor>,
    pub danmaku: Option<RenditionDescriptor>,
    /// 选中的视频高于清晰度上限
    pub degraded: bool,
}

// 不在偏好列表里的编码排在最后
fn codec_rank(preference: &[Codec], codec: &Codec) -> usize {
    preference
        .iter()
        .position(|c| c == codec)
        .unwrap_or(preference.len())
}

/// 按约束从目录里挑出一组流，相同输入总是得到相同结果
pub fn select(
    title: &Title,
    constraints: &SelectionConstraints,
) -> Result<SelectionResult, SelectionError> {
    let ceiling = constraints.quality_ceiling.id();
    let preference = &constraints.codec_preference;

    let videos: Vec<&RenditionDescriptor> = title.renditions_of(RenditionKind::Video).collect();
    if videos.is_empty() {
        return Err(SelectionError::NoPlayableRendition(title.id.clone()));
    }

    debug!("可用的视频流数量: {}", videos.len());
    for v in &videos {
        debug!(
            "视频流: 清晰度ID={}, 编码={}, {:?}x{:?}",
            v.quality, v.codec, v.width, v.height
        );
    }

    // 上限以内取最高清晰度，同清晰度按编码偏好，再按地址保证确定性
    let within = videos
        .iter()
        .filter(|v| v.quality <= ceiling)
        .min_by(|a, b| {
            let key = |v: &RenditionDescriptor| (Reverse(v.quality), codec_rank(preference, &v.codec));
            key(a).cmp(&key(b)).then_with(|| a.locator.cmp(&b.locator))
        });

    let (video, degraded) = match within {
        Some(v) => ((*v).clone(), false),
        None => {
            let lowest = videos
                .iter()
                .min_by(|a, b| {
                    let key = |v: &RenditionDescriptor| (v.quality, codec_rank(preference, &v.codec));
                    key(a).cmp(&key(b)).then_with(|| a.locator.cmp(&b.locator))
                })
                .ok_or_else(|| SelectionError::NoPlayableRendition(title.id.clone()))?;

            match constraints.degrade {
                DegradePolicy::Strict => {
                    return Err(SelectionError::CeilingUnmet {
                        ceiling,
                        lowest: lowest.quality,
                    });
                }
                DegradePolicy::NextAbove => {
                    warn!(
                        "没有不高于 {} 的清晰度，改用最低可用清晰度 {}",
                        ceiling, lowest.quality
                    );
                    ((*lowest).clone(), true)
                }
            }
        }
    };

    let audio = if constraints.require_audio {
        title
            .renditions_of(RenditionKind::Audio)
            .min_by(|a, b| {
                let key = |v: &RenditionDescriptor| {
                    (
                        AudioQuality::rank(v.quality),
                        Reverse(v.quality),
                        codec_rank(preference, &v.codec),
                    )
                };
                key(a).cmp(&key(b)).then_with(|| a.locator.cmp(&b.locator))
            })
            .cloned()
    } else {
        None
    };

    let danmaku = if constraints.want_danmaku {
        title
            .renditions_of(RenditionKind::Danmaku)
            .min_by(|a, b| a.locator.cmp(&b.locator))
            .cloned()
    } else {
        None
    };

    debug!(
        "已选择视频 {}，音频 {:?}，弹幕 {}",
        video.id(),
        audio.as_ref().map(|a| a.id()),
        danmaku.is_some()
    );

    Ok(SelectionResult {
        video,
        audio,
        danmaku,
        degraded,
    })
}
