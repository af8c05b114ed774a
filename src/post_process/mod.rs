//! 合并下载好的音视频与弹幕字幕。
//!
//! ffmpeg 只做流复制，先写到暂存文件，用 ffprobe 数过流的数量后再改名成最终文件。
//! 失败时不会删除任何输入文件。

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::danmaku::{DanmakuDocument, ass};
use crate::parser::models::Codec;

pub mod merger;

pub use merger::MediaMerger;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("文件不存在: {0}")]
    FileNotFound(PathBuf),
    #[error("未找到 {0}，请安装 ffmpeg 或设置 FFMPEG_PATH / FFPROBE_PATH")]
    FfmpegNotFound(String),
    #[error("ffmpeg 执行失败: {0}")]
    FfmpegFailed(String),
    #[error("ffprobe 检查失败: {0}")]
    ProbeFailed(String),
    #[error("输出文件校验失败: 期望 {expected} 路流，实际 {actual} 路")]
    VerificationFailed { expected: usize, actual: usize },
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubtitleMode {
    /// 作为字幕轨封装进 mkv
    Embed,
    /// 输出文件旁边写一个 .ass
    #[default]
    Sidecar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Mp4,
    Matroska,
}

impl ContainerFormat {
    /// 内嵌字幕或者 FLAC 音轨时只能用 mkv
    pub fn choose(audio_codec: Option<&Codec>, embed_subtitle: bool) -> Self {
        if embed_subtitle || matches!(audio_codec, Some(Codec::Flac)) {
            Self::Matroska
        } else {
            Self::Mp4
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Matroska => "mkv",
        }
    }

    /// 模板里已经写了 mp4/mkv 扩展名就替换掉，否则直接追加
    pub fn apply_to(&self, path: &Path) -> PathBuf {
        let known = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp4") || e.eq_ignore_ascii_case("mkv"));
        if known {
            return path.with_extension(self.extension());
        }
        let mut name = path.as_os_str().to_os_string();
        name.push(".");
        name.push(self.extension());
        PathBuf::from(name)
    }

    fn muxer(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Matroska => "matroska",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInput {
    pub path: PathBuf,
    pub kind: TrackKind,
}

/// 哪个文件对应输出里的哪条轨道
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyManifest {
    pub tracks: Vec<TrackInput>,
    pub container: ContainerFormat,
    pub staging: PathBuf,
    pub output: PathBuf,
}

impl AssemblyManifest {
    pub fn expected_streams(&self) -> usize {
        self.tracks.len()
    }

    pub fn ffmpeg_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-y"]
            .into_iter()
            .map(OsString::from)
            .collect();

        for track in &self.tracks {
            args.push("-i".into());
            args.push(track.path.clone().into_os_string());
        }
        for index in 0..self.tracks.len() {
            args.push("-map".into());
            args.push(index.to_string().into());
        }

        args.push("-c".into());
        args.push("copy".into());
        if self.container == ContainerFormat::Mp4 {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }
        args.push("-f".into());
        args.push(self.container.muxer().into());
        args.push(self.staging.clone().into_os_string());
        args
    }
}

/// 一次合并需要的全部输入
#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    pub video: PathBuf,
    pub audio: Option<PathBuf>,
    pub audio_codec: Option<Codec>,
    pub danmaku: Option<DanmakuDocument>,
    /// 字幕画布尺寸，0 表示用默认的 1920x1080
    pub width: u32,
    pub height: u32,
    /// 最终文件路径，扩展名由 `ContainerFormat::apply_to` 决定
    pub output: PathBuf,
    /// 内嵌字幕时 .ass 的临时存放目录
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyOutcome {
    pub output: PathBuf,
    pub subtitle: Option<PathBuf>,
}

pub struct Assembler {
    subtitle_mode: SubtitleMode,
}

impl Assembler {
    pub fn new(subtitle_mode: SubtitleMode) -> Self {
        Self { subtitle_mode }
    }

    /// 暂存文件名: `xxx.mp4` -> `xxx.mp4.part`
    pub fn staging_path(output: &Path) -> PathBuf {
        let mut name = output.file_name().map(OsString::from).unwrap_or_default();
        name.push(".part");
        output.with_file_name(name)
    }

    pub fn sidecar_path(output: &Path) -> PathBuf {
        output.with_extension("ass")
    }

    pub fn embedded_subtitle_path(request: &AssemblyRequest) -> PathBuf {
        let mut name = request
            .output
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("danmaku"));
        name.push(".ass");
        request.work_dir.join(name)
    }

    pub fn manifest(&self, request: &AssemblyRequest) -> AssemblyManifest {
        let embed = self.subtitle_mode == SubtitleMode::Embed && request.danmaku.is_some();
        let container = ContainerFormat::choose(request.audio_codec.as_ref(), embed);

        let mut tracks = vec![TrackInput {
            path: request.video.clone(),
            kind: TrackKind::Video,
        }];
        if let Some(audio) = &request.audio {
            tracks.push(TrackInput {
                path: audio.clone(),
                kind: TrackKind::Audio,
            });
        }
        if embed {
            tracks.push(TrackInput {
                path: Self::embedded_subtitle_path(request),
                kind: TrackKind::Subtitle,
            });
        }

        let output = container.apply_to(&request.output);
        AssemblyManifest {
            tracks,
            container,
            staging: Self::staging_path(&output),
            output,
        }
    }

    pub async fn assemble(&self, request: &AssemblyRequest) -> Result<AssemblyOutcome, AssemblyError> {
        let manifest = self.manifest(request);

        for track in manifest.tracks.iter().filter(|t| t.kind != TrackKind::Subtitle) {
            if !tokio::fs::try_exists(&track.path).await? {
                return Err(AssemblyError::FileNotFound(track.path.clone()));
            }
        }

        MediaMerger::ensure_available().await?;

        let script = request
            .danmaku
            .as_ref()
            .map(|doc| ass::render(doc, request.width, request.height));

        if let (Some(script), Some(track)) = (
            &script,
            manifest.tracks.iter().find(|t| t.kind == TrackKind::Subtitle),
        ) {
            if let Some(parent) = track.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&track.path, script).await?;
        }

        if let Some(parent) = manifest.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("开始合并: {:?}", manifest.output);
        if let Err(e) = MediaMerger::run_ffmpeg(&manifest.ffmpeg_args()).await {
            let _ = tokio::fs::remove_file(&manifest.staging).await;
            return Err(e);
        }

        let actual = match MediaMerger::probe_stream_count(&manifest.staging).await {
            Ok(count) => count,
            Err(e) => {
                let _ = tokio::fs::remove_file(&manifest.staging).await;
                return Err(e);
            }
        };
        let expected = manifest.expected_streams();
        if actual != expected {
            warn!("合并结果流数量不对: 期望 {}，实际 {}", expected, actual);
            let _ = tokio::fs::remove_file(&manifest.staging).await;
            return Err(AssemblyError::VerificationFailed { expected, actual });
        }

        tokio::fs::rename(&manifest.staging, &manifest.output).await?;
        debug!("暂存文件已改名为 {:?}", manifest.output);

        // 外挂字幕在媒体文件落地之后再写
        let subtitle = match (self.subtitle_mode, script) {
            (SubtitleMode::Sidecar, Some(script)) => {
                let path = Self::sidecar_path(&manifest.output);
                tokio::fs::write(&path, script).await?;
                Some(path)
            }
            _ => None,
        };

        Ok(AssemblyOutcome {
            output: manifest.output,
            subtitle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(audio_codec: Option<Codec>, danmaku: bool) -> AssemblyRequest {
        AssemblyRequest {
            video: PathBuf::from("/tmp/w/BV1_1_video.m4s"),
            audio: audio_codec.as_ref().map(|_| PathBuf::from("/tmp/w/BV1_1_audio.m4s")),
            audio_codec,
            danmaku: danmaku.then(DanmakuDocument::default),
            width: 0,
            height: 0,
            output: PathBuf::from("/out/title.mp4"),
            work_dir: PathBuf::from("/tmp/w"),
        }
    }

    #[test]
    fn mp4_for_plain_av() {
        let manifest = Assembler::new(SubtitleMode::Sidecar).manifest(&request(Some(Codec::Mp4a), true));
        assert_eq!(manifest.container, ContainerFormat::Mp4);
        assert_eq!(manifest.output, PathBuf::from("/out/title.mp4"));
        assert_eq!(manifest.staging, PathBuf::from("/out/title.mp4.part"));
        assert_eq!(manifest.expected_streams(), 2);

        let args: Vec<String> = manifest
            .ffmpeg_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-i /tmp/w/BV1_1_video.m4s -i /tmp/w/BV1_1_audio.m4s"));
        assert!(joined.contains("-map 0 -map 1 -c copy"));
        assert!(joined.ends_with("-f mp4 /out/title.mp4.part"));
    }

    #[test]
    fn embedding_forces_matroska() {
        let manifest = Assembler::new(SubtitleMode::Embed).manifest(&request(Some(Codec::Mp4a), true));
        assert_eq!(manifest.container, ContainerFormat::Matroska);
        assert_eq!(manifest.output, PathBuf::from("/out/title.mkv"));
        assert_eq!(manifest.expected_streams(), 3);
        assert_eq!(manifest.tracks[2].path, PathBuf::from("/tmp/w/title.mp4.ass"));
    }

    #[test]
    fn flac_forces_matroska() {
        let manifest = Assembler::new(SubtitleMode::Sidecar).manifest(&request(Some(Codec::Flac), false));
        assert_eq!(manifest.container, ContainerFormat::Matroska);
    }

    #[test]
    fn extension_is_appended_to_dotted_titles() {
        let path = ContainerFormat::Mp4.apply_to(Path::new("/out/Ep. 1 开始"));
        assert_eq!(path, PathBuf::from("/out/Ep. 1 开始.mp4"));
        let path = ContainerFormat::Matroska.apply_to(Path::new("/out/a.MP4"));
        assert_eq!(path, PathBuf::from("/out/a.mkv"));
    }

    #[test]
    fn video_only_has_one_stream() {
        let manifest = Assembler::new(SubtitleMode::Embed).manifest(&request(None, false));
        assert_eq!(manifest.expected_streams(), 1);
        assert_eq!(manifest.container, ContainerFormat::Mp4);
    }
}
