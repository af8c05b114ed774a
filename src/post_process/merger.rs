use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error};

use super::AssemblyError;

/// 外部 ffmpeg / ffprobe 的调用封装
pub struct MediaMerger;

impl MediaMerger {
    // 获取 ffmpeg 路径（支持环境变量）
    pub fn ffmpeg_path() -> String {
        std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
    }

    pub fn ffprobe_path() -> String {
        std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string())
    }

    pub async fn is_available(cmd: &str) -> bool {
        Command::new(cmd)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success())
    }

    pub async fn ensure_available() -> Result<(), AssemblyError> {
        debug!("检查系统中是否安装了 ffmpeg...");
        for cmd in [Self::ffmpeg_path(), Self::ffprobe_path()] {
            if !Self::is_available(&cmd).await {
                error!("❌ 未检测到 {}，请确保系统中已安装并配置了可执行路径。", cmd);
                error!("安装方法参考：https://ffmpeg.org/download.html");
                error!("或者设置环境变量 FFMPEG_PATH / FFPROBE_PATH 指向可执行文件路径");
                return Err(AssemblyError::FfmpegNotFound(cmd));
            }
        }
        Ok(())
    }

    pub async fn run_ffmpeg(args: &[OsString]) -> Result<(), AssemblyError> {
        let ffmpeg_cmd = Self::ffmpeg_path();
        debug!("执行 ffmpeg: {:?}", args);

        let output = Command::new(&ffmpeg_cmd)
            .args(args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            error!("❌ ffmpeg 合并失败，错误日志如下：\n{}", err_msg);
            return Err(AssemblyError::FfmpegFailed(err_msg.trim().to_string()));
        }
        Ok(())
    }

    /// 用 ffprobe 数一下文件里的流
    pub async fn probe_stream_count(path: &Path) -> Result<usize, AssemblyError> {
        let output = Command::new(Self::ffprobe_path())
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("stream=index")
            .arg("-of")
            .arg("csv=p=0")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            return Err(AssemblyError::ProbeFailed(err_msg.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter(|l| !l.trim().is_empty()).count())
    }
}
