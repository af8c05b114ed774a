use std::path::Path;
use std::time::Duration;

use colored::*;

/// 终端上给人看的输出，日志仍然走 tracing
pub struct PrettyLogger;

impl PrettyLogger {
    /// 显示警告消息
    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 显示错误消息
    pub fn error(message: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示步骤开始
    pub fn step_start(step: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), step.as_ref().bold());
    }

    /// 显示文件信息
    pub fn file_info(label: impl AsRef<str>, path: &Path) {
        println!("{} {}: {}", "📁".blue().bold(), label.as_ref().bold(), path.display());
    }

    /// 显示分割线
    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 显示完成总结
    pub fn completion_summary(output: &Path, subtitle: Option<&Path>, elapsed: Duration, danmaku_skipped: usize) {
        Self::separator();
        println!("{}", "🎉 下载完成！".green().bold());
        Self::file_info("输出文件", output);
        if let Some(subtitle) = subtitle {
            Self::file_info("弹幕字幕", subtitle);
        }
        println!("  耗时: {:.1}s", elapsed.as_secs_f64());
        if danmaku_skipped > 0 {
            Self::warning(format!("有 {} 条弹幕格式错误，已跳过", danmaku_skipped));
        }
    }
}
