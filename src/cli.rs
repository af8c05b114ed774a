use clap::Parser;
use std::path::PathBuf;

/// B站视频下载器
#[derive(Parser, Debug)]
#[command(name = "bilifetch")]
#[command(version = "0.1")]
#[command(about = "B站视频下载工具：分块并发下载、断点续传、弹幕转字幕", long_about = None)]
pub struct Cli {
    /// 视频链接或 BV/av/ep 号
    #[arg(value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub url: String,

    /// 清晰度上限
    #[arg(short, long, value_name = "QUALITY")]
    #[arg(default_value = "80")]
    #[arg(help = "清晰度上限: 127=8K, 120=4K, 116=1080P60, 80=1080P, 64=720P, 32=480P, 16=360P")]
    pub quality: u32,

    /// 视频编码优先级，逗号分隔
    #[arg(long, value_name = "CODECS", value_delimiter = ',')]
    #[arg(default_value = "avc,hevc,av1")]
    pub vcodec: Vec<String>,

    /// 并发分块数
    #[arg(short = 'n', long, value_name = "N", default_value_t = 4)]
    pub concurrency: usize,

    /// 不下载弹幕
    #[arg(long)]
    pub no_danmaku: bool,

    /// Cookie字符串 (可选)
    #[arg(short, long, value_name = "COOKIE")]
    #[arg(help = "手动指定Cookie，原样放进请求头")]
    pub cookie: Option<String>,

    /// 视频保存目录
    #[arg(short = 'd', long, value_name = "DIR")]
    #[arg(default_value = ".")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// 输出文件名模板
    #[arg(long, value_name = "TEMPLATE", default_value = "{title}")]
    #[arg(help = "输出文件名模板，支持 {title} {id} {quality}")]
    pub output_template: String,

    /// 临时文件目录，同一目录下可断点续传
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub tmp_dir: Option<PathBuf>,

    /// 分块大小 (KiB)，0 表示不分块
    #[arg(long, value_name = "KIB", default_value_t = 512)]
    pub block_size: u64,

    /// 限速 (KiB/s)
    #[arg(long, value_name = "KIB")]
    pub rate_limit: Option<u64>,

    /// 每个分块最多重试次数
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub retries: u32,

    /// 清晰度上限以内没有可用流时直接失败
    #[arg(long)]
    pub strict_quality: bool,

    /// 只要画面，不下载音轨
    #[arg(long)]
    pub no_audio: bool,

    /// 弹幕格式: xml 或 protobuf
    #[arg(long, value_name = "FORMAT", default_value = "xml")]
    pub danmaku_format: String,

    /// 把弹幕作为字幕轨封装进 mkv，默认输出外挂 .ass
    #[arg(long)]
    pub embed_danmaku: bool,

    /// 覆盖已存在的输出文件
    #[arg(long)]
    pub overwrite: bool,

    /// 任务超时 (秒)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// 输出调试日志
    #[arg(long)]
    pub debug: bool,
}
