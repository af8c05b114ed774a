//! 把弹幕渲染成 ASS 字幕。

use std::fmt::Write;

use super::{DanmakuDocument, DanmakuEntry, DanmakuMode};

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;

const SCROLL_MS: u64 = 8_000;
const STATIC_MS: u64 = 5_000;
const FONT_NAME: &str = "Microsoft YaHei";
// 1080P 下字号 25 对应的像素大小
const BASE_FONT_PX: f64 = 48.0;

struct Layout {
    width: f64,
    height: f64,
    scale: f64,
    lane_height: f64,
    // 每条轨道空出来的时间
    scroll_lanes: Vec<u64>,
    top_lanes: Vec<u64>,
    bottom_lanes: Vec<u64>,
}

impl Layout {
    fn new(width: u32, height: u32) -> Self {
        let scale = height as f64 / DEFAULT_HEIGHT as f64;
        let lane_height = (BASE_FONT_PX * scale + 4.0).max(1.0);
        let lanes = ((height as f64 / lane_height) as usize).max(1);
        Self {
            width: width as f64,
            height: height as f64,
            scale,
            lane_height,
            scroll_lanes: vec![0; lanes],
            top_lanes: vec![0; lanes],
            bottom_lanes: vec![0; lanes],
        }
    }

    fn font_px(&self, font_size: u32) -> f64 {
        BASE_FONT_PX * self.scale * font_size as f64 / 25.0
    }

    // 找一条在 `start` 时刻空闲的轨道，都不空闲时取最早空出来的
    fn pick_lane(lanes: &mut [u64], start: u64, release: u64) -> usize {
        let index = lanes
            .iter()
            .position(|free_at| *free_at <= start)
            .unwrap_or_else(|| {
                lanes
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, free_at)| **free_at)
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            });
        lanes[index] = release;
        index
    }

    fn place(&mut self, entry: &DanmakuEntry) -> Option<(u64, String)> {
        let font_px = self.font_px(entry.style.font_size);
        let text_width = entry.text.chars().count() as f64 * font_px;
        let start = entry.time_ms;

        match entry.style.mode {
            DanmakuMode::Scroll | DanmakuMode::Reverse => {
                // 尾部完全进入画面后，同一轨道才能放下一条
                let travel = self.width + text_width;
                let enter_ms = (SCROLL_MS as f64 * text_width / travel) as u64;
                let lane = Self::pick_lane(&mut self.scroll_lanes, start, start + enter_ms);
                let y = lane as f64 * self.lane_height;
                let (x1, x2) = match entry.style.mode {
                    DanmakuMode::Reverse => (-text_width, self.width),
                    _ => (self.width, -text_width),
                };
                Some((
                    start + SCROLL_MS,
                    format!("\\move({:.0},{:.0},{:.0},{:.0})", x1, y, x2, y),
                ))
            }
            DanmakuMode::Top => {
                let lane = Self::pick_lane(&mut self.top_lanes, start, start + STATIC_MS);
                let y = lane as f64 * self.lane_height;
                Some((
                    start + STATIC_MS,
                    format!("\\an8\\pos({:.0},{:.0})", self.width / 2.0, y),
                ))
            }
            DanmakuMode::Bottom => {
                let lane = Self::pick_lane(&mut self.bottom_lanes, start, start + STATIC_MS);
                let y = self.height - lane as f64 * self.lane_height;
                Some((
                    start + STATIC_MS,
                    format!("\\an2\\pos({:.0},{:.0})", self.width / 2.0, y),
                ))
            }
            // 高级弹幕的内容是脚本，不渲染
            DanmakuMode::Special => None,
        }
    }
}

pub fn render(doc: &DanmakuDocument, width: u32, height: u32) -> String {
    let width = if width == 0 { DEFAULT_WIDTH } else { width };
    let height = if height == 0 { DEFAULT_HEIGHT } else { height };
    let mut layout = Layout::new(width, height);
    let default_px = layout.font_px(25).round() as u32;

    let mut out = String::new();
    let _ = write!(
        out,
        "[Script Info]\n\
         ScriptType: v4.00+\n\
         PlayResX: {width}\n\
         PlayResY: {height}\n\
         ScaledBorderAndShadow: yes\n\
         WrapStyle: 2\n\
         \n\
         [V4+ Styles]\n\
         Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding\n\
         Style: Danmaku,{FONT_NAME},{default_px},&H33FFFFFF,&H33FFFFFF,&H33000000,&H33000000,0,0,0,0,100,100,0,0,1,1,0,7,0,0,0,1\n\
         \n\
         [Events]\n\
         Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n"
    );

    for entry in doc.entries() {
        let Some((end, position)) = layout.place(entry) else {
            continue;
        };

        let mut tags = position;
        if entry.style.color != 0xFFFFFF {
            let _ = write!(tags, "\\c{}", ass_color(entry.style.color));
        }
        let px = layout.font_px(entry.style.font_size).round() as u32;
        if px != default_px {
            let _ = write!(tags, "\\fs{}", px);
        }

        let _ = writeln!(
            out,
            "Dialogue: 0,{},{},Danmaku,,0,0,0,,{{{}}}{}",
            ass_time(entry.time_ms),
            ass_time(end),
            tags,
            escape(&entry.text)
        );
    }

    out
}

/// 毫秒转成 H:MM:SS.cc
pub fn ass_time(ms: u64) -> String {
    let cs = ms / 10;
    format!(
        "{}:{:02}:{:02}.{:02}",
        cs / 360_000,
        cs / 6_000 % 60,
        cs / 100 % 60,
        cs % 100
    )
}

/// 0xRRGGBB 转成 &HBBGGRR&
pub fn ass_color(rgb: u32) -> String {
    let r = (rgb >> 16) & 0xFF;
    let g = (rgb >> 8) & 0xFF;
    let b = rgb & 0xFF;
    format!("&H{:02X}{:02X}{:02X}&", b, g, r)
}

fn escape(text: &str) -> String {
    text.replace('\\', "＼")
        .replace('{', "｛")
        .replace('}', "｝")
        .replace("\r\n", "\\N")
        .replace('\n', "\\N")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danmaku::{DanmakuStyle, DanmakuEntry};

    fn entry(time_ms: u64, text: &str, mode: DanmakuMode, color: u32) -> DanmakuEntry {
        DanmakuEntry {
            time_ms,
            text: text.to_string(),
            style: DanmakuStyle {
                mode,
                font_size: 25,
                color,
            },
        }
    }

    #[test]
    fn formats_time_and_color() {
        assert_eq!(ass_time(0), "0:00:00.00");
        assert_eq!(ass_time(3_723_450), "1:02:03.45");
        assert_eq!(ass_color(0xFF8800), "&H0088FF&");
    }

    #[test]
    fn renders_dialogue_lines() {
        let doc = DanmakuDocument::new(
            vec![
                entry(1000, "hello {world}", DanmakuMode::Scroll, 0xFFFFFF),
                entry(2000, "顶部", DanmakuMode::Top, 0xFF0000),
                entry(2500, "[0,0,\"1-1\",4]", DanmakuMode::Special, 0xFFFFFF),
            ],
            0,
        );
        let ass = render(&doc, 1920, 1080);

        assert!(ass.contains("PlayResX: 1920"));
        let dialogues: Vec<_> = ass.lines().filter(|l| l.starts_with("Dialogue:")).collect();
        assert_eq!(dialogues.len(), 2);
        assert!(dialogues[0].starts_with("Dialogue: 0,0:00:01.00,0:00:09.00,"));
        assert!(dialogues[0].contains("hello ｛world｝"));
        assert!(dialogues[1].contains("\\c&H0000FF&"));
    }

    #[test]
    fn simultaneous_scrolls_use_different_lanes() {
        let doc = DanmakuDocument::new(
            vec![
                entry(0, "一二三四五", DanmakuMode::Scroll, 0xFFFFFF),
                entry(0, "六七八九十", DanmakuMode::Scroll, 0xFFFFFF),
            ],
            0,
        );
        let ass = render(&doc, 1920, 1080);
        let moves: Vec<_> = ass
            .lines()
            .filter_map(|l| l.split("\\move(").nth(1))
            .collect();
        assert_eq!(moves.len(), 2);
        assert_ne!(moves[0], moves[1]);
    }
}
