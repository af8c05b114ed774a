use std::io::Read;
use std::sync::LazyLock;

use chardetng::EncodingDetector;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use regex::Regex;
use tracing::{debug, warn};

use super::{DanmakuEntry, DanmakuError, DanmakuMode, DanmakuStyle};

static ROOT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<i(\s[^>]*)?>").unwrap());
static OPEN_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<d[\s>]").unwrap());
// 正文里的 < 已经转义，遇到 < 就说明记录没闭合
static RECORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<d\s+p="([^"]*)"\s*>([^<]*)</d>"#).unwrap());

/// 解析 XML 弹幕，返回有效条目和跳过的条数
pub fn parse(raw: &[u8]) -> Result<(Vec<DanmakuEntry>, usize), DanmakuError> {
    let bytes = decompress(raw)?;
    let text = decode_text(&bytes);

    if !ROOT_RE.is_match(&text) {
        return Err(DanmakuError::UnparseableStream("缺少 <i> 根元素".to_string()));
    }

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    let mut matched = 0usize;

    for caps in RECORD_RE.captures_iter(&text) {
        matched += 1;
        match parse_record(&caps[1], &caps[2]) {
            Some(entry) => entries.push(entry),
            None => {
                debug!("跳过格式错误的弹幕: p=\"{}\"", &caps[1]);
                skipped += 1;
            }
        }
    }

    // 没闭合或者属性坏掉的 <d> 也算跳过
    let opened = OPEN_TAG_RE.find_iter(&text).count();
    skipped += opened.saturating_sub(matched);

    Ok((entries, skipped))
}

// p 属性: 时间(秒),模式,字号,颜色,发送时间,弹幕池,用户hash,id
fn parse_record(p: &str, body: &str) -> Option<DanmakuEntry> {
    let fields: Vec<&str> = p.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }

    let seconds: f64 = fields[0].parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let mode = DanmakuMode::from_code(fields[1].parse().ok()?)?;
    let font_size: u32 = fields[2].parse().ok()?;
    let color: u32 = fields[3].parse().ok()?;

    let text = unescape(body);
    if text.trim().is_empty() {
        return None;
    }

    Some(DanmakuEntry {
        time_ms: (seconds * 1000.0).round() as u64,
        text,
        style: DanmakuStyle {
            mode,
            font_size,
            color: color & 0xFFFFFF,
        },
    })
}

// comment.bilibili.com 返回的是不带头的 deflate 流
fn decompress(raw: &[u8]) -> Result<Vec<u8>, DanmakuError> {
    if looks_like_text(raw) {
        return Ok(raw.to_vec());
    }

    if raw.starts_with(&[0x1f, 0x8b]) {
        debug!("检测到 gzip 压缩，开始解压缩");
        return read_all(GzDecoder::new(raw))
            .ok_or_else(|| DanmakuError::UnparseableStream("gzip 解压缩失败".to_string()));
    }

    if let Some(out) = read_all(DeflateDecoder::new(raw)).filter(|b| looks_like_text(b)) {
        debug!("检测到 deflate 压缩，已解压缩");
        return Ok(out);
    }
    if let Some(out) = read_all(ZlibDecoder::new(raw)).filter(|b| looks_like_text(b)) {
        debug!("检测到 zlib 压缩，已解压缩");
        return Ok(out);
    }

    warn!("弹幕数据既不是文本也无法解压缩");
    Err(DanmakuError::UnparseableStream("无法解压缩的弹幕数据".to_string()))
}

fn read_all<R: Read>(mut reader: R) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(out)
}

// 以 '<' 开头，或带 BOM
fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF])
        || bytes.starts_with(&[0xFF, 0xFE])
        || bytes.starts_with(&[0xFE, 0xFF])
    {
        return true;
    }
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

fn decode_text(bytes: &[u8]) -> String {
    // 自动探测编码
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);

    let (decoded, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        warn!("弹幕解码过程中发现错误，可能存在字符丢失");
    }
    decoded.into_owned()
}

pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let Some(end) = rest.find(';').filter(|e| *e <= 10) else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };

        let entity = &rest[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescapes_entities() {
        assert_eq!(unescape("a &lt;b&gt; &amp; &#65;&#x42;"), "a <b> & AB");
        assert_eq!(unescape("100% & more"), "100% & more");
    }

    #[test]
    fn rejects_payload_without_root() {
        assert!(parse(b"<html><body>oops</body></html>").is_err());
    }

    #[test]
    fn skips_record_with_unknown_mode() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?><i><d p="1.5,1,25,16777215,0,0,abc,1">ok</d><d p="2.0,42,25,16777215,0,0,abc,2">bad</d></i>"#;
        let (entries, skipped) = parse(xml.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].time_ms, 1500);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn unclosed_record_does_not_swallow_its_neighbour() {
        let xml = r#"<i><d p="1,1,25,16777215,0,0,abc,1">broken<d p="2,1,25,16777215,0,0,abc,2">good</d><d p="3,1,25,16777215,0,0,abc,3">third</d></i>"#;
        let (entries, skipped) = parse(xml.as_bytes()).unwrap();
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["good", "third"]);
        assert_eq!(entries[0].time_ms, 2000);
        assert_eq!(skipped, 1);
    }
}
