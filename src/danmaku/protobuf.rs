use bytes::Buf;
use prost::Message;
use prost::encoding::{WireType, decode_key, decode_varint};
use tracing::debug;

use super::{DanmakuEntry, DanmakuError, DanmakuMode, DanmakuStyle};

#[derive(Clone, PartialEq, Message)]
pub struct DanmakuElem {
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// 毫秒
    #[prost(int32, tag = "2")]
    pub progress: i32,
    #[prost(int32, tag = "3")]
    pub mode: i32,
    #[prost(int32, tag = "4")]
    pub fontsize: i32,
    #[prost(uint32, tag = "5")]
    pub color: u32,
    #[prost(string, tag = "6")]
    pub mid_hash: String,
    #[prost(string, tag = "7")]
    pub content: String,
    #[prost(int64, tag = "8")]
    pub ctime: i64,
    #[prost(int32, tag = "9")]
    pub weight: i32,
    #[prost(int32, tag = "11")]
    pub pool: i32,
    #[prost(string, tag = "12")]
    pub id_str: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DmSegMobileReply {
    #[prost(message, repeated, tag = "1")]
    pub elems: Vec<DanmakuElem>,
}

const ELEMS_TAG: u32 = 1;

/// 逐条解码一个分段，坏掉的单条只计数不报错
pub fn parse_segment(raw: &[u8]) -> Result<(Vec<DanmakuEntry>, usize), DanmakuError> {
    let mut buf = raw;
    let mut entries = Vec::new();
    let mut skipped = 0usize;

    while buf.has_remaining() {
        let (tag, wire_type) =
            decode_key(&mut buf).map_err(|e| DanmakuError::UnparseableStream(e.to_string()))?;

        match wire_type {
            WireType::LengthDelimited => {
                let payload = take_length_delimited(&mut buf)?;
                if tag != ELEMS_TAG {
                    continue;
                }
                match DanmakuElem::decode(payload).ok().and_then(to_entry) {
                    Some(entry) => entries.push(entry),
                    None => skipped += 1,
                }
            }
            WireType::Varint => {
                decode_varint(&mut buf).map_err(|e| DanmakuError::UnparseableStream(e.to_string()))?;
            }
            WireType::SixtyFourBit => advance(&mut buf, 8)?,
            WireType::ThirtyTwoBit => advance(&mut buf, 4)?,
            WireType::StartGroup | WireType::EndGroup => {
                return Err(DanmakuError::UnparseableStream(format!(
                    "不支持的字段类型: tag {}",
                    tag
                )));
            }
        }
    }

    debug!("protobuf 分段解析出 {} 条弹幕，跳过 {} 条", entries.len(), skipped);
    Ok((entries, skipped))
}

fn take_length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], DanmakuError> {
    let len = decode_varint(buf).map_err(|e| DanmakuError::UnparseableStream(e.to_string()))?;
    let len = usize::try_from(len)
        .ok()
        .filter(|l| *l <= buf.len())
        .ok_or_else(|| DanmakuError::UnparseableStream("字段长度超出数据范围".to_string()))?;
    let (payload, rest) = buf.split_at(len);
    *buf = rest;
    Ok(payload)
}

fn advance(buf: &mut &[u8], n: usize) -> Result<(), DanmakuError> {
    if buf.len() < n {
        return Err(DanmakuError::UnparseableStream("数据被截断".to_string()));
    }
    buf.advance(n);
    Ok(())
}

fn to_entry(elem: DanmakuElem) -> Option<DanmakuEntry> {
    if elem.progress < 0 || elem.content.trim().is_empty() {
        return None;
    }
    let mode = DanmakuMode::from_code(elem.mode as i64)?;

    Some(DanmakuEntry {
        time_ms: elem.progress as u64,
        text: elem.content,
        style: DanmakuStyle {
            mode,
            font_size: if elem.fontsize > 0 { elem.fontsize as u32 } else { 25 },
            color: elem.color & 0xFFFFFF,
        },
    })
}
