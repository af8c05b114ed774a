use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::parser::models::RenditionDescriptor;

pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// 按固定大小切块，0 等同于不切
    Sized(u64),
    Single,
}

impl Default for ChunkMode {
    fn default() -> Self {
        Self::Sized(DEFAULT_CHUNK_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub rendition_id: String,
    pub index: usize,
}

impl ChunkKey {
    pub fn new(rendition_id: impl Into<String>, index: usize) -> Self {
        Self {
            rendition_id: rendition_id.into(),
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    pub key: ChunkKey,
    pub offset: u64,
    /// `None` 表示读到流结束为止
    pub length: Option<u64>,
    pub destination: PathBuf,
}

impl ChunkSpec {
    pub fn end(&self) -> Option<u64> {
        self.length.map(|len| self.offset + len)
    }
}

/// 用来判断持久化的下载状态是否还对应同一个计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFingerprint {
    pub rendition_id: String,
    pub total_length: Option<u64>,
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub rendition_id: String,
    /// 主地址和备用地址，重试时轮换
    pub locators: Vec<String>,
    pub total_length: Option<u64>,
    pub chunk_size: Option<u64>,
    pub destination: PathBuf,
    pub chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    pub fn fingerprint(&self) -> PlanFingerprint {
        PlanFingerprint {
            rendition_id: self.rendition_id.clone(),
            total_length: self.total_length,
            chunk_size: self.chunk_size,
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.total_length.is_none()
    }
}

pub struct ChunkPlanner;

impl ChunkPlanner {
    /// 把一路流的字节区间切成连续、不重叠的若干块
    pub fn plan(descriptor: &RenditionDescriptor, mode: ChunkMode, destination: &Path) -> ChunkPlan {
        let rendition_id = descriptor.id();
        let chunk_size = match mode {
            ChunkMode::Sized(0) | ChunkMode::Single => None,
            ChunkMode::Sized(size) => Some(size),
        };

        let spec = |index: usize, offset: u64, length: Option<u64>| ChunkSpec {
            key: ChunkKey::new(rendition_id.clone(), index),
            offset,
            length,
            destination: destination.to_path_buf(),
        };

        let chunks = match (descriptor.byte_length, chunk_size) {
            // 长度未知时只能整段读，长度从响应头里得到
            (None, _) => vec![spec(0, 0, None)],
            (Some(0), _) => Vec::new(),
            (Some(total), None) => vec![spec(0, 0, Some(total))],
            (Some(total), Some(size)) => {
                let count = total.div_ceil(size);
                (0..count)
                    .map(|i| {
                        let offset = i * size;
                        spec(i as usize, offset, Some(size.min(total - offset)))
                    })
                    .collect()
            }
        };

        ChunkPlan {
            rendition_id: rendition_id.clone(),
            locators: descriptor.locators(),
            total_length: descriptor.byte_length,
            chunk_size,
            destination: destination.to_path_buf(),
            chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{Codec, RenditionKind};
    use chrono::Utc;

    fn descriptor(len: Option<u64>) -> RenditionDescriptor {
        RenditionDescriptor {
            kind: RenditionKind::Video,
            quality: 80,
            codec: Codec::Avc,
            byte_length: len,
            locator: "https://example.invalid/v.m4s".to_string(),
            mirrors: vec!["https://backup.invalid/v.m4s".to_string()],
            width: Some(1920),
            height: Some(1080),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn last_chunk_is_short() {
        let plan = ChunkPlanner::plan(&descriptor(Some(1000)), ChunkMode::Sized(300), Path::new("v.m4s"));
        let lengths: Vec<_> = plan.chunks.iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![Some(300), Some(300), Some(300), Some(100)]);
        assert_eq!(plan.chunks[3].offset, 900);
        assert_eq!(plan.locators.len(), 2);
    }

    #[test]
    fn zero_size_means_single_chunk() {
        let plan = ChunkPlanner::plan(&descriptor(Some(1000)), ChunkMode::Sized(0), Path::new("v.m4s"));
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].length, Some(1000));
        assert_eq!(plan.chunk_size, None);
    }

    #[test]
    fn empty_rendition_has_no_chunks() {
        let plan = ChunkPlanner::plan(&descriptor(Some(0)), ChunkMode::default(), Path::new("v.m4s"));
        assert!(plan.chunks.is_empty());
    }
}
