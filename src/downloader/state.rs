use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::DownloadError;
use super::plan::{ChunkKey, ChunkPlan, ChunkSpec, PlanFingerprint};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done { bytes: u64 },
    Failed { reason: String, attempts: u32 },
}

impl ChunkStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

// 落盘的内容
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    plans: Vec<PlanFingerprint>,
    entries: Vec<(ChunkKey, ChunkStatus)>,
    discovered_lengths: Vec<(String, u64)>,
}

/// 一个任务所有分块的状态，按分块单独加锁
#[derive(Debug)]
pub struct DownloadState {
    sidecar: PathBuf,
    fingerprints: Vec<PlanFingerprint>,
    entries: DashMap<ChunkKey, ChunkStatus>,
    discovered_lengths: DashMap<String, u64>,
    persist_lock: Mutex<()>,
}

impl DownloadState {
    pub fn new(sidecar: impl AsRef<Path>, plans: &[ChunkPlan]) -> Self {
        let entries = DashMap::new();
        for chunk in plans.iter().flat_map(|p| p.chunks.iter()) {
            entries.insert(chunk.key.clone(), ChunkStatus::Pending);
        }

        Self {
            sidecar: sidecar.as_ref().to_path_buf(),
            fingerprints: plans.iter().map(|p| p.fingerprint()).collect(),
            entries,
            discovered_lengths: DashMap::new(),
            persist_lock: Mutex::new(()),
        }
    }

    /// 读取上次中断时留下的状态，计划变了或文件损坏就从头开始
    pub async fn load_or_new(sidecar: impl AsRef<Path>, plans: &[ChunkPlan]) -> Result<Self, DownloadError> {
        let sidecar = sidecar.as_ref();
        let state = Self::new(sidecar, plans);

        let raw = match tokio::fs::read(sidecar).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot =
            match bincode::serde::decode_from_slice(&raw, bincode::config::standard()) {
                Ok((snapshot, _)) => snapshot,
                Err(e) => {
                    warn!("状态文件损坏，重新下载: {}", e);
                    return Ok(state);
                }
            };

        if snapshot.version != STATE_VERSION || snapshot.plans != state.fingerprints {
            warn!("下载计划已变化，忽略旧的状态文件: {}", sidecar.display());
            return Ok(state);
        }

        for (rendition, len) in snapshot.discovered_lengths {
            state.discovered_lengths.insert(rendition, len);
        }

        let previous: HashMap<ChunkKey, ChunkStatus> = snapshot.entries.into_iter().collect();
        let mut restored = 0usize;

        for plan in plans {
            let file_len = match tokio::fs::metadata(&plan.destination).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };

            for chunk in &plan.chunks {
                let status = match previous.get(&chunk.key) {
                    Some(ChunkStatus::Done { bytes }) if state.done_is_trustworthy(chunk, *bytes, file_len) => {
                        restored += 1;
                        ChunkStatus::Done { bytes: *bytes }
                    }
                    // 上次的在途分块和失败分块都要重新下载
                    _ => ChunkStatus::Pending,
                };
                state.entries.insert(chunk.key.clone(), status);
            }
        }

        info!("从状态文件恢复了 {} 个已完成分块", restored);
        Ok(state)
    }

    fn done_is_trustworthy(&self, chunk: &ChunkSpec, bytes: u64, file_len: u64) -> bool {
        let expected = chunk
            .length
            .or_else(|| self.discovered_length(&chunk.key.rendition_id));

        match expected {
            Some(expected) => bytes == expected && file_len >= chunk.offset + expected,
            None => false,
        }
    }

    pub fn sidecar(&self) -> &Path {
        &self.sidecar
    }

    pub fn get(&self, key: &ChunkKey) -> Option<ChunkStatus> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn set(&self, key: &ChunkKey, status: ChunkStatus) {
        self.entries.insert(key.clone(), status);
    }

    pub fn is_done(&self, key: &ChunkKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.is_done())
    }

    pub fn discovered_length(&self, rendition_id: &str) -> Option<u64> {
        self.discovered_lengths.get(rendition_id).map(|v| *v)
    }

    pub fn set_discovered_length(&self, rendition_id: &str, len: u64) {
        self.discovered_lengths.insert(rendition_id.to_string(), len);
    }

    /// 已完成分块的字节数之和
    pub fn done_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(|e| match e.value() {
                ChunkStatus::Done { bytes } => Some(*bytes),
                _ => None,
            })
            .sum()
    }

    /// 把在途分块退回待下载，返回退回的数量
    pub fn rollback_in_flight(&self) -> usize {
        let mut rolled = 0;
        for mut entry in self.entries.iter_mut() {
            if *entry.value() == ChunkStatus::InFlight {
                *entry.value_mut() = ChunkStatus::Pending;
                rolled += 1;
            }
        }
        rolled
    }

    pub fn snapshot(&self) -> Vec<(ChunkKey, ChunkStatus)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// 写临时文件再改名，避免中途被杀留下半个状态文件
    pub async fn persist(&self) -> Result<(), DownloadError> {
        let _guard = self.persist_lock.lock().await;

        let mut discovered: Vec<(String, u64)> = self
            .discovered_lengths
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        discovered.sort();

        let snapshot = Snapshot {
            version: STATE_VERSION,
            plans: self.fingerprints.clone(),
            entries: self.snapshot(),
            discovered_lengths: discovered,
        };

        let encoded = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| DownloadError::State(e.to_string()))?;

        let tmp = self.sidecar.with_extension("state.tmp");
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, &self.sidecar).await?;

        debug!("状态已保存: {} ({} 字节)", self.sidecar.display(), encoded.len());
        Ok(())
    }

    pub async fn remove_sidecar(&self) -> Result<(), DownloadError> {
        let _guard = self.persist_lock.lock().await;
        match tokio::fs::remove_file(&self.sidecar).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::plan::ChunkSpec;

    fn plan(dir: &Path) -> ChunkPlan {
        let destination = dir.join("video.m4s");
        let chunks = (0..3)
            .map(|i| ChunkSpec {
                key: ChunkKey::new("video-80-avc", i),
                offset: i as u64 * 4,
                length: Some(4),
                destination: destination.clone(),
            })
            .collect();
        ChunkPlan {
            rendition_id: "video-80-avc".to_string(),
            locators: vec!["https://example.invalid/v".to_string()],
            total_length: Some(12),
            chunk_size: Some(4),
            destination,
            chunks,
        }
    }

    #[tokio::test]
    async fn in_flight_rolls_back_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let plans = vec![plan(dir.path())];
        tokio::fs::write(&plans[0].destination, vec![0u8; 12]).await.unwrap();

        let sidecar = dir.path().join("job.state");
        let state = DownloadState::new(&sidecar, &plans);
        state.set(&ChunkKey::new("video-80-avc", 0), ChunkStatus::Done { bytes: 4 });
        state.set(&ChunkKey::new("video-80-avc", 1), ChunkStatus::InFlight);
        state.persist().await.unwrap();

        let reloaded = DownloadState::load_or_new(&sidecar, &plans).await.unwrap();
        assert!(reloaded.is_done(&ChunkKey::new("video-80-avc", 0)));
        assert_eq!(
            reloaded.get(&ChunkKey::new("video-80-avc", 1)),
            Some(ChunkStatus::Pending)
        );
        assert_eq!(reloaded.done_bytes(), 4);
    }

    #[tokio::test]
    async fn done_is_dropped_when_file_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let plans = vec![plan(dir.path())];
        // 文件只覆盖第一个分块
        tokio::fs::write(&plans[0].destination, vec![0u8; 4]).await.unwrap();

        let sidecar = dir.path().join("job.state");
        let state = DownloadState::new(&sidecar, &plans);
        state.set(&ChunkKey::new("video-80-avc", 0), ChunkStatus::Done { bytes: 4 });
        state.set(&ChunkKey::new("video-80-avc", 2), ChunkStatus::Done { bytes: 4 });
        state.persist().await.unwrap();

        let reloaded = DownloadState::load_or_new(&sidecar, &plans).await.unwrap();
        assert!(reloaded.is_done(&ChunkKey::new("video-80-avc", 0)));
        assert!(!reloaded.is_done(&ChunkKey::new("video-80-avc", 2)));
    }

    #[tokio::test]
    async fn changed_plan_discards_state() {
        let dir = tempfile::tempdir().unwrap();
        let plans = vec![plan(dir.path())];
        tokio::fs::write(&plans[0].destination, vec![0u8; 12]).await.unwrap();

        let sidecar = dir.path().join("job.state");
        let state = DownloadState::new(&sidecar, &plans);
        state.set(&ChunkKey::new("video-80-avc", 0), ChunkStatus::Done { bytes: 4 });
        state.persist().await.unwrap();

        let mut changed = plans.clone();
        changed[0].chunk_size = Some(6);
        let reloaded = DownloadState::load_or_new(&sidecar, &changed).await.unwrap();
        assert_eq!(reloaded.done_bytes(), 0);
    }

    #[test]
    fn rollback_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let plans = vec![plan(dir.path())];
        let state = DownloadState::new(dir.path().join("job.state"), &plans);
        state.set(&ChunkKey::new("video-80-avc", 0), ChunkStatus::InFlight);
        state.set(&ChunkKey::new("video-80-avc", 2), ChunkStatus::InFlight);
        assert_eq!(state.rollback_in_flight(), 2);
        assert!(state.snapshot().iter().all(|(_, s)| *s == ChunkStatus::Pending));
    }
}
