mod common;

use std::path::Path;

use bili_fetch::downloader::{ChunkMode, ChunkPlanner};
use bili_fetch::parser::models::{Codec, RenditionKind};

use common::descriptor;

fn assert_covers(len: u64, size: u64) {
    let video = descriptor(RenditionKind::Video, 80, Codec::Avc, Some(len), "https://cdn/v");
    let plan = ChunkPlanner::plan(&video, ChunkMode::Sized(size), Path::new("/tmp/v.m4s"));

    let mut cursor = 0;
    for (i, chunk) in plan.chunks.iter().enumerate() {
        assert_eq!(chunk.key.index, i);
        assert_eq!(chunk.offset, cursor, "len={} size={}", len, size);
        let chunk_len = chunk.length.unwrap();
        assert!(chunk_len > 0 && chunk_len <= size);
        cursor += chunk_len;
    }
    assert_eq!(cursor, len, "len={} size={}", len, size);
}

#[test]
fn chunks_are_contiguous_and_cover_the_whole_length() {
    for (len, size) in [(1, 1), (10, 3), (10, 5), (1000, 1), (4096, 1000), (10_485_760, 2_621_440)] {
        assert_covers(len, size);
    }
}

#[test]
fn planning_is_idempotent() {
    let video = descriptor(RenditionKind::Video, 80, Codec::Avc, Some(12_345), "https://cdn/v");
    let a = ChunkPlanner::plan(&video, ChunkMode::Sized(1000), Path::new("/tmp/v.m4s"));
    let b = ChunkPlanner::plan(&video, ChunkMode::Sized(1000), Path::new("/tmp/v.m4s"));
    assert_eq!(a, b);
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn unknown_length_gives_single_open_chunk() {
    let video = descriptor(RenditionKind::Video, 80, Codec::Avc, None, "https://cdn/v");
    let plan = ChunkPlanner::plan(&video, ChunkMode::Sized(1000), Path::new("/tmp/v.m4s"));

    assert!(plan.is_open_ended());
    assert_eq!(plan.chunks.len(), 1);
    assert_eq!(plan.chunks[0].offset, 0);
    assert_eq!(plan.chunks[0].length, None);
}

#[test]
fn single_mode_is_one_chunk() {
    let video = descriptor(RenditionKind::Video, 80, Codec::Avc, Some(5000), "https://cdn/v");
    let plan = ChunkPlanner::plan(&video, ChunkMode::Single, Path::new("/tmp/v.m4s"));
    assert_eq!(plan.chunks.len(), 1);
    assert_eq!(plan.chunks[0].length, Some(5000));
}

#[test]
fn changed_chunk_size_changes_fingerprint() {
    let video = descriptor(RenditionKind::Video, 80, Codec::Avc, Some(5000), "https://cdn/v");
    let a = ChunkPlanner::plan(&video, ChunkMode::Sized(1000), Path::new("/tmp/v.m4s"));
    let b = ChunkPlanner::plan(&video, ChunkMode::Sized(2000), Path::new("/tmp/v.m4s"));
    assert_ne!(a.fingerprint(), b.fingerprint());
}
