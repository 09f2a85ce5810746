#![allow(dead_code)]

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rezip::decode::crc32;
use rezip::store::{ChunkReader, LocalWorkDir, WorkDir};
use rezip::zip::{CompressionMethod, DosDateTime, EntryHeader};
use rezip::{ChunkHash, ContentStore, MergeConfig, Merger, ViewBuffer, ZipExtractor, ZipWriter};

/// Build an archive in memory. Entries are `(name, content, deflate)`;
/// names ending in `/` become directories.
pub async fn build_zip(files: &[(&str, &[u8], bool)], comment: &str) -> Vec<u8> {
    let mut writer = ZipWriter::new(Vec::new());
    for (name, content, deflate) in files {
        if name.ends_with('/') {
            writer
                .write_entry(&EntryHeader::directory(*name), b"")
                .await
                .unwrap();
            continue;
        }
        let (method, payload) = if *deflate {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::best());
            enc.write_all(content).unwrap();
            (CompressionMethod::Deflate, enc.finish().unwrap())
        } else {
            (CompressionMethod::Stored, content.to_vec())
        };
        let header = EntryHeader {
            name: name.to_string(),
            method,
            compressed_size: payload.len() as u64,
            uncompressed_size: content.len() as u64,
            crc32: crc32(content),
            is_directory: false,
            modified: DosDateTime::new(2019, 3, 4, 5, 6, 8),
            unix_mode: Some(0o100644),
            dos_attributes: 0,
            comment: String::new(),
        };
        writer.write_entry(&header, &payload).await.unwrap();
    }
    let (bytes, _) = writer.finish(comment).await.unwrap();
    bytes
}

/// Every entry of a finished archive as `(name, decoded content)`.
pub async fn read_zip(path: &Path) -> (Vec<(String, Vec<u8>)>, String) {
    let data = std::fs::read(path).unwrap();
    let extractor = ZipExtractor::new(Arc::new(ViewBuffer::from_bytes(data, 4096)));
    let (entries, comment) = extractor.list_files().await.unwrap();
    let mut out = Vec::new();
    for entry in &entries {
        let content = extractor.extract_to_memory(entry).await.unwrap();
        out.push((entry.header.name.clone(), content.to_vec()));
    }
    (out, comment)
}

pub fn config(work_dir: &Path, view_size: usize) -> MergeConfig {
    MergeConfig {
        work_dir: work_dir.to_path_buf(),
        view_size,
        verify: true,
        ..MergeConfig::default()
    }
}

pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |entries| entries.count())
}

/// Total size of the files directly under `dir`.
pub fn bytes_in(dir: &Path) -> u64 {
    std::fs::read_dir(dir).map_or(0, |entries| {
        entries
            .filter_map(|entry| entry.ok()?.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    })
}

/// Work directory that runs out of space after a number of writes.
pub struct FullDisc {
    inner: LocalWorkDir,
    ok_writes: usize,
    writes: AtomicUsize,
}

impl FullDisc {
    pub fn new(root: &Path, ok_writes: usize) -> Self {
        Self {
            inner: LocalWorkDir::create(root).unwrap(),
            ok_writes,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl WorkDir for FullDisc {
    async fn write(&self, hash: &ChunkHash, data: &[u8]) -> io::Result<()> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.ok_writes {
            return Err(io::Error::other("no space left on device"));
        }
        self.inner.write(hash, data).await
    }

    async fn size(&self, hash: &ChunkHash) -> io::Result<u64> {
        self.inner.size(hash).await
    }

    async fn open(&self, hash: &ChunkHash) -> io::Result<ChunkReader> {
        self.inner.open(hash).await
    }

    fn remove(&self, hash: &ChunkHash) -> io::Result<()> {
        self.inner.remove(hash)
    }

    fn path_for(&self, hash: &ChunkHash) -> PathBuf {
        self.inner.path_for(hash)
    }
}

pub fn full_disc_merger(work_dir: &Path, ok_writes: usize, view_size: usize) -> Merger {
    let files = FullDisc::new(work_dir, ok_writes);
    let store = ContentStore::new(Arc::new(files), 2);
    Merger::new(store, config(work_dir, view_size))
}
