use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncRead;

use super::ChunkHash;

pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

/// On-disc home of chunk files, one file per hash.
#[async_trait]
pub trait WorkDir: Send + Sync {
    /// Persist `data` under `hash`. A reader must never observe a partially
    /// written file.
    async fn write(&self, hash: &ChunkHash, data: &[u8]) -> io::Result<()>;

    /// Size of the stored file.
    async fn size(&self, hash: &ChunkHash) -> io::Result<u64>;

    async fn open(&self, hash: &ChunkHash) -> io::Result<ChunkReader>;

    /// Delete the file. Called with the store's table locked, so it is
    /// synchronous; unlinking is cheap.
    fn remove(&self, hash: &ChunkHash) -> io::Result<()>;

    /// Where the file for `hash` lives, for diagnostics.
    fn path_for(&self, hash: &ChunkHash) -> PathBuf;
}

/// Work directory on the local filesystem.
pub struct LocalWorkDir {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl LocalWorkDir {
    /// Use `root`, creating it if needed.
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl WorkDir for LocalWorkDir {
    async fn write(&self, hash: &ChunkHash, data: &[u8]) -> io::Result<()> {
        let path = self.path_for(hash);
        // Atomic write; concurrent writers of the same hash never share a tmp file
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{n}.tmp"));
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        fs::rename(&tmp, &path).await
    }

    async fn size(&self, hash: &ChunkHash) -> io::Result<u64> {
        Ok(fs::metadata(self.path_for(hash)).await?.len())
    }

    async fn open(&self, hash: &ChunkHash) -> io::Result<ChunkReader> {
        let file = fs::File::open(self.path_for(hash)).await?;
        Ok(Box::new(file))
    }

    fn remove(&self, hash: &ChunkHash) -> io::Result<()> {
        match std::fs::remove_file(self.path_for(hash)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn path_for(&self, hash: &ChunkHash) -> PathBuf {
        self.root.join(hash.to_string())
    }
}
