//! Content-addressed, reference-counted chunk store.
//!
//! Every unique chunk lives in exactly one work-directory file named after its
//! BLAKE3 hash. The hash is a dedup key only; nothing here treats it as an
//! integrity guarantee.
//!
//! ## Table invariants
//!
//! - A hash is in the table iff its refcount is above zero.
//! - A chunk file exists only while its hash is in the table. Files of chunks
//!   released mid-write are deleted when the write lands.
//! - Each record publishes its write progress through a `watch` channel, so
//!   readers wait on the write itself instead of polling the filesystem.
//!
//! All table mutations happen under one mutex, never held across an await.

mod workdir;

pub use workdir::{ChunkReader, LocalWorkDir, WorkDir};

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, warn};

use crate::buffer::ByteView;
use crate::config::MergeConfig;
use crate::error::{MergeError, MergeResult};
use crate::pool::ConcurrencyPool;
use crate::retry::RetryPolicy;

/// BLAKE3 digest identifying a chunk's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHash(blake3::Hash);

impl ChunkHash {
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.to_hex();
        write!(f, "ChunkHash({})", &hex[..12])
    }
}

/// Write progress of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Disc write in flight; content is served from memory meanwhile.
    Writing,
    /// Content lives only in its work-directory file.
    OnDisc,
    /// Content stays in memory because work-directory writes were disabled.
    InMemory,
}

struct ChunkRecord {
    refcount: usize,
    /// Distinguishes this record from an earlier one for the same hash whose
    /// write may still be in flight.
    generation: u64,
    size: u64,
    memory: Option<Bytes>,
    state: watch::Sender<ChunkState>,
}

pub struct ContentStore {
    files: Arc<dyn WorkDir>,
    table: Mutex<HashMap<ChunkHash, ChunkRecord>>,
    next_generation: AtomicU64,
    writes_disabled: AtomicBool,
    write_slots: Arc<Semaphore>,
}

impl ContentStore {
    /// A store over `files` allowing `max_concurrent_writes` writes in flight.
    pub fn new(files: Arc<dyn WorkDir>, max_concurrent_writes: usize) -> Arc<Self> {
        Arc::new(Self {
            files,
            table: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            writes_disabled: AtomicBool::new(false),
            write_slots: Arc::new(Semaphore::new(max_concurrent_writes.max(1))),
        })
    }

    /// A store over the configured local work directory.
    pub fn open(config: &MergeConfig) -> MergeResult<Arc<Self>> {
        let files = LocalWorkDir::create(&config.work_dir)?;
        Ok(Self::new(Arc::new(files), config.max_concurrent))
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ChunkHash, ChunkRecord>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `views` in order, returning one reference per view.
    ///
    /// Only waits for a free write slot, never for a write to finish.
    pub async fn put<I>(self: &Arc<Self>, views: I) -> ChunkRefs
    where
        I: IntoIterator<Item = ByteView>,
    {
        let mut refs = ChunkRefs::empty(Arc::clone(self));
        for view in views {
            refs.push(view).await;
        }
        refs
    }

    async fn put_view(self: &Arc<Self>, view: ByteView) -> ChunkHash {
        let hash = ChunkHash::of(&view);
        let generation = {
            let mut table = self.table();
            if let Some(record) = table.get_mut(&hash) {
                record.refcount += 1;
                debug!(%hash, refcount = record.refcount, "dedup hit");
                return hash;
            }

            let disabled = self.writes_disabled.load(Ordering::Acquire);
            let initial = if disabled {
                ChunkState::InMemory
            } else {
                ChunkState::Writing
            };
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            table.insert(
                hash,
                ChunkRecord {
                    refcount: 1,
                    generation,
                    size: view.len() as u64,
                    memory: Some(view.clone()),
                    state: watch::Sender::new(initial),
                },
            );
            if disabled {
                return hash;
            }
            generation
        };

        let slot = Arc::clone(&self.write_slots).acquire_owned().await.ok();
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let _slot = slot;
            store.persist(hash, generation, view).await;
        });
        hash
    }

    async fn persist(&self, hash: ChunkHash, generation: u64, data: Bytes) {
        let written = if self.writes_disabled.load(Ordering::Acquire) {
            false
        } else {
            match self.files.write(&hash, &data).await {
                Ok(()) => true,
                Err(source) => {
                    let error = MergeError::DiscWrite { hash, source };
                    if !self.writes_disabled.swap(true, Ordering::AcqRel) {
                        warn!(%error, "disabling work-directory writes for this run; new chunks stay in memory");
                    } else {
                        debug!(%error, "chunk write failed after writes were disabled");
                    }
                    false
                }
            }
        };

        let mut table = self.table();
        match table.get_mut(&hash) {
            Some(record) if record.generation == generation => {
                if written {
                    record.memory = None;
                    record.state.send_replace(ChunkState::OnDisc);
                } else {
                    record.state.send_replace(ChunkState::InMemory);
                }
            }
            // A newer record for the same content owns the file now.
            Some(_) => {}
            None if written => self.remove_file(&hash),
            None => {}
        }
    }

    fn remove_file(&self, hash: &ChunkHash) {
        if let Err(e) = self.files.remove(hash) {
            warn!(%hash, path = %self.files.path_for(hash).display(), "failed to delete chunk file: {e}");
        }
    }

    /// Drop one reference; the last one deletes the chunk file.
    pub fn release(&self, hash: &ChunkHash) {
        let mut table = self.table();
        let Some(record) = table.get_mut(hash) else {
            warn!(%hash, "release of a chunk that is not in the store");
            return;
        };
        record.refcount -= 1;
        if record.refcount > 0 {
            return;
        }
        table.remove(hash);
        // Blocking unlink under the table lock: a re-put of the same content
        // must not land its file before this one is gone.
        self.remove_file(hash);
    }

    /// `NotReady` unless the chunk can be read right now, from memory while
    /// its write is in flight or from its file once the write has landed.
    pub fn check_ready(&self, hash: &ChunkHash) -> MergeResult<()> {
        match self.table().get(hash) {
            Some(record)
                if record.memory.is_some() || *record.state.borrow() == ChunkState::OnDisc =>
            {
                Ok(())
            }
            _ => Err(MergeError::NotReady { hash: *hash }),
        }
    }

    /// Readiness check run before a stream-out. Every chunk is one unit in
    /// `pool`'s retry queue; one still missing once `policy` gives up fails
    /// the check with `NotReady`.
    pub async fn get(
        &self,
        hashes: &[ChunkHash],
        pool: &ConcurrencyPool,
        policy: &RetryPolicy,
    ) -> MergeResult<()> {
        let units: Vec<_> = hashes
            .iter()
            .map(|hash| move || async move { self.check_ready(hash) })
            .collect();
        pool.run_retrying(units, policy, MergeError::is_not_ready)
            .await
            .map(drop)
    }

    /// Wait until no write is in flight.
    pub async fn settled(&self) {
        let pending: Vec<_> = self
            .table()
            .values()
            .map(|record| record.state.subscribe())
            .collect();
        for mut state in pending {
            let _ = state.wait_for(|s| *s != ChunkState::Writing).await;
        }
    }

    /// Stored size of a chunk.
    pub async fn stat(&self, hash: &ChunkHash) -> MergeResult<u64> {
        let resident = self
            .table()
            .get(hash)
            .map(|record| (record.memory.is_some(), record.size));
        let stat_failure = |source| MergeError::StatFailure {
            hash: *hash,
            path: self.files.path_for(hash),
            source,
        };
        match resident {
            Some((true, size)) => Ok(size),
            Some((false, _)) => self.files.size(hash).await.map_err(stat_failure),
            None => Err(stat_failure(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "chunk is not in the store",
            ))),
        }
    }

    /// Reader over a chunk's content, from memory or from its file.
    pub async fn open_chunk(&self, hash: &ChunkHash) -> MergeResult<ChunkReader> {
        let memory = self.table().get(hash).map(|record| record.memory.clone());
        match memory {
            Some(Some(bytes)) => Ok(Box::new(std::io::Cursor::new(bytes))),
            Some(None) => Ok(self.files.open(hash).await?),
            None => Err(MergeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("chunk {hash} is not in the store"),
            ))),
        }
    }

    pub fn unique_chunks(&self) -> usize {
        self.table().len()
    }

    pub fn refcount(&self, hash: &ChunkHash) -> usize {
        self.table().get(hash).map_or(0, |record| record.refcount)
    }

    pub fn state(&self, hash: &ChunkHash) -> Option<ChunkState> {
        self.table().get(hash).map(|record| *record.state.borrow())
    }

    /// Whether a write failure switched the store to memory-only.
    pub fn writes_disabled(&self) -> bool {
        self.writes_disabled.load(Ordering::Acquire)
    }

    pub fn chunk_path(&self, hash: &ChunkHash) -> PathBuf {
        self.files.path_for(hash)
    }
}

/// Ordered references to chunks, released when dropped.
pub struct ChunkRefs {
    store: Arc<ContentStore>,
    hashes: Vec<ChunkHash>,
}

impl ChunkRefs {
    pub fn empty(store: Arc<ContentStore>) -> Self {
        Self {
            store,
            hashes: Vec::new(),
        }
    }

    /// Store one more view and append its reference.
    pub async fn push(&mut self, view: ByteView) {
        let hash = self.store.put_view(view).await;
        self.hashes.push(hash);
    }

    pub fn hashes(&self) -> &[ChunkHash] {
        &self.hashes
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Hand the references over to a new owner without releasing them.
    pub(crate) fn into_parts(mut self) -> (Arc<ContentStore>, Vec<ChunkHash>) {
        let hashes = std::mem::take(&mut self.hashes);
        (Arc::clone(&self.store), hashes)
    }
}

impl Drop for ChunkRefs {
    fn drop(&mut self) {
        for hash in self.hashes.drain(..) {
            self.store.release(&hash);
        }
    }
}

impl fmt::Debug for ChunkRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.hashes).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    pub(crate) fn local_store(dir: &std::path::Path) -> Arc<ContentStore> {
        let files = LocalWorkDir::create(&dir.join("work")).unwrap();
        ContentStore::new(Arc::new(files), 4)
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir.join("work")).unwrap().count()
    }

    #[tokio::test]
    async fn identical_chunks_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());

        let a = store.put([Bytes::from_static(b"same"), Bytes::from_static(b"a")]).await;
        let b = store.put([Bytes::from_static(b"same")]).await;
        store.settled().await;

        let shared = a.hashes()[0];
        assert_eq!(b.hashes()[0], shared);
        assert_eq!(store.unique_chunks(), 2);
        assert_eq!(store.refcount(&shared), 2);
        assert_eq!(files_in(dir.path()), 2);
        assert_eq!(store.state(&shared), Some(ChunkState::OnDisc));
    }

    #[tokio::test]
    async fn last_release_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());

        let a = store.put([Bytes::from_static(b"shared")]).await;
        let b = store.put([Bytes::from_static(b"shared")]).await;
        store.settled().await;
        let hash = a.hashes()[0];
        let path = store.chunk_path(&hash);
        assert!(path.exists());

        drop(a);
        assert_eq!(store.refcount(&hash), 1);
        assert!(path.exists());

        drop(b);
        assert_eq!(store.refcount(&hash), 0);
        assert!(!path.exists());
        assert_eq!(store.unique_chunks(), 0);
    }

    #[tokio::test]
    async fn stat_and_open_serve_in_flight_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());
        let refs = store.put([Bytes::from_static(b"hello")]).await;
        let hash = refs.hashes()[0];

        // Whatever the write progress, content is reachable.
        assert_eq!(store.stat(&hash).await.unwrap(), 5);
        store.check_ready(&hash).unwrap();
        store.settled().await;
        store.check_ready(&hash).unwrap();
        assert_eq!(store.stat(&hash).await.unwrap(), 5);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut store.open_chunk(&hash).await.unwrap(), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn unknown_chunks_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());
        let hash = ChunkHash::of(b"never stored");
        assert!(matches!(
            store.stat(&hash).await,
            Err(MergeError::StatFailure { .. })
        ));
        assert!(store.check_ready(&hash).unwrap_err().is_not_ready());
    }

    #[tokio::test]
    async fn get_gives_up_on_chunks_that_never_appear() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path());
        let refs = store.put([Bytes::from_static(b"present")]).await;
        let pool = ConcurrencyPool::new(2);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(5));

        store.get(refs.hashes(), &pool, &policy).await.unwrap();
        let missing = [refs.hashes()[0], ChunkHash::of(b"absent")];
        assert!(store.get(&missing, &pool, &policy).await.unwrap_err().is_not_ready());
    }

    /// Holds every write for `delay` before it lands.
    pub(crate) struct SlowDisc {
        pub inner: LocalWorkDir,
        pub delay: Duration,
    }

    #[async_trait]
    impl WorkDir for SlowDisc {
        async fn write(&self, hash: &ChunkHash, data: &[u8]) -> io::Result<()> {
            tokio::time::sleep(self.delay).await;
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

    pub(crate) fn slow_store(dir: &std::path::Path, delay: Duration) -> Arc<ContentStore> {
        let files = SlowDisc {
            inner: LocalWorkDir::create(&dir.join("work")).unwrap(),
            delay,
        };
        ContentStore::new(Arc::new(files), 4)
    }

    #[tokio::test]
    async fn chunks_still_being_written_are_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = slow_store(dir.path(), Duration::from_millis(400));
        let refs = store.put([Bytes::from_static(b"hello")]).await;
        let hash = refs.hashes()[0];
        assert_eq!(store.state(&hash), Some(ChunkState::Writing));

        // Retries are far shorter than the write; memory serves the chunk.
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        store.get(refs.hashes(), &ConcurrencyPool::new(1), &policy).await.unwrap();

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut store.open_chunk(&hash).await.unwrap(), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");

        store.settled().await;
        assert_eq!(store.state(&hash), Some(ChunkState::OnDisc));
        store.check_ready(&hash).unwrap();
    }

    /// Fails every write after the first `ok_writes`.
    pub(crate) struct FullDisc {
        pub inner: LocalWorkDir,
        pub ok_writes: usize,
        pub writes: AtomicUsize,
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

    #[tokio::test]
    async fn write_failure_keeps_chunks_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let files = FullDisc {
            inner: LocalWorkDir::create(&dir.path().join("work")).unwrap(),
            ok_writes: 1,
            writes: AtomicUsize::new(0),
        };
        let store = ContentStore::new(Arc::new(files), 1);

        let first = store.put([Bytes::from_static(b"one")]).await;
        store.settled().await;
        let second = store.put([Bytes::from_static(b"two")]).await;
        store.settled().await;
        let third = store.put([Bytes::from_static(b"three")]).await;

        assert!(store.writes_disabled());
        assert_eq!(store.state(&first.hashes()[0]), Some(ChunkState::OnDisc));
        assert_eq!(store.state(&second.hashes()[0]), Some(ChunkState::InMemory));
        assert_eq!(store.state(&third.hashes()[0]), Some(ChunkState::InMemory));
        assert_eq!(store.stat(&third.hashes()[0]).await.unwrap(), 5);
        assert_eq!(files_in(dir.path()), 1);
    }
}
