//! Lazy, pausable byte stream over an ordered list of stored chunks.
//!
//! Opening a stream stats every chunk up front so progress can be reported
//! as a percentage of the eventual byte count. Chunks are read strictly in
//! order, and each one is released back to the store as soon as it has been
//! read to the end; the store deletes the backing file once no other entry
//! references it.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::future::try_join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::error::MergeResult;
use crate::store::{ChunkHash, ChunkReader, ChunkRefs, ContentStore};

/// Bytes handed out per read.
const READ_BUFFER: usize = 64 * 1024;

/// One emitted buffer and the cumulative progress after it.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub data: Bytes,
    pub percent: f64,
}

/// Cooperative pause switch shared with a [`ChunkStream`].
#[derive(Debug, Clone)]
pub struct PauseHandle(Arc<watch::Sender<bool>>);

impl PauseHandle {
    pub fn pause(&self) {
        self.0.send_replace(true);
    }

    pub fn resume(&self) {
        self.0.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.0.borrow()
    }
}

/// A pending read over one entry's chunks.
pub struct ChunkStream {
    store: Arc<ContentStore>,
    pending: VecDeque<ChunkHash>,
    current: Option<(ChunkHash, ChunkReader)>,
    eventual_bytes: u64,
    bytes_streamed: u64,
    pause: PauseHandle,
    paused: watch::Receiver<bool>,
}

impl ChunkStream {
    /// Take over `refs` and size up the stream. Fails with `StatFailure` if
    /// any chunk cannot be stat'ed; the references are released either way.
    pub async fn open(refs: ChunkRefs) -> MergeResult<Self> {
        let (store, hashes) = refs.into_parts();
        let (tx, paused) = watch::channel(false);
        // Built before statting so the references are released on failure.
        let mut stream = Self {
            store,
            pending: hashes.into(),
            current: None,
            eventual_bytes: 0,
            bytes_streamed: 0,
            pause: PauseHandle(Arc::new(tx)),
            paused,
        };
        let sizes = try_join_all(stream.pending.iter().map(|hash| stream.store.stat(hash))).await?;
        stream.eventual_bytes = sizes.iter().sum();
        Ok(stream)
    }

    /// Sum of the stored sizes of every chunk.
    pub fn eventual_bytes(&self) -> u64 {
        self.eventual_bytes
    }

    pub fn bytes_streamed(&self) -> u64 {
        self.bytes_streamed
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    fn percent(&self) -> f64 {
        if self.eventual_bytes == 0 {
            100.0
        } else {
            100.0 * self.bytes_streamed as f64 / self.eventual_bytes as f64
        }
    }

    /// Next buffer in chunk order, or `None` once every chunk is drained.
    ///
    /// While paused this waits for a resume without giving up its position.
    pub async fn next_chunk(&mut self) -> Option<MergeResult<StreamChunk>> {
        loop {
            if *self.paused.borrow() {
                // The sender lives in `self.pause`, so this cannot close.
                let _ = self.paused.wait_for(|paused| !*paused).await;
            }

            if self.current.is_none() {
                let hash = self.pending.pop_front()?;
                match self.store.open_chunk(&hash).await {
                    Ok(reader) => self.current = Some((hash, reader)),
                    Err(e) => {
                        self.store.release(&hash);
                        return Some(Err(e));
                    }
                }
            }
            let Some((hash, reader)) = self.current.as_mut() else {
                continue;
            };
            let hash = *hash;

            let mut buf = BytesMut::with_capacity(READ_BUFFER);
            let read = reader.take(READ_BUFFER as u64).read_buf(&mut buf).await;
            match read {
                Ok(0) => {
                    self.current = None;
                    self.store.release(&hash);
                }
                Ok(n) => {
                    self.bytes_streamed += n as u64;
                    return Some(Ok(StreamChunk {
                        data: buf.freeze(),
                        percent: self.percent(),
                    }));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    /// Adapt into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = MergeResult<StreamChunk>> {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next_chunk().await?;
            Some((item, stream))
        })
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if let Some((hash, _)) = self.current.take() {
            self.store.release(&hash);
        }
        for hash in self.pending.drain(..) {
            self.store.release(&hash);
        }
    }
}
