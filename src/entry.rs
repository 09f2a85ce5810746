use std::sync::Arc;

use crate::error::MergeResult;
use crate::store::{ChunkHash, ChunkRefs, ContentStore};
use crate::zip::EntryHeader;

/// One archive member: metadata plus the ordered chunks of its compressed
/// payload. Dropping an entry releases its chunk references.
#[derive(Debug)]
pub struct Entry {
    pub header: EntryHeader,
    chunks: ChunkRefs,
}

impl Entry {
    pub fn new(header: EntryHeader, chunks: ChunkRefs) -> Self {
        Self { header, chunks }
    }

    /// A directory entry with no payload.
    pub fn directory(name: impl Into<String>, store: Arc<ContentStore>) -> Self {
        Self::new(EntryHeader::directory(name), ChunkRefs::empty(store))
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn chunks(&self) -> &[ChunkHash] {
        self.chunks.hashes()
    }

    pub fn into_parts(self) -> (EntryHeader, ChunkRefs) {
        (self.header, self.chunks)
    }
}

/// Receives entries as a reader parses them.
pub trait EntrySink {
    fn accept(&mut self, entry: Entry) -> MergeResult<()>;
}

impl EntrySink for Vec<Entry> {
    fn accept(&mut self, entry: Entry) -> MergeResult<()> {
        self.push(entry);
        Ok(())
    }
}
