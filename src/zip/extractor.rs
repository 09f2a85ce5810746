use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use crate::decode::ContentDecoder;
use crate::error::MergeResult;
use crate::io::ByteSource;

use super::parser::ZipReader;
use super::structures::CentralEntry;

/// Compressed bytes read from the source per decode step.
const READ_STEP: usize = 1024 * 1024;

/// ZIP file extractor
pub struct ZipExtractor<R: ByteSource + ?Sized> {
    reader: ZipReader<R>,
}

impl<R: ByteSource + ?Sized> ZipExtractor<R> {
    pub fn new(source: Arc<R>) -> Self {
        Self {
            reader: ZipReader::new(source, READ_STEP),
        }
    }

    /// List all entries in the archive, plus the archive comment.
    pub async fn list_files(&self) -> MergeResult<(Vec<CentralEntry>, String)> {
        self.reader.central_directory().await
    }

    /// Decode an entry fully into memory, checking its size and CRC-32.
    pub async fn extract_to_memory(&self, entry: &CentralEntry) -> MergeResult<Bytes> {
        let capacity = usize::try_from(entry.header.uncompressed_size).unwrap_or(0);
        let mut out = BytesMut::with_capacity(capacity.min(64 * 1024 * 1024));
        self.decode(entry, |piece| out.extend_from_slice(&piece)).await?;
        Ok(out.freeze())
    }

    /// Decode an entry without keeping its content. Returns the decoded size.
    pub async fn verify_entry(&self, entry: &CentralEntry) -> MergeResult<u64> {
        self.decode(entry, drop).await
    }

    async fn decode<F>(&self, entry: &CentralEntry, mut sink: F) -> MergeResult<u64>
    where
        F: FnMut(Bytes),
    {
        let mut decoder = ContentDecoder::new(&entry.header)?;
        if entry.header.compressed_size > 0 {
            let mut offset = self.reader.get_data_offset(entry).await?;
            let mut remaining = entry.header.compressed_size;
            while remaining > 0 {
                let step = remaining.min(READ_STEP as u64) as usize;
                let compressed = self.reader.source().read_bytes(offset, step).await?;
                sink(decoder.push(&compressed)?);
                offset += step as u64;
                remaining -= step as u64;
            }
        }
        decoder.finish()
    }
}
