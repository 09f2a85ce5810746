//! Streaming ZIP writer.
//!
//! Entries are written one after another as local header plus raw payload;
//! the central directory and end records follow in [`ZipWriter::finish`].
//! Sizes and CRC-32 must be known when an entry starts, which is always the
//! case when re-framing entries taken from other archives, so no data
//! descriptors are written. ZIP64 records are emitted only where a value
//! does not fit its 32-bit or 16-bit field.

use byteorder::{LittleEndian, WriteBytesExt};
use tokio::io::AsyncWrite;

use crate::error::{MergeError, MergeResult};

use super::structures::*;

/// An entry whose local header has been written.
#[derive(Debug)]
struct WrittenEntry {
    header: EntryHeader,
    flags: u16,
    lfh_offset: u64,
}

impl WrittenEntry {
    fn sizes_need_zip64(&self) -> bool {
        needs_zip64(self.header.compressed_size) || needs_zip64(self.header.uncompressed_size)
    }

    fn needs_zip64(&self) -> bool {
        self.sizes_need_zip64() || needs_zip64(self.lfh_offset)
    }

    fn version(&self) -> u16 {
        if self.needs_zip64() {
            VERSION_ZIP64
        } else {
            VERSION_DEFAULT
        }
    }

    fn version_made_by(&self) -> u16 {
        match self.header.unix_mode {
            Some(_) => (u16::from(HOST_UNIX) << 8) | self.version(),
            None => self.version(),
        }
    }

    fn local_header(&self) -> Vec<u8> {
        let header = &self.header;
        let mut extra = Vec::new();
        let (compressed, uncompressed) = if self.sizes_need_zip64() {
            // The local record carries both sizes or neither.
            let _ = extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID);
            let _ = extra.write_u16::<LittleEndian>(16);
            let _ = extra.write_u64::<LittleEndian>(header.uncompressed_size);
            let _ = extra.write_u64::<LittleEndian>(header.compressed_size);
            (ZIP64_MARKER_32, ZIP64_MARKER_32)
        } else {
            (
                header.compressed_size as u32,
                header.uncompressed_size as u32,
            )
        };

        let mut out = Vec::with_capacity(LFH_SIZE + header.name.len() + extra.len());
        out.extend_from_slice(LFH_SIGNATURE);
        let _ = out.write_u16::<LittleEndian>(self.version());
        let _ = out.write_u16::<LittleEndian>(self.flags);
        let _ = out.write_u16::<LittleEndian>(header.method.as_u16());
        let _ = out.write_u16::<LittleEndian>(header.modified.time);
        let _ = out.write_u16::<LittleEndian>(header.modified.date);
        let _ = out.write_u32::<LittleEndian>(header.crc32);
        let _ = out.write_u32::<LittleEndian>(compressed);
        let _ = out.write_u32::<LittleEndian>(uncompressed);
        let _ = out.write_u16::<LittleEndian>(header.name.len() as u16);
        let _ = out.write_u16::<LittleEndian>(extra.len() as u16);
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(&extra);
        out
    }

    fn central_record(&self) -> Vec<u8> {
        let header = &self.header;
        let mut extra = Vec::new();
        let mut field = |value: u64| -> u32 {
            if needs_zip64(value) {
                let _ = extra.write_u64::<LittleEndian>(value);
                ZIP64_MARKER_32
            } else {
                value as u32
            }
        };
        // Order is fixed: uncompressed, compressed, local header offset.
        let uncompressed = field(header.uncompressed_size);
        let compressed = field(header.compressed_size);
        let lfh_offset = field(self.lfh_offset);
        if !extra.is_empty() {
            let mut tagged = Vec::with_capacity(4 + extra.len());
            let _ = tagged.write_u16::<LittleEndian>(ZIP64_EXTRA_ID);
            let _ = tagged.write_u16::<LittleEndian>(extra.len() as u16);
            tagged.extend_from_slice(&extra);
            extra = tagged;
        }

        let mut out = Vec::with_capacity(
            CDFH_MIN_SIZE + header.name.len() + extra.len() + header.comment.len(),
        );
        out.extend_from_slice(CDFH_SIGNATURE);
        let _ = out.write_u16::<LittleEndian>(self.version_made_by());
        let _ = out.write_u16::<LittleEndian>(self.version());
        let _ = out.write_u16::<LittleEndian>(self.flags);
        let _ = out.write_u16::<LittleEndian>(header.method.as_u16());
        let _ = out.write_u16::<LittleEndian>(header.modified.time);
        let _ = out.write_u16::<LittleEndian>(header.modified.date);
        let _ = out.write_u32::<LittleEndian>(header.crc32);
        let _ = out.write_u32::<LittleEndian>(compressed);
        let _ = out.write_u32::<LittleEndian>(uncompressed);
        let _ = out.write_u16::<LittleEndian>(header.name.len() as u16);
        let _ = out.write_u16::<LittleEndian>(extra.len() as u16);
        let _ = out.write_u16::<LittleEndian>(header.comment.len() as u16);
        let _ = out.write_u16::<LittleEndian>(0); // disk number start
        let _ = out.write_u16::<LittleEndian>(0); // internal attributes
        let _ = out.write_u32::<LittleEndian>(header.external_attributes());
        let _ = out.write_u32::<LittleEndian>(lfh_offset);
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(&extra);
        out.extend_from_slice(header.comment.as_bytes());
        out
    }
}

fn needs_zip64(value: u64) -> bool {
    value >= u64::from(ZIP64_MARKER_32)
}

fn check_len(what: &str, name: &str, len: usize) -> MergeResult<()> {
    if len > usize::from(u16::MAX) {
        return Err(MergeError::InvalidArchive(format!(
            "{what} of {name} is {len} bytes, the format allows {}",
            u16::MAX
        )));
    }
    Ok(())
}

/// Writes a ZIP archive to an async sink, tracking the output offset.
pub struct ZipWriter<W> {
    out: W,
    offset: u64,
    entries: Vec<WrittenEntry>,
    /// Payload bytes written for the open entry.
    open: Option<u64>,
}

impl<W: AsyncWrite + Unpin> ZipWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            entries: Vec::new(),
            open: None,
        }
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    async fn emit(&mut self, data: &[u8]) -> MergeResult<()> {
        use tokio::io::AsyncWriteExt;

        self.out.write_all(data).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Write the local header for `header`; its payload follows through
    /// [`write_data`](Self::write_data).
    pub async fn start_entry(&mut self, header: &EntryHeader) -> MergeResult<()> {
        if self.open.is_some() {
            return Err(MergeError::InvalidArchive(format!(
                "cannot start {} before the previous entry ends",
                header.name
            )));
        }
        check_len("name", &header.name, header.name.len())?;
        check_len("comment", &header.name, header.comment.len())?;

        let mut flags = 0;
        if !header.name.is_ascii() || !header.comment.is_ascii() {
            flags |= FLAG_UTF8;
        }
        let entry = WrittenEntry {
            header: header.clone(),
            flags,
            lfh_offset: self.offset,
        };
        let local = entry.local_header();
        self.emit(&local).await?;
        self.entries.push(entry);
        self.open = Some(0);
        Ok(())
    }

    /// Append raw (already compressed) payload to the open entry.
    pub async fn write_data(&mut self, data: &[u8]) -> MergeResult<()> {
        let Some(written) = self.open else {
            return Err(MergeError::InvalidArchive(
                "payload written outside of an entry".into(),
            ));
        };
        self.emit(data).await?;
        self.open = Some(written + data.len() as u64);
        Ok(())
    }

    /// Close the open entry, checking that its payload matched the header.
    pub async fn end_entry(&mut self) -> MergeResult<()> {
        let written = self.open.take().unwrap_or_default();
        let Some(entry) = self.entries.last() else {
            return Ok(());
        };
        if written != entry.header.compressed_size {
            return Err(MergeError::ContentMismatch {
                path: entry.header.name.clone(),
                reason: format!(
                    "wrote {written} payload bytes, header says {}",
                    entry.header.compressed_size
                ),
            });
        }
        Ok(())
    }

    /// Write one entry whose payload is already in memory.
    pub async fn write_entry(&mut self, header: &EntryHeader, data: &[u8]) -> MergeResult<()> {
        self.start_entry(header).await?;
        self.write_data(data).await?;
        self.end_entry().await
    }

    /// Write the central directory and end records, flush, and hand back the
    /// sink along with the total archive size.
    pub async fn finish(mut self, comment: &str) -> MergeResult<(W, u64)> {
        if self.open.is_some() {
            self.end_entry().await?;
        }
        check_len("archive comment", "archive", comment.len())?;

        let cd_offset = self.offset;
        let mut directory = Vec::new();
        for entry in &self.entries {
            directory.extend_from_slice(&entry.central_record());
        }
        self.emit(&directory).await?;
        let cd_size = directory.len() as u64;
        let count = self.entries.len() as u64;

        let zip64 = count >= u64::from(ZIP64_MARKER_16) || needs_zip64(cd_size) || needs_zip64(cd_offset);
        let mut tail = Vec::new();
        if zip64 {
            let eocd64_offset = self.offset;
            Zip64EOCD::new(count, cd_size, cd_offset).write_to(&mut tail);
            Zip64EOCDLocator {
                disk_with_eocd64: 0,
                eocd64_offset,
                total_disks: 1,
            }
            .write_to(&mut tail);
        }
        let entries16 = if zip64 { ZIP64_MARKER_16 } else { count as u16 };
        EndOfCentralDirectory {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries16,
            total_entries: entries16,
            cd_size: if zip64 { ZIP64_MARKER_32 } else { cd_size as u32 },
            cd_offset: if zip64 { ZIP64_MARKER_32 } else { cd_offset as u32 },
            comment_len: comment.len() as u16,
        }
        .write_to(&mut tail);
        tail.extend_from_slice(comment.as_bytes());
        self.emit(&tail).await?;
        tokio::io::AsyncWriteExt::flush(&mut self.out).await?;

        Ok((self.out, self.offset))
    }
}
