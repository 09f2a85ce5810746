//! ZIP structural reader.
//!
//! Works against any [`ByteSource`], so a multi-gigabyte archive held as a
//! sequence of bounded views is parsed without ever being made contiguous.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read the Central Directory to get metadata for all entries
//! 4. For each entry, read its Local File Header to locate the payload
//!
//! Payloads are never decompressed here. They are pushed into the
//! [`ContentStore`] one view-sized piece at a time, and the resulting
//! [`Entry`] is handed to an [`EntrySink`].

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::debug;

use crate::entry::{Entry, EntrySink};
use crate::error::{MergeError, MergeResult};
use crate::io::ByteSource;
use crate::store::{ChunkRefs, ContentStore};

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// What the central directory says about the archive as a whole.
#[derive(Debug, Clone, Default)]
pub struct ArchiveInfo {
    pub entries: usize,
    pub comment: String,
}

/// Where the central directory lives, from the (ZIP64) end record.
#[derive(Debug, Clone)]
struct DirectoryLocation {
    offset: u64,
    size: u64,
    entries: u64,
    comment: String,
}

/// Reads ZIP structures from a [`ByteSource`].
///
/// ## Example
///
/// ```ignore
/// let reader = ZipReader::new(source, config.view_size);
/// let mut entries = Vec::new();
/// let info = reader.read_into(&store, &mut entries).await?;
/// ```
pub struct ZipReader<R: ByteSource + ?Sized> {
    source: Arc<R>,
    size: u64,
    /// Largest piece of payload read and stored at once.
    view_size: usize,
}

impl<R: ByteSource + ?Sized> ZipReader<R> {
    pub fn new(source: Arc<R>, view_size: usize) -> Self {
        let size = source.size();
        Self {
            source,
            size,
            view_size: view_size.max(1),
        }
    }

    pub fn source(&self) -> &Arc<R> {
        &self.source
    }

    async fn read_vec(&self, offset: u64, len: usize, what: &str) -> MergeResult<Vec<u8>> {
        let end = offset.checked_add(len as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(MergeError::InvalidArchive(format!(
                "{what} at offset {offset} runs past the end of the archive"
            )));
        }
        let mut buf = vec![0u8; len];
        self.source.read_exact_at(offset, &mut buf).await?;
        Ok(buf)
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Returns the record, its offset, and the archive comment that follows
    /// it. Fails with `SignatureNotFound` when no record whose comment length
    /// matches the remaining bytes exists in the tail of the source.
    pub async fn find_eocd(&self) -> MergeResult<(EndOfCentralDirectory, u64, String)> {
        let eocd_size = EndOfCentralDirectory::SIZE as u64;
        if self.size < eocd_size {
            return Err(MergeError::SignatureNotFound);
        }

        // Try the common case of no comment first.
        let offset = self.size - eocd_size;
        let buf = self.read_vec(offset, EndOfCentralDirectory::SIZE, "end record").await?;
        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && buf[20..22] == [0, 0] {
            let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
            return Ok((eocd, offset, String::new()));
        }

        // The EOCD could be earlier if there's a ZIP comment.
        let search_size = (MAX_COMMENT_SIZE + eocd_size).min(self.size);
        let search_start = self.size - search_size;
        let buf = self.read_vec(search_start, search_size as usize, "archive tail").await?;

        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] != EndOfCentralDirectory::SIGNATURE {
                continue;
            }
            let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
            if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                let eocd = EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
                let comment = String::from_utf8_lossy(&buf[i + EndOfCentralDirectory::SIZE..]).into_owned();
                return Ok((eocd, search_start + i as u64, comment));
            }
        }

        Err(MergeError::SignatureNotFound)
    }

    /// Read the ZIP64 End of Central Directory record through the locator
    /// that sits immediately before the regular EOCD.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> MergeResult<Zip64EOCD> {
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| MergeError::InvalidArchive("ZIP64 locator is missing".into()))?;
        let buf = self
            .read_vec(locator_offset, Zip64EOCDLocator::SIZE, "ZIP64 locator")
            .await?;
        let locator = Zip64EOCDLocator::from_bytes(&buf)?;
        if locator.total_disks > 1 {
            return Err(MergeError::Unsupported("split archives".into()));
        }

        let buf = self
            .read_vec(locator.eocd64_offset, Zip64EOCD::MIN_SIZE, "ZIP64 end record")
            .await?;
        Zip64EOCD::from_bytes(&buf)
    }

    async fn locate_directory(&self) -> MergeResult<DirectoryLocation> {
        let (eocd, eocd_offset, comment) = self.find_eocd().await?;

        if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            if eocd64.disk_number != 0 || eocd64.disk_with_cd != 0 {
                return Err(MergeError::Unsupported("split archives".into()));
            }
            Ok(DirectoryLocation {
                offset: eocd64.cd_offset,
                size: eocd64.cd_size,
                entries: eocd64.total_entries,
                comment,
            })
        } else {
            if eocd.is_multi_disk() {
                return Err(MergeError::Unsupported("split archives".into()));
            }
            Ok(DirectoryLocation {
                offset: u64::from(eocd.cd_offset),
                size: u64::from(eocd.cd_size),
                entries: u64::from(eocd.total_entries),
                comment,
            })
        }
    }

    /// Parse every central directory record.
    pub async fn central_directory(&self) -> MergeResult<(Vec<CentralEntry>, String)> {
        let location = self.locate_directory().await?;
        let cd_size = usize::try_from(location.size)
            .map_err(|_| MergeError::InvalidArchive("central directory is too large".into()))?;
        let cd_data = self
            .read_vec(location.offset, cd_size, "central directory")
            .await?;

        // Each record needs at least the fixed part, which bounds the count.
        if location.entries > (cd_size / CDFH_MIN_SIZE) as u64 {
            return Err(MergeError::InvalidArchive(format!(
                "{} entries cannot fit in a {cd_size} byte central directory",
                location.entries
            )));
        }

        let mut entries = Vec::with_capacity(location.entries as usize);
        let mut cursor = Cursor::new(cd_data.as_slice());
        for _ in 0..location.entries {
            let entry = parse_cdfh(&mut cursor)?;
            if entry.is_encrypted() {
                return Err(MergeError::Unsupported(format!(
                    "encrypted entry {}",
                    entry.header.name
                )));
            }
            entries.push(entry);
        }

        Ok((entries, location.comment))
    }

    /// Offset of an entry's payload, past its Local File Header.
    ///
    /// The local name and extra field may differ in length from the central
    /// record, so the header has to be read.
    pub async fn get_data_offset(&self, entry: &CentralEntry) -> MergeResult<u64> {
        let lfh = self.read_vec(entry.lfh_offset, LFH_SIZE, "local header").await?;
        if &lfh[0..4] != LFH_SIGNATURE {
            return Err(MergeError::InvalidArchive(format!(
                "bad local header signature for {}",
                entry.header.name
            )));
        }

        let name_len = u64::from(u16::from_le_bytes([lfh[26], lfh[27]]));
        let extra_len = u64::from(u16::from_le_bytes([lfh[28], lfh[29]]));
        let data_offset = entry.lfh_offset + LFH_SIZE as u64 + name_len + extra_len;

        let data_end = data_offset.checked_add(entry.header.compressed_size);
        if data_end.is_none_or(|end| end > self.size) {
            return Err(MergeError::InvalidArchive(format!(
                "payload of {} runs past the end of the archive",
                entry.header.name
            )));
        }
        Ok(data_offset)
    }

    /// Store one entry's compressed payload, view by view.
    async fn store_payload(
        &self,
        store: &Arc<ContentStore>,
        entry: &CentralEntry,
    ) -> MergeResult<ChunkRefs> {
        let mut refs = ChunkRefs::empty(Arc::clone(store));
        if entry.header.compressed_size == 0 {
            return Ok(refs);
        }

        let mut offset = self.get_data_offset(entry).await?;
        let mut remaining = entry.header.compressed_size;
        while remaining > 0 {
            let piece = remaining.min(self.view_size as u64) as usize;
            let view = self.source.read_bytes(offset, piece).await?;
            refs.push(view).await;
            offset += piece as u64;
            remaining -= piece as u64;
        }
        Ok(refs)
    }

    /// Parse the archive, pushing every payload into `store` and every
    /// resulting [`Entry`] into `sink`, in central directory order.
    pub async fn read_into<S>(&self, store: &Arc<ContentStore>, sink: &mut S) -> MergeResult<ArchiveInfo>
    where
        S: EntrySink + ?Sized,
    {
        let (records, comment) = self.central_directory().await?;
        let count = records.len();
        for record in records {
            let chunks = self.store_payload(store, &record).await?;
            debug!(
                name = %record.header.name,
                size = record.header.compressed_size,
                chunks = chunks.len(),
                "stored entry payload"
            );
            sink.accept(Entry::new(record.header, chunks))?;
        }
        Ok(ArchiveInfo {
            entries: count,
            comment,
        })
    }
}

/// Parse a whole archive into a list of entries.
pub async fn parse_archive<R>(
    source: Arc<R>,
    store: &Arc<ContentStore>,
    view_size: usize,
) -> MergeResult<(Vec<Entry>, ArchiveInfo)>
where
    R: ByteSource + ?Sized,
{
    let reader = ZipReader::new(source, view_size);
    let mut entries = Vec::new();
    let info = reader.read_into(store, &mut entries).await?;
    Ok((entries, info))
}

fn truncated(_: std::io::Error) -> MergeError {
    MergeError::InvalidArchive("central directory record is truncated".into())
}

/// Parse one Central Directory File Header at the cursor.
///
/// Every size and offset is read as an unsigned value.
pub(crate) fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> MergeResult<CentralEntry> {
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig).map_err(truncated)?;
    if sig != CDFH_SIGNATURE {
        return Err(MergeError::InvalidArchive(
            "bad central directory record signature".into(),
        ));
    }

    let mut fixed = [0u8; CDFH_MIN_SIZE - 4];
    cursor.read_exact(&mut fixed).map_err(truncated)?;
    let mut fields = Cursor::new(&fixed[..]);
    let version_made_by = fields.read_u16::<LittleEndian>()?;
    let _version_needed = fields.read_u16::<LittleEndian>()?;
    let flags = fields.read_u16::<LittleEndian>()?;
    let method = fields.read_u16::<LittleEndian>()?;
    let time = fields.read_u16::<LittleEndian>()?;
    let date = fields.read_u16::<LittleEndian>()?;
    let crc32 = fields.read_u32::<LittleEndian>()?;
    let mut compressed_size = u64::from(fields.read_u32::<LittleEndian>()?);
    let mut uncompressed_size = u64::from(fields.read_u32::<LittleEndian>()?);
    let name_len = fields.read_u16::<LittleEndian>()? as usize;
    let extra_len = fields.read_u16::<LittleEndian>()? as usize;
    let comment_len = fields.read_u16::<LittleEndian>()? as usize;
    let disk_start = fields.read_u16::<LittleEndian>()?;
    let _internal_attrs = fields.read_u16::<LittleEndian>()?;
    let external_attrs = fields.read_u32::<LittleEndian>()?;
    let mut lfh_offset = u64::from(fields.read_u32::<LittleEndian>()?);

    let mut name = vec![0u8; name_len];
    cursor.read_exact(&mut name).map_err(truncated)?;
    let mut extra = vec![0u8; extra_len];
    cursor.read_exact(&mut extra).map_err(truncated)?;
    let mut comment = vec![0u8; comment_len];
    cursor.read_exact(&mut comment).map_err(truncated)?;

    // Fields are present in the ZIP64 record only when the header field
    // holds the marker, and always in this order.
    let mut extra = Cursor::new(extra.as_slice());
    while extra.position() + 4 <= extra_len as u64 {
        let id = extra.read_u16::<LittleEndian>()?;
        let size = u64::from(extra.read_u16::<LittleEndian>()?);
        let field_end = (extra.position() + size).min(extra_len as u64);
        if id == ZIP64_EXTRA_ID {
            if uncompressed_size == u64::from(ZIP64_MARKER_32) && extra.position() + 8 <= field_end {
                uncompressed_size = extra.read_u64::<LittleEndian>()?;
            }
            if compressed_size == u64::from(ZIP64_MARKER_32) && extra.position() + 8 <= field_end {
                compressed_size = extra.read_u64::<LittleEndian>()?;
            }
            if lfh_offset == u64::from(ZIP64_MARKER_32) && extra.position() + 8 <= field_end {
                lfh_offset = extra.read_u64::<LittleEndian>()?;
            }
        }
        extra.set_position(field_end);
    }

    if disk_start != 0 && disk_start != ZIP64_MARKER_16 {
        return Err(MergeError::Unsupported("split archives".into()));
    }

    let name = String::from_utf8_lossy(&name).into_owned();
    let host = (version_made_by >> 8) as u8;
    let unix_mode = (host == HOST_UNIX)
        .then_some(external_attrs >> 16)
        .filter(|mode| *mode != 0);
    let dos_attributes = (external_attrs & 0xFF) as u8;
    let is_directory = name.ends_with('/') || dos_attributes & DOS_DIRECTORY != 0;

    Ok(CentralEntry {
        header: EntryHeader {
            name,
            method: CompressionMethod::from_u16(method),
            compressed_size,
            uncompressed_size,
            crc32,
            is_directory,
            modified: DosDateTime { date, time },
            unix_mode,
            dos_attributes,
            comment: String::from_utf8_lossy(&comment).into_owned(),
        },
        flags,
        lfh_offset,
    })
}
