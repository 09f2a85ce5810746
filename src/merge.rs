//! Merge/compose engine.
//!
//! A [`Merger`] owns the entry registry of one run. Entries are registered
//! under folder prefixes, either by loading whole source archives or one
//! file at a time; their payloads already live in the shared
//! [`ContentStore`], so identical content from different sources is stored
//! once. [`Merger::write_to`] then streams every entry, in registration
//! order, into a single destination archive.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, BufWriter};
use tracing::{debug, info, warn};

use crate::buffer::split_bytes;
use crate::config::MergeConfig;
use crate::decode::{ContentDecoder, crc32};
use crate::entry::{Entry, EntrySink};
use crate::error::{MergeError, MergeResult};
use crate::io::ByteSource;
use crate::pool::ConcurrencyPool;
use crate::store::{ChunkRefs, ContentStore};
use crate::stream::ChunkStream;
use crate::zip::{ArchiveInfo, CompressionMethod, DosDateTime, EntryHeader, ZipReader, ZipWriter};

/// Characters replaced in path components.
const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Options for content registered from memory.
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    /// DEFLATE the content instead of storing it.
    pub compress: bool,
    pub modified: DosDateTime,
    pub unix_mode: Option<u32>,
    pub comment: String,
}

/// Reported after each entry is written.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub percent: f64,
    pub current_entry: &'a str,
}

#[derive(Debug, Clone)]
pub struct WriteSummary {
    pub entries: usize,
    pub bytes_written: u64,
    /// Whether the work directory stopped accepting chunks during the run.
    pub writes_disabled: bool,
}

/// The entry registry for one merge run.
pub struct Merger {
    store: Arc<ContentStore>,
    config: MergeConfig,
    entries: Vec<Entry>,
    /// Path to position in `entries`.
    index: HashMap<String, usize>,
    /// Directories created here rather than read from a source.
    synthetic: HashSet<String>,
    comment: String,
}

impl Merger {
    pub fn new(store: Arc<ContentStore>, config: MergeConfig) -> Self {
        Self {
            store,
            config,
            entries: Vec::new(),
            index: HashMap::new(),
            synthetic: HashSet::new(),
            comment: String::new(),
        }
    }

    /// Validate `config` and open a store on its work directory.
    pub fn open(config: MergeConfig) -> MergeResult<Self> {
        config.validate()?;
        let store = ContentStore::open(&config)?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// The archive root.
    pub fn root(&mut self) -> Folder<'_> {
        Folder {
            merger: self,
            prefix: String::new(),
        }
    }

    /// A folder at the archive root; see [`Folder::folder`].
    pub fn folder(&mut self, name: &str) -> Folder<'_> {
        self.root().into_folder(name)
    }

    /// Register `entry` under `path`, relative to the archive root.
    pub fn file(&mut self, path: &str, entry: Entry) {
        self.register(path, entry);
    }

    /// Register content held in memory; see [`Folder::file_bytes`].
    pub async fn file_bytes(&mut self, path: &str, data: Bytes, options: &FileOptions) -> MergeResult<()> {
        self.root().file_bytes(path, data, options).await
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered paths in write order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(Entry::name)
    }

    fn register(&mut self, path: &str, mut entry: Entry) {
        let Some(path) = entry_path(path, entry.header.is_directory) else {
            warn!(path, "dropping entry with an empty path");
            return;
        };

        if self.config.create_folders {
            self.register_parents(&path);
        }

        if let Some(&position) = self.index.get(&path) {
            if entry.header.is_directory
                && self.entries[position].header.is_directory
                && !self.synthetic.contains(&path)
            {
                return;
            }
            self.synthetic.remove(&path);
            debug!(%path, "replacing earlier entry");
            entry.header.name = path;
            // The replaced entry's chunk references are released here.
            self.entries[position] = entry;
            return;
        }

        entry.header.name = path.clone();
        self.index.insert(path, self.entries.len());
        self.entries.push(entry);
    }

    fn register_parents(&mut self, path: &str) {
        let trimmed = path.trim_end_matches('/');
        for (end, _) in trimmed.match_indices('/') {
            self.register_folder(&trimmed[..=end]);
        }
    }

    /// A directory entry for `path` unless one is already registered. A
    /// source's own entry for the same path replaces it later.
    fn register_folder(&mut self, path: &str) {
        if self.index.contains_key(path) {
            return;
        }
        self.synthetic.insert(path.to_string());
        self.index.insert(path.to_string(), self.entries.len());
        self.entries
            .push(Entry::directory(path, Arc::clone(&self.store)));
    }

    /// Write every entry, in registration order, as one archive.
    ///
    /// Before an entry is streamed its chunks must be present in the store;
    /// missing ones are retried under the configured policy. Any failure
    /// aborts the whole write. `on_progress` runs after each entry.
    pub async fn write_to<W, F>(self, out: W, mut on_progress: F) -> MergeResult<WriteSummary>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(Progress<'_>),
    {
        let Merger {
            store,
            config,
            entries,
            comment,
            ..
        } = self;
        let total = entries.len();
        info!(entries = total, unique_chunks = store.unique_chunks(), "writing merged archive");

        let pool = ConcurrencyPool::new(config.max_concurrent);
        let mut writer = ZipWriter::new(out);
        for (done, entry) in entries.into_iter().enumerate() {
            let (header, refs) = entry.into_parts();
            write_entry(&mut writer, &pool, &config, &header, refs)
                .await
                .map_err(|e| MergeError::EntryWrite {
                    path: header.name.clone(),
                    source: Box::new(e),
                })?;
            on_progress(Progress {
                percent: 100.0 * (done + 1) as f64 / total as f64,
                current_entry: &header.name,
            });
        }

        let (_, bytes_written) = writer.finish(&comment).await?;
        let summary = WriteSummary {
            entries: total,
            bytes_written,
            writes_disabled: store.writes_disabled(),
        };
        info!(
            entries = summary.entries,
            bytes = summary.bytes_written,
            "merged archive written"
        );
        Ok(summary)
    }

    /// [`write_to`](Self::write_to) a new file at `dest`. A partially
    /// written file is removed on failure.
    pub async fn write_to_file<F>(self, dest: &Path, on_progress: F) -> MergeResult<WriteSummary>
    where
        F: FnMut(Progress<'_>),
    {
        let file = tokio::fs::File::create(dest).await?;
        let result = self.write_to(BufWriter::new(file), on_progress).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                warn!(path = %dest.display(), error = %e, "failed to remove partial output");
            }
        }
        result
    }
}

async fn write_entry<W>(
    writer: &mut ZipWriter<W>,
    pool: &ConcurrencyPool,
    config: &MergeConfig,
    header: &EntryHeader,
    refs: ChunkRefs,
) -> MergeResult<()>
where
    W: AsyncWrite + Unpin,
{
    refs.store().get(refs.hashes(), pool, &config.ready_retry).await?;
    let mut stream = ChunkStream::open(refs).await?;
    let mut decoder = if config.verify && !header.is_directory {
        Some(ContentDecoder::new(header)?)
    } else {
        None
    };

    debug!(name = %header.name, bytes = stream.eventual_bytes(), "writing entry");
    writer.start_entry(header).await?;
    while let Some(chunk) = stream.next_chunk().await {
        let chunk = chunk?;
        if let Some(decoder) = decoder.as_mut() {
            decoder.push(&chunk.data)?;
        }
        writer.write_data(&chunk.data).await?;
    }
    writer.end_entry().await?;

    if let Some(decoder) = decoder {
        decoder.finish()?;
    }
    Ok(())
}

/// A namespace inside the archive being built.
pub struct Folder<'a> {
    merger: &'a mut Merger,
    /// Empty at the root, otherwise ends with `/`.
    prefix: String,
}

impl<'a> Folder<'a> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn child_prefix(&mut self, name: &str) -> String {
        let name = sanitize_path(strip_part_suffix(name));
        if name.is_empty() {
            return self.prefix.clone();
        }
        let prefix = format!("{}{name}/", self.prefix);
        self.merger.register_folder(&prefix);
        prefix
    }

    fn into_folder(mut self, name: &str) -> Folder<'a> {
        let prefix = self.child_prefix(name);
        Folder {
            merger: self.merger,
            prefix,
        }
    }

    /// A sub-folder named `name`. A trailing `-part-NN` is dropped so every
    /// part of a split download lands in the same folder.
    pub fn folder(&mut self, name: &str) -> Folder<'_> {
        let prefix = self.child_prefix(name);
        Folder {
            merger: &mut *self.merger,
            prefix,
        }
    }

    /// Register `entry` at `path` under this folder. A path that is already
    /// registered is replaced in place.
    pub fn file(&mut self, path: &str, entry: Entry) {
        let full = format!("{}{path}", self.prefix);
        self.merger.register(&full, entry);
    }

    /// Register `data` at `path`, optionally compressed. The content goes
    /// through the store like any other payload.
    pub async fn file_bytes(&mut self, path: &str, data: Bytes, options: &FileOptions) -> MergeResult<()> {
        let (method, payload) = if options.compress {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            (CompressionMethod::Deflate, Bytes::from(encoder.finish()?))
        } else {
            (CompressionMethod::Stored, data.clone())
        };

        let header = EntryHeader {
            name: path.to_string(),
            method,
            compressed_size: payload.len() as u64,
            uncompressed_size: data.len() as u64,
            crc32: crc32(&data),
            is_directory: false,
            modified: options.modified,
            unix_mode: options.unix_mode,
            dos_attributes: 0,
            comment: options.comment.clone(),
        };
        let views = split_bytes(&payload, self.merger.config.view_size);
        let chunks = self.merger.store.put(views).await;
        self.file(path, Entry::new(header, chunks));
        Ok(())
    }

    /// Parse a source archive and register all of its entries under this
    /// folder. A non-empty archive comment becomes the merged comment.
    pub async fn load_archive<R>(&mut self, source: Arc<R>) -> MergeResult<ArchiveInfo>
    where
        R: ByteSource + ?Sized,
    {
        let store = Arc::clone(&self.merger.store);
        let reader = ZipReader::new(source, self.merger.config.view_size);
        let info = reader.read_into(&store, self).await?;
        if !info.comment.is_empty() {
            self.merger.comment = info.comment.clone();
        }
        debug!(folder = %self.prefix, entries = info.entries, "loaded archive");
        Ok(info)
    }

    /// Register already-parsed entries under this folder, keeping their names.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = Entry>) {
        for entry in entries {
            let path = entry.header.name.clone();
            self.file(&path, entry);
        }
    }
}

impl EntrySink for Folder<'_> {
    fn accept(&mut self, entry: Entry) -> MergeResult<()> {
        let path = entry.header.name.clone();
        self.file(&path, entry);
        Ok(())
    }
}

/// Sanitised registry key; directories keep a trailing `/`.
fn entry_path(path: &str, is_directory: bool) -> Option<String> {
    let clean = sanitize_path(path);
    match (clean.is_empty(), is_directory) {
        (true, _) => None,
        (false, true) => Some(clean + "/"),
        (false, false) => Some(clean),
    }
}

/// Drop a trailing `-part-NN` from `name`.
pub fn strip_part_suffix(name: &str) -> &str {
    match name.rfind("-part-") {
        Some(at) => {
            let digits = &name[at + "-part-".len()..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                &name[..at]
            } else {
                name
            }
        }
        None => name,
    }
}

/// Folder name for a downloaded archive: file name without `.zip` and
/// without any `-part-NN` suffix.
pub fn archive_folder_name(file_name: &str) -> &str {
    let stem = match file_name.len().checked_sub(4) {
        Some(at) if file_name.is_char_boundary(at) && file_name[at..].eq_ignore_ascii_case(".zip") => {
            &file_name[..at]
        }
        _ => file_name,
    };
    strip_part_suffix(stem)
}

/// Normalise a path for use inside the archive: `\` separators become `/`,
/// empty `.` and `..` components are dropped, and characters most
/// filesystems reject are replaced with `_`. Never has a leading or
/// trailing `/`.
pub fn sanitize_path(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .map(|part| {
            part.chars()
                .map(|c| {
                    if c.is_control() || INVALID_PATH_CHARS.contains(&c) {
                        '_'
                    } else {
                        c
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ViewBuffer;
    use crate::retry::RetryPolicy;
    use crate::store::tests::{local_store, slow_store};
    use std::time::Duration;
    use crate::zip::ZipExtractor;
    use proptest::prelude::*;

    fn merger(dir: &Path) -> Merger {
        let config = MergeConfig {
            work_dir: dir.to_path_buf(),
            view_size: 8,
            ..MergeConfig::default()
        };
        Merger::new(local_store(dir), config)
    }

    #[test]
    fn part_suffixes_are_stripped() {
        assert_eq!(strip_part_suffix("foo-part-01"), "foo");
        assert_eq!(strip_part_suffix("foo-part-2"), "foo");
        assert_eq!(strip_part_suffix("foo-part-"), "foo-part-");
        assert_eq!(strip_part_suffix("foo-part-1a"), "foo-part-1a");
        assert_eq!(strip_part_suffix("foo"), "foo");
        assert_eq!(archive_folder_name("Course-part-03.zip"), "Course");
        assert_eq!(archive_folder_name("Course.ZIP"), "Course");
        assert_eq!(archive_folder_name("notes"), "notes");
    }

    #[test]
    fn sanitizing_drops_traversal_and_bad_characters() {
        assert_eq!(sanitize_path("../a/./b\\c.txt"), "a/b/c.txt");
        assert_eq!(sanitize_path("/abs//x/"), "abs/x");
        assert_eq!(sanitize_path("what?.txt"), "what_.txt");
        assert_eq!(sanitize_path(".."), "");
    }

    proptest! {
        #[test]
        fn sanitized_paths_are_stable(path in "[a-z./\\\\:?]{0,40}") {
            let clean = sanitize_path(&path);
            prop_assert!(!clean.starts_with('/'));
            prop_assert!(!clean.ends_with('/'));
            prop_assert!(!clean.contains('\\'));
            prop_assert!(clean.split('/').all(|c| c != ".." && c != "."));
            prop_assert_eq!(sanitize_path(&clean), clean.clone());
        }
    }

    #[tokio::test]
    async fn parts_collapse_into_one_folder_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = merger(dir.path());
        let options = FileOptions::default();

        merger
            .folder("course-part-01")
            .file_bytes("videos/a.mp4", Bytes::from_static(b"aaa"), &options)
            .await
            .unwrap();
        merger
            .folder("course-part-02")
            .file_bytes("videos/b.mp4", Bytes::from_static(b"bbb"), &options)
            .await
            .unwrap();

        let paths: Vec<_> = merger.paths().collect();
        assert_eq!(
            paths,
            [
                "course/",
                "course/videos/",
                "course/videos/a.mp4",
                "course/videos/b.mp4"
            ]
        );
    }

    #[tokio::test]
    async fn source_directories_replace_created_parents() {
        let modified = DosDateTime::new(2020, 1, 2, 3, 4, 6);
        let mut writer = ZipWriter::new(Vec::new());
        let file = EntryHeader {
            name: "docs/a.txt".into(),
            method: CompressionMethod::Stored,
            compressed_size: 2,
            uncompressed_size: 2,
            crc32: crc32(b"hi"),
            is_directory: false,
            modified,
            unix_mode: Some(0o100644),
            dos_attributes: 0,
            comment: String::new(),
        };
        writer.write_entry(&file, b"hi").await.unwrap();
        // The directory is listed after its child.
        let folder = EntryHeader {
            modified,
            unix_mode: Some(0o40750),
            ..EntryHeader::directory("docs/")
        };
        writer.write_entry(&folder, b"").await.unwrap();
        let (bytes, _) = writer.finish("").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut merger = merger(dir.path());
        merger
            .root()
            .load_archive(Arc::new(ViewBuffer::from_bytes(bytes, 64)))
            .await
            .unwrap();

        assert_eq!(merger.paths().collect::<Vec<_>>(), ["docs/", "docs/a.txt"]);
        let docs = &merger.entries[0].header;
        assert_eq!(docs.modified, modified);
        assert_eq!(docs.unix_mode, Some(0o40750));

        // Created folders never displace one read from a source.
        merger.folder("docs");
        assert_eq!(merger.entries[0].header.unix_mode, Some(0o40750));
    }

    #[tokio::test]
    async fn registering_a_path_twice_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = merger(dir.path());
        let options = FileOptions::default();
        merger
            .file_bytes("a.txt", Bytes::from_static(b"old content"), &options)
            .await
            .unwrap();
        merger
            .file_bytes("b.txt", Bytes::from_static(b"b"), &options)
            .await
            .unwrap();
        merger
            .file_bytes("./a.txt", Bytes::from_static(b"new"), &options)
            .await
            .unwrap();

        assert_eq!(merger.paths().collect::<Vec<_>>(), ["a.txt", "b.txt"]);
        // Only "new" and "b" remain referenced.
        assert_eq!(merger.store().unique_chunks(), 2);
    }

    #[tokio::test]
    async fn written_archive_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = merger(dir.path());
        merger.config.verify = true;
        let text: Vec<u8> = b"line of text\n".repeat(50);
        merger
            .file_bytes(
                "docs/readme.txt",
                Bytes::from(text.clone()),
                &FileOptions {
                    compress: true,
                    ..FileOptions::default()
                },
            )
            .await
            .unwrap();
        merger
            .file_bytes("raw.bin", Bytes::from_static(b"0123456789abcdef!"), &FileOptions::default())
            .await
            .unwrap();
        merger.set_comment("combined");

        let mut seen = Vec::new();
        let mut out = Vec::new();
        let summary = merger
            .write_to(&mut out, |p| seen.push((p.current_entry.to_string(), p.percent)))
            .await
            .unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.bytes_written, out.len() as u64);
        assert_eq!(seen.last().unwrap(), &("raw.bin".to_string(), 100.0));

        let extractor = ZipExtractor::new(Arc::new(ViewBuffer::from_bytes(out, 64)));
        let (entries, comment) = extractor.list_files().await.unwrap();
        assert_eq!(comment, "combined");
        let names: Vec<_> = entries.iter().map(|e| e.header.name.as_str()).collect();
        assert_eq!(names, ["docs/", "docs/readme.txt", "raw.bin"]);
        assert_eq!(&extractor.extract_to_memory(&entries[1]).await.unwrap()[..], &text[..]);
        assert_eq!(
            &extractor.extract_to_memory(&entries[2]).await.unwrap()[..],
            b"0123456789abcdef!"
        );
    }

    #[tokio::test]
    async fn slow_disc_writes_do_not_block_the_merge() {
        let dir = tempfile::tempdir().unwrap();
        let config = MergeConfig {
            work_dir: dir.path().to_path_buf(),
            ready_retry: RetryPolicy::fixed(3, Duration::from_millis(10)),
            verify: true,
            ..MergeConfig::default()
        };
        let mut merger = Merger::new(slow_store(dir.path(), Duration::from_millis(400)), config);
        merger
            .file_bytes("a.txt", Bytes::from_static(b"hello"), &FileOptions::default())
            .await
            .unwrap();

        let mut out = Vec::new();
        merger.write_to(&mut out, |_| {}).await.unwrap();

        let extractor = ZipExtractor::new(Arc::new(ViewBuffer::from_bytes(out, 64)));
        let (entries, _) = extractor.list_files().await.unwrap();
        assert_eq!(&extractor.extract_to_memory(&entries[0]).await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn failed_entry_aborts_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = merger(dir.path());
        merger
            .file_bytes("gone.txt", Bytes::from_static(b"vanishing"), &FileOptions::default())
            .await
            .unwrap();
        merger.store().settled().await;
        for entry in std::fs::read_dir(dir.path().join("work")).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }

        let dest = dir.path().join("out.zip");
        let err = merger.write_to_file(&dest, |_| {}).await.unwrap_err();
        match err {
            MergeError::EntryWrite { path, source } => {
                assert_eq!(path, "gone.txt");
                assert!(matches!(*source, MergeError::StatFailure { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
    }
}
