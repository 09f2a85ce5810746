//! # rezip
//!
//! Merges many ZIP archives into one while storing every distinct piece of
//! payload only once.
//!
//! Source archives are parsed against a [`ByteSource`], so an archive held as
//! a sequence of bounded [`ViewBuffer`] views is never made contiguous. Each
//! entry's compressed payload is cut into views and pushed into a
//! [`ContentStore`], a refcounted, content-addressed store backed by a work
//! directory. The [`Merger`] registers entries under folders and finally
//! streams them, in order, into one destination archive; every chunk file is
//! deleted as soon as the last entry referencing it has been written.
//!
//! ## Features
//!
//! - Deduplication of identical payload across all sources
//! - `-part-NN` archives collapsed into one folder
//! - ZIP64 for large entries and large merged outputs
//! - Continues in memory if the work directory stops accepting writes
//! - Optional decode-and-check of every entry while writing
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use rezip::{FileSource, MergeConfig, Merger};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut merger = Merger::open(MergeConfig::default())?;
//!
//!     let source = Arc::new(FileSource::open(Path::new("course-part-01.zip"))?);
//!     merger.folder("course-part-01").load_archive(source).await?;
//!
//!     merger
//!         .write_to_file(Path::new("merged.zip"), |p| println!("{:5.1}% {}", p.percent, p.current_entry))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod cli;
pub mod config;
pub mod decode;
pub mod entry;
pub mod error;
pub mod io;
pub mod merge;
pub mod pool;
pub mod retry;
pub mod store;
pub mod stream;
pub mod zip;

pub use buffer::{ByteView, ViewBuffer};
pub use cli::Cli;
pub use config::MergeConfig;
pub use entry::{Entry, EntrySink};
pub use error::{MergeError, MergeResult};
pub use io::{ByteSource, FileSource};
pub use merge::{FileOptions, Folder, Merger, Progress, WriteSummary};
pub use pool::ConcurrencyPool;
pub use retry::RetryPolicy;
pub use store::{ChunkHash, ChunkRefs, ContentStore};
pub use stream::{ChunkStream, PauseHandle};
pub use zip::{ZipExtractor, ZipReader, ZipWriter};
