//! ZIP archive reading and writing.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD, file headers, etc.)
//! - [`parser`]: Structural reader that stores payloads without decompressing them
//! - [`writer`]: Streaming writer that re-applies ZIP framing around raw payloads
//! - [`extractor`]: Listing, extraction and verification of finished archives
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! Reading starts from the EOCD at the end of the source, so an archive held
//! as a sequence of views is never copied into one contiguous block.
//!
//! ## Supported Features
//!
//! - ZIP64 extensions for files and archives > 4GB
//! - STORED and DEFLATE compression methods
//! - Unix permission bits, DOS attributes and timestamps, comments
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

mod extractor;
mod parser;
mod structures;
mod writer;

pub use extractor::ZipExtractor;
pub use parser::{ArchiveInfo, ZipReader, parse_archive};
pub use structures::*;
pub use writer::ZipWriter;
