//! Main entry point for the rezip CLI application.
//!
//! `merge` combines local archives into one output archive; `verify` checks
//! that every entry of an archive decodes to its recorded size and CRC-32.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use rezip::cli::{Command, MergeArgs, VerifyArgs};
use rezip::merge::archive_folder_name;
use rezip::zip::{ArchiveInfo, CentralEntry, parse_archive};
use rezip::{
    ByteSource, Cli, ConcurrencyPool, ContentStore, Entry, FileOptions, FileSource, Merger,
    ViewBuffer, ZipExtractor,
};

/// A parsed source, or the reason it was skipped.
type Loaded = std::result::Result<(Vec<Entry>, ArchiveInfo), String>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level());

    match &cli.command {
        Command::Merge(args) => merge(args, cli.is_quiet()).await,
        Command::Verify(args) => verify(args, cli.is_quiet()).await,
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn merge(args: &MergeArgs, quiet: bool) -> Result<()> {
    let start = Instant::now();
    let config = args.merge_config();
    let pool = ConcurrencyPool::new(config.max_concurrent);
    let mut merger = Merger::open(config.clone()).context("failed to set up the merge")?;

    // Parse sources concurrently; any fatal failure aborts the batch.
    let store = Arc::clone(merger.store());
    let units: Vec<_> = args
        .archives
        .iter()
        .map(|path| {
            let store = Arc::clone(&store);
            let view_size = config.view_size;
            move || async move { load_source(path, &store, view_size, args).await }
        })
        .collect();
    let loaded = pool.run(units).await?;

    let mut failed = Vec::new();
    for (path, outcome) in args.archives.iter().zip(loaded) {
        let (entries, info) = match outcome {
            Ok(parsed) => parsed,
            Err(reason) => {
                failed.push(format!("{}: {reason}", path.display()));
                continue;
            }
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut base = match &args.root {
            Some(root) => merger.folder(root),
            None => merger.root(),
        };
        base.folder(archive_folder_name(&file_name)).extend(entries);
        if !info.comment.is_empty() {
            merger.set_comment(info.comment);
        }
        if !quiet {
            println!("{file_name} included in output zip.");
        }
    }

    if !failed.is_empty() {
        let report = format!(
            "The following archives could not be included:\n{}\n",
            failed.join("\n")
        );
        merger
            .file_bytes(&args.failure_report, Bytes::from(report), &FileOptions::default())
            .await?;
    }

    let summary = merger
        .write_to_file(&args.output, |progress| {
            if !quiet {
                println!("[{:5.1}%] {}", progress.percent, progress.current_entry);
            }
        })
        .await
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    // Only succeeds once every chunk file is gone.
    if let Err(e) = tokio::fs::remove_dir(&config.work_dir).await {
        debug!(path = %config.work_dir.display(), error = %e, "work directory left in place");
    }

    if summary.writes_disabled {
        warn!("the work directory stopped accepting writes; chunks were kept in memory");
    }
    if !failed.is_empty() {
        eprintln!("Warning! Failed to include the following archives:");
        for failure in &failed {
            eprintln!("  {failure}");
        }
    }
    if !quiet {
        println!("{} written to file.", args.output.display());
        println!("Finished in {:.2}s.", start.elapsed().as_secs_f64());
        println!(
            "Final size of {}: {}.",
            args.output.display(),
            format_size(summary.bytes_written)
        );
    }

    Ok(())
}

/// Open and parse one source. Unreadable archives are reported back as
/// skipped unless `--strict` is set; anything else is fatal.
async fn load_source(
    path: &Path,
    store: &Arc<ContentStore>,
    view_size: usize,
    args: &MergeArgs,
) -> Result<Loaded> {
    let source: Arc<dyn ByteSource> = if args.in_memory {
        let buffer = ViewBuffer::from_file(path, view_size)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Arc::new(buffer)
    } else {
        Arc::new(FileSource::open(path)?)
    };

    match parse_archive(source, store, view_size).await {
        Ok(parsed) => {
            debug!(path = %path.display(), entries = parsed.1.entries, "parsed source archive");
            Ok(Ok(parsed))
        }
        Err(e) if e.is_source_rejection() && !args.strict => {
            warn!(path = %path.display(), error = %e, "skipping source archive");
            Ok(Err(e.to_string()))
        }
        Err(e) => Err(e).with_context(|| format!("failed to include {}", path.display())),
    }
}

async fn verify(args: &VerifyArgs, quiet: bool) -> Result<()> {
    let source = Arc::new(FileSource::open(&args.file)?);
    let extractor = ZipExtractor::new(source);
    let (entries, comment) = extractor.list_files().await?;

    if args.list {
        list_files(&entries);
    }
    if !comment.is_empty() && !quiet {
        println!("Archive comment: {comment}");
    }

    let mut bad = 0usize;
    for entry in entries.iter().filter(|e| !e.header.is_directory) {
        match extractor.verify_entry(entry).await {
            Ok(_) => {
                if !quiet && !args.list {
                    println!("    testing: {:<50} OK", entry.header.name);
                }
            }
            Err(e) => {
                bad += 1;
                eprintln!("    testing: {:<50} {e}", entry.header.name);
            }
        }
    }

    if bad > 0 {
        bail!("{bad} of {} entries failed verification", entries.len());
    }
    if !quiet {
        println!(
            "No errors detected in compressed data of {}.",
            args.file.display()
        );
    }
    Ok(())
}

/// Print a detailed table with size, compression ratio, and timestamps.
fn list_files(entries: &[CentralEntry]) {
    println!(
        "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
        "Length", "Size", "Cmpr", "Date", "Time"
    );
    println!("{}", "-".repeat(70));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        let header = &entry.header;
        let (year, month, day) = header.modified.date_parts();
        let (hour, minute, _second) = header.modified.time_parts();

        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            header.uncompressed_size,
            header.compressed_size,
            ratio(header.compressed_size, header.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            header.name
        );

        if !header.is_directory {
            total_uncompressed += header.uncompressed_size;
            total_compressed += header.compressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(70));
    println!(
        "{:>10}  {:>10}  {}  {:>21}  {} files",
        total_uncompressed,
        total_compressed,
        ratio(total_compressed, total_uncompressed),
        "",
        file_count
    );
}

/// Space saved by compression, as a percentage.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
