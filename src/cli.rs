use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::buffer::DEFAULT_VIEW_SIZE;
use crate::config::{DEFAULT_MAX_CONCURRENT, DEFAULT_WORK_DIR, MergeConfig};

/// Name of the report added to the output when sources are skipped.
pub const DEFAULT_FAILURE_REPORT: &str = "FAILED_SOURCES.log";

#[derive(Parser, Debug)]
#[command(name = "rezip")]
#[command(version)]
#[command(about = "Merge many ZIP archives into one, storing duplicate content once", long_about = None)]
#[command(after_help = "Examples:\n  \
  rezip merge -o all.zip course-part-01.zip course-part-02.zip   merge both parts into all.zip/course/\n  \
  rezip merge -o all.zip --root site -j 2 *.zip                  nest everything under site/\n  \
  rezip verify -l all.zip                                        check every entry and list it")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// More log output (-v => debug, -vv => trace)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', long, global = true, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge source archives into one output archive
    Merge(MergeArgs),
    /// Check that every entry of an archive decodes to its recorded size and CRC
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Source ZIP files; each lands in a folder named after it
    #[arg(value_name = "ARCHIVE", required = true)]
    pub archives: Vec<PathBuf>,

    /// Output ZIP file
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: PathBuf,

    /// Folder inside the output that holds every source folder
    #[arg(long, value_name = "DIR")]
    pub root: Option<String>,

    /// Directory for temporary chunk files
    #[arg(long, value_name = "DIR", env = "REZIP_WORK_DIR", default_value = DEFAULT_WORK_DIR)]
    pub work_dir: PathBuf,

    /// Largest in-memory view and stored chunk, in bytes
    #[arg(long, value_name = "BYTES", env = "REZIP_VIEW_SIZE", default_value_t = DEFAULT_VIEW_SIZE)]
    pub view_size: usize,

    /// Concurrent source reads and chunk writes
    #[arg(short = 'j', long, value_name = "N", env = "REZIP_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent: usize,

    /// Load each source fully into memory before parsing it
    #[arg(long)]
    pub in_memory: bool,

    /// Decode every entry while writing and check its size and CRC-32
    #[arg(long)]
    pub verify: bool,

    /// Abort on the first unreadable source instead of skipping it
    #[arg(long)]
    pub strict: bool,

    /// Do not add directory entries for parent folders
    #[arg(long)]
    pub no_folders: bool,

    /// Name of the skipped-sources report inside the output
    #[arg(long, value_name = "NAME", default_value = DEFAULT_FAILURE_REPORT)]
    pub failure_report: String,
}

impl MergeArgs {
    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            view_size: self.view_size,
            max_concurrent: self.max_concurrent,
            work_dir: self.work_dir.clone(),
            create_folders: !self.no_folders,
            verify: self.verify,
            ..MergeConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// ZIP file to check
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// List entries verbosely while checking
    #[arg(short = 'l')]
    pub list: bool,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (q, _) if q > 1 => "error",
            (1, _) => "warn",
            (_, 0) => "info",
            (_, 1) => "debug",
            _ => "trace",
        }
    }
}
