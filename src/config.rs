use std::path::PathBuf;

use crate::buffer::DEFAULT_VIEW_SIZE;
use crate::error::{MergeError, MergeResult};
use crate::retry::RetryPolicy;

/// More than 4 concurrent reads tends to cost more memory than it saves time.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

pub const DEFAULT_WORK_DIR: &str = ".rezip-work-dir-dont-mess-with-this";

/// Tunables for one merge run.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Upper bound for one buffer view and one stored chunk. Smaller values
    /// find more duplicate content at the cost of more chunk files.
    pub view_size: usize,
    /// Ceiling for concurrently outstanding reads and writes.
    pub max_concurrent: usize,
    /// Where chunk files live during the run.
    pub work_dir: PathBuf,
    /// Retry schedule for chunks missing from the store when an entry is
    /// about to be streamed.
    pub ready_retry: RetryPolicy,
    /// Register directory entries for the parents of every file.
    pub create_folders: bool,
    /// Decode every entry while writing and check its size and CRC-32.
    pub verify: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            view_size: DEFAULT_VIEW_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            ready_retry: RetryPolicy::default(),
            create_folders: true,
            verify: false,
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> MergeResult<()> {
        if self.view_size == 0 {
            return Err(MergeError::Config(
                "view size must be greater than zero".into(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(MergeError::Config(
                "concurrency limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
