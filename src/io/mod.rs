mod local;

pub use local::FileSource;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;

/// Random-access view of an archive's raw bytes.
///
/// `size` is the "stat" half and `read_at` the "read" half; everything the
/// ZIP reader needs is expressed through these two.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Fill `buf` completely or fail.
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..]).await?;
            if n == 0 {
                bail!(
                    "unexpected end of source at offset {}",
                    offset + filled as u64
                );
            }
            filled += n;
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` as an owned buffer.
    ///
    /// Implementations backed by memory override this to avoid the copy.
    async fn read_bytes(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
