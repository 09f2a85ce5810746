//! Virtualized access to byte regions larger than any single allocation.
//!
//! A [`ViewBuffer`] keeps its content as an ordered list of physical views,
//! each exactly `view_size` bytes long except the last. Point reads resolve to
//! `(offset / view_size, offset % view_size)` without touching the other
//! views, and range reads hand out [`ByteView`]s that share memory with the
//! physical views whenever the range does not straddle a view boundary.

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::io::ByteSource;

/// Default upper bound for one view: 500 MB.
pub const DEFAULT_VIEW_SIZE: usize = 500_000_000;

/// Immutable window over at most `view_size` bytes of a logical buffer.
pub type ByteView = Bytes;

/// A logical byte buffer stored as bounded physical views.
#[derive(Debug, Clone)]
pub struct ViewBuffer {
    views: Vec<Bytes>,
    len: u64,
    view_size: usize,
}

impl ViewBuffer {
    /// An empty buffer that will use `view_size` bytes per view.
    pub fn new(view_size: usize) -> Self {
        Self {
            views: Vec::new(),
            len: 0,
            view_size: view_size.max(1),
        }
    }

    /// Wrap `data` without copying, slicing it into views.
    pub fn from_bytes(data: impl Into<Bytes>, view_size: usize) -> Self {
        let data = data.into();
        let mut buffer = Self::new(view_size);
        buffer.len = data.len() as u64;
        buffer.views = split_bytes(&data, buffer.view_size);
        buffer
    }

    /// Drain `reader` into a buffer, filling one view at a time.
    ///
    /// Only the view currently being filled is ever growing; finished views
    /// are frozen.
    pub async fn from_reader<R>(mut reader: R, view_size: usize) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = Self::new(view_size);
        let mut current = BytesMut::with_capacity(buffer.view_size.min(READ_CAPACITY));
        loop {
            if current.len() == buffer.view_size {
                buffer.push_view(current.split().freeze());
            }
            let want = (buffer.view_size - current.len()).min(READ_CAPACITY);
            current.reserve(want);
            let n = (&mut reader).take(want as u64).read_buf(&mut current).await?;
            if n == 0 {
                break;
            }
        }
        if !current.is_empty() {
            buffer.push_view(current.freeze());
        }
        Ok(buffer)
    }

    /// Read a whole file into a buffer.
    pub async fn from_file(path: &Path, view_size: usize) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Self::from_reader(file, view_size).await
    }

    fn push_view(&mut self, view: Bytes) {
        self.len += view.len() as u64;
        self.views.push(view);
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn view_size(&self) -> usize {
        self.view_size
    }

    /// The physical views, in order.
    pub fn views(&self) -> &[ByteView] {
        &self.views
    }

    /// Byte at logical offset `index`.
    pub fn byte_at(&self, index: u64) -> Option<u8> {
        let view = (index / self.view_size as u64) as usize;
        let offset = (index % self.view_size as u64) as usize;
        self.views.get(view)?.get(offset).copied()
    }

    /// Views covering `[start, start + length)`, each at most `view_size`
    /// bytes. View boundaries are counted from `start`, so the same payload
    /// always splits the same way regardless of where it sits in the buffer.
    pub fn split(&self, start: u64, length: u64) -> Result<Vec<ByteView>> {
        let end = match start.checked_add(length) {
            Some(end) if end <= self.len => end,
            _ => bail!(
                "range {}+{} is outside a buffer of {} bytes",
                start,
                length,
                self.len
            ),
        };
        let mut views = Vec::new();
        let mut offset = start;
        while offset < end {
            let size = (end - offset).min(self.view_size as u64) as usize;
            views.push(self.slice(offset, size));
            offset += size as u64;
        }
        Ok(views)
    }

    /// `size` bytes at `offset`; the caller guarantees the range is in bounds
    /// and `size <= view_size`.
    fn slice(&self, offset: u64, size: usize) -> ByteView {
        let first = (offset / self.view_size as u64) as usize;
        let within = (offset % self.view_size as u64) as usize;
        let view = &self.views[first];
        if within + size <= view.len() {
            return view.slice(within..within + size);
        }

        // Straddles a boundary: copy at most one view's worth.
        let mut out = BytesMut::with_capacity(size);
        let mut index = first;
        let mut within = within;
        while out.len() < size {
            let view = &self.views[index];
            let take = (view.len() - within).min(size - out.len());
            out.extend_from_slice(&view[within..within + take]);
            index += 1;
            within = 0;
        }
        out.freeze()
    }

    /// Copy the whole buffer into one contiguous allocation.
    pub fn to_contiguous(&self) -> Bytes {
        join(&self.views)
    }
}

/// Read granularity used while filling views from a reader.
const READ_CAPACITY: usize = 8 * 1024 * 1024;

/// Slice `data` into views of at most `view_size` bytes without copying.
pub fn split_bytes(data: &Bytes, view_size: usize) -> Vec<ByteView> {
    let view_size = view_size.max(1);
    let mut views = Vec::with_capacity(data.len().div_ceil(view_size));
    let mut offset = 0;
    while offset < data.len() {
        let size = view_size.min(data.len() - offset);
        views.push(data.slice(offset..offset + size));
        offset += size;
    }
    views
}

/// Concatenate views into one contiguous buffer.
///
/// This is the only operation that needs memory proportional to the full
/// length; a single view is returned as-is.
pub fn join(views: &[ByteView]) -> Bytes {
    match views {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let total = views.iter().map(Bytes::len).sum();
            let mut out = BytesMut::with_capacity(total);
            for view in views {
                out.extend_from_slice(view);
            }
            out.freeze()
        }
    }
}

#[async_trait]
impl ByteSource for ViewBuffer {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let size = (buf.len() as u64).min(self.len - offset) as usize;
        let mut copied = 0;
        while copied < size {
            let at = offset + copied as u64;
            let view = &self.views[(at / self.view_size as u64) as usize];
            let within = (at % self.view_size as u64) as usize;
            let take = (view.len() - within).min(size - copied);
            buf[copied..copied + take].copy_from_slice(&view[within..within + take]);
            copied += take;
        }
        Ok(size)
    }

    async fn read_bytes(&self, offset: u64, len: usize) -> Result<Bytes> {
        Ok(join(&self.split(offset, len as u64)?))
    }

    fn size(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn point_reads_resolve_into_views() {
        let buffer = ViewBuffer::from_bytes((0u8..=99).collect::<Vec<_>>(), 16);
        assert_eq!(buffer.views().len(), 7);
        assert_eq!(buffer.byte_at(0), Some(0));
        assert_eq!(buffer.byte_at(17), Some(17));
        assert_eq!(buffer.byte_at(99), Some(99));
        assert_eq!(buffer.byte_at(100), None);
    }

    #[test]
    fn split_shares_memory_inside_a_view() {
        let data = Bytes::from(vec![7u8; 64]);
        let buffer = ViewBuffer::from_bytes(data.clone(), 32);
        let views = buffer.split(4, 20).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].as_ptr(), data[4..].as_ptr());
    }

    #[test]
    fn split_is_aligned_to_range_start() {
        let buffer = ViewBuffer::from_bytes((0u8..40).collect::<Vec<_>>(), 10);
        let views = buffer.split(5, 25).unwrap();
        let lens: Vec<_> = views.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![10, 10, 5]);
        assert_eq!(&views[0][..], &(5u8..15).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn split_rejects_out_of_range() {
        let buffer = ViewBuffer::from_bytes(vec![0u8; 8], 4);
        assert!(buffer.split(4, 5).is_err());
        assert!(buffer.split(u64::MAX, 2).is_err());
        assert!(buffer.split(8, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn from_reader_fills_whole_views() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let buffer = ViewBuffer::from_reader(&data[..], 300).await.unwrap();
        let lens: Vec<_> = buffer.views().iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![300, 300, 300, 100]);
        assert_eq!(buffer.to_contiguous(), Bytes::from(data));
    }

    #[tokio::test]
    async fn read_at_crosses_views() {
        let buffer = ViewBuffer::from_bytes((0u8..50).collect::<Vec<_>>(), 8);
        let mut buf = [0u8; 12];
        let n = buffer.read_at(6, &mut buf).await.unwrap();
        assert_eq!(n, 12);
        assert_eq!(buf.to_vec(), (6u8..18).collect::<Vec<_>>());
        assert_eq!(buffer.read_at(50, &mut buf).await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn join_of_split_is_identity(
            data in proptest::collection::vec(any::<u8>(), 0..=2048),
            view_size in 1usize..=300,
            cut in 0usize..=2048,
        ) {
            let buffer = ViewBuffer::from_bytes(data.clone(), view_size);
            let views = buffer.split(0, data.len() as u64).unwrap();
            prop_assert!(views.iter().all(|v| v.len() <= view_size));
            prop_assert_eq!(&join(&views)[..], &data[..]);

            let start = cut.min(data.len());
            let tail = buffer.split(start as u64, (data.len() - start) as u64).unwrap();
            prop_assert_eq!(&join(&tail)[..], &data[start..]);
        }
    }
}
