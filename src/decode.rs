//! Decompression and verification stage.
//!
//! Consumes an entry's compressed bytes piece by piece, whatever produced
//! them (a chunk stream, a source archive), and checks the result against the
//! sizes and CRC-32 recorded in the entry header.

use bytes::Bytes;
use flate2::{Crc, Decompress, FlushDecompress, Status};

use crate::error::{MergeError, MergeResult};
use crate::zip::{CompressionMethod, EntryHeader};

/// Spare output capacity reserved per inflate step.
const INFLATE_STEP: usize = 64 * 1024;

pub struct ContentDecoder {
    name: String,
    inflate: Option<Decompress>,
    crc: Crc,
    consumed: u64,
    produced: u64,
    finished: bool,
    expected_compressed: u64,
    expected_size: u64,
    expected_crc: u32,
}

impl ContentDecoder {
    pub fn new(header: &EntryHeader) -> MergeResult<Self> {
        let inflate = match header.method {
            CompressionMethod::Stored => None,
            CompressionMethod::Deflate => Some(Decompress::new(false)),
            CompressionMethod::Unknown(m) => {
                return Err(MergeError::Unsupported(format!(
                    "compression method {m} in {}",
                    header.name
                )));
            }
        };
        Ok(Self {
            name: header.name.clone(),
            inflate,
            crc: Crc::new(),
            consumed: 0,
            produced: 0,
            finished: false,
            expected_compressed: header.compressed_size,
            expected_size: header.uncompressed_size,
            expected_crc: header.crc32,
        })
    }

    /// Feed the next piece of compressed payload, returning what it decodes to.
    pub fn push(&mut self, input: &[u8]) -> MergeResult<Bytes> {
        self.consumed += input.len() as u64;
        let Some(inflate) = self.inflate.as_mut() else {
            self.crc.update(input);
            self.produced += input.len() as u64;
            return Ok(Bytes::copy_from_slice(input));
        };

        let mut out = Vec::with_capacity(input.len().saturating_mul(2).min(INFLATE_STEP));
        let mut offset = 0;
        while !self.finished {
            out.reserve(INFLATE_STEP);
            let in_before = inflate.total_in();
            let out_before = inflate.total_out();
            let status = inflate
                .decompress_vec(&input[offset..], &mut out, FlushDecompress::None)
                .map_err(|e| content_mismatch(&self.name, format!("corrupt deflate stream: {e}")))?;
            offset += (inflate.total_in() - in_before) as usize;
            let progressed = inflate.total_in() != in_before || inflate.total_out() != out_before;

            if status == Status::StreamEnd {
                self.finished = true;
            } else if !progressed || (offset == input.len() && out.len() < out.capacity()) {
                // Input used up and no output is pending.
                break;
            }
        }

        self.crc.update(&out);
        self.produced += out.len() as u64;
        Ok(Bytes::from(out))
    }

    /// Check totals once all payload has been pushed. Returns the decoded size.
    pub fn finish(self) -> MergeResult<u64> {
        if self.inflate.is_some() && !self.finished {
            return Err(self.mismatch("deflate stream is truncated".into()));
        }
        if self.consumed != self.expected_compressed {
            return Err(self.mismatch(format!(
                "compressed size is {} bytes, header says {}",
                self.consumed, self.expected_compressed
            )));
        }
        if self.produced != self.expected_size {
            return Err(self.mismatch(format!(
                "uncompressed size is {} bytes, header says {}",
                self.produced, self.expected_size
            )));
        }
        if self.crc.sum() != self.expected_crc {
            return Err(self.mismatch(format!(
                "CRC-32 is {:08x}, header says {:08x}",
                self.crc.sum(),
                self.expected_crc
            )));
        }
        Ok(self.produced)
    }

    fn mismatch(&self, reason: String) -> MergeError {
        content_mismatch(&self.name, reason)
    }
}

fn content_mismatch(name: &str, reason: String) -> MergeError {
    MergeError::ContentMismatch {
        path: name.to_string(),
        reason,
    }
}

/// CRC-32 of a complete buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::DosDateTime;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    fn header(method: CompressionMethod, compressed: &[u8], plain: &[u8]) -> EntryHeader {
        EntryHeader {
            name: "f.txt".into(),
            method,
            compressed_size: compressed.len() as u64,
            uncompressed_size: plain.len() as u64,
            crc32: crc32(plain),
            is_directory: false,
            modified: DosDateTime::default(),
            unix_mode: None,
            dos_attributes: 0,
            comment: String::new(),
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn inflates_across_arbitrary_piece_boundaries() {
        let plain: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();
        let packed = deflate(&plain);
        let mut decoder =
            ContentDecoder::new(&header(CompressionMethod::Deflate, &packed, &plain)).unwrap();

        let mut out = Vec::new();
        for piece in packed.chunks(7) {
            out.extend_from_slice(&decoder.push(piece).unwrap());
        }
        assert_eq!(decoder.finish().unwrap(), plain.len() as u64);
        assert_eq!(out, plain);
    }

    #[test]
    fn stored_passes_through() {
        let plain = b"stored bytes";
        let mut decoder =
            ContentDecoder::new(&header(CompressionMethod::Stored, plain, plain)).unwrap();
        assert_eq!(&decoder.push(&plain[..6]).unwrap()[..], b"stored");
        decoder.push(&plain[6..]).unwrap();
        assert_eq!(decoder.finish().unwrap(), 12);
    }

    #[test]
    fn detects_size_and_crc_mismatch() {
        let plain = b"abc";
        let mut wrong = header(CompressionMethod::Stored, plain, plain);
        wrong.crc32 ^= 1;
        let mut decoder = ContentDecoder::new(&wrong).unwrap();
        decoder.push(plain).unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(MergeError::ContentMismatch { .. })
        ));

        let packed = deflate(plain);
        let mut decoder =
            ContentDecoder::new(&header(CompressionMethod::Deflate, &packed, plain)).unwrap();
        decoder.push(&packed[..1]).unwrap();
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn empty_deflate_stream() {
        let packed = deflate(b"");
        let mut decoder =
            ContentDecoder::new(&header(CompressionMethod::Deflate, &packed, b"")).unwrap();
        assert!(decoder.push(&packed).unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap(), 0);
    }

    #[test]
    fn unknown_methods_are_unsupported() {
        let h = header(CompressionMethod::Unknown(14), b"", b"");
        assert!(matches!(
            ContentDecoder::new(&h),
            Err(MergeError::Unsupported(_))
        ));
    }
}
