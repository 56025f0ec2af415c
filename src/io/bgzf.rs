//! BGZF block decompression with block-boundary tracking.
//!
//! A BGZF stream is a concatenation of independent gzip members, each carrying
//! a `BC` extra subfield with its own compressed size. Because every block can
//! be inflated on its own, a byte range fetched from the middle of a file can
//! be decoded without the bytes before it, provided it starts on a block
//! boundary.
//!
//! # Block Structure
//!
//! ```text
//! - Bytes 0-1:   Gzip magic (31, 139)
//! - Byte  2:     CM = 8 (deflate)
//! - Byte  3:     FLG, FEXTRA (0x04) must be set
//! - Bytes 4-9:   MTIME, XFL, OS
//! - Bytes 10-11: XLEN (extra field length)
//! - Extra field: subfields, including SI1='B', SI2='C', SLEN=2, BSIZE
//! - Deflate payload
//! - CRC32 (4 bytes), ISIZE (4 bytes)
//! ```
//!
//! `BSIZE` is the total block size minus one, so no block exceeds
//! [`MAX_BLOCK_SIZE`] bytes compressed or uncompressed.
//!
//! # Virtual Offsets
//!
//! The index addresses records as `(compressed block start, offset inside the
//! inflated block)`. [`InflatedRange`] remembers where every block started in
//! the file and where its bytes landed in the output buffer, so a virtual
//! offset can be turned into a buffer position.

use crate::error::{BamError, Result};
use crate::io::bam::index::VirtualOffset;
use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::io::Read;

/// Largest possible BGZF block (compressed or uncompressed), in bytes.
pub const MAX_BLOCK_SIZE: u64 = 1 << 16;

/// Gzip magic plus fixed header fields up to and including XLEN.
const GZIP_FIXED_HEADER: usize = 12;

/// CRC32 + ISIZE.
const GZIP_FOOTER: usize = 8;

/// Placement of one compressed block and its inflated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// File offset of the first byte of the compressed block
    pub compressed_offset: u64,
    /// Size of the compressed block in bytes
    pub compressed_size: usize,
    /// Position of the block's first inflated byte in the output buffer
    pub data_offset: usize,
    /// Number of inflated bytes produced by the block
    pub data_len: usize,
}

/// Inflated bytes of consecutive BGZF blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InflatedRange {
    data: Vec<u8>,
    blocks: Vec<BlockSpan>,
}

impl InflatedRange {
    /// Concatenated inflated bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Blocks in file order.
    pub fn blocks(&self) -> &[BlockSpan] {
        &self.blocks
    }

    /// Consume the range, keeping only the inflated bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Position in [`data`](Self::data) addressed by a virtual offset.
    ///
    /// Returns `None` when the offset names a block that was not inflated or
    /// points past the end of its block.
    pub fn position(&self, offset: VirtualOffset) -> Option<usize> {
        let idx = self
            .blocks
            .binary_search_by_key(&offset.compressed_offset(), |b| b.compressed_offset)
            .ok()?;
        let block = &self.blocks[idx];
        let within = offset.uncompressed_offset() as usize;
        (within <= block.data_len).then_some(block.data_offset + within)
    }
}

/// Size of the BGZF block starting at `data[pos]`.
///
/// `base_offset` is the file offset of `data[0]`, used only for messages.
fn block_size_at(data: &[u8], pos: usize, base_offset: u64) -> Result<usize> {
    let file_pos = base_offset + pos as u64;
    let remaining = data.len() - pos;

    if remaining < GZIP_FIXED_HEADER {
        return Err(BamError::format(
            "BGZF block",
            format!(
                "truncated header at offset {} (only {} bytes remaining)",
                file_pos, remaining
            ),
        ));
    }

    let header = &data[pos..];
    if header[0] != 31 || header[1] != 139 {
        return Err(BamError::format(
            "BGZF block",
            format!(
                "invalid gzip magic bytes at offset {}: expected [31, 139], got [{}, {}]",
                file_pos, header[0], header[1]
            ),
        ));
    }
    if header[2] != 8 {
        return Err(BamError::format(
            "BGZF block",
            format!("unsupported compression method {} at offset {}", header[2], file_pos),
        ));
    }
    if header[3] & 0x04 == 0 {
        return Err(BamError::format(
            "BGZF block",
            format!("gzip member at offset {} has no extra field (not BGZF)", file_pos),
        ));
    }

    let xlen = u16::from_le_bytes([header[10], header[11]]) as usize;
    let extra_end = GZIP_FIXED_HEADER + xlen;
    if extra_end > remaining {
        return Err(BamError::format(
            "BGZF block",
            format!("extra field extends beyond data at offset {}", file_pos),
        ));
    }

    let mut extra_pos = GZIP_FIXED_HEADER;
    while extra_pos + 4 <= extra_end {
        let si1 = header[extra_pos];
        let si2 = header[extra_pos + 1];
        let slen = u16::from_le_bytes([header[extra_pos + 2], header[extra_pos + 3]]) as usize;

        if si1 == b'B' && si2 == b'C' && slen == 2 {
            if extra_pos + 6 > extra_end {
                return Err(BamError::format(
                    "BGZF block",
                    format!("BSIZE field incomplete at offset {}", file_pos),
                ));
            }
            let bsize = u16::from_le_bytes([header[extra_pos + 4], header[extra_pos + 5]]);
            let block_size = bsize as usize + 1;

            if block_size < extra_end + GZIP_FOOTER {
                return Err(BamError::format(
                    "BGZF block",
                    format!("block size {} at offset {} is too small", block_size, file_pos),
                ));
            }
            if block_size > remaining {
                return Err(BamError::format(
                    "BGZF block",
                    format!(
                        "block at offset {} is truncated: size {} exceeds remaining data ({} bytes)",
                        file_pos, block_size, remaining
                    ),
                ));
            }
            return Ok(block_size);
        }

        extra_pos += 4 + slen;
    }

    Err(BamError::format(
        "BGZF block",
        format!("no BSIZE subfield in block at offset {}", file_pos),
    ))
}

/// Inflate one complete block.
fn inflate_block(block: &[u8], compressed_offset: u64) -> Result<Vec<u8>> {
    let isize_bytes = &block[block.len() - 4..];
    let expected =
        u32::from_le_bytes([isize_bytes[0], isize_bytes[1], isize_bytes[2], isize_bytes[3]]);
    if u64::from(expected) > MAX_BLOCK_SIZE {
        return Err(BamError::format(
            "BGZF block",
            format!(
                "block at offset {} declares {} inflated bytes (max {})",
                compressed_offset, expected, MAX_BLOCK_SIZE
            ),
        ));
    }

    let mut decoder = GzDecoder::new(block);
    let mut inflated = Vec::with_capacity(expected as usize);
    decoder.read_to_end(&mut inflated).map_err(|e| {
        BamError::format(
            "BGZF block",
            format!("failed to inflate block at offset {}: {}", compressed_offset, e),
        )
    })?;

    Ok(inflated)
}

/// Inflate every block in `data`.
///
/// `data` must start on a block boundary and contain only whole blocks;
/// a block cut short by the end of `data` is an error.
pub fn inflate_blocks(data: &[u8], base_offset: u64) -> Result<InflatedRange> {
    inflate_through(data, base_offset, u64::MAX)
}

/// Inflate the blocks of `data` that start at or before file offset `last_block`.
///
/// Bytes after the block starting at `last_block` are ignored, so a fetch
/// window may over-read into a following block without error. Every block
/// that is needed must be whole: truncation inside one is an error, never a
/// silently shortened result.
///
/// Blocks are inflated in parallel.
pub fn inflate_through(data: &[u8], base_offset: u64, last_block: u64) -> Result<InflatedRange> {
    let mut bounds = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let compressed_offset = base_offset + pos as u64;
        if compressed_offset > last_block {
            break;
        }
        let size = block_size_at(data, pos, base_offset)?;
        bounds.push((compressed_offset, pos, size));
        pos += size;
    }

    let inflated: Vec<Vec<u8>> = bounds
        .par_iter()
        .map(|&(offset, start, size)| inflate_block(&data[start..start + size], offset))
        .collect::<Result<Vec<_>>>()?;

    let total = inflated.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut blocks = Vec::with_capacity(bounds.len());

    for (&(compressed_offset, _, compressed_size), bytes) in bounds.iter().zip(&inflated) {
        blocks.push(BlockSpan {
            compressed_offset,
            compressed_size,
            data_offset: out.len(),
            data_len: bytes.len(),
        });
        out.extend_from_slice(bytes);
    }

    Ok(InflatedRange { data: out, blocks })
}

/// Sequential iterator over the blocks of a BGZF byte range.
///
/// Yields each block's placement and inflated bytes. Callers that only need a
/// prefix of the stream (e.g. the BAM header) stop pulling once satisfied, so
/// an over-read tail is never inflated.
pub struct Blocks<'a> {
    data: &'a [u8],
    pos: usize,
    base_offset: u64,
}

impl<'a> Blocks<'a> {
    /// Iterate blocks of `data`, whose first byte sits at file offset `base_offset`.
    pub fn new(data: &'a [u8], base_offset: u64) -> Self {
        Self {
            data,
            pos: 0,
            base_offset,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }

        let compressed_offset = self.base_offset + self.pos as u64;
        let result = block_size_at(self.data, self.pos, self.base_offset).and_then(|size| {
            let block = &self.data[self.pos..self.pos + size];
            self.pos += size;
            inflate_block(block, compressed_offset)
        });

        match result {
            Ok(bytes) => Some(Ok((compressed_offset, bytes))),
            Err(e) => {
                // Stop after the first failure
                self.pos = self.data.len();
                Some(Err(e))
            }
        }
    }
}
