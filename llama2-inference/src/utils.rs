use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::sync::Arc;

/// Sequential cursor over a memory-mapped checkpoint file.
///
/// The core only ever needs a seekable, read-once byte source: the header is
/// consumed first, then the weight region in one pass.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .context("Failed to create memory mapping")?
        };
        Ok(Self { mmap, offset: 0 })
    }

    /// Total length of the underlying file in bytes.
    pub fn total_len(&self) -> usize {
        self.mmap.len()
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        if self.offset + count > self.mmap.len() {
            anyhow::bail!(
                "Insufficient data: need {} bytes, have {} remaining",
                count,
                self.mmap.len() - self.offset
            );
        }

        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    /// Consumes `count` little-endian f32 values into an owned shared buffer,
    /// converting to host byte order element by element. On little-endian
    /// hosts the conversion compiles down to a plain copy.
    pub fn get_f32_buffer(&mut self, count: usize) -> Result<Arc<[f32]>> {
        let bytes = self.get_bytes(count * std::mem::size_of::<f32>())?;

        let buffer: Arc<[f32]> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(buffer)
    }

    /// Number of unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.mmap.len() - self.offset
    }
}
