use crate::fs::{FsError, Result};
use fileblock::{BlockOffset, Geometry};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Free,
    Used,
}

/// One bit per data block. A set bit marks the block as free, so a freshly
/// formatted volume is all ones. Bits past `len` in the last word stay clear
/// and are never handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        let mut words = vec![u64::MAX; (len + 63) / 64];
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1_u64 << tail) - 1;
            }
        }
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the word vector covers exactly `len` bits.
    fn is_consistent(&self) -> bool {
        self.words.len() == (self.len + 63) / 64
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        let mask = 1_u64 << (blocknr % 64);
        if self.words[blocknr / 64] & mask == 0 {
            State::Used
        } else {
            State::Free
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        self.words[blocknr / 64] &= !(1_u64 << (blocknr % 64));
    }

    pub fn set_free(&mut self, blocknr: usize) {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        self.words[blocknr / 64] |= 1_u64 << (blocknr % 64);
    }

    /// Lowest free block index, scanning from block 0.
    pub fn first_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(i, word)| i * 64 + word.trailing_zeros() as usize)
    }

    pub fn free_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of every block currently marked used, ascending.
    pub fn used(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i) == State::Used)
    }
}

/// First-fit allocator over the data region. Hands out and takes back container
/// byte offsets, converting to bitmap indices through the volume geometry.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    bitmap: Bitmap,
    geometry: Geometry,
}

impl BlockAllocator {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            bitmap: Bitmap::new(geometry.block_count()),
            geometry,
        }
    }

    /// Wraps a bitmap restored from a header image.
    pub fn from_bitmap(bitmap: Bitmap, geometry: Geometry) -> Result<Self> {
        if !bitmap.is_consistent() || bitmap.len() != geometry.block_count() {
            return Err(FsError::InvalidHeader(format!(
                "bitmap tracks {} blocks, data region has {}",
                bitmap.len(),
                geometry.block_count()
            )));
        }
        Ok(Self { bitmap, geometry })
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn allocate(&mut self) -> Result<BlockOffset> {
        let index = self.bitmap.first_free().ok_or(FsError::OutOfSpace)?;
        self.bitmap.set_reserved(index);
        let offset = self.geometry.offset_of(index);
        debug!("allocated block {} at offset {}", index, offset);
        Ok(offset)
    }

    pub fn free(&mut self, offset: BlockOffset) -> Result<()> {
        let index = self.geometry.index_of(offset).ok_or_else(|| {
            FsError::InvalidArgument(format!("offset {} is not a data block", offset))
        })?;
        if self.bitmap.get(index) == State::Free {
            warn!("block {} at offset {} released twice", index, offset);
        }
        self.bitmap.set_free(index);
        debug!("released block {} at offset {}", index, offset);
        Ok(())
    }

    pub fn state(&self, offset: BlockOffset) -> Option<State> {
        self.geometry
            .index_of(offset)
            .map(|index| self.bitmap.get(index))
    }

    pub fn free_count(&self) -> usize {
        self.bitmap.free_count()
    }

    pub fn used_count(&self) -> usize {
        self.bitmap.len() - self.bitmap.free_count()
    }

    pub fn used_offsets(&self) -> Vec<BlockOffset> {
        self.bitmap
            .used()
            .map(|index| self.geometry.offset_of(index))
            .collect()
    }
}
