// On-disk piece store backed by a memory-mapped scratch file and a bitvec presence map.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use bitvec::prelude::*;
use memmap2::MmapMut;
use parking_lot::RwLock;

pub struct PieceStore {
    mmap: RwLock<MmapMut>,
    bitfield: RwLock<BitVec>,
    piece_length: u64,
    length: u64,
    num_pieces: usize,
    path: PathBuf,
    present_bytes: AtomicU64,
}

impl PieceStore {
    /// Create a store for `length` bytes split into `piece_length` pieces.
    ///
    /// The scratch file at `path` is truncated to `length` and memory-mapped.
    /// Every piece starts out missing.
    pub fn new(path: &Path, length: u64, piece_length: u64) -> Result<Self> {
        if length == 0 {
            return Err(anyhow!("length must be > 0"));
        }
        if piece_length == 0 {
            return Err(anyhow!("piece_length must be > 0"));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_len(length)?;

        // SAFETY: we just created the file and own it exclusively.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let num_pieces = length.div_ceil(piece_length) as usize;

        Ok(Self {
            mmap: RwLock::new(mmap),
            bitfield: RwLock::new(bitvec![0; num_pieces]),
            piece_length,
            length,
            num_pieces,
            path: path.to_path_buf(),
            present_bytes: AtomicU64::new(0),
        })
    }

    /// Write a piece and mark it present. Writing a present piece again is a no-op.
    pub fn put_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        if index >= self.num_pieces {
            return Err(anyhow!(
                "piece {} out of range (total {})",
                index,
                self.num_pieces
            ));
        }

        let expected_len = self.piece_len(index);
        if data.len() != expected_len {
            return Err(anyhow!(
                "piece {} has {} bytes, expected {}",
                index,
                data.len(),
                expected_len
            ));
        }

        if self.has_piece(index) {
            return Ok(());
        }

        let offset = (index as u64 * self.piece_length) as usize;
        {
            let mut mmap = self.mmap.write();
            mmap[offset..offset + data.len()].copy_from_slice(data);
        }

        let mut bitfield = self.bitfield.write();
        if !bitfield[index] {
            bitfield.set(index, true);
            self.present_bytes
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Read a whole piece. `None` if it is not present.
    pub fn read_piece(&self, index: usize) -> Option<Vec<u8>> {
        if !self.has_piece(index) {
            return None;
        }
        let offset = (index as u64 * self.piece_length) as usize;
        let len = self.piece_len(index);
        let mmap = self.mmap.read();
        Some(mmap[offset..offset + len].to_vec())
    }

    /// Read `[start, end)` of the content. `None` if any overlapping piece is missing.
    pub fn read_range(&self, start: u64, end: u64) -> Option<Vec<u8>> {
        if start >= end || end > self.length || !self.has_range(start, end) {
            return None;
        }
        let mmap = self.mmap.read();
        Some(mmap[start as usize..end as usize].to_vec())
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bitfield.read()[index]
    }

    /// Whether every piece overlapping `[start, end)` is present.
    pub fn has_range(&self, start: u64, end: u64) -> bool {
        let (first, last) = match self.pieces_for_range(start, end) {
            Some(span) => span,
            None => return true,
        };
        let bitfield = self.bitfield.read();
        bitfield[first..=last].all()
    }

    /// Inclusive piece span covering `[start, end)`, `None` for an empty range.
    pub fn pieces_for_range(&self, start: u64, end: u64) -> Option<(usize, usize)> {
        let end = end.min(self.length);
        if start >= end {
            return None;
        }
        let first = (start / self.piece_length) as usize;
        let last = ((end - 1) / self.piece_length) as usize;
        Some((first, last))
    }

    /// Byte length of the given piece. The last piece may be shorter than `piece_length`.
    pub fn piece_len(&self, index: usize) -> usize {
        if index + 1 < self.num_pieces {
            self.piece_length as usize
        } else {
            let remainder = (self.length % self.piece_length) as usize;
            if remainder == 0 {
                self.piece_length as usize
            } else {
                remainder
            }
        }
    }

    pub fn bitfield(&self) -> BitVec {
        self.bitfield.read().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.read().all()
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn present_bytes(&self) -> u64 {
        self.present_bytes.load(Ordering::Relaxed)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PieceStore {
    fn drop(&mut self) {
        // Best-effort deletion of the scratch file.
        let _ = fs::remove_file(&self.path);
    }
}
