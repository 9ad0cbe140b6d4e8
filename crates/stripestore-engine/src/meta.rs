//! Metadata area
//!
//! A flat array of fixed-size slots tiled into `meta_block_size` blocks; the
//! slot for data block `b` lives at block `1 + b / slots_per_block`, slot
//! `b % slots_per_block` (block 0 is reserved). Each slot holds the oid,
//! version and the two sparse bitmaps: the committed one and the dirty
//! overlay the flusher is in the middle of merging.
//!
//! Offsets in this module are relative to the metadata region.

use bytes::{Buf, BufMut};
use crate::types::Oid;

/// Decoded live slot.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaSlot {
    pub oid: Oid,
    pub version: u64,
    pub bitmap: Vec<u8>,
    pub overlay: Vec<u8>,
}

pub(crate) struct MetaStore {
    pub block_size: u64,
    pub len: u64,
    pub slots_per_block: u64,
    pub entry_size: u64,
    pub bitmap_bytes: usize,
    pub inmemory: bool,
    /// Whole-area mirror when `inmemory`
    pub buffer: Vec<u8>,
}

impl MetaStore {
    pub fn new(
        block_size: u64,
        len: u64,
        slots_per_block: u64,
        bitmap_bytes: usize,
        inmemory: bool,
    ) -> Self {
        Self {
            block_size,
            len,
            slots_per_block,
            entry_size: 24 + 2 * bitmap_bytes as u64,
            bitmap_bytes,
            inmemory,
            buffer: if inmemory { vec![0u8; len as usize] } else { Vec::new() },
        }
    }

    /// Region offset of the metadata block covering data block `b`.
    pub fn block_offset(&self, b: u64) -> u64 {
        (1 + b / self.slots_per_block) * self.block_size
    }

    /// Offset of data block `b`'s slot within its metadata block.
    pub fn slot_offset_in_block(&self, b: u64) -> u64 {
        (b % self.slots_per_block) * self.entry_size
    }

    pub fn encode_slot(&self, slot: Option<&MetaSlot>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entry_size as usize);
        match slot {
            Some(s) => {
                debug_assert_eq!(s.bitmap.len(), self.bitmap_bytes);
                buf.put_u64_le(s.oid.inode);
                buf.put_u64_le(s.oid.stripe);
                buf.put_u64_le(s.version);
                buf.put_slice(&s.bitmap);
                if s.overlay.len() == self.bitmap_bytes {
                    buf.put_slice(&s.overlay);
                } else {
                    buf.resize(self.entry_size as usize, 0);
                }
            }
            None => buf.resize(self.entry_size as usize, 0),
        }
        buf
    }

    /// Decode one slot; `None` when the slot is unoccupied (version 0).
    pub fn decode_slot(&self, mut raw: &[u8]) -> Option<MetaSlot> {
        debug_assert!(raw.len() >= self.entry_size as usize);
        let inode = raw.get_u64_le();
        let stripe = raw.get_u64_le();
        let version = raw.get_u64_le();
        if version == 0 {
            return None;
        }
        let bitmap = raw[..self.bitmap_bytes].to_vec();
        let overlay = raw[self.bitmap_bytes..2 * self.bitmap_bytes].to_vec();
        Some(MetaSlot {
            oid: Oid::new(inode, stripe),
            version,
            bitmap,
            overlay,
        })
    }

    /// Patch the in-memory mirror for data block `b`.
    pub fn patch(&mut self, b: u64, slot: Option<&MetaSlot>) {
        debug_assert!(self.inmemory);
        let at = (self.block_offset(b) + self.slot_offset_in_block(b)) as usize;
        let bytes = self.encode_slot(slot);
        self.buffer[at..at + bytes.len()].copy_from_slice(&bytes);
    }

    /// Apply a slot update to an externally read metadata block.
    pub fn patch_block_buf(&self, block_buf: &mut [u8], b: u64, slot: Option<&MetaSlot>) {
        let at = self.slot_offset_in_block(b) as usize;
        let bytes = self.encode_slot(slot);
        block_buf[at..at + bytes.len()].copy_from_slice(&bytes);
    }

    /// Bytes of the metadata block covering data block `b` (in-memory mode).
    pub fn block_bytes(&self, b: u64) -> bytes::Bytes {
        debug_assert!(self.inmemory);
        let at = self.block_offset(b) as usize;
        bytes::Bytes::copy_from_slice(&self.buffer[at..at + self.block_size as usize])
    }

    /// Walk all slots in a contiguous chunk of the metadata area.
    /// `chunk_offset` is the region offset the chunk was read from; the
    /// callback receives the data block number and its decoded slot.
    pub fn scan_chunk(&self, chunk_offset: u64, chunk: &[u8], mut f: impl FnMut(u64, MetaSlot)) {
        let first_block = chunk_offset / self.block_size;
        let nblocks = chunk.len() as u64 / self.block_size;
        for mb in 0..nblocks {
            let meta_block = first_block + mb;
            if meta_block == 0 {
                continue; // reserved
            }
            let base = (mb * self.block_size) as usize;
            for si in 0..self.slots_per_block {
                let at = base + (si * self.entry_size) as usize;
                if at + self.entry_size as usize > chunk.len() {
                    break;
                }
                if let Some(slot) = self.decode_slot(&chunk[at..at + self.entry_size as usize]) {
                    let data_block = (meta_block - 1) * self.slots_per_block + si;
                    f(data_block, slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetaStore {
        // 4K meta blocks, 1-byte bitmaps -> 26-byte slots, 157 per block
        MetaStore::new(4096, 16 * 4096, 157, 1, true)
    }

    #[test]
    fn slot_roundtrip() {
        let m = store();
        let slot = MetaSlot {
            oid: Oid::new(42, 8),
            version: 17,
            bitmap: vec![0b0000_0001],
            overlay: vec![0],
        };
        let raw = m.encode_slot(Some(&slot));
        assert_eq!(raw.len(), 26);
        assert_eq!(m.decode_slot(&raw), Some(slot));
        assert_eq!(m.decode_slot(&m.encode_slot(None)), None);
    }

    #[test]
    fn slot_addressing() {
        let m = store();
        assert_eq!(m.block_offset(0), 4096);
        assert_eq!(m.block_offset(156), 4096);
        assert_eq!(m.block_offset(157), 8192);
        assert_eq!(m.slot_offset_in_block(157), 0);
        assert_eq!(m.slot_offset_in_block(158), 26);
    }

    #[test]
    fn patch_and_scan() {
        let mut m = store();
        let slot = MetaSlot {
            oid: Oid::new(1, 0),
            version: 3,
            bitmap: vec![0xFF],
            overlay: vec![0],
        };
        m.patch(200, Some(&slot));
        let buffer = m.buffer.clone();
        let mut found = Vec::new();
        m.scan_chunk(0, &buffer, |b, s| found.push((b, s)));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 200);
        assert_eq!(found[0].1.version, 3);

        m.patch(200, None);
        let buffer = m.buffer.clone();
        let mut found = 0;
        m.scan_chunk(0, &buffer, |_, _| found += 1);
        assert_eq!(found, 0);
    }
}
