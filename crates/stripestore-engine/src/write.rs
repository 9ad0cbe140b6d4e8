//! Write and delete path
//!
//! Admission assigns the version and publishes an `InFlight` dirty entry so
//! concurrent reads order correctly. Dequeue runs the small/big decision:
//! small writes go into the journal (payload inline or in following journal
//! blocks), big writes take a freshly allocated data block and record their
//! journal entry at sync time (or immediately under `immediate_commit=all`).

use crate::config::ImmediateCommit;
use crate::engine::{data_block_offset, Blockstore, WaitKind};
use crate::journal::{JournalAlloc, JournalEntry};
use crate::op::{Op, OpCode};
use crate::ring::{IoDev, Sqe, SqeOp, Tag};
use crate::types::{bitmap_cover, DirtyEntry, DirtyPhase, ObjVer};
use tracing::trace;

impl Blockstore {
    /// Admission half: assign the next version and make the write visible
    /// in the dirty index.
    pub(crate) fn enqueue_write(&mut self, op: &mut Op) {
        let oid = op.oid;
        let latest_dirty = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .next_back()
            .map(|(k, _)| k.version);
        op.version = match latest_dirty {
            Some(v) => v + 1,
            None => self.clean.get(&oid).map(|c| c.version).unwrap_or(0) + 1,
        };
        self.dirty.insert(
            ObjVer::new(oid, op.version),
            DirtyEntry {
                phase: DirtyPhase::InFlight,
                big: false,
                delete: op.opcode == OpCode::Delete,
                location: 0,
                offset: op.offset,
                len: op.len,
            },
        );
        trace!(?oid, version = op.version, len = op.len, "write admitted");
    }

    /// Submit half. Returns true when the op left the submit queue.
    pub(crate) fn dequeue_write(&mut self, id: u64) -> bool {
        let (oid, version, opcode, offset, len) = {
            let slot = &self.ops[&id];
            (
                slot.op.oid,
                slot.op.version,
                slot.op.opcode,
                slot.op.offset,
                slot.op.len,
            )
        };
        // an earlier version still unsubmitted must go first
        if let Some((prev, e)) = self
            .dirty
            .range(ObjVer::new(oid, 0)..ObjVer::new(oid, version))
            .next_back()
        {
            if e.phase == DirtyPhase::InFlight {
                self.set_wait(id, WaitKind::InFlight(prev.version));
                return false;
            }
        }

        let is_big = opcode == OpCode::Write && len == self.cfg.block_size;
        if is_big {
            self.dequeue_big_write(id, oid, version)
        } else {
            self.dequeue_small_write(id, oid, version, opcode, offset, len)
        }
    }

    fn dequeue_small_write(
        &mut self,
        id: u64,
        oid: crate::types::Oid,
        version: u64,
        opcode: OpCode,
        offset: u32,
        len: u32,
    ) -> bool {
        let ver = ObjVer::new(oid, version);
        let is_delete = opcode == OpCode::Delete;
        let entry_size = if is_delete {
            JournalEntry::Delete { oid, version }.encoded_size()
        } else {
            // size is independent of the payload contents
            JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_loc: 0,
                data_crc: 0,
            }
            .encoded_size()
        };
        let payload_len = if is_delete { 0 } else { len as usize };

        // sector write + possible payload write + possible close write
        if self.ring.space_left() < 3 {
            self.set_wait(id, WaitKind::Sqe(3));
            return false;
        }
        let loc = match self.journal.reserve_write(entry_size, payload_len) {
            JournalAlloc::Ok(loc) => loc,
            JournalAlloc::NeedBuffer => {
                self.set_wait(
                    id,
                    WaitKind::JournalBuffer {
                        entry: entry_size,
                        payload: payload_len,
                    },
                );
                return false;
            }
            JournalAlloc::NeedSpace => {
                self.set_wait(
                    id,
                    WaitKind::Journal {
                        entry: entry_size,
                        payload: payload_len,
                    },
                );
                return false;
            }
        };

        let mut pending = 1u32;
        if is_delete {
            self.journal
                .append_entry(&JournalEntry::Delete { oid, version }, Some(ver));
        } else {
            let data = std::mem::take(&mut self.ops.get_mut(&id).unwrap().op.buf);
            let entry = JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_loc: loc.data_loc,
                data_crc: crc32c::crc32c(&data),
            };
            self.journal.append_entry(&entry, Some(ver));
            if let Some((pay_off, bytes)) = self.journal.append_payload(&loc, &data, ver) {
                self.ring.push(Sqe {
                    tag: Tag::Op { id, sub: 1 },
                    op: SqeOp::Write {
                        dev: IoDev::Journal,
                        offset: self.cfg.journal_offset + pay_off,
                        data: bytes,
                    },
                });
                pending += 1;
            }
            // hand the buffer back for the callback
            self.ops.get_mut(&id).unwrap().op.buf = data;
        }

        self.journal.pin(loc.sector);
        self.submit_sector_write(loc.sector, Tag::Op { id, sub: 0 });
        if let Some(closed) = loc.closed_sector {
            self.submit_sector_close(closed);
        }

        {
            let slot = self.ops.get_mut(&id).unwrap();
            slot.prv.pinned.push(loc.sector);
            slot.prv.pending = pending;
        }
        if let Some(e) = self.dirty.get_mut(&ver) {
            e.phase = DirtyPhase::Submitted;
            e.location = loc.data_loc;
        }
        trace!(?ver, data_loc = loc.data_loc, "small write submitted");
        true
    }

    fn dequeue_big_write(&mut self, id: u64, oid: crate::types::Oid, version: u64) -> bool {
        let ver = ObjVer::new(oid, version);
        let immediate = self.cfg.immediate_commit == ImmediateCommit::All;
        let sqe_needed = if immediate { 3 } else { 1 };
        if self.ring.space_left() < sqe_needed {
            self.set_wait(id, WaitKind::Sqe(sqe_needed));
            return false;
        }

        let Some(block) = self.alloc.alloc() else {
            self.set_wait(id, WaitKind::Free);
            return false;
        };

        let mut pending = 1u32;
        if immediate {
            let mut bitmap = vec![0u8; self.cfg.clean_bitmap_bytes() as usize];
            bitmap_cover(
                &mut bitmap,
                self.cfg.bitmap_granularity,
                0,
                self.cfg.block_size,
            );
            let entry = JournalEntry::BigWrite {
                oid,
                version,
                offset: 0,
                len: self.cfg.block_size,
                block,
                bitmap,
            };
            let loc = match self.journal.reserve_write(entry.encoded_size(), 0) {
                JournalAlloc::Ok(loc) => loc,
                JournalAlloc::NeedBuffer => {
                    self.alloc.free_block(block);
                    self.set_wait(
                        id,
                        WaitKind::JournalBuffer {
                            entry: entry.encoded_size(),
                            payload: 0,
                        },
                    );
                    return false;
                }
                JournalAlloc::NeedSpace => {
                    self.alloc.free_block(block);
                    self.set_wait(
                        id,
                        WaitKind::Journal {
                            entry: entry.encoded_size(),
                            payload: 0,
                        },
                    );
                    return false;
                }
            };
            self.journal.append_entry(&entry, Some(ver));
            self.journal.pin(loc.sector);
            self.submit_sector_write(loc.sector, Tag::Op { id, sub: 1 });
            if let Some(closed) = loc.closed_sector {
                self.submit_sector_close(closed);
            }
            self.ops.get_mut(&id).unwrap().prv.pinned.push(loc.sector);
            pending += 1;
        }

        let data = bytes::Bytes::copy_from_slice(&self.ops[&id].op.buf);
        self.ring.push(Sqe {
            tag: Tag::Op { id, sub: 0 },
            op: SqeOp::Write {
                dev: IoDev::Data,
                offset: data_block_offset(&self.cfg, block),
                data,
            },
        });

        self.ops.get_mut(&id).unwrap().prv.pending = pending;
        if let Some(e) = self.dirty.get_mut(&ver) {
            e.phase = DirtyPhase::Submitted;
            e.big = true;
            e.location = block;
        }
        trace!(?ver, block, "big write submitted");
        true
    }

    /// Completion of any of a write op's device writes.
    pub(crate) fn write_complete(&mut self, id: u64) {
        let Some(slot) = self.ops.get_mut(&id) else {
            return;
        };
        slot.prv.pending -= 1;
        if slot.prv.pending > 0 {
            return;
        }
        let oid = slot.op.oid;
        let version = slot.op.version;
        let len = slot.op.len;
        let is_delete = slot.op.opcode == OpCode::Delete;
        let ver = ObjVer::new(oid, version);

        // the entry can be gone if a rollback raced the completion
        let state = self.dirty.get_mut(&ver).map(|e| {
            e.phase = DirtyPhase::Written;
            let covered = match self.cfg.immediate_commit {
                ImmediateCommit::All => true,
                ImmediateCommit::Small => !e.big,
                ImmediateCommit::None => false,
            };
            if covered {
                e.phase = DirtyPhase::Synced;
            }
            (e.big, covered)
        });
        match state {
            Some((_, true)) => self.flusher.request(oid, version),
            Some((true, false)) => self.unsynced_big.push(ver),
            Some((false, false)) => self.unsynced_small.push(ver),
            None => {}
        }

        let slot = self.ops.get_mut(&id).unwrap();
        slot.op.retval = if is_delete { 0 } else { i64::from(len) };
        self.retire_op(id);
    }

    pub(crate) fn set_wait(&mut self, id: u64, wait: WaitKind) {
        if let Some(slot) = self.ops.get_mut(&id) {
            slot.prv.wait = Some(wait);
        }
    }
}
