//! Group sync barrier
//!
//! A sync batches every write admitted before it into one durability
//! barrier: wait for the batch to finish its journal/data writes, fsync the
//! data device, record the deferred `BIG_WRITE` entries, append the batch's
//! `STABLE` list, and fsync the journal once after everything, so a crash
//! right after a successful sync replays the whole batch at `Synced`.
//! Sync ops arriving while a barrier is still waiting on its writes
//! coalesce into it.

use crate::engine::Blockstore;
use crate::journal::{JournalAlloc, JournalEntry, ENTRY_HDR_SIZE, SECTOR_HDR_SIZE};
use crate::ring::{IoDev, Sqe, SqeOp, Tag};
use crate::types::{bitmap_cover, DirtyPhase, ObjVer};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncPhase {
    /// Waiting for every write in the batch to reach `Written`
    WaitWrites,
    DataFsyncSent,
    /// Appending BIG_WRITE and STABLE entries, possibly over several passes
    JournalEntries,
    JournalWritesSent,
    JournalFsyncSent,
}

pub(crate) struct SyncBatch {
    pub id: u64,
    pub ops: Vec<u64>,
    pub small: Vec<ObjVer>,
    pub big: Vec<ObjVer>,
    pub phase: SyncPhase,
    pub pending: u32,
    pub big_done: usize,
    pub stable_done: usize,
    pub pinned: Vec<usize>,
}

impl Blockstore {
    pub(crate) fn dequeue_sync(&mut self, id: u64) -> bool {
        // coalesce into a barrier that has not advanced past its wait step
        if let Some(b) = self
            .syncs
            .iter_mut()
            .find(|b| b.phase == SyncPhase::WaitWrites)
        {
            b.ops.push(id);
            b.small.append(&mut self.unsynced_small);
            b.big.append(&mut self.unsynced_big);
            trace!(batch = b.id, "sync coalesced into in-progress barrier");
            return true;
        }

        let small = std::mem::take(&mut self.unsynced_small);
        let big = std::mem::take(&mut self.unsynced_big);
        if small.is_empty() && big.is_empty() {
            // nothing new to order, but an earlier barrier that has not
            // completed yet still covers writes admitted before this op
            if let Some(last) = self.syncs.last_mut() {
                last.ops.push(id);
                return true;
            }
            if let Some(slot) = self.ops.get_mut(&id) {
                slot.op.retval = 0;
            }
            self.retire_op(id);
            return true;
        }
        let batch_id = self.next_sync_batch;
        self.next_sync_batch += 1;
        trace!(batch = batch_id, smalls = small.len(), bigs = big.len(), "sync barrier started");
        self.syncs.push(SyncBatch {
            id: batch_id,
            ops: vec![id],
            small,
            big,
            phase: SyncPhase::WaitWrites,
            pending: 0,
            big_done: 0,
            stable_done: 0,
            pinned: Vec::new(),
        });
        true
    }

    pub(crate) fn continue_syncs(&mut self) {
        let mut i = 0;
        while i < self.syncs.len() {
            if !self.continue_sync(i) {
                i += 1;
            }
            // on true the batch was removed; the same index now holds the
            // next one
        }
    }

    /// Advance one barrier; returns true when it completed.
    fn continue_sync(&mut self, i: usize) -> bool {
        loop {
            let phase = self.syncs[i].phase;
            match phase {
                SyncPhase::WaitWrites => {
                    let ready = {
                        let b = &self.syncs[i];
                        b.small.iter().chain(b.big.iter()).all(|v| {
                            self.dirty
                                .get(v)
                                .map(|e| e.phase >= DirtyPhase::Written)
                                .unwrap_or(true)
                        })
                    };
                    if !ready {
                        return false;
                    }
                    let need_data_fsync =
                        !self.syncs[i].big.is_empty() && !self.cfg.disable_data_fsync;
                    if need_data_fsync {
                        let batch = self.syncs[i].id;
                        if self.ring.space_left() == 0 {
                            return false;
                        }
                        self.ring.push(Sqe {
                            tag: Tag::SyncFsync {
                                batch,
                                dev: IoDev::Data,
                            },
                            op: SqeOp::Fsync { dev: IoDev::Data },
                        });
                        self.syncs[i].pending = 1;
                        self.syncs[i].phase = SyncPhase::DataFsyncSent;
                        return false;
                    }
                    self.syncs[i].phase = SyncPhase::JournalEntries;
                }
                SyncPhase::DataFsyncSent => {
                    if self.syncs[i].pending > 0 {
                        return false;
                    }
                    self.syncs[i].phase = SyncPhase::JournalEntries;
                }
                SyncPhase::JournalEntries => {
                    if !self.sync_append_entries(i) {
                        return false; // retried next pass
                    }
                    self.syncs[i].phase = SyncPhase::JournalWritesSent;
                }
                SyncPhase::JournalWritesSent => {
                    if self.syncs[i].pending > 0 {
                        return false;
                    }
                    for s in std::mem::take(&mut self.syncs[i].pinned) {
                        self.journal.unpin(s);
                    }
                    if self.cfg.disable_journal_fsync {
                        self.finish_batch(i);
                        return true;
                    }
                    if self.ring.space_left() == 0 {
                        return false;
                    }
                    let batch = self.syncs[i].id;
                    self.ring.push(Sqe {
                        tag: Tag::SyncFsync {
                            batch,
                            dev: IoDev::Journal,
                        },
                        op: SqeOp::Fsync {
                            dev: IoDev::Journal,
                        },
                    });
                    self.syncs[i].pending = 1;
                    self.syncs[i].phase = SyncPhase::JournalFsyncSent;
                    return false;
                }
                SyncPhase::JournalFsyncSent => {
                    if self.syncs[i].pending > 0 {
                        return false;
                    }
                    self.finish_batch(i);
                    return true;
                }
            }
        }
    }

    /// Append the batch's deferred BIG_WRITE entries and its STABLE list,
    /// submitting the sector write after each append. Returns false when
    /// journal or ring space ran out mid-way; progress cursors make the
    /// retry resume where it stopped.
    fn sync_append_entries(&mut self, i: usize) -> bool {
        loop {
            if self.ring.space_left() < 2 {
                return false;
            }
            let (big_done, stable_done) = {
                let b = &self.syncs[i];
                (b.big_done, b.stable_done)
            };
            if big_done < self.syncs[i].big.len() {
                let ver = self.syncs[i].big[big_done];
                let entry = match self.dirty.get(&ver) {
                    Some(e) if e.big => {
                        let mut bitmap = vec![0u8; self.cfg.clean_bitmap_bytes() as usize];
                        bitmap_cover(&mut bitmap, self.cfg.bitmap_granularity, e.offset, e.len);
                        JournalEntry::BigWrite {
                            oid: ver.oid,
                            version: ver.version,
                            offset: e.offset,
                            len: e.len,
                            block: e.location,
                            bitmap,
                        }
                    }
                    _ => {
                        self.syncs[i].big_done += 1;
                        continue;
                    }
                };
                match self.journal.reserve(entry.encoded_size(), 0) {
                    JournalAlloc::Ok(loc) => {
                        self.journal.append_entry(&entry, Some(ver));
                        self.sync_submit_entry_write(i, &loc);
                        self.syncs[i].big_done += 1;
                    }
                    _ => return false,
                }
            } else {
                let tuples: Vec<ObjVer> = {
                    let b = &self.syncs[i];
                    b.small.iter().chain(b.big.iter()).copied().collect()
                };
                if stable_done >= tuples.len() {
                    return true;
                }
                let max_per_entry = (u64::from(self.cfg.journal_block_size)
                    - SECTOR_HDR_SIZE
                    - ENTRY_HDR_SIZE as u64
                    - 4) as usize
                    / 24;
                let chunk: Vec<ObjVer> = tuples[stable_done..]
                    .iter()
                    .take(max_per_entry)
                    .copied()
                    .collect();
                let n = chunk.len();
                let entry = JournalEntry::Stable { tuples: chunk };
                match self.journal.reserve(entry.encoded_size(), 0) {
                    JournalAlloc::Ok(loc) => {
                        self.journal.append_entry(&entry, None);
                        self.sync_submit_entry_write(i, &loc);
                        self.syncs[i].stable_done += n;
                    }
                    _ => return false,
                }
            }
        }
    }

    fn sync_submit_entry_write(&mut self, i: usize, loc: &crate::journal::EntryLoc) {
        let batch = self.syncs[i].id;
        if let Some(closed) = loc.closed_sector {
            self.submit_sector_close(closed);
        }
        self.journal.pin(loc.sector);
        self.syncs[i].pinned.push(loc.sector);
        self.submit_sector_write(loc.sector, Tag::SyncJournal { batch });
        self.syncs[i].pending += 1;
    }

    /// Promote the batch to `Synced`, queue it for the flusher and call the
    /// batched sync ops back. Removes the batch from `syncs`.
    fn finish_batch(&mut self, i: usize) {
        let batch = self.syncs.remove(i);
        for ver in batch.small.iter().chain(batch.big.iter()) {
            if let Some(e) = self.dirty.get_mut(ver) {
                if e.phase < DirtyPhase::Synced {
                    e.phase = DirtyPhase::Synced;
                }
            }
            self.flusher.request(ver.oid, ver.version);
        }
        trace!(batch = batch.id, "sync barrier durable");
        for op_id in batch.ops {
            if let Some(slot) = self.ops.get_mut(&op_id) {
                slot.op.retval = 0;
            }
            self.retire_op(op_id);
        }
    }

    pub(crate) fn sync_journal_complete(&mut self, batch: u64) {
        if let Some(b) = self.syncs.iter_mut().find(|b| b.id == batch) {
            b.pending = b.pending.saturating_sub(1);
        }
    }

    pub(crate) fn sync_fsync_complete(&mut self, batch: u64, _dev: IoDev) {
        if let Some(b) = self.syncs.iter_mut().find(|b| b.id == batch) {
            b.pending = b.pending.saturating_sub(1);
        }
    }
}
