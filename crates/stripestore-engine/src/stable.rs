//! Stabilize and rollback
//!
//! Stabilize is the client's acknowledgement that a set of versions is
//! durable: each must already be `Synced` (or stable), a `STABLE` entry is
//! journaled and the flusher is pointed at them. Rollback discards
//! not-yet-stabilized versions above a given one and journals a `ROLLBACK`
//! entry so replay discards them too.

use crate::engine::Blockstore;
use crate::journal::{JournalAlloc, JournalEntry};
use crate::ring::Tag;
use crate::types::{DirtyPhase, ObjVer};
use tracing::trace;

impl Blockstore {
    pub(crate) fn dequeue_stable(&mut self, id: u64) -> bool {
        let work = match self.ops[&id].prv.work.clone() {
            Some(w) => w,
            None => {
                // verify before touching anything
                let tuples = self.ops[&id].op.tuples.clone();
                let mut work = Vec::new();
                for t in &tuples {
                    match self.dirty.get(t) {
                        Some(e) if e.phase >= DirtyPhase::Synced => work.push(*t),
                        Some(_) => return self.fail_op(id, libc::EBUSY),
                        None => {
                            let known_stable = self
                                .clean
                                .get(&t.oid)
                                .map(|c| c.version >= t.version)
                                .unwrap_or(false);
                            if !known_stable {
                                return self.fail_op(id, libc::ENOENT);
                            }
                            // already stable: nothing to do for this tuple
                        }
                    }
                }
                if work.is_empty() {
                    if let Some(slot) = self.ops.get_mut(&id) {
                        slot.op.retval = 0;
                    }
                    self.retire_op(id);
                    return true;
                }
                self.ops.get_mut(&id).unwrap().prv.work = Some(work.clone());
                work
            }
        };

        if !self.append_tuple_entries(id, &work, false) {
            return false; // journal space; retried next pass
        }
        for t in &work {
            self.flusher.request(t.oid, t.version);
        }
        trace!(count = work.len(), "stabilize journaled");
        true
    }

    pub(crate) fn dequeue_rollback(&mut self, id: u64) -> bool {
        let work = match self.ops[&id].prv.work.clone() {
            Some(w) => w,
            None => {
                let tuples = self.ops[&id].op.tuples.clone();
                for t in &tuples {
                    if self
                        .clean
                        .get(&t.oid)
                        .map(|c| c.version > t.version)
                        .unwrap_or(false)
                    {
                        // stable data cannot be rolled back
                        return self.fail_op(id, libc::EBUSY);
                    }
                    if self.flusher.is_flushing(t.oid) {
                        return self.fail_op(id, libc::EBUSY);
                    }
                }
                self.ops.get_mut(&id).unwrap().prv.work = Some(tuples.clone());
                tuples
            }
        };

        if !self.append_tuple_entries(id, &work, true) {
            return false;
        }

        // drop every dirty version above the rollback point
        for t in &work {
            let doomed: Vec<ObjVer> = self
                .dirty
                .range(ObjVer::new(t.oid, t.version + 1)..=ObjVer::new(t.oid, u64::MAX))
                .map(|(k, _)| *k)
                .collect();
            for ver in doomed {
                if let Some(e) = self.dirty.remove(&ver) {
                    if e.big {
                        self.alloc.free_block(e.location);
                    }
                    self.journal.release_version(&ver);
                    self.unsynced_small.retain(|v| *v != ver);
                    self.unsynced_big.retain(|v| *v != ver);
                }
            }
            self.flusher.clamp_request(t.oid, t.version);
        }
        self.journal_trim();
        trace!(count = work.len(), "rollback journaled");
        true
    }

    /// Append STABLE or ROLLBACK entries for `tuples`, chunked to the
    /// sector size, submitting the touched sector writes under the op's
    /// tag. Returns false (without parking) when journal space ran out;
    /// `entries_done` makes the retry resume where it stopped.
    fn append_tuple_entries(&mut self, id: u64, tuples: &[ObjVer], rollback: bool) -> bool {
        let max_per_entry = (u64::from(self.cfg.journal_block_size)
            - crate::journal::SECTOR_HDR_SIZE
            - crate::journal::ENTRY_HDR_SIZE as u64
            - 4) as usize
            / 24;
        let mut done = self.ops[&id].prv.entries_done;
        let mut sub = 0u32;
        while done < tuples.len() {
            if self.ring.space_left() < 2 {
                break;
            }
            let chunk: Vec<ObjVer> = tuples[done..].iter().take(max_per_entry).copied().collect();
            let n = chunk.len();
            let entry = if rollback {
                JournalEntry::Rollback { tuples: chunk }
            } else {
                JournalEntry::Stable { tuples: chunk }
            };
            match self.journal.reserve(entry.encoded_size(), 0) {
                JournalAlloc::Ok(loc) => {
                    self.journal.append_entry(&entry, None);
                    if let Some(closed) = loc.closed_sector {
                        self.submit_sector_close(closed);
                    }
                    self.journal.pin(loc.sector);
                    self.submit_sector_write(loc.sector, Tag::Op { id, sub });
                    sub += 1;
                    let slot = self.ops.get_mut(&id).unwrap();
                    slot.prv.pinned.push(loc.sector);
                    slot.prv.pending += 1;
                    done += n;
                }
                _ => break,
            }
        }
        self.ops.get_mut(&id).unwrap().prv.entries_done = done;
        done >= tuples.len()
    }

    /// Completion of a stable/rollback journal write. The op retires only
    /// once every chunk has been appended and written.
    pub(crate) fn stable_complete(&mut self, id: u64) {
        let Some(slot) = self.ops.get_mut(&id) else {
            return;
        };
        slot.prv.pending -= 1;
        let all_appended = slot
            .prv
            .work
            .as_ref()
            .map(|w| slot.prv.entries_done >= w.len())
            .unwrap_or(true);
        if slot.prv.pending == 0 && all_appended {
            slot.op.retval = 0;
            self.retire_op(id);
        }
    }

    fn fail_op(&mut self, id: u64, errno: i32) -> bool {
        if let Some(slot) = self.ops.get_mut(&id) {
            slot.op.retval = -i64::from(errno);
        }
        self.retire_op(id);
        true
    }
}
