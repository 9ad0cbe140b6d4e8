//! Startup recovery
//!
//! `initialized` walks 0 → 1 → 2 → 10: instantiate the metadata reader,
//! scan the metadata area into the clean index, then replay the journal
//! into the dirty index. Only afterwards does the engine accept operations.
//!
//! Replay starts at the start block's recorded `journal_start` and follows
//! the sector chain while sequence numbers keep increasing; a bad magic,
//! crc or payload checksum truncates the tail. Versions already covered by
//! the metadata scan are skipped. Replayed writes enter the dirty index at
//! `Written` (their journal I/O completed by definition) and count as
//! unsynced until a `STABLE` entry promotes them.

use crate::engine::Blockstore;
use crate::error::{EngineError, Result};
use crate::journal::{parse_sector, JournalEntry, SECTOR_TYPE_ENTRIES, SECTOR_TYPE_START};
use crate::ring::IoDev;
use crate::types::{CleanEntry, DirtyEntry, DirtyPhase, ObjVer};
use tracing::{info, warn};

impl Blockstore {
    pub(crate) fn init_loop(&mut self) -> Result<()> {
        match self.initialized {
            0 => {
                self.meta_scan_pos = 0;
                self.initialized = 1;
            }
            1 => {
                if self.init_meta_step()? {
                    self.initialized = 2;
                }
            }
            2 => {
                self.init_journal_replay()?;
                self.initialized = 10;
            }
            _ => {}
        }
        Ok(())
    }

    /// Read one `meta_buf_size` chunk of the metadata area and absorb its
    /// slots. Returns true once the whole area has been scanned.
    fn init_meta_step(&mut self) -> Result<bool> {
        let remaining = self.layout.meta_len - self.meta_scan_pos;
        if remaining == 0 {
            return Ok(true);
        }
        let chunk_len = remaining.min(self.cfg.meta_buf_size) as usize;
        let pos = self.meta_scan_pos;
        let chunk = self.ring_read_now(IoDev::Meta, self.cfg.meta_offset + pos, chunk_len)?;

        if self.cfg.inmemory_metadata {
            let at = pos as usize;
            self.meta.buffer[at..at + chunk_len].copy_from_slice(&chunk);
        }

        let mut found: Vec<(u64, crate::meta::MetaSlot)> = Vec::new();
        self.meta.scan_chunk(pos, &chunk, |block, slot| {
            found.push((block, slot));
        });
        for (block, slot) in found {
            if block >= self.layout.block_count {
                warn!(block, "metadata slot beyond data area, ignored");
                continue;
            }
            // a crash between the two halves of a block move can leave two
            // slots claiming one oid: the higher version wins
            match self.clean.get(&slot.oid) {
                Some(existing) if existing.version >= slot.version => continue,
                Some(existing) => {
                    let old_block = existing.block;
                    self.alloc.free_block(old_block);
                }
                None => {}
            }
            self.alloc.mark_used(block);
            self.clean.insert(
                slot.oid,
                CleanEntry {
                    block,
                    version: slot.version,
                    bitmap: slot.bitmap,
                },
            );
        }

        self.meta_scan_pos += chunk_len as u64;
        Ok(self.meta_scan_pos >= self.layout.meta_len)
    }

    fn read_journal_sector(&mut self, rel: u64) -> Result<Vec<u8>> {
        let jbs = self.cfg.journal_block_size as usize;
        if self.cfg.inmemory_journal {
            Ok(self.journal.read_mirror(rel, jbs).to_vec())
        } else {
            self.ring_read_now(IoDev::Journal, self.cfg.journal_offset + rel, jbs)
        }
    }

    fn init_journal_replay(&mut self) -> Result<()> {
        let jbs = u64::from(self.cfg.journal_block_size);
        let jlen = self.layout.journal_len;

        // mirror the whole journal before parsing when it is kept in memory
        if self.cfg.inmemory_journal {
            let step = (1024 * 1024 / jbs).max(1) * jbs;
            let mut pos = 0u64;
            while pos < jlen {
                let chunk = (jlen - pos).min(step) as usize;
                let buf =
                    self.ring_read_now(IoDev::Journal, self.cfg.journal_offset + pos, chunk)?;
                let at = pos as usize;
                self.journal.buffer[at..at + chunk].copy_from_slice(&buf);
                pos += chunk as u64;
            }
        }

        let start_buf = self.read_journal_sector(0)?;
        let start_info = parse_sector(&start_buf, 0).and_then(|(hdr, entries, _)| {
            if hdr.typ != SECTOR_TYPE_START {
                return None;
            }
            entries.into_iter().find_map(|e| match e {
                JournalEntry::Start {
                    journal_start,
                    start_seq,
                } => Some((journal_start, start_seq)),
                _ => None,
            })
        });

        let Some((journal_start, start_seq)) = start_info else {
            info!("no valid journal start block, formatting a fresh journal");
            if !self.cfg.readonly {
                let bytes = self.journal.start_block_bytes(jbs, 1);
                self.ring_write_now(IoDev::Journal, self.cfg.journal_offset, bytes)?;
            }
            self.journal.recover_pointers(jbs, jbs, 0);
            return Ok(());
        };
        if journal_start < jbs || journal_start >= jlen || journal_start % jbs != 0 {
            return Err(EngineError::Recovery(format!(
                "journal start pointer {journal_start} is outside the journal ring"
            )));
        }

        let mut pos = journal_start;
        let mut expected_seq = start_seq;
        let mut next_free = journal_start;
        let mut last_seq = start_seq.saturating_sub(1);
        let mut replayed = 0u64;
        let mut tail: Option<(u64, u64, Vec<u8>, usize, u64)> = None;
        let mut steps = 0u64;
        let max_steps = jlen / jbs + 2;

        'walk: loop {
            steps += 1;
            if steps > max_steps {
                warn!("journal chain exceeds ring capacity, truncating");
                break;
            }
            let buf = self.read_journal_sector(pos)?;
            let Some((hdr, entries, used)) = parse_sector(&buf, pos) else {
                break;
            };
            if hdr.typ != SECTOR_TYPE_ENTRIES || hdr.seq != expected_seq {
                break;
            }
            last_seq = hdr.seq;
            let rec_id = self.journal.recover_sector(pos, hdr.seq);
            next_free = if pos + jbs >= jlen { jbs } else { pos + jbs };
            // byte position past the last intact entry, mirroring the parser
            let mut used_good = crate::journal::SECTOR_HDR_SIZE as usize;

            for entry in entries {
                let esize = entry.encoded_size();
                let inline_skip = match &entry {
                    JournalEntry::SmallWrite { data_loc, len, .. }
                        if *data_loc == pos + (used_good + esize) as u64
                            && *data_loc + u64::from(*len) <= pos + jbs =>
                    {
                        *len as usize
                    }
                    _ => 0,
                };
                match entry {
                    JournalEntry::SmallWrite {
                        oid,
                        version,
                        offset,
                        len,
                        data_loc,
                        data_crc,
                    } => {
                        let external = !(data_loc > pos && data_loc < pos + jbs);
                        let pay_blocks = u64::from(len).div_ceil(jbs);
                        if external {
                            if data_loc < jbs
                                || data_loc % jbs != 0
                                || data_loc + u64::from(len) > jlen
                            {
                                warn!(?oid, version, "small write points outside the journal, truncating");
                                tail = Some((pos, hdr.seq, buf.clone(), used_good, rec_id));
                                break 'walk;
                            }
                            let end = data_loc + pay_blocks * jbs;
                            next_free = if end >= jlen { jbs } else { end };
                        }
                        let data = self.read_journal_bytes(data_loc, len as usize)?;
                        if crc32c::crc32c(&data) != data_crc {
                            warn!(?oid, version, "small write payload checksum mismatch, truncating");
                            tail = Some((pos, hdr.seq, buf.clone(), used_good, rec_id));
                            break 'walk;
                        }
                        let clean_ver = self.clean.get(&oid).map(|c| c.version).unwrap_or(0);
                        if version > clean_ver {
                            let ver = ObjVer::new(oid, version);
                            self.dirty.insert(
                                ver,
                                DirtyEntry {
                                    phase: DirtyPhase::Written,
                                    big: false,
                                    delete: false,
                                    location: data_loc,
                                    offset,
                                    len,
                                },
                            );
                            self.journal.recover_ref(ver, rec_id);
                            if external {
                                let pid = self.journal.recover_payload(data_loc, pay_blocks);
                                self.journal.recover_ref(ver, pid);
                            }
                            self.unsynced_small.push(ver);
                            replayed += 1;
                        }
                    }
                    JournalEntry::BigWrite {
                        oid,
                        version,
                        offset,
                        len,
                        block,
                        ..
                    } => {
                        if block >= self.layout.block_count {
                            warn!(?oid, version, block, "big write block out of range, truncating");
                            tail = Some((pos, hdr.seq, buf.clone(), used_good, rec_id));
                            break 'walk;
                        }
                        let clean_ver = self.clean.get(&oid).map(|c| c.version).unwrap_or(0);
                        if version > clean_ver {
                            let ver = ObjVer::new(oid, version);
                            self.dirty.insert(
                                ver,
                                DirtyEntry {
                                    phase: DirtyPhase::Written,
                                    big: true,
                                    delete: false,
                                    location: block,
                                    offset,
                                    len,
                                },
                            );
                            self.alloc.mark_used(block);
                            self.journal.recover_ref(ver, rec_id);
                            self.unsynced_big.push(ver);
                            replayed += 1;
                        }
                    }
                    JournalEntry::Delete { oid, version } => {
                        let clean_ver = self.clean.get(&oid).map(|c| c.version).unwrap_or(0);
                        if version > clean_ver {
                            let ver = ObjVer::new(oid, version);
                            self.dirty.insert(
                                ver,
                                DirtyEntry {
                                    phase: DirtyPhase::Written,
                                    big: false,
                                    delete: true,
                                    location: 0,
                                    offset: 0,
                                    len: 0,
                                },
                            );
                            self.journal.recover_ref(ver, rec_id);
                            self.unsynced_small.push(ver);
                            replayed += 1;
                        }
                    }
                    JournalEntry::Stable { tuples } => {
                        for t in tuples {
                            if let Some(e) = self.dirty.get_mut(&t) {
                                if e.phase < DirtyPhase::Synced {
                                    e.phase = DirtyPhase::Synced;
                                }
                                self.unsynced_small.retain(|v| *v != t);
                                self.unsynced_big.retain(|v| *v != t);
                                self.flusher.request(t.oid, t.version);
                            }
                        }
                    }
                    JournalEntry::Rollback { tuples } => {
                        for t in tuples {
                            let doomed: Vec<ObjVer> = self
                                .dirty
                                .range(
                                    ObjVer::new(t.oid, t.version + 1)
                                        ..=ObjVer::new(t.oid, u64::MAX),
                                )
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
                        }
                    }
                    JournalEntry::Start { .. } => {}
                }
                used_good += esize + inline_skip;
            }
            debug_assert_eq!(used_good, used);
            // the last fully parsed sector becomes the append tail; it
            // stays in place when the chain stops at a bad successor
            tail = Some((pos, hdr.seq, buf.clone(), used, rec_id));

            if hdr.next_sector == 0 {
                break;
            }
            let next = hdr.next_sector;
            if next < jbs || next >= jlen || next % jbs != 0 {
                break;
            }
            pos = next;
            expected_seq = hdr.seq + 1;
        }

        self.journal.recover_pointers(journal_start, next_free, last_seq);
        if let Some((tpos, _tseq, tbuf, tused, trec)) = tail {
            self.journal.adopt_tail(tpos, &tbuf, tused, trec);
        }
        if let Some((start, seq)) = self.journal.trim() {
            if !self.cfg.readonly {
                let bytes = self.journal.start_block_bytes(start, seq);
                self.ring_write_now(IoDev::Journal, self.cfg.journal_offset, bytes)?;
            }
        }
        info!(
            entries = replayed,
            dirty = self.dirty.len(),
            used_start = self.journal.used_start,
            next_free = self.journal.next_free,
            "journal replay complete"
        );
        Ok(())
    }
}
