//! Journal flusher
//!
//! Cooperative workers that move synced writes into the data area, rewrite
//! the metadata slots and reclaim journal space. One flush unit covers one
//! object's synced chain: compose the target block (base = newest big write
//! or the clean block, small-write granules overlaid newest-wins), write the
//! changed ranges, update the metadata block, fsync both domains, journal a
//! `STABLE` entry and advance `used_start`.
//!
//! The active worker count adapts to journal fullness between
//! `min_flusher_count` and `max_flusher_count`; small-write flushing can be
//! rate-limited by the throttle options.

use crate::config::Config;
use crate::engine::{data_block_offset, meta_block_dev_offset, Blockstore};
use crate::journal::{JournalAlloc, JournalEntry};
use crate::meta::MetaSlot;
use crate::ring::{Cqe, IoDev, Sqe, SqeOp, Tag};
use crate::types::{bitmap_cover, bitmap_get, CleanEntry, DirtyEntry, DirtyPhase, ObjVer, Oid};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobState {
    WriteData,
    DataFsync,
    MetaRead,
    MetaWrite,
    MetaFsync,
    JournalStable,
    Done,
}

/// Read-modify-write state for one metadata block (paged metadata mode).
struct MetaRmw {
    dev_off: u64,
    updates: Vec<(u64, Option<MetaSlot>)>,
    buf: Option<Vec<u8>>,
}

pub(crate) struct FlushJob {
    oid: Oid,
    target: u64,
    state: JobState,
    inflight: bool,
    pending: u32,
    target_block: u64,
    is_delete: bool,
    delete_block: Option<u64>,
    old_clean_block: Option<u64>,
    free_blocks: Vec<u64>,
    new_bitmap: Vec<u8>,
    writes: Vec<(u32, Vec<u8>)>,
    bytes_flushed: u64,
    has_small: bool,
    meta_updates: Vec<(u64, Option<MetaSlot>)>,
    meta_rmw: Vec<MetaRmw>,
    pinned: Option<usize>,
}

enum StartOutcome {
    Started,
    Nothing,
    Deferred,
}

pub(crate) struct Flusher {
    requested: HashMap<Oid, u64>,
    queue: VecDeque<Oid>,
    jobs: Vec<Option<FlushJob>>,
    active_oids: HashSet<Oid>,
    min_count: u32,
    max_count: u32,
    max_iodepth: u32,
    pub drain_mode: bool,
    throttle: bool,
    target_iops: u64,
    target_mbs: u64,
    target_parallelism: u64,
    threshold_us: u64,
    window_start: Option<Instant>,
    window_ops: u64,
    window_bytes: u64,
}

impl Flusher {
    pub fn new(cfg: &Config) -> Self {
        Self {
            requested: HashMap::new(),
            queue: VecDeque::new(),
            jobs: Vec::new(),
            active_oids: HashSet::new(),
            min_count: cfg.min_flusher_count,
            max_count: cfg.max_flusher_count,
            max_iodepth: cfg.max_write_iodepth,
            drain_mode: cfg.flush_journal,
            throttle: cfg.throttle_small_writes,
            target_iops: cfg.throttle_target_iops,
            target_mbs: cfg.throttle_target_mbs,
            target_parallelism: cfg.throttle_target_parallelism,
            threshold_us: cfg.throttle_threshold_us,
            window_start: None,
            window_ops: 0,
            window_bytes: 0,
        }
    }

    /// Point the flusher at a synced version.
    pub fn request(&mut self, oid: Oid, version: u64) {
        let e = self.requested.entry(oid).or_insert(0);
        if version > *e {
            *e = version;
        }
        if !self.queue.contains(&oid) && !self.active_oids.contains(&oid) {
            self.queue.push_back(oid);
        }
    }

    /// Rollback support: never flush past `version` anymore.
    pub fn clamp_request(&mut self, oid: Oid, version: u64) {
        if let Some(e) = self.requested.get_mut(&oid) {
            if *e > version {
                *e = version;
            }
            if *e == 0 {
                self.requested.remove(&oid);
                self.queue.retain(|o| *o != oid);
            }
        }
    }

    pub fn is_flushing(&self, oid: Oid) -> bool {
        self.active_oids.contains(&oid)
    }

    pub fn is_active(&self) -> bool {
        !self.queue.is_empty() || !self.active_oids.is_empty()
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_some()).count()
    }

    fn active_small_jobs(&self) -> u64 {
        self.jobs
            .iter()
            .flatten()
            .filter(|j| j.has_small && j.state != JobState::Done)
            .count() as u64
    }

    /// Small-write throttle: true when another small flush may start now.
    fn throttle_allows(&mut self, bytes: u64) -> bool {
        if !self.throttle {
            return true;
        }
        if self.active_small_jobs() >= self.target_parallelism {
            return false;
        }
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.duration_since(start);
        if elapsed.as_secs() >= 1 {
            self.window_start = Some(now);
            self.window_ops = 0;
            self.window_bytes = 0;
            return true;
        }
        if elapsed.as_micros() < u128::from(self.threshold_us) {
            return true;
        }
        self.window_ops < self.target_iops
            && self.window_bytes + bytes <= self.target_mbs * 1024 * 1024
    }

    fn account(&mut self, bytes: u64) {
        self.window_ops += 1;
        self.window_bytes += bytes;
    }
}

impl Blockstore {
    /// Target number of concurrently running flush jobs, scaled by journal
    /// fullness.
    fn flusher_target_count(&self) -> usize {
        if self.flusher.drain_mode {
            return self.flusher.max_count as usize;
        }
        let ring_len = self.layout.journal_len.saturating_sub(u64::from(self.cfg.journal_block_size));
        let used = self.journal.used_bytes();
        let spread = u64::from(self.flusher.max_count - self.flusher.min_count);
        let scaled = if ring_len == 0 {
            0
        } else {
            spread * used / ring_len
        };
        let target = u64::from(self.flusher.min_count) + scaled;
        target.min(u64::from(self.flusher.max_iodepth)) as usize
    }

    pub(crate) fn flusher_loop(&mut self) {
        // start new jobs up to the adaptive target
        let target = self.flusher_target_count();
        let mut spins = self.flusher.queue.len();
        while self.flusher.active_jobs() < target && spins > 0 {
            spins -= 1;
            let Some(oid) = self.flusher.queue.pop_front() else {
                break;
            };
            if self.flusher.active_oids.contains(&oid) {
                self.flusher.queue.push_back(oid);
                continue;
            }
            let Some(version) = self.flusher.requested.get(&oid).copied() else {
                continue;
            };
            match self.flusher_start_job(oid, version) {
                StartOutcome::Started => {}
                StartOutcome::Nothing => {}
                StartOutcome::Deferred => {
                    self.flusher.queue.push_back(oid);
                    break;
                }
            }
        }
        // advance jobs that are not waiting on completions
        for idx in 0..self.flusher.jobs.len() {
            if self.flusher.jobs[idx].is_some() {
                self.flusher_advance(idx);
            }
        }
    }

    fn flusher_start_job(&mut self, oid: Oid, target: u64) -> StartOutcome {
        // the flushable prefix: synced versions up to the requested one
        let mut chain: Vec<(u64, DirtyEntry)> = Vec::new();
        for (k, e) in self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, target))
        {
            if e.phase != DirtyPhase::Synced {
                break;
            }
            chain.push((k.version, e.clone()));
        }
        let Some(&(newest, _)) = chain.last() else {
            self.flusher.requested.remove(&oid);
            return StartOutcome::Nothing;
        };

        let mut job = FlushJob {
            oid,
            target: newest,
            state: JobState::WriteData,
            inflight: false,
            pending: 0,
            target_block: 0,
            is_delete: false,
            delete_block: None,
            old_clean_block: None,
            free_blocks: Vec::new(),
            new_bitmap: Vec::new(),
            writes: Vec::new(),
            bytes_flushed: 0,
            has_small: false,
            meta_updates: Vec::new(),
            meta_rmw: Vec::new(),
            pinned: None,
        };

        let clean = self.clean.get(&oid).cloned();
        if chain.last().map(|(_, e)| e.delete).unwrap_or(false) {
            job.is_delete = true;
            job.free_blocks = chain
                .iter()
                .filter(|(_, e)| e.big)
                .map(|(_, e)| e.location)
                .collect();
            if let Some(c) = &clean {
                job.delete_block = Some(c.block);
                job.meta_updates.push((c.block, None));
            }
            job.state = if job.meta_updates.is_empty() {
                JobState::JournalStable
            } else if self.cfg.inmemory_metadata {
                JobState::MetaWrite
            } else {
                JobState::MetaRead
            };
        } else {
            // find the base: the newest big write, or a delete boundary,
            // else the clean block
            let mut base_version = 0u64;
            let mut base_bitmap = vec![0u8; self.cfg.clean_bitmap_bytes() as usize];
            let mut base_block: Option<u64> = None;
            for (v, e) in chain.iter().rev() {
                if e.big {
                    base_version = *v;
                    base_block = Some(e.location);
                    bitmap_cover(
                        &mut base_bitmap,
                        self.cfg.bitmap_granularity,
                        e.offset,
                        e.len,
                    );
                    break;
                }
                if e.delete {
                    // everything below the delete is gone; overlay onto an
                    // empty object
                    base_version = *v;
                    break;
                }
            }
            if let Some(b) = base_block {
                // superseded big blocks and the displaced clean block
                job.free_blocks = chain
                    .iter()
                    .filter(|(v, e)| e.big && *v != base_version && e.location != b)
                    .map(|(_, e)| e.location)
                    .collect();
                job.target_block = b;
                if let Some(c) = &clean {
                    if c.block != b {
                        job.old_clean_block = Some(c.block);
                        job.meta_updates.push((c.block, None));
                    }
                }
            } else {
                job.free_blocks = chain
                    .iter()
                    .filter(|(_, e)| e.big)
                    .map(|(_, e)| e.location)
                    .collect();
                match &clean {
                    Some(c) => {
                        job.target_block = c.block;
                        if base_version == 0 {
                            base_bitmap = c.bitmap.clone();
                        }
                    }
                    None => match self.alloc.alloc() {
                        Some(b) => job.target_block = b,
                        None => {
                            // no block for a first flush; retry once the
                            // allocator has room again
                            self.flusher.queue.push_back(oid);
                            return StartOutcome::Deferred;
                        }
                    },
                }
            }

            // overlay the small writes above the base, oldest first
            let block_size = self.cfg.block_size as usize;
            let mut scratch = vec![0u8; block_size];
            let mut present = vec![false; block_size];
            job.new_bitmap = base_bitmap.clone();
            let mut staged = 0u64;
            for (v, e) in chain.iter() {
                if *v <= base_version || e.big || e.delete {
                    continue;
                }
                let payload = match self.read_journal_bytes(e.location, e.len as usize) {
                    Ok(p) => p,
                    Err(_) => {
                        self.flusher.queue.push_back(oid);
                        return StartOutcome::Deferred;
                    }
                };
                let off = e.offset as usize;
                scratch[off..off + e.len as usize].copy_from_slice(&payload);
                present[off..off + e.len as usize].fill(true);
                bitmap_cover(
                    &mut job.new_bitmap,
                    self.cfg.bitmap_granularity,
                    e.offset,
                    e.len,
                );
                staged += u64::from(e.len);
            }
            job.has_small = staged > 0;
            job.bytes_flushed = staged;
            if job.has_small && !self.flusher.throttle_allows(staged) {
                // free the block we may have just taken for a fresh object
                if clean.is_none() && base_block.is_none() {
                    self.alloc.free_block(job.target_block);
                }
                self.flusher.queue.push_back(oid);
                return StartOutcome::Deferred;
            }
            job.writes = compose_writes(
                &scratch,
                &present,
                &base_bitmap,
                self.cfg.bitmap_granularity,
            );

            let slot = MetaSlot {
                oid,
                version: newest,
                bitmap: job.new_bitmap.clone(),
                overlay: vec![0u8; self.cfg.clean_bitmap_bytes() as usize],
            };
            job.meta_updates.push((job.target_block, Some(slot)));
        }

        trace!(?oid, version = job.target, writes = job.writes.len(), "flush job started");
        self.flusher.active_oids.insert(oid);
        let idx = self
            .flusher
            .jobs
            .iter()
            .position(|j| j.is_none())
            .unwrap_or_else(|| {
                self.flusher.jobs.push(None);
                self.flusher.jobs.len() - 1
            });
        self.flusher.jobs[idx] = Some(job);
        StartOutcome::Started
    }

    pub(crate) fn flusher_advance(&mut self, idx: usize) {
        loop {
            let Some(job) = self.flusher.jobs[idx].as_mut() else {
                return;
            };
            if job.pending > 0 {
                return;
            }
            if job.inflight {
                // the last submitted step completed; move on
                job.inflight = false;
                job.state = match job.state {
                    JobState::WriteData => JobState::DataFsync,
                    JobState::DataFsync => {
                        if self.cfg.inmemory_metadata {
                            JobState::MetaWrite
                        } else {
                            JobState::MetaRead
                        }
                    }
                    JobState::MetaRead => JobState::MetaWrite,
                    JobState::MetaWrite => JobState::MetaFsync,
                    JobState::MetaFsync => JobState::JournalStable,
                    JobState::JournalStable => JobState::Done,
                    JobState::Done => JobState::Done,
                };
                continue;
            }
            match job.state {
                JobState::WriteData => {
                    if job.writes.is_empty() {
                        job.state = JobState::DataFsync;
                        continue;
                    }
                    if self.ring.space_left() < job.writes.len() {
                        return;
                    }
                    let block = job.target_block;
                    let writes = std::mem::take(&mut job.writes);
                    job.pending = writes.len() as u32;
                    job.inflight = true;
                    let dev_base = data_block_offset(&self.cfg, block);
                    for (sub, (off, data)) in writes.into_iter().enumerate() {
                        self.ring.push(Sqe {
                            tag: Tag::Flusher {
                                job: idx,
                                sub: sub as u32,
                            },
                            op: SqeOp::Write {
                                dev: IoDev::Data,
                                offset: dev_base + u64::from(off),
                                data: data.into(),
                            },
                        });
                    }
                    return;
                }
                JobState::DataFsync => {
                    if self.cfg.disable_data_fsync || !job.has_small {
                        job.state = if self.cfg.inmemory_metadata {
                            JobState::MetaWrite
                        } else {
                            JobState::MetaRead
                        };
                        continue;
                    }
                    if self.ring.space_left() == 0 {
                        return;
                    }
                    job.pending = 1;
                    job.inflight = true;
                    self.ring.push(Sqe {
                        tag: Tag::Flusher { job: idx, sub: 0 },
                        op: SqeOp::Fsync { dev: IoDev::Data },
                    });
                    return;
                }
                JobState::MetaRead => {
                    if job.meta_updates.is_empty() {
                        job.state = JobState::JournalStable;
                        continue;
                    }
                    if job.meta_rmw.is_empty() {
                        let mut groups: Vec<MetaRmw> = Vec::new();
                        for (b, slot) in job.meta_updates.clone() {
                            let dev_off = meta_block_dev_offset(&self.cfg, &self.meta, b);
                            match groups.iter_mut().find(|g| g.dev_off == dev_off) {
                                Some(g) => g.updates.push((b, slot)),
                                None => groups.push(MetaRmw {
                                    dev_off,
                                    updates: vec![(b, slot)],
                                    buf: None,
                                }),
                            }
                        }
                        job.meta_rmw = groups;
                    }
                    if self.ring.space_left() < job.meta_rmw.len() {
                        return;
                    }
                    job.pending = job.meta_rmw.len() as u32;
                    job.inflight = true;
                    let block_size = self.meta.block_size as usize;
                    let reads: Vec<(usize, u64)> = job
                        .meta_rmw
                        .iter()
                        .enumerate()
                        .map(|(i, g)| (i, g.dev_off))
                        .collect();
                    for (sub, dev_off) in reads {
                        self.ring.push(Sqe {
                            tag: Tag::Flusher {
                                job: idx,
                                sub: sub as u32,
                            },
                            op: SqeOp::Read {
                                dev: IoDev::Meta,
                                offset: dev_off,
                                len: block_size,
                            },
                        });
                    }
                    return;
                }
                JobState::MetaWrite => {
                    if job.meta_updates.is_empty() {
                        job.state = JobState::JournalStable;
                        continue;
                    }
                    let mut writes: Vec<(u64, bytes::Bytes)> = Vec::new();
                    if self.cfg.inmemory_metadata {
                        let updates = job.meta_updates.clone();
                        let job_count;
                        {
                            let meta = &mut self.meta;
                            for (b, slot) in &updates {
                                meta.patch(*b, slot.as_ref());
                            }
                            let mut seen = Vec::new();
                            for (b, _) in &updates {
                                let dev_off = meta_block_dev_offset(&self.cfg, meta, *b);
                                if !seen.contains(&dev_off) {
                                    seen.push(dev_off);
                                    writes.push((dev_off, meta.block_bytes(*b)));
                                }
                            }
                            job_count = writes.len();
                        }
                        let job = self.flusher.jobs[idx].as_mut().unwrap();
                        if self.ring.space_left() < job_count {
                            return;
                        }
                        job.pending = job_count as u32;
                        job.inflight = true;
                    } else {
                        for g in job.meta_rmw.iter_mut() {
                            let Some(buf) = g.buf.as_mut() else { return };
                            for (b, slot) in &g.updates {
                                self.meta.patch_block_buf(buf, *b, slot.as_ref());
                            }
                            writes.push((g.dev_off, bytes::Bytes::copy_from_slice(buf)));
                        }
                        if self.ring.space_left() < writes.len() {
                            return;
                        }
                        job.pending = writes.len() as u32;
                        job.inflight = true;
                    }
                    for (sub, (dev_off, data)) in writes.into_iter().enumerate() {
                        self.ring.push(Sqe {
                            tag: Tag::Flusher {
                                job: idx,
                                sub: sub as u32,
                            },
                            op: SqeOp::Write {
                                dev: IoDev::Meta,
                                offset: dev_off,
                                data,
                            },
                        });
                    }
                    return;
                }
                JobState::MetaFsync => {
                    if self.cfg.disable_meta_fsync {
                        job.state = JobState::JournalStable;
                        continue;
                    }
                    if self.ring.space_left() == 0 {
                        return;
                    }
                    job.pending = 1;
                    job.inflight = true;
                    self.ring.push(Sqe {
                        tag: Tag::Flusher { job: idx, sub: 0 },
                        op: SqeOp::Fsync { dev: IoDev::Meta },
                    });
                    return;
                }
                JobState::JournalStable => {
                    if self.ring.space_left() < 2 {
                        return;
                    }
                    let entry = JournalEntry::Stable {
                        tuples: vec![ObjVer::new(job.oid, job.target)],
                    };
                    let loc = match self.journal.reserve(entry.encoded_size(), 0) {
                        JournalAlloc::Ok(loc) => loc,
                        _ => return, // retried next pass
                    };
                    self.journal.append_entry(&entry, None);
                    self.journal.pin(loc.sector);
                    let job = self.flusher.jobs[idx].as_mut().unwrap();
                    job.pinned = Some(loc.sector);
                    job.pending = 1;
                    job.inflight = true;
                    self.submit_sector_write(loc.sector, Tag::Flusher { job: idx, sub: 0 });
                    if let Some(closed) = loc.closed_sector {
                        self.submit_sector_close(closed);
                    }
                    return;
                }
                JobState::Done => {
                    self.flusher_finalize(idx);
                    return;
                }
            }
        }
    }

    fn flusher_finalize(&mut self, idx: usize) {
        let Some(job) = self.flusher.jobs[idx].take() else {
            return;
        };
        let oid = job.oid;
        if let Some(s) = job.pinned {
            self.journal.unpin(s);
        }
        if job.is_delete {
            self.clean.remove(&oid);
            if let Some(b) = job.delete_block {
                self.alloc.free_block(b);
            }
        } else {
            self.clean.insert(
                oid,
                CleanEntry {
                    block: job.target_block,
                    version: job.target,
                    bitmap: job.new_bitmap.clone(),
                },
            );
            if let Some(b) = job.old_clean_block {
                self.alloc.free_block(b);
            }
        }
        for b in &job.free_blocks {
            self.alloc.free_block(*b);
        }

        // drop the flushed chain and release its journal extents
        let doomed: Vec<ObjVer> = self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, job.target))
            .map(|(k, _)| *k)
            .collect();
        for ver in doomed {
            self.dirty.remove(&ver);
            self.journal.release_version(&ver);
        }
        self.journal_trim();

        self.flusher.active_oids.remove(&oid);
        self.flusher.account(job.bytes_flushed);
        let more = self
            .flusher
            .requested
            .get(&oid)
            .map(|&v| v > job.target)
            .unwrap_or(false);
        if more {
            if !self.flusher.queue.contains(&oid) {
                self.flusher.queue.push_back(oid);
            }
        } else {
            self.flusher.requested.remove(&oid);
        }
        debug!(?oid, version = job.target, "flushed");
    }

    pub(crate) fn flusher_complete(&mut self, idx: usize, sub: u32, cqe: Cqe) {
        let Some(job) = self.flusher.jobs.get_mut(idx).and_then(|j| j.as_mut()) else {
            return;
        };
        if job.state == JobState::MetaRead {
            if let Some(g) = job.meta_rmw.get_mut(sub as usize) {
                g.buf = cqe.buf;
            }
        }
        job.pending = job.pending.saturating_sub(1);
        // the state machine advances on the next flusher pass
    }
}

/// Plan the data-area writes for a composed block. Granules the base never
/// had must be written whole (their unwritten bytes read back as zeros from
/// the scratch buffer); granules the base already covers only need the
/// freshly written ranges.
fn compose_writes(
    scratch: &[u8],
    present: &[bool],
    base_bitmap: &[u8],
    granularity: u32,
) -> Vec<(u32, Vec<u8>)> {
    let block_size = scratch.len();
    let gran = granularity as usize;
    let mut segs: Vec<(usize, usize)> = Vec::new(); // start, end
    let mut g = 0;
    while g * gran < block_size {
        let gs = g * gran;
        let ge = (gs + gran).min(block_size);
        let touched = present[gs..ge].iter().any(|&p| p);
        if touched {
            if !bitmap_get(base_bitmap, g as u32) {
                segs.push((gs, ge));
            } else {
                let mut pos = gs;
                while pos < ge {
                    if present[pos] {
                        let run_start = pos;
                        while pos < ge && present[pos] {
                            pos += 1;
                        }
                        segs.push((run_start, pos));
                    } else {
                        pos += 1;
                    }
                }
            }
        }
        g += 1;
    }
    // merge adjacent segments
    segs.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (s, e) in segs {
        match merged.last_mut() {
            Some(last) if last.1 == s => last.1 = e,
            _ => merged.push((s, e)),
        }
    }
    merged
        .into_iter()
        .map(|(s, e)| (s as u32, scratch[s..e].to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::compose_writes;

    #[test]
    fn fresh_granules_are_written_whole() {
        let mut scratch = vec![0u8; 8192];
        let mut present = vec![false; 8192];
        scratch[512..1024].fill(0x41);
        present[512..1024].fill(true);
        let segs = compose_writes(&scratch, &present, &[0u8], 4096);
        // base granule unset: the whole granule goes out
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].0, 0);
        assert_eq!(segs[0].1.len(), 4096);
        assert_eq!(&segs[0].1[512..1024], &vec![0x41u8; 512][..]);
        assert!(segs[0].1[..512].iter().all(|&b| b == 0));
    }

    #[test]
    fn covered_granules_only_write_dirty_ranges() {
        let mut scratch = vec![0u8; 8192];
        let mut present = vec![false; 8192];
        scratch[512..1024].fill(0x42);
        present[512..1024].fill(true);
        let segs = compose_writes(&scratch, &present, &[0b01u8], 4096);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].0, 512);
        assert_eq!(segs[0].1.len(), 512);
    }

    #[test]
    fn adjacent_segments_merge() {
        let mut scratch = vec![0u8; 8192];
        let mut present = vec![false; 8192];
        present[0..4096].fill(true);
        present[4096..4608].fill(true);
        scratch[0..4608].fill(0x43);
        // granule 0 unset (full write), granule 1 set (range write)
        let segs = compose_writes(&scratch, &present, &[0b10u8], 4096);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].0, 0);
        assert_eq!(segs[0].1.len(), 4608);
    }
}
