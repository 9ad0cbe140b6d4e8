//! The block storage engine: a single-threaded event-driven pipeline over
//! the completion ring.
//!
//! Each pass drains completions (dispatched by submission tag), walks the
//! FIFO submit queue, advances in-progress sync barriers and the flusher,
//! then submits everything queued on the ring. No call in here blocks;
//! anything that cannot proceed parks with an explicit wait reason and is
//! re-checked on the next pass.

use crate::allocator::Allocator;
use crate::config::{Config, Layout};
use crate::device::Device;
use crate::error::{EngineError, Result};
use crate::flusher::Flusher;
use crate::journal::Journal;
use crate::meta::MetaStore;
use crate::op::{Op, OpCode};
use crate::ring::{Cqe, DeviceSet, IoDev, Ring, Sqe, SqeOp, Tag};
use crate::sync::SyncBatch;
use crate::types::{CleanEntry, DirtyEntry, DirtyPhase, ObjVer, Oid};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info};

/// Ring submission queue depth.
const RING_DEPTH: usize = 512;

/// Why a queued op cannot be submitted right now. Every reason has a
/// concrete wakeup event re-evaluated by `check_wait` each pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitKind {
    /// Ring needs at least this many free submission slots
    Sqe(usize),
    /// An earlier version of the same oid has not been submitted yet
    InFlight(u64),
    /// Journal ring space for this reservation shape is not free yet
    Journal { entry: usize, payload: usize },
    /// The next journal sector buffer is still pinned
    JournalBuffer { entry: usize, payload: usize },
    /// No free data blocks
    Free,
}

/// Destination of one fan-out sub-read within the op buffer.
pub(crate) struct ReadSeg {
    pub buf_off: usize,
    pub skip: usize,
    pub take: usize,
}

/// Per-op private state, the engine-side companion of [`Op`].
#[derive(Default)]
pub(crate) struct OpPriv {
    pub wait: Option<WaitKind>,
    pub pending: u32,
    pub pinned: Vec<usize>,
    pub read_segs: Vec<ReadSeg>,
    pub err: i64,
    /// Progress cursor for multi-entry journal appends (stable/rollback)
    pub entries_done: usize,
    /// Verified tuple list of a stable/rollback op, fixed at first dequeue
    pub work: Option<Vec<ObjVer>>,
}

pub(crate) struct OpSlot {
    pub op: Op,
    pub prv: OpPriv,
}

pub struct Blockstore {
    pub(crate) cfg: Config,
    pub(crate) layout: Layout,
    pub(crate) devs: DeviceSet,
    pub(crate) ring: Ring,
    pub(crate) alloc: Allocator,
    pub(crate) meta: MetaStore,
    pub(crate) journal: Journal,
    pub(crate) clean: HashMap<Oid, CleanEntry>,
    pub(crate) dirty: BTreeMap<ObjVer, DirtyEntry>,
    pub(crate) ops: HashMap<u64, OpSlot>,
    pub(crate) next_op: u64,
    pub(crate) submit_queue: VecDeque<u64>,
    pub(crate) unsynced_small: Vec<ObjVer>,
    pub(crate) unsynced_big: Vec<ObjVer>,
    pub(crate) syncs: Vec<SyncBatch>,
    pub(crate) next_sync_batch: u64,
    pub(crate) flusher: Flusher,
    pub(crate) initialized: u8,
    pub(crate) meta_scan_pos: u64,
    pub(crate) failed: bool,
    stop_sync_submitted: bool,
}

impl Blockstore {
    /// Open the engine: parse options, open and lock the devices, compute
    /// the layout and run recovery. The engine accepts operations once this
    /// returns.
    pub fn open(options: &BTreeMap<String, String>) -> Result<Self> {
        let cfg = Config::parse(options)?;

        let lock = !cfg.disable_device_lock;
        let data = Rc::new(Device::open(&cfg.data_device, cfg.readonly, lock)?);
        check_sector(cfg.disk_alignment, data.sector, "disk_alignment", data.path())?;
        let meta = match &cfg.meta_device {
            Some(p) => Rc::new(Device::open(p, cfg.readonly, lock)?),
            None => data.clone(),
        };
        check_sector(cfg.meta_block_size, meta.sector, "meta_block_size", meta.path())?;
        let journal_dev = match &cfg.journal_device {
            Some(p) => Rc::new(Device::open(p, cfg.readonly, lock)?),
            None => meta.clone(),
        };
        check_sector(
            cfg.journal_block_size,
            journal_dev.sector,
            "journal_block_size",
            journal_dev.path(),
        )?;

        let layout = Layout::compute(&cfg, data.size, meta.size, journal_dev.size)?;
        info!(
            data = %data.path(),
            blocks = layout.block_count,
            block_size = cfg.block_size,
            journal_len = layout.journal_len,
            meta_len = layout.meta_len,
            "opening block storage engine"
        );

        let alloc = Allocator::new(layout.block_count);
        let meta_store = MetaStore::new(
            u64::from(cfg.meta_block_size),
            layout.meta_len,
            u64::from(layout.slots_per_block),
            cfg.clean_bitmap_bytes() as usize,
            cfg.inmemory_metadata,
        );
        let journal = Journal::new(
            u64::from(cfg.journal_block_size),
            layout.journal_len,
            cfg.inmemory_journal,
            cfg.journal_sector_buffer_count,
            cfg.journal_no_same_sector_overwrites,
        );
        let flusher = Flusher::new(&cfg);

        let mut bs = Self {
            devs: DeviceSet {
                data,
                meta,
                journal: journal_dev,
            },
            ring: Ring::new(RING_DEPTH),
            alloc,
            meta: meta_store,
            journal,
            clean: HashMap::new(),
            dirty: BTreeMap::new(),
            ops: HashMap::new(),
            next_op: 1,
            submit_queue: VecDeque::new(),
            unsynced_small: Vec::new(),
            unsynced_big: Vec::new(),
            syncs: Vec::new(),
            next_sync_batch: 1,
            flusher,
            initialized: 0,
            meta_scan_pos: 0,
            failed: false,
            stop_sync_submitted: false,
            cfg,
            layout,
        };

        while bs.initialized != 10 {
            bs.init_loop()?;
        }
        info!(
            clean = bs.clean.len(),
            dirty = bs.dirty.len(),
            journal_used = bs.journal.used_bytes(),
            "engine started"
        );
        Ok(bs)
    }

    pub fn is_started(&self) -> bool {
        self.initialized == 10
    }

    pub fn block_size(&self) -> u32 {
        self.cfg.block_size
    }

    pub fn free_block_count(&self) -> u64 {
        self.alloc.free_count()
    }

    pub fn total_block_count(&self) -> u64 {
        self.alloc.total_count()
    }

    /// Journal bytes between `used_start` and `next_free`.
    pub fn journal_used_bytes(&self) -> u64 {
        self.journal.used_bytes()
    }

    pub fn journal_len(&self) -> u64 {
        self.layout.journal_len
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Versions recorded in the clean index, for introspection.
    pub fn clean_version(&self, oid: Oid) -> Option<u64> {
        self.clean.get(&oid).map(|c| c.version)
    }

    pub fn dirty_versions(&self, oid: Oid) -> Vec<(u64, bool)> {
        self.dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX))
            .map(|(k, e)| (k.version, e.delete))
            .collect()
    }

    /// Admit one operation. Parameter errors are reported immediately
    /// through the callback with a negative errno.
    pub fn enqueue(&mut self, mut op: Op) {
        if self.failed {
            op.retval = -i64::from(libc::EIO);
            op.finish();
            return;
        }
        let bs = u64::from(self.cfg.block_size);
        let bad_range = matches!(op.opcode, OpCode::Read | OpCode::Write)
            && (u64::from(op.offset) >= bs
                || u64::from(op.len) > bs - u64::from(op.offset)
                || op.len == 0
                || op.len % self.cfg.disk_alignment != 0);
        let readonly_violation = self.cfg.readonly && !op.opcode.is_read();
        if bad_range || readonly_violation {
            op.retval = -i64::from(libc::EINVAL);
            op.finish();
            return;
        }
        if matches!(op.opcode, OpCode::Stable | OpCode::Rollback) && op.tuples.is_empty() {
            op.retval = 0;
            op.finish();
            return;
        }

        if op.opcode.is_write() {
            self.enqueue_write(&mut op);
        }

        let id = self.next_op;
        self.next_op += 1;
        self.ops.insert(
            id,
            OpSlot {
                op,
                prv: OpPriv::default(),
            },
        );
        self.submit_queue.push_back(id);
    }

    /// One event-loop pass.
    pub fn tick(&mut self) -> Result<()> {
        if self.failed {
            return Err(EngineError::DeviceFailed { errno: libc::EIO });
        }
        for cqe in self.ring.drain() {
            self.handle_cqe(cqe)?;
        }
        if self.initialized != 10 {
            self.init_loop()?;
        } else {
            self.continue_syncs();
            self.submit_loop();
            if !self.cfg.readonly {
                self.flusher_loop();
            }
        }
        self.ring.submit(&self.devs);
        Ok(())
    }

    /// Tick until nothing is queued, in flight, or flushing. Errors out if
    /// the engine stops making progress, rather than spinning forever.
    pub fn run_until_idle(&mut self) -> Result<()> {
        let mut stalled = 0u32;
        loop {
            let before = self.activity_fingerprint();
            self.tick()?;
            if self.is_idle() {
                return Ok(());
            }
            if self.activity_fingerprint() == before && !self.ring.has_completions() {
                stalled += 1;
                if stalled > 100_000 {
                    return Err(EngineError::Recovery(
                        "engine stalled with work outstanding".to_string(),
                    ));
                }
            } else {
                stalled = 0;
            }
        }
    }

    fn activity_fingerprint(&self) -> (usize, usize, usize, usize, u64) {
        (
            self.submit_queue.len(),
            self.ops.len(),
            self.syncs.len(),
            self.flusher.active_jobs(),
            self.journal.used_bytes(),
        )
    }

    fn is_idle(&self) -> bool {
        self.submit_queue.is_empty()
            && self.ops.is_empty()
            && self.syncs.is_empty()
            && !self.flusher.is_active()
            && !self.ring.has_completions()
            && !self.ring.has_queued()
    }

    /// Safe-shutdown check. Enqueues one final implicit sync when unsynced
    /// writes remain, then reports readiness once everything drained.
    pub fn is_safe_to_stop(&mut self) -> bool {
        if !self.submit_queue.is_empty()
            || !self.syncs.is_empty()
            || !self.ops.is_empty()
            || (!self.cfg.readonly && self.flusher.is_active())
        {
            return false;
        }
        if !self.unsynced_small.is_empty() || !self.unsynced_big.is_empty() {
            if !self.cfg.readonly && !self.stop_sync_submitted {
                debug!("submitting final implicit sync before stop");
                self.enqueue(Op::sync());
                self.stop_sync_submitted = true;
            }
            return false;
        }
        true
    }

    /// One-shot `flush_journal` mode: sync outstanding writes and run the
    /// flusher until the journal is completely reclaimed.
    pub fn drain_journal(&mut self) -> Result<()> {
        if !self.unsynced_small.is_empty() || !self.unsynced_big.is_empty() {
            self.enqueue(Op::sync());
        }
        self.flusher.drain_mode = true;
        self.run_until_idle()?;
        self.flusher.drain_mode = false;
        if self.journal.is_drained() {
            Ok(())
        } else {
            Err(EngineError::Recovery(format!(
                "journal not empty after drain: {} bytes used",
                self.journal.used_bytes()
            )))
        }
    }

    // ── completion dispatch ────────────────────────────────────────────

    fn handle_cqe(&mut self, cqe: Cqe) -> Result<()> {
        if cqe.res < 0 && cqe.was_write {
            self.failed = true;
            tracing::error!(res = cqe.res, tag = ?cqe.tag, "device write failed, stopping engine");
            return Err(EngineError::DeviceFailed {
                errno: -cqe.res as i32,
            });
        }
        match cqe.tag {
            Tag::Op { id, sub } => self.op_complete(id, sub, cqe),
            Tag::JournalSector { .. } => {}
            Tag::StartBlock => {}
            Tag::SyncJournal { batch } => self.sync_journal_complete(batch),
            Tag::SyncFsync { batch, dev } => self.sync_fsync_complete(batch, dev),
            Tag::Flusher { job, sub } => self.flusher_complete(job, sub, cqe),
            Tag::Init => {}
        }
        Ok(())
    }

    fn op_complete(&mut self, id: u64, sub: u32, cqe: Cqe) {
        let Some(opcode) = self.ops.get(&id).map(|s| s.op.opcode) else {
            return;
        };
        match opcode {
            OpCode::Read => self.read_complete(id, sub, cqe),
            OpCode::Write | OpCode::Delete => self.write_complete(id),
            OpCode::Stable | OpCode::Rollback => self.stable_complete(id),
            OpCode::Sync => {}
        }
    }

    /// Retire an op: run its callback and drop the slot.
    pub(crate) fn retire_op(&mut self, id: u64) {
        if let Some(mut slot) = self.ops.remove(&id) {
            for s in slot.prv.pinned.drain(..) {
                self.journal.unpin(s);
            }
            slot.op.finish();
        }
    }

    // ── submit loop ────────────────────────────────────────────────────

    fn submit_loop(&mut self) {
        let mut has_writes = 0u8;
        let mut i = 0;
        while i < self.submit_queue.len() {
            let id = self.submit_queue[i];
            let (opcode, waiting) = {
                let slot = match self.ops.get(&id) {
                    Some(s) => s,
                    None => {
                        self.submit_queue.remove(i);
                        continue;
                    }
                };
                (slot.op.opcode, slot.prv.wait.is_some())
            };
            if waiting {
                self.check_wait(id);
                let still = self.ops.get(&id).map(|s| s.prv.wait);
                match still {
                    Some(Some(WaitKind::Sqe(_))) => break,
                    Some(Some(_)) => {
                        if opcode.is_write() {
                            has_writes = 2;
                        }
                        i += 1;
                        continue;
                    }
                    _ => {}
                }
            }
            let saved = self.ring.save();
            let dequeued = match opcode {
                OpCode::Read => self.dequeue_read(id),
                OpCode::Write | OpCode::Delete => {
                    if has_writes == 2 {
                        // earlier writes could not be submitted; keep order
                        break;
                    }
                    let ok = self.dequeue_write(id);
                    has_writes = if ok { 1 } else { 2 };
                    ok
                }
                OpCode::Sync => {
                    if has_writes != 0 {
                        // a sync orders everything admitted before it
                        i += 1;
                        continue;
                    }
                    self.dequeue_sync(id)
                }
                OpCode::Stable => self.dequeue_stable(id),
                OpCode::Rollback => self.dequeue_rollback(id),
            };
            if dequeued {
                self.submit_queue.remove(i);
            } else {
                self.ring.restore(saved);
                let wait = self.ops.get(&id).and_then(|s| s.prv.wait);
                if matches!(wait, Some(WaitKind::Sqe(_))) {
                    break;
                }
                i += 1;
            }
        }
    }

    /// Re-evaluate a parked op's wait reason.
    fn check_wait(&mut self, id: u64) {
        let Some(slot) = self.ops.get(&id) else { return };
        let Some(wait) = slot.prv.wait else { return };
        let clear = match wait {
            WaitKind::Sqe(n) => self.ring.space_left() >= n,
            WaitKind::InFlight(version) => {
                let oid = slot.op.oid;
                !matches!(
                    self.dirty.get(&ObjVer::new(oid, version)),
                    Some(e) if e.phase == DirtyPhase::InFlight
                )
            }
            WaitKind::Journal { entry, payload } => {
                !matches!(
                    self.journal.probe(entry, payload),
                    crate::journal::JournalAlloc::NeedSpace
                )
            }
            WaitKind::JournalBuffer { entry, payload } => {
                !matches!(
                    self.journal.probe(entry, payload),
                    crate::journal::JournalAlloc::NeedBuffer
                )
            }
            WaitKind::Free => self.alloc.free_count() > 0 || self.flusher.is_active(),
        };
        if clear {
            if let Some(slot) = self.ops.get_mut(&id) {
                slot.prv.wait = None;
            }
        }
    }

    // ── shared journal submission helpers ──────────────────────────────

    /// Submit the freshly sealed contents of a sector buffer.
    pub(crate) fn submit_sector_write(&mut self, idx: usize, tag: Tag) {
        let (off, bytes) = self.journal.sector_write_bytes(idx);
        self.ring.push(Sqe {
            tag,
            op: SqeOp::Write {
                dev: IoDev::Journal,
                offset: self.cfg.journal_offset + off,
                data: bytes,
            },
        });
    }

    /// Submit the final write of a sector that was just closed.
    pub(crate) fn submit_sector_close(&mut self, idx: usize) {
        self.submit_sector_write(idx, Tag::JournalSector { sector: idx });
    }

    /// Advance `used_start` and persist the new start block if it moved.
    pub(crate) fn journal_trim(&mut self) {
        if let Some((start, seq)) = self.journal.trim() {
            if self.ring.space_left() == 0 {
                // retried on the next trim; the on-disk start block only
                // ever lags, which replay tolerates
                return;
            }
            let bytes = self.journal.start_block_bytes(start, seq);
            self.ring.push(Sqe {
                tag: Tag::StartBlock,
                op: SqeOp::Write {
                    dev: IoDev::Journal,
                    offset: self.cfg.journal_offset,
                    data: bytes,
                },
            });
            debug!(used_start = start, "journal trimmed");
        }
    }

    // ── synchronous ring access for recovery ───────────────────────────

    /// Submit one read and wait for it, handing every other completion back
    /// to the ring untouched.
    pub(crate) fn ring_read_now(&mut self, dev: IoDev, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.ring.space_left() == 0 {
            self.ring.submit(&self.devs);
        }
        self.ring.push(Sqe {
            tag: Tag::Init,
            op: SqeOp::Read { dev, offset, len },
        });
        let cqe = self.ring_wait_init()?;
        if cqe.res < 0 {
            return Err(EngineError::Recovery(format!(
                "recovery read failed with errno {}",
                -cqe.res
            )));
        }
        cqe.buf
            .ok_or_else(|| EngineError::Recovery("recovery read returned no data".into()))
    }

    pub(crate) fn ring_write_now(&mut self, dev: IoDev, offset: u64, data: bytes::Bytes) -> Result<()> {
        if self.ring.space_left() == 0 {
            self.ring.submit(&self.devs);
        }
        self.ring.push(Sqe {
            tag: Tag::Init,
            op: SqeOp::Write { dev, offset, data },
        });
        let cqe = self.ring_wait_init()?;
        if cqe.res < 0 {
            return Err(EngineError::Recovery(format!(
                "recovery write failed with errno {}",
                -cqe.res
            )));
        }
        Ok(())
    }

    fn ring_wait_init(&mut self) -> Result<Cqe> {
        self.ring.submit(&self.devs);
        let cqes = self.ring.drain();
        let mut wanted = None;
        for cqe in cqes {
            if wanted.is_none() && matches!(cqe.tag, Tag::Init) {
                wanted = Some(cqe);
            } else {
                self.ring.requeue_completion(cqe);
            }
        }
        wanted.ok_or_else(|| EngineError::Recovery("missing recovery completion".into()))
    }

    /// Fetch journal bytes for replay or flushing: straight from the mirror
    /// when in-memory, via an alignment bounce read otherwise.
    pub(crate) fn read_journal_bytes(&mut self, rel_off: u64, len: usize) -> Result<Vec<u8>> {
        if self.journal.inmemory {
            Ok(self.journal.read_mirror(rel_off, len).to_vec())
        } else {
            let dev_off = self.cfg.journal_offset + rel_off;
            let aligned_off = dev_off - dev_off % 512;
            let skip = (dev_off - aligned_off) as usize;
            let aligned_len = (skip + len).next_multiple_of(512);
            let buf = self.ring_read_now(IoDev::Journal, aligned_off, aligned_len)?;
            Ok(buf[skip..skip + len].to_vec())
        }
    }
}

fn check_sector(value: u32, sector: u32, what: &str, path: &str) -> Result<()> {
    if value % sector != 0 {
        return Err(EngineError::config(format!(
            "{what} ({value}) is not a multiple of the sector size ({sector}) of {path}"
        )));
    }
    Ok(())
}

/// Convenience: build an options map from key/value pairs.
pub fn options_from<I, K, V>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Data-device byte offset of a data block.
pub(crate) fn data_block_offset(cfg: &Config, block: u64) -> u64 {
    cfg.data_offset + block * u64::from(cfg.block_size)
}

/// Meta-device byte offset of the metadata block covering `block`.
pub(crate) fn meta_block_dev_offset(cfg: &Config, meta: &MetaStore, block: u64) -> u64 {
    cfg.meta_offset + meta.block_offset(block)
}
