//! Read path
//!
//! Serves the newest visible version, merging granule ranges across the
//! dirty chain and the clean entry. A single read can fan out into several
//! ring submissions; journal-resident data is copied straight out of the
//! in-memory journal mirror when one is kept.

use crate::engine::{data_block_offset, Blockstore, ReadSeg, WaitKind};
use crate::ring::{Cqe, IoDev, Sqe, SqeOp, Tag};
use crate::types::{bitmap_get, DirtyPhase, ObjVer};

/// One planned device read.
struct PlannedRead {
    dev: IoDev,
    offset: u64,
    len: usize,
    seg: ReadSeg,
}

impl Blockstore {
    pub(crate) fn dequeue_read(&mut self, id: u64) -> bool {
        let (oid, max_ver, op_offset, op_len) = {
            let slot = &self.ops[&id];
            let max_ver = match slot.op.version {
                0 | u64::MAX => u64::MAX,
                v => v,
            };
            (slot.op.oid, max_ver, slot.op.offset, slot.op.len)
        };

        // byte ranges of the block still unfilled, relative to the block
        let mut holes: Vec<(u32, u32)> = vec![(op_offset, op_offset + op_len)];
        let mut plan: Vec<PlannedRead> = Vec::new();
        let mut mirror_copies: Vec<(usize, u64, usize)> = Vec::new(); // buf_off, journal rel, len
        let mut served_version = 0u64;
        let mut deleted = false;

        for (k, e) in self
            .dirty
            .range(ObjVer::new(oid, 0)..=ObjVer::new(oid, max_ver))
            .rev()
        {
            if holes.is_empty() {
                break;
            }
            if e.phase < DirtyPhase::Submitted {
                continue;
            }
            if served_version == 0 {
                served_version = k.version;
            }
            if e.delete {
                deleted = true;
                break;
            }
            let e_start = e.offset;
            let e_end = e.offset + e.len;
            let mut next_holes = Vec::with_capacity(holes.len() + 1);
            for &(h0, h1) in &holes {
                let c0 = h0.max(e_start);
                let c1 = h1.min(e_end);
                if c0 >= c1 {
                    next_holes.push((h0, h1));
                    continue;
                }
                if h0 < c0 {
                    next_holes.push((h0, c0));
                }
                if c1 < h1 {
                    next_holes.push((c1, h1));
                }
                let buf_off = (c0 - op_offset) as usize;
                let len = (c1 - c0) as usize;
                if e.big {
                    plan.push(PlannedRead {
                        dev: IoDev::Data,
                        offset: data_block_offset(&self.cfg, e.location) + u64::from(c0),
                        len,
                        seg: ReadSeg {
                            buf_off,
                            skip: 0,
                            take: len,
                        },
                    });
                } else {
                    let rel = e.location + u64::from(c0 - e_start);
                    if self.journal.inmemory {
                        mirror_copies.push((buf_off, rel, len));
                    } else {
                        let dev_off = self.cfg.journal_offset + rel;
                        let aligned = dev_off - dev_off % 512;
                        let skip = (dev_off - aligned) as usize;
                        let aligned_len = (skip + len).next_multiple_of(512);
                        plan.push(PlannedRead {
                            dev: IoDev::Journal,
                            offset: aligned,
                            len: aligned_len,
                            seg: ReadSeg {
                                buf_off,
                                skip,
                                take: len,
                            },
                        });
                    }
                }
            }
            holes = next_holes;
        }

        // whatever the dirty chain left uncovered comes from the clean
        // entry, granule by granule; holes with no data read back as zeros
        if !deleted && !holes.is_empty() {
            if let Some(c) = self.clean.get(&oid) {
                if c.version <= max_ver {
                    if served_version == 0 {
                        served_version = c.version;
                    }
                    let gran = self.cfg.bitmap_granularity;
                    for &(h0, h1) in &holes {
                        let mut run_start: Option<u32> = None;
                        let mut pos = h0;
                        while pos < h1 {
                            let g = pos / gran;
                            let g_end = ((g + 1) * gran).min(h1);
                            if bitmap_get(&c.bitmap, g) {
                                if run_start.is_none() {
                                    run_start = Some(pos);
                                }
                            } else if let Some(rs) = run_start.take() {
                                let len = (pos - rs) as usize;
                                plan.push(PlannedRead {
                                    dev: IoDev::Data,
                                    offset: data_block_offset(&self.cfg, c.block) + u64::from(rs),
                                    len,
                                    seg: ReadSeg {
                                        buf_off: (rs - op_offset) as usize,
                                        skip: 0,
                                        take: len,
                                    },
                                });
                            }
                            pos = g_end;
                        }
                        if let Some(rs) = run_start {
                            let len = (h1 - rs) as usize;
                            plan.push(PlannedRead {
                                dev: IoDev::Data,
                                offset: data_block_offset(&self.cfg, c.block) + u64::from(rs),
                                len,
                                seg: ReadSeg {
                                    buf_off: (rs - op_offset) as usize,
                                    skip: 0,
                                    take: len,
                                },
                            });
                        }
                    }
                }
            }
        }

        if plan.len() > self.ring.space_left() {
            let need = plan.len();
            self.set_wait(id, WaitKind::Sqe(need));
            return false;
        }

        // commit: zero-fill, apply mirror copies, submit reads
        {
            let slot = self.ops.get_mut(&id).unwrap();
            slot.op.buf.iter_mut().for_each(|b| *b = 0);
            slot.op.version = served_version;
        }
        for (buf_off, rel, len) in mirror_copies {
            let data = self.journal.read_mirror(rel, len).to_vec();
            let slot = self.ops.get_mut(&id).unwrap();
            slot.op.buf[buf_off..buf_off + len].copy_from_slice(&data);
        }
        let pending = plan.len() as u32;
        let mut segs = Vec::with_capacity(plan.len());
        for (i, p) in plan.into_iter().enumerate() {
            segs.push(p.seg);
            self.ring.push(Sqe {
                tag: Tag::Op { id, sub: i as u32 },
                op: SqeOp::Read {
                    dev: p.dev,
                    offset: p.offset,
                    len: p.len,
                },
            });
        }
        {
            let slot = self.ops.get_mut(&id).unwrap();
            slot.prv.read_segs = segs;
            slot.prv.pending = pending;
        }
        if pending == 0 {
            let slot = self.ops.get_mut(&id).unwrap();
            slot.op.retval = i64::from(op_len);
            self.retire_op(id);
        }
        true
    }

    pub(crate) fn read_complete(&mut self, id: u64, sub: u32, cqe: Cqe) {
        let Some(slot) = self.ops.get_mut(&id) else {
            return;
        };
        slot.prv.pending -= 1;
        if cqe.res < 0 {
            // keep the first error; remaining sub-reads are discarded as
            // they drain
            if slot.prv.err == 0 {
                slot.prv.err = cqe.res;
            }
        } else if slot.prv.err == 0 {
            if let (Some(seg), Some(buf)) = (slot.prv.read_segs.get(sub as usize), cqe.buf.as_ref())
            {
                slot.op.buf[seg.buf_off..seg.buf_off + seg.take]
                    .copy_from_slice(&buf[seg.skip..seg.skip + seg.take]);
            }
        }
        if slot.prv.pending == 0 {
            let len = slot.op.len;
            slot.op.retval = if slot.prv.err < 0 {
                slot.prv.err
            } else {
                i64::from(len)
            };
            self.retire_op(id);
        }
    }
}
