//! Circular journal
//!
//! The journal region starts with a reserved start block whose `START` entry
//! records where replay begins; the rest is a ring of `journal_block_size`
//! sectors. Entries are byte-packed after a 32-byte sector header; a
//! small-write payload lives either inline after its entry (when the sector
//! residue allows) or in whole journal blocks reserved right after the
//! entry's sector.
//!
//! Sector headers carry a monotonically increasing sequence number. On a
//! circular log, magic + crc alone cannot tell a live sector from one left
//! over from a previous lap; replay follows the `next_sector` chain only
//! while sequence numbers keep increasing.
//!
//! All offsets in this module are relative to the journal region.

use crate::types::{ObjVer, Oid};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

pub const JOURNAL_MAGIC: u64 = u64::from_le_bytes(*b"STRJRNL1");
pub const SECTOR_HDR_SIZE: u64 = 32;
pub const ENTRY_HDR_SIZE: usize = 4;

pub const SECTOR_TYPE_START: u16 = 1;
pub const SECTOR_TYPE_ENTRIES: u16 = 2;

/// Blocks the write path must leave free for barrier and flusher entries.
const WRITE_HEADROOM_BLOCKS: u64 = 2;

const JE_START: u16 = 1;
const JE_SMALL_WRITE: u16 = 2;
const JE_BIG_WRITE: u16 = 3;
const JE_DELETE: u16 = 4;
const JE_STABLE: u16 = 5;
const JE_ROLLBACK: u16 = 6;

/// Decoded sector header.
#[derive(Clone, Debug)]
pub struct SectorHeader {
    pub typ: u16,
    pub seq: u64,
    pub next_sector: u64,
}

/// One journal entry.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalEntry {
    Start {
        journal_start: u64,
        start_seq: u64,
    },
    SmallWrite {
        oid: Oid,
        version: u64,
        offset: u32,
        len: u32,
        data_loc: u64,
        data_crc: u32,
    },
    BigWrite {
        oid: Oid,
        version: u64,
        offset: u32,
        len: u32,
        block: u64,
        bitmap: Vec<u8>,
    },
    Delete {
        oid: Oid,
        version: u64,
    },
    Stable {
        tuples: Vec<ObjVer>,
    },
    Rollback {
        tuples: Vec<ObjVer>,
    },
}

impl JournalEntry {
    pub fn encoded_size(&self) -> usize {
        ENTRY_HDR_SIZE
            + match self {
                JournalEntry::Start { .. } => 16,
                JournalEntry::SmallWrite { .. } => 44,
                JournalEntry::BigWrite { bitmap, .. } => 40 + bitmap.len(),
                JournalEntry::Delete { .. } => 24,
                JournalEntry::Stable { tuples } | JournalEntry::Rollback { tuples } => {
                    4 + 24 * tuples.len()
                }
            }
    }

    fn type_code(&self) -> u16 {
        match self {
            JournalEntry::Start { .. } => JE_START,
            JournalEntry::SmallWrite { .. } => JE_SMALL_WRITE,
            JournalEntry::BigWrite { .. } => JE_BIG_WRITE,
            JournalEntry::Delete { .. } => JE_DELETE,
            JournalEntry::Stable { .. } => JE_STABLE,
            JournalEntry::Rollback { .. } => JE_ROLLBACK,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = self.encoded_size();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16_le(self.type_code());
        buf.put_u16_le(size as u16);
        match self {
            JournalEntry::Start {
                journal_start,
                start_seq,
            } => {
                buf.put_u64_le(*journal_start);
                buf.put_u64_le(*start_seq);
            }
            JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_loc,
                data_crc,
            } => {
                buf.put_u64_le(oid.inode);
                buf.put_u64_le(oid.stripe);
                buf.put_u64_le(*version);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*len);
                buf.put_u64_le(*data_loc);
                buf.put_u32_le(*data_crc);
            }
            JournalEntry::BigWrite {
                oid,
                version,
                offset,
                len,
                block,
                bitmap,
            } => {
                buf.put_u64_le(oid.inode);
                buf.put_u64_le(oid.stripe);
                buf.put_u64_le(*version);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*len);
                buf.put_u64_le(*block);
                buf.put_slice(bitmap);
            }
            JournalEntry::Delete { oid, version } => {
                buf.put_u64_le(oid.inode);
                buf.put_u64_le(oid.stripe);
                buf.put_u64_le(*version);
            }
            JournalEntry::Stable { tuples } | JournalEntry::Rollback { tuples } => {
                buf.put_u32_le(tuples.len() as u32);
                for t in tuples {
                    buf.put_u64_le(t.oid.inode);
                    buf.put_u64_le(t.oid.stripe);
                    buf.put_u64_le(t.version);
                }
            }
        }
        debug_assert_eq!(buf.len(), size);
        buf.to_vec()
    }

    fn decode(typ: u16, mut payload: &[u8]) -> Option<Self> {
        match typ {
            JE_START => {
                if payload.len() < 16 {
                    return None;
                }
                Some(JournalEntry::Start {
                    journal_start: payload.get_u64_le(),
                    start_seq: payload.get_u64_le(),
                })
            }
            JE_SMALL_WRITE => {
                if payload.len() < 44 {
                    return None;
                }
                Some(JournalEntry::SmallWrite {
                    oid: Oid::new(payload.get_u64_le(), payload.get_u64_le()),
                    version: payload.get_u64_le(),
                    offset: payload.get_u32_le(),
                    len: payload.get_u32_le(),
                    data_loc: payload.get_u64_le(),
                    data_crc: payload.get_u32_le(),
                })
            }
            JE_BIG_WRITE => {
                if payload.len() < 40 {
                    return None;
                }
                let oid = Oid::new(payload.get_u64_le(), payload.get_u64_le());
                let version = payload.get_u64_le();
                let offset = payload.get_u32_le();
                let len = payload.get_u32_le();
                let block = payload.get_u64_le();
                Some(JournalEntry::BigWrite {
                    oid,
                    version,
                    offset,
                    len,
                    block,
                    bitmap: payload.to_vec(),
                })
            }
            JE_DELETE => {
                if payload.len() < 24 {
                    return None;
                }
                Some(JournalEntry::Delete {
                    oid: Oid::new(payload.get_u64_le(), payload.get_u64_le()),
                    version: payload.get_u64_le(),
                })
            }
            JE_STABLE | JE_ROLLBACK => {
                if payload.len() < 4 {
                    return None;
                }
                let count = payload.get_u32_le() as usize;
                if payload.len() < count * 24 {
                    return None;
                }
                let mut tuples = Vec::with_capacity(count);
                for _ in 0..count {
                    tuples.push(ObjVer::new(
                        Oid::new(payload.get_u64_le(), payload.get_u64_le()),
                        payload.get_u64_le(),
                    ));
                }
                Some(if typ == JE_STABLE {
                    JournalEntry::Stable { tuples }
                } else {
                    JournalEntry::Rollback { tuples }
                })
            }
            _ => None,
        }
    }
}

fn encode_sector_header(buf: &mut [u8], typ: u16, seq: u64, next_sector: u64) {
    let mut hdr = &mut buf[..SECTOR_HDR_SIZE as usize];
    hdr.put_u64_le(JOURNAL_MAGIC);
    hdr.put_u32_le(0); // crc placeholder
    hdr.put_u16_le(typ);
    hdr.put_u16_le(0);
    hdr.put_u64_le(seq);
    hdr.put_u64_le(next_sector);
}

fn seal_sector(buf: &mut [u8]) {
    buf[8..12].fill(0);
    let crc = crc32c::crc32c(buf);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
}

/// Parse a sector: magic and crc validation, then the packed entries.
/// `base` is the sector's journal offset, needed to skip inline payloads.
/// Also returns the byte position just past the last entry so replay can
/// keep appending into a surviving tail sector.
pub fn parse_sector(buf: &[u8], base: u64) -> Option<(SectorHeader, Vec<JournalEntry>, usize)> {
    if buf.len() < SECTOR_HDR_SIZE as usize {
        return None;
    }
    let mut hdr = &buf[..SECTOR_HDR_SIZE as usize];
    if hdr.get_u64_le() != JOURNAL_MAGIC {
        return None;
    }
    let stored_crc = hdr.get_u32_le();
    let typ = hdr.get_u16_le();
    let _pad = hdr.get_u16_le();
    let seq = hdr.get_u64_le();
    let next_sector = hdr.get_u64_le();

    let mut check = buf.to_vec();
    check[8..12].fill(0);
    if crc32c::crc32c(&check) != stored_crc {
        return None;
    }

    let mut entries = Vec::new();
    let mut pos = SECTOR_HDR_SIZE as usize;
    while pos + ENTRY_HDR_SIZE <= buf.len() {
        let typ_code = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        if typ_code == 0 {
            break;
        }
        let size = u16::from_le_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        if size < ENTRY_HDR_SIZE || pos + size > buf.len() {
            break;
        }
        let entry = JournalEntry::decode(typ_code, &buf[pos + ENTRY_HDR_SIZE..pos + size]);
        pos += size;
        match entry {
            Some(e) => {
                // an inline small-write payload sits right after its entry
                // inside the same sector: skip it
                if let JournalEntry::SmallWrite { data_loc, len, .. } = &e {
                    if *data_loc == base + pos as u64 && *data_loc + u64::from(*len) <= base + buf.len() as u64
                    {
                        pos += *len as usize;
                    }
                }
                entries.push(e);
            }
            None => break,
        }
    }
    Some((
        SectorHeader {
            typ,
            seq,
            next_sector,
        },
        entries,
        pos,
    ))
}

/// One composition buffer of the sector ring.
pub(crate) struct SectorBuf {
    pub buf: Vec<u8>,
    /// Journal offset this buffer currently maps to
    pub offset: u64,
    /// Ops still holding their entry's write in flight
    pub usage: u32,
    /// Written to the device at least once at this offset
    pub written: bool,
    /// Used-extent record backing this sector position
    rec_id: u64,
}

struct UsedRec {
    id: u64,
    offset: u64,
    len: u64,
    /// Sector records carry their header seq; payload records don't
    seq: Option<u64>,
}

/// Outcome of a journal reservation attempt.
pub(crate) enum JournalAlloc {
    Ok(EntryLoc),
    /// The next sector buffer is still pinned by unfinished ops
    NeedBuffer,
    /// No ring space ahead of `used_start`
    NeedSpace,
}

/// A committed reservation: where the entry and its payload will live.
pub(crate) struct EntryLoc {
    pub sector: usize,
    /// Sector that had to be closed to make room; the caller must submit
    /// its final write
    pub closed_sector: Option<usize>,
    pub data_loc: u64,
    pub data_external_blocks: u64,
}

pub(crate) struct Journal {
    pub block_size: u64,
    pub len: u64,
    pub inmemory: bool,
    /// Full journal mirror when `inmemory`
    pub buffer: Vec<u8>,
    pub sectors: Vec<SectorBuf>,
    pub cur_sector: usize,
    pub cur_open: bool,
    pub in_sector_pos: u64,
    pub next_free: u64,
    pub used_start: u64,
    /// Last assigned sector sequence number
    pub seq: u64,
    pub no_same_sector_overwrites: bool,
    used: VecDeque<UsedRec>,
    refs: HashMap<u64, u32>,
    by_ver: HashMap<ObjVer, Vec<u64>>,
    next_rec: u64,
}

impl Journal {
    pub fn new(
        block_size: u64,
        len: u64,
        inmemory: bool,
        sector_count: usize,
        no_same_sector_overwrites: bool,
    ) -> Self {
        let sectors = (0..sector_count)
            .map(|_| SectorBuf {
                buf: vec![0u8; block_size as usize],
                offset: 0,
                usage: 0,
                written: false,
                rec_id: 0,
            })
            .collect();
        Self {
            block_size,
            len,
            inmemory,
            buffer: if inmemory { vec![0u8; len as usize] } else { Vec::new() },
            sectors,
            cur_sector: 0,
            cur_open: false,
            in_sector_pos: 0,
            next_free: block_size,
            used_start: block_size,
            seq: 0,
            no_same_sector_overwrites,
            used: VecDeque::new(),
            refs: HashMap::new(),
            by_ver: HashMap::new(),
            next_rec: 1,
        }
    }

    fn ring_start(&self) -> u64 {
        self.block_size
    }

    fn ring_len(&self) -> u64 {
        self.len - self.block_size
    }

    /// Bytes between `used_start` and `next_free` along the ring.
    pub fn used_bytes(&self) -> u64 {
        if self.used.is_empty() {
            return 0;
        }
        let d = (self.next_free + self.ring_len() - self.used_start) % self.ring_len();
        if d == 0 {
            self.ring_len()
        } else {
            d
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Nothing left to flush: every extent is released except the pin on
    /// the currently open sector.
    pub fn is_drained(&self) -> bool {
        self.used.iter().all(|r| {
            let refs = self.refs.get(&r.id).copied().unwrap_or(0);
            refs == 0
                || (self.cur_open
                    && r.id == self.sectors[self.cur_sector].rec_id
                    && refs <= 1)
        })
    }

    /// Simulated placement state for ring-space reservation: `next_free`
    /// plus the effective `used_start` (None while nothing is reserved).
    /// Sector and payload extents of one reservation go through the same
    /// cursor so they can never overlap each other across a wrap.
    fn place(&self, cur: &mut (u64, Option<u64>), nblocks: u64) -> Option<u64> {
        let need = nblocks * self.block_size;
        let start = self.ring_start();
        let end = self.len;
        if need == 0 || need > self.ring_len() {
            return None;
        }
        let (ref mut nf, ref mut us) = *cur;
        let pos = match *us {
            None => {
                if *nf + need <= end {
                    let pos = *nf;
                    *nf += need;
                    pos
                } else if start + need <= end {
                    let pos = start;
                    *nf = start + need;
                    pos
                } else {
                    return None;
                }
            }
            Some(u) => {
                if *nf == u {
                    return None; // completely full
                }
                if *nf > u {
                    if *nf + need <= end {
                        let pos = *nf;
                        *nf += need;
                        pos
                    } else if start + need <= u {
                        let pos = start;
                        *nf = start + need;
                        pos
                    } else {
                        return None;
                    }
                } else if *nf + need <= u {
                    let pos = *nf;
                    *nf += need;
                    pos
                } else {
                    return None;
                }
            }
        };
        if *nf == end {
            *nf = start;
        }
        if us.is_none() {
            *us = Some(pos);
        }
        Some(pos)
    }

    fn place_cursor(&self) -> (u64, Option<u64>) {
        (
            self.next_free,
            if self.used.is_empty() {
                None
            } else {
                Some(self.used_start)
            },
        )
    }

    fn push_rec(&mut self, offset: u64, len: u64, seq: Option<u64>, refs: u32) -> u64 {
        let id = self.next_rec;
        self.next_rec += 1;
        self.used.push_back(UsedRec {
            id,
            offset,
            len,
            seq,
        });
        self.refs.insert(id, refs);
        if self.used.len() == 1 {
            self.used_start = offset;
        }
        id
    }

    fn ref_version(&mut self, ver: ObjVer, rec_id: u64) {
        *self.refs.entry(rec_id).or_insert(0) += 1;
        self.by_ver.entry(ver).or_default().push(rec_id);
    }

    /// Close the current sector: link it to `next_offset` and advance the
    /// ring cursor. Returns the closed buffer index; the caller submits its
    /// final write.
    fn close_current(&mut self, next_offset: u64) -> usize {
        debug_assert!(self.cur_open);
        let idx = self.cur_sector;
        let s = &mut self.sectors[idx];
        let hdr_next = &mut s.buf[24..32];
        hdr_next.copy_from_slice(&next_offset.to_le_bytes());
        // release the open pin
        if let Some(r) = self.refs.get_mut(&s.rec_id) {
            *r -= 1;
        }
        self.cur_open = false;
        self.cur_sector = (self.cur_sector + 1) % self.sectors.len();
        idx
    }

    fn open_sector(&mut self, offset: u64) {
        debug_assert!(!self.cur_open);
        self.seq += 1;
        let seq = self.seq;
        let idx = self.cur_sector;
        let rec_id = self.push_rec(offset, self.block_size, Some(seq), 1);
        let s = &mut self.sectors[idx];
        debug_assert_eq!(s.usage, 0);
        s.buf.fill(0);
        encode_sector_header(&mut s.buf, SECTOR_TYPE_ENTRIES, seq, 0);
        s.offset = offset;
        s.written = false;
        s.rec_id = rec_id;
        self.cur_open = true;
        self.in_sector_pos = SECTOR_HDR_SIZE;
    }

    /// Shape of a reservation: whether a fresh sector is needed and how
    /// many external payload blocks the payload takes (0 = inline or none).
    fn reservation_shape(&self, entry_size: usize, payload_len: usize) -> (bool, u64) {
        let entry_size = entry_size as u64;
        debug_assert!(SECTOR_HDR_SIZE + entry_size <= self.block_size);
        let need_new = !self.cur_open
            || self.block_size - self.in_sector_pos < entry_size
            || (self.no_same_sector_overwrites && self.sectors[self.cur_sector].written);
        let entry_start_pos = if need_new {
            SECTOR_HDR_SIZE
        } else {
            self.in_sector_pos
        };
        let residue_after = self.block_size - entry_start_pos - entry_size;
        let inline = payload_len > 0 && payload_len as u64 <= residue_after;
        let pay_blocks = if payload_len == 0 || inline {
            0
        } else {
            (payload_len as u64).div_ceil(self.block_size)
        };
        (need_new, pay_blocks)
    }

    /// Free ring bytes left for a simulated cursor position.
    fn free_after(&self, cur: &(u64, Option<u64>)) -> u64 {
        match cur.1 {
            None => self.ring_len(),
            Some(us) => {
                let used = (cur.0 + self.ring_len() - us) % self.ring_len();
                let used = if used == 0 { self.ring_len() } else { used };
                self.ring_len() - used
            }
        }
    }

    /// Blocks the write path must leave free, scaled so a barrier over a
    /// journal-full batch can always append its STABLE list.
    fn write_headroom(&self) -> u64 {
        (self.ring_len() / self.block_size / 32).max(WRITE_HEADROOM_BLOCKS)
    }

    /// Non-mutating feasibility check with the same logic as
    /// [`Self::reserve`]; `check_wait` resumes a parked op exactly when the
    /// space it needs becomes reservable. `strict` applies the write-path
    /// headroom rule.
    pub fn probe_headroom(&self, entry_size: usize, payload_len: usize, strict: bool) -> JournalAlloc {
        let (need_new, pay_blocks) = self.reservation_shape(entry_size, payload_len);
        if need_new {
            let next_idx = if self.cur_open {
                (self.cur_sector + 1) % self.sectors.len()
            } else {
                self.cur_sector
            };
            if self.sectors[next_idx].usage > 0 {
                return JournalAlloc::NeedBuffer;
            }
        }
        let mut cur = self.place_cursor();
        if need_new && self.place(&mut cur, 1).is_none() {
            return JournalAlloc::NeedSpace;
        }
        if pay_blocks > 0 && self.place(&mut cur, pay_blocks).is_none() {
            return JournalAlloc::NeedSpace;
        }
        if strict && self.free_after(&cur) < self.write_headroom() * self.block_size {
            return JournalAlloc::NeedSpace;
        }
        JournalAlloc::Ok(EntryLoc {
            sector: self.cur_sector,
            closed_sector: None,
            data_loc: 0,
            data_external_blocks: pay_blocks,
        })
    }

    pub fn probe(&self, entry_size: usize, payload_len: usize) -> JournalAlloc {
        self.probe_headroom(entry_size, payload_len, true)
    }

    /// Make room for one entry plus optional payload, all or nothing.
    /// The write path uses [`Self::reserve_write`], which keeps a couple of
    /// blocks of headroom so sync barriers and the flusher can always
    /// append their own entries; without it a journal filled to the brim
    /// with unsynced writes could never be reclaimed.
    pub fn reserve_write(&mut self, entry_size: usize, payload_len: usize) -> JournalAlloc {
        if let JournalAlloc::NeedSpace = self.probe_headroom(entry_size, payload_len, true) {
            return JournalAlloc::NeedSpace;
        }
        self.reserve(entry_size, payload_len)
    }

    /// Unrestricted reservation for sync, stabilize and flusher entries.
    pub fn reserve(&mut self, entry_size: usize, payload_len: usize) -> JournalAlloc {
        let entry_size_u = entry_size as u64;
        let (need_new, pay_blocks) = self.reservation_shape(entry_size, payload_len);
        if need_new {
            let next_idx = if self.cur_open {
                (self.cur_sector + 1) % self.sectors.len()
            } else {
                self.cur_sector
            };
            if self.sectors[next_idx].usage > 0 {
                return JournalAlloc::NeedBuffer;
            }
        }

        let mut cur = self.place_cursor();
        let sector_off = if need_new {
            match self.place(&mut cur, 1) {
                Some(o) => Some(o),
                None => return JournalAlloc::NeedSpace,
            }
        } else {
            None
        };
        let payload_off = if pay_blocks > 0 {
            match self.place(&mut cur, pay_blocks) {
                Some(o) => Some(o),
                None => return JournalAlloc::NeedSpace,
            }
        } else {
            None
        };
        self.next_free = cur.0;

        let mut closed_sector = None;
        if let Some(off) = sector_off {
            if self.cur_open {
                closed_sector = Some(self.close_current(off));
            }
            self.open_sector(off);
        }
        let sector = self.cur_sector;
        let data_loc = if payload_len > 0 && pay_blocks == 0 {
            self.sectors[sector].offset + self.in_sector_pos + entry_size_u
        } else {
            payload_off.unwrap_or(0)
        };
        JournalAlloc::Ok(EntryLoc {
            sector,
            closed_sector,
            data_loc,
            data_external_blocks: pay_blocks,
        })
    }

    /// Append an encoded entry at the current sector position. When `ver`
    /// is given the entry keeps its sector extent referenced until that
    /// version is flushed.
    pub fn append_entry(&mut self, entry: &JournalEntry, ver: Option<ObjVer>) -> u64 {
        debug_assert!(self.cur_open);
        let bytes = entry.encode();
        let idx = self.cur_sector;
        let pos = self.in_sector_pos as usize;
        let rec_id = self.sectors[idx].rec_id;
        self.sectors[idx].buf[pos..pos + bytes.len()].copy_from_slice(&bytes);
        let entry_pos = self.sectors[idx].offset + self.in_sector_pos;
        self.in_sector_pos += bytes.len() as u64;
        if let Some(v) = ver {
            self.ref_version(v, rec_id);
        }
        entry_pos
    }

    /// Place a small-write payload. Inline payloads land in the current
    /// sector; external ones go to their reserved blocks, returning the
    /// device write to submit.
    pub fn append_payload(&mut self, loc: &EntryLoc, data: &[u8], ver: ObjVer) -> Option<(u64, Bytes)> {
        if loc.data_external_blocks == 0 {
            // inline: right after the entry in the open sector
            let idx = self.cur_sector;
            let pos = (loc.data_loc - self.sectors[idx].offset) as usize;
            self.sectors[idx].buf[pos..pos + data.len()].copy_from_slice(data);
            self.in_sector_pos += data.len() as u64;
            None
        } else {
            let padded_len = (loc.data_external_blocks * self.block_size) as usize;
            let mut padded = vec![0u8; padded_len];
            padded[..data.len()].copy_from_slice(data);
            if self.inmemory {
                let at = loc.data_loc as usize;
                self.buffer[at..at + padded_len].copy_from_slice(&padded);
            }
            let rec_id = self.push_rec(loc.data_loc, padded_len as u64, None, 0);
            self.ref_version(ver, rec_id);
            Some((loc.data_loc, Bytes::from(padded)))
        }
    }

    /// Finalize the sector (crc) and hand back its bytes for submission.
    pub fn sector_write_bytes(&mut self, idx: usize) -> (u64, Bytes) {
        let block_size = self.block_size as usize;
        let s = &mut self.sectors[idx];
        seal_sector(&mut s.buf);
        s.written = true;
        if self.inmemory {
            let at = s.offset as usize;
            self.buffer[at..at + block_size].copy_from_slice(&s.buf);
        }
        (s.offset, Bytes::copy_from_slice(&s.buf))
    }

    pub fn pin(&mut self, idx: usize) {
        self.sectors[idx].usage += 1;
    }

    pub fn unpin(&mut self, idx: usize) {
        let s = &mut self.sectors[idx];
        if s.usage > 0 {
            s.usage -= 1;
        }
    }

    /// Bytes of the reserved start block pointing replay at `journal_start`.
    pub fn start_block_bytes(&mut self, journal_start: u64, start_seq: u64) -> Bytes {
        let mut buf = vec![0u8; self.block_size as usize];
        encode_sector_header(&mut buf, SECTOR_TYPE_START, 0, journal_start);
        let entry = JournalEntry::Start {
            journal_start,
            start_seq,
        }
        .encode();
        buf[SECTOR_HDR_SIZE as usize..SECTOR_HDR_SIZE as usize + entry.len()]
            .copy_from_slice(&entry);
        seal_sector(&mut buf);
        if self.inmemory {
            self.buffer[..self.block_size as usize].copy_from_slice(&buf);
        }
        Bytes::from(buf)
    }

    /// Drop the journal references a flushed or discarded version held.
    pub fn release_version(&mut self, ver: &ObjVer) {
        if let Some(ids) = self.by_ver.remove(ver) {
            for id in ids {
                if let Some(r) = self.refs.get_mut(&id) {
                    *r = r.saturating_sub(1);
                }
            }
        }
    }

    /// Advance `used_start` past fully released extents. Returns the new
    /// start-block contents to persist when something moved.
    pub fn trim(&mut self) -> Option<(u64, u64)> {
        let mut advanced = false;
        while let Some(front) = self.used.front() {
            if self.refs.get(&front.id).copied().unwrap_or(0) == 0 {
                let rec = self.used.pop_front().expect("front exists");
                self.refs.remove(&rec.id);
                advanced = true;
            } else {
                break;
            }
        }
        if !advanced {
            return None;
        }
        match self.used.front() {
            Some(front) => {
                self.used_start = front.offset;
                let seq = front.seq.expect("live front record is a sector");
                Some((front.offset, seq))
            }
            None => {
                self.used_start = self.next_free;
                Some((self.next_free, self.seq + 1))
            }
        }
    }

    /// Copy out of the in-memory mirror.
    pub fn read_mirror(&self, offset: u64, len: usize) -> &[u8] {
        debug_assert!(self.inmemory);
        &self.buffer[offset as usize..offset as usize + len]
    }

    // Recovery hooks: rebuild the accounting that normal operation would
    // have created.

    pub fn recover_sector(&mut self, offset: u64, seq: u64) -> u64 {
        self.seq = self.seq.max(seq);
        self.push_rec(offset, self.block_size, Some(seq), 0)
    }

    pub fn recover_payload(&mut self, offset: u64, blocks: u64) -> u64 {
        self.push_rec(offset, blocks * self.block_size, None, 0)
    }

    pub fn recover_ref(&mut self, ver: ObjVer, rec_id: u64) {
        self.ref_version(ver, rec_id);
    }

    pub fn recover_pointers(&mut self, used_start: u64, next_free: u64, seq: u64) {
        self.used_start = used_start;
        self.next_free = next_free;
        self.seq = self.seq.max(seq);
        self.cur_open = false;
    }

    /// Continue appending into the surviving tail sector: without this, the
    /// on-disk tail would keep `next_sector = 0` while new sectors are
    /// written elsewhere, and a later replay would stop at the tail.
    pub fn adopt_tail(&mut self, offset: u64, content: &[u8], used: usize, rec_id: u64) {
        let idx = self.cur_sector;
        let s = &mut self.sectors[idx];
        s.buf.copy_from_slice(content);
        // remnants of truncated entries past the intact prefix must not
        // survive into the next rewrite: the sector crc would legitimize
        // them on a later replay
        s.buf[used..].fill(0);
        s.offset = offset;
        s.written = true;
        s.rec_id = rec_id;
        s.usage = 0;
        self.cur_open = true;
        self.in_sector_pos = used as u64;
        // open pin, released when the sector closes
        *self.refs.entry(rec_id).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(i: u64) -> Oid {
        Oid::new(i, 0)
    }

    #[test]
    fn entry_roundtrip() {
        let entries = vec![
            JournalEntry::Start {
                journal_start: 4096,
                start_seq: 7,
            },
            JournalEntry::SmallWrite {
                oid: oid(3),
                version: 9,
                offset: 512,
                len: 1024,
                data_loc: 12288,
                data_crc: 0xDEAD_BEEF,
            },
            JournalEntry::BigWrite {
                oid: oid(4),
                version: 1,
                offset: 0,
                len: 4096,
                block: 77,
                bitmap: vec![0xFF],
            },
            JournalEntry::Delete {
                oid: oid(5),
                version: 2,
            },
            JournalEntry::Stable {
                tuples: vec![ObjVer::new(oid(3), 9), ObjVer::new(oid(4), 1)],
            },
            JournalEntry::Rollback {
                tuples: vec![ObjVer::new(oid(5), 2)],
            },
        ];
        for e in entries {
            let buf = e.encode();
            assert_eq!(buf.len(), e.encoded_size());
            let typ = u16::from_le_bytes([buf[0], buf[1]]);
            let decoded = JournalEntry::decode(typ, &buf[4..]).unwrap();
            assert_eq!(decoded, e);
        }
    }

    #[test]
    fn sector_roundtrip_and_crc_rejection() {
        let mut j = Journal::new(4096, 64 * 1024, true, 4, false);
        let loc = match j.reserve(28, 0) {
            JournalAlloc::Ok(l) => l,
            _ => panic!("reserve failed"),
        };
        j.append_entry(
            &JournalEntry::Delete {
                oid: oid(1),
                version: 1,
            },
            Some(ObjVer::new(oid(1), 1)),
        );
        let (off, bytes) = j.sector_write_bytes(loc.sector);
        assert_eq!(off, 4096);

        let (hdr, entries, used) = parse_sector(&bytes, off).unwrap();
        assert_eq!(hdr.typ, SECTOR_TYPE_ENTRIES);
        assert_eq!(hdr.seq, 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(used as u64, SECTOR_HDR_SIZE + 28);

        let mut corrupt = bytes.to_vec();
        corrupt[100] ^= 0xFF;
        assert!(parse_sector(&corrupt, off).is_none());
    }

    #[test]
    fn inline_payload_is_skipped_by_parser() {
        let mut j = Journal::new(4096, 64 * 1024, true, 4, false);
        let data = vec![0x41u8; 512];
        let loc = match j.reserve(48, data.len()) {
            JournalAlloc::Ok(l) => l,
            _ => panic!("reserve failed"),
        };
        assert_eq!(loc.data_external_blocks, 0);
        let ver = ObjVer::new(oid(1), 1);
        let entry = JournalEntry::SmallWrite {
            oid: oid(1),
            version: 1,
            offset: 0,
            len: 512,
            data_loc: loc.data_loc,
            data_crc: crc32c::crc32c(&data),
        };
        j.append_entry(&entry, Some(ver));
        assert!(j.append_payload(&loc, &data, ver).is_none());
        // a second entry lands after the payload
        let loc2 = match j.reserve(28, 0) {
            JournalAlloc::Ok(l) => l,
            _ => panic!("reserve failed"),
        };
        assert_eq!(loc2.sector, loc.sector);
        j.append_entry(
            &JournalEntry::Delete {
                oid: oid(2),
                version: 1,
            },
            Some(ObjVer::new(oid(2), 1)),
        );
        let (off, bytes) = j.sector_write_bytes(loc.sector);
        let (_, entries, _) = parse_sector(&bytes, off).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1], JournalEntry::Delete { .. }));
    }

    #[test]
    fn space_exhaustion_and_release() {
        // ring of 3 usable blocks past the start block
        let mut j = Journal::new(4096, 4 * 4096, true, 4, false);
        // a block-sized payload takes one sector + one payload block
        let loc = match j.reserve(48, 4096) {
            JournalAlloc::Ok(l) => l,
            _ => panic!("reserve failed"),
        };
        let ver = ObjVer::new(oid(10), 1);
        let entry = JournalEntry::SmallWrite {
            oid: oid(10),
            version: 1,
            offset: 0,
            len: 4096,
            data_loc: loc.data_loc,
            data_crc: 0,
        };
        j.append_entry(&entry, Some(ver));
        assert!(j.append_payload(&loc, &vec![0u8; 4096], ver).is_some());

        // 2 of 3 ring blocks taken; two more payload blocks cannot fit
        assert!(matches!(j.reserve(48, 8192), JournalAlloc::NeedSpace));

        j.release_version(&ver);
        // the current sector stays pinned by its open record
        assert!(j.trim().is_none());
        assert!(j.used_bytes() > 0);
    }

    #[test]
    fn used_bytes_never_underflows() {
        let mut j = Journal::new(4096, 16 * 4096, true, 4, false);
        assert_eq!(j.used_bytes(), 0);
        let loc = match j.reserve(28, 0) {
            JournalAlloc::Ok(l) => l,
            _ => panic!(),
        };
        let ver = ObjVer::new(oid(1), 1);
        j.append_entry(
            &JournalEntry::Delete {
                oid: oid(1),
                version: 1,
            },
            Some(ver),
        );
        let _ = j.sector_write_bytes(loc.sector);
        assert!(j.used_bytes() >= 4096);
        j.release_version(&ver);
        let _ = j.trim();
        assert!(j.used_bytes() <= 16 * 4096);
    }
}
