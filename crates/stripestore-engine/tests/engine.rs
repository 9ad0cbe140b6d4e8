//! End-to-end engine tests over temp-file devices: write/read round trips,
//! sync durability across reopen, crash recovery, journal wraparound,
//! deletes, stabilize/rollback and the immediate-commit modes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use stripestore_engine::{options_from, Blockstore, ObjVer, Oid, Op};
use tempfile::NamedTempFile;

const JOURNAL_SIZE: u64 = 64 * 1024;
const META_OFFSET: u64 = 64 * 1024;
const DATA_OFFSET: u64 = 1024 * 1024;
const DISK_SIZE: u64 = 8 * 1024 * 1024;
const BLOCK: u32 = 4096;

fn make_disk() -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.as_file_mut().set_len(DISK_SIZE).unwrap();
    f.flush().unwrap();
    f
}

fn options(path: &Path) -> BTreeMap<String, String> {
    options_from([
        ("data_device", path.display().to_string()),
        ("block_size", BLOCK.to_string()),
        ("bitmap_granularity", "4096".to_string()),
        ("disk_alignment", "512".to_string()),
        ("journal_offset", "0".to_string()),
        ("journal_size", JOURNAL_SIZE.to_string()),
        ("meta_offset", META_OFFSET.to_string()),
        ("data_offset", DATA_OFFSET.to_string()),
    ])
}

fn open(path: &Path) -> Blockstore {
    Blockstore::open(&options(path)).unwrap()
}

type OpResult = (i64, Vec<u8>, u64);

/// Enqueue an op and tick until its callback fires.
fn run_op(bs: &mut Blockstore, op: Op) -> OpResult {
    let done: Rc<RefCell<Option<OpResult>>> = Rc::new(RefCell::new(None));
    let done2 = done.clone();
    bs.enqueue(op.with_callback(move |op| {
        *done2.borrow_mut() = Some((op.retval, std::mem::take(&mut op.buf), op.version));
    }));
    let mut ticks = 0u32;
    while done.borrow().is_none() {
        bs.tick().unwrap();
        ticks += 1;
        assert!(ticks < 100_000, "operation never completed");
    }
    let result = done.borrow_mut().take().unwrap();
    result
}

fn write(bs: &mut Blockstore, oid: Oid, offset: u32, data: Vec<u8>) -> i64 {
    run_op(bs, Op::write(oid, offset, data)).0
}

fn read(bs: &mut Blockstore, oid: Oid, offset: u32, len: u32) -> (i64, Vec<u8>) {
    let (retval, buf, _) = run_op(bs, Op::read(oid, offset, len));
    (retval, buf)
}

fn sync(bs: &mut Blockstore) -> i64 {
    run_op(bs, Op::sync()).0
}

#[test]
fn s1_small_write_read_back() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(1, 0);

    assert_eq!(write(&mut bs, oid, 0, vec![0x41; 512]), 512);
    let (retval, buf) = read(&mut bs, oid, 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x41; 512]);
}

#[test]
fn s2_newer_version_becomes_visible_whole() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(1, 0);

    assert_eq!(write(&mut bs, oid, 0, vec![0x41; 512]), 512);
    assert_eq!(write(&mut bs, oid, 0, vec![0x42; 512]), 512);

    let (retval, buf) = read(&mut bs, oid, 0, 512);
    assert_eq!(retval, 512);
    // one version, never a mix
    assert!(buf.iter().all(|&b| b == buf[0]));
    assert_eq!(buf, vec![0x42; 512]);
}

#[test]
fn s3_sync_is_durable_across_reopen() {
    let disk = make_disk();
    {
        let mut bs = open(disk.path());
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x41; 512]), 512);
        assert_eq!(sync(&mut bs), 0);
        // dropped before the flusher necessarily ran
    }
    let mut bs = open(disk.path());
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x41; 512]);
}

#[test]
fn s4_crash_without_sync_never_tears() {
    let disk = make_disk();
    {
        let mut bs = open(disk.path());
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x41; 512]), 512);
    }
    let mut bs = open(disk.path());
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(retval, 512);
    // replayed or lost, but never partial
    assert!(buf.iter().all(|&b| b == buf[0]));
    assert!(buf[0] == 0x41 || buf[0] == 0);
}

#[test]
fn s5_journal_wraparound() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(1, 0);

    // many times the journal length in write+sync traffic
    let iterations = (10 * JOURNAL_SIZE / 512) as u32;
    for i in 0..iterations {
        let pattern = (i % 251) as u8;
        assert_eq!(write(&mut bs, oid, 0, vec![pattern; 512]), 512);
        assert_eq!(sync(&mut bs), 0);
        assert!(bs.journal_used_bytes() <= bs.journal_len());
    }
    bs.run_until_idle().unwrap();
    // everything reclaimable was reclaimed; at most the open tail sector
    // stays accounted
    assert!(bs.journal_used_bytes() <= 2 * 4096);

    let last = ((iterations - 1) % 251) as u8;
    let (retval, buf) = read(&mut bs, oid, 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![last; 512]);
}

#[test]
fn s6_delete_then_read_zero_fills_and_frees() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(1, 0);
    let total = bs.total_block_count();

    assert_eq!(write(&mut bs, oid, 0, vec![0x41; 512]), 512);
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();
    assert_eq!(bs.free_block_count(), total - 1);

    assert_eq!(run_op(&mut bs, Op::delete(oid)).0, 0);
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();
    assert_eq!(bs.free_block_count(), total);

    let (retval, buf) = read(&mut bs, oid, 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0; 512]);
}

#[test]
fn writes_continue_after_crash_recovery() {
    let disk = make_disk();
    {
        let mut bs = open(disk.path());
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x41; 512]), 512);
        assert_eq!(sync(&mut bs), 0);
        // crash with the write journal-resident
    }
    {
        // recovery keeps appending into the surviving journal tail
        let mut bs = open(disk.path());
        assert_eq!(write(&mut bs, Oid::new(2, 0), 0, vec![0x55; 512]), 512);
        assert_eq!(sync(&mut bs), 0);
        let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
        assert_eq!(retval, 512);
        assert_eq!(buf, vec![0x41; 512]);
    }
    let mut bs = open(disk.path());
    let (_, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(buf, vec![0x41; 512]);
    let (_, buf) = read(&mut bs, Oid::new(2, 0), 0, 512);
    assert_eq!(buf, vec![0x55; 512]);
}

#[test]
fn recovery_is_idempotent() {
    let disk = make_disk();
    {
        let mut bs = open(disk.path());
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x41; 512]), 512);
        assert_eq!(write(&mut bs, Oid::new(2, 4096), 0, vec![0x42; 1024]), 1024);
        assert_eq!(sync(&mut bs), 0);
    }
    let (clean1, dirty1) = {
        let bs = open(disk.path());
        (bs.clean_version(Oid::new(1, 0)), bs.dirty_versions(Oid::new(1, 0)))
    };
    let (clean2, dirty2) = {
        let bs = open(disk.path());
        (bs.clean_version(Oid::new(1, 0)), bs.dirty_versions(Oid::new(1, 0)))
    };
    assert_eq!(clean1, clean2);
    assert_eq!(dirty1, dirty2);
}

#[test]
fn immediate_commit_small_is_durable_without_sync() {
    let disk = make_disk();
    let mut opts = options(disk.path());
    opts.insert("disable_data_fsync".into(), "true".into());
    opts.insert("disable_journal_fsync".into(), "true".into());
    opts.insert("immediate_commit".into(), "small".into());
    {
        let mut bs = Blockstore::open(&opts).unwrap();
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x41; 512]), 512);
        // no sync
    }
    let mut bs = Blockstore::open(&opts).unwrap();
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x41; 512]);
}

#[test]
fn immediate_commit_all_covers_big_writes() {
    let disk = make_disk();
    let mut opts = options(disk.path());
    opts.insert("disable_data_fsync".into(), "true".into());
    opts.insert("disable_meta_fsync".into(), "true".into());
    opts.insert("disable_journal_fsync".into(), "true".into());
    opts.insert("immediate_commit".into(), "all".into());
    {
        let mut bs = Blockstore::open(&opts).unwrap();
        assert_eq!(
            write(&mut bs, Oid::new(1, 0), 0, vec![0x5A; BLOCK as usize]),
            i64::from(BLOCK)
        );
    }
    let mut bs = Blockstore::open(&opts).unwrap();
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, BLOCK);
    assert_eq!(retval, i64::from(BLOCK));
    assert_eq!(buf, vec![0x5A; BLOCK as usize]);
}

#[test]
fn versions_increase_and_promote() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(7, 0);

    for _ in 0..3 {
        assert_eq!(write(&mut bs, oid, 0, vec![1; 512]), 512);
    }
    let versions: Vec<u64> = bs.dirty_versions(oid).iter().map(|(v, _)| *v).collect();
    assert_eq!(versions, vec![1, 2, 3]);

    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();
    assert_eq!(bs.clean_version(oid), Some(3));
    assert!(bs.dirty_versions(oid).is_empty());
}

#[test]
fn big_write_allocates_and_replaces_block() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(3, 0);
    let total = bs.total_block_count();

    assert_eq!(
        write(&mut bs, oid, 0, vec![0xA1; BLOCK as usize]),
        i64::from(BLOCK)
    );
    assert_eq!(bs.free_block_count(), total - 1);
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();
    assert_eq!(bs.free_block_count(), total - 1);

    // the rewrite takes a second block until the flusher frees the old one
    assert_eq!(
        write(&mut bs, oid, 0, vec![0xA2; BLOCK as usize]),
        i64::from(BLOCK)
    );
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();
    assert_eq!(bs.free_block_count(), total - 1);

    let (retval, buf) = read(&mut bs, oid, 0, BLOCK);
    assert_eq!(retval, i64::from(BLOCK));
    assert_eq!(buf, vec![0xA2; BLOCK as usize]);
}

#[test]
fn sparse_writes_merge_in_granule() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(9, 0);

    assert_eq!(write(&mut bs, oid, 0, vec![0x41; 512]), 512);
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();

    assert_eq!(write(&mut bs, oid, 1024, vec![0x42; 512]), 512);
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();

    let (retval, buf) = read(&mut bs, oid, 0, 2048);
    assert_eq!(retval, 2048);
    assert_eq!(&buf[0..512], &vec![0x41u8; 512][..]);
    assert_eq!(&buf[512..1024], &vec![0u8; 512][..]);
    assert_eq!(&buf[1024..1536], &vec![0x42u8; 512][..]);
    assert_eq!(&buf[1536..2048], &vec![0u8; 512][..]);
}

#[test]
fn read_merges_journal_version_over_clean() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(4, 0);

    assert_eq!(write(&mut bs, oid, 0, vec![0x10; 2048]), 2048);
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();

    // journal-resident overwrite of the middle
    assert_eq!(write(&mut bs, oid, 512, vec![0x20; 512]), 512);
    let (retval, buf) = read(&mut bs, oid, 0, 2048);
    assert_eq!(retval, 2048);
    assert_eq!(&buf[0..512], &vec![0x10u8; 512][..]);
    assert_eq!(&buf[512..1024], &vec![0x20u8; 512][..]);
    assert_eq!(&buf[1024..2048], &vec![0x10u8; 1024][..]);
}

#[test]
fn parameter_errors_reject_at_admission() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(1, 0);

    // unaligned length
    let r = run_op(&mut bs, Op::write(oid, 0, vec![1; 100]));
    assert_eq!(r.0, -i64::from(libc::EINVAL));
    // only the length must be alignment-multiple; an odd offset is fine
    assert_eq!(write(&mut bs, oid, 256, vec![0x61; 512]), 512);
    let (retval, buf) = read(&mut bs, oid, 256, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x61; 512]);
    // write running past the end of the block
    let r = run_op(&mut bs, Op::write(oid, 3584, vec![1; 1024]));
    assert_eq!(r.0, -i64::from(libc::EINVAL));
    // read out of block bounds
    let r = run_op(&mut bs, Op::read(oid, 0, BLOCK + 512));
    assert_eq!(r.0, -i64::from(libc::EINVAL));
}

#[test]
fn readonly_rejects_writes() {
    let disk = make_disk();
    {
        let mut bs = open(disk.path());
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x41; 512]), 512);
        assert_eq!(sync(&mut bs), 0);
        bs.run_until_idle().unwrap();
    }
    let mut opts = options(disk.path());
    opts.insert("readonly".into(), "true".into());
    let mut bs = Blockstore::open(&opts).unwrap();
    let r = run_op(&mut bs, Op::write(Oid::new(1, 0), 0, vec![1; 512]));
    assert_eq!(r.0, -i64::from(libc::EINVAL));
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x41; 512]);
}

#[test]
fn stabilize_verifies_state() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(5, 0);

    assert_eq!(write(&mut bs, oid, 0, vec![1; 512]), 512);
    // not synced yet
    let r = run_op(&mut bs, Op::stable(vec![ObjVer::new(oid, 1)]));
    assert_eq!(r.0, -i64::from(libc::EBUSY));

    assert_eq!(sync(&mut bs), 0);
    let r = run_op(&mut bs, Op::stable(vec![ObjVer::new(oid, 1)]));
    assert_eq!(r.0, 0);

    // unknown object
    let r = run_op(&mut bs, Op::stable(vec![ObjVer::new(Oid::new(99, 0), 1)]));
    assert_eq!(r.0, -i64::from(libc::ENOENT));
}

#[test]
fn rollback_discards_unstable_versions() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    let oid = Oid::new(6, 0);

    assert_eq!(write(&mut bs, oid, 0, vec![0x41; 512]), 512);
    assert_eq!(sync(&mut bs), 0);
    bs.run_until_idle().unwrap();
    assert_eq!(bs.clean_version(oid), Some(1));

    assert_eq!(write(&mut bs, oid, 0, vec![0x42; 512]), 512);
    let r = run_op(&mut bs, Op::rollback(vec![ObjVer::new(oid, 1)]));
    assert_eq!(r.0, 0);
    assert!(bs.dirty_versions(oid).is_empty());

    let (retval, buf) = read(&mut bs, oid, 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x41; 512]);
}

#[test]
fn drain_journal_empties_the_ring() {
    let disk = make_disk();
    let mut bs = open(disk.path());
    for i in 0..8u64 {
        assert_eq!(write(&mut bs, Oid::new(i, 0), 0, vec![i as u8; 512]), 512);
    }
    assert_eq!(sync(&mut bs), 0);
    bs.drain_journal().unwrap();
    assert_eq!(bs.dirty_count(), 0);
}

#[test]
fn reopen_after_flush_serves_from_clean_index() {
    let disk = make_disk();
    {
        let mut bs = open(disk.path());
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x77; 512]), 512);
        assert_eq!(sync(&mut bs), 0);
        bs.run_until_idle().unwrap();
        assert_eq!(bs.clean_version(Oid::new(1, 0)), Some(1));
    }
    let mut bs = open(disk.path());
    assert_eq!(bs.clean_version(Oid::new(1, 0)), Some(1));
    assert!(bs.dirty_versions(Oid::new(1, 0)).is_empty());
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x77; 512]);
}

#[test]
fn no_same_sector_overwrites_mode_round_trips() {
    let disk = make_disk();
    let mut opts = options(disk.path());
    opts.insert("journal_no_same_sector_overwrites".into(), "true".into());
    {
        let mut bs = Blockstore::open(&opts).unwrap();
        // each write and barrier entry lands in a fresh sector
        for i in 0..4u8 {
            assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![i; 512]), 512);
            assert_eq!(sync(&mut bs), 0);
        }
    }
    let mut bs = Blockstore::open(&opts).unwrap();
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![3; 512]);
}

#[test]
fn paged_metadata_mode_round_trips() {
    let disk = make_disk();
    let mut opts = options(disk.path());
    opts.insert("inmemory_metadata".into(), "false".into());
    {
        let mut bs = Blockstore::open(&opts).unwrap();
        assert_eq!(write(&mut bs, Oid::new(1, 0), 0, vec![0x33; 512]), 512);
        assert_eq!(sync(&mut bs), 0);
        bs.run_until_idle().unwrap();
    }
    let mut bs = Blockstore::open(&opts).unwrap();
    let (retval, buf) = read(&mut bs, Oid::new(1, 0), 0, 512);
    assert_eq!(retval, 512);
    assert_eq!(buf, vec![0x33; 512]);
}
