//! Configuration parsing, validation and on-disk layout calculation
//!
//! Options arrive as a string-keyed map. Everything is validated at open;
//! a bad combination refuses to construct the engine rather than surfacing
//! later as a runtime surprise.

use crate::device::MEM_ALIGNMENT;
use crate::error::{EngineError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;
pub const DEFAULT_BITMAP_GRANULARITY: u32 = 4096;
pub const MIN_JOURNAL_SIZE: u64 = 64 * 1024;
/// Journal entries carry a 16-bit size, so a sector cannot exceed this.
pub const MAX_JOURNAL_BLOCK_SIZE: u32 = 64 * 1024;

/// When the hardware is assumed to commit writes immediately, which write
/// kinds skip the explicit sync barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ImmediateCommit {
    #[default]
    None,
    Small,
    All,
}

/// Parsed and validated engine options.
#[derive(Clone, Debug)]
pub struct Config {
    pub data_device: PathBuf,
    pub meta_device: Option<PathBuf>,
    pub journal_device: Option<PathBuf>,

    pub block_size: u32,
    pub disk_alignment: u32,
    pub bitmap_granularity: u32,
    pub journal_block_size: u32,
    pub meta_block_size: u32,

    pub data_offset: u64,
    pub meta_offset: u64,
    pub journal_offset: u64,
    pub cfg_data_size: u64,
    pub cfg_journal_size: u64,
    pub meta_buf_size: u64,

    pub readonly: bool,
    pub disable_data_fsync: bool,
    pub disable_meta_fsync: bool,
    pub disable_journal_fsync: bool,
    pub disable_device_lock: bool,
    pub immediate_commit: ImmediateCommit,
    pub inmemory_metadata: bool,
    pub inmemory_journal: bool,
    pub flush_journal: bool,

    pub min_flusher_count: u32,
    pub max_flusher_count: u32,
    pub max_write_iodepth: u32,

    pub throttle_small_writes: bool,
    pub throttle_target_iops: u64,
    pub throttle_target_mbs: u64,
    pub throttle_target_parallelism: u64,
    pub throttle_threshold_us: u64,

    pub journal_sector_buffer_count: usize,
    pub journal_no_same_sector_overwrites: bool,
}

fn get_bool(map: &BTreeMap<String, String>, key: &str) -> bool {
    matches!(
        map.get(key).map(String::as_str),
        Some("1") | Some("true") | Some("yes")
    )
}

fn get_u64(map: &BTreeMap<String, String>, key: &str) -> Result<u64> {
    match map.get(key) {
        None => Ok(0),
        Some(s) if s.is_empty() => Ok(0),
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| EngineError::config(format!("{key}: not a number: {s:?}"))),
    }
}

fn is_power_of_two(v: u64) -> bool {
    v != 0 && v & (v - 1) == 0
}

impl Config {
    pub fn parse(map: &BTreeMap<String, String>) -> Result<Self> {
        let data_device = map
            .get("data_device")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::config("data_device is required"))?;
        let mut meta_device = map
            .get("meta_device")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let mut journal_device = map
            .get("journal_device")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        // Collapse aliases so "same device spelled twice" behaves like the
        // shared-region configuration.
        if journal_device == meta_device
            || (meta_device.is_none() && journal_device.as_deref() == Some(&data_device))
        {
            journal_device = None;
        }
        if meta_device.as_deref() == Some(&data_device) {
            meta_device = None;
        }

        let mut block_size = get_u64(map, "block_size")? as u32;
        if block_size == 0 {
            block_size = DEFAULT_BLOCK_SIZE;
        }
        if !is_power_of_two(u64::from(block_size))
            || block_size < MIN_BLOCK_SIZE
            || block_size >= MAX_BLOCK_SIZE
        {
            return Err(EngineError::config(format!("bad block size {block_size}")));
        }

        let mut disk_alignment = get_u64(map, "disk_alignment")? as u32;
        if disk_alignment == 0 {
            disk_alignment = 4096;
        } else if disk_alignment as usize % MEM_ALIGNMENT != 0 {
            return Err(EngineError::config(format!(
                "disk_alignment must be a multiple of {MEM_ALIGNMENT}"
            )));
        }

        let mut journal_block_size = get_u64(map, "journal_block_size")? as u32;
        if journal_block_size == 0 {
            journal_block_size = 4096;
        } else if journal_block_size as usize % MEM_ALIGNMENT != 0 {
            return Err(EngineError::config(format!(
                "journal_block_size must be a multiple of {MEM_ALIGNMENT}"
            )));
        }
        if journal_block_size > MAX_JOURNAL_BLOCK_SIZE {
            return Err(EngineError::config(format!(
                "journal_block_size must not exceed {MAX_JOURNAL_BLOCK_SIZE}"
            )));
        }

        let mut meta_block_size = get_u64(map, "meta_block_size")? as u32;
        if meta_block_size == 0 {
            meta_block_size = 4096;
        } else if meta_block_size as usize % MEM_ALIGNMENT != 0 {
            return Err(EngineError::config(format!(
                "meta_block_size must be a multiple of {MEM_ALIGNMENT}"
            )));
        }

        let mut bitmap_granularity = get_u64(map, "bitmap_granularity")? as u32;
        if bitmap_granularity == 0 {
            bitmap_granularity = DEFAULT_BITMAP_GRANULARITY;
        }
        if bitmap_granularity % disk_alignment != 0 {
            return Err(EngineError::config(
                "bitmap_granularity must be a multiple of disk_alignment",
            ));
        }
        if block_size % bitmap_granularity != 0 {
            return Err(EngineError::config(
                "block_size must be a multiple of bitmap_granularity",
            ));
        }

        let data_offset = get_u64(map, "data_offset")?;
        if data_offset % u64::from(disk_alignment) != 0 {
            return Err(EngineError::config(
                "data_offset must be a multiple of disk_alignment",
            ));
        }
        let meta_offset = get_u64(map, "meta_offset")?;
        if meta_offset % u64::from(meta_block_size) != 0 {
            return Err(EngineError::config(
                "meta_offset must be a multiple of meta_block_size",
            ));
        }
        let journal_offset = get_u64(map, "journal_offset")?;
        if journal_offset % u64::from(journal_block_size) != 0 {
            return Err(EngineError::config(
                "journal_offset must be a multiple of journal_block_size",
            ));
        }

        let readonly = get_bool(map, "readonly");
        let disable_data_fsync = get_bool(map, "disable_data_fsync");
        let mut disable_meta_fsync = get_bool(map, "disable_meta_fsync");
        let mut disable_journal_fsync = get_bool(map, "disable_journal_fsync");
        if meta_device.is_none() {
            disable_meta_fsync = disable_data_fsync;
        }
        if journal_device.is_none() {
            disable_journal_fsync = disable_meta_fsync;
        }

        let immediate_commit = match map.get("immediate_commit").map(String::as_str) {
            Some("all") => ImmediateCommit::All,
            Some("small") => ImmediateCommit::Small,
            Some("none") | Some("") | None => ImmediateCommit::None,
            Some(other) => {
                return Err(EngineError::config(format!(
                    "immediate_commit: unknown value {other:?}"
                )))
            }
        };
        if immediate_commit != ImmediateCommit::None && !disable_journal_fsync {
            return Err(EngineError::config(
                "immediate_commit requires disable_journal_fsync",
            ));
        }
        if immediate_commit == ImmediateCommit::All && !disable_data_fsync {
            return Err(EngineError::config(
                "immediate_commit=all requires disable_data_fsync",
            ));
        }

        let flush_journal = get_bool(map, "flush_journal");

        let mut max_flusher_count = get_u64(map, "max_flusher_count")? as u32;
        if max_flusher_count == 0 {
            max_flusher_count = get_u64(map, "flusher_count")? as u32;
        }
        if max_flusher_count == 0 {
            max_flusher_count = 256;
        }
        let mut min_flusher_count = get_u64(map, "min_flusher_count")? as u32;
        if min_flusher_count == 0 || flush_journal {
            min_flusher_count = 1;
        }
        if min_flusher_count > max_flusher_count {
            return Err(EngineError::config(
                "min_flusher_count exceeds max_flusher_count",
            ));
        }
        let mut max_write_iodepth = get_u64(map, "max_write_iodepth")? as u32;
        if max_write_iodepth == 0 {
            max_write_iodepth = 128;
        }

        let mut meta_buf_size = get_u64(map, "meta_buf_size")?;
        if meta_buf_size < 64 * 1024 {
            meta_buf_size = 4 * 1024 * 1024;
        }
        // keep the scan chunk meta-block aligned
        meta_buf_size -= meta_buf_size % u64::from(meta_block_size);

        let mut journal_sector_buffer_count =
            get_u64(map, "journal_sector_buffer_count")? as usize;
        if journal_sector_buffer_count < 2 {
            journal_sector_buffer_count = 32;
        }

        let throttle_small_writes = get_bool(map, "throttle_small_writes");
        let mut throttle_target_iops = get_u64(map, "throttle_target_iops")?;
        if throttle_target_iops == 0 {
            throttle_target_iops = 100;
        }
        let mut throttle_target_mbs = get_u64(map, "throttle_target_mbs")?;
        if throttle_target_mbs == 0 {
            throttle_target_mbs = 100;
        }
        let mut throttle_target_parallelism = get_u64(map, "throttle_target_parallelism")?;
        if throttle_target_parallelism == 0 {
            throttle_target_parallelism = 1;
        }
        let mut throttle_threshold_us = get_u64(map, "throttle_threshold_us")?;
        if throttle_threshold_us == 0 {
            throttle_threshold_us = 50;
        }

        Ok(Self {
            data_device,
            meta_device,
            journal_device,
            block_size,
            disk_alignment,
            bitmap_granularity,
            journal_block_size,
            meta_block_size,
            data_offset,
            meta_offset,
            journal_offset,
            cfg_data_size: get_u64(map, "data_size")?,
            cfg_journal_size: get_u64(map, "journal_size")?,
            meta_buf_size,
            readonly,
            disable_data_fsync,
            disable_meta_fsync,
            disable_journal_fsync,
            disable_device_lock: get_bool(map, "disable_device_lock"),
            immediate_commit,
            inmemory_metadata: map.get("inmemory_metadata").map(String::as_str) != Some("false"),
            inmemory_journal: map.get("inmemory_journal").map(String::as_str) != Some("false"),
            flush_journal,
            min_flusher_count,
            max_flusher_count,
            max_write_iodepth,
            throttle_small_writes,
            throttle_target_iops,
            throttle_target_mbs,
            throttle_target_parallelism,
            throttle_threshold_us,
            journal_sector_buffer_count,
            journal_no_same_sector_overwrites: get_bool(map, "journal_no_same_sector_overwrites"),
        })
    }

    /// Bytes of one sparse bitmap in a clean entry.
    pub fn clean_bitmap_bytes(&self) -> u32 {
        (self.block_size / self.bitmap_granularity).div_ceil(8)
    }

    /// On-disk size of one metadata slot: oid + version + two bitmaps.
    pub fn clean_entry_size(&self) -> u32 {
        24 + 2 * self.clean_bitmap_bytes()
    }

    pub fn meta_device_is_data(&self) -> bool {
        self.meta_device.is_none()
    }

    pub fn journal_device_is_meta(&self) -> bool {
        self.journal_device.is_none()
    }
}

/// Region sizes derived from the configuration and the actual device sizes.
#[derive(Clone, Debug)]
pub struct Layout {
    pub data_len: u64,
    pub block_count: u64,
    pub meta_len: u64,
    pub journal_len: u64,
    pub slots_per_block: u32,
}

impl Layout {
    /// Mirror of the open-time length calculation: carve the three regions
    /// out of the devices, honoring explicit sizes and shared-device
    /// boundaries, then verify nothing overlaps.
    pub fn compute(cfg: &Config, data_size: u64, meta_size: u64, journal_size: u64) -> Result<Self> {
        let meta_is_data = cfg.meta_device_is_data();
        let journal_is_meta = cfg.journal_device_is_meta();
        let journal_is_data = journal_is_meta && meta_is_data;

        if cfg.data_offset >= data_size {
            return Err(EngineError::layout(format!(
                "data_offset exceeds device size {data_size}"
            )));
        }

        // data
        let mut data_len = data_size - cfg.data_offset;
        if meta_is_data && cfg.data_offset < cfg.meta_offset {
            data_len = data_len.min(cfg.meta_offset - cfg.data_offset);
        }
        if journal_is_data && cfg.data_offset < cfg.journal_offset {
            data_len = data_len.min(cfg.journal_offset - cfg.data_offset);
        }
        if cfg.cfg_data_size != 0 {
            if data_len < cfg.cfg_data_size {
                return Err(EngineError::layout(format!(
                    "data area ({data_len} bytes) is less than configured data_size ({})",
                    cfg.cfg_data_size
                )));
            }
            data_len = cfg.cfg_data_size;
        }
        data_len -= data_len % u64::from(cfg.block_size);

        // meta
        let meta_host_size = if meta_is_data { data_size } else { meta_size };
        if cfg.meta_offset >= meta_host_size {
            return Err(EngineError::layout("meta_offset exceeds device size"));
        }
        let mut meta_area = meta_host_size - cfg.meta_offset;
        if meta_is_data && cfg.meta_offset <= cfg.data_offset {
            meta_area = cfg.data_offset - cfg.meta_offset;
        }
        if journal_is_meta && cfg.meta_offset <= cfg.journal_offset {
            meta_area = meta_area.min(cfg.journal_offset - cfg.meta_offset);
        }

        // journal
        let journal_host_size = if journal_is_data {
            data_size
        } else if journal_is_meta {
            meta_size
        } else {
            journal_size
        };
        if cfg.journal_offset >= journal_host_size {
            return Err(EngineError::layout("journal_offset exceeds device size"));
        }
        let mut journal_len = journal_host_size - cfg.journal_offset;
        if journal_is_data && cfg.journal_offset <= cfg.data_offset {
            journal_len = cfg.data_offset - cfg.journal_offset;
        }
        if journal_is_meta && cfg.journal_offset <= cfg.meta_offset {
            journal_len = journal_len.min(cfg.meta_offset - cfg.journal_offset);
        }
        if cfg.cfg_journal_size != 0 {
            if cfg.cfg_journal_size > journal_len {
                return Err(EngineError::layout("requested journal_size is too large"));
            }
            journal_len = cfg.cfg_journal_size;
        }
        journal_len -= journal_len % u64::from(cfg.journal_block_size);
        if journal_len < MIN_JOURNAL_SIZE {
            return Err(EngineError::layout(format!(
                "journal is too small, need at least {MIN_JOURNAL_SIZE} bytes"
            )));
        }

        let entry_size = u64::from(cfg.clean_entry_size());
        let slots_per_block = u64::from(cfg.meta_block_size) / entry_size;
        if slots_per_block == 0 {
            return Err(EngineError::layout(
                "meta_block_size is smaller than one metadata entry",
            ));
        }
        let block_count = data_len / u64::from(cfg.block_size);
        if block_count == 0 {
            return Err(EngineError::layout("data area holds no blocks"));
        }
        let meta_len =
            (1 + block_count.div_ceil(slots_per_block)) * u64::from(cfg.meta_block_size);
        if meta_area < meta_len {
            return Err(EngineError::layout(format!(
                "metadata area is too small, need at least {meta_len} bytes"
            )));
        }

        let layout = Self {
            data_len,
            block_count,
            meta_len,
            journal_len,
            slots_per_block: slots_per_block as u32,
        };
        layout.check_overlap(cfg)?;
        Ok(layout)
    }

    /// Pairwise overlap check for regions sharing a device.
    fn check_overlap(&self, cfg: &Config) -> Result<()> {
        let overlap = |a: (u64, u64), b: (u64, u64)| a.0 < b.0 + b.1 && b.0 < a.0 + a.1;
        let data = (cfg.data_offset, self.data_len);
        let meta = (cfg.meta_offset, self.meta_len);
        let journal = (cfg.journal_offset, self.journal_len);
        let meta_is_data = cfg.meta_device_is_data();
        let journal_is_meta = cfg.journal_device_is_meta();
        let journal_is_data = journal_is_meta && meta_is_data;
        if meta_is_data && overlap(data, meta) {
            return Err(EngineError::layout("data and metadata regions overlap"));
        }
        if journal_is_data && overlap(data, journal) {
            return Err(EngineError::layout("data and journal regions overlap"));
        }
        if journal_is_meta && overlap(meta, journal) {
            return Err(EngineError::layout("metadata and journal regions overlap"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("data_device".into(), "/dev/null-data".into());
        m
    }

    #[test]
    fn defaults() {
        let cfg = Config::parse(&base_map()).unwrap();
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.disk_alignment, 4096);
        assert_eq!(cfg.journal_block_size, 4096);
        assert!(cfg.inmemory_metadata);
        assert!(cfg.inmemory_journal);
        assert_eq!(cfg.max_flusher_count, 256);
        assert_eq!(cfg.min_flusher_count, 1);
        assert_eq!(cfg.journal_sector_buffer_count, 32);
    }

    #[test]
    fn rejects_bad_block_size() {
        let mut m = base_map();
        m.insert("block_size".into(), "3000".into());
        assert!(Config::parse(&m).is_err());
        m.insert("block_size".into(), "1024".into());
        assert!(Config::parse(&m).is_err());
    }

    #[test]
    fn rejects_granularity_not_dividing_block() {
        let mut m = base_map();
        m.insert("block_size".into(), "131072".into());
        m.insert("bitmap_granularity".into(), "12288".into());
        assert!(Config::parse(&m).is_err());
    }

    #[test]
    fn immediate_commit_requires_fsync_disables() {
        let mut m = base_map();
        m.insert("immediate_commit".into(), "small".into());
        assert!(Config::parse(&m).is_err());
        m.insert("disable_journal_fsync".into(), "true".into());
        assert!(Config::parse(&m).is_ok());

        m.insert("immediate_commit".into(), "all".into());
        assert!(Config::parse(&m).is_err());
        m.insert("disable_data_fsync".into(), "true".into());
        assert!(Config::parse(&m).is_ok());
    }

    #[test]
    fn bitmap_sizes() {
        let mut m = base_map();
        m.insert("block_size".into(), "4096".into());
        m.insert("bitmap_granularity".into(), "4096".into());
        m.insert("disk_alignment".into(), "512".into());
        let cfg = Config::parse(&m).unwrap();
        assert_eq!(cfg.clean_bitmap_bytes(), 1);
        assert_eq!(cfg.clean_entry_size(), 26);

        m.insert("block_size".into(), "131072".into());
        let cfg = Config::parse(&m).unwrap();
        assert_eq!(cfg.clean_bitmap_bytes(), 4);
    }

    #[test]
    fn layout_shared_device() {
        let mut m = base_map();
        m.insert("block_size".into(), "4096".into());
        m.insert("bitmap_granularity".into(), "4096".into());
        m.insert("disk_alignment".into(), "512".into());
        m.insert("journal_offset".into(), "0".into());
        m.insert("journal_size".into(), "65536".into());
        m.insert("meta_offset".into(), "65536".into());
        m.insert("data_offset".into(), "1048576".into());
        let cfg = Config::parse(&m).unwrap();
        let layout = Layout::compute(&cfg, 8 * 1048576, 0, 0).unwrap();
        assert_eq!(layout.journal_len, 65536);
        assert_eq!(layout.block_count, 7 * 256);
        assert!(layout.meta_len <= 1048576 - 65536);
    }

    #[test]
    fn layout_rejects_overlap() {
        let mut m = base_map();
        m.insert("block_size".into(), "4096".into());
        m.insert("journal_offset".into(), "0".into());
        m.insert("meta_offset".into(), "4096".into());
        m.insert("data_offset".into(), "8192".into());
        let cfg = Config::parse(&m).unwrap();
        // journal runs into meta which runs into data
        assert!(Layout::compute(&cfg, 64 * 1048576, 0, 0).is_err());
    }
}
