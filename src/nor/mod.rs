//! # NOR translation layer
//!
//! A sector-map translation layer that presents a flat array of
//! fixed-size logical sectors over NOR flash, with wear leveling and
//! atomic update at logical-sector granularity.
//!
//! # How it works
//!
//! Every physical sector (erase unit) starts with a physical-sector
//! header recording its role: *data* sectors hold logical-sector slots,
//! exactly one *work* sector per erase-unit size is the relocation
//! target of garbage collection, and *invalid* sectors await erase.
//! Each slot is a logical-sector header followed by the payload; a write
//! claims a blank slot, programs payload before header, then retires the
//! previous slot. Power loss between the two leaves either the old or
//! the new slot valid, never a torn payload.
//!
//! Garbage collection erases invalid sectors, or relocates the live
//! slots of a stale data sector into the work sector of the same size,
//! after which the roles swap. Wear leveling watches the erase-count
//! spread after destructive operations and periodically rotates
//! long-lived unchanging data onto worn erase units. An optional
//! two-phase erase protocol makes interrupted erases detectable at
//! mount.

pub mod headers;

use crate::storage::bitfield;
use crate::storage::{Error, NorFlash, SectorDevice, SectorUsage};

use self::headers::{
    HeaderLayout, Lsh, PhySectorType, Psh, SlotState, DATA_STAT_ERASABLE, DATA_STAT_VALID,
    ERASE_SIGNATURE_INVALID, ERASE_SIGNATURE_VALID, LOG_SECTOR_ID_BIAS, LOG_SECTOR_ID_INFO,
};

/// Upper bound on the number of physical sectors a device may have.
pub const MAX_PHY_SECTORS: usize = 256;
/// Upper bound on the number of logical sectors an instance presents.
pub const MAX_LOG_SECTORS: usize = 4096;
/// Capacity of the free-sector cache ring.
pub const FREE_CACHE_SIZE: usize = 32;
/// Default threshold for active wear leveling.
pub const DEFAULT_MAX_ERASE_CNT_DIFF: u32 = 5000;

const L2P_BYTES: usize = MAX_LOG_SECTORS * 4;
/// Smallest erase-unit size is 256 bytes; sizes are indexed by
/// `log2(size) - 8`, up to 1 MB.
const SECTOR_SIZE_SHIFT: u32 = 8;
const NUM_SECTOR_SIZES: usize = 13;
const MAX_HEADER_SIZE: usize = 96;
const MAX_LINE_SIZE: u32 = 32;

const PCT_LOG_SECTORS_RESERVED: u32 = 10;
const PSI_INVALID: i32 = -1;
const ERASE_CNT_INVALID: u32 = 0xFFFF_FFFF;
const MAX_ERASE_CNT: u32 = 0xFFF0_0000;

const VERSION: u32 = ((headers::FORMAT_VERSION as u32) << 16) | (0x20 << 8) | 0x1;
/// "FLAS"
const INFO_SIGNATURE: u32 = 0x464C_4153;
const INFO_OFF_SIGNATURE: usize = 0x00;
const INFO_OFF_VERSION: usize = 0x04;
const INFO_OFF_NUM_LOG_SECTORS: usize = 0x08;
const INFO_OFF_BYTES_PER_LOG_SECTOR: usize = 0x10;
const INFO_OFF_ERROR_STATE: usize = 0x14;
const INFO_PAYLOAD_SIZE: usize = 0x20;

const ERROR_STATE_OK: u32 = 0xFFFF_FFFF;
const ERROR_STATE_READONLY: u32 = 0xFFFF_FFFE;

/// Device capacity as presented to the file-system layer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DeviceInfo {
    /// Number of logical sectors.
    pub num_sectors: u32,
    /// Size of one logical sector in bytes.
    pub bytes_per_sector: u32,
}

/// Operation counters, retrievable for diagnostics.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Counters {
    /// Logical sectors read.
    pub read_sector_cnt: u32,
    /// Logical sectors written.
    pub write_sector_cnt: u32,
    /// Physical sectors erased.
    pub erase_cnt: u32,
    /// Logical-sector payloads relocated by garbage collection.
    pub copy_sector_cnt: u32,
}

#[derive(Debug, Default)]
struct FreeSectorCache {
    data: [u32; FREE_CACHE_SIZE],
    rd_pos: usize,
    cnt: usize,
    /// Set once the cache was filled to capacity: a refill scan would
    /// only find the same entries again.
    skip_fill: bool,
}

impl FreeSectorCache {
    fn clear(&mut self) {
        self.data = [0; FREE_CACHE_SIZE];
        self.rd_pos = 0;
        self.cnt = 0;
        self.skip_fill = false;
    }

    fn add(&mut self, off: u32) {
        if self.cnt >= FREE_CACHE_SIZE {
            self.skip_fill = false;
            return;
        }
        let wr = (self.rd_pos + self.cnt) % FREE_CACHE_SIZE;
        self.data[wr] = off;
        self.cnt += 1;
    }

    fn remove(&mut self) -> u32 {
        if self.cnt == 0 {
            return 0;
        }
        let off = self.data[self.rd_pos];
        self.rd_pos = (self.rd_pos + 1) % FREE_CACHE_SIZE;
        self.cnt -= 1;
        if self.cnt == 0 {
            self.skip_fill = false;
        }
        off
    }

    /// Drops every cached entry that falls inside the given range. Used
    /// when a data sector turns into the work sector.
    fn invalidate_range(&mut self, start: u32, end: u32) {
        for entry in self.data.iter_mut() {
            if *entry >= start && *entry < end {
                *entry = 0;
            }
        }
    }
}

/// The NOR translation layer instance.
///
/// Generic over the physical layer. One instance manages one NOR unit.
pub struct NorTl<P: NorFlash> {
    phy: P,
    sector_size: u32,
    num_log_sectors: u32,
    num_phy_sectors: u32,
    num_bits_l2p: u32,
    layout: HeaderLayout,
    l2p: [u8; L2P_BYTES],
    work_index: [i32; NUM_SECTOR_SIZES],
    num_per_size: [u32; NUM_SECTOR_SIZES],
    cache: FreeSectorCache,
    /// Erase-unit size of the last destructive operation; non-zero
    /// schedules a wear-leveling check.
    wl_sector_size: u32,
    off_info_sector: u32,
    has_error: bool,
    is_inited: bool,
    is_mounted: bool,
    mount_failed: bool,
    fail_safe_erase: bool,
    legacy_found: bool,
    max_erase_cnt_diff: u32,
    // Bookkeeping for logical-sector headers found in an inconsistent
    // state during mount.
    off_lsh_invalid: u32,
    lsi_invalid: u32,
    num_lsh_invalid: u32,
    counters: Counters,
}

impl<P: NorFlash> core::fmt::Debug for NorTl<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NorTl")
            .field("num_phy_sectors", &self.num_phy_sectors)
            .field("num_log_sectors", &self.num_log_sectors)
            .field("is_mounted", &self.is_mounted)
            .finish_non_exhaustive()
    }
}

impl<P: NorFlash> NorTl<P> {
    /// Creates an unmounted instance presenting logical sectors of
    /// `sector_size` bytes. Does not touch the device.
    pub fn new(phy: P, sector_size: u32) -> NorTl<P> {
        NorTl {
            phy,
            sector_size,
            num_log_sectors: 0,
            num_phy_sectors: 0,
            num_bits_l2p: 0,
            layout: HeaderLayout { line_size: 1, rewrite: true },
            l2p: [0; L2P_BYTES],
            work_index: [PSI_INVALID; NUM_SECTOR_SIZES],
            num_per_size: [0; NUM_SECTOR_SIZES],
            cache: FreeSectorCache::default(),
            wl_sector_size: 0,
            off_info_sector: 0,
            has_error: false,
            is_inited: false,
            is_mounted: false,
            mount_failed: false,
            fail_safe_erase: false,
            legacy_found: false,
            max_erase_cnt_diff: DEFAULT_MAX_ERASE_CNT_DIFF,
            off_lsh_invalid: 0,
            lsi_invalid: 0,
            num_lsh_invalid: 0,
            counters: Counters::default(),
        }
    }

    /// Sets the active wear-leveling threshold.
    pub fn set_max_erase_cnt_diff(&mut self, diff: u32) {
        self.max_erase_cnt_diff = diff;
    }

    /// Operation counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Identifies the device geometry and derives the layout. Does not
    /// read user data.
    pub fn init_medium(&mut self) -> Result<(), Error> {
        self.init_if_required()
    }

    /// Reports whether the device carries no usable low-level format.
    pub fn requires_format(&mut self) -> Result<bool, Error> {
        self.init_if_required()?;
        if self.is_mounted {
            return Ok(false);
        }
        Ok(self.low_level_mount_if_required().is_err())
    }

    /// Mounts the device, building the sector map from the on-flash
    /// state.
    pub fn mount(&mut self) -> Result<(), Error> {
        self.init_if_required()?;
        self.low_level_mount_if_required()
    }

    /// Forgets the mounted state. The next operation re-mounts.
    pub fn unmount(&mut self) {
        self.is_mounted = false;
        self.mount_failed = false;
        self.is_inited = false;
    }

    /// Device capacity.
    pub fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        self.init_if_required()?;
        Ok(DeviceInfo {
            num_sectors: self.num_log_sectors,
            bytes_per_sector: self.sector_size,
        })
    }

    /// Media-present indicator. Raw flash is soldered down; it is
    /// always present.
    pub fn media_present(&self) -> bool {
        true
    }

    /// Erases every physical sector, assigns one work sector per
    /// erase-unit size and writes the info sector. All logical sectors
    /// read as blank afterwards.
    pub fn format_low_level(&mut self) -> Result<(), Error> {
        self.init_if_required()?;
        self.is_mounted = false;
        self.mount_failed = false;
        self.init_status();
        self.fail_safe_erase = self.phy.can_rewrite();
        let mut psh_template = Psh::blank();
        psh_template.signature = headers::SIGNATURE_CURRENT;
        psh_template.format_version = headers::FORMAT_VERSION;
        psh_template.erase_cnt = 1;
        if self.fail_safe_erase {
            psh_template.fail_safe_erase = 0; // reversed: 0x00 means supported
            psh_template.erase_signature = ERASE_SIGNATURE_VALID;
        }
        for psi in 0..self.num_phy_sectors {
            self.erase_phy_sector_fail_safe(psi, ERASE_CNT_INVALID)?;
            let (_, size) = self.get_sector_info(psi);
            let shift = sector_size_to_index(size).ok_or(Error::InvalidArgument)?;
            let mut psh = psh_template;
            if self.work_index[shift] == PSI_INVALID {
                self.work_index[shift] = psi as i32;
            } else {
                psh.set_sector_type(self.layout.rewrite, PhySectorType::Data);
            }
            self.write_psh(psi, &psh)?;
        }
        self.write_info_sector()?;
        self.init_status();
        self.low_level_mount()
    }

    /// Erases one invalid physical sector or relocates one stale data
    /// sector. Returns whether more clean steps remain.
    pub fn clean_one(&mut self) -> Result<bool, Error> {
        self.mount()?;
        if let Some(psi) = self.find_invalid_sector() {
            self.create_data_sector(psi)?;
        } else if let Some(psi) = self.find_sector_to_clean()? {
            self.clean_phy_sector(psi)?;
        }
        Ok(self.find_invalid_sector().is_some() || self.find_sector_to_clean()?.is_some())
    }

    /// Runs clean steps until no erasable state remains.
    pub fn clean(&mut self) -> Result<(), Error> {
        while self.clean_one()? {}
        Ok(())
    }

    /// Number of clean steps outstanding.
    pub fn clean_count(&mut self) -> Result<u32, Error> {
        self.mount()?;
        let mut count = 0;
        for psi in 0..self.num_phy_sectors {
            let psh = self.read_psh(psi)?;
            match psh.sector_type(self.layout.rewrite) {
                PhySectorType::Invalid if !self.is_work_sector(psi) => count += 1,
                PhySectorType::Data => {
                    if self.contains_erasable(psi)? {
                        count += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(count)
    }

    /// Access to the physical layer.
    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Consumes the instance, returning the physical layer.
    pub fn into_inner(self) -> P {
        self.phy
    }

    // ----------------------------------------------------------------
    // Geometry
    // ----------------------------------------------------------------

    fn init_if_required(&mut self) -> Result<(), Error> {
        if self.is_inited {
            return Ok(());
        }
        let line_size = self.phy.line_size();
        if !line_size.is_power_of_two() || line_size > MAX_LINE_SIZE {
            return Err(Error::InvalidArgument);
        }
        if !self.sector_size.is_power_of_two() || self.sector_size < 128 {
            return Err(Error::InvalidArgument);
        }
        self.layout = HeaderLayout {
            line_size,
            rewrite: self.phy.can_rewrite(),
        };
        let num_phy = self.phy.num_sectors();
        if num_phy < 2 || num_phy as usize > MAX_PHY_SECTORS {
            return Err(Error::InvalidArgument);
        }
        self.num_phy_sectors = num_phy;
        self.num_per_size = [0; NUM_SECTOR_SIZES];
        let mut flash_end = 0u32;
        for psi in 0..num_phy {
            let info = self.phy.sector_info(psi);
            let shift = sector_size_to_index(info.size).ok_or(Error::InvalidArgument)?;
            self.num_per_size[shift] += 1;
            flash_end = flash_end.max(info.off + info.size);
        }
        let num_log = self.calc_num_log_sectors();
        if num_log == 0 || num_log as usize > MAX_LOG_SECTORS {
            return Err(Error::InvalidArgument);
        }
        self.num_log_sectors = num_log;
        self.num_bits_l2p = bitfield::bits_for(flash_end - 1);
        self.is_inited = true;
        Ok(())
    }

    /// Number of logical sectors presented: per erase-unit size, the
    /// slots of all sectors but one (the work sector), minus the
    /// reserved percentage that keeps garbage collection able to run.
    fn calc_num_log_sectors(&self) -> u32 {
        let slot_size = self.layout.lsh_size() + self.sector_size;
        let psh_size = self.layout.psh_size();
        let mut count = 0u32;
        for (shift, &num) in self.num_per_size.iter().enumerate() {
            if num != 0 {
                let size = index_to_sector_size(shift);
                let slots = (size - psh_size) / slot_size;
                count += slots * (num - 1);
            }
        }
        count = (count * (100 - PCT_LOG_SECTORS_RESERVED)) / 100;
        count.saturating_sub(1) // one slot is the info sector
    }

    fn init_status(&mut self) {
        self.work_index = [PSI_INVALID; NUM_SECTOR_SIZES];
        self.cache.clear();
        self.l2p.fill(0);
        self.wl_sector_size = 0;
        self.off_info_sector = 0;
        self.has_error = false;
        self.legacy_found = false;
        self.off_lsh_invalid = 0;
        self.lsi_invalid = 0;
        self.num_lsh_invalid = 0;
    }

    fn get_sector_info(&self, psi: u32) -> (u32, u32) {
        let info = self.phy.sector_info(psi);
        (info.off, info.size)
    }

    fn find_phy_sector(&self, off: u32) -> Option<u32> {
        for psi in 0..self.num_phy_sectors {
            let (start, size) = self.get_sector_info(psi);
            if off >= start && off < start + size {
                return Some(psi);
            }
        }
        None
    }

    fn is_work_sector(&self, psi: u32) -> bool {
        self.work_index.contains(&(psi as i32))
    }

    fn work_sector_for_size(&self, size: u32) -> Option<u32> {
        let shift = sector_size_to_index(size)?;
        let idx = self.work_index[shift];
        if idx == PSI_INVALID { None } else { Some(idx as u32) }
    }

    // ----------------------------------------------------------------
    // L2P table
    // ----------------------------------------------------------------

    /// Updates the mapping of a logical sector, returning the previous
    /// slot offset.
    fn l2p_write(&mut self, lsi: u32, off: u32) -> u32 {
        let prev = bitfield::read_entry(&self.l2p, lsi, self.num_bits_l2p);
        bitfield::write_entry(&mut self.l2p, lsi, self.num_bits_l2p, off);
        prev
    }

    fn find_log_sector(&self, lsi: u32) -> u32 {
        bitfield::read_entry(&self.l2p, lsi, self.num_bits_l2p)
    }

    // ----------------------------------------------------------------
    // Header access
    // ----------------------------------------------------------------

    fn read_psh(&mut self, psi: u32) -> Result<Psh, Error> {
        let (off, _) = self.get_sector_info(psi);
        let mut raw = [0xFFu8; MAX_HEADER_SIZE];
        let n = self.layout.psh_size() as usize;
        self.phy.read(off, &mut raw[..n])?;
        Ok(self.layout.decode_psh(&raw))
    }

    /// Writes a full physical-sector header. On write-once devices the
    /// role lines are programmed only when set, so each line is still
    /// programmed at most once per erase.
    fn write_psh(&mut self, psi: u32, psh: &Psh) -> Result<(), Error> {
        let (off, _) = self.get_sector_info(psi);
        let mut raw = [0xFFu8; MAX_HEADER_SIZE];
        self.layout.encode_psh(psh, &mut raw);
        let base = self.layout.psh_off_is_work() as usize;
        self.phy.program(off, &raw[..base.min(self.layout.psh_size() as usize)])?;
        if !self.layout.rewrite {
            let line = self.layout.line_size as usize;
            if psh.is_work != 0xFF {
                let o = self.layout.psh_off_is_work() as usize;
                self.phy.program(off + o as u32, &raw[o..o + line])?;
            }
            if psh.is_valid != 0xFF {
                let o = self.layout.psh_off_is_valid() as usize;
                self.phy.program(off + o as u32, &raw[o..o + line])?;
            }
        }
        Ok(())
    }

    fn set_phy_sector_type(&mut self, psi: u32, t: PhySectorType) -> Result<(), Error> {
        let (off, _) = self.get_sector_info(psi);
        let mut psh = self.read_psh(psi)?;
        if psh.sector_type(self.layout.rewrite) == t {
            return Ok(());
        }
        psh.set_sector_type(self.layout.rewrite, t);
        if self.layout.rewrite {
            let mut raw = [0xFFu8; MAX_HEADER_SIZE];
            self.layout.encode_psh(&psh, &mut raw);
            self.phy.program(off, &raw[..self.layout.psh_off_is_work() as usize])
        } else {
            let line = self.layout.line_size;
            let o = match t {
                PhySectorType::Data => self.layout.psh_off_is_work(),
                PhySectorType::Invalid => self.layout.psh_off_is_valid(),
                PhySectorType::Work => return Err(Error::InvalidArgument),
            };
            let zeros = [0u8; MAX_LINE_SIZE as usize];
            self.phy.program(off + o, &zeros[..line as usize])
        }
    }

    fn invalidate_phy_sector(&mut self, psi: u32) -> Result<(), Error> {
        self.set_phy_sector_type(psi, PhySectorType::Invalid)
    }

    fn mark_phy_sector_as_data(&mut self, psi: u32) -> Result<(), Error> {
        self.set_phy_sector_type(psi, PhySectorType::Data)
    }

    /// Invalidates a physical sector found in a suspicious state; if
    /// even that fails, erases it outright so the space stays usable.
    fn invalidate_recover_phy_sector(&mut self, psi: u32) {
        if self.invalidate_phy_sector(psi).is_err() {
            let _ = self.erase_phy_sector_fail_safe(psi, ERASE_CNT_INVALID);
        }
    }

    fn read_lsh(&mut self, off: u32) -> Result<Lsh, Error> {
        let mut raw = [0xFFu8; MAX_HEADER_SIZE];
        let n = self.layout.lsh_size() as usize;
        self.phy.read(off, &mut raw[..n])?;
        Ok(self.layout.decode_lsh(&raw))
    }

    fn write_lsh(&mut self, off: u32, lsh: &Lsh) -> Result<(), Error> {
        let mut raw = [0xFFu8; MAX_HEADER_SIZE];
        self.layout.encode_lsh(lsh, &mut raw);
        let base = self.layout.lsh_off_is_erasable() as usize;
        self.phy.program(off, &raw[..base.min(self.layout.lsh_size() as usize)])?;
        if !self.layout.rewrite && lsh.is_erasable != 0xFF {
            let line = self.layout.line_size as usize;
            let o = self.layout.lsh_off_is_erasable() as usize;
            self.phy.program(off + o as u32, &raw[o..o + line])?;
        }
        Ok(())
    }

    /// Marks a slot as holding the current payload of a logical sector.
    fn write_log_sector_info(&mut self, off: u32, id: u32) -> Result<(), Error> {
        let mut lsh = Lsh::blank();
        lsh.id = if id < self.num_log_sectors {
            id + LOG_SECTOR_ID_BIAS
        } else {
            id // special ids such as the info sector
        };
        lsh.data_stat = DATA_STAT_VALID;
        self.write_lsh(off, &lsh)
    }

    /// Marks a slot erasable.
    fn mark_log_sector_invalid(&mut self, off: u32) -> Result<(), Error> {
        let cur = self.read_lsh(off)?;
        if self.layout.rewrite {
            if cur.id == 0 && cur.data_stat == DATA_STAT_ERASABLE {
                return Ok(());
            }
            let lsh = Lsh { id: 0, data_stat: DATA_STAT_ERASABLE, is_erasable: 0xFF };
            self.write_lsh(off, &lsh)
        } else {
            if cur.is_erasable == 0 {
                return Ok(());
            }
            let o = self.layout.lsh_off_is_erasable();
            let zeros = [0u8; MAX_LINE_SIZE as usize];
            self.phy.program(off + o, &zeros[..self.layout.line_size as usize])
        }
    }

    /// Classifies the slot at `off`. The physical-sector signature only
    /// matters on devices where legacy sectors were found.
    fn classify_slot(&mut self, off: u32) -> Result<(SlotState, bool), Error> {
        let legacy = if self.legacy_found {
            match self.find_phy_sector(off) {
                Some(psi) => self.read_psh(psi)?.signature == headers::SIGNATURE_LEGACY,
                None => false,
            }
        } else {
            false
        };
        let lsh = self.read_lsh(off)?;
        Ok(self.layout.classify_slot(&lsh, legacy, self.num_log_sectors))
    }

    // ----------------------------------------------------------------
    // Erase
    // ----------------------------------------------------------------

    fn erase_phy_sector(&mut self, psi: u32) -> Result<(), Error> {
        self.phy.erase_sector(psi)?;
        self.counters.erase_cnt += 1;
        Ok(())
    }

    /// Erases a physical sector with the two-phase protocol: invalidate
    /// the erase-completion marker, erase, store the new erase count,
    /// then write the marker. A sector whose marker is invalid at mount
    /// is known to carry an interrupted erase.
    fn erase_phy_sector_fail_safe(&mut self, psi: u32, erase_cnt_init: u32) -> Result<(), Error> {
        let (off, _) = self.get_sector_info(psi);
        if self.fail_safe_erase {
            let psh = self.read_psh(psi)?;
            // Only invalidate a valid marker; programming a partially
            // erased header may fail on some devices.
            if psh.erase_signature == ERASE_SIGNATURE_VALID {
                let sig = ERASE_SIGNATURE_INVALID.to_le_bytes();
                self.phy.program(off + 8, &sig)?;
            }
        }
        self.erase_phy_sector(psi)?;
        if self.fail_safe_erase {
            let mut psh = Psh::blank();
            psh.erase_cnt = erase_cnt_init;
            psh.erase_signature = ERASE_SIGNATURE_VALID;
            let mut raw = [0xFFu8; MAX_HEADER_SIZE];
            self.layout.encode_psh(&psh, &mut raw);
            self.phy.program(off + 4, &raw[4..12])?;
        }
        Ok(())
    }

    fn get_max_erase_cnt(&mut self, size: u32) -> u32 {
        let mut max = 0;
        for psi in 0..self.num_phy_sectors {
            let (_, s) = self.get_sector_info(psi);
            if s == size {
                if let Ok(psh) = self.read_psh(psi) {
                    if psh.erase_cnt != ERASE_CNT_INVALID && psh.erase_cnt > max {
                        max = psh.erase_cnt;
                    }
                }
            }
        }
        max
    }

    // ----------------------------------------------------------------
    // Free-slot management
    // ----------------------------------------------------------------

    /// Whether a whole slot (header and payload) reads as erased.
    fn is_log_sector_blank(&mut self, off: u32) -> Result<bool, Error> {
        let total = self.layout.lsh_size() + self.sector_size;
        let mut buf = [0u8; 32];
        let mut pos = 0;
        while pos < total {
            let n = (total - pos).min(32) as usize;
            self.phy.read(off + pos, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            pos += n as u32;
        }
        Ok(true)
    }

    /// Scans data sectors for blank slots until the cache is full.
    fn fill_free_sector_cache(&mut self) -> Result<usize, Error> {
        if self.cache.skip_fill {
            return Ok(0);
        }
        let slot_size = self.layout.lsh_size() + self.sector_size;
        let psh_size = self.layout.psh_size();
        for psi in 0..self.num_phy_sectors {
            let (start, size) = self.get_sector_info(psi);
            let psh = self.read_psh(psi)?;
            if psh.sector_type(self.layout.rewrite) != PhySectorType::Data
                || self.is_work_sector(psi)
            {
                continue;
            }
            // Legacy sectors predate the fail-safe invalidation scheme;
            // fresh payloads never go there.
            if psh.signature == headers::SIGNATURE_LEGACY {
                continue;
            }
            let end = start + size;
            let mut off = start + psh_size;
            while off + slot_size <= end {
                let (state, _) = self.classify_slot(off)?;
                if state == SlotState::Blank {
                    self.cache.add(off);
                    if self.cache.cnt >= FREE_CACHE_SIZE {
                        self.cache.skip_fill = false;
                        return Ok(self.cache.cnt);
                    }
                }
                off += slot_size;
            }
        }
        if self.cache.cnt != 0 {
            self.cache.skip_fill = true;
        }
        Ok(self.cache.cnt)
    }

    fn find_invalid_sector(&mut self) -> Option<u32> {
        for psi in 0..self.num_phy_sectors {
            if self.is_work_sector(psi) {
                continue;
            }
            if let Ok(psh) = self.read_psh(psi) {
                if psh.sector_type(self.layout.rewrite) == PhySectorType::Invalid {
                    return Some(psi);
                }
            }
        }
        None
    }

    fn contains_erasable(&mut self, psi: u32) -> Result<bool, Error> {
        let (start, size) = self.get_sector_info(psi);
        let slot_size = self.layout.lsh_size() + self.sector_size;
        let end = start + size;
        let mut off = start + self.layout.psh_size();
        while off + slot_size <= end {
            let (state, _) = self.classify_slot(off)?;
            if state == SlotState::Erasable {
                return Ok(true);
            }
            off += slot_size;
        }
        Ok(false)
    }

    fn find_clearable_sector(&mut self) -> Result<Option<u32>, Error> {
        for psi in 0..self.num_phy_sectors {
            if self.is_work_sector(psi) {
                continue;
            }
            let psh = self.read_psh(psi)?;
            if psh.sector_type(self.layout.rewrite) != PhySectorType::Data {
                continue;
            }
            if self.contains_erasable(psi)? {
                return Ok(Some(psi));
            }
        }
        Ok(None)
    }

    /// A data sector is worth cleaning proactively only when it has
    /// erasable slots and no blank ones left.
    fn find_sector_to_clean(&mut self) -> Result<Option<u32>, Error> {
        let slot_size = self.layout.lsh_size() + self.sector_size;
        'sectors: for psi in 0..self.num_phy_sectors {
            if self.is_work_sector(psi) {
                continue;
            }
            let psh = self.read_psh(psi)?;
            if psh.sector_type(self.layout.rewrite) != PhySectorType::Data {
                continue;
            }
            let (start, size) = self.get_sector_info(psi);
            let end = start + size;
            let mut off = start + self.layout.psh_size();
            let mut num_erasable = 0;
            while off + slot_size <= end {
                let (state, _) = self.classify_slot(off)?;
                match state {
                    SlotState::Blank => continue 'sectors,
                    SlotState::Erasable => num_erasable += 1,
                    _ => {}
                }
                off += slot_size;
            }
            if num_erasable != 0 {
                return Ok(Some(psi));
            }
        }
        Ok(None)
    }

    /// Erases an invalid physical sector and turns it into an (empty)
    /// data sector, creating one physical sector's worth of blank
    /// slots.
    fn create_data_sector(&mut self, psi: u32) -> Result<(), Error> {
        let (_, size) = self.get_sector_info(psi);
        let old = self.read_psh(psi)?;
        self.erase_phy_sector_fail_safe(psi, ERASE_CNT_INVALID)?;
        let mut erase_cnt = old.erase_cnt;
        if erase_cnt == ERASE_CNT_INVALID || erase_cnt >= MAX_ERASE_CNT {
            erase_cnt = self.get_max_erase_cnt(size);
        }
        erase_cnt = erase_cnt.wrapping_add(1);
        let mut psh = Psh::blank();
        psh.signature = headers::SIGNATURE_CURRENT;
        psh.format_version = headers::FORMAT_VERSION;
        psh.erase_cnt = erase_cnt;
        if self.fail_safe_erase {
            psh.fail_safe_erase = 0;
            psh.erase_signature = ERASE_SIGNATURE_VALID;
        }
        psh.set_sector_type(self.layout.rewrite, PhySectorType::Data);
        self.write_psh(psi, &psh)?;
        self.wl_sector_size = size;
        if self.cache.cnt == 0 {
            self.fill_free_sector_cache()?;
        }
        Ok(())
    }

    /// Binds a physical sector as the work sector for its size and
    /// flushes any cached free slots that pointed into it.
    fn change_work_sector(&mut self, psi: u32) {
        let (start, size) = self.get_sector_info(psi);
        if let Some(shift) = sector_size_to_index(size) {
            self.work_index[shift] = psi as i32;
            self.cache.invalidate_range(start, start + size);
        }
    }

    /// Relocates the live slots of `src` into `dst` (the work sector of
    /// the same size), then swaps the roles: `dst` becomes a data
    /// sector, `src` is invalidated and becomes the new work sector.
    fn copy_data_sector(&mut self, dst: u32, src: u32) -> Result<(), Error> {
        let (dst_start, dst_size) = self.get_sector_info(dst);
        let (src_start, src_size) = self.get_sector_info(src);
        let dst_psh = self.read_psh(dst)?;
        let mut erase_cnt = dst_psh.erase_cnt;
        if erase_cnt == ERASE_CNT_INVALID || erase_cnt >= MAX_ERASE_CNT {
            erase_cnt = self.get_max_erase_cnt(src_size);
        } else {
            erase_cnt += 1;
        }
        self.erase_phy_sector_fail_safe(dst, erase_cnt)?;
        let mut psh = Psh::blank();
        psh.signature = headers::SIGNATURE_CURRENT;
        psh.format_version = headers::FORMAT_VERSION;
        psh.erase_cnt = erase_cnt;
        if self.fail_safe_erase {
            psh.fail_safe_erase = 0;
            psh.erase_signature = ERASE_SIGNATURE_VALID;
        }
        self.write_psh(dst, &psh)?;
        let slot_size = self.layout.lsh_size() + self.sector_size;
        let lsh_size = self.layout.lsh_size();
        // The next destructive operation on this size class should
        // check the wear spread.
        self.wl_sector_size = dst_size;
        let mut src_off = src_start + self.layout.psh_size();
        let mut dst_off = dst_start + self.layout.psh_size();
        while src_off + slot_size <= src_start + src_size {
            let (state, _) = self.classify_slot(src_off)?;
            match state {
                SlotState::Valid(lsi) => {
                    self.copy_sector_payload(dst_off + lsh_size, src_off + lsh_size)?;
                    self.write_log_sector_info(dst_off, lsi)?;
                    self.l2p_write(lsi, dst_off);
                }
                SlotState::Info => {
                    self.copy_sector_payload(dst_off + lsh_size, src_off + lsh_size)?;
                    self.write_log_sector_info(dst_off, LOG_SECTOR_ID_INFO)?;
                    self.off_info_sector = dst_off;
                }
                _ => {
                    self.cache.add(dst_off);
                }
            }
            src_off += slot_size;
            dst_off += slot_size;
        }
        // Role swap. If power is lost after the destination is marked
        // valid but before the source is invalidated, two sectors carry
        // the same logical sectors; mount keeps the first and retires
        // the duplicates.
        self.mark_phy_sector_as_data(dst)?;
        self.invalidate_phy_sector(src)?;
        self.change_work_sector(src);
        Ok(())
    }

    /// Copies one payload area in small chunks to keep the stack load
    /// low.
    fn copy_sector_payload(&mut self, dst: u32, src: u32) -> Result<(), Error> {
        let mut buf = [0u8; 128];
        let mut copied = 0;
        while copied < self.sector_size {
            let n = (self.sector_size - copied).min(128) as usize;
            self.phy.read(src + copied, &mut buf[..n])?;
            self.phy.program(dst + copied, &buf[..n])?;
            copied += n as u32;
        }
        self.counters.copy_sector_cnt += 1;
        Ok(())
    }

    fn clean_phy_sector(&mut self, src: u32) -> Result<(), Error> {
        let (_, size) = self.get_sector_info(src);
        let dst = self.work_sector_for_size(size).ok_or(Error::Corruption)?;
        if let Some(shift) = sector_size_to_index(size) {
            self.work_index[shift] = PSI_INVALID;
        }
        self.copy_data_sector(dst, src)
    }

    /// Produces free slots: erase an invalid sector when one exists,
    /// otherwise relocate a stale data sector into the work sector.
    fn make_clean_sector(&mut self) -> Result<(), Error> {
        if let Some(psi) = self.find_invalid_sector() {
            return self.create_data_sector(psi);
        }
        let Some(src) = self.find_clearable_sector()? else {
            return Err(Error::OutOfSpace);
        };
        self.clean_phy_sector(src)
    }

    /// Pops a verified-blank slot, refilling the cache and running
    /// garbage collection as needed.
    fn find_free_log_sector(&mut self) -> Result<u32, Error> {
        loop {
            if self.cache.cnt == 0 {
                if self.fill_free_sector_cache()? == 0 {
                    self.make_clean_sector()?;
                    if self.cache.cnt == 0 && self.fill_free_sector_cache()? == 0 {
                        return Err(Error::OutOfSpace);
                    }
                }
            }
            let off = self.cache.remove();
            if off == 0 {
                continue;
            }
            if self.is_log_sector_blank(off)? {
                return Ok(off);
            }
            // The header still reads blank but the payload does not: a
            // write was interrupted here. Retire the slot so we do not
            // run into it again.
            self.mark_log_sector_invalid(off)?;
        }
    }

    // ----------------------------------------------------------------
    // Wear leveling
    // ----------------------------------------------------------------

    /// After a destructive operation, rotates the least-worn data
    /// sector of the affected size into the work sector when the erase
    /// count spread exceeds the threshold.
    fn wear_level(&mut self) -> Result<(), Error> {
        if self.wl_sector_size == 0 {
            return Ok(());
        }
        let size = self.wl_sector_size;
        let mut min_cnt = ERASE_CNT_INVALID;
        let mut min_psi = None;
        for psi in 0..self.num_phy_sectors {
            let (_, s) = self.get_sector_info(psi);
            if s != size || self.is_work_sector(psi) {
                continue;
            }
            let psh = self.read_psh(psi)?;
            if psh.sector_type(self.layout.rewrite) == PhySectorType::Data
                && psh.erase_cnt < min_cnt
            {
                min_cnt = psh.erase_cnt;
                min_psi = Some(psi);
            }
        }
        if let Some(min_psi) = min_psi {
            if let Some(work) = self.work_sector_for_size(size) {
                let work_cnt = self.read_psh(work)?.erase_cnt;
                if work_cnt != ERASE_CNT_INVALID
                    && work_cnt > min_cnt.saturating_add(self.max_erase_cnt_diff)
                {
                    if let Some(shift) = sector_size_to_index(size) {
                        self.work_index[shift] = PSI_INVALID;
                    }
                    self.copy_data_sector(work, min_psi)?;
                }
            }
        }
        self.wl_sector_size = 0;
        Ok(())
    }

    // ----------------------------------------------------------------
    // Info sector and error state
    // ----------------------------------------------------------------

    fn write_info_sector(&mut self) -> Result<(), Error> {
        let mut payload = [0u8; INFO_PAYLOAD_SIZE];
        store_u32_le(&mut payload[INFO_OFF_SIGNATURE..], INFO_SIGNATURE);
        store_u32_le(&mut payload[INFO_OFF_VERSION..], VERSION);
        store_u32_le(&mut payload[INFO_OFF_NUM_LOG_SECTORS..], self.num_log_sectors);
        store_u32_le(&mut payload[INFO_OFF_BYTES_PER_LOG_SECTOR..], self.sector_size);
        store_u32_le(&mut payload[INFO_OFF_ERROR_STATE..], ERROR_STATE_OK);
        let off = self.find_free_log_sector()?;
        let lsh_size = self.layout.lsh_size();
        self.phy.program(off + lsh_size, &payload)?;
        self.write_log_sector_info(off, LOG_SECTOR_ID_INFO)?;
        self.off_info_sector = off;
        Ok(())
    }

    fn check_info_sector(&mut self, off: u32) -> Result<(), Error> {
        let mut payload = [0u8; INFO_PAYLOAD_SIZE];
        let lsh_size = self.layout.lsh_size();
        self.phy.read(off + lsh_size, &mut payload)?;
        if load_u32_le(&payload[INFO_OFF_SIGNATURE..]) != INFO_SIGNATURE {
            return Err(Error::Corruption);
        }
        if load_u32_le(&payload[INFO_OFF_VERSION..]) >> 16 != VERSION >> 16 {
            return Err(Error::Corruption);
        }
        if load_u32_le(&payload[INFO_OFF_NUM_LOG_SECTORS..]) != self.num_log_sectors {
            return Err(Error::Corruption);
        }
        if load_u32_le(&payload[INFO_OFF_BYTES_PER_LOG_SECTOR..]) != self.sector_size {
            return Err(Error::Corruption);
        }
        if load_u32_le(&payload[INFO_OFF_ERROR_STATE..]) == ERROR_STATE_READONLY {
            self.has_error = true;
        }
        Ok(())
    }

    /// Latches a permanent failure: the device becomes read-only and
    /// the state is persisted in the info sector.
    fn set_error(&mut self) {
        if self.has_error {
            return;
        }
        self.has_error = true;
        if self.off_info_sector != 0 {
            let off = self.off_info_sector + self.layout.lsh_size() + INFO_OFF_ERROR_STATE as u32;
            let _ = self.phy.program(off, &ERROR_STATE_READONLY.to_le_bytes());
        }
    }

    // ----------------------------------------------------------------
    // Mount
    // ----------------------------------------------------------------

    fn low_level_mount_if_required(&mut self) -> Result<(), Error> {
        if self.is_mounted {
            return Ok(());
        }
        if self.mount_failed {
            return Err(Error::NotFormatted);
        }
        match self.low_level_mount() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mount_failed = true;
                Err(e)
            }
        }
    }

    fn low_level_mount(&mut self) -> Result<(), Error> {
        self.init_status();
        // Quick survey: count data sectors and detect the fail-safe
        // erase and legacy properties.
        let mut num_data_sectors = 0;
        let mut fail_safe = false;
        let mut legacy_found = false;
        for psi in 0..self.num_phy_sectors {
            let psh = self.read_psh(psi)?;
            if psh.sector_type(self.layout.rewrite) == PhySectorType::Data {
                num_data_sectors += 1;
            }
            if psh.fail_safe_supported() {
                fail_safe = true;
            }
            if psh.signature == headers::SIGNATURE_LEGACY {
                legacy_found = true;
            }
        }
        if num_data_sectors == 0 {
            return Err(Error::NotFormatted);
        }
        self.fail_safe_erase = fail_safe;
        self.legacy_found = legacy_found;
        // Build the sector map, recovering interrupted erases and
        // binding one work sector per erase-unit size on the way.
        for psi in 0..self.num_phy_sectors {
            let mut psh = self.read_psh(psi)?;
            if fail_safe && !psh.erase_completed() {
                // Interrupted erase: finish the job. If the sector no
                // longer erases, retire it; its contents must not be
                // trusted.
                let erase_cnt = psh.erase_cnt;
                if self.erase_phy_sector_fail_safe(psi, erase_cnt).is_err() {
                    let _ = self.invalidate_phy_sector(psi);
                }
                psh = self.read_psh(psi)?;
            }
            if psh.sector_type(self.layout.rewrite) == PhySectorType::Data {
                self.add_phy_sector_data(psi)?;
                continue;
            }
            let (_, size) = self.get_sector_info(psi);
            let shift = sector_size_to_index(size).ok_or(Error::Corruption)?;
            // Only one work sector per size; spares are retired.
            if self.work_index[shift] != PSI_INVALID {
                let prev = self.work_index[shift] as u32;
                self.invalidate_recover_phy_sector(prev);
            }
            self.work_index[shift] = psi as i32;
        }
        // A single slot with a half-written header is patched up; see
        // add_phy_sector_data for the repair rules.
        if self.off_lsh_invalid != 0 && self.num_lsh_invalid == 1 {
            let off = self.off_lsh_invalid;
            self.mark_log_sector_invalid(off)?;
        }
        // Every populated size class needs a work sector.
        for shift in 0..NUM_SECTOR_SIZES {
            if self.num_per_size[shift] != 0 && self.work_index[shift] == PSI_INVALID {
                let mut found = false;
                for psi in 0..self.num_phy_sectors {
                    let (_, size) = self.get_sector_info(psi);
                    if sector_size_to_index(size) == Some(shift) && self.is_phy_sector_free(psi)? {
                        self.invalidate_recover_phy_sector(psi);
                        self.work_index[shift] = psi as i32;
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(Error::Corruption);
                }
            }
        }
        if self.off_info_sector == 0 {
            return Err(Error::NotFormatted);
        }
        let off = self.off_info_sector;
        self.check_info_sector(off)?;
        self.is_mounted = true;
        Ok(())
    }

    /// Whether a data sector contains no valid payload at all, so it
    /// can be repurposed.
    fn is_phy_sector_free(&mut self, psi: u32) -> Result<bool, Error> {
        let psh = self.read_psh(psi)?;
        if psh.sector_type(self.layout.rewrite) != PhySectorType::Data {
            return Ok(false);
        }
        let (start, size) = self.get_sector_info(psi);
        let slot_size = self.layout.lsh_size() + self.sector_size;
        let end = start + size;
        let mut off = start + self.layout.psh_size();
        while off + slot_size <= end {
            match self.classify_slot(off)?.0 {
                SlotState::Valid(_) | SlotState::Info => return Ok(false),
                _ => {}
            }
            off += slot_size;
        }
        Ok(true)
    }

    /// Walks the slots of a data sector, installing valid payloads into
    /// the sector map.
    ///
    /// Duplicate ids lose to the first installed copy and are retired.
    /// Slots with inconsistent headers are counted: a single one is the
    /// trace of one interrupted operation and is repaired after the
    /// scan; two or more mean an older driver generation wrote them,
    /// and every such slot is honored as valid data.
    fn add_phy_sector_data(&mut self, psi: u32) -> Result<(), Error> {
        let (start, size) = self.get_sector_info(psi);
        let slot_size = self.layout.lsh_size() + self.sector_size;
        let end = start + size;
        let mut off = start + self.layout.psh_size();
        while off + slot_size <= end {
            let (state, consistent) = self.classify_slot(off)?;
            match state {
                SlotState::Valid(lsi) => {
                    if !consistent {
                        match self.num_lsh_invalid {
                            0 => {
                                self.off_lsh_invalid = off;
                                self.lsi_invalid = lsi;
                            }
                            1 => {
                                // Second inconsistent header: both (and
                                // any further ones) are valid data.
                                let first_off = self.off_lsh_invalid;
                                let first_lsi = self.lsi_invalid;
                                let prev = self.l2p_write(first_lsi, first_off);
                                if prev != 0 {
                                    self.l2p_write(first_lsi, prev);
                                    self.mark_log_sector_invalid(first_off)?;
                                } else {
                                    self.write_log_sector_info(first_off, first_lsi)?;
                                }
                                self.write_log_sector_info(off, lsi)?;
                                let prev = self.l2p_write(lsi, off);
                                if prev != 0 {
                                    self.l2p_write(lsi, prev);
                                    self.mark_log_sector_invalid(off)?;
                                }
                            }
                            _ => {
                                self.write_log_sector_info(off, lsi)?;
                                let prev = self.l2p_write(lsi, off);
                                if prev != 0 {
                                    self.l2p_write(lsi, prev);
                                    self.mark_log_sector_invalid(off)?;
                                }
                            }
                        }
                        self.num_lsh_invalid += 1;
                        if self.num_lsh_invalid == 1 {
                            off += slot_size;
                            continue;
                        }
                    } else {
                        let prev = self.l2p_write(lsi, off);
                        if prev != 0 {
                            // A duplicate from an interrupted
                            // relocation; the first copy wins.
                            self.l2p_write(lsi, prev);
                            self.mark_log_sector_invalid(off)?;
                        }
                    }
                }
                SlotState::Info => {
                    if self.off_info_sector != 0 {
                        self.mark_log_sector_invalid(off)?;
                    } else {
                        self.off_info_sector = off;
                    }
                }
                SlotState::Erasable => {
                    if !consistent {
                        self.mark_log_sector_invalid(off)?;
                    }
                }
                SlotState::Blank => {}
            }
            off += slot_size;
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Sector operations
    // ----------------------------------------------------------------

    fn check_sector_range(&self, sector: u32, n: u32) -> Result<(), Error> {
        if n == 0 || sector >= self.num_log_sectors || n > self.num_log_sectors - sector {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn write_one_sector(&mut self, lsi: u32, data: &[u8]) -> Result<(), Error> {
        if self.has_error {
            return Err(Error::ReadOnly);
        }
        match self.write_one_sector_inner(lsi, data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.latch_device_error(e)),
        }
    }

    fn write_one_sector_inner(&mut self, lsi: u32, data: &[u8]) -> Result<(), Error> {
        let off_new = self.find_free_log_sector()?;
        let off_old = self.find_log_sector(lsi);
        let lsh_size = self.layout.lsh_size();
        // Payload first, then the header that makes it current: power
        // loss in between leaves the slot blank-headed and harmless.
        self.phy.program(off_new + lsh_size, &data[..self.sector_size as usize])?;
        self.write_log_sector_info(off_new, lsi)?;
        if off_old != 0 {
            self.mark_log_sector_invalid(off_old)?;
        }
        self.l2p_write(lsi, off_new);
        self.wear_level()
    }

    /// A program or erase failure anywhere on a mutation path is
    /// permanent; latch it so the data that still reads stays readable.
    fn latch_device_error(&mut self, e: Error) -> Error {
        if e == Error::Io {
            self.set_error();
        }
        e
    }

    fn read_one_sector(&mut self, lsi: u32, buf: &mut [u8]) -> Result<(), Error> {
        let bps = self.sector_size as usize;
        let off = self.find_log_sector(lsi);
        if off == 0 {
            buf[..bps].fill(0xFF);
            return Ok(());
        }
        self.phy.read(off + self.layout.lsh_size(), &mut buf[..bps])
    }
}

impl<P: NorFlash> SectorDevice for NorTl<P> {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8], n: u32) -> Result<(), Error> {
        self.mount()?;
        self.check_sector_range(sector, n)?;
        let bps = self.sector_size as usize;
        for i in 0..n {
            let off = i as usize * bps;
            self.read_one_sector(sector + i, &mut buf[off..off + bps])?;
            self.counters.read_sector_cnt += 1;
        }
        Ok(())
    }

    fn write_sectors(&mut self, sector: u32, data: &[u8], n: u32, repeat_same: bool)
    -> Result<(), Error> {
        self.mount()?;
        self.check_sector_range(sector, n)?;
        if self.phy.is_write_protected() {
            return Err(Error::ReadOnly);
        }
        let bps = self.sector_size as usize;
        for i in 0..n {
            let off = if repeat_same { 0 } else { i as usize * bps };
            self.write_one_sector(sector + i, &data[off..off + bps])?;
            self.counters.write_sector_cnt += 1;
        }
        Ok(())
    }

    fn trim_sectors(&mut self, sector: u32, n: u32) -> Result<(), Error> {
        self.mount()?;
        self.check_sector_range(sector, n)?;
        if self.has_error {
            return Err(Error::ReadOnly);
        }
        for i in 0..n {
            let lsi = sector + i;
            let off = self.find_log_sector(lsi);
            if off != 0 {
                if let Err(e) = self.mark_log_sector_invalid(off) {
                    return Err(self.latch_device_error(e));
                }
                self.l2p_write(lsi, 0);
            }
        }
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn num_sectors(&self) -> u32 {
        self.num_log_sectors
    }

    fn sector_usage(&mut self, sector: u32) -> Result<SectorUsage, Error> {
        self.mount()?;
        if sector >= self.num_log_sectors {
            return Err(Error::InvalidArgument);
        }
        if self.find_log_sector(sector) != 0 {
            Ok(SectorUsage::InUse)
        } else {
            Ok(SectorUsage::NotUsed)
        }
    }
}

fn sector_size_to_index(size: u32) -> Option<usize> {
    if !size.is_power_of_two() {
        return None;
    }
    let shift = size.trailing_zeros();
    if shift < SECTOR_SIZE_SHIFT {
        return None;
    }
    let idx = (shift - SECTOR_SIZE_SHIFT) as usize;
    if idx >= NUM_SECTOR_SIZES {
        return None;
    }
    Some(idx)
}

fn index_to_sector_size(idx: usize) -> u32 {
    1 << (idx as u32 + SECTOR_SIZE_SHIFT)
}

fn store_u32_le(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
}

fn load_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_size_index_round_trip() {
        assert_eq!(sector_size_to_index(256), Some(0));
        assert_eq!(sector_size_to_index(4096), Some(4));
        assert_eq!(sector_size_to_index(1 << 20), Some(12));
        assert_eq!(sector_size_to_index(123), None);
        assert_eq!(sector_size_to_index(64), None);
        assert_eq!(index_to_sector_size(4), 4096);
    }

    #[test]
    fn test_free_sector_cache_ring() {
        let mut cache = FreeSectorCache::default();
        for i in 0..FREE_CACHE_SIZE as u32 + 5 {
            cache.add(0x100 + i);
        }
        assert_eq!(cache.cnt, FREE_CACHE_SIZE);
        assert_eq!(cache.remove(), 0x100);
        cache.add(0x900);
        for i in 1..FREE_CACHE_SIZE as u32 {
            assert_eq!(cache.remove(), 0x100 + i);
        }
        assert_eq!(cache.remove(), 0x900);
        assert_eq!(cache.remove(), 0);
    }

    #[test]
    fn test_cache_invalidation_keeps_slots_skippable() {
        let mut cache = FreeSectorCache::default();
        cache.add(0x1000);
        cache.add(0x2000);
        cache.invalidate_range(0x1000, 0x1800);
        assert_eq!(cache.remove(), 0);
        assert_eq!(cache.remove(), 0x2000);
    }
}
