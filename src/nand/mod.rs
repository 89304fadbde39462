//! # NAND translation layer
//!
//! A log-structured translation layer that presents a flat array of
//! fixed-size logical sectors over SLC NAND flash. It absorbs the
//! medium's constraints: pages can only be programmed once per erase,
//! erasure works on whole blocks, blocks wear out and develop defects.
//!
//! # How it works
//!
//! Logical sectors are grouped into logical blocks of one erase block
//! each. A committed logical block lives in a *data block*, every sector
//! at its native position. Incoming writes are appended to a *work
//! block* assigned to the written logical block; when the work block
//! fills up (or its descriptor is needed elsewhere) it is *converted*:
//! in place if every sector landed on its native position, otherwise by
//! merging work block and data block into a freshly erased block.
//!
//! Every page carries a Hamming code over each 256-byte sub-block in its
//! spare area; single-bit errors are corrected transparently and
//! suspicious blocks are relocated before they fail. Blocks that fail to
//! program or erase are marked bad and never used again. Erase counts
//! are kept per block; allocation rotates through free blocks (passive
//! wear leveling) and drags long-lived static data onto worn blocks when
//! the spread exceeds a threshold (active wear leveling).
//!
//! The layer is fail-safe: interrupted conversions leave either the old
//! or the new block mapped, never a torn state. During conversion two
//! blocks may transiently carry the same logical block index; mount
//! resolves the conflict by the per-block data count.

pub mod ecc;
pub mod spare;

use crate::storage::bitfield;
use crate::storage::{Error, NandDeviceInfo, NandFlash, SectorDevice, SectorUsage};

use self::spare::{DataStatus, ERASE_CNT_INVALID};

/// Upper bound on the number of physical blocks a device may have.
pub const MAX_PHY_BLOCKS: usize = 2048;
/// Capacity of the work-block descriptor pool.
pub const MAX_WORK_BLOCKS: usize = 10;
/// Largest supported page (and therefore logical-sector) size in bytes.
pub const MAX_SECTOR_SIZE: usize = 2048;
/// Largest supported number of pages (sectors) per block.
pub const MAX_SECTORS_PER_BLOCK: usize = 256;

const MAX_SPARE_SIZE: usize = MAX_SECTOR_SIZE / 32;
const L2P_BYTES: usize = MAX_PHY_BLOCKS * 2;
const WB_BITMAP_BYTES: usize = MAX_SECTORS_PER_BLOCK / 8;
const WB_ASSIGN_BYTES: usize = (MAX_SECTORS_PER_BLOCK * 9).div_ceil(8);

const NUM_WORK_BLOCKS_MIN: u32 = 3;
/// Two blocks are reserved for internal use: one for the format and
/// error information, one for the copy operation.
const NUM_BLOCKS_RESERVED: u32 = 2;
const MIN_BYTES_PER_PAGE: u32 = 512;

const LLFORMAT_VERSION: u32 = 20001;
const SECTOR_INDEX_FORMAT_INFO: u32 = 0;
const SECTOR_INDEX_ERROR_INFO: u32 = 1;

const INFO_OFF_LLFORMAT_VERSION: usize = 0x10;
const INFO_OFF_SECTOR_SIZE: usize = 0x20;
const INFO_OFF_BAD_BLOCK_OFFSET: usize = 0x30;
const INFO_OFF_NUM_LOG_BLOCKS: usize = 0x40;
const INFO_OFF_NUM_WORK_BLOCKS: usize = 0x50;

const ERR_OFF_IS_WRITE_PROTECTED: usize = 0x00;
const ERR_OFF_HAS_FATAL_ERROR: usize = 0x02;
const ERR_OFF_FATAL_ERROR_TYPE: usize = 0x04;
const ERR_OFF_FATAL_ERROR_SECTOR: usize = 0x08;

const BRSI_INVALID: u32 = 0xFFFF;

/// Default threshold for active wear leveling.
pub const DEFAULT_MAX_ERASE_CNT_DIFF: u32 = 5000;
const NUM_READ_RETRIES: u32 = 10;
const NUM_WRITE_RETRIES: u32 = 8;

/// Outcome of a low-level page operation. The numeric codes are what the
/// error-info sector persists.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum OpResult {
    Ok,
    BitCorrected,
    ErrorInEcc,
    Uncorrectable,
    ReadError,
    WriteError,
    OutOfFreeBlocks,
    EraseError,
    Blank,
}

impl OpResult {
    fn code(self) -> u8 {
        match self {
            OpResult::Ok => 0,
            OpResult::BitCorrected => 1,
            OpResult::ErrorInEcc => 2,
            OpResult::Uncorrectable => 3,
            OpResult::ReadError => 4,
            OpResult::WriteError => 5,
            OpResult::OutOfFreeBlocks => 6,
            OpResult::EraseError => 7,
            OpResult::Blank => 0xFF,
        }
    }

    fn is_fatal(self) -> bool {
        matches!(self, OpResult::Uncorrectable | OpResult::ReadError)
    }
}

/// Information handed to the fatal-error callback.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FatalErrorInfo {
    /// Persisted error code identifying the failure kind.
    pub error_type: u8,
    /// Physical sector (page) index where the failure occurred.
    pub error_sector: u32,
}

/// Decision of the fatal-error callback.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorRecovery {
    /// Switch the device permanently to read-only mode and persist the
    /// decision to the error-info sector.
    ReadOnly,
    /// Keep the device writable.
    Continue,
}

/// Callback invoked on an unrecoverable failure.
pub type FatalErrorHandler = fn(&FatalErrorInfo) -> ErrorRecovery;

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
    /// Work blocks converted in place.
    pub convert_in_place_cnt: u32,
    /// Work blocks converted via copy.
    pub convert_via_copy_cnt: u32,
    /// Blocks erased.
    pub erase_cnt: u32,
    /// Single-bit errors corrected.
    pub bit_error_cnt: u32,
    /// Blocks currently marked bad.
    pub num_bad_blocks: u32,
    /// Page reads repeated after a transfer error.
    pub read_retry_cnt: u32,
}

#[derive(Clone, Copy)]
struct WorkBlock {
    lbi: u16,
    pbi: u16,
    /// One bit per physical page position: page has been programmed.
    is_written: [u8; WB_BITMAP_BYTES],
    /// Packed map: logical BRSI -> physical page position. 0 = none
    /// (position 0 only ever holds logical sector 0).
    assign: [u8; WB_ASSIGN_BYTES],
}

impl WorkBlock {
    const fn empty() -> WorkBlock {
        WorkBlock {
            lbi: 0,
            pbi: 0,
            is_written: [0; WB_BITMAP_BYTES],
            assign: [0; WB_ASSIGN_BYTES],
        }
    }

    fn is_sector_written(&self, pos: u32) -> bool {
        self.is_written[(pos >> 3) as usize] & (1 << (pos & 7)) != 0
    }

    fn mark_sector_written(&mut self, pos: u32) {
        self.is_written[(pos >> 3) as usize] |= 1 << (pos & 7);
    }
}

/// The NAND translation layer instance.
///
/// Generic over the physical layer. One instance manages one NAND unit;
/// all tables are sized by the compile-time limits above and the actual
/// geometry reported by the device.
pub struct NandTl<P: NandFlash> {
    phy: P,
    is_inited: bool,
    is_mounted: bool,
    mount_failed: bool,
    is_write_protected: bool,
    has_fatal_error: bool,
    error_type: u8,
    error_sector: u32,
    bad_block_off: u32,
    num_phy_blocks: u32,
    num_log_blocks: u32,
    num_sectors: u32,
    num_work_blocks: u32,
    num_work_blocks_conf: u32,
    bytes_per_sector: u32,
    spare_size: u32,
    spb_shift: u8,
    l2p_bits: u32,
    erase_cnt_max: u32,
    erase_cnt_min: u32,
    num_blocks_erase_cnt_min: u32,
    mru_free_block: u32,
    max_erase_cnt_diff: u32,
    reclaim_driver_bad_blocks: bool,
    free_map: [u8; MAX_PHY_BLOCKS / 8],
    l2p: [u8; L2P_BYTES],
    work_blocks: [WorkBlock; MAX_WORK_BLOCKS],
    /// Descriptor indices in MRU order, most recently used first.
    wb_used: heapless::Vec<u8, MAX_WORK_BLOCKS>,
    wb_free: heapless::Vec<u8, MAX_WORK_BLOCKS>,
    sector_buf: [u8; MAX_SECTOR_SIZE],
    spare_buf: [u8; MAX_SPARE_SIZE],
    on_fatal_error: Option<FatalErrorHandler>,
    counters: Counters,
}

impl<P: NandFlash> core::fmt::Debug for NandTl<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NandTl")
            .field("num_phy_blocks", &self.num_phy_blocks)
            .field("num_log_blocks", &self.num_log_blocks)
            .field("is_mounted", &self.is_mounted)
            .finish_non_exhaustive()
    }
}

impl<P: NandFlash> NandTl<P> {
    /// Creates an unmounted instance. Does not touch the device.
    pub fn new(phy: P) -> NandTl<P> {
        NandTl {
            phy,
            is_inited: false,
            is_mounted: false,
            mount_failed: false,
            is_write_protected: false,
            has_fatal_error: false,
            error_type: 0,
            error_sector: 0,
            bad_block_off: 0,
            num_phy_blocks: 0,
            num_log_blocks: 0,
            num_sectors: 0,
            num_work_blocks: 0,
            num_work_blocks_conf: 0,
            bytes_per_sector: 0,
            spare_size: 0,
            spb_shift: 0,
            l2p_bits: 0,
            erase_cnt_max: 0,
            erase_cnt_min: ERASE_CNT_INVALID,
            num_blocks_erase_cnt_min: 0,
            mru_free_block: 0,
            max_erase_cnt_diff: DEFAULT_MAX_ERASE_CNT_DIFF,
            reclaim_driver_bad_blocks: false,
            free_map: [0; MAX_PHY_BLOCKS / 8],
            l2p: [0; L2P_BYTES],
            work_blocks: [WorkBlock::empty(); MAX_WORK_BLOCKS],
            wb_used: heapless::Vec::new(),
            wb_free: heapless::Vec::new(),
            sector_buf: [0; MAX_SECTOR_SIZE],
            spare_buf: [0; MAX_SPARE_SIZE],
            on_fatal_error: None,
            counters: Counters::default(),
        }
    }

    /// Sets the active wear-leveling threshold. Takes effect on the next
    /// mount.
    pub fn set_max_erase_cnt_diff(&mut self, diff: u32) {
        self.max_erase_cnt_diff = diff;
    }

    /// Configures the number of work blocks used by the next low-level
    /// format. 0 selects a default derived from the device size.
    pub fn set_num_work_blocks(&mut self, n: u32) {
        self.num_work_blocks_conf = n;
    }

    /// Allows the next low-level format to erase blocks that were marked
    /// bad by this driver (as opposed to the manufacturer). Off by
    /// default: a block that failed once is not trusted again.
    pub fn set_reclaim_driver_bad_blocks(&mut self, reclaim: bool) {
        self.reclaim_driver_bad_blocks = reclaim;
    }

    /// Registers the callback consulted on unrecoverable failures.
    pub fn set_on_fatal_error(&mut self, handler: FatalErrorHandler) {
        self.on_fatal_error = Some(handler);
    }

    /// Operation counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The first fatal error recorded on this device, if any.
    pub fn fatal_error_info(&self) -> Option<FatalErrorInfo> {
        if !self.has_fatal_error {
            return None;
        }
        Some(FatalErrorInfo {
            error_type: self.error_type,
            error_sector: self.error_sector,
        })
    }

    /// Whether the device rejects writes.
    pub fn is_write_protected(&self) -> bool {
        self.is_write_protected
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

    /// Mounts the device, building the in-RAM tables from the on-flash
    /// state. Fails with [`Error::NotFormatted`] when no valid format
    /// information is found.
    pub fn mount(&mut self) -> Result<(), Error> {
        self.init_if_required()?;
        self.low_level_mount_if_required()
    }

    /// Forgets the mounted state. The next operation re-mounts.
    pub fn unmount(&mut self) {
        self.is_mounted = false;
        self.mount_failed = false;
        self.is_inited = false;
        self.wb_used.clear();
        self.wb_free.clear();
    }

    /// Erases all usable blocks and writes a fresh format-info sector.
    ///
    /// Blocks marked bad (by the manufacturer or by the driver) are
    /// skipped and counted. All logical sectors read as blank
    /// afterwards.
    pub fn format_low_level(&mut self) -> Result<(), Error> {
        self.init_if_required()?;
        self.is_mounted = false;
        self.mount_failed = false;
        self.counters.num_bad_blocks = 0;
        // Block 0 holds the format information and is required to be good.
        self.erase_block(0).map_err(|_| Error::Io)?;
        for pbi in 1..self.num_phy_blocks {
            if self.is_block_erasable(pbi)? {
                if self.erase_block(pbi).is_err() {
                    self.mark_block_bad(pbi, OpResult::EraseError.code(), 0);
                }
            } else {
                self.counters.num_bad_blocks += 1;
            }
        }
        let bps = self.bytes_per_sector as usize;
        self.sector_buf[..bps].fill(0xFF);
        self.sector_buf[..8].copy_from_slice(&spare::DRIVER_SIGNATURE);
        self.sector_buf[8..16].fill(0);
        store_u32_be(&mut self.sector_buf[INFO_OFF_LLFORMAT_VERSION..], LLFORMAT_VERSION);
        store_u32_be(&mut self.sector_buf[INFO_OFF_SECTOR_SIZE..], self.bytes_per_sector);
        store_u32_be(&mut self.sector_buf[INFO_OFF_BAD_BLOCK_OFFSET..], self.bad_block_off);
        store_u32_be(&mut self.sector_buf[INFO_OFF_NUM_LOG_BLOCKS..], self.num_log_blocks);
        store_u32_be(&mut self.sector_buf[INFO_OFF_NUM_WORK_BLOCKS..], self.num_work_blocks);
        self.clear_spare_buf();
        match self.write_sector_from_buf(SECTOR_INDEX_FORMAT_INFO) {
            OpResult::Ok => Ok(()),
            _ => Err(Error::Io),
        }
    }

    /// Device capacity.
    pub fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        self.init_if_required()?;
        Ok(DeviceInfo {
            num_sectors: self.num_sectors,
            bytes_per_sector: self.bytes_per_sector,
        })
    }

    /// Media-present indicator. Raw flash is soldered down; it is
    /// always present.
    pub fn media_present(&self) -> bool {
        true
    }

    /// Converts one work block into a data block. Returns whether more
    /// clean steps remain.
    pub fn clean_one(&mut self) -> Result<bool, Error> {
        self.mount()?;
        if let Some(&wb) = self.wb_used.first() {
            self.clean_work_block(wb as usize, BRSI_INVALID, None)
                .map_err(|_| Error::Io)?;
        }
        Ok(!self.wb_used.is_empty())
    }

    /// Converts every work block into a data block.
    pub fn clean(&mut self) -> Result<(), Error> {
        self.mount()?;
        while !self.wb_used.is_empty() {
            let wb = self.wb_used[0] as usize;
            self.clean_work_block(wb, BRSI_INVALID, None)
                .map_err(|_| Error::Io)?;
        }
        Ok(())
    }

    /// Number of clean steps required to convert all work blocks.
    pub fn clean_count(&mut self) -> Result<u32, Error> {
        self.mount()?;
        Ok(self.wb_used.len() as u32)
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
        let info: NandDeviceInfo = self.phy.device_info()?;
        let bytes_per_page = info.bytes_per_page();
        if bytes_per_page < MIN_BYTES_PER_PAGE || bytes_per_page as usize > MAX_SECTOR_SIZE {
            return Err(Error::InvalidArgument);
        }
        let num_blocks = info.num_blocks.min(MAX_PHY_BLOCKS as u32);
        if num_blocks < 8 {
            return Err(Error::InvalidArgument);
        }
        let num_work_blocks = if self.num_work_blocks_conf != 0 {
            self.num_work_blocks_conf.min(MAX_WORK_BLOCKS as u32)
        } else {
            (num_blocks >> 7).clamp(NUM_WORK_BLOCKS_MIN, MAX_WORK_BLOCKS as u32)
        };
        let num_log_blocks = calc_num_log_blocks(num_blocks, num_work_blocks)
            .ok_or(Error::InvalidArgument)?;
        self.num_phy_blocks = num_blocks;
        self.num_log_blocks = num_log_blocks;
        self.num_work_blocks = num_work_blocks;
        self.spb_shift = info.ppb_shift;
        self.bytes_per_sector = bytes_per_page;
        self.spare_size = info.bytes_per_spare();
        self.num_sectors = num_log_blocks << self.spb_shift;
        self.l2p_bits = bitfield::bits_for(num_blocks - 1);
        self.bad_block_off = if bytes_per_page > 512 {
            spare::BAD_BLOCK_OFF_LARGE_PAGE
        } else {
            spare::BAD_BLOCK_OFF_SMALL_PAGE
        };
        self.is_inited = true;
        Ok(())
    }

    fn block_to_page(&self, pbi: u32) -> u32 {
        pbi << self.spb_shift
    }

    fn sectors_per_block(&self) -> u32 {
        1 << self.spb_shift
    }

    // ----------------------------------------------------------------
    // L2P table and free map
    // ----------------------------------------------------------------

    fn l2p_read(&self, lbi: u32) -> u32 {
        bitfield::read_entry(&self.l2p, lbi, self.l2p_bits)
    }

    fn l2p_write(&mut self, lbi: u32, pbi: u32) {
        bitfield::write_entry(&mut self.l2p, lbi, self.l2p_bits, pbi);
    }

    fn is_block_free(&self, pbi: u32) -> bool {
        self.free_map[(pbi >> 3) as usize] & (1 << (pbi & 7)) != 0
    }

    fn mark_block_free(&mut self, pbi: u32) {
        self.free_map[(pbi >> 3) as usize] |= 1 << (pbi & 7);
    }

    fn mark_block_allocated(&mut self, pbi: u32) {
        self.free_map[(pbi >> 3) as usize] &= !(1 << (pbi & 7));
    }

    // ----------------------------------------------------------------
    // Spare-area access
    // ----------------------------------------------------------------

    fn clear_spare_buf(&mut self) {
        let n = self.spare_size as usize;
        self.spare_buf[..n].fill(0xFF);
    }

    fn read_spare(&mut self, page: u32) -> Result<(), Error> {
        let n = self.spare_size as usize;
        let (spare, _) = self.spare_buf.split_at_mut(n);
        self.phy.read_page(page, &mut [], 0, spare, 0)
    }

    fn write_spare_from_buf(&mut self, page: u32) -> Result<(), Error> {
        let n = self.spare_size as usize;
        let (spare, _) = self.spare_buf.split_at(n);
        self.phy.write_page(page, &[], 0, spare, 0)
    }

    fn write_spare_byte(&mut self, page: u32, value: u8, off: u32) -> Result<(), Error> {
        self.phy.write_page(page, &[], 0, &[value], off)
    }

    fn read_spare_byte(&mut self, page: u32, off: u32) -> Result<u8, Error> {
        let mut b = [0u8; 1];
        self.phy.read_page(page, &mut [], 0, &mut b, off)?;
        Ok(b[0])
    }

    // ----------------------------------------------------------------
    // Sector I/O with ECC
    // ----------------------------------------------------------------

    /// Reads one page into the sector buffer and applies the ECC,
    /// retrying transfer errors.
    fn read_sector_with_ecc(&mut self, page: u32) -> OpResult {
        let bps = self.bytes_per_sector as usize;
        let spare_size = self.spare_size as usize;
        let mut retries = NUM_READ_RETRIES;
        loop {
            let r = {
                let (data, _) = self.sector_buf.split_at_mut(bps);
                let (sp, _) = self.spare_buf.split_at_mut(spare_size);
                self.phy.read_page(page, data, 0, sp, 0)
            };
            let result = match r {
                Err(_) => OpResult::ReadError,
                Ok(()) => match spare::apply_sector_ecc(
                    &mut self.sector_buf[..bps],
                    &self.spare_buf[..spare_size],
                ) {
                    spare::PageCheck::Blank => return OpResult::Blank,
                    spare::PageCheck::Ok(ecc::EccResult::Ok) => return OpResult::Ok,
                    spare::PageCheck::Ok(ecc::EccResult::Corrected) => {
                        self.counters.bit_error_cnt += 1;
                        return OpResult::BitCorrected;
                    }
                    spare::PageCheck::Ok(_) => OpResult::ErrorInEcc,
                    spare::PageCheck::Failed => OpResult::Uncorrectable,
                },
            };
            if retries == 0 {
                return result;
            }
            retries -= 1;
            self.counters.read_retry_cnt += 1;
        }
    }

    /// Programs the sector buffer and the prepared spare buffer into a
    /// page, computing the ECC on the way out.
    fn write_sector_from_buf(&mut self, page: u32) -> OpResult {
        let bps = self.bytes_per_sector as usize;
        let spare_size = self.spare_size as usize;
        spare::compute_sector_ecc(&self.sector_buf[..bps], &mut self.spare_buf[..spare_size]);
        let (data, _) = self.sector_buf.split_at(bps);
        let (sp, _) = self.spare_buf.split_at(spare_size);
        match self.phy.write_page(page, data, 0, sp, 0) {
            Ok(()) => OpResult::Ok,
            Err(_) => OpResult::WriteError,
        }
    }

    /// Writes external payload into a page with a prepared spare buffer.
    fn write_sector(&mut self, page: u32, data: &[u8]) -> OpResult {
        let bps = self.bytes_per_sector as usize;
        self.sector_buf[..bps].copy_from_slice(&data[..bps]);
        self.write_sector_from_buf(page)
    }

    /// Copies one page, checking the source ECC and regenerating it at
    /// the destination. `brsi` is stored in the destination spare when
    /// given (work-block pages need their position record).
    ///
    /// Invalidated source pages are skipped. Uncorrectable source data
    /// is copied raw so that as much data as possible survives; the
    /// error is still reported.
    fn copy_sector_with_ecc(&mut self, src_page: u32, dst_page: u32, brsi: u32) -> OpResult {
        let src_brsi = src_page & (self.sectors_per_block() - 1);
        let r = self.read_sector_with_ecc(src_page);
        match r {
            OpResult::Blank => return OpResult::Ok,
            OpResult::ReadError => return r,
            _ => {}
        }
        // A page whose payload was invalidated by a trim stays blank at
        // the destination.
        if spare::is_sector_free(&self.spare_buf, src_brsi) {
            return OpResult::Ok;
        }
        let keep = r;
        self.clear_spare_buf();
        if brsi != BRSI_INVALID && brsi != 0 {
            spare::store_brsi(&mut self.spare_buf, brsi as u16);
        }
        match self.write_sector_from_buf(dst_page) {
            OpResult::Ok => match keep {
                OpResult::Ok | OpResult::BitCorrected => OpResult::Ok,
                other => other,
            },
            w => w,
        }
    }

    // ----------------------------------------------------------------
    // Bad blocks
    // ----------------------------------------------------------------

    fn is_block_bad(&mut self, pbi: u32) -> Result<bool, Error> {
        let page = self.block_to_page(pbi);
        let bb_off = self.bad_block_off;
        let b0 = self.read_spare_byte(page, bb_off)?;
        let b1 = self.read_spare_byte(page + 1, bb_off)?;
        Ok(b0 != spare::GOOD_BLOCK_MARKER || b1 != spare::GOOD_BLOCK_MARKER)
    }

    /// Checks whether a block may be erased by the low-level format.
    ///
    /// Bad blocks are off limits, with one exception: when reclaim is
    /// enabled, blocks carrying the driver's own bad-block record may be
    /// returned to service. Manufacturer-marked blocks are never
    /// touched.
    fn is_block_erasable(&mut self, pbi: u32) -> Result<bool, Error> {
        if !self.is_block_bad(pbi)? {
            return Ok(true);
        }
        if !self.reclaim_driver_bad_blocks {
            return Ok(false);
        }
        let page = self.block_to_page(pbi);
        let spare_size = self.spare_size as usize;
        let mut s1 = [0xFFu8; MAX_SPARE_SIZE];
        let mut s2 = [0xFFu8; MAX_SPARE_SIZE];
        self.phy.read_page(page + 1, &mut [], 0, &mut s1[..spare_size], 0)?;
        self.phy.read_page(page + 2, &mut [], 0, &mut s2[..spare_size], 0)?;
        Ok(spare::is_driver_marked_bad(&s1, &s2))
    }

    /// Condemns a block: bad-block marker plus the driver's signature
    /// and failure record on the second and third page.
    fn mark_block_bad(&mut self, pbi: u32, error_type: u8, brsi: u32) {
        self.counters.num_bad_blocks += 1;
        let page = self.block_to_page(pbi);
        let bb_off = self.bad_block_off;
        let _ = self.write_spare_byte(page, spare::BAD_BLOCK_MARKER, bb_off);
        let spare_size = self.spare_size as usize;
        let mut s1 = [0xFFu8; MAX_SPARE_SIZE];
        let mut s2 = [0xFFu8; MAX_SPARE_SIZE];
        spare::encode_bad_block_mark(&mut s1, &mut s2, error_type, brsi as u16);
        let _ = self.phy.write_page(page + 1, &[], 0, &s1[..spare_size], 0);
        let _ = self.phy.write_page(page + 2, &[], 0, &s2[..spare_size], 0);
        self.mark_block_allocated(pbi);
    }

    fn erase_block(&mut self, pbi: u32) -> Result<(), Error> {
        let page = self.block_to_page(pbi);
        self.phy.erase_block(page)?;
        self.counters.erase_cnt += 1;
        Ok(())
    }

    // ----------------------------------------------------------------
    // Block marking
    // ----------------------------------------------------------------

    fn mark_block(&mut self, pbi: u32, lbi: u32, erase_cnt: u32, status_byte: u8) -> Result<(), Error> {
        self.clear_spare_buf();
        let bb_off = self.bad_block_off;
        spare::store_erase_cnt(&mut self.spare_buf, bb_off, erase_cnt);
        spare::store_lbi(&mut self.spare_buf, lbi as u16);
        self.spare_buf[spare::OFF_DATA_STATUS as usize] = status_byte;
        let page = self.block_to_page(pbi);
        self.write_spare_from_buf(page)
    }

    fn mark_as_work_block(&mut self, pbi: u32, lbi: u32, erase_cnt: u32) -> Result<(), Error> {
        self.mark_block(pbi, lbi, erase_cnt, (DataStatus::Work.to_nibble() << 4) | 0xF)
    }

    fn mark_as_data_block(
        &mut self,
        pbi: u32,
        lbi: u32,
        erase_cnt: u32,
        data_cnt: u8,
    ) -> Result<(), Error> {
        self.mark_block(
            pbi,
            lbi,
            erase_cnt,
            (DataStatus::Valid.to_nibble() << 4) | (data_cnt & 0xF),
        )
    }

    /// Marks a block's contents obsolete and returns it to the free
    /// pool. Block 0 stores only management information and is never
    /// freed.
    fn make_block_available(&mut self, pbi: u32, erase_cnt: u32) -> Result<(), Error> {
        if pbi == 0 {
            return Ok(());
        }
        let page = self.block_to_page(pbi);
        let r = self.write_spare_byte(page, DataStatus::Invalid.to_nibble() << 4, spare::OFF_DATA_STATUS);
        self.mark_block_free(pbi);
        if self.num_blocks_erase_cnt_min != 0 && self.erase_cnt_min == erase_cnt {
            self.num_blocks_erase_cnt_min -= 1;
        }
        r
    }

    fn read_erase_cnt(&mut self, pbi: u32) -> u32 {
        let page = self.block_to_page(pbi);
        if self.read_spare(page).is_err() {
            return ERASE_CNT_INVALID;
        }
        spare::load_erase_cnt(&self.spare_buf, self.bad_block_off)
    }

    fn read_status_byte(&mut self, pbi: u32) -> u8 {
        let page = self.block_to_page(pbi);
        self.read_spare_byte(page, spare::OFF_DATA_STATUS).unwrap_or(0xFF)
    }

    // ----------------------------------------------------------------
    // Wear leveling and allocation
    // ----------------------------------------------------------------

    /// Finds the next free block after the rotating cursor and takes it
    /// out of the free pool.
    fn passive_wear_leveling(&mut self) -> Option<(u32, u32)> {
        let mut pbi = self.mru_free_block;
        for _ in 0..self.num_phy_blocks {
            pbi += 1;
            if pbi >= self.num_phy_blocks {
                pbi = 1; // Block 0 holds only management information.
            }
            if self.is_block_free(pbi) {
                let mut erase_cnt = self.read_erase_cnt(pbi);
                if erase_cnt == ERASE_CNT_INVALID {
                    erase_cnt = self.erase_cnt_max;
                }
                self.mark_block_allocated(pbi);
                self.mru_free_block = pbi;
                return Some((pbi, erase_cnt));
            }
        }
        None
    }

    fn count_data_blocks_with_erase_cnt_min(&mut self) -> (u32, u32, u32) {
        let mut min = ERASE_CNT_INVALID;
        let mut count = 0;
        let mut first_pbi = 0;
        for lbi in 0..self.num_log_blocks {
            let pbi = self.l2p_read(lbi);
            if pbi == 0 {
                continue;
            }
            let erase_cnt = self.read_erase_cnt(pbi);
            if erase_cnt == ERASE_CNT_INVALID {
                continue;
            }
            if erase_cnt < min {
                min = erase_cnt;
                count = 1;
                first_pbi = pbi;
            } else if erase_cnt == min {
                count += 1;
            }
        }
        (count, min, first_pbi)
    }

    fn find_data_block_by_erase_cnt(&mut self, erase_cnt: u32) -> u32 {
        for lbi in 0..self.num_log_blocks {
            let pbi = self.l2p_read(lbi);
            if pbi != 0 && self.read_erase_cnt(pbi) == erase_cnt {
                return pbi;
            }
        }
        0
    }

    /// Decides whether allocating a block with `erase_cnt` erases must
    /// drag low-wear data onto it first. Returns the data block to move
    /// and its erase count.
    fn check_active_wear_leveling(&mut self, erase_cnt: u32) -> Option<(u32, u32)> {
        let mut pbi = 0;
        if self.num_blocks_erase_cnt_min == 0 {
            let (count, min, first) = self.count_data_blocks_with_erase_cnt_min();
            if count == 0 {
                return None; // No data blocks yet; the flash is empty.
            }
            self.erase_cnt_min = min;
            self.num_blocks_erase_cnt_min = count;
            pbi = first;
        }
        let min = self.erase_cnt_min;
        if erase_cnt.wrapping_sub(min) < self.max_erase_cnt_diff || erase_cnt < min {
            return None;
        }
        if pbi == 0 {
            pbi = self.find_data_block_by_erase_cnt(min);
            if pbi == 0 {
                return None;
            }
        }
        self.num_blocks_erase_cnt_min -= 1;
        Some((pbi, min))
    }

    /// Copies a data block into `dst`, making the source free. The last
    /// fatal result wins; the copy always runs to the end to recover as
    /// much data as possible.
    fn move_data_block(&mut self, src: u32, dst: u32, erase_cnt: u32) -> (OpResult, u32) {
        let spb = self.sectors_per_block();
        let src_page = self.block_to_page(src);
        let dst_page = self.block_to_page(dst);
        let mut fatal = OpResult::Ok;
        let mut ecc_only = false;
        let mut error_brsi = BRSI_INVALID;
        for i in 0..spb {
            match self.copy_sector_with_ecc(src_page + i, dst_page + i, BRSI_INVALID) {
                OpResult::Ok | OpResult::BitCorrected => {}
                OpResult::ErrorInEcc => {
                    ecc_only = true;
                    error_brsi = i;
                }
                other => {
                    fatal = other;
                    error_brsi = i;
                }
            }
        }
        let mut lbi = 0;
        for l in 0..self.num_log_blocks {
            if self.l2p_read(l) == src {
                lbi = l;
                break;
            }
        }
        let data_cnt = self.read_status_byte(src).wrapping_add(1) & 0xF;
        let _ = self.mark_as_data_block(dst, lbi, erase_cnt, data_cnt);
        // From here two data blocks carry the same LBI until the source
        // is invalidated; mount resolves by data count.
        self.l2p_write(lbi, dst);
        let mut r = OpResult::Ok;
        if ecc_only {
            r = OpResult::ErrorInEcc;
        }
        if fatal != OpResult::Ok {
            r = fatal;
        }
        if r == OpResult::Ok {
            let _ = self.make_block_available(src, erase_cnt);
        }
        (r, error_brsi)
    }

    /// Selects and erases a block to write into, applying passive and,
    /// when the spread demands it, active wear leveling.
    fn alloc_erased_block(&mut self) -> Result<(u32, u32), Error> {
        loop {
            let Some((pbi_alloc, mut alloc_cnt)) = self.passive_wear_leveling() else {
                self.fatal_error(OpResult::OutOfFreeBlocks, 0);
                return Err(Error::OutOfSpace);
            };
            if self.erase_block(pbi_alloc).is_err() {
                self.mark_block_bad(pbi_alloc, OpResult::EraseError.code(), 0);
                continue;
            }
            alloc_cnt = alloc_cnt.wrapping_add(1);
            if alloc_cnt > self.erase_cnt_max {
                self.erase_cnt_max = alloc_cnt;
            }
            let Some((pbi_data, data_erase_cnt)) = self.check_active_wear_leveling(alloc_cnt) else {
                return Ok((pbi_alloc, alloc_cnt));
            };
            // A block whose data never changes has a much lower erase
            // count. Move it onto the worn block so the low-wear block
            // re-enters circulation.
            let (r, error_brsi) = self.move_data_block(pbi_data, pbi_alloc, alloc_cnt);
            match r {
                OpResult::Ok | OpResult::ErrorInEcc => {
                    if r == OpResult::ErrorInEcc {
                        self.mark_block_bad(pbi_data, r.code(), error_brsi);
                    } else {
                        self.mark_block_allocated(pbi_data);
                        if self.erase_block(pbi_data).is_err() {
                            self.mark_block_bad(pbi_data, OpResult::EraseError.code(), 0);
                            continue;
                        }
                        return Ok((pbi_data, data_erase_cnt.wrapping_add(1)));
                    }
                }
                OpResult::Uncorrectable | OpResult::ReadError => {
                    self.mark_block_bad(pbi_data, r.code(), error_brsi);
                    self.fatal_error(r, self.block_to_page(pbi_data) + error_brsi);
                    return Err(Error::Corruption);
                }
                OpResult::WriteError => {
                    self.mark_block_bad(pbi_alloc, r.code(), error_brsi);
                }
                _ => {}
            }
        }
    }

    /// Relocates a data block after a read problem, then condemns the
    /// source.
    fn recover_data_block(&mut self, pbi_data: u32) -> Result<(), Error> {
        let erase_cnt = self.read_erase_cnt(pbi_data);
        let (pbi_alloc, _) = self.alloc_erased_block()?;
        let (r, error_brsi) = self.move_data_block(pbi_data, pbi_alloc, erase_cnt);
        match r {
            OpResult::Ok => Ok(()),
            OpResult::ErrorInEcc | OpResult::Uncorrectable | OpResult::ReadError => {
                self.mark_block_bad(pbi_data, r.code(), error_brsi);
                if r != OpResult::ErrorInEcc {
                    self.fatal_error(r, self.block_to_page(pbi_data) + error_brsi);
                }
                Ok(())
            }
            _ => Err(Error::Io),
        }
    }

    // ----------------------------------------------------------------
    // Work blocks
    // ----------------------------------------------------------------

    fn find_work_block(&self, lbi: u32) -> Option<usize> {
        self.wb_used
            .iter()
            .find(|&&i| self.work_blocks[i as usize].lbi as u32 == lbi)
            .map(|&i| i as usize)
    }

    fn mark_work_block_mru(&mut self, wb: usize) {
        if let Some(pos) = self.wb_used.iter().position(|&i| i as usize == wb) {
            self.wb_used.remove(pos);
        }
        self.wb_used.insert(0, wb as u8).ok();
    }

    fn wb_remove_from_used(&mut self, wb: usize) {
        if let Some(pos) = self.wb_used.iter().position(|&i| i as usize == wb) {
            self.wb_used.remove(pos);
        }
        self.wb_free.push(wb as u8).ok();
    }

    fn wb_read_assignment(&self, wb: usize, log_brsi: u32) -> u32 {
        bitfield::read_entry(&self.work_blocks[wb].assign, log_brsi, self.spb_shift as u32 + 1)
    }

    fn wb_write_assignment(&mut self, wb: usize, log_brsi: u32, phy_pos: u32) {
        let bits = self.spb_shift as u32 + 1;
        bitfield::write_entry(&mut self.work_blocks[wb].assign, log_brsi, bits, phy_pos);
    }

    /// Maps a logical position inside a work block to the physical page
    /// position currently holding its payload.
    fn wb_log_to_phy(&mut self, wb: usize, log_brsi: u32) -> u32 {
        if log_brsi != 0 {
            // Position 0 is never assigned to a logical sector other
            // than 0, so 0 doubles as "not present".
            let phy = self.wb_read_assignment(wb, log_brsi);
            if phy == 0 {
                return BRSI_INVALID;
            }
            return phy;
        }
        if !self.work_blocks[wb].is_sector_written(0) {
            return BRSI_INVALID;
        }
        let phy = self.wb_read_assignment(wb, 0);
        if phy == 0 {
            // Position 0 written and unassigned can mean either that
            // logical sector 0 lives there or that it was invalidated;
            // the on-flash free flag tells them apart.
            let page = self.block_to_page(self.work_blocks[wb].pbi as u32);
            match self.read_spare_byte(page, spare::sector_free_off(0)) {
                Ok(0xFF) => return 0,
                _ => return BRSI_INVALID,
            }
        }
        phy
    }

    /// Picks the destination page for a sector write: the native
    /// position when free, else the first free position above 0.
    fn find_free_sector_in_work_block(&self, wb: usize, brsi: u32) -> u32 {
        let desc = &self.work_blocks[wb];
        if !desc.is_sector_written(brsi) {
            return brsi;
        }
        let spb = self.sectors_per_block();
        for pos in 1..spb {
            if !desc.is_sector_written(pos) {
                return pos;
            }
        }
        BRSI_INVALID
    }

    fn alloc_work_block_desc(&mut self, lbi: u32) -> Option<usize> {
        let idx = self.wb_free.pop()? as usize;
        let desc = &mut self.work_blocks[idx];
        desc.lbi = lbi as u16;
        desc.pbi = 0;
        desc.is_written.fill(0);
        desc.assign.fill(0);
        self.wb_used.insert(0, idx as u8).ok();
        Some(idx)
    }

    /// Finds or creates a work block for a logical block, converting the
    /// least recently used one when the pool is exhausted.
    fn alloc_work_block(&mut self, lbi: u32) -> Result<usize, Error> {
        let idx = match self.alloc_work_block_desc(lbi) {
            Some(idx) => idx,
            None => {
                let lru = *self.wb_used.last().ok_or(Error::OutOfSpace)?;
                self.clean_work_block(lru as usize, BRSI_INVALID, None)?;
                self.alloc_work_block_desc(lbi).ok_or(Error::OutOfSpace)?
            }
        };
        let (pbi, erase_cnt) = match self.alloc_erased_block() {
            Ok(v) => v,
            Err(e) => {
                self.wb_remove_from_used(idx);
                return Err(e);
            }
        };
        self.work_blocks[idx].pbi = pbi as u16;
        self.mark_as_work_block(pbi, lbi, erase_cnt).map_err(|_| Error::Io)?;
        Ok(idx)
    }

    /// Converts a work block whose sectors all sit at native positions
    /// by filling the gaps from the source block and flipping the data
    /// status. Returns the failing position on error so the caller can
    /// fall back to conversion via copy.
    fn convert_work_block_in_place(&mut self, wb: usize) -> Result<(), u32> {
        let lbi = self.work_blocks[wb].lbi as u32;
        let pbi_work = self.work_blocks[wb].pbi as u32;
        let pbi_src = self.l2p_read(lbi);
        let work_page = self.block_to_page(pbi_work);
        let spb = self.sectors_per_block();
        let mut data_cnt = 0u8;
        let mut src_erase_cnt = ERASE_CNT_INVALID;
        if pbi_src != 0 {
            let src_page = self.block_to_page(pbi_src);
            for i in 0..spb {
                if self.work_blocks[wb].is_sector_written(i) {
                    continue;
                }
                let brsi = if i == 0 { BRSI_INVALID } else { i };
                match self.copy_sector_with_ecc(src_page + i, work_page + i, brsi) {
                    OpResult::Ok | OpResult::BitCorrected => {}
                    _ => return Err(i),
                }
            }
            data_cnt = (self.read_status_byte(pbi_src) & 0xF).wrapping_add(1);
            src_erase_cnt = self.read_erase_cnt(pbi_src);
        }
        let status = (DataStatus::Valid.to_nibble() << 4) | (data_cnt & 0xF);
        if self
            .write_spare_byte(work_page, status, spare::OFF_DATA_STATUS)
            .is_err()
        {
            return Err(spb);
        }
        // Two blocks now carry the same LBI; the higher data count wins
        // if power is lost before the source is invalidated.
        self.l2p_write(lbi, pbi_work);
        let _ = self.make_block_available(pbi_src, src_erase_cnt);
        self.wb_remove_from_used(wb);
        let work_erase_cnt = self.read_erase_cnt(pbi_work);
        self.note_erase_cnt_for_wl(work_erase_cnt);
        self.counters.convert_in_place_cnt += 1;
        Ok(())
    }

    fn note_erase_cnt_for_wl(&mut self, erase_cnt: u32) {
        if erase_cnt == ERASE_CNT_INVALID {
            return;
        }
        if erase_cnt < self.erase_cnt_min {
            self.erase_cnt_min = erase_cnt;
            self.num_blocks_erase_cnt_min = 1;
        } else if erase_cnt == self.erase_cnt_min {
            self.num_blocks_erase_cnt_min += 1;
        }
    }

    /// Merges a work block with its source data block into a freshly
    /// erased block. The payload for each position comes, in priority,
    /// from the caller's buffer, the work block, the source block, or is
    /// left blank.
    fn convert_work_block_via_copy(
        &mut self,
        wb: usize,
        skip_brsi: u32,
        brsi: u32,
        data: Option<&[u8]>,
    ) -> Result<(), Error> {
        let lbi = self.work_blocks[wb].lbi as u32;
        let pbi_work = self.work_blocks[wb].pbi as u32;
        let work_page = self.block_to_page(pbi_work);
        let spb = self.sectors_per_block();
        let mut retries = NUM_WRITE_RETRIES;
        let (pbi_dest, erase_cnt_dest, fatal_work, fatal_src, error_brsi) = 'retry: loop {
            let (pbi_dest, erase_cnt_dest) = self.alloc_erased_block()?;
            let pbi_src = self.l2p_read(lbi);
            let src_page = self.block_to_page(pbi_src);
            let dest_page = self.block_to_page(pbi_dest);
            let mut fatal_work = OpResult::Ok;
            let mut fatal_src = OpResult::Ok;
            let mut error_brsi = 0;
            for i in 0..spb {
                let phy = self.wb_log_to_phy(wb, i);
                if brsi == i && data.is_some() {
                    self.clear_spare_buf();
                    if self.write_sector(dest_page + i, data.unwrap()) != OpResult::Ok {
                        self.mark_block_bad(pbi_dest, OpResult::WriteError.code(), i);
                        if retries == 0 {
                            return Err(Error::Io);
                        }
                        retries -= 1;
                        continue 'retry;
                    }
                } else if phy != BRSI_INVALID && phy != skip_brsi {
                    match self.copy_sector_with_ecc(work_page + phy, dest_page + i, BRSI_INVALID) {
                        OpResult::Ok | OpResult::BitCorrected => {}
                        r @ (OpResult::Uncorrectable | OpResult::ReadError | OpResult::ErrorInEcc) => {
                            fatal_work = r;
                            error_brsi = i;
                        }
                        OpResult::WriteError => {
                            self.mark_block_bad(pbi_dest, OpResult::WriteError.code(), i);
                            if retries == 0 {
                                return Err(Error::Io);
                            }
                            retries -= 1;
                            continue 'retry;
                        }
                        _ => {}
                    }
                } else if pbi_src != 0 {
                    match self.copy_sector_with_ecc(src_page + i, dest_page + i, BRSI_INVALID) {
                        OpResult::Ok | OpResult::BitCorrected => {}
                        r @ (OpResult::Uncorrectable | OpResult::ReadError | OpResult::ErrorInEcc) => {
                            fatal_src = r;
                            error_brsi = i;
                        }
                        OpResult::WriteError => {
                            self.mark_block_bad(pbi_dest, OpResult::WriteError.code(), i);
                            if retries == 0 {
                                return Err(Error::Io);
                            }
                            retries -= 1;
                            continue 'retry;
                        }
                        _ => {}
                    }
                }
            }
            break (pbi_dest, erase_cnt_dest, fatal_work, fatal_src, error_brsi);
        };
        let pbi_src = self.l2p_read(lbi);
        let mut data_cnt = 0u8;
        let mut src_erase_cnt = ERASE_CNT_INVALID;
        if pbi_src != 0 {
            data_cnt = (self.read_status_byte(pbi_src) & 0xF).wrapping_add(1);
            src_erase_cnt = self.read_erase_cnt(pbi_src);
        }
        self.mark_as_data_block(pbi_dest, lbi, erase_cnt_dest, data_cnt)
            .map_err(|_| Error::Io)?;
        // Two blocks carry the same LBI from here until the sources are
        // invalidated below.
        self.l2p_write(lbi, pbi_dest);
        if fatal_work != OpResult::Ok {
            self.mark_block_bad(pbi_work, fatal_work.code(), error_brsi);
        } else {
            let _ = self.make_block_available(pbi_work, ERASE_CNT_INVALID);
        }
        if pbi_src != 0 {
            if fatal_src != OpResult::Ok {
                self.mark_block_bad(pbi_src, fatal_src.code(), error_brsi);
            } else {
                let _ = self.make_block_available(pbi_src, src_erase_cnt);
            }
        }
        self.wb_remove_from_used(wb);
        self.note_erase_cnt_for_wl(erase_cnt_dest);
        self.counters.convert_via_copy_cnt += 1;
        if fatal_work.is_fatal() || fatal_src.is_fatal() {
            self.fatal_error(OpResult::Uncorrectable, error_brsi);
        }
        Ok(())
    }

    /// Closes a work block. When `brsi`/`data` are given the payload is
    /// folded into the conversion; returns whether it was written.
    fn clean_work_block(&mut self, wb: usize, brsi: u32, data: Option<&[u8]>) -> Result<bool, Error> {
        let mut skip_brsi = BRSI_INVALID;
        if self.is_in_place_conversion_allowed(wb) {
            match self.convert_work_block_in_place(wb) {
                Ok(()) => return Ok(false),
                Err(err_brsi) => {
                    if err_brsi == self.sectors_per_block() {
                        return Err(Error::Io);
                    }
                    skip_brsi = err_brsi;
                }
            }
        }
        self.convert_work_block_via_copy(wb, skip_brsi, brsi, data)?;
        Ok(brsi != BRSI_INVALID && data.is_some())
    }

    fn is_in_place_conversion_allowed(&self, wb: usize) -> bool {
        let spb = self.sectors_per_block();
        for u in 0..spb {
            if self.work_blocks[wb].is_sector_written(u) {
                // A written position whose logical owner sits elsewhere
                // breaks the native-position property.
                if self.wb_read_assignment(wb, u) != u {
                    return false;
                }
            }
        }
        true
    }

    /// Rebuilds the per-sector bitmap of a work block from the page
    /// spares. The presence of a valid ECC is the witness that a page
    /// has been written.
    fn load_work_block(&mut self, wb: usize) {
        let pbi = self.work_blocks[wb].pbi as u32;
        let page0 = self.block_to_page(pbi);
        let spb = self.sectors_per_block();
        for i in 0..spb {
            if self.read_spare(page0 + i).is_err() {
                continue;
            }
            if ecc::is_blank(&self.spare_buf[spare::OFF_ECC0 as usize..]) {
                continue;
            }
            let brsi = if i == 0 {
                Some(0)
            } else {
                spare::load_brsi(&self.spare_buf, spb).map(u32::from)
            };
            self.work_blocks[wb].mark_sector_written(i);
            if let Some(brsi) = brsi {
                self.wb_write_assignment(wb, brsi, i);
            }
        }
    }

    // ----------------------------------------------------------------
    // Fatal errors
    // ----------------------------------------------------------------

    /// Records a fatal error, consults the callback and, when requested,
    /// persists the read-only transition to the error-info sector.
    fn fatal_error(&mut self, kind: OpResult, error_sector: u32) {
        self.has_fatal_error = true;
        self.error_type = kind.code();
        self.error_sector = error_sector;
        let info = FatalErrorInfo {
            error_type: kind.code(),
            error_sector,
        };
        let recovery = match self.on_fatal_error {
            Some(handler) => handler(&info),
            None => ErrorRecovery::Continue,
        };
        if recovery == ErrorRecovery::ReadOnly && !self.is_write_protected {
            self.is_write_protected = true;
            let bps = self.bytes_per_sector as usize;
            self.sector_buf[..bps].fill(0xFF);
            store_u16_be(&mut self.sector_buf[ERR_OFF_IS_WRITE_PROTECTED..], 0);
            store_u16_be(&mut self.sector_buf[ERR_OFF_HAS_FATAL_ERROR..], 0);
            store_u16_be(&mut self.sector_buf[ERR_OFF_FATAL_ERROR_TYPE..], u16::from(kind.code()));
            store_u32_be(&mut self.sector_buf[ERR_OFF_FATAL_ERROR_SECTOR..], error_sector);
            self.clear_spare_buf();
            let _ = self.write_sector_from_buf(SECTOR_INDEX_ERROR_INFO);
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
            Ok(()) => {
                self.is_mounted = true;
                Ok(())
            }
            Err(e) => {
                self.mount_failed = true;
                Err(e)
            }
        }
    }

    fn low_level_mount(&mut self) -> Result<(), Error> {
        // Format information lives in the first sector of block 0.
        match self.read_sector_with_ecc(SECTOR_INDEX_FORMAT_INFO) {
            OpResult::Ok | OpResult::BitCorrected => {}
            OpResult::Blank => return Err(Error::NotFormatted),
            r => {
                if r.is_fatal() {
                    self.fatal_error(r, SECTOR_INDEX_FORMAT_INFO);
                }
                return Err(Error::NotFormatted);
            }
        }
        if self.sector_buf[..8] != spare::DRIVER_SIGNATURE {
            return Err(Error::NotFormatted);
        }
        if load_u32_be(&self.sector_buf[INFO_OFF_LLFORMAT_VERSION..]) != LLFORMAT_VERSION {
            return Err(Error::NotFormatted);
        }
        if load_u32_be(&self.sector_buf[INFO_OFF_SECTOR_SIZE..]) != self.bytes_per_sector {
            return Err(Error::Corruption);
        }
        let bad_block_off = load_u32_be(&self.sector_buf[INFO_OFF_BAD_BLOCK_OFFSET..]);
        if bad_block_off != spare::BAD_BLOCK_OFF_LARGE_PAGE
            && bad_block_off != spare::BAD_BLOCK_OFF_SMALL_PAGE
        {
            return Err(Error::Corruption);
        }
        self.bad_block_off = bad_block_off;
        let num_work_blocks = load_u32_be(&self.sector_buf[INFO_OFF_NUM_WORK_BLOCKS..])
            .min(MAX_WORK_BLOCKS as u32);
        let num_log_blocks_stored = load_u32_be(&self.sector_buf[INFO_OFF_NUM_LOG_BLOCKS..]);
        let num_log_blocks = calc_num_log_blocks(self.num_phy_blocks, num_work_blocks)
            .ok_or(Error::Corruption)?;
        if num_log_blocks_stored > num_log_blocks {
            return Err(Error::Corruption);
        }
        self.num_work_blocks = num_work_blocks;
        self.num_log_blocks = num_log_blocks;
        self.num_sectors = num_log_blocks << self.spb_shift;
        // Error information persisted by an earlier fatal failure.
        self.is_write_protected = false;
        self.has_fatal_error = false;
        self.error_type = 0;
        self.error_sector = 0;
        match self.read_sector_with_ecc(SECTOR_INDEX_ERROR_INFO) {
            OpResult::Ok | OpResult::BitCorrected => {
                self.is_write_protected =
                    load_u16_be(&self.sector_buf[ERR_OFF_IS_WRITE_PROTECTED..]) != 0xFFFF;
                self.has_fatal_error =
                    load_u16_be(&self.sector_buf[ERR_OFF_HAS_FATAL_ERROR..]) != 0xFFFF;
                if self.has_fatal_error {
                    self.error_type = load_u16_be(&self.sector_buf[ERR_OFF_FATAL_ERROR_TYPE..]) as u8;
                    self.error_sector = load_u32_be(&self.sector_buf[ERR_OFF_FATAL_ERROR_SECTOR..]);
                }
            }
            _ => {}
        }
        // Reset the tables and scan every block.
        self.l2p.fill(0);
        self.free_map.fill(0);
        self.wb_used.clear();
        self.wb_free.clear();
        for i in 0..num_work_blocks.min(MAX_WORK_BLOCKS as u32) {
            self.wb_free.push(i as u8).ok();
        }
        let mut erase_cnt_max = 0;
        let mut erase_cnt_min = ERASE_CNT_INVALID;
        let mut num_min = 0;
        self.counters.num_bad_blocks = 0;
        for pbi in 1..self.num_phy_blocks {
            let page = self.block_to_page(pbi);
            if self.read_spare(page).is_err() {
                self.counters.num_bad_blocks += 1;
                continue;
            }
            if spare::is_bad(&self.spare_buf, self.bad_block_off) {
                self.counters.num_bad_blocks += 1;
                continue;
            }
            let (status, _) = spare::load_data_status(&self.spare_buf);
            let lbi = spare::load_lbi(&self.spare_buf, self.num_log_blocks);
            let erase_cnt = spare::load_erase_cnt(&self.spare_buf, self.bad_block_off);
            if erase_cnt != ERASE_CNT_INVALID {
                if status == DataStatus::Work {
                    // Register the work block unless its LBI is invalid,
                    // already claimed, or the descriptor pool is spent.
                    let mut registered = false;
                    if let Some(lbi) = lbi {
                        if self.find_work_block(u32::from(lbi)).is_none() {
                            if let Some(idx) = self.alloc_work_block_desc(u32::from(lbi)) {
                                self.work_blocks[idx].pbi = pbi as u16;
                                registered = true;
                            }
                        }
                    }
                    if !registered {
                        let _ = self.erase_block(pbi);
                        self.mark_block_free(pbi);
                    }
                    continue;
                }
                if status == DataStatus::Valid {
                    let Some(lbi) = lbi else {
                        self.mark_block_free(pbi);
                        continue;
                    };
                    let lbi = u32::from(lbi);
                    let prev = self.l2p_read(lbi);
                    if prev == 0 {
                        self.l2p_write(lbi, pbi);
                        if erase_cnt > erase_cnt_max {
                            erase_cnt_max = erase_cnt;
                        }
                    } else {
                        // Two data blocks share an LBI after an
                        // interrupted conversion; the successor data
                        // count wins and the loser is erased.
                        let prev_cnt = self.read_status_byte(prev) & 0xF;
                        let cand_cnt = self.read_status_byte(pbi) & 0xF;
                        if prev_cnt.wrapping_sub(cand_cnt) & 0xF == 1 {
                            self.mark_block_free(pbi);
                            let _ = self.erase_block(pbi);
                        } else {
                            self.mark_block_free(prev);
                            let _ = self.erase_block(prev);
                            self.l2p_write(lbi, pbi);
                        }
                    }
                    if erase_cnt < erase_cnt_min {
                        erase_cnt_min = erase_cnt;
                        num_min = 1;
                    } else if erase_cnt == erase_cnt_min {
                        num_min += 1;
                    }
                    continue;
                }
            }
            // Anything else counts as a free block.
            self.mark_block_free(pbi);
        }
        self.erase_cnt_max = erase_cnt_max;
        self.erase_cnt_min = erase_cnt_min;
        self.num_blocks_erase_cnt_min = num_min;
        self.mru_free_block = 0;
        let used: heapless::Vec<u8, MAX_WORK_BLOCKS> = self.wb_used.clone();
        for wb in used {
            self.load_work_block(wb as usize);
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Sector operations
    // ----------------------------------------------------------------

    fn check_sector_range(&self, sector: u32, n: u32) -> Result<(), Error> {
        if n == 0 || sector >= self.num_sectors || n > self.num_sectors - sector {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Reads one logical sector into `buf`.
    fn read_one_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        let bps = self.bytes_per_sector as usize;
        let mask = self.sectors_per_block() - 1;
        let lbi = sector >> self.spb_shift;
        let brsi_log = sector & mask;
        let mut pbi = self.l2p_read(lbi);
        let mut brsi_phy = brsi_log;
        let wb = self.find_work_block(lbi);
        let mut in_work_block = false;
        if let Some(wb) = wb {
            let phy = self.wb_log_to_phy(wb, brsi_log);
            if phy != BRSI_INVALID {
                pbi = self.work_blocks[wb].pbi as u32;
                brsi_phy = phy;
                in_work_block = true;
            }
        }
        if pbi == 0 {
            buf[..bps].fill(0xFF);
            return Ok(());
        }
        let page = self.block_to_page(pbi) + brsi_phy;
        match self.read_sector_with_ecc(page) {
            OpResult::Ok | OpResult::BitCorrected => {
                // A page invalidated by a trim still has a valid ECC;
                // its free flag makes it read as blank.
                if !in_work_block && spare::is_sector_free(&self.spare_buf, brsi_phy) {
                    buf[..bps].fill(0xFF);
                    return Ok(());
                }
                buf[..bps].copy_from_slice(&self.sector_buf[..bps]);
                Ok(())
            }
            OpResult::Blank => {
                buf[..bps].fill(0xFF);
                Ok(())
            }
            _ => {
                // Salvage what remains of the block, then surface the
                // relocated copy.
                buf[..bps].copy_from_slice(&self.sector_buf[..bps]);
                if let Some(wb) = wb {
                    if in_work_block {
                        self.convert_work_block_via_copy(wb, BRSI_INVALID, BRSI_INVALID, None)?;
                        return Ok(());
                    }
                }
                self.recover_data_block(pbi)?;
                Ok(())
            }
        }
    }

    /// Writes one logical sector through a work block.
    fn write_one_sector(&mut self, sector: u32, data: &[u8]) -> Result<(), Error> {
        let mask = self.sectors_per_block() - 1;
        let lbi = sector >> self.spb_shift;
        let brsi_src = sector & mask;
        let (wb, brsi_dest) = loop {
            let wb = match self.find_work_block(lbi) {
                Some(wb) => {
                    let dest = self.find_free_sector_in_work_block(wb, brsi_src);
                    if dest == BRSI_INVALID {
                        if self.clean_work_block(wb, brsi_src, Some(data))? {
                            return Ok(());
                        }
                        None
                    } else {
                        Some((wb, dest))
                    }
                }
                None => None,
            };
            let (wb, dest) = match wb {
                Some(v) => v,
                None => {
                    let wb = self.alloc_work_block(lbi)?;
                    (wb, brsi_src)
                }
            };
            self.clear_spare_buf();
            if dest != 0 {
                spare::store_brsi(&mut self.spare_buf, brsi_src as u16);
            }
            let page = self.block_to_page(self.work_blocks[wb].pbi as u32) + dest;
            if self.write_sector(page, data) == OpResult::Ok {
                break (wb, dest);
            }
            // The work block no longer programs reliably: flush it into
            // a data block and start over with a fresh one.
            self.convert_work_block_via_copy(wb, dest, BRSI_INVALID, None)?;
        };
        // Invalidate the payload a previous write left for this sector.
        let prev_phy = self.wb_read_assignment(wb, brsi_src);
        let page0 = self.block_to_page(self.work_blocks[wb].pbi as u32);
        if prev_phy != 0 {
            self.clear_spare_buf();
            spare::store_brsi(&mut self.spare_buf, BRSI_INVALID as u16);
            self.spare_buf[spare::sector_free_off(prev_phy) as usize] = 0;
            let _ = self.write_spare_from_buf(page0 + prev_phy);
        } else if brsi_src == 0 && self.work_blocks[wb].is_sector_written(0) && brsi_dest != 0 {
            let _ = self.write_spare_byte(page0, 0, spare::sector_free_off(0));
        }
        self.mark_work_block_mru(wb);
        self.work_blocks[wb].mark_sector_written(brsi_dest);
        self.wb_write_assignment(wb, brsi_src, brsi_dest);
        Ok(())
    }

    /// Marks one logical sector as holding no data.
    fn free_one_sector(&mut self, sector: u32) -> Result<(), Error> {
        let mask = self.sectors_per_block() - 1;
        let lbi = sector >> self.spb_shift;
        let brsi_log = sector & mask;
        let pbi = self.l2p_read(lbi);
        if pbi != 0 {
            let page = self.block_to_page(pbi) + brsi_log;
            if self.read_spare(page).is_ok()
                && !ecc::is_blank(&self.spare_buf[spare::OFF_ECC0 as usize..])
                && !spare::is_sector_free(&self.spare_buf, brsi_log)
            {
                self.write_spare_byte(page, 0, spare::sector_free_off(brsi_log))?;
            }
        }
        if let Some(wb) = self.find_work_block(lbi) {
            let phy = self.wb_log_to_phy(wb, brsi_log);
            if phy != BRSI_INVALID {
                let page = self.block_to_page(self.work_blocks[wb].pbi as u32) + phy;
                if phy != 0 {
                    self.clear_spare_buf();
                    spare::store_brsi(&mut self.spare_buf, BRSI_INVALID as u16);
                    self.spare_buf[spare::sector_free_off(phy) as usize] = 0;
                    self.write_spare_from_buf(page)?;
                    self.wb_write_assignment(wb, brsi_log, 0);
                } else {
                    self.write_spare_byte(page, 0, spare::sector_free_off(0))?;
                }
            }
        }
        Ok(())
    }

    /// Releases a whole logical block: both its work block and its data
    /// block return to the free pool.
    fn free_one_block(&mut self, lbi: u32) -> Result<(), Error> {
        if let Some(wb) = self.find_work_block(lbi) {
            let pbi = self.work_blocks[wb].pbi as u32;
            self.wb_remove_from_used(wb);
            let erase_cnt = self.read_erase_cnt(pbi);
            self.make_block_available(pbi, erase_cnt)?;
        }
        let pbi = self.l2p_read(lbi);
        if pbi != 0 {
            self.l2p_write(lbi, 0);
            let erase_cnt = self.read_erase_cnt(pbi);
            self.make_block_available(pbi, erase_cnt)?;
        }
        Ok(())
    }
}

impl<P: NandFlash> SectorDevice for NandTl<P> {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8], n: u32) -> Result<(), Error> {
        self.mount()?;
        self.check_sector_range(sector, n)?;
        let bps = self.bytes_per_sector as usize;
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
        if self.is_write_protected {
            return Err(Error::ReadOnly);
        }
        let bps = self.bytes_per_sector as usize;
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
        if self.is_write_protected {
            return Err(Error::ReadOnly);
        }
        let spb = self.sectors_per_block();
        let mut sector = sector;
        let mut n = n;
        while n != 0 {
            if sector & (spb - 1) == 0 && n >= spb {
                self.free_one_block(sector >> self.spb_shift)?;
                sector += spb;
                n -= spb;
            } else {
                self.free_one_sector(sector)?;
                sector += 1;
                n -= 1;
            }
        }
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        self.bytes_per_sector
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn sector_usage(&mut self, sector: u32) -> Result<SectorUsage, Error> {
        self.mount()?;
        if sector >= self.num_sectors {
            return Err(Error::InvalidArgument);
        }
        let mask = self.sectors_per_block() - 1;
        let lbi = sector >> self.spb_shift;
        let brsi_log = sector & mask;
        let pbi = self.l2p_read(lbi);
        if pbi != 0 {
            let page = self.block_to_page(pbi) + brsi_log;
            if self.read_spare(page).is_ok()
                && !ecc::is_blank(&self.spare_buf[spare::OFF_ECC0 as usize..])
                && !spare::is_sector_free(&self.spare_buf, brsi_log)
            {
                return Ok(SectorUsage::InUse);
            }
        }
        if let Some(wb) = self.find_work_block(lbi) {
            if self.wb_log_to_phy(wb, brsi_log) != BRSI_INVALID {
                return Ok(SectorUsage::InUse);
            }
        }
        Ok(SectorUsage::NotUsed)
    }
}

/// Number of logical blocks presented to the file system: roughly 3% of
/// the capacity is held back against bad-block development, plus the
/// work blocks and the two reserved blocks.
fn calc_num_log_blocks(num_phy_blocks: u32, num_work_blocks: u32) -> Option<u32> {
    let usable = (num_phy_blocks * 125) >> 7;
    let reserve = num_work_blocks + NUM_BLOCKS_RESERVED;
    usable.checked_sub(reserve).filter(|&n| n > 0)
}

fn store_u32_be(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_be_bytes());
}

fn load_u32_be(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn store_u16_be(buf: &mut [u8], v: u16) {
    buf[..2].copy_from_slice(&v.to_be_bytes());
}

fn load_u16_be(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_block_budget() {
        // 64 physical blocks, 3 work blocks: 62 usable after the
        // bad-block reserve, minus work blocks and the two reserved.
        assert_eq!(calc_num_log_blocks(64, 3), Some(57));
        assert_eq!(calc_num_log_blocks(8, 3), Some(2));
        assert_eq!(calc_num_log_blocks(6, 3), None);
    }

    #[test]
    fn test_op_result_codes_are_stable() {
        // The codes are persisted in the error-info sector; they must
        // not change between releases.
        assert_eq!(OpResult::ErrorInEcc.code(), 2);
        assert_eq!(OpResult::Uncorrectable.code(), 3);
        assert_eq!(OpResult::ReadError.code(), 4);
        assert_eq!(OpResult::WriteError.code(), 5);
        assert_eq!(OpResult::OutOfFreeBlocks.code(), 6);
    }
}
