//! # Journal
//!
//! A sector-level write-ahead log that makes a bounded sequence of
//! sector writes and trims atomic under sudden power loss.
//!
//! # How it works
//!
//! The journal owns a contiguous range of logical sectors on the
//! underlying device:
//!
//! ```text
//! ┌────────┬───────────────┬─────────────────────┬──────┐
//! │ status │   copy list   │       payload       │ info │
//! └────────┴───────────────┴─────────────────────┴──────┘
//! ```
//!
//! While a transaction is open, sector writes land in the payload area
//! and trims are recorded as list entries; the in-RAM table remembers
//! which journal slot belongs to which target sector, so reads stay
//! coherent. At the outermost transaction close the copy list is made
//! durable, then the status sector is written with the entry count.
//! That status write is the commit point: replay copies every payload
//! to its target, issues the recorded trims, and only then clears the
//! status sector. A mount after power loss finds either a blank status
//! (nothing committed, the payload area is garbage) or a populated one
//! (the transaction committed, replay runs again); replay is idempotent
//! either way.
//!
//! A transaction that outgrows the payload area is no longer atomic;
//! the registered overflow callback decides between flushing
//! mid-transaction and aborting.

use crate::storage::{Error, SectorDevice, SectorUsage};

/// Largest supported sector size of the underlying device.
pub const MAX_SECTOR_SIZE: usize = 2048;
/// Capacity of the in-RAM slot table, bounding the journal entry count.
pub const MAX_ENTRIES: usize = 1024;
/// Smallest journal size that leaves room for at least one entry.
pub const MIN_NUM_SECTORS: u32 = 5;
/// Transaction nesting limit; `begin` beyond this depth fails.
pub const MAX_OPEN_CNT: u16 = 0x7FFF;

const VERSION: u32 = 10000;
const SIZEOF_ENTRY: u32 = 16;
const INFO_SECTOR_TAG: [u8; 16] = *b"Journal info\0\0\0\0";
const STATUS_SECTOR_TAG: [u8; 16] = *b"Journal status\0\0";

const OFF_INFO_VERSION: usize = 0x10;
const OFF_INFO_NUM_TOTAL_SECTORS: usize = 0x20;
const OFF_INFO_SUPPORT_FREE_SECTOR: usize = 0x30;
const OFF_STATUS_SECTOR_CNT: usize = 0x10;
const OFF_ENTRY_SECTOR_INDEX: usize = 0x00;
const OFF_ENTRY_IS_FREE: usize = 0x04;
const OFF_ENTRY_NUM_SECTORS: usize = 0x08;

const INDEX_INVALID: u32 = u32::MAX;

/// Decision of the overflow callback.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OverflowAction {
    /// Replay the journal now and continue the transaction. The
    /// transaction is no longer atomic across this point.
    Flush,
    /// Latch the transaction as failed; every further mutation returns
    /// an error and the outermost `end` reports it.
    Abort,
}

/// Information handed to the overflow callback.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct OverflowInfo {
    /// Journal entry capacity.
    pub num_entries: u32,
    /// Entries currently populated (equals the capacity on overflow).
    pub sector_cnt: u32,
}

/// Callback invoked when a transaction outgrows the journal.
pub type OverflowHandler = fn(&OverflowInfo) -> OverflowAction;

/// Operating figures of a journal instance.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct JournalInfo {
    /// Whether a valid journal file was found on the device.
    pub is_present: bool,
    /// Current transaction nesting depth.
    pub open_cnt: u16,
    /// Journal entries still unused in the running transaction.
    pub num_free_entries: u32,
    /// Whether trims are recorded in the journal.
    pub free_sector_supported: bool,
    /// Total number of device sectors occupied by the journal.
    pub num_sectors_total: u32,
}

/// Operation counters, retrievable for diagnostics.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Counters {
    /// Sectors written into the journal.
    pub write_sector_cnt: u32,
    /// Trim entries recorded.
    pub free_sector_cnt: u32,
    /// Times the journal ran full.
    pub overflow_cnt: u32,
    /// Transactions replayed.
    pub num_transactions: u32,
}

/// The journal instance, wrapping the translation layer of one volume.
///
/// All file-system sector I/O goes through this wrapper; outside a
/// transaction (or when no journal is present) operations pass straight
/// through to the device.
pub struct Journal<D: SectorDevice> {
    device: D,
    first_sector: u32,
    num_sectors_total: u32,
    num_entries: u32,
    first_data_sector: u32,
    bytes_per_sector: u32,
    is_present: bool,
    free_sector_supported: bool,
    sector_cnt: u32,
    open_cnt: u16,
    error: Option<Error>,
    /// Journal slot index -> target sector index on the device.
    j2p: [u32; MAX_ENTRIES],
    /// One bit per slot: the entry records a trim, not a write.
    is_free: [u8; MAX_ENTRIES / 8],
    buf: [u8; MAX_SECTOR_SIZE],
    on_overflow: Option<OverflowHandler>,
    counters: Counters,
}

impl<D: SectorDevice> core::fmt::Debug for Journal<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Journal")
            .field("is_present", &self.is_present)
            .field("open_cnt", &self.open_cnt)
            .field("sector_cnt", &self.sector_cnt)
            .finish_non_exhaustive()
    }
}

impl<D: SectorDevice> Journal<D> {
    /// Creates an inactive wrapper. Until [`create`](Self::create) or
    /// [`mount`](Self::mount) succeeds, every operation passes through.
    pub fn new(device: D) -> Journal<D> {
        Journal {
            device,
            first_sector: 0,
            num_sectors_total: 0,
            num_entries: 0,
            first_data_sector: 0,
            bytes_per_sector: 0,
            is_present: false,
            free_sector_supported: false,
            sector_cnt: 0,
            open_cnt: 0,
            error: None,
            j2p: [0; MAX_ENTRIES],
            is_free: [0; MAX_ENTRIES / 8],
            buf: [0; MAX_SECTOR_SIZE],
            on_overflow: None,
            counters: Counters::default(),
        }
    }

    /// Registers the callback consulted when a transaction outgrows the
    /// journal. Without one, the journal flushes.
    pub fn set_overflow_handler(&mut self, handler: OverflowHandler) {
        self.on_overflow = Some(handler);
    }

    /// Whether a valid journal file is active.
    pub fn is_present(&self) -> bool {
        self.is_present
    }

    /// Current transaction nesting depth.
    pub fn open_count(&self) -> u16 {
        self.open_cnt
    }

    /// Journal entries still unused.
    pub fn num_free_entries(&self) -> u32 {
        self.num_entries - self.sector_cnt
    }

    /// Operating figures.
    pub fn info(&self) -> JournalInfo {
        JournalInfo {
            is_present: self.is_present,
            open_cnt: self.open_cnt,
            num_free_entries: self.num_free_entries(),
            free_sector_supported: self.free_sector_supported,
            num_sectors_total: self.num_sectors_total,
        }
    }

    /// Operation counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Access to the wrapped device.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Consumes the wrapper, returning the device.
    pub fn into_inner(self) -> D {
        self.device
    }

    /// Formats the reserved sector range `[first_sector,
    /// first_sector + num_sectors)` as an empty journal: writes the
    /// info sector, clears the status sector and resets the RAM state.
    pub fn create(
        &mut self,
        first_sector: u32,
        num_sectors: u32,
        free_sector_support: bool,
    ) -> Result<(), Error> {
        if num_sectors < MIN_NUM_SECTORS {
            return Err(Error::InvalidArgument);
        }
        let num_device_sectors = self.device.num_sectors();
        if first_sector >= num_device_sectors || num_sectors > num_device_sectors - first_sector {
            return Err(Error::InvalidArgument);
        }
        self.init_instance(first_sector, num_sectors, free_sector_support)?;
        // Info sector: written once, never changes.
        let bps = self.bytes_per_sector as usize;
        self.buf[..bps].fill(0xFF);
        self.buf[..16].copy_from_slice(&INFO_SECTOR_TAG);
        store_u32_le(&mut self.buf[OFF_INFO_VERSION..], VERSION);
        store_u32_le(&mut self.buf[OFF_INFO_NUM_TOTAL_SECTORS..], num_sectors);
        // Reversed logic: 0x00 means trims are recorded.
        self.buf[OFF_INFO_SUPPORT_FREE_SECTOR] = if free_sector_support { 0x00 } else { 0xFF };
        let info_sector = first_sector + num_sectors - 1;
        self.device.write_sectors(info_sector, &self.buf[..bps], 1, false)?;
        self.write_blank_status()?;
        self.is_present = true;
        Ok(())
    }

    /// Opens the journal whose info sector sits at `info_sector` (the
    /// last sector of the reserved range). If the status sector records
    /// a committed transaction, it is replayed before this returns.
    pub fn mount(&mut self, info_sector: u32) -> Result<(), Error> {
        let bps = self.device.sector_size() as usize;
        if bps > MAX_SECTOR_SIZE {
            return Err(Error::InvalidArgument);
        }
        self.device.read_sectors(info_sector, &mut self.buf[..bps], 1)?;
        if self.buf[..16] != INFO_SECTOR_TAG {
            return Err(Error::NotFormatted);
        }
        if load_u32_le(&self.buf[OFF_INFO_VERSION..]) != VERSION {
            return Err(Error::NotFormatted);
        }
        let num_sectors = load_u32_le(&self.buf[OFF_INFO_NUM_TOTAL_SECTORS..]);
        if num_sectors < MIN_NUM_SECTORS || num_sectors > info_sector + 1 {
            return Err(Error::Corruption);
        }
        let free_sector_support = self.buf[OFF_INFO_SUPPORT_FREE_SECTOR] == 0;
        let first_sector = info_sector + 1 - num_sectors;
        self.init_instance(first_sector, num_sectors, free_sector_support)?;
        // Status sector: only an exactly matching tag certifies the
        // entry count. Anything else (including the all-ones pattern of
        // an interrupted status write) counts as no entries.
        self.device.read_sectors(first_sector, &mut self.buf[..bps], 1)?;
        let mut r = Ok(());
        if self.buf[..16] == STATUS_SECTOR_TAG {
            let sector_cnt = load_u32_le(&self.buf[OFF_STATUS_SECTOR_CNT..]);
            if sector_cnt != 0 {
                r = self.replay_committed(sector_cnt);
            }
        }
        self.is_present = true;
        r
    }

    /// Opens a transaction. Nested opens stack; only the outermost
    /// close commits.
    pub fn begin(&mut self) -> Result<(), Error> {
        if self.open_cnt == MAX_OPEN_CNT {
            return Err(Error::TooManyTransactions);
        }
        if self.open_cnt == 0 {
            self.error = None;
        }
        self.open_cnt += 1;
        Ok(())
    }

    /// Closes a transaction. On the outermost close with no latched
    /// error the journal is replayed into the device and cleared; with
    /// a latched error the uncommitted entries are dropped and the
    /// error returned.
    pub fn end(&mut self) -> Result<(), Error> {
        if self.open_cnt == 0 {
            return Err(Error::NoOpenTransaction);
        }
        let mut r = match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        self.open_cnt -= 1;
        if self.open_cnt == 0 {
            if self.is_present {
                if r.is_ok() {
                    r = self.clean_journal();
                }
                if r.is_err() {
                    self.sector_cnt = 0;
                }
            }
            self.error = None;
        }
        r
    }

    /// Drops every uncommitted entry of the running transaction.
    pub fn invalidate(&mut self) {
        self.clear_sector_list();
    }

    /// Forces a replay and clear outside a transaction, typically on
    /// shutdown.
    pub fn clean(&mut self) -> Result<(), Error> {
        if !self.is_present {
            return Ok(());
        }
        self.clean_journal()
    }

    // ----------------------------------------------------------------
    // Layout
    // ----------------------------------------------------------------

    /// Computes the journal layout for a reserved range: the largest
    /// entry count whose copy list and payload both fit.
    fn init_instance(
        &mut self,
        first_sector: u32,
        num_sectors: u32,
        free_sector_support: bool,
    ) -> Result<(), Error> {
        let bps = self.device.sector_size();
        if bps as usize > MAX_SECTOR_SIZE || bps < 32 {
            return Err(Error::InvalidArgument);
        }
        let avail = num_sectors - 2; // status + info
        let mut num_entries = (avail * bps) / (bps + SIZEOF_ENTRY);
        num_entries = num_entries.min(MAX_ENTRIES as u32);
        while num_entries > 0 {
            let list_sectors = (num_entries * SIZEOF_ENTRY).div_ceil(bps);
            if list_sectors + num_entries <= avail {
                break;
            }
            num_entries -= 1;
        }
        if num_entries == 0 {
            return Err(Error::InvalidArgument);
        }
        let list_sectors = (num_entries * SIZEOF_ENTRY).div_ceil(bps);
        self.first_sector = first_sector;
        self.num_sectors_total = num_sectors;
        self.num_entries = num_entries;
        self.first_data_sector = first_sector + 1 + list_sectors;
        self.bytes_per_sector = bps;
        self.free_sector_supported = free_sector_support;
        self.clear_sector_list();
        Ok(())
    }

    fn clear_sector_list(&mut self) {
        self.j2p[..self.num_entries as usize].fill(0);
        self.is_free.fill(0);
        self.sector_cnt = 0;
    }

    fn slot_is_free(&self, idx: u32) -> bool {
        self.is_free[(idx >> 3) as usize] & (1 << (idx & 7)) != 0
    }

    fn mark_slot_free(&mut self, idx: u32) {
        self.is_free[(idx >> 3) as usize] |= 1 << (idx & 7);
    }

    fn mark_slot_used(&mut self, idx: u32) {
        self.is_free[(idx >> 3) as usize] &= !(1 << (idx & 7));
    }

    fn find_slot(&self, sector: u32) -> u32 {
        for idx in 0..self.sector_cnt {
            if self.j2p[idx as usize] == sector {
                return idx;
            }
        }
        INDEX_INVALID
    }

    // ----------------------------------------------------------------
    // Commit and replay
    // ----------------------------------------------------------------

    fn write_blank_status(&mut self) -> Result<(), Error> {
        let bps = self.bytes_per_sector as usize;
        self.buf[..bps].fill(0xFF);
        self.buf[..16].copy_from_slice(&STATUS_SECTOR_TAG);
        store_u32_le(&mut self.buf[OFF_STATUS_SECTOR_CNT..], 0);
        self.device.write_sectors(self.first_sector, &self.buf[..bps], 1, false)
    }

    /// Clears the journal on the device and in RAM.
    fn reset_journal(&mut self) -> Result<(), Error> {
        let r = self.write_blank_status();
        self.clear_sector_list();
        r
    }

    /// Copies every write entry from the payload area to its target
    /// sector.
    fn copy_data(&mut self) -> Result<(), Error> {
        let bps = self.bytes_per_sector as usize;
        for idx in 0..self.sector_cnt {
            if self.slot_is_free(idx) {
                continue;
            }
            let src = self.first_data_sector + idx;
            let dst = self.j2p[idx as usize];
            self.device.read_sectors(src, &mut self.buf[..bps], 1)?;
            self.device.write_sectors(dst, &self.buf[..bps], 1, false)?;
        }
        Ok(())
    }

    /// Issues the recorded trims, coalesced into contiguous runs.
    fn free_data(&mut self) -> Result<(), Error> {
        if !self.free_sector_supported {
            return Ok(());
        }
        let mut start = 0u32;
        let mut len = 0u32;
        for idx in 0..self.sector_cnt {
            if !self.slot_is_free(idx) {
                continue;
            }
            let sector = self.j2p[idx as usize];
            if len == 0 {
                start = sector;
                len = 1;
            } else if start + len == sector {
                len += 1;
            } else {
                self.device.trim_sectors(start, len)?;
                start = sector;
                len = 1;
            }
        }
        if len != 0 {
            self.device.trim_sectors(start, len)?;
        }
        Ok(())
    }

    /// Replays the journal into the device and clears it.
    ///
    /// A transaction of exactly one entry skips the copy list and the
    /// status sector: a single sector write is atomic at the
    /// translation layer beneath.
    fn clean_journal(&mut self) -> Result<(), Error> {
        if self.sector_cnt == 0 {
            return Ok(());
        }
        let bps = self.bytes_per_sector as usize;
        if self.sector_cnt > 1 {
            // Make the copy list durable.
            self.buf[..bps].fill(0xFF);
            let mut list_sector = self.first_sector + 1;
            let mut off = 0usize;
            for idx in 0..self.sector_cnt {
                store_u32_le(
                    &mut self.buf[off + OFF_ENTRY_SECTOR_INDEX..],
                    self.j2p[idx as usize],
                );
                self.buf[off + OFF_ENTRY_IS_FREE] = u8::from(self.slot_is_free(idx));
                store_u32_le(&mut self.buf[off + OFF_ENTRY_NUM_SECTORS..], 1);
                off += SIZEOF_ENTRY as usize;
                if idx == self.sector_cnt - 1 || off == bps {
                    if list_sector >= self.first_data_sector {
                        return Err(Error::Corruption);
                    }
                    self.device.write_sectors(list_sector, &self.buf[..bps], 1, false)?;
                    self.buf[..bps].fill(0xFF);
                    list_sector += 1;
                    off = 0;
                }
            }
            // Commit point: the status sector is written only after the
            // copy list and every payload sector are durable.
            self.buf[..bps].fill(0xFF);
            self.buf[..16].copy_from_slice(&STATUS_SECTOR_TAG);
            store_u32_le(&mut self.buf[OFF_STATUS_SECTOR_CNT..], self.sector_cnt);
            self.device.write_sectors(self.first_sector, &self.buf[..bps], 1, false)?;
        }
        let r = self.copy_data();
        let r_free = self.free_data();
        self.counters.num_transactions += 1;
        // Mark the data as copied even when the copy failed, so the
        // same failing replay is not repeated forever.
        let r_clear = if self.sector_cnt > 1 {
            self.reset_journal()
        } else {
            self.clear_sector_list();
            Ok(())
        };
        r.and(r_free).and(r_clear)
    }

    /// Rebuilds the RAM state from the on-device copy list and replays.
    /// Used by mount when the status sector records a commit.
    fn replay_committed(&mut self, sector_cnt: u32) -> Result<(), Error> {
        if sector_cnt > self.num_entries {
            return Err(Error::Corruption);
        }
        let bps = self.bytes_per_sector as usize;
        let entries_per_sector = (bps / SIZEOF_ENTRY as usize) as u32;
        for idx in 0..sector_cnt {
            if idx % entries_per_sector == 0 {
                let list_sector = self.first_sector + 1 + idx / entries_per_sector;
                self.device.read_sectors(list_sector, &mut self.buf[..bps], 1)?;
            }
            let off = ((idx % entries_per_sector) * SIZEOF_ENTRY) as usize;
            self.j2p[idx as usize] = load_u32_le(&self.buf[off + OFF_ENTRY_SECTOR_INDEX..]);
            if self.buf[off + OFF_ENTRY_IS_FREE] != 0 {
                self.mark_slot_free(idx);
            }
        }
        self.sector_cnt = sector_cnt;
        let r = self.copy_data();
        let r_free = self.free_data();
        self.counters.num_transactions += 1;
        let r_clear = self.reset_journal();
        r.and(r_free).and(r_clear)
    }

    // ----------------------------------------------------------------
    // Diverted operations
    // ----------------------------------------------------------------

    fn is_journaling(&self) -> bool {
        self.is_present && self.open_cnt != 0
    }

    fn latch_error(&mut self, e: Error) -> Error {
        if self.error.is_none() {
            self.error = Some(e);
        }
        e
    }

    fn write_one_sector(&mut self, sector: u32, data: &[u8]) -> Result<(), Error> {
        let bps = self.bytes_per_sector as usize;
        let mut idx = self.find_slot(sector);
        if idx == INDEX_INVALID {
            if self.sector_cnt == self.num_entries {
                self.counters.overflow_cnt += 1;
                let info = OverflowInfo {
                    num_entries: self.num_entries,
                    sector_cnt: self.sector_cnt,
                };
                let action = match self.on_overflow {
                    Some(handler) => handler(&info),
                    None => OverflowAction::Flush,
                };
                match action {
                    OverflowAction::Flush => self.clean_journal()?,
                    OverflowAction::Abort => return Err(Error::OutOfSpace),
                }
            }
            idx = self.sector_cnt;
            self.j2p[idx as usize] = sector;
            self.sector_cnt += 1;
        }
        let dst = self.first_data_sector + idx;
        self.buf[..bps].copy_from_slice(&data[..bps]);
        if self.device.write_sectors(dst, &self.buf[..bps], 1, false).is_err() {
            // Cancel the transaction; the caller sees the latched error.
            self.sector_cnt = 0;
            return Err(Error::Io);
        }
        self.mark_slot_used(idx);
        self.counters.write_sector_cnt += 1;
        Ok(())
    }

    fn journal_write(
        &mut self,
        sector: u32,
        data: &[u8],
        n: u32,
        repeat_same: bool,
    ) -> Result<(), Error> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let bps = self.bytes_per_sector as usize;
        for i in 0..n {
            let off = if repeat_same { 0 } else { i as usize * bps };
            if let Err(e) = self.write_one_sector(sector + i, &data[off..off + bps]) {
                return Err(self.latch_error(e));
            }
        }
        Ok(())
    }

    fn journal_read(&mut self, sector: u32, buf: &mut [u8], n: u32) -> Result<(), Error> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let bps = self.bytes_per_sector as usize;
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let mut run_off = 0usize;
        for i in 0..n {
            let target = sector + i;
            let idx = self.find_slot(target);
            let off = i as usize * bps;
            if idx == INDEX_INVALID {
                // Not in the journal; batch into a contiguous device
                // read.
                if run_len == 0 {
                    run_start = target;
                    run_off = off;
                }
                run_len += 1;
                continue;
            }
            if run_len != 0 {
                self.device
                    .read_sectors(run_start, &mut buf[run_off..run_off + (run_len as usize) * bps], run_len)
                    .map_err(|e| self.latch_error(e))?;
                run_len = 0;
            }
            if self.slot_is_free(idx) {
                buf[off..off + bps].fill(0xFF);
            } else {
                let src = self.first_data_sector + idx;
                self.device
                    .read_sectors(src, &mut buf[off..off + bps], 1)
                    .map_err(|e| self.latch_error(e))?;
            }
        }
        if run_len != 0 {
            self.device
                .read_sectors(run_start, &mut buf[run_off..run_off + (run_len as usize) * bps], run_len)
                .map_err(|e| self.latch_error(e))?;
        }
        Ok(())
    }

    fn journal_trim(&mut self, sector: u32, n: u32) -> Result<(), Error> {
        if !self.free_sector_supported {
            return Ok(());
        }
        if let Some(e) = self.error {
            return Err(e);
        }
        for i in 0..n {
            let target = sector + i;
            let idx = self.find_slot(target);
            if idx != INDEX_INVALID {
                self.mark_slot_free(idx);
                continue;
            }
            if self.sector_cnt == self.num_entries {
                // Trim entries carry no payload; dropping one on
                // overflow would still be correct, but the transaction
                // accounting stays uniform by recording them like
                // writes.
                self.counters.overflow_cnt += 1;
                let info = OverflowInfo {
                    num_entries: self.num_entries,
                    sector_cnt: self.sector_cnt,
                };
                let action = match self.on_overflow {
                    Some(handler) => handler(&info),
                    None => OverflowAction::Flush,
                };
                match action {
                    OverflowAction::Flush => self.clean_journal().map_err(|e| self.latch_error(e))?,
                    OverflowAction::Abort => return Err(self.latch_error(Error::OutOfSpace)),
                }
            }
            let idx = self.sector_cnt;
            self.j2p[idx as usize] = target;
            self.sector_cnt += 1;
            self.mark_slot_free(idx);
            self.counters.free_sector_cnt += 1;
        }
        Ok(())
    }
}

impl<D: SectorDevice> SectorDevice for Journal<D> {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8], n: u32) -> Result<(), Error> {
        if !self.is_present {
            return self.device.read_sectors(sector, buf, n);
        }
        self.journal_read(sector, buf, n)
    }

    fn write_sectors(&mut self, sector: u32, data: &[u8], n: u32, repeat_same: bool)
    -> Result<(), Error> {
        if !self.is_journaling() {
            return self.device.write_sectors(sector, data, n, repeat_same);
        }
        self.journal_write(sector, data, n, repeat_same)
    }

    fn trim_sectors(&mut self, sector: u32, n: u32) -> Result<(), Error> {
        if !self.is_journaling() {
            return self.device.trim_sectors(sector, n);
        }
        self.journal_trim(sector, n)
    }

    fn sector_size(&self) -> u32 {
        self.device.sector_size()
    }

    fn num_sectors(&self) -> u32 {
        self.device.num_sectors()
    }

    fn sector_usage(&mut self, sector: u32) -> Result<SectorUsage, Error> {
        let idx = self.find_slot(sector);
        if idx != INDEX_INVALID {
            if self.slot_is_free(idx) {
                return Ok(SectorUsage::NotUsed);
            }
            return Ok(SectorUsage::InUse);
        }
        self.device.sector_usage(sector)
    }
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
    fn test_tags_are_sixteen_bytes() {
        assert_eq!(INFO_SECTOR_TAG.len(), 16);
        assert_eq!(STATUS_SECTOR_TAG.len(), 16);
        assert_eq!(&INFO_SECTOR_TAG[..12], b"Journal info");
        assert_eq!(&STATUS_SECTOR_TAG[..14], b"Journal status");
    }

    #[test]
    fn test_layout_entry_budget() {
        // 16 sectors of 512 bytes: status + info leave 14; every 32
        // entries of the copy list consume one sector.
        let bps = 512u32;
        let avail = 14u32;
        let mut entries = (avail * bps) / (bps + SIZEOF_ENTRY);
        while (entries * SIZEOF_ENTRY).div_ceil(bps) + entries > avail {
            entries -= 1;
        }
        assert_eq!(entries, 13);
        assert_eq!((entries * SIZEOF_ENTRY).div_ceil(bps), 1);
    }
}
