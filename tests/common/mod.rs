//! Simulated flash devices shared by the integration tests.
//!
//! All three simulators enforce flash program semantics (programming can
//! only clear bits) and support the failure modes the drivers must
//! survive: injected program/erase failures and power cuts. Power cuts
//! are modeled by recording every mutation; replaying a prefix of the
//! recording onto a snapshot reproduces the exact device state at an
//! arbitrary interruption point.

#![allow(dead_code)]

use libflash::storage::{Error, NandDeviceInfo, NandFlash, NorFlash, NorSectorInfo, SectorDevice, SectorUsage};

// ====================================================================
// RAM sector store (journal tests)
// ====================================================================

/// One recorded mutation of a [`SimDisk`].
#[derive(Debug, Clone)]
pub enum DiskOp {
    Write { sector: u32, data: Vec<u8> },
    Trim { sector: u32, n: u32 },
}

/// A RAM-backed logical-sector store used underneath the journal.
///
/// Mutations are recorded so tests can reconstruct the device state at
/// any intermediate point. `fail_writes_after` makes every write beyond
/// the given count fail without touching the memory, emulating a device
/// that died mid-transaction; `fail_reads` makes every read fail.
#[derive(Clone)]
pub struct SimDisk {
    mem: Vec<u8>,
    bps: u32,
    num_sectors: u32,
    pub ops: Vec<DiskOp>,
    pub fail_writes_after: Option<u32>,
    pub fail_reads: bool,
    writes_done: u32,
}

impl SimDisk {
    pub fn new(num_sectors: u32, bps: u32) -> SimDisk {
        SimDisk {
            mem: vec![0xFF; (num_sectors * bps) as usize],
            bps,
            num_sectors,
            ops: Vec::new(),
            fail_writes_after: None,
            fail_reads: false,
            writes_done: 0,
        }
    }

    /// A copy with empty recording, for use as a replay baseline.
    pub fn snapshot(&self) -> SimDisk {
        let mut copy = self.clone();
        copy.ops.clear();
        copy.writes_done = 0;
        copy.fail_writes_after = None;
        copy.fail_reads = false;
        copy
    }

    /// Applies the first `n` recorded mutations.
    pub fn replay(&mut self, ops: &[DiskOp], n: usize) {
        for op in &ops[..n] {
            match op {
                DiskOp::Write { sector, data } => {
                    let off = (*sector * self.bps) as usize;
                    self.mem[off..off + data.len()].copy_from_slice(data);
                }
                DiskOp::Trim { sector, n } => {
                    let off = (*sector * self.bps) as usize;
                    let len = (*n * self.bps) as usize;
                    self.mem[off..off + len].fill(0xFF);
                }
            }
        }
    }

    pub fn sector(&self, sector: u32) -> &[u8] {
        let off = (sector * self.bps) as usize;
        &self.mem[off..off + self.bps as usize]
    }
}

impl SectorDevice for SimDisk {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8], n: u32) -> Result<(), Error> {
        if self.fail_reads {
            return Err(Error::Io);
        }
        let off = (sector * self.bps) as usize;
        let len = (n * self.bps) as usize;
        buf[..len].copy_from_slice(&self.mem[off..off + len]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u32, data: &[u8], n: u32, repeat_same: bool)
    -> Result<(), Error> {
        let bps = self.bps as usize;
        for i in 0..n {
            if let Some(limit) = self.fail_writes_after {
                if self.writes_done >= limit {
                    return Err(Error::Io);
                }
            }
            self.writes_done += 1;
            let src = if repeat_same { 0 } else { i as usize * bps };
            let payload = data[src..src + bps].to_vec();
            let off = ((sector + i) * self.bps) as usize;
            self.mem[off..off + bps].copy_from_slice(&payload);
            self.ops.push(DiskOp::Write { sector: sector + i, data: payload });
        }
        Ok(())
    }

    fn trim_sectors(&mut self, sector: u32, n: u32) -> Result<(), Error> {
        let off = (sector * self.bps) as usize;
        let len = (n * self.bps) as usize;
        self.mem[off..off + len].fill(0xFF);
        self.ops.push(DiskOp::Trim { sector, n });
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        self.bps
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn sector_usage(&mut self, sector: u32) -> Result<SectorUsage, Error> {
        if self.sector(sector).iter().all(|&b| b == 0xFF) {
            Ok(SectorUsage::NotUsed)
        } else {
            Ok(SectorUsage::InUse)
        }
    }
}

// ====================================================================
// NAND simulator
// ====================================================================

/// A RAM-backed SLC NAND device.
///
/// Pages hold a data area and a spare area; programming ANDs the new
/// bits in. Failures are injected per block: a block listed in
/// `fail_program` rejects page programs, one in `fail_erase` rejects
/// erases, both leaving the contents unchanged. Setting
/// `fail_all_after` emulates a power cut: once the given number of
/// mutations completed, every further program and erase fails.
#[derive(Clone)]
pub struct SimNand {
    pub info: NandDeviceInfo,
    pub data: Vec<u8>,
    pub spare: Vec<u8>,
    pub fail_program: Vec<u32>,
    pub fail_erase: Vec<u32>,
    pub fail_all_after: Option<u32>,
    pub ops_done: u32,
    pub program_cnt: u32,
    pub erase_cnt: u32,
}

impl SimNand {
    pub fn new(num_blocks: u32, ppb_shift: u8, bpp_shift: u8) -> SimNand {
        let pages = num_blocks << ppb_shift;
        let bpp = 1u32 << bpp_shift;
        let spare = bpp >> 5;
        SimNand {
            info: NandDeviceInfo { num_blocks, ppb_shift, bpp_shift },
            data: vec![0xFF; (pages * bpp) as usize],
            spare: vec![0xFF; (pages * spare) as usize],
            fail_program: Vec::new(),
            fail_erase: Vec::new(),
            fail_all_after: None,
            ops_done: 0,
            program_cnt: 0,
            erase_cnt: 0,
        }
    }

    fn power_ok(&mut self) -> bool {
        if let Some(limit) = self.fail_all_after {
            if self.ops_done >= limit {
                return false;
            }
        }
        self.ops_done += 1;
        true
    }

    fn bpp(&self) -> u32 {
        self.info.bytes_per_page()
    }

    fn spare_size(&self) -> u32 {
        self.info.bytes_per_spare()
    }

    pub fn page_data(&mut self, page: u32) -> &mut [u8] {
        let bpp = self.bpp() as usize;
        &mut self.data[page as usize * bpp..(page as usize + 1) * bpp]
    }

    pub fn page_spare(&mut self, page: u32) -> &mut [u8] {
        let s = self.spare_size() as usize;
        &mut self.spare[page as usize * s..(page as usize + 1) * s]
    }

    fn block_of(&self, page: u32) -> u32 {
        page >> self.info.ppb_shift
    }
}

impl NandFlash for SimNand {
    fn device_info(&mut self) -> Result<NandDeviceInfo, Error> {
        Ok(self.info)
    }

    fn read_page(
        &mut self,
        page: u32,
        data: &mut [u8],
        data_off: u32,
        spare: &mut [u8],
        spare_off: u32,
    ) -> Result<(), Error> {
        let bpp = self.bpp() as usize;
        let ssz = self.spare_size() as usize;
        let d0 = page as usize * bpp + data_off as usize;
        data.copy_from_slice(&self.data[d0..d0 + data.len()]);
        let s0 = page as usize * ssz + spare_off as usize;
        spare.copy_from_slice(&self.spare[s0..s0 + spare.len()]);
        Ok(())
    }

    fn write_page(
        &mut self,
        page: u32,
        data: &[u8],
        data_off: u32,
        spare: &[u8],
        spare_off: u32,
    ) -> Result<(), Error> {
        if self.fail_program.contains(&self.block_of(page)) {
            return Err(Error::Io);
        }
        if !self.power_ok() {
            return Err(Error::Io);
        }
        self.program_cnt += 1;
        let bpp = self.bpp() as usize;
        let ssz = self.spare_size() as usize;
        let d0 = page as usize * bpp + data_off as usize;
        for (dst, &src) in self.data[d0..d0 + data.len()].iter_mut().zip(data) {
            *dst &= src;
        }
        let s0 = page as usize * ssz + spare_off as usize;
        for (dst, &src) in self.spare[s0..s0 + spare.len()].iter_mut().zip(spare) {
            *dst &= src;
        }
        Ok(())
    }

    fn erase_block(&mut self, first_page: u32) -> Result<(), Error> {
        let block = self.block_of(first_page);
        if self.fail_erase.contains(&block) {
            return Err(Error::Io);
        }
        if !self.power_ok() {
            return Err(Error::Io);
        }
        self.erase_cnt += 1;
        let bpp = self.bpp() as usize;
        let ssz = self.spare_size() as usize;
        let pages = 1usize << self.info.ppb_shift;
        let p0 = (block as usize) << self.info.ppb_shift;
        self.data[p0 * bpp..(p0 + pages) * bpp].fill(0xFF);
        self.spare[p0 * ssz..(p0 + pages) * ssz].fill(0xFF);
        Ok(())
    }
}

// ====================================================================
// NOR simulator
// ====================================================================

/// One recorded mutation of a [`SimNor`].
#[derive(Debug, Clone)]
pub enum NorOp {
    Program { off: u32, data: Vec<u8> },
    Erase { sector: u32 },
}

/// A RAM-backed NOR device with uniform erase units.
///
/// Programming ANDs bits in. Mutations are recorded for power-cut
/// replay; failures are injected per erase unit by listing the sector
/// in `fail_erase` (erases fail) or `fail_program` (programs fail),
/// both leaving the contents unchanged.
#[derive(Clone)]
pub struct SimNor {
    pub mem: Vec<u8>,
    sector_size: u32,
    num_sectors: u32,
    line_size: u32,
    can_rewrite: bool,
    write_protected: bool,
    pub ops: Vec<NorOp>,
    pub fail_erase: Vec<u32>,
    pub fail_program: Vec<u32>,
    pub erase_cnt: u32,
}

impl SimNor {
    pub fn new(num_sectors: u32, sector_size: u32) -> SimNor {
        SimNor {
            mem: vec![0xFF; (num_sectors * sector_size) as usize],
            sector_size,
            num_sectors,
            line_size: 1,
            can_rewrite: true,
            write_protected: false,
            ops: Vec::new(),
            fail_erase: Vec::new(),
            fail_program: Vec::new(),
            erase_cnt: 0,
        }
    }

    /// Configures write-once behavior with the given line size.
    pub fn write_once(mut self, line_size: u32) -> SimNor {
        self.line_size = line_size;
        self.can_rewrite = false;
        self
    }

    /// A copy with empty recording, for use as a replay baseline.
    pub fn snapshot(&self) -> SimNor {
        let mut copy = self.clone();
        copy.ops.clear();
        copy
    }

    /// Applies the first `n` recorded mutations.
    pub fn replay(&mut self, ops: &[NorOp], n: usize) {
        for op in &ops[..n] {
            match op {
                NorOp::Program { off, data } => {
                    for (i, &b) in data.iter().enumerate() {
                        self.mem[*off as usize + i] &= b;
                    }
                }
                NorOp::Erase { sector } => {
                    let off = (*sector * self.sector_size) as usize;
                    self.mem[off..off + self.sector_size as usize].fill(0xFF);
                }
            }
        }
    }
}

impl NorFlash for SimNor {
    fn read(&mut self, off: u32, buf: &mut [u8]) -> Result<(), Error> {
        buf.copy_from_slice(&self.mem[off as usize..off as usize + buf.len()]);
        Ok(())
    }

    fn program(&mut self, off: u32, data: &[u8]) -> Result<(), Error> {
        if self.fail_program.contains(&(off / self.sector_size)) {
            return Err(Error::Io);
        }
        for (i, &b) in data.iter().enumerate() {
            self.mem[off as usize + i] &= b;
        }
        self.ops.push(NorOp::Program { off, data: data.to_vec() });
        Ok(())
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), Error> {
        if self.fail_erase.contains(&sector) {
            return Err(Error::Io);
        }
        self.erase_cnt += 1;
        let off = (sector * self.sector_size) as usize;
        self.mem[off..off + self.sector_size as usize].fill(0xFF);
        self.ops.push(NorOp::Erase { sector });
        Ok(())
    }

    fn sector_info(&self, sector: u32) -> NorSectorInfo {
        NorSectorInfo {
            off: sector * self.sector_size,
            size: self.sector_size,
        }
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    fn line_size(&self) -> u32 {
        self.line_size
    }

    fn can_rewrite(&self) -> bool {
        self.can_rewrite
    }
}

// ====================================================================
// Payload helpers
// ====================================================================

/// A deterministic sector payload derived from a seed.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            (state >> 16) as u8
        })
        .collect()
}
